//! Bounds and value validation.
//!
//! Runs on every parameter block of the problem, used or not, before any structural work.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{
    parameter_block::ParameterBlock,
    problem::{ParameterBlockId, Problem},
};
use crate::preprocessor::{PreprocessError, PreprocessResult};

/// Check every parameter block; the first failing block in problem order is reported.
pub fn validate_bounds(problem: &Problem) -> PreprocessResult<()> {
    let blocks: Vec<(ParameterBlockId, &ParameterBlock)> = problem.parameter_blocks().collect();

    #[cfg(feature = "parallel")]
    let first_error = blocks
        .par_iter()
        .map(|&(id, block)| validate_block(id, block))
        .find_first(Result::is_err);

    #[cfg(not(feature = "parallel"))]
    let first_error = blocks
        .iter()
        .map(|&(id, block)| validate_block(id, block))
        .find(Result::is_err);

    match first_error {
        Some(Err(e)) => Err(e.log()),
        _ => Ok(()),
    }
}

fn validate_block(id: ParameterBlockId, block: &ParameterBlock) -> PreprocessResult<()> {
    if let Some(i) = block.first_inverted_bound() {
        return Err(PreprocessError::InvalidBounds(format!(
            "{id}[{i}]: lower bound {} exceeds upper bound {}",
            block.lower_bounds()[i],
            block.upper_bounds()[i]
        )));
    }
    if let Some(i) = block.first_non_finite_value() {
        return Err(PreprocessError::InvalidValue(format!(
            "{id}[{i}] = {} is not finite",
            block.values()[i]
        )));
    }
    if block.is_constant() {
        if let Some(i) = block.first_out_of_bounds_value() {
            return Err(PreprocessError::InvalidBounds(format!(
                "constant block {id} is infeasible: value {} at index {i} lies outside [{}, {}]",
                block.values()[i],
                block.lower_bounds()[i],
                block.upper_bounds()[i]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_unbounded_problem_is_valid() {
        let mut problem = Problem::new();
        problem.add_parameter_block(dvector![1.0, -2.0]);
        assert!(validate_bounds(&problem).is_ok());
    }

    #[test]
    fn test_inverted_bounds_on_unused_block() -> TestResult {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(dvector![1.0]);
        problem.set_parameter_upper_bound(x, 0, 1.0)?;
        problem.set_parameter_lower_bound(x, 0, 2.0)?;
        assert!(matches!(
            validate_bounds(&problem),
            Err(PreprocessError::InvalidBounds(_))
        ));
        Ok(())
    }

    #[test]
    fn test_non_finite_values() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut problem = Problem::new();
            problem.add_parameter_block(dvector![0.0, bad]);
            assert!(matches!(
                validate_bounds(&problem),
                Err(PreprocessError::InvalidValue(_))
            ));
        }
    }

    #[test]
    fn test_infeasible_constant_block() -> TestResult {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(dvector![3.0]);
        problem.set_parameter_upper_bound(x, 0, 2.0)?;
        assert!(validate_bounds(&problem).is_ok());

        problem.set_parameter_block_constant(x)?;
        assert!(matches!(
            validate_bounds(&problem),
            Err(PreprocessError::InvalidBounds(_))
        ));
        Ok(())
    }

    #[test]
    fn test_first_failing_block_is_reported() -> TestResult {
        let mut problem = Problem::new();
        problem.add_parameter_block(dvector![f64::NAN]);
        let y = problem.add_parameter_block(dvector![0.0]);
        problem.set_parameter_lower_bound(y, 0, 1.0)?;
        problem.set_parameter_upper_bound(y, 0, 0.0)?;
        assert!(matches!(
            validate_bounds(&problem),
            Err(PreprocessError::InvalidValue(_))
        ));
        Ok(())
    }
}
