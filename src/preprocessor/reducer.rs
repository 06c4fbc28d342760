//! Constancy classification and constant-residual folding.
//!
//! A residual block whose parameters are all constant contributes a fixed amount to the
//! cost. It is evaluated once here, its cost is accumulated into `fixed_cost`, and it is
//! dropped from the program. Active blocks that no remaining residual touches are dropped
//! as well.

use std::collections::BTreeSet;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::debug;

use crate::core::problem::{ParameterBlockId, Problem, ResidualBlockId};
use crate::preprocessor::{PreprocessError, PreprocessResult};

/// The part of a problem left for the minimizer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReducedProgram {
    /// Non-constant blocks referenced by at least one active residual, in problem order
    pub parameter_blocks: Vec<ParameterBlockId>,
    /// Residual blocks with at least one non-constant parameter, in problem order
    pub residual_blocks: Vec<ResidualBlockId>,
    pub constant_parameter_blocks: Vec<ParameterBlockId>,
    /// Non-constant blocks that no active residual references
    pub unused_parameter_blocks: Vec<ParameterBlockId>,
    pub num_removed_residual_blocks: usize,
    /// `0.5 * ||r||²` summed over the folded residuals
    pub fixed_cost: f64,
    /// Some active block has a finite bound
    pub is_constrained: bool,
}

impl ReducedProgram {
    /// Nothing is left to optimize.
    pub fn is_empty(&self) -> bool {
        self.parameter_blocks.is_empty() && self.residual_blocks.is_empty()
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    pub fn is_active(&self, id: ParameterBlockId) -> bool {
        self.parameter_blocks.binary_search(&id).is_ok()
    }

    /// Scalar parameter count of the active blocks.
    pub fn num_parameters(&self, problem: &Problem) -> usize {
        self.parameter_blocks
            .iter()
            .filter_map(|&id| problem.parameter_block(id).ok())
            .map(|block| block.size())
            .sum()
    }
}

/// Split `problem` into active and constant parts.
///
/// # Errors
/// `PreprocessError::Evaluation` if a constant-only residual cannot be evaluated.
pub fn reduce(problem: &Problem) -> PreprocessResult<ReducedProgram> {
    let constant: BTreeSet<ParameterBlockId> = problem
        .parameter_blocks()
        .filter(|(_, block)| block.is_constant())
        .map(|(id, _)| id)
        .collect();

    let (folded, residual_blocks): (Vec<ResidualBlockId>, Vec<ResidualBlockId>) = problem
        .residual_blocks()
        .map(|(id, _)| id)
        .partition(|&id| {
            problem.residual_block(id).is_ok_and(|residual| {
                residual
                    .parameter_blocks()
                    .iter()
                    .all(|block| constant.contains(block))
            })
        });

    let fixed_cost = fold_constant_residuals(problem, &folded)?;

    let used: BTreeSet<ParameterBlockId> = residual_blocks
        .iter()
        .filter_map(|&id| problem.residual_block(id).ok())
        .flat_map(|residual| residual.distinct_parameter_blocks())
        .collect();

    let mut program = ReducedProgram {
        constant_parameter_blocks: constant.iter().copied().collect(),
        residual_blocks,
        num_removed_residual_blocks: folded.len(),
        fixed_cost,
        ..Default::default()
    };
    for (id, block) in problem.parameter_blocks() {
        if constant.contains(&id) {
            continue;
        }
        if used.contains(&id) {
            program.is_constrained |= block.has_finite_bounds();
            program.parameter_blocks.push(id);
        } else {
            program.unused_parameter_blocks.push(id);
        }
    }

    debug!(
        "Reduced program: parameter blocks {}/{}/{} (active/constant/unused), \
         residual blocks {}/{} (active/folded), fixed cost {:.6e}",
        program.parameter_blocks.len(),
        program.constant_parameter_blocks.len(),
        program.unused_parameter_blocks.len(),
        program.residual_blocks.len(),
        program.num_removed_residual_blocks,
        program.fixed_cost
    );
    Ok(program)
}

/// Evaluate every residual in `residuals` once and sum their costs in order.
fn fold_constant_residuals(
    problem: &Problem,
    residuals: &[ResidualBlockId],
) -> PreprocessResult<f64> {
    #[cfg(feature = "parallel")]
    let costs: PreprocessResult<Vec<f64>> = residuals
        .par_iter()
        .map(|&id| constant_residual_cost(problem, id))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let costs: PreprocessResult<Vec<f64>> = residuals
        .iter()
        .map(|&id| constant_residual_cost(problem, id))
        .collect();

    Ok(costs?.into_iter().sum())
}

fn constant_residual_cost(problem: &Problem, id: ResidualBlockId) -> PreprocessResult<f64> {
    let residual = problem.residual_block(id).map_err(|e| {
        PreprocessError::Evaluation(format!("residual block {id} is not in the problem"))
            .log_with_source(e)
    })?;
    let values = problem.gather_values(residual);
    let r = residual.evaluate_residual(&values).map_err(|e| {
        PreprocessError::Evaluation(format!(
            "residual block {id} depends only on constant parameters and failed to evaluate: {e}"
        ))
        .log()
    })?;
    Ok(0.5 * r.norm_squared())
}
