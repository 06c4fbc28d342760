//! Residual blocks connect a factor to the parameter blocks it depends on.
//!
//! A `ResidualBlock` is one term of the objective:
//!
//! ```text
//! ½ ||r_i(x_{i1}, ..., x_{ik})||²
//! ```
//!
//! It stores the factor that computes `r_i` and the ordered list of
//! [`ParameterBlockId`](crate::core::problem::ParameterBlockId)s it reads. The same parameter
//! block may appear more than once in the list; the structural analysis in the preprocessor
//! works on the *set* of distinct blocks, while evaluation passes one value vector per
//! occurrence.
//!
//! Residual blocks never own parameter data. They are evaluated against values looked up by
//! the caller, which lets the evaluator substitute a trial state for the active blocks while
//! reading constant blocks straight from the problem.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};

use crate::core::problem::ParameterBlockId;
use crate::factors::{Factor, FactorError, FactorResult};

/// A factor plus the parameter blocks it is attached to.
pub struct ResidualBlock {
    /// Parameter blocks read by the factor, in the order the factor expects them
    parameter_blocks: Vec<ParameterBlockId>,

    /// The factor that computes residuals and Jacobians
    factor: Box<dyn Factor + Send>,
}

impl ResidualBlock {
    pub fn new(parameter_blocks: Vec<ParameterBlockId>, factor: Box<dyn Factor + Send>) -> Self {
        Self {
            parameter_blocks,
            factor,
        }
    }

    /// Parameter blocks in connection order (duplicates preserved).
    pub fn parameter_blocks(&self) -> &[ParameterBlockId] {
        &self.parameter_blocks
    }

    /// Distinct parameter blocks referenced by this residual.
    pub fn distinct_parameter_blocks(&self) -> BTreeSet<ParameterBlockId> {
        self.parameter_blocks.iter().copied().collect()
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    /// Dimension of the residual vector.
    pub fn num_residuals(&self) -> usize {
        self.factor.get_dimension()
    }

    pub fn factor(&self) -> &dyn Factor {
        self.factor.as_ref()
    }

    /// Evaluate the residual only.
    ///
    /// `values` holds one vector per entry of [`parameter_blocks`](Self::parameter_blocks).
    /// The result is checked for dimension and finiteness, so callers can rely on a valid
    /// residual when this returns `Ok`.
    pub fn evaluate_residual(&self, values: &[DVector<f64>]) -> FactorResult<DVector<f64>> {
        let (residual, _) = self.factor.linearize(values, false)?;
        self.check_residual(&residual)?;
        Ok(residual)
    }

    /// Evaluate the residual and the Jacobian with respect to every connected block.
    ///
    /// The Jacobian has one column block per entry of `values`, concatenated horizontally.
    pub fn evaluate_with_jacobian(
        &self,
        values: &[DVector<f64>],
    ) -> FactorResult<(DVector<f64>, DMatrix<f64>)> {
        let (residual, jacobian) = self.factor.linearize(values, true)?;
        self.check_residual(&residual)?;

        let jacobian = jacobian.ok_or_else(|| {
            FactorError::EvaluationFailed(
                "factor returned no Jacobian when one was requested".to_string(),
            )
        })?;

        let expected_cols: usize = values.iter().map(|v| v.len()).sum();
        if jacobian.nrows() != residual.len() || jacobian.ncols() != expected_cols {
            return Err(FactorError::InvalidDimension {
                expected: residual.len() * expected_cols,
                actual: jacobian.nrows() * jacobian.ncols(),
            });
        }
        if !jacobian.iter().all(|v| v.is_finite()) {
            return Err(FactorError::NumericalInstability(
                "non-finite entry in Jacobian".to_string(),
            ));
        }
        Ok((residual, jacobian))
    }

    fn check_residual(&self, residual: &DVector<f64>) -> FactorResult<()> {
        if residual.len() != self.num_residuals() {
            return Err(FactorError::InvalidDimension {
                expected: self.num_residuals(),
                actual: residual.len(),
            });
        }
        if !residual.iter().all(|v| v.is_finite()) {
            return Err(FactorError::NumericalInstability(
                "non-finite entry in residual".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{BetweenFactor, Linearization};
    use nalgebra::dvector;

    struct NanFactor;

    impl Factor for NanFactor {
        fn linearize(&self, _params: &[DVector<f64>], _jac: bool) -> FactorResult<Linearization> {
            Ok((dvector![f64::NAN], None))
        }

        fn get_dimension(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_distinct_blocks_collapse_duplicates() {
        let block = ResidualBlock::new(
            vec![ParameterBlockId(3), ParameterBlockId(3)],
            Box::new(BetweenFactor::new(dvector![0.0])),
        );
        assert_eq!(block.num_parameter_blocks(), 2);
        assert_eq!(block.distinct_parameter_blocks().len(), 1);
    }

    #[test]
    fn test_evaluate_with_jacobian_shape() -> FactorResult<()> {
        let block = ResidualBlock::new(
            vec![ParameterBlockId(0), ParameterBlockId(1)],
            Box::new(BetweenFactor::new(dvector![1.0, 1.0])),
        );
        let (residual, jacobian) =
            block.evaluate_with_jacobian(&[dvector![0.0, 0.0], dvector![1.0, 2.0]])?;
        assert_eq!(residual, dvector![0.0, 1.0]);
        assert_eq!((jacobian.nrows(), jacobian.ncols()), (2, 4));
        Ok(())
    }

    #[test]
    fn test_non_finite_residual_is_rejected() {
        let block = ResidualBlock::new(vec![ParameterBlockId(0)], Box::new(NanFactor));
        assert!(matches!(
            block.evaluate_residual(&[dvector![0.0]]),
            Err(FactorError::NumericalInstability(_))
        ));
    }
}
