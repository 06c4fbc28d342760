//! Prior factor for unary constraints on parameter blocks.

use super::{Factor, FactorError, FactorResult, Linearization};
use nalgebra::{DMatrix, DVector};

/// Prior factor (unary constraint) on a single parameter block.
///
/// The residual is the difference between the current value and the prior:
///
/// ```text
/// r = x - x_prior
/// ```
///
/// and the Jacobian is the identity.
///
/// # Example
///
/// ```
/// use apex_preprocessor::factors::{Factor, PriorFactor};
/// use nalgebra::dvector;
///
/// let prior = PriorFactor { data: dvector![1.0, 2.0] };
/// let (residual, jacobian) = prior.linearize(&[dvector![1.5, 2.3]], true).unwrap();
///
/// assert!((residual[0] - 0.5).abs() < 1e-10);
/// assert!((residual[1] - 0.3).abs() < 1e-10);
/// if let Some(jac) = jacobian {
///     assert_eq!(jac[(0, 0)], 1.0);
///     assert_eq!(jac[(1, 1)], 1.0);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct PriorFactor {
    /// The prior value
    pub data: DVector<f64>,
}

impl Factor for PriorFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> FactorResult<Linearization> {
        let value = params.first().ok_or(FactorError::InvalidDimension {
            expected: 1,
            actual: 0,
        })?;
        if value.len() != self.data.len() {
            return Err(FactorError::InvalidDimension {
                expected: self.data.len(),
                actual: value.len(),
            });
        }

        let residual = value - &self.data;
        let jacobian = compute_jacobian
            .then(|| DMatrix::<f64>::identity(residual.nrows(), residual.nrows()));
        Ok((residual, jacobian))
    }

    fn get_dimension(&self) -> usize {
        self.data.len()
    }

    fn parameter_block_sizes(&self) -> Option<Vec<usize>> {
        Some(vec![self.data.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_prior_residual_and_jacobian() -> FactorResult<()> {
        let prior = PriorFactor {
            data: dvector![1.0, -1.0],
        };
        let (residual, jacobian) = prior.linearize(&[dvector![2.0, 1.0]], true)?;
        assert_eq!(residual, dvector![1.0, 2.0]);
        assert_eq!(jacobian, Some(DMatrix::identity(2, 2)));
        Ok(())
    }

    #[test]
    fn test_prior_rejects_wrong_size() {
        let prior = PriorFactor {
            data: dvector![1.0, -1.0],
        };
        assert!(prior.linearize(&[dvector![2.0]], false).is_err());
        assert!(prior.linearize(&[], false).is_err());
    }
}
