use super::{Factor, FactorError, FactorResult, Linearization};
use nalgebra::{DMatrix, DVector};

/// Euclidean between factor for relative measurements.
///
/// Represents a measured offset between two parameter blocks of the same size.
///
/// # Mathematical Formulation
///
/// Given blocks `x_i`, `x_j` and a measured offset `z_ij`, the residual is:
///
/// ```text
/// r = (x_j - x_i) - z_ij
/// ```
///
/// The Jacobian is `[-I | I]`, of size `n × 2n`.
///
/// # Use Cases
///
/// - Chains of relative constraints (odometry in Rⁿ, smoothing priors)
/// - Coupling two blocks so they share a residual, which is what makes them
///   co-occur in the residual graph
///
/// # Example
///
/// ```
/// use apex_preprocessor::factors::{BetweenFactor, Factor};
/// use nalgebra::dvector;
///
/// let factor = BetweenFactor::new(dvector![1.0]);
/// let (residual, jacobian) = factor
///     .linearize(&[dvector![0.0], dvector![1.5]], true)
///     .unwrap();
///
/// assert!((residual[0] - 0.5).abs() < 1e-12);
/// let jac = jacobian.unwrap();
/// assert_eq!(jac[(0, 0)], -1.0);
/// assert_eq!(jac[(0, 1)], 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct BetweenFactor {
    /// The measured offset `x_j - x_i`
    pub relative_measurement: DVector<f64>,
}

impl BetweenFactor {
    pub fn new(relative_measurement: DVector<f64>) -> Self {
        Self {
            relative_measurement,
        }
    }
}

impl Factor for BetweenFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> FactorResult<Linearization> {
        let n = self.relative_measurement.len();
        if params.len() != 2 {
            return Err(FactorError::InvalidDimension {
                expected: 2,
                actual: params.len(),
            });
        }
        for p in params {
            if p.len() != n {
                return Err(FactorError::InvalidDimension {
                    expected: n,
                    actual: p.len(),
                });
            }
        }

        let residual = &params[1] - &params[0] - &self.relative_measurement;
        let jacobian = compute_jacobian.then(|| {
            let mut jac = DMatrix::<f64>::zeros(n, 2 * n);
            for i in 0..n {
                jac[(i, i)] = -1.0;
                jac[(i, n + i)] = 1.0;
            }
            jac
        });
        Ok((residual, jacobian))
    }

    fn get_dimension(&self) -> usize {
        self.relative_measurement.len()
    }

    fn parameter_block_sizes(&self) -> Option<Vec<usize>> {
        let n = self.relative_measurement.len();
        Some(vec![n, n])
    }
}
