//! Factors (cost functions) attached to residual blocks.
//!
//! A factor computes the residual vector `r(x)` of one residual block and, on request, the
//! Jacobian `J = ∂r/∂x` with respect to every parameter block it depends on. The Jacobian is
//! laid out as the horizontal concatenation of one column block per connected parameter
//! block, in the order the blocks were passed to
//! [`Problem::add_residual_block`](crate::core::problem::Problem::add_residual_block).
//!
//! Unlike a plain residual function, `linearize` is fallible: a factor that cannot produce a
//! value at the given parameters (for example a projection behind the camera) reports a
//! [`FactorError`], which the preprocessor turns into an evaluation failure.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

pub mod between_factor;
pub mod prior_factor;
pub mod reprojection_factor;

pub use between_factor::BetweenFactor;
pub use prior_factor::PriorFactor;
pub use reprojection_factor::SnavelyReprojectionFactor;

/// Factor-specific error types
#[derive(Debug, Clone, Error)]
pub enum FactorError {
    /// Invalid dimension mismatch between expected and actual
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    /// Invalid projection (point behind camera or outside valid range)
    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    /// The factor cannot be evaluated at the given parameters
    #[error("Evaluation failed: {0}")]
    EvaluationFailed(String),

    /// Numerical instability detected
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
}

impl FactorError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error for debugging context
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for factor operations
pub type FactorResult<T> = Result<T, FactorError>;

/// Output of [`Factor::linearize`]: the residual and, when requested, the Jacobian.
pub type Linearization = (DVector<f64>, Option<DMatrix<f64>>);

/// Trait for cost functions evaluated by residual blocks.
///
/// # Thread Safety
///
/// Factors must be `Send + Sync` so that residual blocks can be evaluated in parallel.
///
/// # Example
///
/// ```
/// use apex_preprocessor::factors::{Factor, FactorError, FactorResult, Linearization};
/// use nalgebra::{DMatrix, DVector};
///
/// // 1D range measurement from the origin to a 2D point
/// struct RangeFactor {
///     measurement: f64,
/// }
///
/// impl Factor for RangeFactor {
///     fn linearize(
///         &self,
///         params: &[DVector<f64>],
///         compute_jacobian: bool,
///     ) -> FactorResult<Linearization> {
///         let x = params[0][0];
///         let y = params[0][1];
///         let distance = (x * x + y * y).sqrt();
///         if distance == 0.0 {
///             return Err(FactorError::EvaluationFailed("range undefined at the origin".into()));
///         }
///
///         let residual = DVector::from_vec(vec![self.measurement - distance]);
///         let jacobian = compute_jacobian
///             .then(|| DMatrix::from_row_slice(1, 2, &[-x / distance, -y / distance]));
///         Ok((residual, jacobian))
///     }
///
///     fn get_dimension(&self) -> usize { 1 }
/// }
/// ```
pub trait Factor: Send + Sync {
    /// Compute the residual and, if `compute_jacobian` is set, the Jacobian.
    ///
    /// # Arguments
    ///
    /// * `params` - One value vector per connected parameter block, in connection order
    /// * `compute_jacobian` - Whether to compute the Jacobian matrix
    ///
    /// # Returns
    ///
    /// `(residual, jacobian)` where the residual has `get_dimension()` entries and the
    /// Jacobian is `get_dimension() × Σ sizes`.
    fn linearize(&self, params: &[DVector<f64>], compute_jacobian: bool)
    -> FactorResult<Linearization>;

    /// Number of entries in the residual vector.
    fn get_dimension(&self) -> usize;

    /// Expected sizes of the connected parameter blocks, if the factor is sized.
    ///
    /// When this returns `Some`, the problem rejects residual blocks whose parameter blocks
    /// do not match.
    fn parameter_block_sizes(&self) -> Option<Vec<usize>> {
        None
    }
}
