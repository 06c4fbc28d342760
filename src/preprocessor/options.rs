//! Solver options consumed by the preprocessor.

use crate::core::ordering::ParameterBlockOrdering;
use crate::linalg::LinearSolverType;
use crate::preprocessor::{PreprocessError, PreprocessResult};

/// Configuration for preprocessing a problem for the trust-region minimizer.
///
/// # Example
///
/// ```
/// use apex_preprocessor::linalg::LinearSolverType;
/// use apex_preprocessor::preprocessor::SolverOptions;
///
/// let options = SolverOptions::new()
///     .with_linear_solver_type(LinearSolverType::SparseSchur)
///     .with_inner_iterations(true)
///     .with_num_threads(4);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    /// Linear solver family for the trust-region step
    pub linear_solver_type: LinearSolverType,
    /// Elimination ordering; synthesized when `None`
    ///
    /// Schur families eliminate group 0, which must be an independent set. Other families
    /// use the groups as the column order.
    pub linear_solver_ordering: Option<ParameterBlockOrdering>,
    /// Run block-coordinate descent between trust-region steps
    pub use_inner_iterations: bool,
    /// Inner-iteration ordering; synthesized when `None`. Every group must be independent.
    pub inner_iteration_ordering: Option<ParameterBlockOrdering>,
    /// Relative cost decrease below which inner iterations stop
    ///
    /// Default: 1e-3
    pub inner_iteration_tolerance: f64,
    /// Minimum iterations of the iterative linear solvers
    pub min_linear_solver_iterations: usize,
    /// Maximum iterations of the iterative linear solvers
    ///
    /// Default: 500
    pub max_linear_solver_iterations: usize,
    /// Threads used for evaluation and linear algebra
    pub num_threads: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            linear_solver_ordering: None,
            use_inner_iterations: false,
            inner_iteration_ordering: None,
            inner_iteration_tolerance: 1e-3,
            min_linear_solver_iterations: 0,
            max_linear_solver_iterations: 500,
            num_threads: 1,
        }
    }
}

impl SolverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_linear_solver_ordering(mut self, ordering: ParameterBlockOrdering) -> Self {
        self.linear_solver_ordering = Some(ordering);
        self
    }

    pub fn with_inner_iterations(mut self, use_inner_iterations: bool) -> Self {
        self.use_inner_iterations = use_inner_iterations;
        self
    }

    pub fn with_inner_iteration_ordering(mut self, ordering: ParameterBlockOrdering) -> Self {
        self.inner_iteration_ordering = Some(ordering);
        self
    }

    pub fn with_inner_iteration_tolerance(mut self, tolerance: f64) -> Self {
        self.inner_iteration_tolerance = tolerance;
        self
    }

    pub fn with_linear_solver_iterations(mut self, min: usize, max: usize) -> Self {
        self.min_linear_solver_iterations = min;
        self.max_linear_solver_iterations = max;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Reject option values that no problem could satisfy.
    pub fn validate(&self) -> PreprocessResult<()> {
        if self.inner_iteration_tolerance.is_nan() || self.inner_iteration_tolerance < 0.0 {
            return Err(PreprocessError::InvalidOptions(format!(
                "inner_iteration_tolerance must be non-negative, got {}",
                self.inner_iteration_tolerance
            ))
            .log());
        }
        if self.max_linear_solver_iterations == 0 {
            return Err(PreprocessError::InvalidOptions(
                "max_linear_solver_iterations must be at least 1".to_string(),
            )
            .log());
        }
        if self.min_linear_solver_iterations > self.max_linear_solver_iterations {
            return Err(PreprocessError::InvalidOptions(format!(
                "min_linear_solver_iterations ({}) exceeds max_linear_solver_iterations ({})",
                self.min_linear_solver_iterations, self.max_linear_solver_iterations
            ))
            .log());
        }
        if self.num_threads == 0 {
            return Err(
                PreprocessError::InvalidOptions("num_threads must be at least 1".to_string()).log(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = SolverOptions::default();
        assert_eq!(options.linear_solver_type, LinearSolverType::DenseQr);
        assert!(options.linear_solver_ordering.is_none());
        assert!(!options.use_inner_iterations);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            SolverOptions::new().with_inner_iteration_tolerance(-1.0),
            SolverOptions::new().with_inner_iteration_tolerance(f64::NAN),
            SolverOptions::new().with_linear_solver_iterations(0, 0),
            SolverOptions::new().with_linear_solver_iterations(10, 5),
            SolverOptions::new().with_num_threads(0),
        ];
        for options in cases {
            assert!(matches!(
                options.validate(),
                Err(PreprocessError::InvalidOptions(_))
            ));
        }
    }
}
