//! Settings handed to the trust-region minimizer and the inner-iteration accelerator.
//!
//! The trust-region loop itself lives outside this crate; it consumes
//! [`MinimizerOptions`] together with the evaluator and linear solver of a
//! [`PreprocessedProblem`](crate::preprocessor::PreprocessedProblem).

pub mod inner_iteration;

pub use inner_iteration::{InnerIterationMinimizer, InnerIterationSummary};

/// Minimizer-level facts established during preprocessing.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizerOptions {
    /// Some active parameter block has a finite bound
    pub is_constrained: bool,
    /// Cost of the residuals folded away because all their parameters are constant
    pub fixed_cost: f64,
    /// An inner-iteration minimizer was built and should run after each successful step
    pub use_inner_iterations: bool,
    /// Stop inner iterations once the relative cost decrease of a sweep falls below this
    pub inner_iteration_tolerance: f64,
}

impl Default for MinimizerOptions {
    fn default() -> Self {
        Self {
            is_constrained: false,
            fixed_cost: 0.0,
            use_inner_iterations: false,
            inner_iteration_tolerance: 1e-3,
        }
    }
}
