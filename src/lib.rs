//! # Apex Preprocessor
//!
//! Problem validation, elimination ordering and solver assembly for trust-region nonlinear
//! least squares, aimed at bundle adjustment and other problems with camera/point structure.
//!
//! ## Pipeline
//!
//! [`preprocess`] takes a [`Problem`] and [`SolverOptions`] and returns a
//! [`PreprocessedProblem`] holding a linear solver, a residual/Jacobian evaluator and an
//! optional inner-iteration minimizer that all agree on one column layout:
//!
//! - **Validation**: finite values, well-formed bounds, feasible constant blocks
//! - **Reduction**: constant residuals are folded into a fixed cost, unused blocks dropped
//! - **Ordering**: user orderings are checked, missing ones synthesized from the residual
//!   co-occurrence graph; Schur solvers fall back to a non-Schur family when nothing is
//!   left to eliminate
//! - **Assembly**: linear solver, evaluator and inner-iteration minimizer
//!
//! ## Linear Solvers
//!
//! - **Dense**: QR, normal Cholesky, Schur complement
//! - **Sparse** (feature `sparse`): normal Cholesky and Schur complement on faer
//! - **Iterative**: CGNR and Schur complement with preconditioned conjugate gradients

pub mod core;
pub mod error;
pub mod evaluator;
pub mod factors;
#[cfg(feature = "io")]
pub mod io;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod minimizer;
pub mod preprocessor;

// Re-export core types
pub use core::{
    ordering::ParameterBlockOrdering,
    problem::{ParameterBlockId, Problem, ResidualBlockId},
};
pub use error::{ApexError, ApexResult};

pub use evaluator::{Evaluation, Evaluator, EvaluatorOptions};
pub use factors::{BetweenFactor, Factor, PriorFactor, SnavelyReprojectionFactor};
pub use linalg::{JacobianMatrix, LinearSolver, LinearSolverOptions, LinearSolverType};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use minimizer::{InnerIterationMinimizer, MinimizerOptions};
pub use preprocessor::{
    PreprocessError, PreprocessedProblem, SolverOptions, TrustRegionPreprocessor, preprocess,
};
