//! Trust-region preprocessing pipeline.
//!
//! Turns a [`Problem`] and a set of [`SolverOptions`] into a [`PreprocessedProblem`]: a
//! linear solver, an evaluator and an optional inner-iteration minimizer whose layouts
//! agree with each other. Stages run in order and the first failure aborts:
//!
//! 1. option validation
//! 2. bounds and value validation ([`bounds`])
//! 3. constant folding and unused-block removal ([`reducer`])
//! 4. elimination ordering and Schur downgrade ([`elimination`])
//! 5. linear solver selection ([`linear_solver`])
//! 6. evaluator construction ([`evaluator_builder`])
//! 7. inner-iteration planning ([`inner_iteration`])
//!
//! A problem with nothing left to optimize after step 3 succeeds immediately with no
//! solver, evaluator or inner-iteration minimizer.
//!
//! One [`WorkerPool`] of `num_threads` workers is started after step 1. Steps 2 and 3 run
//! on it, and the linear solver and evaluator keep it for later solves and evaluations.

use std::fmt::{self, Display, Formatter};

use thiserror::Error;
use tracing::{debug, error, info};
use web_time::{Duration, Instant};

use crate::core::{problem::Problem, worker_pool::WorkerPool};
use crate::error::ApexResult;
use crate::evaluator::{Evaluator, EvaluatorOptions};
use crate::linalg::{LinearSolver, LinearSolverOptions};
use crate::minimizer::{InnerIterationMinimizer, MinimizerOptions};

pub mod bounds;
pub mod elimination;
pub mod evaluator_builder;
pub mod inner_iteration;
pub mod linear_solver;
pub mod options;
pub mod reducer;

pub use bounds::validate_bounds;
pub use elimination::{EliminationPlan, build_elimination_plan, validate_ordering_coverage};
pub use evaluator_builder::{build_evaluator, build_evaluator_options};
pub use inner_iteration::plan_inner_iterations;
pub use linear_solver::{build_linear_solver_options, select_linear_solver};
pub use options::SolverOptions;
pub use reducer::{ReducedProgram, reduce};

/// Preprocessing error types
#[derive(Debug, Clone, Error)]
pub enum PreprocessError {
    /// A parameter value is NaN or infinite
    #[error("Invalid parameter value: {0}")]
    InvalidValue(String),

    /// Inverted bounds, or a constant block outside its bounds
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    /// An ordering does not cover the problem or violates the solver's structural rules
    #[error("Invalid ordering: {0}")]
    InvalidOrdering(String),

    /// A residual depending only on constant blocks could not be evaluated
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// The evaluator could not be built for the chosen layout
    #[error("Evaluator construction failed: {0}")]
    EvaluatorConstruction(String),

    /// The requested linear solver is not available in this build
    #[error("Unsupported linear solver: {0}")]
    UnsupportedSolver(String),

    /// Option values that no problem could satisfy
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

impl PreprocessError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying error that caused it
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for preprocessing operations
pub type PreprocessResult<T> = Result<T, PreprocessError>;

/// Everything the trust-region minimizer needs, assembled for one problem.
///
/// Borrows the problem it was built from; the problem cannot be modified while this is
/// alive.
pub struct PreprocessedProblem<'a> {
    /// Effective options: the linear solver type after a possible downgrade and the final
    /// orderings over the active blocks
    pub options: SolverOptions,
    pub linear_solver_options: LinearSolverOptions,
    pub evaluator_options: EvaluatorOptions,
    pub minimizer_options: MinimizerOptions,
    /// `None` only for trivial problems
    pub linear_solver: Option<Box<dyn LinearSolver>>,
    /// `None` only for trivial problems
    pub evaluator: Option<Evaluator<'a>>,
    pub inner_iteration_minimizer: Option<InnerIterationMinimizer>,
    pub reduced_program: ReducedProgram,
    pub fixed_cost: f64,
    pub preprocessor_time: Duration,
}

impl PreprocessedProblem<'_> {
    /// No active parameter or residual block remains.
    pub fn is_trivial(&self) -> bool {
        self.reduced_program.is_empty()
    }
}

impl fmt::Debug for PreprocessedProblem<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreprocessedProblem")
            .field("options", &self.options)
            .field("linear_solver_options", &self.linear_solver_options)
            .field("evaluator_options", &self.evaluator_options)
            .field("minimizer_options", &self.minimizer_options)
            .field(
                "linear_solver",
                &self.linear_solver.as_ref().map(|s| s.solver_type()),
            )
            .field("has_evaluator", &self.evaluator.is_some())
            .field("inner_iteration_minimizer", &self.inner_iteration_minimizer)
            .field("reduced_program", &self.reduced_program)
            .field("fixed_cost", &self.fixed_cost)
            .field("preprocessor_time", &self.preprocessor_time)
            .finish()
    }
}

impl Display for PreprocessedProblem<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let program = &self.reduced_program;
        writeln!(f, "Preprocessing Result")?;
        if self.is_trivial() {
            writeln!(f, "TRIVIAL (nothing left to optimize)")?;
        }
        writeln!(f)?;
        writeln!(f, "Parameter blocks:")?;
        writeln!(f, "  Active:    {}", program.parameter_blocks.len())?;
        writeln!(f, "  Constant:  {}", program.constant_parameter_blocks.len())?;
        writeln!(f, "  Unused:    {}", program.unused_parameter_blocks.len())?;
        writeln!(f, "Residual blocks:")?;
        writeln!(f, "  Active:    {}", program.residual_blocks.len())?;
        writeln!(f, "  Folded:    {}", program.num_removed_residual_blocks)?;
        writeln!(f, "  Fixed cost: {:.6e}", self.fixed_cost)?;
        writeln!(f)?;
        writeln!(f, "Linear solver:   {}", self.linear_solver_options.solver_type)?;
        writeln!(
            f,
            "  Groups:        {:?}",
            self.linear_solver_options.elimination_groups
        )?;
        writeln!(
            f,
            "  Eliminated:    {} blocks",
            self.linear_solver_options.num_eliminate_blocks()
        )?;
        if let Some(evaluator) = &self.evaluator {
            writeln!(
                f,
                "Jacobian:        {} x {} ({})",
                evaluator.num_residuals(),
                evaluator.num_parameters(),
                if evaluator.is_sparse() { "sparse" } else { "dense" }
            )?;
        }
        match &self.inner_iteration_minimizer {
            Some(minimizer) => writeln!(
                f,
                "Inner iterations: {} groups over {} blocks",
                minimizer.num_groups(),
                minimizer.num_blocks()
            )?,
            None => writeln!(f, "Inner iterations: off")?,
        }
        let bounds = if self.minimizer_options.is_constrained {
            "yes"
        } else {
            "no"
        };
        writeln!(f, "Bounds:          {bounds}")?;
        write!(f, "Time:            {:.3} ms", self.preprocessor_time.as_secs_f64() * 1e3)
    }
}

/// Preprocessor for trust-region minimization.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustRegionPreprocessor;

impl TrustRegionPreprocessor {
    pub fn new() -> Self {
        Self
    }

    /// Run the full pipeline.
    ///
    /// # Errors
    /// The first failing stage's error; no partial result is returned.
    pub fn preprocess<'a>(
        &self,
        options: &SolverOptions,
        problem: &'a Problem,
    ) -> ApexResult<PreprocessedProblem<'a>> {
        let start = Instant::now();

        options.validate()?;
        let pool = WorkerPool::new(options.num_threads)?;
        pool.install(|| validate_bounds(problem))?;
        let program = pool.install(|| reduce(problem))?;

        let mut effective = options.clone();
        let mut minimizer_options = MinimizerOptions {
            is_constrained: program.is_constrained,
            fixed_cost: program.fixed_cost,
            use_inner_iterations: false,
            inner_iteration_tolerance: options.inner_iteration_tolerance,
        };

        if program.is_empty() {
            effective.use_inner_iterations = false;
            let linear_solver_options = LinearSolverOptions {
                solver_type: effective.linear_solver_type,
                min_num_iterations: effective.min_linear_solver_iterations,
                max_num_iterations: effective.max_linear_solver_iterations,
                num_threads: effective.num_threads,
                ..Default::default()
            };
            let evaluator_options = EvaluatorOptions {
                linear_solver_type: effective.linear_solver_type,
                num_eliminate_blocks: 0,
                num_threads: effective.num_threads,
            };
            info!(
                "Problem is trivial: {} constant parameter blocks, fixed cost {:.6e}",
                program.constant_parameter_blocks.len(),
                program.fixed_cost
            );
            let fixed_cost = program.fixed_cost;
            return Ok(PreprocessedProblem {
                options: effective,
                linear_solver_options,
                evaluator_options,
                minimizer_options,
                linear_solver: None,
                evaluator: None,
                inner_iteration_minimizer: None,
                reduced_program: program,
                fixed_cost,
                preprocessor_time: start.elapsed(),
            });
        }

        let plan = build_elimination_plan(&effective, problem, &program)?;
        effective.linear_solver_type = plan.linear_solver_type;
        effective.linear_solver_ordering = Some(plan.ordering.clone());

        let linear_solver_options = build_linear_solver_options(&effective, &plan, problem);
        let linear_solver = select_linear_solver(&linear_solver_options, &pool)?;

        let evaluator_options = build_evaluator_options(&effective, &plan);
        let evaluator =
            build_evaluator(problem, &plan, &program, evaluator_options.clone(), &pool)?;

        let inner_iteration_minimizer = plan_inner_iterations(&effective, problem, &program)?;
        effective.use_inner_iterations = inner_iteration_minimizer.is_some();
        if let Some(minimizer) = &inner_iteration_minimizer {
            effective.inner_iteration_ordering = Some(minimizer.ordering().clone());
        }
        minimizer_options.use_inner_iterations = effective.use_inner_iterations;
        debug!("Minimizer options: {:?}", minimizer_options);

        let fixed_cost = program.fixed_cost;
        let preprocessed = PreprocessedProblem {
            options: effective,
            linear_solver_options,
            evaluator_options,
            minimizer_options,
            linear_solver: Some(linear_solver),
            evaluator: Some(evaluator),
            inner_iteration_minimizer,
            reduced_program: program,
            fixed_cost,
            preprocessor_time: start.elapsed(),
        };
        info!(
            "Preprocessed {} parameter blocks / {} residual blocks for {} in {:.3} ms",
            preprocessed.reduced_program.num_parameter_blocks(),
            preprocessed.reduced_program.num_residual_blocks(),
            preprocessed.linear_solver_options.solver_type,
            preprocessed.preprocessor_time.as_secs_f64() * 1e3
        );
        Ok(preprocessed)
    }
}

/// Run [`TrustRegionPreprocessor::preprocess`].
///
/// # Example
///
/// ```
/// use apex_preprocessor::core::problem::Problem;
/// use apex_preprocessor::factors::BetweenFactor;
/// use apex_preprocessor::linalg::LinearSolverType;
/// use apex_preprocessor::preprocessor::{SolverOptions, preprocess};
/// use nalgebra::dvector;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut problem = Problem::new();
/// let x = problem.add_parameter_block(dvector![1.0]);
/// let y = problem.add_parameter_block(dvector![2.0]);
/// let z = problem.add_parameter_block(dvector![3.0]);
/// problem.add_residual_block(&[x, y], Box::new(BetweenFactor::new(dvector![1.0])))?;
/// problem.add_residual_block(&[y, z], Box::new(BetweenFactor::new(dvector![1.0])))?;
///
/// let options = SolverOptions::new().with_linear_solver_type(LinearSolverType::DenseSchur);
/// let preprocessed = preprocess(&options, &problem)?;
/// assert_eq!(preprocessed.linear_solver_options.num_eliminate_blocks(), 2);
/// assert!(preprocessed.evaluator.is_some());
/// # Ok(())
/// # }
/// ```
pub fn preprocess<'a>(
    options: &SolverOptions,
    problem: &'a Problem,
) -> ApexResult<PreprocessedProblem<'a>> {
    TrustRegionPreprocessor::new().preprocess(options, problem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApexError;
    use crate::factors::{BetweenFactor, PriorFactor};
    use crate::linalg::LinearSolverType;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_invalid_options_fail_first() -> TestResult {
        // the problem is also invalid, but options are checked before bounds
        let mut problem = Problem::new();
        problem.add_parameter_block(dvector![f64::NAN]);
        let options = SolverOptions::new().with_num_threads(0);
        assert!(matches!(
            preprocess(&options, &problem),
            Err(ApexError::Preprocess(PreprocessError::InvalidOptions(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_trivial_problem_keeps_requested_type() -> TestResult {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(dvector![1.0]);
        problem.set_parameter_block_constant(x)?;
        problem.add_residual_block(&[x], Box::new(PriorFactor { data: dvector![0.0] }))?;

        let options = SolverOptions::new()
            .with_linear_solver_type(LinearSolverType::DenseSchur)
            .with_inner_iterations(true);
        let preprocessed = preprocess(&options, &problem)?;
        assert!(preprocessed.is_trivial());
        assert!(preprocessed.linear_solver.is_none());
        assert!(preprocessed.evaluator.is_none());
        assert!(!preprocessed.options.use_inner_iterations);
        assert_eq!(preprocessed.linear_solver_options.solver_type, LinearSolverType::DenseSchur);
        assert!((preprocessed.fixed_cost - 0.5).abs() < 1e-12);
        assert!((preprocessed.minimizer_options.fixed_cost - 0.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_effective_options_record_orderings() -> TestResult {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(dvector![1.0]);
        let y = problem.add_parameter_block(dvector![2.0]);
        let z = problem.add_parameter_block(dvector![3.0]);
        problem.add_residual_block(&[x, y], Box::new(BetweenFactor::new(dvector![0.0])))?;
        problem.add_residual_block(&[y, z], Box::new(BetweenFactor::new(dvector![0.0])))?;

        let options = SolverOptions::new()
            .with_linear_solver_type(LinearSolverType::IterativeSchur)
            .with_inner_iterations(true);
        let preprocessed = preprocess(&options, &problem)?;
        let ordering = preprocessed
            .options
            .linear_solver_ordering
            .as_ref()
            .ok_or("missing elimination ordering")?;
        assert_eq!(ordering.flattened(), vec![x, z, y]);
        assert!(preprocessed.options.inner_iteration_ordering.is_some());
        assert!(preprocessed.minimizer_options.use_inner_iterations);
        assert!(preprocessed.to_string().contains("Inner iterations: 2 groups over 3 blocks"));
        Ok(())
    }
}
