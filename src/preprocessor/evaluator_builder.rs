//! Evaluator construction over the reduced program.

use tracing::debug;

use crate::core::{problem::Problem, worker_pool::WorkerPool};
use crate::evaluator::{Evaluator, EvaluatorOptions};
use crate::preprocessor::{
    PreprocessError, PreprocessResult, elimination::EliminationPlan, options::SolverOptions,
    reducer::ReducedProgram,
};

pub fn build_evaluator_options(
    options: &SolverOptions,
    plan: &EliminationPlan,
) -> EvaluatorOptions {
    EvaluatorOptions {
        linear_solver_type: plan.linear_solver_type,
        num_eliminate_blocks: plan.num_eliminate_blocks,
        num_threads: options.num_threads,
    }
}

/// Build the evaluator whose column layout follows `plan.ordering`; it evaluates on `pool`.
///
/// # Errors
/// `PreprocessError::EvaluatorConstruction` if the layout is incompatible with the solver.
pub fn build_evaluator<'a>(
    problem: &'a Problem,
    plan: &EliminationPlan,
    program: &ReducedProgram,
    evaluator_options: EvaluatorOptions,
    pool: &WorkerPool,
) -> PreprocessResult<Evaluator<'a>> {
    let evaluator = Evaluator::with_worker_pool(
        problem,
        &plan.ordering,
        &program.residual_blocks,
        program.fixed_cost,
        evaluator_options,
        pool.clone(),
    )
    .map_err(|e| PreprocessError::EvaluatorConstruction(e.to_string()).log_with_source(e))?;

    debug!(
        "Evaluator: {} parameters x {} residuals, {} Jacobian",
        evaluator.num_parameters(),
        evaluator.num_residuals(),
        if evaluator.is_sparse() { "sparse" } else { "dense" }
    );
    Ok(evaluator)
}
