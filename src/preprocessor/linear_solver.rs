//! Linear solver selection.

use tracing::debug;

use crate::core::{problem::Problem, worker_pool::WorkerPool};
use crate::linalg::{
    LinAlgError, LinearSolver, LinearSolverOptions, create_linear_solver_with_pool,
};
use crate::preprocessor::{
    PreprocessError, PreprocessResult, elimination::EliminationPlan, options::SolverOptions,
};

/// Derive the solver options from the effective plan.
///
/// `eliminated_block_sizes` lists the sizes of group 0 in column order; it is empty for
/// non-Schur solvers.
pub fn build_linear_solver_options(
    options: &SolverOptions,
    plan: &EliminationPlan,
    problem: &Problem,
) -> LinearSolverOptions {
    let eliminated_block_sizes = plan
        .ordering
        .flattened()
        .into_iter()
        .take(plan.num_eliminate_blocks)
        .filter_map(|id| problem.parameter_block(id).ok())
        .map(|block| block.size())
        .collect();

    LinearSolverOptions {
        solver_type: plan.linear_solver_type,
        elimination_groups: plan.ordering.group_sizes(),
        eliminated_block_sizes,
        min_num_iterations: options.min_linear_solver_iterations,
        max_num_iterations: options.max_linear_solver_iterations,
        num_threads: options.num_threads,
    }
}

/// Instantiate the solver for `linear_solver_options`, solving on `pool`.
///
/// # Errors
/// `PreprocessError::UnsupportedSolver` if the family is not compiled in.
pub fn select_linear_solver(
    linear_solver_options: &LinearSolverOptions,
    pool: &WorkerPool,
) -> PreprocessResult<Box<dyn LinearSolver>> {
    let solver = create_linear_solver_with_pool(linear_solver_options, pool.clone());
    let solver = solver.map_err(|e| match e {
        LinAlgError::UnsupportedSolver(message) => {
            PreprocessError::UnsupportedSolver(message).log()
        }
        other => PreprocessError::UnsupportedSolver(format!(
            "cannot create {}: {other}",
            linear_solver_options.solver_type
        ))
        .log(),
    })?;
    debug!(
        "Linear solver: {} ({} eliminated columns)",
        solver.solver_type(),
        linear_solver_options.num_eliminate_cols()
    );
    Ok(solver)
}
