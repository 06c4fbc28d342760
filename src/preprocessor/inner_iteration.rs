//! Inner-iteration planning.
//!
//! Every group of the inner-iteration ordering must be an independent set, so that the
//! blocks of a group can be updated simultaneously without interacting through a shared
//! residual.

use tracing::{debug, warn};

use crate::core::{
    graph::{CooccurrenceGraph, find_independence_violation},
    ordering::ParameterBlockOrdering,
    problem::Problem,
};
use crate::minimizer::InnerIterationMinimizer;
use crate::preprocessor::{
    PreprocessError, PreprocessResult, elimination::validate_ordering_coverage,
    options::SolverOptions, reducer::ReducedProgram,
};

/// Build the inner-iteration minimizer, or `None` when there is nothing to alternate over.
///
/// # Errors
/// `PreprocessError::InvalidOrdering` if a user ordering does not cover the problem or one
/// of its groups is not an independent set.
pub fn plan_inner_iterations(
    options: &SolverOptions,
    problem: &Problem,
    program: &ReducedProgram,
) -> PreprocessResult<Option<InnerIterationMinimizer>> {
    if !options.use_inner_iterations {
        return Ok(None);
    }
    if program.num_parameter_blocks() < 2 {
        warn!(
            "Inner iterations disabled: only {} active parameter block(s)",
            program.num_parameter_blocks()
        );
        return Ok(None);
    }

    let mut ordering = match &options.inner_iteration_ordering {
        Some(user) => {
            validate_ordering_coverage(problem, user, "inner_iteration_ordering")?;
            validate_independent_groups(problem, user)?;
            user.clone()
        }
        None => {
            CooccurrenceGraph::build(problem, &program.parameter_blocks, &program.residual_blocks)
                .recursive_independent_set_ordering()
        }
    };

    for id in ordering.flattened() {
        if !program.is_active(id) {
            ordering.remove(id);
        }
    }
    ordering.compact();

    debug!(
        "Inner iteration ordering: {} groups {:?}",
        ordering.num_groups(),
        ordering.group_sizes()
    );
    Ok(Some(InnerIterationMinimizer::new(
        problem,
        ordering,
        &program.residual_blocks,
        options.inner_iteration_tolerance,
    )))
}

fn validate_independent_groups(
    problem: &Problem,
    ordering: &ParameterBlockOrdering,
) -> PreprocessResult<()> {
    for (group_id, group) in ordering.groups() {
        if let Some(violation) = find_independence_violation(problem, group) {
            return Err(PreprocessError::InvalidOrdering(format!(
                "inner iteration group {group_id} is not independent: {} reads {} and {}",
                violation.residual, violation.first, violation.second
            ))
            .log());
        }
    }
    Ok(())
}
