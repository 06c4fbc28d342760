//! Elimination ordering: validation, synthesis and the Schur downgrade.
//!
//! For Schur-complement solvers the ordering decides which parameter blocks are eliminated
//! (group 0) and which form the reduced system. For every other solver it only fixes the
//! column order of the Jacobian.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::core::{
    graph::{CooccurrenceGraph, find_independence_violation},
    ordering::ParameterBlockOrdering,
    problem::{ParameterBlockId, Problem},
};
use crate::linalg::LinearSolverType;
use crate::preprocessor::{
    PreprocessError, PreprocessResult, reducer::ReducedProgram, options::SolverOptions,
};

/// The finalized column layout and solver family.
#[derive(Debug, Clone, PartialEq)]
pub struct EliminationPlan {
    /// Ordering over the active blocks only, group ids consecutive from 0
    pub ordering: ParameterBlockOrdering,
    /// Size of group 0 for Schur solvers, 0 otherwise
    pub num_eliminate_blocks: usize,
    /// Effective solver type after a possible downgrade
    pub linear_solver_type: LinearSolverType,
    /// The requested Schur type was replaced by its non-Schur fallback
    pub downgraded: bool,
}

/// Check that a user ordering names exactly the parameter blocks of `problem`.
pub fn validate_ordering_coverage(
    problem: &Problem,
    ordering: &ParameterBlockOrdering,
    name: &str,
) -> PreprocessResult<()> {
    if let Some(unknown) = ordering
        .flattened()
        .into_iter()
        .find(|&id| !problem.contains_parameter_block(id))
    {
        return Err(PreprocessError::InvalidOrdering(format!(
            "{name} references {unknown}, which is not a parameter block of the problem"
        ))
        .log());
    }
    if let Some((missing, _)) =
        problem.parameter_blocks().find(|(id, _)| !ordering.is_member(*id))
    {
        return Err(PreprocessError::InvalidOrdering(format!(
            "{name} has {} elements but the problem has {} parameter blocks; {missing} is missing",
            ordering.num_elements(),
            problem.num_parameter_blocks()
        ))
        .log());
    }
    Ok(())
}

/// Validate or synthesize the elimination ordering for the reduced program.
///
/// # Errors
/// `PreprocessError::InvalidOrdering` if a user ordering does not cover the problem, or if a
/// Schur solver is given an ordering with fewer than two groups, non-consecutive group ids,
/// or a dependent group 0.
pub fn build_elimination_plan(
    options: &SolverOptions,
    problem: &Problem,
    program: &ReducedProgram,
) -> PreprocessResult<EliminationPlan> {
    let requested = options.linear_solver_type;

    let mut ordering = match &options.linear_solver_ordering {
        Some(user) => {
            validate_ordering_coverage(problem, user, "linear_solver_ordering")?;
            if requested.is_schur() {
                validate_schur_ordering(problem, user)?;
            }
            user.clone()
        }
        None if requested.is_schur() => synthesize_schur_ordering(problem, program)?,
        None => ParameterBlockOrdering::from_groups([program.parameter_blocks.clone()]),
    };

    for id in ordering.flattened() {
        if !program.is_active(id) {
            ordering.remove(id);
        }
    }

    let mut linear_solver_type = requested;
    let mut downgraded = false;
    if requested.is_schur() && ordering.min_group_id() != Some(0) {
        linear_solver_type = requested.schur_fallback();
        downgraded = true;
        warn!(
            "No parameter block left to eliminate with {}; switching to {}",
            requested, linear_solver_type
        );
    }
    ordering.compact();

    let num_eliminate_blocks = if linear_solver_type.is_schur() {
        ordering.group_size(0)
    } else {
        0
    };

    debug!(
        "Elimination ordering: {} groups {:?}, {} eliminated blocks, solver {}",
        ordering.num_groups(),
        ordering.group_sizes(),
        num_eliminate_blocks,
        linear_solver_type
    );

    Ok(EliminationPlan {
        ordering,
        num_eliminate_blocks,
        linear_solver_type,
        downgraded,
    })
}

fn validate_schur_ordering(
    problem: &Problem,
    ordering: &ParameterBlockOrdering,
) -> PreprocessResult<()> {
    if ordering.num_groups() < 2 {
        return Err(PreprocessError::InvalidOrdering(format!(
            "Schur solvers need at least two elimination groups, got {}",
            ordering.num_groups()
        ))
        .log());
    }
    if !ordering.is_consecutive_from_zero() {
        return Err(PreprocessError::InvalidOrdering(format!(
            "elimination group ids must be consecutive from 0, got {:?}",
            ordering.groups().map(|(id, _)| id).collect::<Vec<_>>()
        ))
        .log());
    }
    let first: BTreeSet<ParameterBlockId> = ordering.first_group().cloned().unwrap_or_default();
    if let Some(violation) = find_independence_violation(problem, &first) {
        return Err(PreprocessError::InvalidOrdering(format!(
            "group 0 is not an independent set: {} references {} and {}",
            violation.residual, violation.first, violation.second
        ))
        .log());
    }
    Ok(())
}

fn synthesize_schur_ordering(
    problem: &Problem,
    program: &ReducedProgram,
) -> PreprocessResult<ParameterBlockOrdering> {
    let graph =
        CooccurrenceGraph::build(problem, &program.parameter_blocks, &program.residual_blocks);
    let ordering = graph.schur_ordering();
    if ordering.group_size(0) == 0 {
        return Err(PreprocessError::InvalidOrdering(
            "no independent set of parameter blocks to eliminate".to_string(),
        )
        .log());
    }
    Ok(ordering)
}
