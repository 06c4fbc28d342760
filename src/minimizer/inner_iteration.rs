//! Block-coordinate descent between trust-region steps.
//!
//! The minimizer walks the groups of the inner-iteration ordering in ascending order. Every
//! block of a group is updated by one Gauss-Newton step on the residuals that touch it,
//! with all other blocks held fixed. Blocks of one group share no residual, so their
//! updates are computed against the same state and accepted or rejected independently: an
//! update is kept only if it lowers the cost of the block's residuals.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{
    ordering::ParameterBlockOrdering,
    problem::{ParameterBlockId, Problem, ResidualBlockId},
};
use crate::error::ApexResult;
use crate::evaluator::{Evaluator, EvaluatorResult};

/// Cost bookkeeping for one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct InnerIterationSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub num_blocks_updated: usize,
    pub num_blocks_rejected: usize,
    /// Relative decrease fell below the tolerance
    pub converged: bool,
}

impl InnerIterationSummary {
    pub fn relative_decrease(&self) -> f64 {
        if self.initial_cost > 0.0 {
            (self.initial_cost - self.final_cost) / self.initial_cost
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct InnerIterationMinimizer {
    ordering: ParameterBlockOrdering,
    /// Active residual blocks touching each parameter block
    residuals_by_block: HashMap<ParameterBlockId, Vec<ResidualBlockId>>,
    tolerance: f64,
}

impl InnerIterationMinimizer {
    /// Build the minimizer for `ordering`, restricted to the given active residual blocks.
    pub fn new(
        problem: &Problem,
        ordering: ParameterBlockOrdering,
        residuals: &[ResidualBlockId],
        tolerance: f64,
    ) -> Self {
        let mut residuals_by_block: HashMap<ParameterBlockId, Vec<ResidualBlockId>> = ordering
            .flattened()
            .into_iter()
            .map(|id| (id, Vec::new()))
            .collect();

        for &residual_id in residuals {
            let Ok(residual) = problem.residual_block(residual_id) else {
                continue;
            };
            for id in residual.distinct_parameter_blocks() {
                if let Some(list) = residuals_by_block.get_mut(&id) {
                    list.push(residual_id);
                }
            }
        }

        Self {
            ordering,
            residuals_by_block,
            tolerance,
        }
    }

    pub fn ordering(&self) -> &ParameterBlockOrdering {
        &self.ordering
    }

    pub fn num_groups(&self) -> usize {
        self.ordering.num_groups()
    }

    pub fn num_blocks(&self) -> usize {
        self.ordering.num_elements()
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Residual blocks that touch `id`.
    pub fn residuals_for(&self, id: ParameterBlockId) -> &[ResidualBlockId] {
        self.residuals_by_block.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run one sweep over all groups, updating `state` in place.
    ///
    /// The sweep runs on the evaluator's worker pool; blocks of a group are solved in
    /// parallel.
    pub fn minimize(
        &self,
        evaluator: &Evaluator<'_>,
        state: &mut DVector<f64>,
    ) -> ApexResult<InnerIterationSummary> {
        evaluator.worker_pool().install(|| self.sweep(evaluator, state))
    }

    fn sweep(
        &self,
        evaluator: &Evaluator<'_>,
        state: &mut DVector<f64>,
    ) -> ApexResult<InnerIterationSummary> {
        let initial_cost = evaluator.evaluate(state, false)?.cost;
        let mut num_blocks_updated = 0;
        let mut num_blocks_rejected = 0;

        for (group_id, group) in self.ordering.groups() {
            let blocks: Vec<ParameterBlockId> = group.iter().copied().collect();
            let current: &DVector<f64> = state;

            #[cfg(feature = "parallel")]
            let candidates: EvaluatorResult<Vec<Option<DVector<f64>>>> = blocks
                .par_iter()
                .map(|&id| self.block_step(evaluator, current, id))
                .collect();

            #[cfg(not(feature = "parallel"))]
            let candidates: EvaluatorResult<Vec<Option<DVector<f64>>>> = blocks
                .iter()
                .map(|&id| self.block_step(evaluator, current, id))
                .collect();

            let candidates = candidates?;

            let mut trial = state.clone();
            for (&id, candidate) in blocks.iter().zip(&candidates) {
                if let (Some(values), Some(offset)) = (candidate, evaluator.parameter_offset(id)) {
                    trial.rows_mut(offset, values.len()).copy_from(values);
                    evaluator.project_block_to_bounds(&mut trial, id)?;
                }
            }

            for (&id, candidate) in blocks.iter().zip(&candidates) {
                let (Some(values), Some(offset)) = (candidate, evaluator.parameter_offset(id))
                else {
                    num_blocks_rejected += 1;
                    continue;
                };
                let residuals = self.residuals_for(id);
                let before = evaluator.partial_cost(state, residuals)?;
                let after = evaluator.partial_cost(&trial, residuals)?;
                if after < before {
                    num_blocks_updated += 1;
                } else {
                    let original = state.rows(offset, values.len()).into_owned();
                    trial.rows_mut(offset, values.len()).copy_from(&original);
                    num_blocks_rejected += 1;
                }
            }

            *state = trial;
            debug!("Inner iteration group {} processed ({} blocks)", group_id, blocks.len());
        }

        let final_cost = evaluator.evaluate(state, false)?.cost;
        let mut summary = InnerIterationSummary {
            initial_cost,
            final_cost,
            num_blocks_updated,
            num_blocks_rejected,
            converged: false,
        };
        summary.converged = summary.relative_decrease() <= self.tolerance;
        debug!(
            "Inner iterations: cost {:.6e} -> {:.6e} ({} updated, {} rejected)",
            initial_cost, final_cost, num_blocks_updated, num_blocks_rejected
        );
        Ok(summary)
    }

    /// Gauss-Newton values for one block, or `None` if its normal equations are singular.
    fn block_step(
        &self,
        evaluator: &Evaluator<'_>,
        state: &DVector<f64>,
        id: ParameterBlockId,
    ) -> EvaluatorResult<Option<DVector<f64>>> {
        let Some(current) = evaluator.block_state(state, id) else {
            return Ok(None);
        };
        let size = current.len();
        let mut hessian = DMatrix::<f64>::zeros(size, size);
        let mut gradient = DVector::<f64>::zeros(size);

        for &residual_id in self.residuals_for(id) {
            let (residual, jacobian) = evaluator.parameter_jacobian(state, residual_id, id)?;
            hessian += jacobian.tr_mul(&jacobian);
            gradient += jacobian.tr_mul(&residual);
        }

        let Some(cholesky) = hessian.cholesky() else {
            return Ok(None);
        };
        let step = cholesky.solve(&(-gradient));
        if !step.iter().all(|v| v.is_finite()) {
            return Ok(None);
        }
        Ok(Some(current + step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvaluatorOptions;
    use crate::factors::{BetweenFactor, PriorFactor};
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// x and z each pinned by a prior and tied to y; {x, z} is independent
    fn create_problem() -> Result<(Problem, [ParameterBlockId; 3]), Box<dyn std::error::Error>> {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(dvector![5.0]);
        let y = problem.add_parameter_block(dvector![-3.0]);
        let z = problem.add_parameter_block(dvector![8.0]);
        problem.add_residual_block(&[x], Box::new(PriorFactor { data: dvector![0.0] }))?;
        problem.add_residual_block(&[z], Box::new(PriorFactor { data: dvector![2.0] }))?;
        problem.add_residual_block(&[x, y], Box::new(BetweenFactor::new(dvector![1.0])))?;
        problem.add_residual_block(&[y, z], Box::new(BetweenFactor::new(dvector![1.0])))?;
        Ok((problem, [x, y, z]))
    }

    fn all_residuals(problem: &Problem) -> Vec<ResidualBlockId> {
        problem.residual_blocks().map(|(id, _)| id).collect()
    }

    #[test]
    fn test_sweep_decreases_cost() -> TestResult {
        let (problem, [x, y, z]) = create_problem()?;
        let residuals = all_residuals(&problem);
        let ordering = ParameterBlockOrdering::from_groups([vec![x, z], vec![y]]);

        let evaluator =
            Evaluator::new(&problem, &ordering, &residuals, 0.0, EvaluatorOptions::default())?;
        let minimizer = InnerIterationMinimizer::new(&problem, ordering, &residuals, 1e-3);
        assert_eq!(minimizer.num_groups(), 2);
        assert_eq!(minimizer.residuals_for(y).len(), 2);

        let mut state = evaluator.initial_state();
        let summary = minimizer.minimize(&evaluator, &mut state)?;
        assert!(summary.final_cost < summary.initial_cost);
        assert_eq!(summary.num_blocks_updated, 3);
        assert!((evaluator.evaluate(&state, false)?.cost - summary.final_cost).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_block_without_information_is_rejected() -> TestResult {
        // w appears in no residual, so its normal equations are empty
        let (mut problem, [x, y, z]) = create_problem()?;
        let w = problem.add_parameter_block(dvector![1.0]);
        let residuals = all_residuals(&problem);
        let ordering = ParameterBlockOrdering::from_groups([vec![x, z, w], vec![y]]);

        let evaluator =
            Evaluator::new(&problem, &ordering, &residuals, 0.0, EvaluatorOptions::default())?;
        let minimizer = InnerIterationMinimizer::new(&problem, ordering, &residuals, 1e-3);

        let mut state = evaluator.initial_state();
        let before = evaluator.block_state(&state, w).ok_or("missing w")?.into_owned();
        let summary = minimizer.minimize(&evaluator, &mut state)?;
        assert_eq!(summary.num_blocks_rejected, 1);
        assert_eq!(evaluator.block_state(&state, w).ok_or("missing w")?.into_owned(), before);
        Ok(())
    }

    #[test]
    fn test_updates_respect_bounds() -> TestResult {
        let (mut problem, [x, y, z]) = create_problem()?;
        problem.set_parameter_lower_bound(x, 0, 4.0)?;
        let residuals = all_residuals(&problem);
        let ordering = ParameterBlockOrdering::from_groups([vec![x, z], vec![y]]);

        let evaluator =
            Evaluator::new(&problem, &ordering, &residuals, 0.0, EvaluatorOptions::default())?;
        let minimizer = InnerIterationMinimizer::new(&problem, ordering, &residuals, 1e-3);

        let mut state = evaluator.initial_state();
        minimizer.minimize(&evaluator, &mut state)?;
        let x_value = evaluator.block_state(&state, x).ok_or("missing x")?[0];
        assert!(x_value >= 4.0);
        Ok(())
    }
}
