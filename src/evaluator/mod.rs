//! Residual and Jacobian evaluation over the reduced program.
//!
//! The evaluator fixes the layout the linear solver sees:
//!
//! - **Columns**: active parameter blocks in elimination-ordering order (group by group,
//!   ascending ids inside a group). Offsets are prefix sums of the block sizes. For Schur
//!   solvers the eliminated blocks therefore occupy the leading columns.
//! - **Rows**: for Schur solvers, residual blocks touching an eliminated block come first,
//!   grouped by that block in column order; the rest follow in problem order. Other solvers
//!   use problem order.
//!
//! The state vector holds the values of the active blocks in column order. Constant blocks
//! are read straight from the problem and never appear in the state. The evaluator only
//! borrows the problem and never writes to it.
//!
//! # Example
//!
//! ```
//! use apex_preprocessor::core::{ordering::ParameterBlockOrdering, problem::Problem};
//! use apex_preprocessor::evaluator::{Evaluator, EvaluatorOptions};
//! use apex_preprocessor::factors::PriorFactor;
//! use nalgebra::dvector;
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//!
//! let mut problem = Problem::new();
//! let x = problem.add_parameter_block(dvector![1.0, 2.0]);
//! let r = problem.add_residual_block(&[x], Box::new(PriorFactor { data: dvector![0.0, 0.0] }))?;
//!
//! let ordering = ParameterBlockOrdering::from_groups([vec![x]]);
//! let evaluator = Evaluator::new(&problem, &ordering, &[r], 0.0, EvaluatorOptions::default())?;
//!
//! let evaluation = evaluator.evaluate(&evaluator.initial_state(), true)?;
//! assert!((evaluation.cost - 2.5).abs() < 1e-12);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::collections::HashMap;

use faer::sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{
    ordering::ParameterBlockOrdering,
    problem::{ParameterBlockId, Problem, ResidualBlockId},
    worker_pool::WorkerPool,
};
use crate::linalg::{JacobianMatrix, LinearSolverType};

/// Evaluator-specific error types
#[derive(Debug, Clone, Error)]
pub enum EvaluatorError {
    /// The layout could not be built from the ordering and residuals
    #[error("Evaluator construction failed: {0}")]
    Construction(String),

    /// A residual block failed to evaluate
    #[error("Evaluation of {residual} failed: {reason}")]
    Evaluation {
        residual: ResidualBlockId,
        reason: String,
    },

    /// A state or step vector has the wrong length
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The sparse Jacobian could not be assembled
    #[error("Sparse Jacobian assembly failed: {0}")]
    SparseAssembly(String),
}

impl EvaluatorError {
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

/// Result type for evaluator operations
pub type EvaluatorResult<T> = Result<T, EvaluatorError>;

/// Layout options chosen by the preprocessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorOptions {
    pub linear_solver_type: LinearSolverType,
    /// Number of leading parameter blocks eliminated by a Schur solver
    pub num_eliminate_blocks: usize,
    pub num_threads: usize,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            num_eliminate_blocks: 0,
            num_threads: 1,
        }
    }
}

/// Residuals, cost and optional Jacobian at one state.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// `fixed_cost + ½||r||²`
    pub cost: f64,
    pub residuals: DVector<f64>,
    pub jacobian: Option<JacobianMatrix>,
}

/// Symbolic structure of the sparse Jacobian, computed once per evaluator.
#[derive(Debug, Clone)]
struct SparsityPattern {
    pattern: SymbolicSparseColMat<usize>,
    order: Argsort<usize>,
}

/// One residual block's contribution: its residual and, if requested, its local Jacobian.
type BlockLinearization = (DVector<f64>, Option<DMatrix<f64>>);

pub struct Evaluator<'a> {
    problem: &'a Problem,
    options: EvaluatorOptions,
    /// Active parameter blocks in column order
    parameter_blocks: Vec<ParameterBlockId>,
    /// Column offset of every active parameter block
    column_offsets: HashMap<ParameterBlockId, usize>,
    /// Residual blocks in row order
    residual_blocks: Vec<ResidualBlockId>,
    /// Row offset of every residual block, parallel to `residual_blocks`
    row_offsets: Vec<usize>,
    num_parameters: usize,
    num_residuals: usize,
    fixed_cost: f64,
    sparsity: Option<SparsityPattern>,
    pool: WorkerPool,
}

impl<'a> Evaluator<'a> {
    /// Build the evaluator for `residuals` over the blocks of `ordering`.
    ///
    /// Every parameter block of `ordering` must exist in the problem and every residual
    /// parameter missing from `ordering` must be constant. For Schur solvers no residual may
    /// touch two eliminated blocks. Evaluation runs on a pool of `options.num_threads`
    /// workers.
    pub fn new(
        problem: &'a Problem,
        ordering: &ParameterBlockOrdering,
        residuals: &[ResidualBlockId],
        fixed_cost: f64,
        options: EvaluatorOptions,
    ) -> EvaluatorResult<Self> {
        let pool = WorkerPool::new(options.num_threads).map_err(|e| {
            EvaluatorError::Construction(format!(
                "cannot start {} evaluation threads",
                options.num_threads
            ))
            .log_with_source(e)
        })?;
        Self::with_worker_pool(problem, ordering, residuals, fixed_cost, options, pool)
    }

    /// Like [`Evaluator::new`], but evaluates on an existing pool.
    pub fn with_worker_pool(
        problem: &'a Problem,
        ordering: &ParameterBlockOrdering,
        residuals: &[ResidualBlockId],
        fixed_cost: f64,
        options: EvaluatorOptions,
        pool: WorkerPool,
    ) -> EvaluatorResult<Self> {
        let parameter_blocks = ordering.flattened();
        if options.num_eliminate_blocks > parameter_blocks.len() {
            return Err(EvaluatorError::Construction(format!(
                "{} eliminated blocks requested but only {} parameter blocks are active",
                options.num_eliminate_blocks,
                parameter_blocks.len()
            ))
            .log());
        }

        let mut column_offsets = HashMap::with_capacity(parameter_blocks.len());
        let mut num_parameters = 0;
        for &id in &parameter_blocks {
            let block = problem.parameter_block(id).map_err(|e| {
                EvaluatorError::Construction(format!("parameter block {id} is not in the problem"))
                    .log_with_source(e)
            })?;
            column_offsets.insert(id, num_parameters);
            num_parameters += block.size();
        }

        for &residual_id in residuals {
            let residual = problem.residual_block(residual_id).map_err(|e| {
                EvaluatorError::Construction(format!(
                    "residual block {residual_id} is not in the problem"
                ))
                .log_with_source(e)
            })?;
            for &id in residual.parameter_blocks() {
                let is_constant = problem.parameter_block(id).is_ok_and(|b| b.is_constant());
                if !column_offsets.contains_key(&id) && !is_constant {
                    return Err(EvaluatorError::Construction(format!(
                        "{residual_id} depends on {id}, which is neither in the layout nor constant"
                    ))
                    .log());
                }
            }
        }

        let residual_blocks = if options.linear_solver_type.is_schur() {
            schur_row_order(
                problem,
                &parameter_blocks[..options.num_eliminate_blocks],
                residuals,
            )?
        } else {
            residuals.to_vec()
        };

        let mut row_offsets = Vec::with_capacity(residual_blocks.len());
        let mut num_residuals = 0;
        for &residual_id in &residual_blocks {
            row_offsets.push(num_residuals);
            num_residuals += problem.residual_block(residual_id).map_or(0, |r| r.num_residuals());
        }

        let mut evaluator = Self {
            problem,
            options,
            parameter_blocks,
            column_offsets,
            residual_blocks,
            row_offsets,
            num_parameters,
            num_residuals,
            fixed_cost,
            sparsity: None,
            pool,
        };
        if !evaluator.options.linear_solver_type.uses_dense_jacobian() {
            evaluator.sparsity = Some(evaluator.build_sparsity_pattern()?);
        }
        Ok(evaluator)
    }

    pub fn options(&self) -> &EvaluatorOptions {
        &self.options
    }

    /// Pool the parallel sections of evaluation run on.
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    pub fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    pub fn fixed_cost(&self) -> f64 {
        self.fixed_cost
    }

    /// Active parameter blocks in column order.
    pub fn parameter_blocks(&self) -> &[ParameterBlockId] {
        &self.parameter_blocks
    }

    /// Residual blocks in row order.
    pub fn residual_blocks(&self) -> &[ResidualBlockId] {
        &self.residual_blocks
    }

    /// Column offset of an active parameter block.
    pub fn parameter_offset(&self, id: ParameterBlockId) -> Option<usize> {
        self.column_offsets.get(&id).copied()
    }

    /// Row offset of a residual block.
    pub fn residual_offset(&self, id: ResidualBlockId) -> Option<usize> {
        self.residual_blocks
            .iter()
            .position(|&r| r == id)
            .map(|i| self.row_offsets[i])
    }

    /// True if the evaluator produces a sparse Jacobian.
    pub fn is_sparse(&self) -> bool {
        self.sparsity.is_some()
    }

    /// Current values of the active blocks, in column order.
    pub fn initial_state(&self) -> DVector<f64> {
        let mut state = DVector::zeros(self.num_parameters);
        for &id in &self.parameter_blocks {
            if let (Ok(block), Some(offset)) =
                (self.problem.parameter_block(id), self.parameter_offset(id))
            {
                state.rows_mut(offset, block.size()).copy_from(block.values());
            }
        }
        state
    }

    /// Euclidean update `state + delta`.
    pub fn plus(
        &self,
        state: &DVector<f64>,
        delta: &DVector<f64>,
    ) -> EvaluatorResult<DVector<f64>> {
        self.check_state(state)?;
        self.check_state(delta)?;
        Ok(state + delta)
    }

    /// Clamp every coordinate of `state` into its bounds.
    pub fn project_to_bounds(&self, state: &mut DVector<f64>) -> EvaluatorResult<()> {
        self.check_state(state)?;
        for &id in &self.parameter_blocks {
            self.project_block_to_bounds(state, id)?;
        }
        Ok(())
    }

    /// Clamp the coordinates of one active block into its bounds.
    pub fn project_block_to_bounds(
        &self,
        state: &mut DVector<f64>,
        id: ParameterBlockId,
    ) -> EvaluatorResult<()> {
        self.check_state(state)?;
        let (Ok(block), Some(offset)) =
            (self.problem.parameter_block(id), self.parameter_offset(id))
        else {
            return Ok(());
        };
        for i in 0..block.size() {
            let value = &mut state[offset + i];
            *value = value.max(block.lower_bounds()[i]).min(block.upper_bounds()[i]);
        }
        Ok(())
    }

    /// Values of one active block inside `state`.
    pub fn block_state<'s>(
        &self,
        state: &'s DVector<f64>,
        id: ParameterBlockId,
    ) -> Option<nalgebra::DVectorView<'s, f64>> {
        let offset = self.parameter_offset(id)?;
        let size = self.problem.parameter_block(id).ok()?.size();
        Some(state.rows(offset, size))
    }

    /// Cost of a subset of residual blocks, without `fixed_cost`.
    pub fn partial_cost(
        &self,
        state: &DVector<f64>,
        residuals: &[ResidualBlockId],
    ) -> EvaluatorResult<f64> {
        self.check_state(state)?;
        residuals.iter().try_fold(0.0, |cost, &id| {
            let (residual, _) = self.evaluate_residual_block(state, id, false)?;
            Ok(cost + 0.5 * residual.norm_squared())
        })
    }

    /// Evaluate one residual block at `state`.
    ///
    /// The local Jacobian has one column block per parameter occurrence, in the order the
    /// residual lists its parameter blocks.
    pub fn evaluate_residual_block(
        &self,
        state: &DVector<f64>,
        id: ResidualBlockId,
        compute_jacobian: bool,
    ) -> EvaluatorResult<BlockLinearization> {
        let residual = self.problem.residual_block(id).map_err(|e| {
            EvaluatorError::Evaluation {
                residual: id,
                reason: e.to_string(),
            }
            .log()
        })?;

        let values: Vec<DVector<f64>> = residual
            .parameter_blocks()
            .iter()
            .map(|&pid| match self.block_state(state, pid) {
                Some(view) => view.into_owned(),
                None => self
                    .problem
                    .parameter_block(pid)
                    .map(|b| b.values().clone())
                    .unwrap_or_else(|_| DVector::zeros(0)),
            })
            .collect();

        let to_error = |e: crate::factors::FactorError| {
            EvaluatorError::Evaluation {
                residual: id,
                reason: e.to_string(),
            }
            .log()
        };
        if compute_jacobian {
            let (r, j) = residual.evaluate_with_jacobian(&values).map_err(to_error)?;
            Ok((r, Some(j)))
        } else {
            let r = residual.evaluate_residual(&values).map_err(to_error)?;
            Ok((r, None))
        }
    }

    /// Residual of one block and its Jacobian with respect to a single parameter block.
    ///
    /// Columns of repeated occurrences of `parameter` are summed.
    pub fn parameter_jacobian(
        &self,
        state: &DVector<f64>,
        residual_id: ResidualBlockId,
        parameter: ParameterBlockId,
    ) -> EvaluatorResult<(DVector<f64>, DMatrix<f64>)> {
        let (residual, local_jacobian) = self.evaluate_residual_block(state, residual_id, true)?;
        let local_jacobian = local_jacobian.ok_or_else(|| {
            EvaluatorError::Evaluation {
                residual: residual_id,
                reason: "no Jacobian returned".to_string(),
            }
            .log()
        })?;

        let size = self.problem.parameter_block(parameter).map_or(0, |b| b.size());
        let mut jacobian = DMatrix::zeros(residual.len(), size);
        if let Ok(block) = self.problem.residual_block(residual_id) {
            let mut local = 0;
            for &pid in block.parameter_blocks() {
                let width = self.problem.parameter_block(pid).map_or(0, |b| b.size());
                if pid == parameter {
                    jacobian += local_jacobian.columns(local, width);
                }
                local += width;
            }
        }
        Ok((residual, jacobian))
    }

    /// Evaluate every residual block at `state`.
    pub fn evaluate(
        &self,
        state: &DVector<f64>,
        compute_jacobian: bool,
    ) -> EvaluatorResult<Evaluation> {
        self.check_state(state)?;

        #[cfg(feature = "parallel")]
        let blocks: EvaluatorResult<Vec<BlockLinearization>> = self.pool.install(|| {
            self.residual_blocks
                .par_iter()
                .map(|&id| self.evaluate_residual_block(state, id, compute_jacobian))
                .collect()
        });

        #[cfg(not(feature = "parallel"))]
        let blocks: EvaluatorResult<Vec<BlockLinearization>> = self
            .residual_blocks
            .iter()
            .map(|&id| self.evaluate_residual_block(state, id, compute_jacobian))
            .collect();

        let blocks = blocks?;

        let mut residuals = DVector::zeros(self.num_residuals);
        for ((residual, _), &row) in blocks.iter().zip(&self.row_offsets) {
            residuals.rows_mut(row, residual.len()).copy_from(residual);
        }
        let cost = self.fixed_cost + 0.5 * residuals.norm_squared();

        let jacobian = if compute_jacobian {
            Some(match &self.sparsity {
                Some(sparsity) => JacobianMatrix::Sparse(self.assemble_sparse(sparsity, &blocks)?),
                None => JacobianMatrix::Dense(self.assemble_dense(&blocks)),
            })
        } else {
            None
        };

        Ok(Evaluation {
            cost,
            residuals,
            jacobian,
        })
    }

    /// Active parameter occurrences of a residual: (column offset, local column, size).
    fn active_occurrences(&self, id: ResidualBlockId) -> Vec<(usize, usize, usize)> {
        let Ok(residual) = self.problem.residual_block(id) else {
            return Vec::new();
        };
        let mut local = 0;
        let mut occurrences = Vec::with_capacity(residual.num_parameter_blocks());
        for &pid in residual.parameter_blocks() {
            let size = self.problem.parameter_block(pid).map_or(0, |b| b.size());
            if let Some(offset) = self.parameter_offset(pid) {
                occurrences.push((offset, local, size));
            }
            local += size;
        }
        occurrences
    }

    fn assemble_dense(&self, blocks: &[BlockLinearization]) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(self.num_residuals, self.num_parameters);
        for ((&id, &row), (residual, local_jacobian)) in
            self.residual_blocks.iter().zip(&self.row_offsets).zip(blocks)
        {
            let Some(local_jacobian) = local_jacobian else {
                continue;
            };
            for (offset, local, size) in self.active_occurrences(id) {
                let mut target = jacobian.view_mut((row, offset), (residual.len(), size));
                target += local_jacobian.view((0, local), (residual.len(), size));
            }
        }
        jacobian
    }

    /// Non-zero locations in the same order `assemble_sparse` emits values.
    fn build_sparsity_pattern(&self) -> EvaluatorResult<SparsityPattern> {
        let mut indices = Vec::new();
        for (&id, &row) in self.residual_blocks.iter().zip(&self.row_offsets) {
            let num_rows = self.problem.residual_block(id).map_or(0, |r| r.num_residuals());
            for (offset, _, size) in self.active_occurrences(id) {
                for i in 0..num_rows {
                    for j in 0..size {
                        indices.push(Pair::new(row + i, offset + j));
                    }
                }
            }
        }

        let (pattern, order) = SymbolicSparseColMat::try_new_from_indices(
            self.num_residuals,
            self.num_parameters,
            &indices,
        )
        .map_err(|e| {
            EvaluatorError::Construction(
                "Failed to build symbolic sparse Jacobian structure".to_string(),
            )
            .log_with_source(e)
        })?;
        Ok(SparsityPattern { pattern, order })
    }

    fn assemble_sparse(
        &self,
        sparsity: &SparsityPattern,
        blocks: &[BlockLinearization],
    ) -> EvaluatorResult<SparseColMat<usize, f64>> {
        let mut values = Vec::with_capacity(sparsity.pattern.compute_nnz());
        for (&id, (residual, local_jacobian)) in self.residual_blocks.iter().zip(blocks) {
            let Some(local_jacobian) = local_jacobian else {
                continue;
            };
            for (_, local, size) in self.active_occurrences(id) {
                for i in 0..residual.len() {
                    for j in 0..size {
                        values.push(local_jacobian[(i, local + j)]);
                    }
                }
            }
        }

        SparseColMat::new_from_argsort(sparsity.pattern.clone(), &sparsity.order, values.as_slice())
            .map_err(|e| {
                EvaluatorError::SparseAssembly(
                    "Failed to create sparse Jacobian from argsort".to_string(),
                )
                .log_with_source(e)
            })
    }

    fn check_state(&self, state: &DVector<f64>) -> EvaluatorResult<()> {
        if state.len() != self.num_parameters {
            return Err(EvaluatorError::DimensionMismatch {
                expected: self.num_parameters,
                actual: state.len(),
            }
            .log());
        }
        Ok(())
    }
}

/// Residuals touching an eliminated block first, grouped by that block; the rest after.
fn schur_row_order(
    problem: &Problem,
    eliminated: &[ParameterBlockId],
    residuals: &[ResidualBlockId],
) -> EvaluatorResult<Vec<ResidualBlockId>> {
    let rank: HashMap<ParameterBlockId, usize> =
        eliminated.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let mut buckets: Vec<Vec<ResidualBlockId>> = vec![Vec::new(); eliminated.len()];
    let mut rest = Vec::new();
    for &residual_id in residuals {
        let residual = problem.residual_block(residual_id).map_err(|e| {
            EvaluatorError::Construction(format!(
                "residual block {residual_id} is not in the problem"
            ))
            .log_with_source(e)
        })?;
        let touched: Vec<usize> = residual
            .distinct_parameter_blocks()
            .iter()
            .filter_map(|id| rank.get(id).copied())
            .collect();
        match touched.as_slice() {
            [] => rest.push(residual_id),
            [bucket] => buckets[*bucket].push(residual_id),
            _ => {
                return Err(EvaluatorError::Construction(format!(
                    "{residual_id} touches {} eliminated parameter blocks",
                    touched.len()
                ))
                .log());
            }
        }
    }

    Ok(buckets.into_iter().flatten().chain(rest).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{BetweenFactor, PriorFactor};
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    type Chain = (Problem, [ParameterBlockId; 3], Vec<ResidualBlockId>);

    /// Chain x - y - z with a prior on x: r0 = prior(x), r1 = between(x, y), r2 = between(y, z)
    fn create_chain() -> Result<Chain, Box<dyn std::error::Error>> {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(dvector![1.0]);
        let y = problem.add_parameter_block(dvector![2.0, 3.0]);
        let z = problem.add_parameter_block(dvector![4.0, 5.0]);
        let r0 = problem.add_residual_block(&[x], Box::new(PriorFactor { data: dvector![0.0] }))?;
        let r1 =
            problem.add_residual_block(&[y, z], Box::new(BetweenFactor::new(dvector![1.0, 1.0])))?;
        let r2 = problem.add_residual_block(&[x, x], Box::new(BetweenFactor::new(dvector![0.5])))?;
        Ok((problem, [x, y, z], vec![r0, r1, r2]))
    }

    fn options(
        linear_solver_type: LinearSolverType,
        num_eliminate_blocks: usize,
    ) -> EvaluatorOptions {
        EvaluatorOptions {
            linear_solver_type,
            num_eliminate_blocks,
            num_threads: 1,
        }
    }

    #[test]
    fn test_column_layout_follows_ordering() -> TestResult {
        let (problem, [x, y, z], residuals) = create_chain()?;
        let ordering = ParameterBlockOrdering::from_groups([vec![z], vec![x, y]]);
        let evaluator = Evaluator::new(
            &problem,
            &ordering,
            &residuals,
            0.0,
            options(LinearSolverType::DenseQr, 0),
        )?;

        assert_eq!(evaluator.parameter_blocks(), &[z, x, y]);
        assert_eq!(evaluator.parameter_offset(z), Some(0));
        assert_eq!(evaluator.parameter_offset(x), Some(2));
        assert_eq!(evaluator.parameter_offset(y), Some(3));
        assert_eq!(evaluator.num_parameters(), 5);
        assert_eq!(evaluator.num_residuals(), 4);
        assert_eq!(evaluator.initial_state(), dvector![4.0, 5.0, 1.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_dense_and_sparse_jacobians_agree() -> TestResult {
        let (problem, [x, y, z], residuals) = create_chain()?;
        let ordering = ParameterBlockOrdering::from_groups([vec![x, y, z]]);

        let dense_options = options(LinearSolverType::DenseQr, 0);
        let dense = Evaluator::new(&problem, &ordering, &residuals, 0.0, dense_options)?;
        let sparse_options = options(LinearSolverType::Cgnr, 0);
        let sparse = Evaluator::new(&problem, &ordering, &residuals, 0.0, sparse_options)?;
        assert!(!dense.is_sparse());
        assert!(sparse.is_sparse());

        let state = dense.initial_state();
        let a = dense.evaluate(&state, true)?;
        let b = sparse.evaluate(&state, true)?;
        assert!((a.cost - b.cost).abs() < 1e-12);

        let ja = a.jacobian.ok_or("missing dense jacobian")?.to_dense();
        let jb = b.jacobian.ok_or("missing sparse jacobian")?.to_dense();
        assert!((ja - &jb).norm() < 1e-12);

        // r2 references x twice with Jacobian [-1 | 1], which cancels
        let row = sparse.residual_offset(residuals[2]).ok_or("missing row")?;
        assert_eq!(jb[(row, 0)], 0.0);
        Ok(())
    }

    #[test]
    fn test_cost_includes_fixed_cost() -> TestResult {
        let (problem, [x, y, z], residuals) = create_chain()?;
        let ordering = ParameterBlockOrdering::from_groups([vec![x, y, z]]);
        let evaluator_options = options(LinearSolverType::DenseQr, 0);
        let evaluator = Evaluator::new(&problem, &ordering, &residuals, 1.5, evaluator_options)?;

        // r0 = 1, r1 = (1, 1), r2 = -0.5
        let evaluation = evaluator.evaluate(&evaluator.initial_state(), false)?;
        assert!((evaluation.cost - (1.5 + 0.5 * 3.25)).abs() < 1e-12);
        assert!(evaluation.jacobian.is_none());
        Ok(())
    }

    #[test]
    fn test_schur_rows_grouped_by_eliminated_block() -> TestResult {
        let (problem, [x, y, z], residuals) = create_chain()?;
        let ordering = ParameterBlockOrdering::from_groups([vec![z, x], vec![y]]);
        let evaluator = Evaluator::new(
            &problem,
            &ordering,
            &residuals,
            0.0,
            options(LinearSolverType::DenseSchur, 2),
        )?;
        // x (id 0) precedes z inside group 0, so x's residuals come first
        assert_eq!(evaluator.residual_blocks(), &[residuals[0], residuals[2], residuals[1]]);
        Ok(())
    }

    #[test]
    fn test_residual_touching_two_eliminated_blocks_is_rejected() -> TestResult {
        let (problem, [x, y, z], residuals) = create_chain()?;
        let ordering = ParameterBlockOrdering::from_groups([vec![y, z], vec![x]]);
        let result = Evaluator::new(
            &problem,
            &ordering,
            &residuals,
            0.0,
            options(LinearSolverType::SparseSchur, 2),
        );
        assert!(matches!(result, Err(EvaluatorError::Construction(_))));
        Ok(())
    }

    #[test]
    fn test_missing_variable_block_is_rejected() -> TestResult {
        let (problem, [x, y, _], residuals) = create_chain()?;
        let ordering = ParameterBlockOrdering::from_groups([vec![x, y]]);
        let result =
            Evaluator::new(&problem, &ordering, &residuals, 0.0, EvaluatorOptions::default());
        assert!(matches!(result, Err(EvaluatorError::Construction(_))));
        Ok(())
    }

    #[test]
    fn test_constant_blocks_are_read_from_problem() -> TestResult {
        let (mut problem, [x, y, z], residuals) = create_chain()?;
        problem.set_parameter_block_constant(z)?;
        let ordering = ParameterBlockOrdering::from_groups([vec![x, y]]);
        let evaluator =
            Evaluator::new(&problem, &ordering, &residuals, 0.0, EvaluatorOptions::default())?;

        assert_eq!(evaluator.num_parameters(), 3);
        let evaluation = evaluator.evaluate(&evaluator.initial_state(), true)?;
        let jacobian = evaluation.jacobian.ok_or("missing jacobian")?;
        assert_eq!(jacobian.ncols(), 3);
        Ok(())
    }

    #[test]
    fn test_project_to_bounds_and_plus() -> TestResult {
        let (mut problem, [x, y, z], residuals) = create_chain()?;
        problem.set_parameter_lower_bound(x, 0, 0.0)?;
        problem.set_parameter_upper_bound(y, 1, 2.5)?;
        let ordering = ParameterBlockOrdering::from_groups([vec![x, y, z]]);
        let evaluator =
            Evaluator::new(&problem, &ordering, &residuals, 0.0, EvaluatorOptions::default())?;

        let delta = dvector![-3.0, 0.0, 1.0, 0.0, 0.0];
        let mut state = evaluator.plus(&evaluator.initial_state(), &delta)?;
        evaluator.project_to_bounds(&mut state)?;
        assert_eq!(state, dvector![0.0, 2.0, 2.5, 4.0, 5.0]);

        assert!(matches!(
            evaluator.plus(&state, &dvector![1.0]),
            Err(EvaluatorError::DimensionMismatch { .. })
        ));
        Ok(())
    }
}
