//! Optimization problem definition.
//!
//! The `Problem` struct owns every parameter block and residual block of a nonlinear least
//! squares problem:
//!
//! ```text
//! minimize Σ_i ½ ||r_i(x)||²    subject to  l ≤ x ≤ u
//! ```
//!
//! # Residual Graph
//!
//! The problem is a bipartite graph between parameter blocks and residual blocks:
//!
//! ```text
//! Parameters:  a ----- b ----- c
//!               \     / \     /
//! Residuals:     r(a,b)  r(b,c)
//! ```
//!
//! Two parameter blocks *co-occur* when some residual references both. Co-occurrence is the
//! structural signal the preprocessor uses to build elimination orderings.
//!
//! # Ownership
//!
//! The problem is the only owner of block storage. Everything downstream (orderings, the
//! evaluator, the preprocessed output) refers to blocks by [`ParameterBlockId`] and
//! [`ResidualBlockId`] and borrows the problem for as long as it needs values.
//!
//! # Example
//!
//! ```
//! use apex_preprocessor::core::problem::Problem;
//! use apex_preprocessor::factors::{BetweenFactor, PriorFactor};
//! use nalgebra::dvector;
//! # use apex_preprocessor::core::CoreResult;
//! # fn example() -> CoreResult<()> {
//!
//! let mut problem = Problem::new();
//! let x0 = problem.add_parameter_block(dvector![0.0]);
//! let x1 = problem.add_parameter_block(dvector![0.9]);
//!
//! problem.add_residual_block(&[x0], Box::new(PriorFactor { data: dvector![0.0] }))?;
//! problem.add_residual_block(&[x0, x1], Box::new(BetweenFactor::new(dvector![1.0])))?;
//! problem.set_parameter_lower_bound(x1, 0, 0.0)?;
//!
//! assert_eq!(problem.num_parameter_blocks(), 2);
//! assert_eq!(problem.num_residual_blocks(), 2);
//! assert_eq!(problem.num_residuals(), 2);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt;

use nalgebra::DVector;

use crate::core::{
    CoreError, CoreResult, parameter_block::ParameterBlock, residual_block::ResidualBlock,
};
use crate::factors::Factor;

/// Index of a parameter block inside its [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterBlockId(pub usize);

/// Index of a residual block inside its [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResidualBlockId(pub usize);

impl fmt::Display for ParameterBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl fmt::Display for ResidualBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Container for the parameter blocks and residual blocks of one problem.
#[derive(Default)]
pub struct Problem {
    parameter_blocks: Vec<ParameterBlock>,
    residual_blocks: Vec<ResidualBlock>,
    /// For each parameter block, the residual blocks that reference it (deduplicated)
    residuals_by_parameter: Vec<Vec<ResidualBlockId>>,
}

impl Problem {
    /// Create a new empty problem.
    ///
    /// ```
    /// use apex_preprocessor::core::problem::Problem;
    ///
    /// let problem = Problem::new();
    /// assert_eq!(problem.num_parameter_blocks(), 0);
    /// assert_eq!(problem.num_residual_blocks(), 0);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter block with the given initial values.
    pub fn add_parameter_block(&mut self, values: DVector<f64>) -> ParameterBlockId {
        let id = ParameterBlockId(self.parameter_blocks.len());
        self.parameter_blocks.push(ParameterBlock::new(values));
        self.residuals_by_parameter.push(Vec::new());
        id
    }

    /// Add a residual block connecting the given parameter blocks.
    ///
    /// Fails if a parameter block does not exist, or if the factor declares parameter block
    /// sizes that disagree with the blocks passed in.
    pub fn add_residual_block(
        &mut self,
        parameter_blocks: &[ParameterBlockId],
        factor: Box<dyn Factor + Send>,
    ) -> CoreResult<ResidualBlockId> {
        for &id in parameter_blocks {
            self.check_parameter_block(id)?;
        }

        if let Some(sizes) = factor.parameter_block_sizes() {
            if sizes.len() != parameter_blocks.len() {
                return Err(CoreError::DimensionMismatch(format!(
                    "factor expects {} parameter blocks, got {}",
                    sizes.len(),
                    parameter_blocks.len()
                ))
                .log());
            }
            for (&id, &expected) in parameter_blocks.iter().zip(sizes.iter()) {
                let actual = self.parameter_blocks[id.0].size();
                if actual != expected {
                    return Err(CoreError::DimensionMismatch(format!(
                        "factor expects size {expected} for parameter block {id}, got {actual}"
                    ))
                    .log());
                }
            }
        }

        let residual_id = ResidualBlockId(self.residual_blocks.len());
        for &id in parameter_blocks {
            let users = &mut self.residuals_by_parameter[id.0];
            if users.last() != Some(&residual_id) {
                users.push(residual_id);
            }
        }
        self.residual_blocks
            .push(ResidualBlock::new(parameter_blocks.to_vec(), factor));
        Ok(residual_id)
    }

    pub fn set_parameter_lower_bound(
        &mut self,
        id: ParameterBlockId,
        index: usize,
        lower_bound: f64,
    ) -> CoreResult<()> {
        self.parameter_block_mut(id)?
            .set_lower_bound(index, lower_bound)
    }

    pub fn set_parameter_upper_bound(
        &mut self,
        id: ParameterBlockId,
        index: usize,
        upper_bound: f64,
    ) -> CoreResult<()> {
        self.parameter_block_mut(id)?
            .set_upper_bound(index, upper_bound)
    }

    pub fn set_parameter_block_constant(&mut self, id: ParameterBlockId) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_constant();
        Ok(())
    }

    pub fn set_parameter_block_variable(&mut self, id: ParameterBlockId) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_variable();
        Ok(())
    }

    pub fn set_parameter_block_values(
        &mut self,
        id: ParameterBlockId,
        values: DVector<f64>,
    ) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_values(values)
    }

    pub fn parameter_block(&self, id: ParameterBlockId) -> CoreResult<&ParameterBlock> {
        self.parameter_blocks.get(id.0).ok_or_else(|| {
            CoreError::UnknownParameterBlock(format!(
                "{id} (problem has {} parameter blocks)",
                self.parameter_blocks.len()
            ))
        })
    }

    pub fn parameter_block_mut(&mut self, id: ParameterBlockId) -> CoreResult<&mut ParameterBlock> {
        let count = self.parameter_blocks.len();
        self.parameter_blocks.get_mut(id.0).ok_or_else(|| {
            CoreError::UnknownParameterBlock(format!("{id} (problem has {count} parameter blocks)"))
                .log()
        })
    }

    pub fn residual_block(&self, id: ResidualBlockId) -> CoreResult<&ResidualBlock> {
        self.residual_blocks.get(id.0).ok_or_else(|| {
            CoreError::UnknownResidualBlock(format!(
                "{id} (problem has {} residual blocks)",
                self.residual_blocks.len()
            ))
        })
    }

    /// Iterate over `(id, block)` pairs in insertion order.
    pub fn parameter_blocks(&self) -> impl Iterator<Item = (ParameterBlockId, &ParameterBlock)> {
        self.parameter_blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (ParameterBlockId(i), b))
    }

    /// Iterate over `(id, block)` pairs in insertion order.
    pub fn residual_blocks(&self) -> impl Iterator<Item = (ResidualBlockId, &ResidualBlock)> {
        self.residual_blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (ResidualBlockId(i), b))
    }

    /// Residual blocks that reference the given parameter block.
    pub fn residual_blocks_for(&self, id: ParameterBlockId) -> &[ResidualBlockId] {
        self.residuals_by_parameter
            .get(id.0)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_parameter_block(&self, id: ParameterBlockId) -> bool {
        id.0 < self.parameter_blocks.len()
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    /// Total number of scalar parameters over all blocks.
    pub fn num_parameters(&self) -> usize {
        self.parameter_blocks.iter().map(ParameterBlock::size).sum()
    }

    /// Total residual dimension over all residual blocks.
    pub fn num_residuals(&self) -> usize {
        self.residual_blocks
            .iter()
            .map(ResidualBlock::num_residuals)
            .sum()
    }

    /// Current values of the parameter blocks a residual reads, one per occurrence.
    pub fn gather_values(&self, residual: &ResidualBlock) -> Vec<DVector<f64>> {
        residual
            .parameter_blocks()
            .iter()
            .map(|id| self.parameter_blocks[id.0].values().clone())
            .collect()
    }

    fn check_parameter_block(&self, id: ParameterBlockId) -> CoreResult<()> {
        if !self.contains_parameter_block(id) {
            return Err(CoreError::UnknownParameterBlock(format!(
                "{id} (problem has {} parameter blocks)",
                self.parameter_blocks.len()
            ))
            .log());
        }
        Ok(())
    }
}
