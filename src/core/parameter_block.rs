//! Parameter blocks: fixed-size chunks of optimization variables.
//!
//! A `ParameterBlock` owns the current value of a group of scalar parameters together with
//! per-dimension box constraints and an explicit constancy flag. Blocks are stored by the
//! [`Problem`](crate::core::problem::Problem) and referenced everywhere else by
//! [`ParameterBlockId`](crate::core::problem::ParameterBlockId).
//!
//! # Constancy
//!
//! A block is treated as constant during optimization when either
//! - it was explicitly marked constant with [`ParameterBlock::set_constant`], or
//! - every dimension has `lower == upper`, collapsing its feasible box to a single point.
//!
//! # Example
//!
//! ```
//! use apex_preprocessor::core::parameter_block::ParameterBlock;
//! use nalgebra::dvector;
//! # use apex_preprocessor::core::CoreResult;
//! # fn example() -> CoreResult<()> {
//!
//! let mut block = ParameterBlock::new(dvector![1.0, 2.0]);
//! block.set_lower_bound(0, 0.0)?;
//! block.set_upper_bound(0, 5.0)?;
//!
//! assert!(block.has_finite_bounds());
//! assert!(!block.is_constant());
//!
//! block.set_lower_bound(1, 2.0)?;
//! block.set_upper_bound(1, 2.0)?;
//! block.set_lower_bound(0, 1.0)?;
//! block.set_upper_bound(0, 1.0)?;
//! assert!(block.is_bounds_collapsed());
//! assert!(block.is_constant());
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use nalgebra::DVector;

use crate::core::{CoreError, CoreResult};

/// A fixed-size vector of optimization variables with optional box constraints.
#[derive(Clone, Debug)]
pub struct ParameterBlock {
    /// Current parameter values
    values: DVector<f64>,
    /// Per-dimension lower bounds (`-inf` when unbounded)
    lower_bounds: DVector<f64>,
    /// Per-dimension upper bounds (`+inf` when unbounded)
    upper_bounds: DVector<f64>,
    /// Explicit constancy requested by the user
    constant: bool,
}

impl ParameterBlock {
    /// Create an unbounded, variable block from its initial values.
    pub fn new(values: DVector<f64>) -> Self {
        let size = values.len();
        Self {
            values,
            lower_bounds: DVector::from_element(size, f64::NEG_INFINITY),
            upper_bounds: DVector::from_element(size, f64::INFINITY),
            constant: false,
        }
    }

    /// Number of scalar parameters in the block.
    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// Replace the block values. The new vector must have the same size.
    pub fn set_values(&mut self, values: DVector<f64>) -> CoreResult<()> {
        if values.len() != self.size() {
            return Err(CoreError::DimensionMismatch(format!(
                "parameter block has size {}, new values have size {}",
                self.size(),
                values.len()
            ))
            .log());
        }
        self.values = values;
        Ok(())
    }

    pub fn lower_bounds(&self) -> &DVector<f64> {
        &self.lower_bounds
    }

    pub fn upper_bounds(&self) -> &DVector<f64> {
        &self.upper_bounds
    }

    pub fn lower_bound(&self, index: usize) -> Option<f64> {
        self.lower_bounds.get(index).copied()
    }

    pub fn upper_bound(&self, index: usize) -> Option<f64> {
        self.upper_bounds.get(index).copied()
    }

    /// Set the lower bound of one dimension.
    ///
    /// No consistency check against the upper bound is made here; contradictory bounds are
    /// reported by the preprocessor, which sees the whole problem.
    pub fn set_lower_bound(&mut self, index: usize, value: f64) -> CoreResult<()> {
        self.check_index(index)?;
        self.lower_bounds[index] = value;
        Ok(())
    }

    /// Set the upper bound of one dimension.
    pub fn set_upper_bound(&mut self, index: usize, value: f64) -> CoreResult<()> {
        self.check_index(index)?;
        self.upper_bounds[index] = value;
        Ok(())
    }

    pub fn set_constant(&mut self) {
        self.constant = true;
    }

    pub fn set_variable(&mut self) {
        self.constant = false;
    }

    pub fn is_explicitly_constant(&self) -> bool {
        self.constant
    }

    /// True when every dimension has `lower == upper`.
    ///
    /// An empty block is never considered collapsed.
    pub fn is_bounds_collapsed(&self) -> bool {
        self.size() > 0
            && self
                .lower_bounds
                .iter()
                .zip(self.upper_bounds.iter())
                .all(|(lower, upper)| lower == upper)
    }

    /// True if the block is held fixed, either explicitly or by collapsed bounds.
    pub fn is_constant(&self) -> bool {
        self.constant || self.is_bounds_collapsed()
    }

    /// True if any dimension carries a finite lower or upper bound.
    pub fn has_finite_bounds(&self) -> bool {
        self.lower_bounds.iter().any(|b| b.is_finite())
            || self.upper_bounds.iter().any(|b| b.is_finite())
    }

    /// First dimension whose lower bound exceeds its upper bound.
    pub fn first_inverted_bound(&self) -> Option<usize> {
        (0..self.size()).find(|&i| self.lower_bounds[i] > self.upper_bounds[i])
    }

    /// First dimension holding a NaN or infinite value.
    pub fn first_non_finite_value(&self) -> Option<usize> {
        self.values.iter().position(|v| !v.is_finite())
    }

    /// First dimension whose value lies outside `[lower, upper]`.
    pub fn first_out_of_bounds_value(&self) -> Option<usize> {
        (0..self.size()).find(|&i| {
            self.values[i] < self.lower_bounds[i] || self.values[i] > self.upper_bounds[i]
        })
    }

    pub fn is_value_within_bounds(&self) -> bool {
        self.first_out_of_bounds_value().is_none()
    }

    fn check_index(&self, index: usize) -> CoreResult<()> {
        if index >= self.size() {
            return Err(CoreError::InvalidInput(format!(
                "bound index {} out of range for parameter block of size {}",
                index,
                self.size()
            ))
            .log());
        }
        Ok(())
    }
}
