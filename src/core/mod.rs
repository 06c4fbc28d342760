//! Core problem representation for the apex-preprocessor library
//!
//! This module contains the data model the preprocessing pipeline reads:
//! - Parameter blocks (values, bounds, constancy)
//! - Residual blocks (a factor plus the parameter blocks it depends on)
//! - The owning `Problem` container
//! - Group orderings over parameter blocks
//! - The residual co-occurrence graph used to synthesize orderings
//! - The bounded worker pool shared by the parallel stages

pub mod graph;
pub mod ordering;
pub mod parameter_block;
pub mod problem;
pub mod residual_block;
pub mod worker_pool;

use thiserror::Error;
use tracing::error;

/// Core module error types for problem construction
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Referenced parameter block does not exist in the problem
    #[error("Unknown parameter block: {0}")]
    UnknownParameterBlock(String),

    /// Referenced residual block does not exist in the problem
    #[error("Unknown residual block: {0}")]
    UnknownResidualBlock(String),

    /// Residual block operation failed
    #[error("Residual block error: {0}")]
    ResidualBlock(String),

    /// Dimension mismatch between factor and parameter blocks
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid input parameter (index out of range, empty block)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Worker threads could not be started
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
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

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
