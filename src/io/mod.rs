//! Problem file loaders.
//!
//! Currently the BAL ("Bundle Adjustment in the Large") text format, whose camera/point
//! structure is the canonical input for Schur-complement solvers.

use std::io;

use thiserror::Error;
use tracing::error;

pub mod bal;

pub use bal::{BalBlocks, BalLoader, BalObservation, BalProblem};

/// Errors that can occur while reading a problem file
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid number format at line {line}: {value}")]
    InvalidNumber { line: usize, value: String },

    #[error("Unexpected end of file: expected {expected}")]
    UnexpectedEof { expected: String },

    #[error("Index out of range at line {line}: {kind} {index} (count {count})")]
    IndexOutOfRange {
        line: usize,
        kind: &'static str,
        index: usize,
        count: usize,
    },

    #[error("Failed to build problem: {0}")]
    ProblemConstruction(String),
}

impl IoError {
    /// Log the error using tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with source error information using tracing::error and return self
    /// for chaining
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}
