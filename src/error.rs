//! Error types for the apex-preprocessor library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! - **`ApexError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`PreprocessError`, `CoreError`, `LinAlgError`, ...) are wrapped
//!   inside `ApexError`
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! ApexError::Preprocess(
//!     PreprocessError::InvalidOrdering(
//!         "group 0 is not an independent set: r1 references p0 and p1"
//!     )
//! )
//! ```

use crate::{
    core::CoreError, evaluator::EvaluatorError, factors::FactorError, linalg::LinAlgError,
    preprocessor::PreprocessError,
};
#[cfg(feature = "io")]
use crate::io::IoError;
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the apex-preprocessor library
pub type ApexResult<T> = Result<T, ApexError>;

/// Main error type for the apex-preprocessor library
///
/// # Error Chain Access
///
/// ```rust,ignore
/// if let Err(e) = preprocess(&options, &problem) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum ApexError {
    /// Preprocessing pipeline errors (validation, ordering, solver selection)
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    /// Problem construction errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Cost function errors
    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Residual and Jacobian evaluation errors
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// I/O and file parsing errors
    #[cfg(feature = "io")]
    #[error(transparent)]
    Io(#[from] IoError),
}

impl ApexError {
    /// Get the full error chain as a string for logging and debugging.
    ///
    /// Traverses the source chain from the top-level error down to the root cause, one
    /// entry per line.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    ///
    /// ```rust,ignore
    /// error!("Preprocessing failed: {}", apex_err.chain_compact());
    /// ```
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apex_error_display() {
        let error = ApexError::from(LinAlgError::SingularMatrix);
        assert!(error.to_string().contains("Singular matrix"));
    }

    #[test]
    fn test_apex_error_chain() {
        let linalg_error =
            LinAlgError::FactorizationFailed("Cholesky factorization failed".to_string());
        let error = ApexError::from(linalg_error);

        let chain = error.chain();
        assert!(chain.contains("factorization"));
        assert!(chain.contains("Cholesky"));
    }

    #[test]
    fn test_apex_error_chain_compact() {
        let error = ApexError::from(PreprocessError::InvalidBounds(
            "p3[1]: lower bound 2 exceeds upper bound 1".to_string(),
        ));
        assert!(error.chain_compact().contains("lower bound 2 exceeds upper bound 1"));
    }

    #[test]
    fn test_apex_result_err() {
        let core_error = CoreError::ResidualBlock("Test error".to_string());
        let result: ApexResult<i32> = Err(ApexError::from(core_error));
        assert!(result.is_err());
    }

    #[test]
    fn test_transparent_error_conversion() {
        let factor_error = FactorError::InvalidDimension {
            expected: 3,
            actual: 2,
        };

        let apex_error: ApexError = factor_error.into();
        match apex_error {
            ApexError::Factor(_) => { /* Expected */ }
            _ => panic!("Expected Factor variant"),
        }
    }
}
