//! Error types for the crest-solver library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.
//!
//! The library uses a hierarchical error system:
//! - **`CrestError`** is the top-level error exposed by public APIs
//! - **Module errors** (`CoreError`, `LinAlgError`, `InferenceError`,
//!   `OptimizerError`) are wrapped transparently and preserved as sources

use crate::core::CoreError;
use crate::inference::InferenceError;
use crate::linalg::LinAlgError;
use crate::optimizer::OptimizerError;
use thiserror::Error;

/// Main result type used throughout the crest-solver library
pub type CrestResult<T> = Result<T, CrestError>;

/// Main error type for the crest-solver library
///
/// Wraps module-specific errors while preserving the full error chain.
#[derive(Debug, Error)]
pub enum CrestError {
    /// Core data-model errors (values, keys, factor graph, ordering)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Linear algebra errors (elimination kernels, conditionals)
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Bayes-tree structure errors
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Incremental update and step-controller errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

impl CrestError {
    /// Format the full error chain, one source per line, for logging.
    pub fn chain(&self) -> String {
        use std::error::Error as _;
        let mut chain = vec![self.to_string()];
        let mut source = self.source();
        while let Some(err) = source {
            chain.push(format!("  -> {err}"));
            source = err.source();
        }
        chain.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_passthrough() {
        let err = CrestError::from(LinAlgError::IndefiniteLinearSystem);
        assert!(err.to_string().contains("indefinite"));
    }

    #[test]
    fn test_result_alias() {
        let ok: CrestResult<u32> = Ok(7);
        assert!(ok.is_ok());
    }
}
