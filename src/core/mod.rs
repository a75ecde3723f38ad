//! Core data model: variable keys, values, the linear delta vector, the
//! elimination ordering and the nonlinear factor graph.

pub mod factor_graph;
pub mod key;
pub mod ordering;
pub mod values;
pub mod variable_index;
pub mod vector_values;

use self::key::Key;
use thiserror::Error;

/// Core-specific error types for crest-solver
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A value was inserted for a key that already has one
    #[error("variable {0} already has a value")]
    DuplicateVariable(Key),

    /// A key was referenced that has no value
    #[error("variable {0} has no value")]
    UnknownVariable(Key),

    /// A factor index does not exist or refers to a removed factor
    #[error("factor index {0} does not exist or was already removed")]
    UnknownFactor(usize),

    /// A vector had the wrong length for the variable it addresses
    #[error("dimension mismatch for {key}: expected {expected}, got {got}")]
    DimensionMismatch {
        key: Key,
        expected: usize,
        got: usize,
    },

    /// A value of the wrong manifold kind was supplied
    #[error("variable {0} holds a different manifold kind than requested")]
    WrongVariableKind(Key),

    /// Invalid input parameters (empty sigmas, non-positive sigma, ...)
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
