//! Bayes-tree inference: cliques, the rooted clique forest and the
//! elimination engine that builds it from a set of linear factors.

pub mod bayes_tree;
pub mod clique;
pub mod elimination;

use thiserror::Error;

/// Structural errors in the Bayes tree. These indicate broken internal
/// invariants and are not recoverable by retrying.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    /// A clique's separator is not covered by its parent
    #[error("running-intersection property violated at clique {0}")]
    RunningIntersection(usize),

    /// A slot is covered by no clique or by more than one clique
    #[error("variable slot {0} is not covered by exactly one clique's frontals")]
    Coverage(usize),

    /// A detached subtree could not be reattached below any clique
    #[error("orphan subtree with separator slot {0} has no hosting clique")]
    OrphanAttach(usize),
}

/// Result type for inference operations
pub type InferenceResult<T> = Result<T, InferenceError>;

pub use bayes_tree::{BayesTree, CliqueId, DetachResult};
pub use clique::Clique;
pub use elimination::{EliminatedClique, eliminate};
