//! Linear factors, Gaussian conditionals and the dense elimination kernels.
//!
//! All matrices here are slot-addressed and dense: the sparsity of the overall
//! problem is captured by the Bayes tree, so each kernel only ever sees the
//! small joint system of one elimination step. The numerical work delegates to
//! nalgebra decompositions.

pub mod conditional;
pub mod gaussian_factor;

use std::fmt;
use std::fmt::{Display, Formatter};
use thiserror::Error;
use tracing::error;

/// Numerical method used to eliminate the frontal block of a joint factor.
///
/// The symmetric (LDL-style) kernel factorizes the frontal information block
/// and is the faster default, but fails when accumulated round-off makes an
/// intermediate block indefinite; QR works on the stacked Jacobian directly
/// and is more robust on poorly-conditioned problems.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Factorization {
    /// Symmetric square-root factorization of the frontal information block
    #[default]
    Ldl,
    /// Householder QR of the stacked Jacobian
    Qr,
}

impl Display for Factorization {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Factorization::Ldl => write!(f, "LDL"),
            Factorization::Qr => write!(f, "QR"),
        }
    }
}

/// Linear algebra specific error types for crest-solver
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Symmetric elimination encountered a non-positive pivot
    #[error("indefinite linear system: symmetric elimination hit a non-positive pivot")]
    IndefiniteLinearSystem,

    /// A conditional's triangular frontal block could not be solved
    #[error("singular conditional encountered while solving for slot {0}")]
    SingularConditional(usize),

    /// A variable scheduled for elimination has no factor mentioning it
    #[error("variable at slot {0} is not constrained by any factor")]
    Underconstrained(usize),

    /// Inconsistent block dimensions in a linear factor
    #[error("dimension mismatch in linear factor: {0}")]
    Dimension(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

pub use conditional::GaussianConditional;
pub use gaussian_factor::{GaussianFactor, HessianFactor, JacobianFactor};
