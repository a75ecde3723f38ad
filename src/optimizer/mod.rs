//! The incremental smoother: update orchestration, step controllers and their
//! configuration.
//!
//! [`Isam2`] maintains a Bayes tree over the linearized problem. Each call to
//! [`Isam2::update`] absorbs new factors and variables, decides which
//! previously-linearized variables must be relinearized, tears down and
//! re-eliminates the affected top of the tree, and refreshes the linear delta
//! with the wildfire back-substitution. The step applied to the estimate is
//! chosen by either a Gauss-Newton or a Powell dog-leg controller.

pub mod dog_leg;
pub mod gauss_newton;
pub mod isam2;
pub mod relinearize;
pub mod wildfire;

use std::collections::HashMap;
use std::fmt;
use std::fmt::{Display, Formatter};

use nalgebra::DVector;
use thiserror::Error;
use tracing::error;

use crate::core::CoreError;
use crate::core::key::Key;
use crate::inference::InferenceError;
use crate::linalg::{Factorization, LinAlgError};

pub use dog_leg::{DogLegParams, TrustRegionAdaptation};
pub use gauss_newton::GaussNewtonParams;
pub use isam2::Isam2;

/// Optimizer-specific error types for crest-solver
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Invalid inputs to `update`; surfaced before any state mutation
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Non-finite values appeared in the linear delta after back-substitution
    #[error("non-finite values in the linear delta after back-substitution")]
    NumericalOverflow,

    /// Linear algebra failure during elimination or solving
    #[error(transparent)]
    LinAlg(#[from] LinAlgError),

    /// Structural Bayes-tree failure
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Core data-model failure
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Selects the step-selection strategy and its parameters.
#[derive(Clone, Debug)]
pub enum OptimizationParams {
    /// Damped Gauss-Newton: the wildfire-refreshed linear delta is the step
    GaussNewton(GaussNewtonParams),
    /// Powell's dog-leg with a trust-region radius
    DogLeg(DogLegParams),
}

impl Default for OptimizationParams {
    fn default() -> Self {
        OptimizationParams::GaussNewton(GaussNewtonParams::default())
    }
}

impl OptimizationParams {
    /// The wildfire short-circuit threshold of the active strategy.
    pub fn wildfire_threshold(&self) -> f64 {
        match self {
            OptimizationParams::GaussNewton(p) => p.wildfire_threshold,
            OptimizationParams::DogLeg(p) => p.wildfire_threshold,
        }
    }
}

/// Per-variable relinearization threshold: one scalar for everything, or a
/// per-dimension vector for each variable type tag.
#[derive(Clone, Debug)]
pub enum RelinearizationThreshold {
    /// A single scalar compared against the max-norm of each variable's delta
    Scalar(f64),
    /// Per-type-tag, per-dimension thresholds
    PerType(HashMap<char, DVector<f64>>),
}

impl Default for RelinearizationThreshold {
    fn default() -> Self {
        RelinearizationThreshold::Scalar(0.1)
    }
}

/// Parameters for the incremental smoother.
///
/// All options can be set with the builder-style `with_*` methods:
///
/// ```
/// use crest_solver::optimizer::{Isam2Params, OptimizationParams, DogLegParams};
/// use crest_solver::linalg::Factorization;
///
/// let params = Isam2Params::default()
///     .with_optimization(OptimizationParams::DogLeg(DogLegParams::default()))
///     .with_relinearize_skip(5)
///     .with_factorization(Factorization::Qr)
///     .with_evaluate_nonlinear_error(true);
/// ```
#[derive(Clone, Debug)]
pub struct Isam2Params {
    /// Step-selection strategy (Gauss-Newton or dog-leg)
    pub optimization: OptimizationParams,
    /// Relinearize variables whose delta magnitude exceeds this threshold
    pub relinearize_threshold: RelinearizationThreshold,
    /// Consider relinearization only every N-th update call
    pub relinearize_skip: usize,
    /// Master switch for fluid relinearization
    pub enable_relinearization: bool,
    /// Evaluate the nonlinear error before and after each update
    pub evaluate_nonlinear_error: bool,
    /// Numerical method used by the elimination kernel
    pub factorization: Factorization,
    /// Keep each factor's last linearization alongside it
    pub cache_linearized_factors: bool,
    /// Populate `UpdateResult::detail`
    pub enable_detailed_results: bool,
}

impl Default for Isam2Params {
    fn default() -> Self {
        Isam2Params {
            optimization: OptimizationParams::default(),
            relinearize_threshold: RelinearizationThreshold::default(),
            relinearize_skip: 10,
            enable_relinearization: true,
            evaluate_nonlinear_error: false,
            factorization: Factorization::default(),
            cache_linearized_factors: true,
            enable_detailed_results: false,
        }
    }
}

impl Isam2Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimization(mut self, optimization: OptimizationParams) -> Self {
        self.optimization = optimization;
        self
    }

    pub fn with_relinearize_threshold(mut self, threshold: RelinearizationThreshold) -> Self {
        self.relinearize_threshold = threshold;
        self
    }

    pub fn with_relinearize_skip(mut self, skip: usize) -> Self {
        self.relinearize_skip = skip;
        self
    }

    pub fn with_enable_relinearization(mut self, enable: bool) -> Self {
        self.enable_relinearization = enable;
        self
    }

    pub fn with_evaluate_nonlinear_error(mut self, evaluate: bool) -> Self {
        self.evaluate_nonlinear_error = evaluate;
        self
    }

    pub fn with_factorization(mut self, factorization: Factorization) -> Self {
        self.factorization = factorization;
        self
    }

    pub fn with_cache_linearized_factors(mut self, cache: bool) -> Self {
        self.cache_linearized_factors = cache;
        self
    }

    pub fn with_enable_detailed_results(mut self, enable: bool) -> Self {
        self.enable_detailed_results = enable;
        self
    }
}

/// Per-variable status flags for [`DetailedResults`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VariableStatus {
    /// Re-eliminated during this update (relinearized, observed, new, or on a
    /// path to the root from such a variable)
    pub reeliminated: bool,
    /// Delta exceeded the relinearization threshold
    pub above_relin_threshold: bool,
    /// Relinearized through clique involvement rather than its own delta
    pub relinearize_involved: bool,
    /// Relinearized for either reason
    pub relinearized: bool,
    /// Touched by factors added or removed in this update
    pub observed: bool,
    /// Added in this update
    pub new: bool,
    /// Frontal variable of a root clique after this update
    pub in_root_clique: bool,
}

/// Optional per-variable breakdown of an update.
#[derive(Clone, Debug, Default)]
pub struct DetailedResults {
    pub variable_status: HashMap<Key, VariableStatus>,
}

/// Information returned from [`Isam2::update`].
#[derive(Clone, Debug, Default)]
pub struct UpdateResult {
    /// Nonlinear error before the update (only with `evaluate_nonlinear_error`)
    pub error_before: Option<f64>,
    /// Nonlinear error after the update (only with `evaluate_nonlinear_error`)
    pub error_after: Option<f64>,
    /// Number of variables whose delta exceeded the relinearization threshold
    pub variables_relinearized: usize,
    /// Number of variables re-eliminated while recalculating the tree top
    pub variables_reeliminated: usize,
    /// Total cliques in the Bayes tree after the update
    pub cliques: usize,
    /// Indices of the newly added factors, 1:1 with the `new_factors` input
    pub new_factors_indices: Vec<usize>,
    /// Per-variable flags (only with `enable_detailed_results`)
    pub detail: Option<DetailedResults>,
}

impl Display for UpdateResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "update: {} reeliminated, {} relinearized, {} cliques",
            self.variables_reeliminated, self.variables_relinearized, self.cliques
        )?;
        if let (Some(before), Some(after)) = (self.error_before, self.error_after) {
            write!(f, ", error {before:.6e} -> {after:.6e}")?;
        }
        Ok(())
    }
}
