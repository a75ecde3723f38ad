//! # Crest Solver
//!
//! An incremental nonlinear least-squares library for factor-graph estimation
//! problems such as SLAM, structure-from-motion and sensor fusion.
//!
//! Instead of re-solving the full batch problem whenever a measurement arrives,
//! the solver maintains a Bayes tree: a clique-tree representation of the
//! square-root information matrix. New factors tear down only the affected top
//! of the tree, which is re-ordered and re-eliminated locally while untouched
//! subtrees are reused verbatim.
//!
//! ## Features
//!
//! - **Incremental updates**: `Isam2::update` absorbs new factors and variables
//!   and re-eliminates only the affected part of the Bayes tree
//! - **Fluid relinearization**: variables are relinearized only when their linear
//!   delta outgrows a configurable threshold
//! - **Wildfire back-substitution**: the linear delta is refreshed with a
//!   threshold-based short-circuit that skips converged subtrees
//! - **Two step controllers**: plain Gauss-Newton or Powell's dog-leg with a
//!   trust-region radius
//! - **Configurable factorization**: LDL-style symmetric elimination (fast) or
//!   QR (numerically robust), with transparent fallback
//!
//! ## Example
//!
//! ```no_run
//! use crest_solver::core::key::key;
//! use crest_solver::core::values::{Value, Values};
//! use crest_solver::factors::{DiagonalNoise, PriorFactor};
//! use crest_solver::optimizer::{Isam2, Isam2Params};
//! use nalgebra::dvector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut isam = Isam2::new(Isam2Params::default());
//!
//! let x0 = key('x', 0);
//! let prior = PriorFactor::new(
//!     x0,
//!     dvector![0.0, 0.0, 0.0],
//!     DiagonalNoise::from_sigmas(dvector![0.3, 0.3, 0.1])?,
//! );
//!
//! let mut initial = Values::new();
//! initial.insert(x0, Value::Vector(dvector![0.1, -0.1, 0.05]))?;
//!
//! isam.update(vec![Box::new(prior)], initial, &[], None, false)?;
//! let estimate = isam.calculate_estimate()?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod factors;
pub mod inference;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod optimizer;

pub use error::{CrestError, CrestResult};
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{Isam2, Isam2Params, UpdateResult};
