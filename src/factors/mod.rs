//! Reference measurement factors and the diagonal Gaussian noise model.
//!
//! The solver core only depends on the [`NonlinearFactor`] trait; the factors
//! here cover the measurements that planar SLAM problems are built from:
//! priors and relative (odometry / loop-closure) constraints, on vector
//! variables and on SE(2) poses.

pub mod noise;
pub mod se2_factors;
pub mod vector_factors;

pub use noise::DiagonalNoise;
pub use se2_factors::{Se2BetweenFactor, Se2PriorFactor};
pub use vector_factors::{BetweenFactor, PriorFactor};

pub use crate::core::factor_graph::{LinearizedFactor, NonlinearFactor};
