//! Manifold types for variables that do not live in a vector space.
//!
//! The solver itself only needs a retraction (tangent perturbation applied to
//! the current linearization point); the concrete group operations live here.

pub mod se2;

pub use se2::SE2;
