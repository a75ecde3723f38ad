//! Powell's dog-leg step selection.
//!
//! The dog-leg step interpolates between the Gauss-Newton step and the
//! steepest-descent (Cauchy) step on the boundary of a spherical trust region
//! of radius Δ:
//!
//! - `‖h_gn‖ ≤ Δ`: take the full Gauss-Newton step
//! - `‖h_sd‖ ≥ Δ`: take the steepest-descent step scaled to the boundary
//! - otherwise: `h_sd + τ·(h_gn − h_sd)` with τ chosen so `‖h‖ = Δ`
//!
//! The radius adapts to the gain ratio `ρ = actual / predicted` reduction:
//! shrink on ρ < 0.25, expand on ρ > 0.75, accept the step iff ρ > 0. A
//! rejected step keeps the linearization point; the same linear system is
//! retried with a smaller radius, never re-eliminated.

use std::fmt;
use std::fmt::{Display, Formatter};

use nalgebra::DVector;

/// How the trust-region radius is adapted within one update call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrustRegionAdaptation {
    /// Keep shrinking and retrying until a step is accepted (or the radius
    /// bottoms out)
    #[default]
    SearchEachIteration,
    /// Evaluate a single candidate step per update; on rejection only the
    /// radius changes
    OneStepPerIteration,
}

/// Parameters for the dog-leg step controller.
#[derive(Clone, Debug)]
pub struct DogLegParams {
    /// Initial trust-region radius
    pub initial_delta: f64,
    /// Wildfire short-circuit threshold for the underlying Gauss-Newton delta
    pub wildfire_threshold: f64,
    /// Radius adaptation mode
    pub adaptation_mode: TrustRegionAdaptation,
    /// Log each trust-region iteration
    pub verbose: bool,
}

impl Default for DogLegParams {
    fn default() -> Self {
        DogLegParams {
            initial_delta: 1.0,
            wildfire_threshold: 1e-5,
            adaptation_mode: TrustRegionAdaptation::default(),
            verbose: false,
        }
    }
}

impl DogLegParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_delta(mut self, initial_delta: f64) -> Self {
        self.initial_delta = initial_delta;
        self
    }

    pub fn with_wildfire_threshold(mut self, threshold: f64) -> Self {
        self.wildfire_threshold = threshold;
        self
    }

    pub fn with_adaptation_mode(mut self, mode: TrustRegionAdaptation) -> Self {
        self.adaptation_mode = mode;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Which leg of the dog-leg path a step came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    GaussNewton,
    SteepestDescent,
    DogLeg,
}

impl Display for StepKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::GaussNewton => write!(f, "GN"),
            StepKind::SteepestDescent => write!(f, "SD"),
            StepKind::DogLeg => write!(f, "DL"),
        }
    }
}

/// Squared norm of a slot-indexed block vector.
pub(crate) fn norm_squared(v: &[DVector<f64>]) -> f64 {
    v.iter().map(|x| x.norm_squared()).sum()
}

/// The dog-leg blend of the Gauss-Newton and steepest-descent steps for a
/// given trust-region radius.
pub(crate) fn blend(
    gn: &[DVector<f64>],
    sd: &[DVector<f64>],
    radius: f64,
) -> (Vec<DVector<f64>>, StepKind) {
    let gn_norm = norm_squared(gn).sqrt();
    if gn_norm <= radius {
        return (gn.to_vec(), StepKind::GaussNewton);
    }
    let sd_norm = norm_squared(sd).sqrt();
    if sd_norm >= radius {
        let scale = radius / sd_norm;
        return (
            sd.iter().map(|x| x * scale).collect(),
            StepKind::SteepestDescent,
        );
    }

    // solve ‖sd + τ(gn − sd)‖² = Δ² with the cancellation-safe quadratic
    let diff: Vec<DVector<f64>> = gn.iter().zip(sd).map(|(g, s)| g - s).collect();
    let a = norm_squared(&diff);
    let b: f64 = sd.iter().zip(&diff).map(|(s, d)| s.dot(d)).sum();
    let c = sd_norm * sd_norm - radius * radius;
    let discriminant = (b * b - a * c).max(0.0);
    let tau = if b <= 0.0 {
        (-b + discriminant.sqrt()) / a
    } else {
        -c / (b + discriminant.sqrt())
    };
    let tau = tau.clamp(0.0, 1.0);
    let step = sd
        .iter()
        .zip(&diff)
        .map(|(s, d)| s + d * tau)
        .collect();
    (step, StepKind::DogLeg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    fn vecs(entries: &[f64]) -> Vec<DVector<f64>> {
        entries.iter().map(|&x| dvector![x]).collect()
    }

    #[test]
    fn test_full_gn_inside_region() {
        let gn = vecs(&[0.3, 0.4]);
        let sd = vecs(&[0.1, 0.1]);
        let (step, kind) = blend(&gn, &sd, 1.0);
        assert_eq!(kind, StepKind::GaussNewton);
        assert_relative_eq!(step[0][0], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_scaled_sd_outside_region() {
        let gn = vecs(&[30.0, 40.0]);
        let sd = vecs(&[3.0, 4.0]);
        let (step, kind) = blend(&gn, &sd, 1.0);
        assert_eq!(kind, StepKind::SteepestDescent);
        assert_relative_eq!(norm_squared(&step).sqrt(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dogleg_blend_on_boundary() {
        let gn = vecs(&[10.0, 0.0]);
        let sd = vecs(&[0.5, 0.5]);
        let (step, kind) = blend(&gn, &sd, 2.0);
        assert_eq!(kind, StepKind::DogLeg);
        assert_relative_eq!(norm_squared(&step).sqrt(), 2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_default_params() {
        let params = DogLegParams::default();
        assert_eq!(params.initial_delta, 1.0);
        assert_eq!(params.wildfire_threshold, 1e-5);
        assert_eq!(
            params.adaptation_mode,
            TrustRegionAdaptation::SearchEachIteration
        );
        assert!(!params.verbose);
    }
}
