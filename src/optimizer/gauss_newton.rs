//! Gauss-Newton step selection.
//!
//! Under Gauss-Newton the wildfire-refreshed linear delta *is* the step: the
//! linear system solved by the Bayes tree is trusted verbatim, which gives
//! fast convergence on well-conditioned problems at the cost of no step-size
//! control. The only knob is the wildfire threshold governing how much of the
//! tree the back-substitution revisits.

/// Parameters for the Gauss-Newton step controller.
#[derive(Clone, Debug)]
pub struct GaussNewtonParams {
    /// Continue back-substitution only where the delta changes by more than
    /// this threshold
    pub wildfire_threshold: f64,
}

impl Default for GaussNewtonParams {
    fn default() -> Self {
        GaussNewtonParams {
            wildfire_threshold: 0.001,
        }
    }
}

impl GaussNewtonParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wildfire_threshold(mut self, threshold: f64) -> Self {
        self.wildfire_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threshold() {
        let params = GaussNewtonParams::default();
        assert_eq!(params.wildfire_threshold, 0.001);
    }

    #[test]
    fn test_builder() {
        let params = GaussNewtonParams::new().with_wildfire_threshold(0.5);
        assert_eq!(params.wildfire_threshold, 0.5);
    }
}
