//! Prior and between factors on SE(2) poses.
//!
//! Residuals are exact local coordinates on the group; Jacobians are obtained
//! by central differences on the retraction, which keeps the measurement model
//! self-contained and is accurate far beyond the solver's tolerances.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::core::factor_graph::{LinearizedFactor, NonlinearFactor};
use crate::core::key::Key;
use crate::core::values::Values;
use crate::core::{CoreError, CoreResult};
use crate::factors::noise::DiagonalNoise;
use crate::manifold::SE2;

const NUMERIC_DIFF_STEP: f64 = 1e-6;

fn se2_value<'a>(values: &'a Values, key: &Key) -> CoreResult<&'a SE2> {
    values
        .try_get(key)?
        .as_se2()
        .ok_or(CoreError::WrongVariableKind(*key))
}

/// Central-difference Jacobian of `residual` with respect to a right tangent
/// perturbation of one pose argument.
fn numeric_jacobian<F>(residual: F) -> DMatrix<f64>
where
    F: Fn(&Vector3<f64>) -> Vector3<f64>,
{
    let mut jac = DMatrix::zeros(3, 3);
    for d in 0..3 {
        let mut xi = Vector3::zeros();
        xi[d] = NUMERIC_DIFF_STEP;
        let plus = residual(&xi);
        xi[d] = -NUMERIC_DIFF_STEP;
        let minus = residual(&xi);
        let col = (plus - minus) / (2.0 * NUMERIC_DIFF_STEP);
        jac.set_column(d, &col);
    }
    jac
}

/// Unary prior on a planar pose.
#[derive(Debug)]
pub struct Se2PriorFactor {
    keys: [Key; 1],
    prior: SE2,
    noise: DiagonalNoise,
}

impl Se2PriorFactor {
    pub fn new(key: Key, prior: SE2, noise: DiagonalNoise) -> Self {
        debug_assert_eq!(noise.dim(), SE2::DOF);
        Se2PriorFactor {
            keys: [key],
            prior,
            noise,
        }
    }

    fn residual(&self, pose: &SE2) -> Vector3<f64> {
        self.prior.local(pose)
    }
}

impl NonlinearFactor for Se2PriorFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        SE2::DOF
    }

    fn error(&self, values: &Values) -> CoreResult<f64> {
        let pose = se2_value(values, &self.keys[0])?;
        let r = DVector::from_column_slice(self.residual(pose).as_slice());
        Ok(self.noise.squared_error(&r))
    }

    fn linearize(&self, values: &Values) -> CoreResult<LinearizedFactor> {
        let pose = se2_value(values, &self.keys[0])?;
        let r = self.residual(pose);
        let jac = numeric_jacobian(|xi| self.residual(&pose.retract(xi)));
        let residual = DVector::from_column_slice(r.as_slice());
        Ok(LinearizedFactor {
            keys: self.keys.to_vec(),
            blocks: vec![self.noise.whiten_matrix(&jac)],
            b: -self.noise.whiten(&residual),
        })
    }
}

/// Relative pose constraint between two planar poses.
#[derive(Debug)]
pub struct Se2BetweenFactor {
    keys: [Key; 2],
    measured: SE2,
    noise: DiagonalNoise,
}

impl Se2BetweenFactor {
    pub fn new(key1: Key, key2: Key, measured: SE2, noise: DiagonalNoise) -> Self {
        debug_assert_eq!(noise.dim(), SE2::DOF);
        Se2BetweenFactor {
            keys: [key1, key2],
            measured,
            noise,
        }
    }

    fn residual(&self, p1: &SE2, p2: &SE2) -> Vector3<f64> {
        self.measured.local(&p1.between(p2))
    }
}

impl NonlinearFactor for Se2BetweenFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        SE2::DOF
    }

    fn error(&self, values: &Values) -> CoreResult<f64> {
        let p1 = se2_value(values, &self.keys[0])?;
        let p2 = se2_value(values, &self.keys[1])?;
        let r = DVector::from_column_slice(self.residual(p1, p2).as_slice());
        Ok(self.noise.squared_error(&r))
    }

    fn linearize(&self, values: &Values) -> CoreResult<LinearizedFactor> {
        let p1 = se2_value(values, &self.keys[0])?;
        let p2 = se2_value(values, &self.keys[1])?;
        let r = self.residual(p1, p2);
        let j1 = numeric_jacobian(|xi| self.residual(&p1.retract(xi), p2));
        let j2 = numeric_jacobian(|xi| self.residual(p1, &p2.retract(xi)));
        let residual = DVector::from_column_slice(r.as_slice());
        Ok(LinearizedFactor {
            keys: self.keys.to_vec(),
            blocks: vec![
                self.noise.whiten_matrix(&j1),
                self.noise.whiten_matrix(&j2),
            ],
            b: -self.noise.whiten(&residual),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::key;
    use crate::core::values::Value;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    #[test]
    fn test_prior_zero_at_prior() {
        let noise = DiagonalNoise::from_sigmas(dvector![0.3, 0.3, 0.1]).unwrap();
        let prior = SE2::from_xy_angle(1.0, 2.0, 0.3);
        let factor = Se2PriorFactor::new(key('x', 0), prior.clone(), noise);
        let mut values = Values::new();
        values.insert(key('x', 0), Value::Se2(prior)).unwrap();
        assert_relative_eq!(factor.error(&values).unwrap(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_between_zero_at_consistent_poses() {
        let noise = DiagonalNoise::from_sigmas(dvector![0.2, 0.2, 0.1]).unwrap();
        let factor = Se2BetweenFactor::new(
            key('x', 0),
            key('x', 1),
            SE2::from_xy_angle(2.0, 0.0, 0.0),
            noise,
        );
        let mut values = Values::new();
        values
            .insert(key('x', 0), Value::Se2(SE2::from_xy_angle(0.0, 0.0, 0.0)))
            .unwrap();
        values
            .insert(key('x', 1), Value::Se2(SE2::from_xy_angle(2.0, 0.0, 0.0)))
            .unwrap();
        assert_relative_eq!(factor.error(&values).unwrap(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_between_jacobian_matches_residual_slope() {
        let noise = DiagonalNoise::isotropic(3, 1.0).unwrap();
        let factor = Se2BetweenFactor::new(
            key('x', 0),
            key('x', 1),
            SE2::from_xy_angle(1.0, 0.5, 0.2),
            noise,
        );
        let mut values = Values::new();
        values
            .insert(key('x', 0), Value::Se2(SE2::from_xy_angle(0.1, -0.2, 0.4)))
            .unwrap();
        values
            .insert(key('x', 1), Value::Se2(SE2::from_xy_angle(1.3, 0.1, 0.5)))
            .unwrap();

        let lin = factor.linearize(&values).unwrap();
        // first-order prediction of the residual change under a perturbation
        let xi = dvector![0.001, -0.002, 0.0015];
        let mut perturbed = values.clone();
        perturbed
            .retract_in_place(&key('x', 1), xi.column(0))
            .unwrap();
        let lin2 = factor.linearize(&perturbed).unwrap();
        let predicted = -(&lin.b) + &lin.blocks[1] * &xi;
        let actual = -lin2.b;
        assert_relative_eq!(predicted, actual, epsilon = 1e-6);
    }

    #[test]
    fn test_wrong_kind_is_reported() {
        let noise = DiagonalNoise::isotropic(3, 1.0).unwrap();
        let factor = Se2PriorFactor::new(key('x', 0), SE2::identity(), noise);
        let mut values = Values::new();
        values
            .insert(key('x', 0), Value::Vector(dvector![0.0, 0.0, 0.0]))
            .unwrap();
        assert!(matches!(
            factor.error(&values),
            Err(CoreError::WrongVariableKind(_))
        ));
    }
}
