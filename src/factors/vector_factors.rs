//! Prior and between factors on vector-space variables.
//!
//! These are linear measurements, so their Jacobians are constant and a single
//! Gauss-Newton step lands on the exact solution.

use nalgebra::{DMatrix, DVector};

use crate::core::factor_graph::{LinearizedFactor, NonlinearFactor};
use crate::core::key::Key;
use crate::core::values::Values;
use crate::core::{CoreError, CoreResult};
use crate::factors::noise::DiagonalNoise;

fn vector_value<'a>(values: &'a Values, key: &Key) -> CoreResult<&'a DVector<f64>> {
    values
        .try_get(key)?
        .as_vector()
        .ok_or(CoreError::WrongVariableKind(*key))
}

/// Unary prior `x ≈ prior` with diagonal Gaussian noise.
#[derive(Debug)]
pub struct PriorFactor {
    keys: [Key; 1],
    prior: DVector<f64>,
    noise: DiagonalNoise,
}

impl PriorFactor {
    pub fn new(key: Key, prior: DVector<f64>, noise: DiagonalNoise) -> Self {
        debug_assert_eq!(prior.len(), noise.dim());
        PriorFactor {
            keys: [key],
            prior,
            noise,
        }
    }
}

impl NonlinearFactor for PriorFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        self.prior.len()
    }

    fn error(&self, values: &Values) -> CoreResult<f64> {
        let x = vector_value(values, &self.keys[0])?;
        Ok(self.noise.squared_error(&(x - &self.prior)))
    }

    fn linearize(&self, values: &Values) -> CoreResult<LinearizedFactor> {
        let x = vector_value(values, &self.keys[0])?;
        let residual = x - &self.prior;
        let a = self
            .noise
            .whiten_matrix(&DMatrix::identity(self.dim(), self.dim()));
        Ok(LinearizedFactor {
            keys: self.keys.to_vec(),
            blocks: vec![a],
            b: -self.noise.whiten(&residual),
        })
    }
}

/// Binary relative constraint `x2 − x1 ≈ measured` with diagonal Gaussian
/// noise.
#[derive(Debug)]
pub struct BetweenFactor {
    keys: [Key; 2],
    measured: DVector<f64>,
    noise: DiagonalNoise,
}

impl BetweenFactor {
    pub fn new(key1: Key, key2: Key, measured: DVector<f64>, noise: DiagonalNoise) -> Self {
        debug_assert_eq!(measured.len(), noise.dim());
        BetweenFactor {
            keys: [key1, key2],
            measured,
            noise,
        }
    }
}

impl NonlinearFactor for BetweenFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        self.measured.len()
    }

    fn error(&self, values: &Values) -> CoreResult<f64> {
        let x1 = vector_value(values, &self.keys[0])?;
        let x2 = vector_value(values, &self.keys[1])?;
        Ok(self.noise.squared_error(&(x2 - x1 - &self.measured)))
    }

    fn linearize(&self, values: &Values) -> CoreResult<LinearizedFactor> {
        let x1 = vector_value(values, &self.keys[0])?;
        let x2 = vector_value(values, &self.keys[1])?;
        let residual = x2 - x1 - &self.measured;
        let n = self.dim();
        let a1 = self.noise.whiten_matrix(&(-DMatrix::identity(n, n)));
        let a2 = self.noise.whiten_matrix(&DMatrix::identity(n, n));
        Ok(LinearizedFactor {
            keys: self.keys.to_vec(),
            blocks: vec![a1, a2],
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

    fn values_with(entries: &[(Key, DVector<f64>)]) -> Values {
        let mut values = Values::new();
        for (k, v) in entries {
            values.insert(*k, Value::Vector(v.clone())).unwrap();
        }
        values
    }

    #[test]
    fn test_prior_zero_error_at_prior() {
        let noise = DiagonalNoise::isotropic(2, 0.1).unwrap();
        let factor = PriorFactor::new(key('x', 0), dvector![1.0, 2.0], noise);
        let values = values_with(&[(key('x', 0), dvector![1.0, 2.0])]);
        assert_relative_eq!(factor.error(&values).unwrap(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_prior_linearization_is_whitened() {
        let noise = DiagonalNoise::isotropic(2, 0.5).unwrap();
        let factor = PriorFactor::new(key('x', 0), dvector![0.0, 0.0], noise);
        let values = values_with(&[(key('x', 0), dvector![1.0, 0.0])]);
        let lin = factor.linearize(&values).unwrap();
        assert_eq!(lin.keys, vec![key('x', 0)]);
        assert_relative_eq!(lin.blocks[0][(0, 0)], 2.0, epsilon = 1e-12);
        // b = -whitened residual = -(1.0 / 0.5)
        assert_relative_eq!(lin.b[0], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_between_residual() {
        let noise = DiagonalNoise::isotropic(2, 1.0).unwrap();
        let factor = BetweenFactor::new(key('x', 0), key('x', 1), dvector![2.0, 0.0], noise);
        let values = values_with(&[
            (key('x', 0), dvector![0.0, 0.0]),
            (key('x', 1), dvector![2.0, 0.0]),
        ]);
        assert_relative_eq!(factor.error(&values).unwrap(), 0.0, epsilon = 1e-15);

        let lin = factor.linearize(&values).unwrap();
        assert_relative_eq!(lin.blocks[0][(0, 0)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(lin.blocks[1][(0, 0)], 1.0, epsilon = 1e-12);
    }
}
