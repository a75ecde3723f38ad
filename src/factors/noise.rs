//! Diagonal Gaussian noise model.

use nalgebra::{DMatrix, DVector};

use crate::core::{CoreError, CoreResult};

/// A diagonal Gaussian noise model, stored as inverse sigmas so whitening is a
/// row scaling.
#[derive(Clone, Debug)]
pub struct DiagonalNoise {
    inv_sigmas: DVector<f64>,
}

impl DiagonalNoise {
    /// Build from per-dimension standard deviations. All sigmas must be
    /// strictly positive.
    pub fn from_sigmas(sigmas: DVector<f64>) -> CoreResult<Self> {
        if sigmas.is_empty() {
            return Err(CoreError::InvalidInput(
                "noise model needs at least one sigma".to_string(),
            ));
        }
        if sigmas.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(CoreError::InvalidInput(format!(
                "sigmas must be positive and finite, got {sigmas:?}"
            )));
        }
        Ok(DiagonalNoise {
            inv_sigmas: sigmas.map(|s| 1.0 / s),
        })
    }

    /// Isotropic model: the same sigma for every dimension.
    pub fn isotropic(dim: usize, sigma: f64) -> CoreResult<Self> {
        Self::from_sigmas(DVector::from_element(dim, sigma))
    }

    pub fn dim(&self) -> usize {
        self.inv_sigmas.len()
    }

    /// Whitened residual `Σ^{-1/2} r`.
    pub fn whiten(&self, residual: &DVector<f64>) -> DVector<f64> {
        residual.component_mul(&self.inv_sigmas)
    }

    /// Row-scale a Jacobian block by the inverse sigmas.
    pub fn whiten_matrix(&self, jacobian: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = jacobian.clone();
        for (i, mut row) in out.row_iter_mut().enumerate() {
            row *= self.inv_sigmas[i];
        }
        out
    }

    /// `0.5 ‖Σ^{-1/2} r‖²`.
    pub fn squared_error(&self, residual: &DVector<f64>) -> f64 {
        let w = self.whiten(residual);
        0.5 * w.norm_squared()
    }
}
