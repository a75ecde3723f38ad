//! A node of the Bayes tree.

use nalgebra::DVector;

use crate::core::vector_values::Permutation;
use crate::linalg::conditional::GaussianConditional;
use crate::linalg::gaussian_factor::GaussianFactor;

/// A Bayes-tree clique: a Gaussian conditional on its frontal variables given
/// its separator, the cached residual factor produced as a side effect of
/// elimination, and the clique's contribution to the whole-tree gradient.
///
/// The cached factor is the joint factor on the separator that re-combining
/// all of this clique's descendants would reproduce; it serves as the boundary
/// factor when the subtree below a detachment cut is summarized instead of
/// re-eliminated.
#[derive(Clone, Debug)]
pub struct Clique {
    conditional: GaussianConditional,
    cached_factor: Option<GaussianFactor>,
    gradient_contribution: DVector<f64>,
}

impl Clique {
    /// Build a clique from an elimination result. The gradient contribution
    /// `[−Rᵀd; −Sᵀd]` is computed once here and never mutated.
    pub fn new(conditional: GaussianConditional, cached_factor: Option<GaussianFactor>) -> Self {
        let d = conditional.rhs();
        let mut gradient = DVector::zeros(conditional.fdim() + conditional.sdim());
        gradient
            .rows_mut(0, conditional.fdim())
            .copy_from(&(-(conditional.rmat().transpose()) * d));
        if conditional.sdim() > 0 {
            gradient
                .rows_mut(conditional.fdim(), conditional.sdim())
                .copy_from(&(-(conditional.smat().transpose()) * d));
        }
        Clique {
            conditional,
            cached_factor,
            gradient_contribution: gradient,
        }
    }

    pub fn conditional(&self) -> &GaussianConditional {
        &self.conditional
    }

    pub fn cached_factor(&self) -> Option<&GaussianFactor> {
        self.cached_factor.as_ref()
    }

    pub fn frontals(&self) -> &[usize] {
        self.conditional.frontals()
    }

    pub fn separator(&self) -> &[usize] {
        self.conditional.separator()
    }

    /// Whether `slot` appears anywhere in this clique.
    pub fn involves(&self, slot: usize) -> bool {
        self.conditional.involves(slot)
    }

    /// Concatenation of `−Rᵀd` (frontal columns) and `−Sᵀd` (separator
    /// columns); summing these per-clique vectors into the right slots yields
    /// the whole-tree gradient at Δ = 0.
    pub fn gradient_contribution(&self) -> &DVector<f64> {
        &self.gradient_contribution
    }

    /// Deep copy (all storage is owned, so `Clone` already is one).
    pub fn clone_deep(&self) -> Self {
        self.clone()
    }

    /// Rewrite frontal and separator slot labels through the supplied
    /// permutation; the cached factor is relabeled with it as well.
    pub fn permute_with_inverse(&mut self, perm: &Permutation) {
        self.conditional.permute_slots(perm);
        if let Some(cached) = &mut self.cached_factor {
            cached.remap_slots(perm);
        }
    }

    /// As `permute_with_inverse` but only touching the separator; returns
    /// whether anything changed (in which case the cached factor was also
    /// relabeled).
    pub fn permute_separator_with_inverse(&mut self, perm: &Permutation) -> bool {
        let changed = self.conditional.permute_separator(perm);
        if changed && let Some(cached) = &mut self.cached_factor {
            cached.remap_slots(perm);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, dmatrix, dvector};

    fn test_clique() -> Clique {
        let conditional = GaussianConditional::new(
            vec![0],
            vec![1],
            vec![1],
            vec![1],
            dmatrix![2.0],
            dmatrix![0.5],
            dvector![4.0],
        )
        .unwrap();
        Clique::new(conditional, None)
    }

    #[test]
    fn test_gradient_contribution() {
        let clique = test_clique();
        let g = clique.gradient_contribution();
        // [-Rᵀ d; -Sᵀ d] = [-8, -2]
        assert_relative_eq!(g[0], -8.0, epsilon = 1e-12);
        assert_relative_eq!(g[1], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_permute_relabels_everything() {
        let mut clique = test_clique();
        let perm = Permutation::from_vec(vec![3, 0, 1, 2]);
        clique.permute_with_inverse(&perm);
        assert_eq!(clique.frontals(), &[3]);
        assert_eq!(clique.separator(), &[0]);
    }

    #[test]
    fn test_permute_separator_only() {
        let mut clique = test_clique();
        let perm = Permutation::from_vec(vec![0, 2, 1]);
        let changed = clique.permute_separator_with_inverse(&perm);
        assert!(changed);
        assert_eq!(clique.frontals(), &[0]);
        assert_eq!(clique.separator(), &[2]);
    }

    #[test]
    fn test_root_clique_gradient_has_no_separator_part() {
        let conditional = GaussianConditional::new(
            vec![5],
            vec![2],
            vec![],
            vec![],
            dmatrix![1.0, 0.0; 0.0, 1.0],
            DMatrix::zeros(2, 0),
            dvector![1.0, -1.0],
        )
        .unwrap();
        let clique = Clique::new(conditional, None);
        assert_eq!(clique.gradient_contribution().len(), 2);
        assert_relative_eq!(clique.gradient_contribution()[0], -1.0, epsilon = 1e-12);
    }
}
