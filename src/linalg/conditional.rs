//! Gaussian conditionals: the per-clique result of variable elimination.

use nalgebra::{DMatrix, DVector};

use crate::core::vector_values::{PermutedVectorValues, Permutation};
use crate::linalg::{LinAlgError, LinAlgResult};

/// A conditional density `p(F | S)` over frontal slots F given separator
/// slots S, stored in square-root information form:
///
/// `R Δ_F + S_mat Δ_S = d`
///
/// with `R` upper triangular. Frontal blocks are ordered by elimination
/// position; separator blocks keep their column pairing under relabeling.
#[derive(Clone, Debug)]
pub struct GaussianConditional {
    frontals: Vec<usize>,
    frontal_dims: Vec<usize>,
    separator: Vec<usize>,
    separator_dims: Vec<usize>,
    r: DMatrix<f64>,
    s: DMatrix<f64>,
    d: DVector<f64>,
}

impl GaussianConditional {
    pub fn new(
        frontals: Vec<usize>,
        frontal_dims: Vec<usize>,
        separator: Vec<usize>,
        separator_dims: Vec<usize>,
        r: DMatrix<f64>,
        s: DMatrix<f64>,
        d: DVector<f64>,
    ) -> LinAlgResult<Self> {
        let fdim: usize = frontal_dims.iter().sum();
        let sdim: usize = separator_dims.iter().sum();
        if r.nrows() != fdim || r.ncols() != fdim || s.nrows() != fdim || s.ncols() != sdim {
            return Err(LinAlgError::Dimension(format!(
                "conditional blocks R {}x{}, S {}x{} do not match dims {fdim}/{sdim}",
                r.nrows(),
                r.ncols(),
                s.nrows(),
                s.ncols()
            )));
        }
        if d.len() != fdim {
            return Err(LinAlgError::Dimension(format!(
                "conditional rhs has {} rows, expected {fdim}",
                d.len()
            )));
        }
        Ok(GaussianConditional {
            frontals,
            frontal_dims,
            separator,
            separator_dims,
            r,
            s,
            d,
        })
    }

    pub fn frontals(&self) -> &[usize] {
        &self.frontals
    }

    pub fn frontal_dims(&self) -> &[usize] {
        &self.frontal_dims
    }

    pub fn separator(&self) -> &[usize] {
        &self.separator
    }

    pub fn separator_dims(&self) -> &[usize] {
        &self.separator_dims
    }

    pub fn fdim(&self) -> usize {
        self.r.nrows()
    }

    pub fn sdim(&self) -> usize {
        self.s.ncols()
    }

    pub fn rmat(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn smat(&self) -> &DMatrix<f64> {
        &self.s
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.d
    }

    /// Whether `slot` appears as a frontal or separator variable.
    pub fn involves(&self, slot: usize) -> bool {
        self.frontals.contains(&slot) || self.separator.contains(&slot)
    }

    /// Gather the separator portion of Δ into one stacked vector.
    fn gather_separator(&self, delta: &PermutedVectorValues) -> DVector<f64> {
        let mut sep = DVector::zeros(self.sdim());
        let mut off = 0;
        for (i, &slot) in self.separator.iter().enumerate() {
            let dim = self.separator_dims[i];
            sep.rows_mut(off, dim).copy_from(&delta.vector(slot));
            off += dim;
        }
        sep
    }

    /// Back-substitute: `Δ_F = R⁻¹ (d − S Δ_sep)`, reading the separator
    /// values from `delta` (already updated by ancestors).
    pub fn solve(&self, delta: &PermutedVectorValues) -> LinAlgResult<DVector<f64>> {
        let mut rhs = self.d.clone();
        if self.sdim() > 0 {
            rhs -= &self.s * self.gather_separator(delta);
        }
        self.r
            .solve_upper_triangular(&rhs)
            .ok_or(LinAlgError::SingularConditional(self.frontals[0]))
    }

    /// `R x_F + S x_S` for a slot-addressed vector `x` (used for gradient and
    /// trust-region computations).
    pub fn multiply(&self, gather: &dyn Fn(usize) -> DVector<f64>) -> DVector<f64> {
        let mut front = DVector::zeros(self.fdim());
        let mut off = 0;
        for (i, &slot) in self.frontals.iter().enumerate() {
            let dim = self.frontal_dims[i];
            front.rows_mut(off, dim).copy_from(&gather(slot));
            off += dim;
        }
        let mut out = &self.r * front;
        if self.sdim() > 0 {
            let mut sep = DVector::zeros(self.sdim());
            let mut off = 0;
            for (i, &slot) in self.separator.iter().enumerate() {
                let dim = self.separator_dims[i];
                sep.rows_mut(off, dim).copy_from(&gather(slot));
                off += dim;
            }
            out += &self.s * sep;
        }
        out
    }

    /// `0.5 ‖R x_F + S x_S − d‖²`, the clique's share of the linear-model
    /// error at `x`.
    pub fn linear_error(&self, gather: &dyn Fn(usize) -> DVector<f64>) -> f64 {
        let r = self.multiply(gather) - &self.d;
        0.5 * r.norm_squared()
    }

    /// Relabel all slots through an old → new permutation.
    pub fn permute_slots(&mut self, perm: &Permutation) {
        for slot in &mut self.frontals {
            *slot = perm.apply(*slot);
        }
        for slot in &mut self.separator {
            *slot = perm.apply(*slot);
        }
    }

    /// Relabel only the separator; returns whether any label changed.
    pub fn permute_separator(&mut self, perm: &Permutation) -> bool {
        let mut changed = false;
        for slot in &mut self.separator {
            let new = perm.apply(*slot);
            changed |= new != *slot;
            *slot = new;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    fn make_delta(entries: &[DVector<f64>]) -> PermutedVectorValues {
        let mut delta = PermutedVectorValues::new();
        for v in entries {
            let slot = delta.push_variable(v.len());
            delta.set(slot, v);
        }
        delta
    }

    #[test]
    fn test_solve_no_separator() {
        // R = [2 1; 0 1], d = [3, 1] -> x = [1, 1]
        let cond = GaussianConditional::new(
            vec![0],
            vec![2],
            vec![],
            vec![],
            dmatrix![2.0, 1.0; 0.0, 1.0],
            DMatrix::zeros(2, 0),
            dvector![3.0, 1.0],
        )
        .unwrap();
        let delta = make_delta(&[dvector![0.0, 0.0]]);
        let x = cond.solve(&delta).unwrap();
        assert_relative_eq!(x, dvector![1.0, 1.0], epsilon = 1e-12);
    }

    #[test]
    fn test_solve_with_separator() {
        // x0 given x1: 1*x0 + 0.5*x1 = 2; with x1 = 2 -> x0 = 1
        let cond = GaussianConditional::new(
            vec![0],
            vec![1],
            vec![1],
            vec![1],
            dmatrix![1.0],
            dmatrix![0.5],
            dvector![2.0],
        )
        .unwrap();
        let mut delta = make_delta(&[dvector![0.0], dvector![0.0]]);
        delta.set(1, &dvector![2.0]);
        let x = cond.solve(&delta).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_frontal_detected() {
        let cond = GaussianConditional::new(
            vec![3],
            vec![1],
            vec![],
            vec![],
            dmatrix![0.0],
            DMatrix::zeros(1, 0),
            dvector![1.0],
        )
        .unwrap();
        let delta = make_delta(&[dvector![0.0], dvector![0.0], dvector![0.0], dvector![0.0]]);
        assert!(matches!(
            cond.solve(&delta),
            Err(LinAlgError::SingularConditional(3))
        ));
    }

    #[test]
    fn test_permute_separator_reports_change() {
        let mut cond = GaussianConditional::new(
            vec![0],
            vec![1],
            vec![1],
            vec![1],
            dmatrix![1.0],
            dmatrix![0.5],
            dvector![0.0],
        )
        .unwrap();
        let identity = Permutation::identity(2);
        assert!(!cond.permute_separator(&identity));
        let swap = Permutation::from_vec(vec![1, 0]);
        assert!(cond.permute_separator(&swap));
        assert_eq!(cond.separator(), &[0]);
        // frontals untouched
        assert_eq!(cond.frontals(), &[0]);
    }
}
