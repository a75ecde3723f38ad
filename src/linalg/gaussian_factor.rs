//! Slot-addressed linear factors.
//!
//! A linear factor is either a raw Jacobian factor (stacked whitened blocks
//! and a right-hand side) or a Hessian factor (symmetric augmented information
//! matrix). Cached boundary factors come in whichever form the elimination
//! kernel that produced them works in, so both support relabeling and mutual
//! conversion.

use nalgebra::{DMatrix, DVector};

use crate::core::vector_values::Permutation;
use crate::linalg::{LinAlgError, LinAlgResult};

/// `‖Σᵢ Aᵢ Δᵢ − b‖²` with block `Aᵢ` paired with `slots[i]`.
///
/// Slot order is the column order of the blocks; no sortedness is assumed, so
/// relabeling never has to reshuffle the matrices.
#[derive(Clone, Debug)]
pub struct JacobianFactor {
    slots: Vec<usize>,
    dims: Vec<usize>,
    blocks: Vec<DMatrix<f64>>,
    b: DVector<f64>,
}

impl JacobianFactor {
    pub fn new(
        slots: Vec<usize>,
        dims: Vec<usize>,
        blocks: Vec<DMatrix<f64>>,
        b: DVector<f64>,
    ) -> LinAlgResult<Self> {
        if slots.len() != dims.len() || slots.len() != blocks.len() {
            return Err(LinAlgError::Dimension(format!(
                "{} slots, {} dims, {} blocks",
                slots.len(),
                dims.len(),
                blocks.len()
            )));
        }
        for (i, block) in blocks.iter().enumerate() {
            if block.nrows() != b.len() || block.ncols() != dims[i] {
                return Err(LinAlgError::Dimension(format!(
                    "block {i} is {}x{}, expected {}x{}",
                    block.nrows(),
                    block.ncols(),
                    b.len(),
                    dims[i]
                )));
            }
        }
        Ok(JacobianFactor {
            slots,
            dims,
            blocks,
            b,
        })
    }

    pub fn rows(&self) -> usize {
        self.b.len()
    }

    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn block(&self, i: usize) -> &DMatrix<f64> {
        &self.blocks[i]
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.b
    }

    /// Relabel slots through an old → new permutation.
    pub fn remap_slots(&mut self, perm: &Permutation) {
        for slot in &mut self.slots {
            *slot = perm.apply(*slot);
        }
    }
}

/// Symmetric augmented information form `[Λ η; ηᵀ c]` of a Gaussian factor,
/// where `Λ = AᵀA`, `η = Aᵀb`, `c = bᵀb`.
#[derive(Clone, Debug)]
pub struct HessianFactor {
    slots: Vec<usize>,
    dims: Vec<usize>,
    /// (n+1) x (n+1) with n the summed variable dimension
    info: DMatrix<f64>,
}

impl HessianFactor {
    pub fn new(slots: Vec<usize>, dims: Vec<usize>, info: DMatrix<f64>) -> LinAlgResult<Self> {
        let n: usize = dims.iter().sum();
        if info.nrows() != n + 1 || info.ncols() != n + 1 {
            return Err(LinAlgError::Dimension(format!(
                "augmented information is {}x{}, expected {}x{}",
                info.nrows(),
                info.ncols(),
                n + 1,
                n + 1
            )));
        }
        Ok(HessianFactor { slots, dims, info })
    }

    /// Outer-product form of a Jacobian factor.
    pub fn from_jacobian(factor: &JacobianFactor) -> Self {
        let n: usize = factor.dims.iter().sum();
        let mut stacked = DMatrix::zeros(factor.rows(), n + 1);
        let mut col = 0;
        for (i, block) in factor.blocks.iter().enumerate() {
            stacked.view_mut((0, col), (factor.rows(), factor.dims[i])).copy_from(block);
            col += factor.dims[i];
        }
        stacked.set_column(n, &factor.b);
        let info = stacked.transpose() * &stacked;
        HessianFactor {
            slots: factor.slots.clone(),
            dims: factor.dims.clone(),
            info,
        }
    }

    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn info(&self) -> &DMatrix<f64> {
        &self.info
    }

    /// Column offset of variable `i` inside the augmented matrix.
    pub fn offset(&self, i: usize) -> usize {
        self.dims[..i].iter().sum()
    }

    /// Relabel slots through an old → new permutation.
    pub fn remap_slots(&mut self, perm: &Permutation) {
        for slot in &mut self.slots {
            *slot = perm.apply(*slot);
        }
    }

    /// Convert back to Jacobian form via a square-root factorization of Λ.
    ///
    /// Fails with `IndefiniteLinearSystem` when Λ is not positive definite.
    pub fn to_jacobian(&self) -> LinAlgResult<JacobianFactor> {
        let n: usize = self.dims.iter().sum();
        let lambda = self.info.view((0, 0), (n, n)).into_owned();
        let eta = self.info.view((0, n), (n, 1)).into_owned();
        let chol = lambda
            .cholesky()
            .ok_or(LinAlgError::IndefiniteLinearSystem)?;
        let l = chol.l();
        let r = l.transpose();
        // Rᵀ b = η  =>  b = L⁻¹ η
        let b = l
            .solve_lower_triangular(&eta)
            .ok_or(LinAlgError::IndefiniteLinearSystem)?;
        let mut blocks = Vec::with_capacity(self.slots.len());
        let mut col = 0;
        for &dim in &self.dims {
            blocks.push(r.view((0, col), (n, dim)).into_owned());
            col += dim;
        }
        JacobianFactor::new(
            self.slots.clone(),
            self.dims.clone(),
            blocks,
            DVector::from_column_slice(b.as_slice()),
        )
    }
}

/// Either form of a linear factor.
#[derive(Clone, Debug)]
pub enum GaussianFactor {
    Jacobian(JacobianFactor),
    Hessian(HessianFactor),
}

impl GaussianFactor {
    pub fn slots(&self) -> &[usize] {
        match self {
            GaussianFactor::Jacobian(f) => f.slots(),
            GaussianFactor::Hessian(f) => f.slots(),
        }
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            GaussianFactor::Jacobian(f) => f.dims(),
            GaussianFactor::Hessian(f) => f.dims(),
        }
    }

    /// Lowest slot touched; determines where the factor hangs during
    /// elimination.
    pub fn min_slot(&self) -> Option<usize> {
        self.slots().iter().copied().min()
    }

    /// Relabel slots through an old → new permutation.
    pub fn remap_slots(&mut self, perm: &Permutation) {
        match self {
            GaussianFactor::Jacobian(f) => f.remap_slots(perm),
            GaussianFactor::Hessian(f) => f.remap_slots(perm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    fn simple_jacobian() -> JacobianFactor {
        // ‖ [2 0; 0 1] d0 + [1; 0] d1 - [4; 2] ‖²
        JacobianFactor::new(
            vec![0, 1],
            vec![2, 1],
            vec![dmatrix![2.0, 0.0; 0.0, 1.0], dmatrix![1.0; 0.0]],
            dvector![4.0, 2.0],
        )
        .unwrap()
    }

    #[test]
    fn test_jacobian_shape_validation() {
        let bad = JacobianFactor::new(
            vec![0],
            vec![2],
            vec![dmatrix![1.0, 0.0]],
            dvector![1.0, 2.0],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_hessian_from_jacobian() {
        let jf = simple_jacobian();
        let hf = HessianFactor::from_jacobian(&jf);
        // Λ[0,0] = column 0 dot column 0 = 4
        assert_relative_eq!(hf.info()[(0, 0)], 4.0, epsilon = 1e-12);
        // η = Aᵀ b: first coefficient 2*4 = 8
        assert_relative_eq!(hf.info()[(0, 3)], 8.0, epsilon = 1e-12);
        // c = bᵀb = 20
        assert_relative_eq!(hf.info()[(3, 3)], 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_hessian_jacobian_roundtrip_preserves_information() {
        let jf = simple_jacobian();
        let hf = HessianFactor::from_jacobian(&jf);
        let back = hf.to_jacobian().unwrap();
        let hf2 = HessianFactor::from_jacobian(&back);
        // Λ and η must survive the roundtrip (c may pick up the consistency
        // offset of the original system)
        for i in 0..3 {
            assert_relative_eq!(hf2.info()[(i, 3)], hf.info()[(i, 3)], epsilon = 1e-9);
            for j in 0..3 {
                assert_relative_eq!(hf2.info()[(i, j)], hf.info()[(i, j)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_remap_slots() {
        let mut f = GaussianFactor::Jacobian(simple_jacobian());
        let perm = Permutation::from_vec(vec![2, 0, 1]);
        f.remap_slots(&perm);
        assert_eq!(f.slots(), &[2, 0]);
        assert_eq!(f.min_slot(), Some(0));
    }

    #[test]
    fn test_indefinite_hessian_conversion_fails() {
        let info = dmatrix![-1.0, 0.0; 0.0, 0.0];
        let hf = HessianFactor::new(vec![0], vec![1], info).unwrap();
        assert!(matches!(
            hf.to_jacobian(),
            Err(LinAlgError::IndefiniteLinearSystem)
        ));
    }
}
