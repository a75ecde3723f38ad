//! Wildfire back-substitution: partial, threshold-short-circuited solving of
//! the Bayes tree.
//!
//! Starting at the roots, each clique's frontal delta is recomputed from the
//! (already updated) separator values. If no slot of the clique is marked
//! stale and the recomputed frontal values differ from the stored ones by at
//! most the threshold in max-norm, the whole subtree below is skipped: its
//! stored delta entries are still faithful within the threshold.

use nalgebra::DVector;

use crate::core::vector_values::PermutedVectorValues;
use crate::inference::bayes_tree::BayesTree;
use crate::optimizer::{OptimizerError, OptimizerResult};

/// Refresh `delta` by partial back-substitution over the tree.
///
/// `replaced` marks slots whose clique was re-eliminated since the last
/// refresh; those cliques are always recomputed and the flag cleared.
/// `force_full` disables the short-circuit entirely (used for the best
/// estimate). Returns the number of variables actually recomputed.
pub fn optimize_wildfire(
    tree: &BayesTree,
    threshold: f64,
    force_full: bool,
    replaced: &mut [bool],
    delta: &mut PermutedVectorValues,
) -> OptimizerResult<usize> {
    let mut recomputed = 0;
    let mut stack: Vec<usize> = tree.roots().to_vec();
    while let Some(id) = stack.pop() {
        let clique = tree.clique(id);
        let conditional = clique.conditional();
        let new_front = conditional.solve(delta)?;
        if new_front.iter().any(|x| !x.is_finite()) {
            return Err(OptimizerError::NumericalOverflow.log());
        }

        let any_replaced = conditional
            .frontals()
            .iter()
            .any(|&slot| replaced[slot]);

        // max-norm change against the stored frontal values
        let mut diff: f64 = 0.0;
        let mut offset = 0;
        for (i, &slot) in conditional.frontals().iter().enumerate() {
            let dim = conditional.frontal_dims()[i];
            let old = delta.vector(slot);
            for d in 0..dim {
                diff = diff.max((new_front[offset + d] - old[d]).abs());
            }
            offset += dim;
        }

        if !force_full && !any_replaced && diff <= threshold {
            // inputs have not moved enough; the subtree keeps its delta
            continue;
        }

        let mut offset = 0;
        for (i, &slot) in conditional.frontals().iter().enumerate() {
            let dim = conditional.frontal_dims()[i];
            let block = DVector::from_column_slice(&new_front.as_slice()[offset..offset + dim]);
            delta.set(slot, &block);
            replaced[slot] = false;
            offset += dim;
        }
        recomputed += conditional.frontals().len();
        stack.extend(tree.children(id).iter().copied());
    }
    Ok(recomputed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::clique::Clique;
    use crate::linalg::conditional::GaussianConditional;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, dmatrix, dvector};

    /// Chain of scalar cliques: root solves x2 = 2, each child solves
    /// x_i = x_{i+1} / 2.
    fn chain_tree() -> BayesTree {
        let mut tree = BayesTree::new();
        let root = tree.insert(
            Clique::new(
                GaussianConditional::new(
                    vec![2],
                    vec![1],
                    vec![],
                    vec![],
                    dmatrix![1.0],
                    DMatrix::zeros(1, 0),
                    dvector![2.0],
                )
                .unwrap(),
                None,
            ),
            None,
        );
        let mid = tree.insert(
            Clique::new(
                GaussianConditional::new(
                    vec![1],
                    vec![1],
                    vec![2],
                    vec![1],
                    dmatrix![1.0],
                    dmatrix![-0.5],
                    dvector![0.0],
                )
                .unwrap(),
                None,
            ),
            Some(root),
        );
        tree.insert(
            Clique::new(
                GaussianConditional::new(
                    vec![0],
                    vec![1],
                    vec![1],
                    vec![1],
                    dmatrix![1.0],
                    dmatrix![-0.5],
                    dvector![0.0],
                )
                .unwrap(),
                None,
            ),
            Some(mid),
        );
        tree
    }

    fn fresh_delta(n: usize) -> PermutedVectorValues {
        let mut delta = PermutedVectorValues::new();
        for _ in 0..n {
            delta.push_variable(1);
        }
        delta
    }

    #[test]
    fn test_full_solve_from_scratch() {
        let tree = chain_tree();
        let mut delta = fresh_delta(3);
        let mut replaced = vec![true; 3];
        let count = optimize_wildfire(&tree, 0.001, false, &mut replaced, &mut delta).unwrap();
        assert_eq!(count, 3);
        assert_relative_eq!(delta.vector(2)[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(delta.vector(1)[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(delta.vector(0)[0], 0.5, epsilon = 1e-12);
        assert!(replaced.iter().all(|&r| !r));
    }

    #[test]
    fn test_short_circuit_skips_converged_subtree() {
        let tree = chain_tree();
        let mut delta = fresh_delta(3);
        let mut replaced = vec![true; 3];
        optimize_wildfire(&tree, 0.001, false, &mut replaced, &mut delta).unwrap();

        // second pass: nothing replaced, nothing moved -> only the root is
        // inspected and nothing recomputed
        let count = optimize_wildfire(&tree, 0.001, false, &mut replaced, &mut delta).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_replaced_mask_forces_recompute() {
        let tree = chain_tree();
        let mut delta = fresh_delta(3);
        let mut replaced = vec![true; 3];
        optimize_wildfire(&tree, 0.001, false, &mut replaced, &mut delta).unwrap();

        replaced[2] = true;
        let count = optimize_wildfire(&tree, 0.001, false, &mut replaced, &mut delta).unwrap();
        // the root is recomputed; its value does not move, so children stay
        assert_eq!(count, 1);
        assert!(!replaced[2]);
    }

    #[test]
    fn test_force_full_visits_everything() {
        let tree = chain_tree();
        let mut delta = fresh_delta(3);
        let mut replaced = vec![false; 3];
        let count = optimize_wildfire(&tree, 1e9, true, &mut replaced, &mut delta).unwrap();
        assert_eq!(count, 3);
        assert_relative_eq!(delta.vector(0)[0], 0.5, epsilon = 1e-12);
    }
}
