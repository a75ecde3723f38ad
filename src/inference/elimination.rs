//! The elimination engine: turns a set of linear factors into Bayes-tree
//! cliques by sequential variable elimination.
//!
//! Variables are eliminated one at a time in ascending slot order. Each step
//! combines the factors hanging at the variable (original factors plus
//! residual factors passed up from earlier eliminations) into one joint
//! factor, eliminates the frontal block with the configured kernel, and passes
//! the residual factor up to the next shared variable. Maximal chains of
//! single-child conditionals are then aggregated into multifrontal cliques.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use crate::inference::clique::Clique;
use crate::linalg::conditional::GaussianConditional;
use crate::linalg::gaussian_factor::{GaussianFactor, HessianFactor, JacobianFactor};
use crate::linalg::{Factorization, LinAlgError, LinAlgResult};

/// A clique produced by elimination, with its parent expressed as an index
/// into the result vector (parents always precede children).
#[derive(Debug)]
pub struct EliminatedClique {
    pub clique: Clique,
    pub parent: Option<usize>,
}

/// Per-variable elimination record.
struct VarElim {
    slot: usize,
    dim: usize,
    /// separator slots, ascending
    sep: Vec<usize>,
    sep_dims: Vec<usize>,
    r: DMatrix<f64>,
    s: DMatrix<f64>,
    d: DVector<f64>,
    /// residual factor on `sep`, kept for the clique cache
    remainder: Option<GaussianFactor>,
}

/// Eliminate `factors` over the ascending slot sequence `elim_slots`.
///
/// Every slot a factor touches must be in `elim_slots`; `dims` maps slots to
/// tangent dimensions. Returns the new cliques with intra-result parent links.
pub fn eliminate(
    factors: Vec<GaussianFactor>,
    elim_slots: &[usize],
    dims: &HashMap<usize, usize>,
    method: Factorization,
) -> LinAlgResult<Vec<EliminatedClique>> {
    debug_assert!(elim_slots.windows(2).all(|w| w[0] < w[1]));
    if elim_slots.is_empty() {
        return Ok(Vec::new());
    }

    let position: HashMap<usize, usize> = elim_slots
        .iter()
        .enumerate()
        .map(|(pos, &slot)| (slot, pos))
        .collect();

    // factors hang at their lowest-ordered variable
    let mut buckets: Vec<Vec<GaussianFactor>> = (0..elim_slots.len()).map(|_| Vec::new()).collect();
    for factor in factors {
        let min_slot = factor.min_slot().ok_or_else(|| {
            LinAlgError::Dimension("linear factor with no variables".to_string())
        })?;
        let pos = *position.get(&min_slot).ok_or_else(|| {
            LinAlgError::Dimension(format!(
                "factor touches slot {min_slot} outside the elimination set"
            ))
        })?;
        for &slot in factor.slots() {
            if !position.contains_key(&slot) {
                return Err(LinAlgError::Dimension(format!(
                    "factor touches slot {slot} outside the elimination set"
                )));
            }
        }
        buckets[pos].push(factor);
    }

    let mut records: Vec<VarElim> = Vec::with_capacity(elim_slots.len());
    for (pos, &slot) in elim_slots.iter().enumerate() {
        let gathered = std::mem::take(&mut buckets[pos]);
        if gathered.is_empty() {
            return Err(LinAlgError::Underconstrained(slot));
        }
        trace!(
            "eliminating slot {} from {} factors ({})",
            slot,
            gathered.len(),
            method
        );
        let record = match method {
            Factorization::Qr => eliminate_one_qr(gathered, slot, dims)?,
            Factorization::Ldl => eliminate_one_ldl(gathered, slot, dims)?,
        };
        if let Some(remainder) = &record.remainder {
            let next = remainder
                .min_slot()
                .expect("residual factor always has a separator variable");
            buckets[position[&next]].push(remainder.clone());
        }
        records.push(record);
    }

    Ok(aggregate_cliques(records))
}

/// The joint variable scope of a set of factors, ascending, with the frontal
/// slot first. Returns (slots, dims, offsets, total_dim).
fn joint_scope(
    factors: &[GaussianFactor],
    front: usize,
    dims: &HashMap<usize, usize>,
) -> (Vec<usize>, Vec<usize>, HashMap<usize, usize>, usize) {
    let mut slots: Vec<usize> = factors
        .iter()
        .flat_map(|f| f.slots().iter().copied())
        .collect();
    slots.sort_unstable();
    slots.dedup();
    debug_assert_eq!(slots.first(), Some(&front));
    let scope_dims: Vec<usize> = slots.iter().map(|s| dims[s]).collect();
    let mut offsets = HashMap::with_capacity(slots.len());
    let mut off = 0;
    for (i, &slot) in slots.iter().enumerate() {
        offsets.insert(slot, off);
        off += scope_dims[i];
    }
    (slots, scope_dims, offsets, off)
}

/// Eliminate the frontal variable with Householder QR on the stacked
/// augmented Jacobian.
fn eliminate_one_qr(
    factors: Vec<GaussianFactor>,
    front: usize,
    dims: &HashMap<usize, usize>,
) -> LinAlgResult<VarElim> {
    let (slots, scope_dims, offsets, n) = joint_scope(&factors, front, dims);
    let df = dims[&front];

    // Hessian-form inputs (cached boundary factors from a symmetric
    // elimination) are converted through their square root
    let mut jacobians = Vec::with_capacity(factors.len());
    for factor in factors {
        match factor {
            GaussianFactor::Jacobian(f) => jacobians.push(f),
            GaussianFactor::Hessian(f) => jacobians.push(f.to_jacobian()?),
        }
    }

    let rows: usize = jacobians.iter().map(|f| f.rows()).sum();
    if rows < df {
        return Err(LinAlgError::Underconstrained(front));
    }
    let mut aug = DMatrix::zeros(rows, n + 1);
    let mut row = 0;
    for factor in &jacobians {
        for (i, &slot) in factor.slots().iter().enumerate() {
            let col = offsets[&slot];
            aug.view_mut((row, col), (factor.rows(), factor.dims()[i]))
                .copy_from(factor.block(i));
        }
        aug.view_mut((row, n), (factor.rows(), 1))
            .copy_from(factor.rhs());
        row += factor.rows();
    }

    let r_full = aug.qr().r();
    let rr = r_full.nrows();

    let r = r_full.view((0, 0), (df, df)).into_owned();
    let s = r_full.view((0, df), (df, n - df)).into_owned();
    let d: DVector<f64> = r_full.column(n).rows(0, df).into_owned();

    let sep = slots[1..].to_vec();
    let sep_dims = scope_dims[1..].to_vec();

    let remainder = if n > df {
        let lo = df;
        let hi = rr.min(n);
        if hi > lo {
            let mut blocks = Vec::with_capacity(sep.len());
            for &slot in &sep {
                let col = offsets[&slot];
                blocks.push(r_full.view((lo, col), (hi - lo, dims[&slot])).into_owned());
            }
            let b: DVector<f64> = r_full.column(n).rows(lo, hi - lo).into_owned();
            Some(GaussianFactor::Jacobian(JacobianFactor::new(
                sep.clone(),
                sep_dims.clone(),
                blocks,
                b,
            )?))
        } else {
            None
        }
    } else {
        None
    };

    Ok(VarElim {
        slot: front,
        dim: df,
        sep,
        sep_dims,
        r,
        s,
        d,
        remainder,
    })
}

/// Eliminate the frontal variable by a symmetric square-root factorization of
/// the frontal block of the assembled augmented information matrix.
fn eliminate_one_ldl(
    factors: Vec<GaussianFactor>,
    front: usize,
    dims: &HashMap<usize, usize>,
) -> LinAlgResult<VarElim> {
    let (slots, scope_dims, offsets, n) = joint_scope(&factors, front, dims);
    let df = dims[&front];

    // assemble the joint augmented information [Λ η; ηᵀ c]
    let mut info = DMatrix::zeros(n + 1, n + 1);
    for factor in &factors {
        let hessian = match factor {
            GaussianFactor::Hessian(f) => f.clone(),
            GaussianFactor::Jacobian(f) => HessianFactor::from_jacobian(f),
        };
        let fdims = hessian.dims().to_vec();
        let fslots = hessian.slots().to_vec();
        let local_n: usize = fdims.iter().sum();
        let local_off: Vec<usize> = {
            let mut offs = Vec::with_capacity(fslots.len() + 1);
            let mut o = 0;
            for &dim in &fdims {
                offs.push(o);
                o += dim;
            }
            offs.push(local_n);
            offs
        };
        // scatter variable-pair blocks, the η column and the constant
        for i in 0..=fslots.len() {
            let (gi, di) = if i < fslots.len() {
                (offsets[&fslots[i]], fdims[i])
            } else {
                (n, 1)
            };
            for j in 0..=fslots.len() {
                let (gj, dj) = if j < fslots.len() {
                    (offsets[&fslots[j]], fdims[j])
                } else {
                    (n, 1)
                };
                let li = if i < fslots.len() { local_off[i] } else { local_n };
                let lj = if j < fslots.len() { local_off[j] } else { local_n };
                let block = hessian.info().view((li, lj), (di, dj)).into_owned();
                let mut target = info.view_mut((gi, gj), (di, dj));
                target += block;
            }
        }
    }

    let lambda_aa = info.view((0, 0), (df, df)).into_owned();
    let chol = lambda_aa
        .cholesky()
        .ok_or(LinAlgError::IndefiniteLinearSystem)?;
    let l = chol.l();
    let r = l.transpose();

    let lambda_as = info.view((0, df), (df, n - df)).into_owned();
    let eta_a = info.view((0, n), (df, 1)).into_owned();
    let s = l
        .solve_lower_triangular(&lambda_as)
        .ok_or(LinAlgError::IndefiniteLinearSystem)?;
    let d_mat = l
        .solve_lower_triangular(&eta_a)
        .ok_or(LinAlgError::IndefiniteLinearSystem)?;
    let d = DVector::from_column_slice(d_mat.as_slice());

    let sep = slots[1..].to_vec();
    let sep_dims = scope_dims[1..].to_vec();

    let remainder = if n > df {
        // [Λ' η'; η'ᵀ c'] = trailing block minus [S d]ᵀ[S d]
        let mut trailing = info.view((df, df), (n - df + 1, n - df + 1)).into_owned();
        let mut sd = DMatrix::zeros(df, n - df + 1);
        sd.view_mut((0, 0), (df, n - df)).copy_from(&s);
        sd.set_column(n - df, &d);
        trailing -= sd.transpose() * &sd;
        Some(GaussianFactor::Hessian(HessianFactor::new(
            sep.clone(),
            sep_dims.clone(),
            trailing,
        )?))
    } else {
        None
    };

    Ok(VarElim {
        slot: front,
        dim: df,
        sep,
        sep_dims,
        r,
        s,
        d,
        remainder,
    })
}

/// Proto-clique accumulated during reverse-order aggregation.
struct ProtoClique {
    /// indices into `records`, ascending by slot
    members: Vec<usize>,
    parent: Option<usize>,
}

/// Aggregate maximal chains of single-child conditionals into multifrontal
/// cliques (standard Bayes-tree construction, processing conditionals in
/// reverse elimination order).
fn aggregate_cliques(mut records: Vec<VarElim>) -> Vec<EliminatedClique> {
    let mut protos: Vec<ProtoClique> = Vec::new();
    let mut clique_of_slot: HashMap<usize, usize> = HashMap::new();

    for idx in (0..records.len()).rev() {
        let sep = records[idx].sep.clone();
        if sep.is_empty() {
            let proto = ProtoClique {
                members: vec![idx],
                parent: None,
            };
            protos.push(proto);
            clique_of_slot.insert(records[idx].slot, protos.len() - 1);
            continue;
        }
        let host = clique_of_slot[&sep[0]];
        // merge when the conditional's parents are exactly the host clique's
        // variables: that is the maximal-chain condition
        let host_vars: Vec<usize> = protos[host]
            .members
            .iter()
            .map(|&m| records[m].slot)
            .chain(records[*protos[host].members.last().unwrap()].sep.iter().copied())
            .collect();
        if sep == host_vars {
            protos[host].members.insert(0, idx);
            clique_of_slot.insert(records[idx].slot, host);
        } else {
            let proto = ProtoClique {
                members: vec![idx],
                parent: Some(host),
            };
            protos.push(proto);
            clique_of_slot.insert(records[idx].slot, protos.len() - 1);
        }
    }

    // assemble multifrontal conditionals
    let mut result = Vec::with_capacity(protos.len());
    for proto in &protos {
        let last = *proto.members.last().unwrap();
        let sep = records[last].sep.clone();
        let sep_dims = records[last].sep_dims.clone();
        let frontals: Vec<usize> = proto.members.iter().map(|&m| records[m].slot).collect();
        let frontal_dims: Vec<usize> = proto.members.iter().map(|&m| records[m].dim).collect();
        let fdim: usize = frontal_dims.iter().sum();
        let sdim: usize = sep_dims.iter().sum();

        let mut col_of: HashMap<usize, (bool, usize)> = HashMap::new();
        let mut off = 0;
        for (i, &slot) in frontals.iter().enumerate() {
            col_of.insert(slot, (true, off));
            off += frontal_dims[i];
        }
        let mut off = 0;
        for (i, &slot) in sep.iter().enumerate() {
            col_of.insert(slot, (false, off));
            off += sep_dims[i];
        }

        let mut r = DMatrix::zeros(fdim, fdim);
        let mut s = DMatrix::zeros(fdim, sdim);
        let mut d = DVector::zeros(fdim);
        let mut row = 0;
        for &m in &proto.members {
            let record = &records[m];
            let (_, rcol) = col_of[&record.slot];
            r.view_mut((row, rcol), (record.dim, record.dim))
                .copy_from(&record.r);
            let mut col = 0;
            for (i, &sep_slot) in record.sep.iter().enumerate() {
                let dim = record.sep_dims[i];
                let block = record.s.view((0, col), (record.dim, dim));
                match col_of[&sep_slot] {
                    (true, c) => r.view_mut((row, c), (record.dim, dim)).copy_from(&block),
                    (false, c) => s.view_mut((row, c), (record.dim, dim)).copy_from(&block),
                }
                col += dim;
            }
            d.rows_mut(row, record.dim).copy_from(&record.d);
            row += record.dim;
        }

        let conditional = GaussianConditional::new(
            frontals,
            frontal_dims,
            sep,
            sep_dims,
            r,
            s,
            d,
        )
        .expect("clique assembly produces consistent dimensions");
        let cached = records[last].remainder.take();
        result.push(EliminatedClique {
            clique: Clique::new(conditional, cached),
            parent: proto.parent,
        });
    }
    result
}
