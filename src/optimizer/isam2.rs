//! The incremental smoother: Bayes-tree maintenance with fluid
//! relinearization.
//!
//! `update` runs one step of the incremental algorithm:
//!
//! 1. absorb new variables and factors,
//! 2. decide which variables to relinearize (their delta outgrew the local
//!    linear model),
//! 3. mark everything from the observed and relinearized variables up to the
//!    root, detach that top, and harvest boundary factors from the orphaned
//!    subtrees,
//! 4. re-order the affected variables with a fill-reducing ordering and
//!    re-eliminate them into new cliques, reattaching the orphans below,
//! 5. refresh the linear delta by wildfire back-substitution and let the
//!    configured step controller (Gauss-Newton or dog-leg) pick the step.
//!
//! The call is transactional: on any failure the previous state (values,
//! ordering, tree, delta, counters) is restored before the error surfaces.

use std::cell::{Cell, Ref, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::core::factor_graph::{LinearizedFactor, NonlinearFactor, NonlinearFactorGraph};
use crate::core::key::Key;
use crate::core::ordering::{Ordering, fill_reducing_ordering};
use crate::core::values::{Value, Values};
use crate::core::variable_index::VariableIndex;
use crate::core::vector_values::PermutedVectorValues;
use crate::core::CoreError;
use crate::error::CrestResult;
use crate::inference::bayes_tree::{BayesTree, DetachResult};
use crate::inference::elimination::eliminate;
use crate::inference::InferenceError;
use crate::linalg::gaussian_factor::{GaussianFactor, JacobianFactor};
use crate::linalg::{Factorization, LinAlgError};
use crate::optimizer::dog_leg::{self, DogLegParams, TrustRegionAdaptation};
use crate::optimizer::wildfire::optimize_wildfire;
use crate::optimizer::{
    DetailedResults, Isam2Params, OptimizationParams, OptimizerError, UpdateResult,
    VariableStatus, relinearize,
};

/// The cached linear solution, behind interior mutability so that read-only
/// accessors can refresh it lazily. Callers must serialize reads and writes
/// externally; an `Isam2` instance is not thread-safe.
#[derive(Clone, Debug, Default)]
struct DeltaState {
    /// Gauss-Newton delta, maintained by wildfire back-substitution
    newton: PermutedVectorValues,
    /// The currently applied step under dog-leg; `None` under Gauss-Newton
    /// (where the Newton delta is the step)
    step: Option<PermutedVectorValues>,
    /// Per-slot staleness: true while a slot's clique was re-eliminated but
    /// its delta entry not yet recomputed
    replaced: Vec<bool>,
    up_to_date: bool,
}

impl DeltaState {
    fn current(&self) -> &PermutedVectorValues {
        self.step.as_ref().unwrap_or(&self.newton)
    }

    fn push_variable(&mut self, dim: usize) -> usize {
        let slot = self.newton.push_variable(dim);
        if let Some(step) = &mut self.step {
            step.push_variable(dim);
        }
        self.replaced.push(true);
        slot
    }

    fn permute(&mut self, perm: &crate::core::vector_values::Permutation) {
        self.newton.permute(perm);
        if let Some(step) = &mut self.step {
            step.permute(perm);
        }
        let mut replaced = vec![false; self.replaced.len()];
        for (old, &flag) in self.replaced.iter().enumerate() {
            replaced[perm.apply(old)] = flag;
        }
        self.replaced = replaced;
    }
}

/// Snapshot for transactional rollback.
struct Checkpoint {
    theta: Values,
    variable_index: VariableIndex,
    ordering: Ordering,
    tree: BayesTree,
    state: DeltaState,
    linear_cache: Vec<Option<LinearizedFactor>>,
    update_count: usize,
    dogleg_radius: f64,
    factors_len: usize,
}

/// Factor-graph mutations performed by the current update, kept so a failed
/// update can undo them (boxed factors are not cloneable).
#[derive(Default)]
struct TxLog {
    removed: Vec<(usize, Box<dyn NonlinearFactor>)>,
}

/// Incremental nonlinear least-squares smoother over a Bayes tree.
pub struct Isam2 {
    params: Isam2Params,
    theta: Values,
    factors: NonlinearFactorGraph,
    linear_cache: Vec<Option<LinearizedFactor>>,
    variable_index: VariableIndex,
    ordering: Ordering,
    tree: BayesTree,
    state: RefCell<DeltaState>,
    update_count: usize,
    dogleg_radius: f64,
    last_backsub_count: Cell<usize>,
}

impl Isam2 {
    /// Create an empty smoother with the given parameters.
    pub fn new(params: Isam2Params) -> Self {
        let dogleg_radius = match &params.optimization {
            OptimizationParams::DogLeg(dl) => dl.initial_delta,
            OptimizationParams::GaussNewton(_) => 0.0,
        };
        Isam2 {
            params,
            theta: Values::new(),
            factors: NonlinearFactorGraph::new(),
            linear_cache: Vec::new(),
            variable_index: VariableIndex::new(),
            ordering: Ordering::new(),
            tree: BayesTree::new(),
            state: RefCell::new(DeltaState::default()),
            update_count: 0,
            dogleg_radius,
            last_backsub_count: Cell::new(0),
        }
    }

    /// Add new factors and variables, relinearize and re-eliminate as needed,
    /// and refresh the solution.
    ///
    /// `new_theta` must contain exactly the keys introduced by `new_factors`
    /// that are not already in the system. `remove_factor_indices` tombstones
    /// previously returned factor indices. `constrained_keys` forces the named
    /// variables to be eliminated last (root-adjacent). `force_relinearize`
    /// bypasses the relinearization interval.
    pub fn update(
        &mut self,
        new_factors: Vec<Box<dyn NonlinearFactor>>,
        new_theta: Values,
        remove_factor_indices: &[usize],
        constrained_keys: Option<Vec<Key>>,
        force_relinearize: bool,
    ) -> CrestResult<UpdateResult> {
        self.check_preconditions(&new_factors, &new_theta, remove_factor_indices, &constrained_keys)?;
        let checkpoint = self.checkpoint();
        let mut tx = TxLog::default();
        match self.update_inner(
            new_factors,
            new_theta,
            remove_factor_indices,
            constrained_keys,
            force_relinearize,
            &mut tx,
        ) {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!("update failed, rolling back: {err}");
                self.restore(checkpoint, tx);
                Err(err)
            }
        }
    }

    // Validations that must not mutate any state.
    fn check_preconditions(
        &self,
        new_factors: &[Box<dyn NonlinearFactor>],
        new_theta: &Values,
        remove_factor_indices: &[usize],
        constrained_keys: &Option<Vec<Key>>,
    ) -> CrestResult<()> {
        for key in new_theta.keys() {
            if self.theta.contains(key) {
                return Err(OptimizerError::Precondition(format!(
                    "new values contain variable {key} which already has a value"
                ))
                .into());
            }
        }
        let mut introduced: BTreeSet<Key> = BTreeSet::new();
        for factor in new_factors {
            for key in factor.keys() {
                if !self.theta.contains(key) && !new_theta.contains(key) {
                    return Err(OptimizerError::Precondition(format!(
                        "new factor introduces variable {key} with no initial value"
                    ))
                    .into());
                }
                if !self.theta.contains(key) {
                    introduced.insert(*key);
                }
            }
        }
        for key in new_theta.keys() {
            if !introduced.contains(key) {
                return Err(OptimizerError::Precondition(format!(
                    "new values contain variable {key} not referenced by any new factor"
                ))
                .into());
            }
        }
        let mut seen = HashSet::new();
        for &index in remove_factor_indices {
            if !self.factors.contains(index) {
                return Err(OptimizerError::Precondition(format!(
                    "cannot remove factor {index}: unknown or already removed"
                ))
                .into());
            }
            if !seen.insert(index) {
                return Err(OptimizerError::Precondition(format!(
                    "factor index {index} listed twice for removal"
                ))
                .into());
            }
        }
        if let Some(keys) = constrained_keys {
            for key in keys {
                if !self.theta.contains(key) && !new_theta.contains(key) {
                    return Err(OptimizerError::Precondition(format!(
                        "constrained variable {key} is unknown"
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            theta: self.theta.clone(),
            variable_index: self.variable_index.clone(),
            ordering: self.ordering.clone(),
            tree: self.tree.clone(),
            state: self.state.borrow().clone(),
            linear_cache: self.linear_cache.clone(),
            update_count: self.update_count,
            dogleg_radius: self.dogleg_radius,
            factors_len: self.factors.len(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint, tx: TxLog) {
        self.theta = checkpoint.theta;
        self.variable_index = checkpoint.variable_index;
        self.ordering = checkpoint.ordering;
        self.tree = checkpoint.tree;
        *self.state.get_mut() = checkpoint.state;
        self.linear_cache = checkpoint.linear_cache;
        self.update_count = checkpoint.update_count;
        self.dogleg_radius = checkpoint.dogleg_radius;
        self.factors.truncate(checkpoint.factors_len);
        for (index, factor) in tx.removed {
            self.factors.reinsert(index, factor);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn update_inner(
        &mut self,
        new_factors: Vec<Box<dyn NonlinearFactor>>,
        new_theta: Values,
        remove_factor_indices: &[usize],
        constrained_keys: Option<Vec<Key>>,
        force_relinearize: bool,
        tx: &mut TxLog,
    ) -> CrestResult<UpdateResult> {
        let mut state = std::mem::take(self.state.get_mut());
        self.update_count += 1;

        // 1. absorb new variables: values, slots, delta storage
        let new_keys: BTreeSet<Key> = new_theta.keys().copied().collect();
        let mut new_slots: BTreeSet<usize> = BTreeSet::new();
        for (key, value) in new_theta.iter() {
            let dim = value.dim();
            self.variable_index.add_variable(*key, dim)?;
            let slot = self.ordering.push(*key);
            let delta_slot = state.push_variable(dim);
            debug_assert_eq!(slot, delta_slot);
            new_slots.insert(slot);
        }
        self.theta.extend(new_theta)?;

        // 2. register new factors, tombstone removals
        let mut observed_keys: BTreeSet<Key> = BTreeSet::new();
        let mut new_factors_indices = Vec::with_capacity(new_factors.len());
        for factor in new_factors {
            let keys = factor.keys().to_vec();
            let index = self.factors.add(factor);
            self.linear_cache.push(None);
            self.variable_index.augment(index, &keys)?;
            observed_keys.extend(keys);
            new_factors_indices.push(index);
        }
        for &index in remove_factor_indices {
            let factor = self.factors.remove(index)?;
            self.variable_index.remove(index, factor.keys());
            self.linear_cache[index] = None;
            observed_keys.extend(factor.keys().iter().copied());
            tx.removed.push((index, factor));
        }

        let error_before = if self.params.evaluate_nonlinear_error {
            self.refresh_newton(&mut state, false)?;
            Some(self.factors.error(&self.retract_by(state.current()))?)
        } else {
            None
        };

        // 4. fluid relinearization decision
        let relinearize_due = self.params.enable_relinearization
            && !self.tree.is_empty()
            && (force_relinearize
                || (self.params.relinearize_skip > 0
                    && self.update_count % self.params.relinearize_skip == 0));
        let mut relin_keys: Vec<Key> = Vec::new();
        if relinearize_due {
            self.refresh_newton(&mut state, false)?;
            relin_keys = relinearize::check_relinearization(
                state.current(),
                &self.ordering,
                &self.params.relinearize_threshold,
            );
            relin_keys.retain(|k| !new_keys.contains(k));
        }
        let relin_key_set: BTreeSet<Key> = relin_keys.iter().copied().collect();

        // 5. mark: observed ∪ relinearize-involved ∪ constrained, closed
        // under taking ancestors
        let mut marked: BTreeSet<usize> = BTreeSet::new();
        let observed_slots: Vec<usize> = observed_keys
            .iter()
            .filter_map(|k| self.ordering.slot(k))
            .collect();
        self.tree.mark_ancestors(observed_slots.iter(), &mut marked);

        let mut relin_involved_keys: BTreeSet<Key> = BTreeSet::new();
        if !relin_key_set.is_empty() {
            let relin_slots: BTreeSet<usize> = relin_key_set
                .iter()
                .filter_map(|k| self.ordering.slot(k))
                .collect();
            let mut involved_slots: BTreeSet<usize> = BTreeSet::new();
            for id in self.tree.involved_cliques(&relin_slots) {
                involved_slots.extend(self.tree.clique(id).frontals().iter().copied());
            }
            for &slot in &involved_slots {
                relin_involved_keys.insert(self.ordering.key(slot));
            }
            self.tree.mark_ancestors(involved_slots.iter(), &mut marked);
        }
        if let Some(keys) = &constrained_keys {
            let slots: Vec<usize> = keys.iter().filter_map(|k| self.ordering.slot(k)).collect();
            self.tree.mark_ancestors(slots.iter(), &mut marked);
        }

        let mut affected_keys: BTreeSet<Key> = BTreeSet::new();
        let mut reeliminated = 0usize;

        if !marked.is_empty() {
            // 6. orphan the top of the tree
            let detach = self.tree.detach_top(&marked);
            let mut affected_slots: BTreeSet<usize> = detach.removed_frontals.clone();
            affected_slots.extend(new_slots.iter().copied());
            affected_keys = affected_slots
                .iter()
                .map(|&s| self.ordering.key(s))
                .collect();
            reeliminated = affected_slots.len();
            debug!(
                "update {}: {} marked, {} cliques removed, {} orphans, {} variables to re-eliminate",
                self.update_count,
                marked.len(),
                detach.removed_count,
                detach.orphans.len(),
                reeliminated
            );

            // fold the relinearized variables' applied deltas into the values
            for key in &relin_keys {
                let slot = self.ordering.slot(key).expect("relin key has a slot");
                let step = state.current().vector(slot).into_owned();
                self.theta.retract_in_place(key, step.column(0))?;
                state.newton.set_zero(slot);
                if let Some(dl_step) = &mut state.step {
                    dl_step.set_zero(slot);
                }
            }

            // 7. gather the factors to re-eliminate, in key space
            let local_factors =
                self.gather_local_factors(&affected_keys, &relin_key_set)?;

            // 8. local fill-reducing ordering; observed and new variables are
            // grouped towards the root, explicitly constrained ones last
            self.reorder(
                &affected_keys,
                &observed_keys,
                &new_keys,
                &constrained_keys,
                &local_factors,
                &detach,
                &mut state,
            );

            // 9. re-eliminate and reassemble the tree
            self.reeliminate(&affected_keys, local_factors, &detach)?;

            // 10. the new top's delta entries are stale now
            let n_total = self.ordering.len();
            for slot in (n_total - affected_keys.len())..n_total {
                state.replaced[slot] = true;
            }
            state.up_to_date = false;

            self.tree.validate(n_total)?;
        }

        // 11. refresh the delta and let the step controller act
        match self.params.optimization.clone() {
            OptimizationParams::GaussNewton(_) => {
                self.refresh_newton(&mut state, false)?;
            }
            OptimizationParams::DogLeg(dl) => {
                self.refresh_newton(&mut state, false)?;
                self.dogleg_update(&mut state, &dl)?;
            }
        }
        state.up_to_date = true;

        let error_after = if self.params.evaluate_nonlinear_error {
            Some(self.factors.error(&self.retract_by(state.current()))?)
        } else {
            None
        };

        let detail = if self.params.enable_detailed_results {
            Some(self.build_detail(
                &observed_keys,
                &new_keys,
                &relin_key_set,
                &relin_involved_keys,
                &affected_keys,
            ))
        } else {
            None
        };

        let result = UpdateResult {
            error_before,
            error_after,
            variables_relinearized: relin_keys.len(),
            variables_reeliminated: reeliminated,
            cliques: self.tree.num_cliques(),
            new_factors_indices,
            detail,
        };
        debug!("{result}");

        *self.state.get_mut() = state;
        Ok(result)
    }

    /// Linearized factors over the affected variable set: every live factor
    /// whose variables are all affected. Factors touching a relinearized
    /// variable (or with no cached linearization) are linearized at the
    /// current values; the rest reuse the cache.
    fn gather_local_factors(
        &mut self,
        affected_keys: &BTreeSet<Key>,
        relin_keys: &BTreeSet<Key>,
    ) -> CrestResult<Vec<LinearizedFactor>> {
        let candidates = self.variable_index.factors_touching(affected_keys.iter());
        let mut result = Vec::with_capacity(candidates.len());
        for index in candidates {
            let factor = self
                .factors
                .get(index)
                .ok_or(CoreError::UnknownFactor(index))?;
            // factors with an unaffected variable are summarized below the
            // cut by a cached boundary factor
            if !factor.keys().iter().all(|k| affected_keys.contains(k)) {
                continue;
            }
            let cached_ok = self.params.cache_linearized_factors
                && self.linear_cache[index].is_some()
                && !factor.keys().iter().any(|k| relin_keys.contains(k));
            let linearized = if cached_ok {
                self.linear_cache[index].clone().expect("cache checked")
            } else {
                let linearized = factor.linearize(&self.theta)?;
                if self.params.cache_linearized_factors {
                    self.linear_cache[index] = Some(linearized.clone());
                }
                linearized
            };
            result.push(linearized);
        }
        Ok(result)
    }

    /// Build the new global ordering (unaffected variables keep their relative
    /// order at the front; affected ones take the trailing slots in local
    /// fill-reducing order) and relabel the tree and delta through the
    /// resulting permutation.
    #[allow(clippy::too_many_arguments)]
    fn reorder(
        &mut self,
        affected_keys: &BTreeSet<Key>,
        observed_keys: &BTreeSet<Key>,
        new_keys: &BTreeSet<Key>,
        constrained_keys: &Option<Vec<Key>>,
        local_factors: &[LinearizedFactor],
        detach: &DetachResult,
        state: &mut DeltaState,
    ) {
        let mut groups: HashMap<Key, usize> = HashMap::new();
        for key in observed_keys.iter().chain(new_keys.iter()) {
            groups.insert(*key, 1);
        }
        if let Some(keys) = constrained_keys {
            for key in keys {
                groups.insert(*key, 2);
            }
        }

        let mut adjacency: HashMap<Key, BTreeSet<Key>> = HashMap::new();
        let mut connect = |keys: &[Key], adjacency: &mut HashMap<Key, BTreeSet<Key>>| {
            for a in keys {
                for b in keys {
                    if a != b {
                        adjacency.entry(*a).or_default().insert(*b);
                    }
                }
            }
        };
        for factor in local_factors {
            connect(&factor.keys, &mut adjacency);
        }
        for &orphan in &detach.orphans {
            if let Some(cached) = self.tree.clique(orphan).cached_factor() {
                let keys: Vec<Key> = cached
                    .slots()
                    .iter()
                    .map(|&s| self.ordering.key(s))
                    .collect();
                connect(&keys, &mut adjacency);
            }
        }

        let affected: Vec<Key> = affected_keys.iter().copied().collect();
        let local_order = fill_reducing_ordering(&affected, &groups, &adjacency);
        debug_assert_eq!(local_order.len(), affected.len());

        let mut keys: Vec<Key> = self
            .ordering
            .iter()
            .map(|(_, k)| *k)
            .filter(|k| !affected_keys.contains(k))
            .collect();
        keys.extend(local_order);
        let new_ordering = Ordering::from_keys(keys);
        let perm = self.ordering.permutation_to(&new_ordering);
        self.ordering = new_ordering;
        self.tree.permute_all(&perm);
        state.permute(&perm);
    }

    /// Eliminate the affected variables (with LDL → QR fallback) and attach
    /// the resulting cliques and the orphaned subtrees.
    fn reeliminate(
        &mut self,
        affected_keys: &BTreeSet<Key>,
        local_factors: Vec<LinearizedFactor>,
        detach: &DetachResult,
    ) -> CrestResult<()> {
        let n_total = self.ordering.len();
        let elim_slots: Vec<usize> = ((n_total - affected_keys.len())..n_total).collect();
        let mut dims: HashMap<usize, usize> = HashMap::new();
        for &slot in &elim_slots {
            let key = self.ordering.key(slot);
            dims.insert(
                slot,
                self.variable_index
                    .dim(&key)
                    .ok_or(CoreError::UnknownVariable(key))?,
            );
        }

        let mut elim_factors: Vec<GaussianFactor> = Vec::new();
        for &orphan in &detach.orphans {
            if let Some(cached) = self.tree.clique(orphan).cached_factor() {
                elim_factors.push(cached.clone());
            }
        }
        for factor in local_factors {
            let mut slots = Vec::with_capacity(factor.keys.len());
            let mut fdims = Vec::with_capacity(factor.keys.len());
            for key in &factor.keys {
                let slot = self
                    .ordering
                    .slot(key)
                    .ok_or(CoreError::UnknownVariable(*key))?;
                slots.push(slot);
                fdims.push(dims[&slot]);
            }
            elim_factors.push(GaussianFactor::Jacobian(JacobianFactor::new(
                slots,
                fdims,
                factor.blocks,
                factor.b,
            )?));
        }

        let eliminated = match eliminate(
            elim_factors.clone(),
            &elim_slots,
            &dims,
            self.params.factorization,
        ) {
            Err(LinAlgError::IndefiniteLinearSystem)
                if self.params.factorization == Factorization::Ldl =>
            {
                warn!("indefinite system under LDL elimination, retrying once with QR");
                eliminate(elim_factors, &elim_slots, &dims, Factorization::Qr)
            }
            other => other,
        }?;

        let mut id_map = Vec::with_capacity(eliminated.len());
        for ec in eliminated {
            let parent = ec.parent.map(|p| id_map[p]);
            id_map.push(self.tree.insert(ec.clique, parent));
        }
        for &orphan in &detach.orphans {
            let separator = self.tree.clique(orphan).separator().to_vec();
            match separator.iter().min() {
                None => self.tree.attach_orphan(orphan, None),
                Some(&min_slot) => {
                    let parent = self
                        .tree
                        .clique_containing(min_slot)
                        .ok_or(InferenceError::OrphanAttach(min_slot))?;
                    self.tree.attach_orphan(orphan, Some(parent));
                }
            }
        }
        Ok(())
    }

    /// Wildfire refresh of the Gauss-Newton delta.
    fn refresh_newton(&self, state: &mut DeltaState, force_full: bool) -> CrestResult<usize> {
        let threshold = if force_full {
            0.0
        } else {
            self.params.optimization.wildfire_threshold()
        };
        let DeltaState {
            newton, replaced, ..
        } = state;
        let count = optimize_wildfire(&self.tree, threshold, force_full, replaced, newton)?;
        self.last_backsub_count.set(count);
        Ok(count)
    }

    /// One dog-leg trust-region pass: blend the Gauss-Newton and steepest
    /// descent steps, evaluate the gain ratio, adapt the radius, and commit
    /// the accepted step.
    fn dogleg_update(&mut self, state: &mut DeltaState, dl: &DogLegParams) -> CrestResult<()> {
        const MIN_RADIUS: f64 = 1e-10;
        let n = self.ordering.len();
        if n == 0 {
            return Ok(());
        }
        let gn: Vec<DVector<f64>> = (0..n).map(|s| state.newton.vector(s).into_owned()).collect();

        // assemble the gradient at Δ = 0 from the per-clique contributions
        let mut g: Vec<DVector<f64>> = (0..n).map(|s| DVector::zeros(state.newton.dim(s))).collect();
        let clique_ids = self.tree.clique_ids();
        for &id in &clique_ids {
            let clique = self.tree.clique(id);
            let conditional = clique.conditional();
            let contribution = clique.gradient_contribution();
            let mut offset = 0;
            for (i, &slot) in conditional.frontals().iter().enumerate() {
                let dim = conditional.frontal_dims()[i];
                for d in 0..dim {
                    g[slot][d] += contribution[offset + d];
                }
                offset += dim;
            }
            for (i, &slot) in conditional.separator().iter().enumerate() {
                let dim = conditional.separator_dims()[i];
                for d in 0..dim {
                    g[slot][d] += contribution[offset + d];
                }
                offset += dim;
            }
        }

        // Cauchy step: −(gᵀg / ‖Rg‖²)·g
        let g_norm2 = dog_leg::norm_squared(&g);
        let sd: Vec<DVector<f64>> = if g_norm2 > 0.0 {
            let rg2: f64 = clique_ids
                .iter()
                .map(|&id| {
                    self.tree
                        .clique(id)
                        .conditional()
                        .multiply(&|slot| g[slot].clone())
                        .norm_squared()
                })
                .sum();
            if rg2 > 0.0 {
                let alpha = g_norm2 / rg2;
                g.iter().map(|v| v * (-alpha)).collect()
            } else {
                g.iter().map(|v| DVector::zeros(v.len())).collect()
            }
        } else {
            g.iter().map(|v| DVector::zeros(v.len())).collect()
        };

        let f0 = self.factors.error(&self.theta)?;
        let m0: f64 = clique_ids
            .iter()
            .map(|&id| 0.5 * self.tree.clique(id).conditional().rhs().norm_squared())
            .sum();

        let mut radius = self.dogleg_radius;
        loop {
            let (step, kind) = dog_leg::blend(&gn, &sd, radius);
            let m_step: f64 = clique_ids
                .iter()
                .map(|&id| {
                    self.tree
                        .clique(id)
                        .conditional()
                        .linear_error(&|slot| step[slot].clone())
                })
                .sum();
            let predicted = m0 - m_step;
            let trial = self.retract_all(&step)?;
            let f_new = self.factors.error(&trial)?;
            let actual = f0 - f_new;
            let rho = if predicted.abs() > 1e-15 {
                actual / predicted
            } else {
                1.0
            };
            if dl.verbose {
                debug!(
                    "dog-leg {kind}: radius {radius:.3e} predicted {predicted:.3e} actual {actual:.3e} rho {rho:.3}"
                );
            }

            let step_norm = dog_leg::norm_squared(&step).sqrt();
            if rho > 0.75 {
                radius = radius.max(3.0 * step_norm);
            } else if rho < 0.25 {
                radius *= 0.5;
            }

            if rho > 0.0 || predicted.abs() <= 1e-15 {
                let DeltaState { newton, step: dl_step, .. } = state;
                let target = dl_step.get_or_insert_with(|| newton.clone());
                for (slot, block) in step.iter().enumerate() {
                    target.set(slot, block);
                }
                break;
            }
            if dl.adaptation_mode == TrustRegionAdaptation::SearchEachIteration
                && radius >= MIN_RADIUS
            {
                continue;
            }
            // rejected: keep the previous estimate (zero step if none yet)
            debug!("dog-leg step rejected at radius {radius:.3e}");
            let DeltaState { newton, step: dl_step, .. } = state;
            if dl_step.is_none() {
                let mut zero = newton.clone();
                for slot in 0..n {
                    zero.set_zero(slot);
                }
                *dl_step = Some(zero);
            }
            break;
        }
        self.dogleg_radius = radius;
        Ok(())
    }

    /// θ ⊕ step for a slot-indexed block vector.
    fn retract_all(&self, step: &[DVector<f64>]) -> CrestResult<Values> {
        let mut out = Values::new();
        for (slot, key) in self.ordering.iter() {
            let value = self.theta.try_get(key)?;
            out.insert(*key, value.retract(step[slot].column(0)))?;
        }
        Ok(out)
    }

    /// θ ⊕ unpermute(Δ).
    fn retract_by(&self, delta: &PermutedVectorValues) -> Values {
        let mut out = Values::new();
        for (slot, key) in self.ordering.iter() {
            let value = self.theta.get(key).expect("ordering covers values");
            out.insert(*key, value.retract(delta.vector(slot)))
                .expect("fresh values have no duplicates");
        }
        out
    }

    fn build_detail(
        &self,
        observed_keys: &BTreeSet<Key>,
        new_keys: &BTreeSet<Key>,
        relin_keys: &BTreeSet<Key>,
        relin_involved_keys: &BTreeSet<Key>,
        affected_keys: &BTreeSet<Key>,
    ) -> DetailedResults {
        let mut root_slots: HashSet<usize> = HashSet::new();
        for &root in self.tree.roots() {
            root_slots.extend(self.tree.clique(root).frontals().iter().copied());
        }
        let mut detail = DetailedResults::default();
        for (slot, key) in self.ordering.iter() {
            let above = relin_keys.contains(key);
            let involved = relin_involved_keys.contains(key) && !above;
            detail.variable_status.insert(
                *key,
                VariableStatus {
                    reeliminated: affected_keys.contains(key),
                    above_relin_threshold: above,
                    relinearize_involved: involved,
                    relinearized: above || involved,
                    observed: observed_keys.contains(key),
                    new: new_keys.contains(key),
                    in_root_clique: root_slots.contains(&slot),
                },
            );
        }
        detail
    }

    /// Current estimate θ ⊕ Δ, refreshing the delta if it is stale.
    pub fn calculate_estimate(&self) -> CrestResult<Values> {
        self.ensure_fresh()?;
        let state = self.state.borrow();
        Ok(self.retract_by(state.current()))
    }

    /// Single-variable estimate; only the clique path from the root to the
    /// variable's clique is refreshed.
    pub fn calculate_estimate_key(&self, key: &Key) -> CrestResult<Value> {
        let slot = self
            .ordering
            .slot(key)
            .ok_or(CoreError::UnknownVariable(*key))?;
        {
            let mut state = self.state.borrow_mut();
            if !state.up_to_date
                && let Some(leaf) = self.tree.clique_containing(slot)
            {
                let mut path = vec![leaf];
                let mut id = leaf;
                while let Some(parent) = self.tree.parent(id) {
                    path.push(parent);
                    id = parent;
                }
                let DeltaState {
                    newton, replaced, ..
                } = &mut *state;
                for &cid in path.iter().rev() {
                    let conditional = self.tree.clique(cid).conditional();
                    let solved = conditional.solve(newton)?;
                    if solved.iter().any(|x| !x.is_finite()) {
                        return Err(OptimizerError::NumericalOverflow.into());
                    }
                    let mut offset = 0;
                    for (i, &fslot) in conditional.frontals().iter().enumerate() {
                        let dim = conditional.frontal_dims()[i];
                        let block = DVector::from_column_slice(
                            &solved.as_slice()[offset..offset + dim],
                        );
                        newton.set(fslot, &block);
                        replaced[fslot] = false;
                        offset += dim;
                    }
                }
            }
        }
        let state = self.state.borrow();
        Ok(self
            .theta
            .try_get(key)?
            .retract(state.current().vector(slot)))
    }

    /// Estimate from a complete back-substitution, ignoring the wildfire
    /// threshold.
    pub fn calculate_best_estimate(&self) -> CrestResult<Values> {
        {
            let mut state = self.state.borrow_mut();
            self.refresh_newton(&mut state, true)?;
            state.up_to_date = true;
        }
        let state = self.state.borrow();
        Ok(self.retract_by(&state.newton))
    }

    /// The current linear delta, refreshed if stale.
    pub fn get_delta(&self) -> CrestResult<Ref<'_, PermutedVectorValues>> {
        self.ensure_fresh()?;
        Ok(Ref::map(self.state.borrow(), |s| s.current()))
    }

    fn ensure_fresh(&self) -> CrestResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.up_to_date {
            self.refresh_newton(&mut state, false)?;
            state.up_to_date = true;
        }
        Ok(())
    }

    /// The current linearization point θ.
    pub fn linearization_point(&self) -> &Values {
        &self.theta
    }

    /// The current elimination ordering.
    pub fn ordering(&self) -> &Ordering {
        &self.ordering
    }

    /// The nonlinear factor graph, including tombstoned entries.
    pub fn factors_unsafe(&self) -> &NonlinearFactorGraph {
        &self.factors
    }

    /// The current Bayes tree.
    pub fn bayes_tree(&self) -> &BayesTree {
        &self.tree
    }

    /// The parameters this instance was created with.
    pub fn params(&self) -> &Isam2Params {
        &self.params
    }

    /// Number of variables recomputed by the most recent wildfire
    /// back-substitution.
    pub fn last_backsub_variable_count(&self) -> usize {
        self.last_backsub_count.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::key;
    use crate::factors::{BetweenFactor, DiagonalNoise, PriorFactor};
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    fn unit_noise(dim: usize) -> DiagonalNoise {
        DiagonalNoise::isotropic(dim, 1.0).unwrap()
    }

    #[test]
    fn test_first_update_solves_linear_problem() {
        let mut isam = Isam2::new(Isam2Params::default());
        let x0 = key('x', 0);
        let x1 = key('x', 1);
        let mut initial = Values::new();
        initial.insert(x0, Value::Vector(dvector![0.5])).unwrap();
        initial.insert(x1, Value::Vector(dvector![1.5])).unwrap();

        let result = isam
            .update(
                vec![
                    Box::new(PriorFactor::new(x0, dvector![0.0], unit_noise(1))),
                    Box::new(BetweenFactor::new(x0, x1, dvector![2.0], unit_noise(1))),
                ],
                initial,
                &[],
                None,
                false,
            )
            .unwrap();

        assert_eq!(result.variables_reeliminated, 2);
        assert_eq!(result.new_factors_indices, vec![0, 1]);
        let estimate = isam.calculate_estimate().unwrap();
        assert_relative_eq!(
            estimate.get(&x0).unwrap().as_vector().unwrap()[0],
            0.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            estimate.get(&x1).unwrap().as_vector().unwrap()[0],
            2.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_precondition_duplicate_value() {
        let mut isam = Isam2::new(Isam2Params::default());
        let x0 = key('x', 0);
        let mut initial = Values::new();
        initial.insert(x0, Value::Vector(dvector![0.0])).unwrap();
        isam.update(
            vec![Box::new(PriorFactor::new(x0, dvector![0.0], unit_noise(1)))],
            initial,
            &[],
            None,
            false,
        )
        .unwrap();

        let mut duplicate = Values::new();
        duplicate.insert(x0, Value::Vector(dvector![1.0])).unwrap();
        let err = isam.update(
            vec![Box::new(PriorFactor::new(x0, dvector![0.0], unit_noise(1)))],
            duplicate,
            &[],
            None,
            false,
        );
        assert!(err.is_err());
        // state untouched: the instance still answers queries
        assert_eq!(isam.ordering().len(), 1);
        assert!(isam.calculate_estimate().is_ok());
    }

    #[test]
    fn test_precondition_missing_initial_value() {
        let mut isam = Isam2::new(Isam2Params::default());
        let err = isam.update(
            vec![Box::new(PriorFactor::new(
                key('x', 0),
                dvector![0.0],
                unit_noise(1),
            ))],
            Values::new(),
            &[],
            None,
            false,
        );
        assert!(err.is_err());
        assert_eq!(isam.ordering().len(), 0);
    }

    #[test]
    fn test_empty_update_is_noop() {
        let mut isam = Isam2::new(Isam2Params::default());
        let x0 = key('x', 0);
        let mut initial = Values::new();
        initial.insert(x0, Value::Vector(dvector![0.3])).unwrap();
        isam.update(
            vec![Box::new(PriorFactor::new(x0, dvector![0.0], unit_noise(1)))],
            initial,
            &[],
            None,
            false,
        )
        .unwrap();
        let before = isam.get_delta().unwrap().vector(0).into_owned();

        let result = isam
            .update(Vec::new(), Values::new(), &[], None, false)
            .unwrap();
        assert_eq!(result.variables_reeliminated, 0);
        assert_eq!(result.variables_relinearized, 0);
        let after = isam.get_delta().unwrap().vector(0).into_owned();
        assert_relative_eq!(before[0], after[0], epsilon = 1e-12);
    }

    #[test]
    fn test_factor_removal_roundtrip() {
        let mut isam = Isam2::new(Isam2Params::default());
        let x0 = key('x', 0);
        let mut initial = Values::new();
        initial.insert(x0, Value::Vector(dvector![0.0])).unwrap();
        isam.update(
            vec![Box::new(PriorFactor::new(x0, dvector![1.0], unit_noise(1)))],
            initial,
            &[],
            None,
            false,
        )
        .unwrap();
        let delta1 = isam.get_delta().unwrap().vector(0).into_owned();

        let contradicting = isam
            .update(
                vec![Box::new(PriorFactor::new(x0, dvector![-3.0], unit_noise(1)))],
                Values::new(),
                &[],
                None,
                false,
            )
            .unwrap();
        let delta2 = isam.get_delta().unwrap().vector(0).into_owned();
        assert!((delta2[0] - delta1[0]).abs() > 1e-3);

        isam.update(
            Vec::new(),
            Values::new(),
            &contradicting.new_factors_indices,
            None,
            false,
        )
        .unwrap();
        let delta3 = isam.get_delta().unwrap().vector(0).into_owned();
        assert_relative_eq!(delta3[0], delta1[0], epsilon = 1e-9);
    }

    #[test]
    fn test_detail_flags() {
        let params = Isam2Params::default().with_enable_detailed_results(true);
        let mut isam = Isam2::new(params);
        let x0 = key('x', 0);
        let mut initial = Values::new();
        initial.insert(x0, Value::Vector(dvector![0.0])).unwrap();
        let result = isam
            .update(
                vec![Box::new(PriorFactor::new(x0, dvector![0.0], unit_noise(1)))],
                initial,
                &[],
                None,
                false,
            )
            .unwrap();
        let detail = result.detail.unwrap();
        let status = detail.variable_status[&x0];
        assert!(status.new);
        assert!(status.observed);
        assert!(status.reeliminated);
        assert!(status.in_root_clique);
        assert!(!status.relinearized);
    }
}
