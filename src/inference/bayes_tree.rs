//! The Bayes tree: a rooted forest of cliques stored in an arena.
//!
//! Cliques own their conditionals; parent/child structure is expressed with
//! arena indices (owning child links, non-owning parent back-references), which
//! makes detach and attach cheap and keeps the structure cycle-free.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::vector_values::Permutation;
use crate::inference::clique::Clique;
use crate::inference::{InferenceError, InferenceResult};

/// Arena handle for a clique.
pub type CliqueId = usize;

#[derive(Clone, Debug)]
struct Node {
    clique: Clique,
    parent: Option<CliqueId>,
    children: Vec<CliqueId>,
}

/// Result of detaching the top of the tree above a marked variable set.
#[derive(Debug, Default)]
pub struct DetachResult {
    /// Frontal slots of every removed clique (the variables to re-eliminate)
    pub removed_frontals: BTreeSet<usize>,
    /// Number of cliques that were removed
    pub removed_count: usize,
    /// Cliques whose parent was removed but which themselves were kept; they
    /// stay in the arena, detached, until reattached below the new top
    pub orphans: Vec<CliqueId>,
}

/// A rooted forest of cliques (typically a single tree).
#[derive(Clone, Debug, Default)]
pub struct BayesTree {
    nodes: Vec<Option<Node>>,
    free: Vec<CliqueId>,
    roots: Vec<CliqueId>,
    /// slot → the clique holding it as a frontal variable
    slot_index: HashMap<usize, CliqueId>,
}

impl BayesTree {
    pub fn new() -> Self {
        BayesTree::default()
    }

    pub fn num_cliques(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.num_cliques() == 0
    }

    pub fn roots(&self) -> &[CliqueId] {
        &self.roots
    }

    fn node(&self, id: CliqueId) -> &Node {
        self.nodes[id].as_ref().expect("stale clique id")
    }

    pub fn clique(&self, id: CliqueId) -> &Clique {
        &self.node(id).clique
    }

    pub fn parent(&self, id: CliqueId) -> Option<CliqueId> {
        self.node(id).parent
    }

    pub fn children(&self, id: CliqueId) -> &[CliqueId] {
        &self.node(id).children
    }

    /// The clique holding `slot` as a frontal variable.
    pub fn clique_containing(&self, slot: usize) -> Option<CliqueId> {
        self.slot_index.get(&slot).copied()
    }

    /// All live clique ids.
    pub fn clique_ids(&self) -> Vec<CliqueId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| i))
            .collect()
    }

    /// Insert a clique below `parent` (or as a root).
    pub fn insert(&mut self, clique: Clique, parent: Option<CliqueId>) -> CliqueId {
        let id = if let Some(id) = self.free.pop() {
            id
        } else {
            self.nodes.push(None);
            self.nodes.len() - 1
        };
        for &slot in clique.frontals() {
            self.slot_index.insert(slot, id);
        }
        self.nodes[id] = Some(Node {
            clique,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(p) => self.nodes[p]
                .as_mut()
                .expect("stale parent id")
                .children
                .push(id),
            None => self.roots.push(id),
        }
        id
    }

    /// Reattach a detached subtree below `parent` (or as a root).
    pub fn attach_orphan(&mut self, id: CliqueId, parent: Option<CliqueId>) {
        debug_assert!(self.node(id).parent.is_none());
        match parent {
            Some(p) => {
                self.nodes[id].as_mut().expect("stale clique id").parent = Some(p);
                self.nodes[p]
                    .as_mut()
                    .expect("stale parent id")
                    .children
                    .push(id);
            }
            None => self.roots.push(id),
        }
    }

    /// Add to `marked` every frontal of every clique on the path from each
    /// given slot's clique up to its root.
    pub fn mark_ancestors<'a>(
        &self,
        slots: impl IntoIterator<Item = &'a usize>,
        marked: &mut BTreeSet<usize>,
    ) {
        let mut visited: HashSet<CliqueId> = HashSet::new();
        for &slot in slots {
            let Some(mut id) = self.clique_containing(slot) else {
                // not yet in any clique (new variable)
                marked.insert(slot);
                continue;
            };
            loop {
                if !visited.insert(id) {
                    break;
                }
                marked.extend(self.clique(id).frontals().iter().copied());
                match self.parent(id) {
                    Some(p) => id = p,
                    None => break,
                }
            }
        }
    }

    /// Cliques that involve any of the given slots, as frontal or separator
    /// variable.
    pub fn involved_cliques(&self, slots: &BTreeSet<usize>) -> Vec<CliqueId> {
        self.clique_ids()
            .into_iter()
            .filter(|&id| slots.iter().any(|&s| self.clique(id).involves(s)))
            .collect()
    }

    /// Remove every clique that has a marked frontal variable.
    ///
    /// The marked set must be closed under taking ancestors, so the removed
    /// cliques form the top of the tree. Children of removed cliques that
    /// survive become detached orphans carrying their cached boundary factors.
    pub fn detach_top(&mut self, marked: &BTreeSet<usize>) -> DetachResult {
        let removed: HashSet<CliqueId> = self
            .clique_ids()
            .into_iter()
            .filter(|&id| self.clique(id).frontals().iter().any(|s| marked.contains(s)))
            .collect();

        let mut result = DetachResult::default();
        for &id in &removed {
            // ancestor closure means a removed clique's parent is removed too
            debug_assert!(
                self.parent(id).is_none_or(|p| removed.contains(&p)),
                "marked set is not ancestor-closed"
            );
            let node = self.nodes[id].take().expect("stale clique id");
            for &slot in node.clique.frontals() {
                self.slot_index.remove(&slot);
                result.removed_frontals.insert(slot);
            }
            for child in node.children {
                if !removed.contains(&child) {
                    self.nodes[child]
                        .as_mut()
                        .expect("stale child id")
                        .parent = None;
                    result.orphans.push(child);
                }
            }
            result.removed_count += 1;
            self.free.push(id);
        }
        self.roots.retain(|id| !removed.contains(id));
        result
    }

    /// Relabel every clique's slots through an old → new permutation.
    pub fn permute_all(&mut self, perm: &Permutation) {
        for node in self.nodes.iter_mut().flatten() {
            node.clique.permute_with_inverse(perm);
        }
        let mut index = HashMap::with_capacity(self.slot_index.len());
        for (&slot, &id) in &self.slot_index {
            index.insert(perm.apply(slot), id);
        }
        self.slot_index = index;
    }

    /// Root-first traversal order over the attached forest.
    pub fn preorder(&self) -> Vec<CliqueId> {
        let mut order = Vec::with_capacity(self.num_cliques());
        let mut stack: Vec<CliqueId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        order
    }

    /// Structural validation: disjoint frontal coverage and the
    /// running-intersection property (every clique's separator is contained in
    /// its parent's variables).
    pub fn validate(&self, total_slots: usize) -> InferenceResult<()> {
        let mut covered: HashSet<usize> = HashSet::new();
        for id in self.preorder() {
            let clique = self.clique(id);
            for &slot in clique.frontals() {
                if !covered.insert(slot) {
                    return Err(InferenceError::Coverage(slot));
                }
            }
            if let Some(parent) = self.parent(id) {
                let p = self.clique(parent);
                let parent_vars: HashSet<usize> = p
                    .frontals()
                    .iter()
                    .chain(p.separator().iter())
                    .copied()
                    .collect();
                if !clique.separator().iter().all(|s| parent_vars.contains(s)) {
                    return Err(InferenceError::RunningIntersection(id));
                }
            }
        }
        for slot in 0..total_slots {
            if !covered.contains(&slot) {
                return Err(InferenceError::Coverage(slot));
            }
        }
        Ok(())
    }
}
