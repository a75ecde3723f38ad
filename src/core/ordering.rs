//! The elimination ordering: a bijection between keys and dense slots, plus a
//! greedy fill-reducing ordering for the locally re-eliminated variable set.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::key::Key;
use crate::core::vector_values::Permutation;

/// Bijection Key ↔ Slot. Slots `0..len` are contiguous; slot order is the
/// elimination order (higher slots eliminated later, root-adjacent).
#[derive(Clone, Debug, Default)]
pub struct Ordering {
    keys: Vec<Key>,
    slots: HashMap<Key, usize>,
}

impl Ordering {
    pub fn new() -> Self {
        Ordering {
            keys: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// Rebuild from an explicit slot → key list.
    pub fn from_keys(keys: Vec<Key>) -> Self {
        let slots = keys.iter().enumerate().map(|(s, &k)| (k, s)).collect();
        Ordering { keys, slots }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Assign the next slot to a new key; returns the slot.
    pub fn push(&mut self, key: Key) -> usize {
        debug_assert!(!self.slots.contains_key(&key));
        let slot = self.keys.len();
        self.keys.push(key);
        self.slots.insert(key, slot);
        slot
    }

    pub fn key(&self, slot: usize) -> Key {
        self.keys[slot]
    }

    pub fn slot(&self, key: &Key) -> Option<usize> {
        self.slots.get(key).copied()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.slots.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Key)> {
        self.keys.iter().enumerate()
    }

    /// The permutation taking this ordering to `other` (old slot → new slot).
    /// Both orderings must contain the same key set.
    pub fn permutation_to(&self, other: &Ordering) -> Permutation {
        debug_assert_eq!(self.len(), other.len());
        let map = self
            .keys
            .iter()
            .map(|k| other.slot(k).expect("orderings must cover the same keys"))
            .collect();
        Permutation::from_vec(map)
    }
}

/// Greedy constrained fill-reducing ordering over a local variable set.
///
/// Stands in for an external COLAMD-style symbolic ordering: repeatedly
/// eliminates the variable with the fewest connections, simulating fill by
/// connecting the eliminated variable's remaining neighbours. `groups`
/// partitions the variables into elimination tiers; all of tier g is
/// eliminated before any of tier g+1, so higher tiers end up root-adjacent.
pub fn fill_reducing_ordering(
    keys: &[Key],
    groups: &HashMap<Key, usize>,
    adjacency: &HashMap<Key, BTreeSet<Key>>,
) -> Vec<Key> {
    let mut remaining: BTreeSet<Key> = keys.iter().copied().collect();
    let mut adj: BTreeMap<Key, BTreeSet<Key>> = keys
        .iter()
        .map(|k| {
            let neighbours = adjacency
                .get(k)
                .map(|set| set.intersection(&remaining).copied().collect())
                .unwrap_or_default();
            (*k, neighbours)
        })
        .collect();

    let mut order = Vec::with_capacity(keys.len());
    while !remaining.is_empty() {
        let lowest_group = remaining
            .iter()
            .map(|k| groups.get(k).copied().unwrap_or(0))
            .min()
            .unwrap_or(0);

        // min-degree within the lowest tier; BTreeSet iteration makes
        // tie-breaking deterministic
        let next = remaining
            .iter()
            .filter(|k| groups.get(k).copied().unwrap_or(0) == lowest_group)
            .min_by_key(|k| adj.get(k).map(|n| n.len()).unwrap_or(0))
            .copied()
            .expect("remaining set is nonempty");

        remaining.remove(&next);
        let neighbours: Vec<Key> = adj
            .remove(&next)
            .unwrap_or_default()
            .into_iter()
            .filter(|n| remaining.contains(n))
            .collect();
        // fill: eliminating `next` connects its neighbours pairwise
        for i in 0..neighbours.len() {
            if let Some(set) = adj.get_mut(&neighbours[i]) {
                set.remove(&next);
                for j in 0..neighbours.len() {
                    if i != j {
                        set.insert(neighbours[j]);
                    }
                }
            }
        }
        order.push(next);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::key;

    #[test]
    fn test_push_and_lookup() {
        let mut ordering = Ordering::new();
        let s0 = ordering.push(key('x', 0));
        let s1 = ordering.push(key('x', 1));
        assert_eq!((s0, s1), (0, 1));
        assert_eq!(ordering.key(1), key('x', 1));
        assert_eq!(ordering.slot(&key('x', 0)), Some(0));
        assert_eq!(ordering.slot(&key('l', 0)), None);
    }

    #[test]
    fn test_permutation_to() {
        let a = Ordering::from_keys(vec![key('x', 0), key('x', 1), key('x', 2)]);
        let b = Ordering::from_keys(vec![key('x', 2), key('x', 0), key('x', 1)]);
        let perm = a.permutation_to(&b);
        assert_eq!(perm.apply(0), 1);
        assert_eq!(perm.apply(1), 2);
        assert_eq!(perm.apply(2), 0);
    }

    #[test]
    fn test_fill_reducing_covers_all_keys() {
        let keys = vec![key('x', 0), key('x', 1), key('x', 2)];
        let mut adjacency = HashMap::new();
        adjacency.insert(key('x', 0), BTreeSet::from([key('x', 1)]));
        adjacency.insert(key('x', 1), BTreeSet::from([key('x', 0), key('x', 2)]));
        adjacency.insert(key('x', 2), BTreeSet::from([key('x', 1)]));
        let order = fill_reducing_ordering(&keys, &HashMap::new(), &adjacency);
        assert_eq!(order.len(), 3);
        let set: BTreeSet<Key> = order.iter().copied().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_groups_are_eliminated_last() {
        let keys = vec![key('x', 0), key('x', 1), key('x', 2), key('x', 3)];
        let mut adjacency: HashMap<Key, BTreeSet<Key>> = HashMap::new();
        for i in 0..3 {
            adjacency
                .entry(key('x', i))
                .or_default()
                .insert(key('x', i + 1));
            adjacency
                .entry(key('x', i + 1))
                .or_default()
                .insert(key('x', i));
        }
        let mut groups = HashMap::new();
        groups.insert(key('x', 1), 1usize);
        let order = fill_reducing_ordering(&keys, &groups, &adjacency);
        // the constrained key comes out last
        assert_eq!(*order.last().unwrap(), key('x', 1));
    }
}
