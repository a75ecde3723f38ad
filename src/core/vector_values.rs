//! Slot-addressed vector storage for the linear delta, with lazy permutation.
//!
//! [`VectorValues`] is a concatenated storage: one contiguous buffer of
//! coefficients plus per-entry offset/length. [`PermutedVectorValues`] pairs
//! that raw storage with a slot → storage-entry map so that a re-ordering never
//! has to shuffle the coefficients themselves; only the index map is composed
//! with the new permutation.

use nalgebra::{DVector, DVectorView};

/// A bijective renumbering of slots: `map[old_slot] = new_slot`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permutation(Vec<usize>);

impl Permutation {
    /// The identity permutation on `n` slots.
    pub fn identity(n: usize) -> Self {
        Permutation((0..n).collect())
    }

    /// Build from an explicit old → new map.
    ///
    /// Debug builds assert the map is a bijection on `0..n`.
    pub fn from_vec(map: Vec<usize>) -> Self {
        #[cfg(debug_assertions)]
        {
            let mut seen = vec![false; map.len()];
            for &s in &map {
                assert!(s < map.len() && !seen[s], "permutation is not a bijection");
                seen[s] = true;
            }
        }
        Permutation(map)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Image of a single slot.
    pub fn apply(&self, slot: usize) -> usize {
        self.0[slot]
    }

    /// The inverse permutation: `new_slot → old_slot`.
    pub fn inverse(&self) -> Permutation {
        let mut inv = vec![0usize; self.0.len()];
        for (old, &new) in self.0.iter().enumerate() {
            inv[new] = old;
        }
        Permutation(inv)
    }
}

/// Concatenated per-variable vector storage: one flat coefficient buffer plus
/// per-entry (offset, length).
#[derive(Clone, Debug, Default)]
pub struct VectorValues {
    data: Vec<f64>,
    ranges: Vec<(usize, usize)>,
}

impl VectorValues {
    pub fn new() -> Self {
        VectorValues {
            data: Vec::new(),
            ranges: Vec::new(),
        }
    }

    /// Number of entries (variables), not coefficients.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total coefficient count.
    pub fn total_dim(&self) -> usize {
        self.data.len()
    }

    /// Append a zero-initialized entry of the given dimension; returns its
    /// storage index.
    pub fn push(&mut self, dim: usize) -> usize {
        let start = self.data.len();
        self.data.resize(start + dim, 0.0);
        self.ranges.push((start, dim));
        self.ranges.len() - 1
    }

    pub fn dim(&self, entry: usize) -> usize {
        self.ranges[entry].1
    }

    pub fn vector(&self, entry: usize) -> DVectorView<'_, f64> {
        let (start, len) = self.ranges[entry];
        DVectorView::from(&self.data[start..start + len])
    }

    pub fn set(&mut self, entry: usize, value: &DVector<f64>) {
        let (start, len) = self.ranges[entry];
        debug_assert_eq!(len, value.len());
        self.data[start..start + len].copy_from_slice(value.as_slice());
    }

    pub fn set_zero(&mut self, entry: usize) {
        let (start, len) = self.ranges[entry];
        self.data[start..start + len].fill(0.0);
    }
}

/// The linear delta Δ addressed by slot through a lazily-composed permutation.
///
/// Reads and writes translate slot → storage entry through the index map; the
/// raw storage is only ever appended to.
#[derive(Clone, Debug, Default)]
pub struct PermutedVectorValues {
    values: VectorValues,
    /// slot → storage entry
    map: Vec<usize>,
}

impl PermutedVectorValues {
    pub fn new() -> Self {
        PermutedVectorValues {
            values: VectorValues::new(),
            map: Vec::new(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Append storage for a new variable; it is assigned the next slot.
    pub fn push_variable(&mut self, dim: usize) -> usize {
        let entry = self.values.push(dim);
        self.map.push(entry);
        self.map.len() - 1
    }

    pub fn dim(&self, slot: usize) -> usize {
        self.values.dim(self.map[slot])
    }

    pub fn vector(&self, slot: usize) -> DVectorView<'_, f64> {
        self.values.vector(self.map[slot])
    }

    pub fn set(&mut self, slot: usize, value: &DVector<f64>) {
        self.values.set(self.map[slot], value);
    }

    pub fn set_zero(&mut self, slot: usize) {
        self.values.set_zero(self.map[slot]);
    }

    /// Largest absolute coefficient of a slot's entry.
    pub fn max_abs(&self, slot: usize) -> f64 {
        self.vector(slot)
            .iter()
            .fold(0.0f64, |acc, x| acc.max(x.abs()))
    }

    /// Whether every coefficient of the slot is finite.
    pub fn is_finite(&self, slot: usize) -> bool {
        self.vector(slot).iter().all(|x| x.is_finite())
    }

    /// Compose an old → new slot permutation into the index map.
    ///
    /// The raw storage is untouched; after this call, reads through the new
    /// slot labels resolve to the same coefficients as the old labels did.
    pub fn permute(&mut self, perm: &Permutation) {
        debug_assert_eq!(perm.len(), self.map.len());
        let mut new_map = vec![0usize; self.map.len()];
        for (old_slot, &entry) in self.map.iter().enumerate() {
            new_map[perm.apply(old_slot)] = entry;
        }
        self.map = new_map;
    }
}
