//! The nonlinear factor graph: an append-mostly sequence of measurement
//! factors, addressed by insertion index, with tombstones for removals.

use nalgebra::{DMatrix, DVector};

use crate::core::key::Key;
use crate::core::values::Values;
use crate::core::{CoreError, CoreResult};

/// A key-addressed linearization of a nonlinear factor.
///
/// Represents the whitened least-squares term `‖Σᵢ Aᵢ δᵢ − b‖²` where block
/// `Aᵢ` pairs with `keys[i]` and `b` is the negated whitened residual at the
/// linearization point.
#[derive(Clone, Debug)]
pub struct LinearizedFactor {
    pub keys: Vec<Key>,
    pub blocks: Vec<DMatrix<f64>>,
    pub b: DVector<f64>,
}

impl LinearizedFactor {
    pub fn rows(&self) -> usize {
        self.b.len()
    }
}

/// A nonlinear measurement factor.
///
/// Implementations provide the residual error and a whitened linearization at
/// the current values; the solver never looks inside the measurement model.
pub trait NonlinearFactor: Send {
    /// The variables this factor touches.
    fn keys(&self) -> &[Key];

    /// Residual dimension.
    fn dim(&self) -> usize;

    /// `0.5 ‖whitened residual‖²` at the given values.
    fn error(&self, values: &Values) -> CoreResult<f64>;

    /// Whitened Jacobian blocks and right-hand side at the given values.
    fn linearize(&self, values: &Values) -> CoreResult<LinearizedFactor>;
}

/// An ordered sequence of factors. Removals tombstone the entry so that
/// factor indices handed out earlier stay stable; insertions append.
#[derive(Default)]
pub struct NonlinearFactorGraph {
    factors: Vec<Option<Box<dyn NonlinearFactor>>>,
    active: usize,
}

impl NonlinearFactorGraph {
    pub fn new() -> Self {
        NonlinearFactorGraph {
            factors: Vec::new(),
            active: 0,
        }
    }

    /// Total number of index slots, including tombstones.
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Number of live (non-removed) factors.
    pub fn num_active(&self) -> usize {
        self.active
    }

    /// Append a factor, returning its stable insertion index.
    pub fn add(&mut self, factor: Box<dyn NonlinearFactor>) -> usize {
        self.factors.push(Some(factor));
        self.active += 1;
        self.factors.len() - 1
    }

    /// Tombstone a factor, returning it.
    pub fn remove(&mut self, index: usize) -> CoreResult<Box<dyn NonlinearFactor>> {
        let slot = self
            .factors
            .get_mut(index)
            .ok_or(CoreError::UnknownFactor(index))?;
        let factor = slot.take().ok_or(CoreError::UnknownFactor(index))?;
        self.active -= 1;
        Ok(factor)
    }

    /// Re-insert a previously removed factor at its old index (rollback path).
    pub fn reinsert(&mut self, index: usize, factor: Box<dyn NonlinearFactor>) {
        debug_assert!(self.factors[index].is_none());
        self.factors[index] = Some(factor);
        self.active += 1;
    }

    /// Drop trailing entries so that `len() == len` (rollback path).
    pub fn truncate(&mut self, len: usize) {
        while self.factors.len() > len {
            if self.factors.pop().flatten().is_some() {
                self.active -= 1;
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&dyn NonlinearFactor> {
        self.factors.get(index).and_then(|f| f.as_deref())
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Iterate live factors with their indices.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, &dyn NonlinearFactor)> {
        self.factors
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_deref().map(|f| (i, f)))
    }

    /// Total nonlinear error `Σ 0.5‖r‖²` over live factors.
    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        let mut total = 0.0;
        for (_, factor) in self.iter_active() {
            total += factor.error(values)?;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for NonlinearFactorGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonlinearFactorGraph")
            .field("len", &self.factors.len())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::key;
    use nalgebra::dmatrix;

    struct UnitFactor {
        keys: Vec<Key>,
    }

    impl NonlinearFactor for UnitFactor {
        fn keys(&self) -> &[Key] {
            &self.keys
        }
        fn dim(&self) -> usize {
            1
        }
        fn error(&self, _values: &Values) -> CoreResult<f64> {
            Ok(0.5)
        }
        fn linearize(&self, _values: &Values) -> CoreResult<LinearizedFactor> {
            Ok(LinearizedFactor {
                keys: self.keys.clone(),
                blocks: vec![dmatrix![1.0]],
                b: nalgebra::dvector![0.0],
            })
        }
    }

    #[test]
    fn test_indices_are_stable_under_removal() {
        let mut graph = NonlinearFactorGraph::new();
        let i0 = graph.add(Box::new(UnitFactor {
            keys: vec![key('x', 0)],
        }));
        let i1 = graph.add(Box::new(UnitFactor {
            keys: vec![key('x', 1)],
        }));
        assert_eq!((i0, i1), (0, 1));

        graph.remove(i0).unwrap();
        assert!(graph.get(i0).is_none());
        assert!(graph.get(i1).is_some());

        let i2 = graph.add(Box::new(UnitFactor {
            keys: vec![key('x', 2)],
        }));
        assert_eq!(i2, 2);
        assert_eq!(graph.num_active(), 2);
    }

    #[test]
    fn test_double_remove_fails() {
        let mut graph = NonlinearFactorGraph::new();
        let i = graph.add(Box::new(UnitFactor {
            keys: vec![key('x', 0)],
        }));
        graph.remove(i).unwrap();
        assert!(matches!(
            graph.remove(i),
            Err(CoreError::UnknownFactor(0))
        ));
    }

    #[test]
    fn test_error_sums_active_only() {
        let mut graph = NonlinearFactorGraph::new();
        graph.add(Box::new(UnitFactor {
            keys: vec![key('x', 0)],
        }));
        let i = graph.add(Box::new(UnitFactor {
            keys: vec![key('x', 1)],
        }));
        graph.remove(i).unwrap();
        let err = graph.error(&Values::new()).unwrap();
        assert_eq!(err, 0.5);
    }
}
