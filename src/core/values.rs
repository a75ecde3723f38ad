//! The current linearization point: a map from keys to manifold values.

use std::collections::BTreeMap;

use nalgebra::{DVector, DVectorView, Vector3};

use crate::core::key::Key;
use crate::core::{CoreError, CoreResult};
use crate::manifold::SE2;

/// A single variable value: a point on the variable's manifold.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A plain vector-space variable in ℝⁿ
    Vector(DVector<f64>),
    /// A planar pose
    Se2(SE2),
}

impl Value {
    /// Tangent-space dimension of this value.
    pub fn dim(&self) -> usize {
        match self {
            Value::Vector(v) => v.len(),
            Value::Se2(_) => SE2::DOF,
        }
    }

    /// Apply a tangent perturbation, producing the retracted value.
    pub fn retract(&self, delta: DVectorView<'_, f64>) -> Value {
        match self {
            Value::Vector(v) => Value::Vector(v + delta),
            Value::Se2(g) => {
                let xi = Vector3::new(delta[0], delta[1], delta[2]);
                Value::Se2(g.retract(&xi))
            }
        }
    }

    /// Borrow the vector payload, if this is a vector variable.
    pub fn as_vector(&self) -> Option<&DVector<f64>> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow the SE(2) payload, if this is a pose variable.
    pub fn as_se2(&self) -> Option<&SE2> {
        match self {
            Value::Se2(g) => Some(g),
            _ => None,
        }
    }
}

/// The linearization point θ: Key → manifold value.
///
/// Mutated only by the incremental updater when a step is folded in during
/// relinearization; reads combine θ with the cached linear delta.
#[derive(Clone, Debug, Default)]
pub struct Values {
    map: BTreeMap<Key, Value>,
}

impl Values {
    pub fn new() -> Self {
        Values {
            map: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.map.contains_key(key)
    }

    /// Insert a value for a new key. Duplicate keys are rejected.
    pub fn insert(&mut self, key: Key, value: Value) -> CoreResult<()> {
        if self.map.contains_key(&key) {
            return Err(CoreError::DuplicateVariable(key));
        }
        self.map.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.map.get(key)
    }

    /// Look up a value, surfacing a typed error for missing keys.
    pub fn try_get(&self, key: &Key) -> CoreResult<&Value> {
        self.map.get(key).ok_or(CoreError::UnknownVariable(*key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.map.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.map.iter()
    }

    /// Retract a single variable in place: θ[key] ← θ[key] ⊕ delta.
    pub fn retract_in_place(&mut self, key: &Key, delta: DVectorView<'_, f64>) -> CoreResult<()> {
        let value = self
            .map
            .get_mut(key)
            .ok_or(CoreError::UnknownVariable(*key))?;
        if value.dim() != delta.len() {
            return Err(CoreError::DimensionMismatch {
                key: *key,
                expected: value.dim(),
                got: delta.len(),
            });
        }
        *value = value.retract(delta);
        Ok(())
    }

    /// Absorb all entries of `other`, rejecting duplicates.
    pub fn extend(&mut self, other: Values) -> CoreResult<()> {
        for (key, value) in other.map {
            self.insert(key, value)?;
        }
        Ok(())
    }
}
