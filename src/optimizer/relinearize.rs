//! Fluid relinearization policy: decide which variables' linear deltas have
//! outgrown the local linear model.

use tracing::warn;

use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::core::vector_values::PermutedVectorValues;
use crate::optimizer::RelinearizationThreshold;

/// Keys whose delta magnitude exceeds the relinearization threshold.
///
/// With a scalar threshold the max-norm of the slot's delta is compared
/// directly; with per-type thresholds each dimension is scaled by its own
/// threshold and the variable crosses when any ratio exceeds one.
pub fn check_relinearization(
    delta: &PermutedVectorValues,
    ordering: &Ordering,
    threshold: &RelinearizationThreshold,
) -> Vec<Key> {
    let mut above = Vec::new();
    for (slot, key) in ordering.iter() {
        let crosses = match threshold {
            RelinearizationThreshold::Scalar(tau) => delta.max_abs(slot) > *tau,
            RelinearizationThreshold::PerType(map) => match map.get(&key.tag()) {
                Some(taus) => {
                    let v = delta.vector(slot);
                    if taus.len() != v.len() {
                        warn!(
                            "relinearization threshold for type '{}' has {} dims, variable {} has {}; skipping",
                            key.tag(),
                            taus.len(),
                            key,
                            v.len()
                        );
                        false
                    } else {
                        v.iter().zip(taus.iter()).any(|(x, tau)| x.abs() / tau > 1.0)
                    }
                }
                None => {
                    warn!(
                        "no relinearization threshold for variable type '{}'; {} never relinearizes",
                        key.tag(),
                        key
                    );
                    false
                }
            },
        };
        if crosses {
            above.push(*key);
        }
    }
    above
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::key;
    use nalgebra::dvector;
    use std::collections::HashMap;

    fn setup() -> (PermutedVectorValues, Ordering) {
        let mut delta = PermutedVectorValues::new();
        let mut ordering = Ordering::new();
        ordering.push(key('x', 0));
        ordering.push(key('l', 0));
        delta.push_variable(2);
        delta.push_variable(2);
        delta.set(0, &dvector![0.05, -0.2]);
        delta.set(1, &dvector![0.02, 0.01]);
        (delta, ordering)
    }

    #[test]
    fn test_scalar_threshold() {
        let (delta, ordering) = setup();
        let above =
            check_relinearization(&delta, &ordering, &RelinearizationThreshold::Scalar(0.1));
        assert_eq!(above, vec![key('x', 0)]);

        let none =
            check_relinearization(&delta, &ordering, &RelinearizationThreshold::Scalar(0.5));
        assert!(none.is_empty());
    }

    #[test]
    fn test_per_type_threshold() {
        let (delta, ordering) = setup();
        let mut map = HashMap::new();
        // loose on the first dim, tight on the second
        map.insert('x', dvector![1.0, 0.1]);
        map.insert('l', dvector![1.0, 1.0]);
        let above = check_relinearization(
            &delta,
            &ordering,
            &RelinearizationThreshold::PerType(map),
        );
        assert_eq!(above, vec![key('x', 0)]);
    }

    #[test]
    fn test_missing_type_never_crosses() {
        let (delta, ordering) = setup();
        let mut map = HashMap::new();
        map.insert('x', dvector![0.01, 0.01]);
        let above = check_relinearization(
            &delta,
            &ordering,
            &RelinearizationThreshold::PerType(map),
        );
        // 'l' has no entry and is skipped
        assert_eq!(above, vec![key('x', 0)]);
    }
}
