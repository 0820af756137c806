//! Add/remove computation shared by sets and rules
//!
//! `add = desired - current`, `remove = current - desired`, both compared by
//! key. Duplicate keys within either input collapse to their first
//! occurrence. Outputs keep input order.

use std::collections::HashSet;
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta<A, R> {
    pub add: Vec<A>,
    pub remove: Vec<R>,
}

impl<A, R> Delta<A, R> {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Diffs two collections of different types by a shared key
pub fn delta_by<C, D, K>(
    current: &[C],
    desired: &[D],
    current_key: impl Fn(&C) -> K,
    desired_key: impl Fn(&D) -> K,
) -> Delta<D, C>
where
    C: Clone,
    D: Clone,
    K: Eq + Hash,
{
    let current_keys: HashSet<K> = current.iter().map(&current_key).collect();
    let desired_keys: HashSet<K> = desired.iter().map(&desired_key).collect();

    let mut seen = HashSet::with_capacity(desired.len());
    let add = desired
        .iter()
        .filter(|d| {
            let key = desired_key(d);
            !current_keys.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect();

    let mut seen = HashSet::with_capacity(current.len());
    let remove = current
        .iter()
        .filter(|c| {
            let key = current_key(c);
            !desired_keys.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect();

    Delta { add, remove }
}

/// Diffs two collections of the same type by value
pub fn delta<T>(current: &[T], desired: &[T]) -> Delta<T, T>
where
    T: Clone + Eq + Hash,
{
    delta_by(current, desired, T::clone, T::clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_basic_delta() {
        let d = delta(&[1, 2, 3], &[2, 3, 4, 5]);
        assert_eq!(d.add, vec![4, 5]);
        assert_eq!(d.remove, vec![1]);
    }

    #[test]
    fn test_identical_inputs_are_empty() {
        let d = delta(&["a", "b"], &["b", "a"]);
        assert!(d.is_empty());
    }

    #[test]
    fn test_duplicates_collapse() {
        let d = delta(&[1, 1, 9, 9], &[2, 2, 2]);
        assert_eq!(d.add, vec![2]);
        assert_eq!(d.remove, vec![1, 9]);
    }

    #[test]
    fn test_keyed_delta_across_types() {
        let current = vec![(b"a".to_vec(), 10u64), (b"b".to_vec(), 11)];
        let desired = vec!["b", "c"];
        let d = delta_by(
            &current,
            &desired,
            |(id, _)| id.clone(),
            |name| name.as_bytes().to_vec(),
        );
        assert_eq!(d.add, vec!["c"]);
        assert_eq!(d.remove, vec![(b"a".to_vec(), 10)]);
    }

    proptest! {
        #[test]
        fn prop_delta_reconstructs_desired(
            current in proptest::collection::hash_set(0u16..64, 0..32),
            desired in proptest::collection::hash_set(0u16..64, 0..32),
        ) {
            let current: Vec<u16> = current.into_iter().collect();
            let desired: Vec<u16> = desired.into_iter().collect();
            let d = delta(&current, &desired);

            let mut result: HashSet<u16> = current.iter().copied().collect();
            for r in &d.remove {
                result.remove(r);
            }
            result.extend(d.add.iter().copied());

            prop_assert_eq!(result, desired.iter().copied().collect::<HashSet<_>>());
            prop_assert!(d.add.iter().all(|a| !current.contains(a)));
            prop_assert!(d.remove.iter().all(|r| !desired.contains(r)));
        }

        #[test]
        fn prop_delta_of_self_is_empty(items in proptest::collection::vec(any::<u32>(), 0..64)) {
            prop_assert!(delta(&items, &items).is_empty());
        }
    }
}
