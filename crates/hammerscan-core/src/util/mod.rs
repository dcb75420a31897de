//! Utility functions and types used throughout hammerscan.
//!
//! This module provides various helper types and traits including:
//! - Constants for memory operations ([`PAGE_SIZE`], [`DEFAULT_ROW_SIZE`], etc.)
//! - [`GroupBy`] trait for collection grouping operations
//! - Cache maintenance wrappers ([`clflush`], [`mfence`])
//! - Progress reporting utilities ([`NamedProgress`])
//! - Random number generation ([`Rng`])

mod cache;
mod constants;
mod named_progress;
mod rng;

pub use self::cache::{clflush, mfence};
pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::rng::Rng;

use std::collections::HashMap;

/// Trait for grouping collection elements by a key function.
///
/// This trait extends collections with the ability to group elements based on
/// a key extraction function, similar to SQL's GROUP BY operation.
pub trait GroupBy<V> {
    /// Groups elements by the result of applying a function to each element.
    ///
    /// # Arguments
    ///
    /// * `f` - Function that extracts a grouping key from each element
    ///
    /// # Returns
    ///
    /// Returns a `HashMap` where keys are the grouping keys and values are
    /// vectors of elements that share that key, in their original order.
    fn group_by<K: std::hash::Hash + std::cmp::Eq, F: Fn(&V) -> K>(
        self,
        f: F,
    ) -> HashMap<K, Vec<V>>;
}

impl<T> GroupBy<T> for Vec<T> {
    fn group_by<K: std::hash::Hash + std::cmp::Eq, F: Fn(&T) -> K>(
        self,
        f: F,
    ) -> HashMap<K, Vec<T>> {
        let mut out = HashMap::new();
        for elem in self {
            let k = f(&elem);
            out.entry(k).or_insert(vec![]).push(elem);
        }
        out
    }
}

/// Returns the median of `values`, or `None` if `values` is empty.
///
/// For an even number of samples the upper median is returned.
pub fn median<T: Ord + Copy>(values: &mut [T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[values.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::{GroupBy, median};

    #[test]
    fn test_group_mod2() {
        let addrs = vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let groups = addrs.group_by(|x| x % 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&0], vec![0, 2, 4, 6, 8]);
        assert_eq!(groups[&1], vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_group_identity() {
        let addrs = vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let groups = addrs.group_by(|x| *x);
        for (i, group) in groups {
            assert_eq!(group.len(), 1);
            assert_eq!(group[0], i);
        }
    }

    #[test]
    fn test_group_row_index() {
        let pages = vec![0x1000usize, 0x40000, 0x3f000, 0x7f000, 0x2000];
        let groups = pages.group_by(|p| p >> 18);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&0], vec![0x1000, 0x3f000, 0x2000]);
        assert_eq!(groups[&1], vec![0x40000, 0x7f000]);
    }

    #[test]
    fn test_median() {
        assert_eq!(median::<u64>(&mut []), None);
        assert_eq!(median(&mut [3]), Some(3));
        assert_eq!(median(&mut [9, 1, 5]), Some(5));
        assert_eq!(median(&mut [4, 1, 3, 2]), Some(3));
    }
}
