//! Set primitives of the engine: address-set intersection and the fork-set fold.

use crate::ring::{Address, KeyImage, RingRecord};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Addresses present in both sets. Independent of how either side was indexed.
pub fn intersect_addresses(a: &HashSet<Address>, b: &HashSet<Address>) -> HashSet<Address> {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().filter(|x| large.contains(*x)).cloned().collect()
}

/// Combining operator for candidate sets: intersection. Commutative, associative, idempotent.
pub fn merge_fork_sets(a: &BTreeSet<u64>, b: &BTreeSet<u64>) -> BTreeSet<u64> {
    a.intersection(b).copied().collect()
}

/// Folds ring records from sibling tables of one logical chain, keyed by key image.
///
/// An image seen once keeps its record unchanged. An image seen in several siblings gets
/// `fork_indices` = intersection of every sibling's candidate set (its `fork_indices`,
/// or its full distinct ring when that sibling has not been narrowed).
#[derive(Default)]
pub struct SiblingFold {
    records: BTreeMap<KeyImage, RingRecord>,
}

impl SiblingFold {
    pub fn add(&mut self, record: RingRecord) {
        match self.records.get_mut(&record.image) {
            Some(acc) => {
                let merged = merge_fork_sets(acc.candidates(), record.candidates());
                acc.fork_indices = Some(merged);
            }
            None => {
                self.records.insert(record.image.clone(), record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(self) -> BTreeMap<KeyImage, RingRecord> {
        self.records
    }
}

impl FromIterator<RingRecord> for SiblingFold {
    fn from_iter<T: IntoIterator<Item = RingRecord>>(iter: T) -> Self {
        let mut fold = Self::default();
        for r in iter {
            fold.add(r);
        }
        fold
    }
}
