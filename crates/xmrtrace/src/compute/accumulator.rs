//! Cross-chain intersection accumulator.
//!
//! For a key image spent on two forks, the true spend is the same output on both ledgers
//! while decoys are drawn independently per chain. Intersecting the rings in the address
//! domain and mapping the survivors back to the left chain's indices narrows the
//! candidate set. Results are persisted through [`RingStore::narrow_fork_indices`], so
//! re-running a pair, or adding more forks, can only keep or shrink a stored set.

use crate::chain::{LookupError, OutputLookup};
use crate::compute::intersect::{intersect_addresses, merge_fork_sets};
use crate::compute::resolver::IndexResolver;
use crate::ring::{ChainId, KeyImage, RingRecord, RingStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("{image}: ring amount {left} on {left_chain} but {right} on {right_chain}")]
    DenominationMismatch {
        image: KeyImage,
        left_chain: ChainId,
        left: u64,
        right_chain: ChainId,
        right: u64,
    },
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Errors that end a whole run: a collaborator is unreachable.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("ledger: {0}")]
    Lookup(#[from] LookupError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Empty intersection: resolution bug or a post-fork spend of a different output.
    Anomaly,
    /// One candidate left: the true spend.
    Deanonymized,
    Ambiguous(usize),
}

impl Outcome {
    pub fn of_len(len: usize) -> Self {
        match len {
            0 => Outcome::Anomaly,
            1 => Outcome::Deanonymized,
            n => Outcome::Ambiguous(n),
        }
    }
}

/// Result of intersecting one key image's rings, in left-chain indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Narrowed {
    pub fork_indices: BTreeSet<u64>,
    pub unresolved_left: BTreeSet<u64>,
    pub unresolved_right: BTreeSet<u64>,
}

impl Narrowed {
    pub fn outcome(&self) -> Outcome {
        Outcome::of_len(self.fork_indices.len())
    }

    /// Some ring member could not be resolved, so the result covers only the resolvable subset.
    pub fn is_partial(&self) -> bool {
        !self.unresolved_left.is_empty() || !self.unresolved_right.is_empty()
    }
}

/// Intersect the current candidate sets of `left` and `right` (same key image, two chains).
pub fn narrow_image<A: OutputLookup, B: OutputLookup>(
    left_resolver: &mut IndexResolver<A>,
    left: &RingRecord,
    right_resolver: &mut IndexResolver<B>,
    right: &RingRecord,
) -> Result<Narrowed, ImageError> {
    if left.ring_amount != right.ring_amount {
        return Err(ImageError::DenominationMismatch {
            image: left.image.clone(),
            left_chain: left_resolver.chain().clone(),
            left: left.ring_amount,
            right_chain: right_resolver.chain().clone(),
            right: right.ring_amount,
        });
    }
    let left_map = left_resolver.resolve_ring(left.ring_amount, left.candidates())?;
    let right_map = right_resolver.resolve_ring(right.ring_amount, right.candidates())?;
    let common = intersect_addresses(&left_map.addresses(), &right_map.addresses());
    Ok(Narrowed {
        fork_indices: left_map.indices_of(common.iter()),
        unresolved_left: left_map.unresolved().clone(),
        unresolved_right: right_map.unresolved().clone(),
    })
}

/// Which chains to compare and where to persist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkPair {
    /// Chain whose ring data and index space the result is expressed in.
    pub left: ChainId,
    pub right: ChainId,
    /// Table receiving the narrowed sets; `left` unless a separate result table is wanted.
    pub into: ChainId,
}

impl ForkPair {
    pub fn new(left: ChainId, right: ChainId) -> Self {
        Self {
            into: left.clone(),
            left,
            right,
        }
    }

    pub fn into_table(mut self, into: ChainId) -> Self {
        self.into = into;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageFailure {
    pub image: KeyImage,
    pub reason: String,
}

/// Completion report of a fork-pair run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub left_images: u64,
    pub shared_images: u64,
    pub processed: u64,
    pub fully_deanonymized: u64,
    pub anomalies: u64,
    pub partial_warnings: u64,
    pub mismatches: u64,
    /// Images skipped because the ledger returned unusable data for one of their rings.
    pub malformed: u64,
    pub conflicts: u64,
    pub failures: Vec<ImageFailure>,
}

impl RunReport {
    fn fail(&mut self, image: &KeyImage, reason: String) {
        self.failures.push(ImageFailure {
            image: image.clone(),
            reason,
        });
    }
}

/// Narrow every key image present on both `pair.left` and `pair.right`.
///
/// Per-image failures are recorded in the report and the batch continues; only an
/// unreachable ledger or store aborts.
pub fn run_fork_pair<A: OutputLookup, B: OutputLookup>(
    store: &RingStore,
    pair: &ForkPair,
    left_resolver: &mut IndexResolver<A>,
    right_resolver: &mut IndexResolver<B>,
) -> Result<RunReport, RunError> {
    let left_records = store.scan(&pair.left)?;
    let right_records: BTreeMap<KeyImage, RingRecord> = store
        .scan(&pair.right)?
        .into_iter()
        .map(|r| (r.image.clone(), r))
        .collect();
    let into_state: BTreeMap<KeyImage, BTreeSet<u64>> = if pair.into == pair.left {
        BTreeMap::new()
    } else {
        store
            .scan(&pair.into)?
            .into_iter()
            .filter_map(|r| r.fork_indices.map(|f| (r.image, f)))
            .collect()
    };

    let mut report = RunReport {
        left_images: left_records.len() as u64,
        ..Default::default()
    };
    for record in &left_records {
        let Some(other) = right_records.get(&record.image) else {
            continue;
        };
        report.shared_images += 1;

        let mut view = record.clone();
        if let Some(stored) = into_state.get(&record.image) {
            view.fork_indices = Some(merge_fork_sets(view.candidates(), stored));
        }

        let narrowed = match narrow_image(left_resolver, &view, right_resolver, other) {
            Ok(n) => n,
            Err(ImageError::Lookup(e @ LookupError::Unavailable { .. })) => {
                return Err(RunError::Lookup(e))
            }
            Err(e @ ImageError::Lookup(LookupError::Malformed { .. })) => {
                warn!(left = %pair.left, right = %pair.right, image = %record.image, error = %e, "skipping image");
                report.malformed += 1;
                report.fail(&record.image, e.to_string());
                continue;
            }
            Err(e @ ImageError::DenominationMismatch { .. }) => {
                warn!(left = %pair.left, right = %pair.right, error = %e, "skipping image");
                report.mismatches += 1;
                report.fail(&record.image, e.to_string());
                continue;
            }
        };
        if narrowed.is_partial() {
            warn!(
                image = %record.image,
                left_unresolved = narrowed.unresolved_left.len(),
                right_unresolved = narrowed.unresolved_right.len(),
                "partial resolution"
            );
            report.partial_warnings += 1;
        }

        if pair.into != pair.left {
            store.upsert(&pair.into, record)?;
        }
        let stored = match store.narrow_fork_indices(&pair.into, &record.image, &narrowed.fork_indices) {
            Ok(s) => s,
            Err(e @ StoreError::Conflict { .. }) => {
                report.conflicts += 1;
                report.fail(&record.image, e.to_string());
                continue;
            }
            Err(e) => return Err(RunError::Store(e)),
        };
        report.processed += 1;
        match Outcome::of_len(stored.len()) {
            Outcome::Anomaly => {
                warn!(image = %record.image, left = %pair.left, right = %pair.right, "empty intersection");
                report.anomalies += 1;
            }
            Outcome::Deanonymized => report.fully_deanonymized += 1,
            Outcome::Ambiguous(_) => {}
        }
    }

    persist_fresh(store, left_resolver)?;
    persist_fresh(store, right_resolver)?;
    info!(
        left = %pair.left,
        right = %pair.right,
        into = %pair.into,
        shared = report.shared_images,
        processed = report.processed,
        deanonymized = report.fully_deanonymized,
        anomalies = report.anomalies,
        "fork pair complete"
    );
    Ok(report)
}

fn persist_fresh<L: OutputLookup>(
    store: &RingStore,
    resolver: &mut IndexResolver<L>,
) -> Result<(), StoreError> {
    let fresh = resolver.take_fresh();
    if !fresh.is_empty() {
        store.put_outputs(resolver.chain(), &fresh)?;
    }
    Ok(())
}

/// Merge sibling result tables into `target`: every image's candidate set becomes the
/// intersection of the siblings' sets, written through the narrowing update path.
pub fn merge_siblings(
    store: &RingStore,
    siblings: &[ChainId],
    target: &ChainId,
) -> Result<RunReport, StoreError> {
    let merged = store.scan_group(siblings)?;
    let mut report = RunReport::default();
    for (image, record) in &merged {
        report.shared_images += 1;
        let Some(fork) = &record.fork_indices else {
            continue;
        };
        store.upsert(target, record)?;
        let stored = match store.narrow_fork_indices(target, image, fork) {
            Ok(s) => s,
            Err(e @ StoreError::Conflict { .. }) => {
                report.conflicts += 1;
                report.fail(image, e.to_string());
                continue;
            }
            Err(e) => return Err(e),
        };
        report.processed += 1;
        match Outcome::of_len(stored.len()) {
            Outcome::Anomaly => report.anomalies += 1,
            Outcome::Deanonymized => report.fully_deanonymized += 1,
            Outcome::Ambiguous(_) => {}
        }
    }
    info!(target = %target, siblings = siblings.len(), merged = report.processed, "sibling merge complete");
    Ok(report)
}
