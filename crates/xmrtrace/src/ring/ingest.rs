//! Populate ring records for a chain from its ledger, block by block.

use crate::chain::{decode_offsets, Ledger, LookupError};
use crate::compute::IndexResolver;
use crate::ring::{ChainId, RingRecord, RingStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("ledger: {0}")]
    Lookup(#[from] LookupError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("empty height range {from}..={to}")]
    EmptyRange { from: u64, to: u64 },
}

#[derive(Clone, Debug)]
pub struct IngestOptions {
    /// First height; `None` resumes from the stored cursor (or 0).
    pub from_height: Option<u64>,
    pub to_height: u64,
    /// Also resolve every ring member and store its output record.
    pub record_outputs: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IngestSummary {
    pub blocks: u64,
    pub transactions: u64,
    pub inputs: u64,
    pub inserted: u64,
    pub skipped_inputs: u64,
    pub outputs_recorded: u64,
    pub unresolved_outputs: u64,
}

pub fn ingest_heights<L: Ledger>(
    ledger: &L,
    store: &RingStore,
    chain: &ChainId,
    opts: &IngestOptions,
) -> Result<IngestSummary, IngestError> {
    let from = match opts.from_height {
        Some(h) => h,
        None => store.cursor(chain)?.unwrap_or(0),
    };
    if from > opts.to_height {
        return Err(IngestError::EmptyRange {
            from,
            to: opts.to_height,
        });
    }
    let mut resolver = IndexResolver::new(chain.clone(), ledger);
    let mut summary = IngestSummary::default();

    for height in from..=opts.to_height {
        let hashes = ledger.block_tx_hashes(height)?;
        summary.blocks += 1;
        if hashes.is_empty() {
            store.set_cursor(chain, height + 1)?;
            continue;
        }
        summary.transactions += hashes.len() as u64;
        let inputs = ledger.ring_inputs(&hashes)?;
        let mut records = Vec::with_capacity(inputs.len());
        for input in inputs {
            summary.inputs += 1;
            match decode_offsets(&input.key_offsets) {
                Ok(indices) => records.push(RingRecord::new(
                    input.key_image,
                    input.amount,
                    indices,
                    height,
                )),
                Err(e) => {
                    warn!(chain = %chain, height, image = %input.key_image, error = %e, "skipping input");
                    summary.skipped_inputs += 1;
                }
            }
        }
        summary.inserted += store.upsert_many(chain, &records)? as u64;

        if opts.record_outputs {
            let mut wanted: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
            for r in &records {
                wanted
                    .entry(r.ring_amount)
                    .or_default()
                    .extend(r.distinct_ring_indices.iter().copied());
            }
            for (amount, indices) in &wanted {
                let map = resolver.resolve_ring(*amount, indices)?;
                summary.unresolved_outputs += map.unresolved().len() as u64;
            }
            let fresh = resolver.take_fresh();
            summary.outputs_recorded += store.put_outputs(chain, &fresh)? as u64;
        }
        store.set_cursor(chain, height + 1)?;
        debug!(chain = %chain, height, inputs = records.len(), "block ingested");
    }
    info!(
        chain = %chain,
        from,
        to = opts.to_height,
        inserted = summary.inserted,
        "ingest complete"
    );
    Ok(summary)
}
