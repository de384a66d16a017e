//! Ledger lookup seams used by ingestion and the resolver, plus the daemon-backed implementation.

use crate::chain::decode::{inputs_from_tx_json, tx_hashes_from_block_json, RingInput};
use crate::chain::fetch::{FetchError, Fetcher, OutputRef};
use crate::ring::{Address, ChainId};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("ledger {chain} unavailable: {message}")]
    Unavailable { chain: ChainId, message: String },
    #[error("malformed ledger data on {chain}: {message}")]
    Malformed { chain: ChainId, message: String },
}

/// `(amount, index) -> address` on a single chain. `Ok(None)` means the output does not exist.
pub trait OutputLookup {
    fn output(&self, amount: u64, index: u64) -> Result<Option<Address>, LookupError>;

    /// Batch form; results are positional with `indices`.
    fn outputs(&self, amount: u64, indices: &[u64]) -> Result<Vec<Option<Address>>, LookupError> {
        indices.iter().map(|i| self.output(amount, *i)).collect()
    }
}

impl<L: OutputLookup + ?Sized> OutputLookup for &L {
    fn output(&self, amount: u64, index: u64) -> Result<Option<Address>, LookupError> {
        (**self).output(amount, index)
    }

    fn outputs(&self, amount: u64, indices: &[u64]) -> Result<Vec<Option<Address>>, LookupError> {
        (**self).outputs(amount, indices)
    }
}

/// Full ledger surface needed to populate ring records.
pub trait Ledger: OutputLookup {
    fn block_tx_hashes(&self, height: u64) -> Result<Vec<String>, LookupError>;
    fn ring_inputs(&self, tx_hashes: &[String]) -> Result<Vec<RingInput>, LookupError>;
}

/// Blocking adapter over the async [`Fetcher`]; owns its runtime.
pub struct DaemonLedger {
    fetcher: Fetcher,
    rt: tokio::runtime::Runtime,
}

impl DaemonLedger {
    pub fn new(fetcher: Fetcher) -> Result<Self, std::io::Error> {
        let rt = tokio::runtime::Runtime::new()?;
        Ok(Self { fetcher, rt })
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    fn lookup_err(&self, e: FetchError) -> LookupError {
        let chain = self.fetcher.chain().clone();
        match e {
            FetchError::Decode { .. } | FetchError::Node { .. } => LookupError::Malformed {
                chain,
                message: e.to_string(),
            },
            other => LookupError::Unavailable {
                chain,
                message: other.to_string(),
            },
        }
    }

    fn fetch_outs(&self, refs: &[OutputRef]) -> Result<Option<Vec<Address>>, LookupError> {
        match self.rt.block_on(self.fetcher.get_outs(refs)) {
            Ok(resp) => Ok(Some(resp.outs.into_iter().map(|o| Address::new(o.key)).collect())),
            Err(e) if e.is_node_rejection() => Ok(None),
            Err(e) => Err(self.lookup_err(e)),
        }
    }
}

impl OutputLookup for DaemonLedger {
    fn output(&self, amount: u64, index: u64) -> Result<Option<Address>, LookupError> {
        let found = self.fetch_outs(&[OutputRef { amount, index }])?;
        Ok(found.and_then(|mut v| v.pop()))
    }

    /// Chunks to the configured batch size. A chunk the daemon rejects (one of its
    /// indices does not exist yet) is retried index by index.
    fn outputs(&self, amount: u64, indices: &[u64]) -> Result<Vec<Option<Address>>, LookupError> {
        let batch = self.fetcher.config().get_outs_batch.max(1);
        let mut out = Vec::with_capacity(indices.len());
        for chunk in indices.chunks(batch) {
            let refs: Vec<OutputRef> = chunk.iter().map(|&index| OutputRef { amount, index }).collect();
            match self.fetch_outs(&refs)? {
                Some(addrs) => out.extend(addrs.into_iter().map(Some)),
                None => {
                    debug!(chain = %self.fetcher.chain(), amount, len = chunk.len(), "batch rejected, resolving singly");
                    for &index in chunk {
                        out.push(self.output(amount, index)?);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Ledger for DaemonLedger {
    fn block_tx_hashes(&self, height: u64) -> Result<Vec<String>, LookupError> {
        let block = self
            .rt
            .block_on(self.fetcher.get_block(height))
            .map_err(|e| self.lookup_err(e))?;
        if !block.tx_hashes.is_empty() || block.json.is_empty() {
            return Ok(block.tx_hashes);
        }
        tx_hashes_from_block_json(&block.json).map_err(|e| LookupError::Malformed {
            chain: self.fetcher.chain().clone(),
            message: format!("block {height}: {e}"),
        })
    }

    fn ring_inputs(&self, tx_hashes: &[String]) -> Result<Vec<RingInput>, LookupError> {
        if tx_hashes.is_empty() {
            return Ok(vec![]);
        }
        let resp = self
            .rt
            .block_on(self.fetcher.get_transactions(tx_hashes))
            .map_err(|e| self.lookup_err(e))?;
        if !resp.missed_tx.is_empty() {
            return Err(LookupError::Malformed {
                chain: self.fetcher.chain().clone(),
                message: format!("missed transactions: {}", resp.missed_tx.join(",")),
            });
        }
        let mut inputs = Vec::new();
        for tx in &resp.txs {
            let parsed = inputs_from_tx_json(&tx.as_json).map_err(|e| LookupError::Malformed {
                chain: self.fetcher.chain().clone(),
                message: format!("tx {}: {e}", tx.tx_hash),
            })?;
            inputs.extend(parsed);
        }
        Ok(inputs)
    }
}
