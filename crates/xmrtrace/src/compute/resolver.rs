//! Index resolver: memoized `(amount, index) -> address` per chain, and the
//! per-ring bidirectional index/address map used to translate intersections back.

use crate::chain::{LookupError, OutputLookup};
use crate::ring::{Address, ChainId, OutputRecord};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ResolveError {
    /// The output does not exist on the chain at query time; retry later or skip.
    #[error("output ({amount}, {index}) not found on {chain}")]
    Unresolved { chain: ChainId, amount: u64, index: u64 },
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

pub struct IndexResolver<L> {
    chain: ChainId,
    lookup: L,
    cache: HashMap<(u64, u64), Address>,
    fresh: Vec<OutputRecord>,
    lookups: u64,
}

impl<L: OutputLookup> IndexResolver<L> {
    pub fn new(chain: ChainId, lookup: L) -> Self {
        Self {
            chain,
            lookup,
            cache: HashMap::new(),
            fresh: Vec::new(),
            lookups: 0,
        }
    }

    /// Preload entries known from an earlier run. Seeded entries are not reported by `take_fresh`.
    pub fn seed(&mut self, records: impl IntoIterator<Item = OutputRecord>) {
        for r in records {
            self.cache.insert((r.amount, r.index), r.address);
        }
    }

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    fn remember(&mut self, amount: u64, index: u64, address: Address) {
        self.fresh.push(OutputRecord {
            amount,
            index,
            address: address.clone(),
        });
        self.cache.insert((amount, index), address);
    }

    pub fn resolve(&mut self, amount: u64, index: u64) -> Result<Address, ResolveError> {
        if let Some(a) = self.cache.get(&(amount, index)) {
            return Ok(a.clone());
        }
        self.lookups += 1;
        match self.lookup.output(amount, index)? {
            Some(address) => {
                self.remember(amount, index, address.clone());
                Ok(address)
            }
            None => Err(ResolveError::Unresolved {
                chain: self.chain.clone(),
                amount,
                index,
            }),
        }
    }

    /// Resolve a set of ring members with one deduplicated batch for the cache misses.
    /// Members that do not exist are recorded as unresolved rather than failing the ring.
    pub fn resolve_ring(
        &mut self,
        amount: u64,
        indices: &BTreeSet<u64>,
    ) -> Result<IndexAddressMap, LookupError> {
        let misses: Vec<u64> = indices
            .iter()
            .copied()
            .filter(|i| !self.cache.contains_key(&(amount, *i)))
            .collect();
        let mut map = IndexAddressMap::default();
        if !misses.is_empty() {
            self.lookups += misses.len() as u64;
            let found = self.lookup.outputs(amount, &misses)?;
            if found.len() != misses.len() {
                return Err(LookupError::Malformed {
                    chain: self.chain.clone(),
                    message: format!("asked {} outputs, got {}", misses.len(), found.len()),
                });
            }
            for (index, addr) in misses.iter().zip(found) {
                match addr {
                    Some(a) => self.remember(amount, *index, a),
                    None => {
                        debug!(chain = %self.chain, amount, index, "unresolved ring member");
                        map.unresolved.insert(*index);
                    }
                }
            }
        }
        for &index in indices {
            if let Some(a) = self.cache.get(&(amount, index)) {
                map.insert(index, a.clone());
            }
        }
        Ok(map)
    }

    /// Entries resolved since the last call, for persisting as output records.
    pub fn take_fresh(&mut self) -> Vec<OutputRecord> {
        std::mem::take(&mut self.fresh)
    }

    /// Number of `(amount, index)` pairs sent to the ledger so far.
    pub fn lookups(&self) -> u64 {
        self.lookups
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// index <-> address for the members of one ring on one chain.
#[derive(Clone, Debug, Default)]
pub struct IndexAddressMap {
    forward: BTreeMap<u64, Address>,
    reverse: HashMap<Address, BTreeSet<u64>>,
    unresolved: BTreeSet<u64>,
}

impl IndexAddressMap {
    pub fn insert(&mut self, index: u64, address: Address) {
        self.reverse.entry(address.clone()).or_default().insert(index);
        self.forward.insert(index, address);
    }

    pub fn mark_unresolved(&mut self, index: u64) {
        self.unresolved.insert(index);
    }

    pub fn address(&self, index: u64) -> Option<&Address> {
        self.forward.get(&index)
    }

    pub fn addresses(&self) -> HashSet<Address> {
        self.reverse.keys().cloned().collect()
    }

    /// Every index whose address is in `addresses`.
    pub fn indices_of<'a>(&self, addresses: impl IntoIterator<Item = &'a Address>) -> BTreeSet<u64> {
        addresses
            .into_iter()
            .filter_map(|a| self.reverse.get(a))
            .flatten()
            .copied()
            .collect()
    }

    pub fn unresolved(&self) -> &BTreeSet<u64> {
        &self.unresolved
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
