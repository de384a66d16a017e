//! Ring-membership records and output records, per chain.

pub(crate) mod ingest;
pub(crate) mod store;

pub use ingest::{ingest_heights, IngestError, IngestOptions, IngestSummary};
pub use store::{RingStore, StoreError, StoredOutputs};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// String identifier that is trimmed and lowercased on construction, so equality is
/// byte equality. Deserialization goes through the same normalization.
macro_rules! normalized_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(from = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into().trim().to_lowercase())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

normalized_id!(
    /// Identifier of a ring table: a chain (`xmr`, `xmv`) or a derived result table (`xmr_xmv`).
    ChainId
);

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

normalized_id!(
    /// Hex-encoded key image.
    KeyImage
);

normalized_id!(
    /// One-time output public key, hex-encoded. Opaque: only compared for equality.
    Address
);

/// Ring membership of one key image on one chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingRecord {
    pub image: KeyImage,
    pub ring_amount: u64,
    /// Absolute indices in original ring order; duplicates allowed.
    pub ring_indices: Vec<u64>,
    pub distinct_ring_indices: BTreeSet<u64>,
    pub block_height: u64,
    /// Narrowed candidate set. `None` until a cross-chain comparison has run.
    pub fork_indices: Option<BTreeSet<u64>>,
}

impl RingRecord {
    pub fn new(image: KeyImage, ring_amount: u64, ring_indices: Vec<u64>, block_height: u64) -> Self {
        let distinct_ring_indices = ring_indices.iter().copied().collect();
        Self {
            image,
            ring_amount,
            ring_indices,
            distinct_ring_indices,
            block_height,
            fork_indices: None,
        }
    }

    /// Current best-known candidate set: the narrowed set if any, else the full distinct ring.
    pub fn candidates(&self) -> &BTreeSet<u64> {
        self.fork_indices
            .as_ref()
            .unwrap_or(&self.distinct_ring_indices)
    }
}

/// `(amount, index) -> address` on one chain. Immutable once mined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub amount: u64,
    pub index: u64,
    pub address: Address,
}
