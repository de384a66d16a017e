//! Residual bundle: every narrowed set of a chain plus its statistics, with a SHA-256
//! hash that is stable across re-runs over the same inputs.

use crate::compute::{residual_stats, ResidualStats};
use crate::ring::{ChainId, KeyImage, RingStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

const BUNDLE_VERSION: u32 = 1;
/// Excluded from the hash so that identical results hash identically.
const TIMESTAMP_FIELD: &str = "created_utc_rfc3339";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResidualBundle {
    pub version: u32,
    pub chain: ChainId,
    pub created_utc_rfc3339: String,
    /// Narrowed sets, sorted. Images never narrowed are left out.
    pub residuals: BTreeMap<KeyImage, Vec<u64>>,
    pub stats: ResidualStats,
}

impl ResidualBundle {
    pub fn new(chain: ChainId, residuals: BTreeMap<KeyImage, Vec<u64>>, stats: ResidualStats) -> Self {
        let created_utc_rfc3339 = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        Self {
            version: BUNDLE_VERSION,
            chain,
            created_utc_rfc3339,
            residuals,
            stats,
        }
    }

    /// Snapshot `chain` from the store.
    pub fn from_store(store: &RingStore, chain: &ChainId) -> Result<Self, VerifyError> {
        let records = store.scan(chain)?;
        let stats = residual_stats(
            records
                .iter()
                .map(|r| r.fork_indices.as_ref().map(|f| f.len())),
        );
        let residuals = records
            .into_iter()
            .filter_map(|r| r.fork_indices.map(|f| (r.image, f.into_iter().collect())))
            .collect();
        Ok(Self::new(chain.clone(), residuals, stats))
    }
}

/// Normalize JSON for hashing: sort keys and no whitespace.
pub fn normalize_for_hash(value: &serde_json::Value) -> Result<String, VerifyError> {
    Ok(serde_json::to_string(&sort_json_keys(value))?)
}

fn sort_json_keys(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(m) => {
            let sorted: BTreeMap<&String, serde_json::Value> =
                m.iter().map(|(k, v)| (k, sort_json_keys(v))).collect();
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_keys).collect())
        }
        other => other.clone(),
    }
}

/// SHA-256 over the normalized bundle JSON, creation time excluded.
pub fn reproducibility_hash(bundle: &ResidualBundle) -> Result<String, VerifyError> {
    let mut json = serde_json::to_value(bundle)?;
    if let Some(obj) = json.as_object_mut() {
        obj.remove(TIMESTAMP_FIELD);
    }
    let normalized = normalize_for_hash(&json)?;
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationResult {
    pub bundle_hash: String,
    pub expected_hash: Option<String>,
    pub matches: bool,
}

/// Compare a bundle against an expected hex hash (e.g. a `.sha256` file's content).
pub fn verify_bundle_hash(
    bundle: &ResidualBundle,
    expected_hex: Option<&str>,
) -> Result<VerificationResult, VerifyError> {
    let bundle_hash = reproducibility_hash(bundle)?;
    let expected = expected_hex.map(|e| e.trim().to_lowercase());
    let matches = expected.as_deref() == Some(bundle_hash.as_str());
    Ok(VerificationResult {
        bundle_hash,
        expected_hash: expected,
        matches,
    })
}
