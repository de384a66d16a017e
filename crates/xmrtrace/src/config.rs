//! Chain endpoint configuration (JSON).
//!
//! ```json
//! {
//!   "fetch": { "max_retries": 5 },
//!   "chains": [
//!     { "id": "xmr", "daemon_url": "http://127.0.0.1:18081" },
//!     { "id": "xmv", "daemon_url": "http://127.0.0.1:19091", "rate_limit_ms": 50 }
//!   ]
//! }
//! ```

use crate::chain::FetchConfig;
use crate::ring::ChainId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("chain {0} listed twice")]
    Duplicate(ChainId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub id: ChainId,
    pub daemon_url: String,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChainsConfig {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub chains: Vec<ChainEndpoint>,
}

impl ChainsConfig {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        let mut seen = std::collections::BTreeSet::new();
        for c in &cfg.chains {
            if !seen.insert(&c.id) {
                return Err(ConfigError::Duplicate(c.id.clone()));
            }
        }
        Ok(cfg)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(s) => Self::from_json(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch settings for `chain`: the shared block with the chain's URL and rate limit applied.
    pub fn fetch_for(&self, chain: &ChainId, offline: bool) -> FetchConfig {
        let mut cfg = self.fetch.clone();
        if let Some(ep) = self.chains.iter().find(|c| &c.id == chain) {
            cfg.base_url = ep.daemon_url.clone();
            if let Some(ms) = ep.rate_limit_ms {
                cfg.rate_limit_ms = ms;
            }
        }
        cfg.offline |= offline;
        cfg
    }
}
