//! monerod RPC client with rate limiting, retries and an optional response cache.
//!
//! Endpoints: `POST /json_rpc` (`get_block`), `POST /get_transactions`, `POST /get_outs`.

use crate::chain::cache::{Cache, CacheError};
use crate::ring::ChainId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:18081";
const RATE_LIMIT_MS: u64 = 0;
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 500;
const TIMEOUT_SECS: u64 = 30;
/// Restricted daemons reject `/get_outs` requests above roughly 100 outputs.
const GET_OUTS_BATCH_LIMIT: usize = 96;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub base_url: String,
    pub rate_limit_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
    pub offline: bool,
    pub get_outs_batch: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DAEMON_URL.to_string(),
            rate_limit_ms: RATE_LIMIT_MS,
            max_retries: MAX_RETRIES,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            timeout_secs: TIMEOUT_SECS,
            offline: false,
            get_outs_batch: GET_OUTS_BATCH_LIMIT,
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api error: status {0} body {1}")]
    Api(u16, String),
    #[error("{endpoint} returned status {status}")]
    Node { endpoint: String, status: String },
    #[error("decode {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("offline mode: no cached data for key")]
    OfflineMiss,
}

impl FetchError {
    /// True when the daemon answered but reported the request as failed (e.g. unknown output).
    pub fn is_node_rejection(&self) -> bool {
        matches!(self, FetchError::Node { .. })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BlockResult {
    pub block_header: BlockHeader,
    pub json: String,
    pub status: String,
    pub tx_hashes: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonTransaction {
    pub tx_hash: String,
    pub as_json: String,
    pub block_height: u64,
    pub in_pool: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TransactionsResponse {
    pub status: String,
    pub txs: Vec<DaemonTransaction>,
    pub missed_tx: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OutputRef {
    pub amount: u64,
    pub index: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputEntry {
    pub height: u64,
    pub key: String,
    pub mask: String,
    pub txid: String,
    pub unlocked: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutsResponse {
    pub status: String,
    pub outs: Vec<OutputEntry>,
}

/// Daemon status carried by a response body: top-level `status`, or `result.status` for
/// JSON-RPC. A JSON-RPC `error` object is reported as its message.
pub(crate) fn response_status(body: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    if let Some(msg) = v
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return Some(msg.to_string());
    }
    v.get("status")
        .or_else(|| v.get("result").and_then(|r| r.get("status")))
        .and_then(|s| s.as_str())
        .map(str::to_string)
}

/// Exponential backoff for `attempt`, saturating instead of overflowing.
fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
}

/// Per-chain daemon client.
pub struct Fetcher {
    chain: ChainId,
    config: FetchConfig,
    base: Url,
    client: Option<reqwest::Client>,
    cache: Option<Cache>,
    last_request: tokio::sync::Mutex<Option<Instant>>,
    request_count: AtomicU64,
}

impl Fetcher {
    pub fn new(chain: ChainId, config: FetchConfig, cache: Option<Cache>) -> Result<Self, FetchError> {
        let base = Url::parse(&config.base_url)?;
        let client = if config.offline {
            None
        } else {
            Some(
                reqwest::Client::builder()
                    .use_rustls_tls()
                    .timeout(Duration::from_secs(config.timeout_secs))
                    .build()?,
            )
        };
        Ok(Self {
            chain,
            config,
            base,
            client,
            cache,
            last_request: tokio::sync::Mutex::new(None),
            request_count: AtomicU64::new(0),
        })
    }

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let need = Duration::from_millis(self.config.rate_limit_ms);
            let elapsed = prev.elapsed();
            if elapsed < need {
                tokio::time::sleep(need - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn backoff(&self, attempt: u32) {
        if attempt < self.config.max_retries {
            let ms = backoff_ms(self.config.retry_backoff_ms, attempt);
            warn!(chain = %self.chain, attempt, ms, "retry after error");
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// POST `body` to `endpoint`. Successful (`OK`) responses are cached; a daemon-reported
    /// failure is returned as `FetchError::Node` and is not retried, except `BUSY`.
    async fn request_json(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<String, FetchError> {
        let norm = serde_json::to_string(body).map_err(|e| FetchError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;
        let cache_key = Cache::key_for(&self.chain, endpoint, &norm);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get_json(&cache_key)? {
                debug!(chain = %self.chain, endpoint, "cache hit");
                return Ok(cached);
            }
        }
        let client = self.client.as_ref().ok_or(FetchError::OfflineMiss)?;
        let url = self.base.join(endpoint)?;

        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            self.rate_limit().await;
            let res = client.post(url.clone()).json(body).send().await;
            let r = match res {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(FetchError::Request(e));
                    self.backoff(attempt).await;
                    continue;
                }
            };
            let status = r.status();
            let text = match r.text().await {
                Ok(t) => t,
                Err(e) => {
                    last_err = Some(FetchError::Request(e));
                    self.backoff(attempt).await;
                    continue;
                }
            };
            if !status.is_success() {
                last_err = Some(FetchError::Api(status.as_u16(), text));
                self.backoff(attempt).await;
                continue;
            }
            self.request_count.fetch_add(1, Ordering::Relaxed);
            match response_status(&text).as_deref() {
                Some("OK") => {
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.set_json(&cache_key, &self.chain, endpoint, &text) {
                            warn!(chain = %self.chain, error = %e, "cache write failed");
                        }
                    }
                    return Ok(text);
                }
                Some("BUSY") => {
                    last_err = Some(FetchError::Node {
                        endpoint: endpoint.to_string(),
                        status: "BUSY".to_string(),
                    });
                    self.backoff(attempt).await;
                }
                other => {
                    return Err(FetchError::Node {
                        endpoint: endpoint.to_string(),
                        status: other.unwrap_or("missing").to_string(),
                    });
                }
            }
        }
        Err(last_err.unwrap_or(FetchError::Api(0, "unknown".to_string())))
    }

    fn parse<T: serde::de::DeserializeOwned>(endpoint: &str, body: &str) -> Result<T, FetchError> {
        serde_json::from_str(body).map_err(|e| FetchError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    /// JSON-RPC `get_block` by height.
    pub async fn get_block(&self, height: u64) -> Result<BlockResult, FetchError> {
        #[derive(Deserialize)]
        struct Envelope {
            result: Option<BlockResult>,
        }
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": "get_block",
            "params": { "height": height }
        });
        let text = self.request_json("/json_rpc", &body).await?;
        let env: Envelope = Self::parse("get_block", &text)?;
        env.result.ok_or_else(|| FetchError::Decode {
            endpoint: "get_block".to_string(),
            message: "missing result".to_string(),
        })
    }

    /// POST `/get_transactions` with `decode_as_json`.
    pub async fn get_transactions(
        &self,
        hashes: &[String],
    ) -> Result<TransactionsResponse, FetchError> {
        let body = serde_json::json!({ "txs_hashes": hashes, "decode_as_json": true });
        let text = self.request_json("/get_transactions", &body).await?;
        Self::parse("/get_transactions", &text)
    }

    /// POST `/get_outs`. Callers keep `refs` within `config().get_outs_batch`.
    pub async fn get_outs(&self, refs: &[OutputRef]) -> Result<OutsResponse, FetchError> {
        let body = serde_json::json!({ "outputs": refs, "get_txid": false });
        let text = self.request_json("/get_outs", &body).await?;
        let parsed: OutsResponse = Self::parse("/get_outs", &text)?;
        if parsed.outs.len() != refs.len() {
            return Err(FetchError::Decode {
                endpoint: "/get_outs".to_string(),
                message: format!("asked {} outputs, got {}", refs.len(), parsed.outs.len()),
            });
        }
        Ok(parsed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}
