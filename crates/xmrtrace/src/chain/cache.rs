//! SQLite cache of daemon responses, keyed by a content hash of (chain, endpoint, request).
//!
//! Only finalized data is stored here: blocks, transactions and outputs below the
//! chain tip never change, so entries are never invalidated.

use crate::ring::ChainId;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Cache {
    conn: Mutex<Connection>,
}

impl Cache {
    /// Open or create the cache at `path`, creating parent dirs.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                key TEXT PRIMARY KEY,
                chain TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                body BLOB NOT NULL,
                created_utc INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_responses_chain ON responses(chain);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Content-hash key for a request. `request` should be the serialized request body.
    pub fn key_for(chain: &ChainId, endpoint: &str, request: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(chain.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(endpoint.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))
    }

    /// Cached response body, if present and valid UTF-8.
    pub fn get_json(&self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM responses WHERE key = ?1")?;
        let raw = stmt
            .query_row([key], |r| r.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(raw.and_then(|b| String::from_utf8(b).ok()))
    }

    pub fn set_json(
        &self,
        key: &str,
        chain: &ChainId,
        endpoint: &str,
        json: &str,
    ) -> Result<(), CacheError> {
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO responses (key, chain, endpoint, body, created_utc)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![key, chain.as_str(), endpoint, json.as_bytes(), created],
        )?;
        Ok(())
    }

    /// Number of cached responses for `chain`.
    pub fn count(&self, chain: &ChainId) -> Result<u64, CacheError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM responses WHERE chain = ?1",
            [chain.as_str()],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }
}
