//! SQLite ring store: ring records per table, output records per chain, ingest cursors.
//!
//! Ring records are insert-once. `fork_indices` is the only mutable column and is only
//! ever replaced by its intersection with a new candidate set, through a compare-and-swap
//! update, so concurrent writers can narrow but never widen it.

use crate::chain::{LookupError, OutputLookup};
use crate::compute::SiblingFold;
use crate::ring::{Address, ChainId, KeyImage, OutputRecord, RingRecord};
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

const MAX_CAS_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("index column: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("no ring record for {image} in {chain}")]
    MissingRecord { chain: ChainId, image: KeyImage },
    #[error("fork_indices of {image} in {chain} kept changing under update")]
    Conflict { chain: ChainId, image: KeyImage },
}

pub struct RingStore {
    conn: Mutex<Connection>,
}

fn encode_set(set: &BTreeSet<u64>) -> Result<String, StoreError> {
    Ok(serde_json::to_string(set)?)
}

fn decode_set(text: &str) -> Result<BTreeSet<u64>, StoreError> {
    Ok(serde_json::from_str(text)?)
}

const RECORD_COLUMNS: &str =
    "image, ring_amount, ring_indices, distinct_ring_indices, block_height, fork_indices";

struct RawRecord {
    image: String,
    ring_amount: u64,
    ring_indices: String,
    distinct_ring_indices: String,
    block_height: u64,
    fork_indices: Option<String>,
}

impl RawRecord {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            image: r.get(0)?,
            ring_amount: r.get(1)?,
            ring_indices: r.get(2)?,
            distinct_ring_indices: r.get(3)?,
            block_height: r.get(4)?,
            fork_indices: r.get(5)?,
        })
    }

    fn decode(self) -> Result<RingRecord, StoreError> {
        Ok(RingRecord {
            image: KeyImage::new(self.image),
            ring_amount: self.ring_amount,
            ring_indices: serde_json::from_str(&self.ring_indices)?,
            distinct_ring_indices: decode_set(&self.distinct_ring_indices)?,
            block_height: self.block_height,
            fork_indices: self.fork_indices.as_deref().map(decode_set).transpose()?,
        })
    }
}

impl RingStore {
    /// Open or create the store at `path`. Creates parent dirs if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ring_records (
                chain TEXT NOT NULL,
                image TEXT NOT NULL,
                ring_amount INTEGER NOT NULL,
                ring_indices TEXT NOT NULL,
                distinct_ring_indices TEXT NOT NULL,
                block_height INTEGER NOT NULL,
                fork_indices TEXT,
                PRIMARY KEY (chain, image)
            );
            CREATE TABLE IF NOT EXISTS outputs (
                chain TEXT NOT NULL,
                amount INTEGER NOT NULL,
                idx INTEGER NOT NULL,
                address TEXT NOT NULL,
                PRIMARY KEY (chain, amount, idx)
            );
            CREATE TABLE IF NOT EXISTS ingest_cursor (
                chain TEXT PRIMARY KEY,
                next_height INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))
    }

    fn insert_record(conn: &Connection, chain: &ChainId, r: &RingRecord) -> Result<bool, StoreError> {
        let fork = r.fork_indices.as_ref().map(encode_set).transpose()?;
        let n = conn.execute(
            "INSERT INTO ring_records (chain, image, ring_amount, ring_indices, distinct_ring_indices, block_height, fork_indices)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(chain, image) DO NOTHING",
            rusqlite::params![
                chain.as_str(),
                r.image.as_str(),
                r.ring_amount,
                serde_json::to_string(&r.ring_indices)?,
                encode_set(&r.distinct_ring_indices)?,
                r.block_height,
                fork,
            ],
        )?;
        Ok(n == 1)
    }

    /// Insert `record` into `chain`. Returns false when the image was already present.
    pub fn upsert(&self, chain: &ChainId, record: &RingRecord) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        Self::insert_record(&conn, chain, record)
    }

    /// Insert many records in one transaction. Returns how many were new.
    pub fn upsert_many(&self, chain: &ChainId, records: &[RingRecord]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for r in records {
            if Self::insert_record(&tx, chain, r)? {
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get(&self, chain: &ChainId, image: &KeyImage) -> Result<Option<RingRecord>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM ring_records WHERE chain = ?1 AND image = ?2"),
                rusqlite::params![chain.as_str(), image.as_str()],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Every record of `chain`, ordered by key image.
    pub fn scan(&self, chain: &ChainId) -> Result<Vec<RingRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM ring_records WHERE chain = ?1 ORDER BY image"
        ))?;
        let raws = stmt
            .query_map([chain.as_str()], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawRecord::decode).collect()
    }

    /// Records of several sibling tables unioned by key image. An image reported by more
    /// than one sibling gets the intersection of the siblings' candidate sets as `fork_indices`.
    pub fn scan_group(&self, chains: &[ChainId]) -> Result<BTreeMap<KeyImage, RingRecord>, StoreError> {
        let mut fold = SiblingFold::default();
        for chain in chains {
            for record in self.scan(chain)? {
                fold.add(record);
            }
        }
        Ok(fold.finish())
    }

    /// Narrow `fork_indices` of `image` in `chain` to its intersection with `proposed`.
    /// Returns the set now stored.
    pub fn narrow_fork_indices(
        &self,
        chain: &ChainId,
        image: &KeyImage,
        proposed: &BTreeSet<u64>,
    ) -> Result<BTreeSet<u64>, StoreError> {
        self.narrow_with(chain, image, proposed, || {})
    }

    /// Compare-and-swap loop behind [`Self::narrow_fork_indices`]. `before_write` runs between
    /// the read and the conditional write of every attempt.
    fn narrow_with(
        &self,
        chain: &ChainId,
        image: &KeyImage,
        proposed: &BTreeSet<u64>,
        mut before_write: impl FnMut(),
    ) -> Result<BTreeSet<u64>, StoreError> {
        let conn = self.lock()?;
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT distinct_ring_indices, fork_indices FROM ring_records WHERE chain = ?1 AND image = ?2",
                    rusqlite::params![chain.as_str(), image.as_str()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((distinct, current)) = row else {
                return Err(StoreError::MissingRecord {
                    chain: chain.clone(),
                    image: image.clone(),
                });
            };
            let base = match current.as_deref() {
                Some(text) => decode_set(text)?,
                None => decode_set(&distinct)?,
            };
            let next: BTreeSet<u64> = base.intersection(proposed).copied().collect();
            let encoded = encode_set(&next)?;
            if current.as_deref() == Some(encoded.as_str()) {
                return Ok(next);
            }
            before_write();
            let changed = conn.execute(
                "UPDATE ring_records SET fork_indices = ?3
                 WHERE chain = ?1 AND image = ?2 AND fork_indices IS ?4",
                rusqlite::params![chain.as_str(), image.as_str(), encoded, current],
            )?;
            if changed == 1 {
                return Ok(next);
            }
            debug!(chain = %chain, image = %image, attempt, "fork_indices changed underneath, re-reading");
        }
        warn!(chain = %chain, image = %image, "giving up on contended fork_indices update");
        Err(StoreError::Conflict {
            chain: chain.clone(),
            image: image.clone(),
        })
    }

    /// Length of `fork_indices` per record; `None` where no narrowing has happened.
    pub fn fork_index_lengths(&self, chain: &ChainId) -> Result<Vec<Option<usize>>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT json_array_length(fork_indices) FROM ring_records WHERE chain = ?1 ORDER BY image",
        )?;
        let rows = stmt
            .query_map([chain.as_str()], |r| r.get::<_, Option<i64>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|n| n.map(|n| n.max(0) as usize))
            .collect())
    }

    pub fn count(&self, chain: &ChainId) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let n: u64 = conn.query_row(
            "SELECT COUNT(*) FROM ring_records WHERE chain = ?1",
            [chain.as_str()],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Persist output records; existing `(chain, amount, index)` rows are left untouched.
    pub fn put_outputs(&self, chain: &ChainId, outputs: &[OutputRecord]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO outputs (chain, amount, idx, address) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chain, amount, idx) DO NOTHING",
            )?;
            for o in outputs {
                inserted += stmt.execute(rusqlite::params![
                    chain.as_str(),
                    o.amount,
                    o.index,
                    o.address.as_str()
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn output(&self, chain: &ChainId, amount: u64, index: u64) -> Result<Option<Address>, StoreError> {
        let conn = self.lock()?;
        let addr = conn
            .query_row(
                "SELECT address FROM outputs WHERE chain = ?1 AND amount = ?2 AND idx = ?3",
                rusqlite::params![chain.as_str(), amount, index],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(addr.map(Address::new))
    }

    pub fn load_outputs(&self, chain: &ChainId) -> Result<Vec<OutputRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT amount, idx, address FROM outputs WHERE chain = ?1")?;
        let rows = stmt
            .query_map([chain.as_str()], |r| {
                Ok(OutputRecord {
                    amount: r.get(0)?,
                    index: r.get(1)?,
                    address: Address::new(r.get::<_, String>(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Next height to ingest for `chain`, if any height was ingested before.
    pub fn cursor(&self, chain: &ChainId) -> Result<Option<u64>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT next_height FROM ingest_cursor WHERE chain = ?1",
                [chain.as_str()],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Advance the cursor. Never moves it backwards.
    pub fn set_cursor(&self, chain: &ChainId, next_height: u64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ingest_cursor (chain, next_height) VALUES (?1, ?2)
             ON CONFLICT(chain) DO UPDATE SET next_height = MAX(next_height, excluded.next_height)",
            rusqlite::params![chain.as_str(), next_height],
        )?;
        Ok(())
    }
}

/// Output lookup served from the `outputs` table, for offline narrowing.
pub struct StoredOutputs<'a> {
    store: &'a RingStore,
    chain: ChainId,
}

impl<'a> StoredOutputs<'a> {
    pub fn new(store: &'a RingStore, chain: ChainId) -> Self {
        Self { store, chain }
    }
}

impl OutputLookup for StoredOutputs<'_> {
    fn output(&self, amount: u64, index: u64) -> Result<Option<Address>, LookupError> {
        self.store
            .output(&self.chain, amount, index)
            .map_err(|e| LookupError::Unavailable {
                chain: self.chain.clone(),
                message: e.to_string(),
            })
    }
}
