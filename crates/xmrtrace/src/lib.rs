//! xmrtrace: cross-fork ring intersection for Monero and its hard forks.
//!
//! A key image spent on two ledgers that share pre-fork history references rings drawn
//! from two independent output sets. Intersecting the rings' output keys leaves the true
//! spend plus whatever decoys happen to coincide. Read-only; no signatures are verified.

pub mod chain;
pub mod compute;
pub mod config;
pub mod report;
pub mod ring;
pub mod verify;

pub use chain::{Cache, DaemonLedger, FetchConfig, Fetcher, Ledger, LookupError, OutputLookup};
pub use compute::{
    merge_siblings, narrow_image, residual_stats, run_fork_pair, ForkPair, IndexResolver,
    ResidualStats, RunReport,
};
pub use config::ChainsConfig;
pub use report::ReportData;
pub use ring::{Address, ChainId, KeyImage, OutputRecord, RingRecord, RingStore, StoredOutputs};
pub use verify::{reproducibility_hash, ResidualBundle, VerificationResult};
