//! Daemon access: offset decoding, response caching, RPC fetching and the ledger seams.

mod cache;
pub(crate) mod decode;
pub(crate) mod fetch;
mod ledger;

pub use cache::{Cache, CacheError};
pub use decode::{decode_offsets, inputs_from_tx_json, tx_hashes_from_block_json, DecodeError, RingInput};
pub use fetch::{
    BlockResult, DaemonTransaction, FetchConfig, FetchError, Fetcher, OutputEntry, OutputRef,
    OutsResponse, TransactionsResponse,
};
pub use ledger::{DaemonLedger, Ledger, LookupError, OutputLookup};
