//! Ring offset decoding and extraction of ring inputs from daemon JSON.

use crate::ring::KeyImage;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty key offset list")]
    EmptyOffsets,
    #[error("key offset overflow at position {0}")]
    Overflow(usize),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convert relative key offsets into absolute output indices.
pub fn decode_offsets(offsets: &[u64]) -> Result<Vec<u64>, DecodeError> {
    let (first, rest) = offsets.split_first().ok_or(DecodeError::EmptyOffsets)?;
    let mut indices = Vec::with_capacity(offsets.len());
    indices.push(*first);
    let mut acc = *first;
    for (pos, off) in rest.iter().enumerate() {
        acc = acc.checked_add(*off).ok_or(DecodeError::Overflow(pos + 1))?;
        indices.push(acc);
    }
    Ok(indices)
}

/// One `txin_to_key` input: denomination, key image and relative ring offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingInput {
    pub amount: u64,
    pub key_image: KeyImage,
    pub key_offsets: Vec<u64>,
}

#[derive(Deserialize)]
struct TxJson {
    #[serde(default)]
    vin: Vec<TxInJson>,
}

#[derive(Deserialize)]
struct TxInJson {
    key: Option<TxInKeyJson>,
}

#[derive(Deserialize)]
struct TxInKeyJson {
    amount: u64,
    key_offsets: Vec<u64>,
    k_image: String,
}

/// Extract key inputs from a transaction's `as_json` payload. Coinbase (`gen`) inputs are skipped.
pub fn inputs_from_tx_json(as_json: &str) -> Result<Vec<RingInput>, DecodeError> {
    let tx: TxJson = serde_json::from_str(as_json)?;
    Ok(tx
        .vin
        .into_iter()
        .filter_map(|i| i.key)
        .map(|k| RingInput {
            amount: k.amount,
            key_image: KeyImage::new(k.k_image),
            key_offsets: k.key_offsets,
        })
        .collect())
}

#[derive(Deserialize)]
struct BlockJson {
    #[serde(default)]
    tx_hashes: Vec<String>,
}

/// Extract non-coinbase transaction hashes from a `get_block` result's `json` field.
pub fn tx_hashes_from_block_json(json: &str) -> Result<Vec<String>, DecodeError> {
    let block: BlockJson = serde_json::from_str(json)?;
    Ok(block.tx_hashes)
}
