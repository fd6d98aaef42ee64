//! Payload Decoder
//!
//! Decodes the JSON payloads arriving from the block feed and the block source
//! into typed structures. Every boundary is validated here: a payload that does
//! not match the expected shape is rejected instead of being read field by field.

use serde::Deserialize;
use thiserror::Error;

/// Number of satoshis in one whole bitcoin
pub const SATOSHIS_PER_BTC: u64 = 100_000_000;

/// Length of a block hash in bytes
pub const BLOCK_HASH_LEN: usize = 32;

/// Feed operation carrying a new block header
pub const BLOCK_OP: &str = "block";

/// Errors that can occur while decoding external payloads
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Invalid block hash '{0}': {1}")]
    InvalidBlockHash(String, String),
}

/// Header fields pushed by the feed for a newly mined block
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BlockHeader {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default, rename = "nTx")]
    pub n_tx: Option<u64>,
}

/// Event envelope as delivered by the feed connection
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FeedEnvelope {
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub x: Option<BlockHeader>,
}

/// A block notification, consumed once by the pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockNotification {
    /// Feed operation name, if the envelope carried one
    pub op: Option<String>,
    /// Block hash, if the envelope carried one
    pub hash: Option<String>,
    /// Block height as announced by the feed
    pub height: Option<u64>,
    /// Transaction count as announced by the feed
    pub n_tx: Option<u64>,
}

impl BlockNotification {
    /// Create a notification for a block hash with no further metadata
    pub fn for_hash(hash: impl Into<String>) -> Self {
        Self {
            op: Some(BLOCK_OP.to_string()),
            hash: Some(hash.into()),
            ..Default::default()
        }
    }

    /// Whether this envelope announces a block
    pub fn is_block(&self) -> bool {
        self.op.as_deref().map_or(true, |op| op == BLOCK_OP)
    }

    /// The validated block hash, or `None` if the notification does not name a block
    pub fn block_hash(&self) -> Option<&str> {
        if !self.is_block() {
            return None;
        }
        self.hash
            .as_deref()
            .filter(|hash| validate_block_hash(hash).is_ok())
    }
}

impl From<FeedEnvelope> for BlockNotification {
    fn from(envelope: FeedEnvelope) -> Self {
        let header = envelope.x.unwrap_or_default();
        Self {
            op: envelope.op,
            hash: header.hash,
            height: header.height,
            n_tx: header.n_tx,
        }
    }
}

/// Previous output referenced by a transaction input
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PrevOut {
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub value: Option<u64>,
}

/// Transaction input; coinbase inputs carry no previous output
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawInput {
    #[serde(default)]
    pub prev_out: Option<PrevOut>,
}

impl RawInput {
    /// Address of the spent output, if it resolves to one
    pub fn address(&self) -> Option<&str> {
        self.prev_out
            .as_ref()
            .and_then(|prev| prev.addr.as_deref())
            .filter(|addr| !addr.is_empty())
    }
}

/// Transaction output with its value in satoshis
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawOutput {
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub value: u64,
}

impl RawOutput {
    /// Receiving address, if the output script resolves to one
    pub fn address(&self) -> Option<&str> {
        self.addr.as_deref().filter(|addr| !addr.is_empty())
    }
}

/// Transaction as delivered by the block source
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawTransaction {
    pub hash: String,
    #[serde(default)]
    pub inputs: Vec<RawInput>,
    #[serde(default)]
    pub out: Vec<RawOutput>,
}

/// Full block payload returned by the block source
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawBlock {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default, rename = "nTx", alias = "n_tx")]
    pub n_tx: Option<u64>,
    pub tx: Vec<RawTransaction>,
}

/// Decode a raw feed message into a block notification
///
/// # Arguments
/// * `text` - The text frame received on the feed connection
///
/// # Returns
/// A `BlockNotification`; the block hash inside it is not yet validated
pub fn decode_notification(text: &str) -> Result<BlockNotification, DecodeError> {
    if text.trim().is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    let envelope: FeedEnvelope = serde_json::from_str(text)?;
    Ok(envelope.into())
}

/// Decode a full block body returned by the block source
pub fn decode_block(body: &[u8]) -> Result<RawBlock, DecodeError> {
    if body.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    Ok(serde_json::from_slice(body)?)
}

/// Check that a block hash is 32 bytes of hex
pub fn validate_block_hash(hash: &str) -> Result<(), DecodeError> {
    let bytes = hash_to_bytes(hash)?;
    if bytes.len() != BLOCK_HASH_LEN {
        return Err(DecodeError::InvalidBlockHash(
            hash.to_string(),
            format!("expected {} bytes, got {}", BLOCK_HASH_LEN, bytes.len()),
        ));
    }
    Ok(())
}

/// Parse a hex hash string to bytes (with or without 0x prefix)
pub fn hash_to_bytes(hash: &str) -> Result<Vec<u8>, DecodeError> {
    let stripped = hash.strip_prefix("0x").unwrap_or(hash);
    hex::decode(stripped).map_err(|e| DecodeError::InvalidBlockHash(hash.to_string(), e.to_string()))
}

/// Convert a satoshi amount to whole bitcoin
pub fn satoshis_to_btc(satoshis: u64) -> f64 {
    satoshis as f64 / SATOSHIS_PER_BTC as f64
}

/// Convert a whole-bitcoin amount to satoshis, rounding to the nearest unit
pub fn btc_to_satoshis(btc: f64) -> u64 {
    if !btc.is_finite() || btc <= 0.0 {
        return 0;
    }
    (btc * SATOSHIS_PER_BTC as f64).round() as u64
}
