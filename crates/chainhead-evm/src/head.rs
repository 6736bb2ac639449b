//! EVM block header as tracked by the head tracker.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use chainhead_core::head::Head;

/// An EVM block header.
///
/// Cloning is cheap: the header lives behind an `Arc`. Hashes are stored
/// lowercase with their `0x` prefix.
#[derive(Clone)]
pub struct EvmHead(Arc<EvmHeadInner>);

struct EvmHeadInner {
    number: u64,
    hash: String,
    parent_hash: String,
    timestamp: u64,
    chain_id: u64,
    parent: Option<EvmHead>,
}

impl EvmHead {
    pub fn new(
        number: u64,
        hash: impl Into<String>,
        parent_hash: impl Into<String>,
        timestamp: u64,
        chain_id: u64,
    ) -> Self {
        Self(Arc::new(EvmHeadInner {
            number,
            hash: hash.into().to_lowercase(),
            parent_hash: parent_hash.into().to_lowercase(),
            timestamp,
            chain_id,
            parent: None,
        }))
    }

    /// Parse a block object from `eth_getBlockByNumber` or a `newHeads`
    /// notification. Returns `None` for pending blocks and malformed input.
    pub fn from_json(v: &Value, chain_id: u64) -> Option<Self> {
        Some(Self::new(
            parse_hex_u64(v["number"].as_str()?)?,
            v["hash"].as_str()?,
            v["parentHash"].as_str()?,
            v["timestamp"].as_str().and_then(parse_hex_u64).unwrap_or(0),
            chain_id,
        ))
    }

    pub fn hash(&self) -> &str {
        &self.0.hash
    }

    /// Block timestamp in seconds since the epoch.
    pub fn timestamp(&self) -> u64 {
        self.0.timestamp
    }
}

impl fmt::Debug for EvmHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmHead")
            .field("number", &self.0.number)
            .field("hash", &self.0.hash)
            .field("parent_hash", &self.0.parent_hash)
            .field("chain_id", &self.0.chain_id)
            .field("chain_length", &self.chain_length())
            .finish()
    }
}

impl Head for EvmHead {
    type Hash = String;
    type ChainId = u64;

    fn block_number(&self) -> u64 {
        self.0.number
    }

    fn block_hash(&self) -> String {
        self.0.hash.clone()
    }

    fn parent_hash(&self) -> String {
        self.0.parent_hash.clone()
    }

    fn chain_id(&self) -> u64 {
        self.0.chain_id
    }

    fn is_valid(&self) -> bool {
        is_hash(&self.0.hash) && is_hash(&self.0.parent_hash)
    }

    fn parent(&self) -> Option<Self> {
        self.0.parent.clone()
    }

    fn with_parent(&self, parent: Option<Self>) -> Self {
        Self(Arc::new(EvmHeadInner {
            number: self.0.number,
            hash: self.0.hash.clone(),
            parent_hash: self.0.parent_hash.clone(),
            timestamp: self.0.timestamp,
            chain_id: self.0.chain_id,
            parent,
        }))
    }
}

/// `0x` followed by 64 hex digits.
fn is_hash(s: &str) -> bool {
    s.len() == 66 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse a hex quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}
