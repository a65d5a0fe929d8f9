//! Block heads as delivered by the chain source.
//!
//! A [Head] is an immutable node in the block tree: height, identity, and the identity of its
//! parent. Decode from the JSON-RPC block header shape (`eth_subscribe newHeads` /
//! `eth_getBlockByNumber`).

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// 32-byte block identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s)).context("parse hex hash")?;
        if bytes.len() != 32 {
            anyhow::bail!("Expected 32 bytes, got {}", bytes.len());
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(BlockHash(out))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

/// Abbreviated form for logs: `0x1234abcd…`.
impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}…", hex::encode(&self.0[..4]))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Structural problems with a reported head.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeadError {
    #[error("head at height {0} has no identity")]
    MissingIdentity(u64),

    #[error("head height {0} leaves no room for a child")]
    HeightOutOfRange(u64),

    #[error("head {0} names itself as parent")]
    SelfParent(BlockHash),

    #[error("head {hash} re-reported with different ancestry (height {known_height} vs {height})")]
    Conflicting {
        hash: BlockHash,
        known_height: u64,
        height: u64,
    },
}

/// A block reference: height, identity, and parent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Head {
    pub height: u64,
    pub hash: BlockHash,
    #[serde(rename = "parent_hash")]
    pub parent_hash: BlockHash,
}

impl Head {
    pub fn new(height: u64, hash: BlockHash, parent_hash: BlockHash) -> Self {
        Self {
            height,
            hash,
            parent_hash,
        }
    }

    /// Rejects heads that cannot take part in ancestry walks.
    pub fn validate(&self) -> std::result::Result<(), HeadError> {
        if self.hash.is_zero() {
            return Err(HeadError::MissingIdentity(self.height));
        }
        if self.hash == self.parent_hash {
            return Err(HeadError::SelfParent(self.hash));
        }
        if self.height == u64::MAX {
            return Err(HeadError::HeightOutOfRange(self.height));
        }
        Ok(())
    }

    /// True if `self` is the direct child of `parent`.
    pub fn extends(&self, parent: &Head) -> bool {
        self.parent_hash == parent.hash && parent.height.checked_add(1) == Some(self.height)
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.height, self.hash)
    }
}

/// Decode a JSON-RPC block header into a [Head].
pub fn decode_rpc_header(value: &Value) -> Result<Head> {
    let height = parse_hex_u64(
        value
            .get("number")
            .and_then(|n| n.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing number"))?,
    )?;
    let hash = BlockHash::from_hex(
        value
            .get("hash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing hash"))?,
    )
    .context("decode hash")?;
    let parent_hash = BlockHash::from_hex(
        value
            .get("parentHash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing parentHash"))?,
    )
    .context("decode parentHash")?;
    let head = Head::new(height, hash, parent_hash);
    head.validate()?;
    Ok(head)
}

fn parse_hex_u64(s: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).context("parse hex u64")
}
