//! Block data models for block blobs.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest decoded block id the service accepts.
pub const MAX_BLOCK_ID_LEN: usize = 64;

/// Opaque base64 block id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    /// Id for block `index` of one upload. Every id of the upload decodes to
    /// `{upload_tag}-{index:06}`, so all ids share one encoded length.
    pub fn for_index(upload_tag: &str, index: usize) -> Self {
        Self(STANDARD.encode(format!("{upload_tag}-{index:06}")))
    }

    /// Wraps an id received from the wire.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the id, failing on invalid base64 or oversize ids.
    pub fn decode(&self) -> Option<Vec<u8>> {
        STANDARD
            .decode(&self.0)
            .ok()
            .filter(|raw| !raw.is_empty() && raw.len() <= MAX_BLOCK_ID_LEN)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Block state in a block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    Uncommitted,
    Committed,
}

impl BlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Uncommitted => "Uncommitted",
            BlockState::Committed => "Committed",
        }
    }
}

/// Which half of the block list Get Block List returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockListType {
    Committed,
    Uncommitted,
    #[default]
    All,
}

impl BlockListType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockListType::Committed => "committed",
            BlockListType::Uncommitted => "uncommitted",
            BlockListType::All => "all",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "committed" => BlockListType::Committed,
            "uncommitted" => BlockListType::Uncommitted,
            _ => BlockListType::All,
        }
    }
}

/// One entry of a block list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockListEntry {
    pub id: BlockId,
    pub state: BlockState,
    pub size: u64,
}

/// Ordered block list. Committed order is the byte layout of the blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockList {
    pub entries: Vec<BlockListEntry>,
}

impl BlockList {
    pub fn committed(&self) -> impl Iterator<Item = &BlockListEntry> {
        self.entries.iter().filter(|e| e.state == BlockState::Committed)
    }

    pub fn uncommitted(&self) -> impl Iterator<Item = &BlockListEntry> {
        self.entries.iter().filter(|e| e.state == BlockState::Uncommitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_of_one_upload_share_encoded_length() {
        let tag = "3f2a9c1e";
        let lengths: Vec<usize> = [0usize, 9, 10, 999, 12_345]
            .iter()
            .map(|&i| BlockId::for_index(tag, i).as_str().len())
            .collect();
        assert!(lengths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn decode_validates() {
        assert_eq!(
            BlockId::for_index("u", 3).decode().as_deref(),
            Some(b"u-000003".as_slice())
        );
        assert!(BlockId::from_encoded("***").decode().is_none());
        assert!(BlockId::from_encoded(STANDARD.encode([0u8; 65])).decode().is_none());
    }
}
