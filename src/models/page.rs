//! Listing pages and the entries they carry.

use serde::{Deserialize, Serialize};

use super::blob::BlobItem;
use super::kv::TagMap;

/// One page of a listing. A `None` continuation token marks the last page.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage<T> {
    pub entries: Vec<T>,
    pub continuation_token: Option<String>,
}

impl<T> ListingPage<T> {
    pub fn is_last(&self) -> bool {
        self.continuation_token.is_none()
    }
}

/// A virtual directory produced by a delimiter listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPrefix {
    /// Full prefix including the trailing delimiter, e.g. `a/b/`.
    pub name: String,
    pub delimiter: String,
    /// Depth of the listing that produced this node; the root listing is 0.
    pub depth: usize,
    /// Page size of that listing, reused when descending into this prefix.
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// Either a leaf blob or a virtual directory.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobListEntry {
    Blob(BlobItem),
    Prefix(BlobPrefix),
}

impl BlobListEntry {
    pub fn name(&self) -> &str {
        match self {
            BlobListEntry::Blob(b) => &b.name,
            BlobListEntry::Prefix(p) => &p.name,
        }
    }

    pub fn as_blob(&self) -> Option<&BlobItem> {
        match self {
            BlobListEntry::Blob(b) => Some(b),
            BlobListEntry::Prefix(_) => None,
        }
    }

    pub fn as_prefix(&self) -> Option<&BlobPrefix> {
        match self {
            BlobListEntry::Prefix(p) => Some(p),
            BlobListEntry::Blob(_) => None,
        }
    }
}

/// Extra datasets a blob listing may return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListBlobsInclude {
    pub metadata: bool,
    pub tags: bool,
    pub deleted: bool,
    pub versions: bool,
}

impl ListBlobsInclude {
    pub fn with_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    pub fn with_tags(mut self) -> Self {
        self.tags = true;
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn with_versions(mut self) -> Self {
        self.versions = true;
        self
    }

    /// Value of the `include` query parameter, if anything is requested.
    pub fn as_query(&self) -> Option<String> {
        let parts: Vec<&str> = [
            (self.metadata, "metadata"),
            (self.tags, "tags"),
            (self.deleted, "deleted"),
            (self.versions, "versions"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
        (!parts.is_empty()).then(|| parts.join(","))
    }
}

/// A blob matched by a tag query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedBlobItem {
    pub container: String,
    pub name: String,
    pub tags: TagMap,
}

/// Everything needed to resume a paused blob listing in another session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCheckpoint {
    pub container: String,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub depth: usize,
    pub page_size: u32,
    pub include: ListBlobsInclude,
    pub marker: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_query() {
        assert_eq!(ListBlobsInclude::default().as_query(), None);
        assert_eq!(
            ListBlobsInclude::default().with_tags().with_metadata().as_query().as_deref(),
            Some("metadata,tags")
        );
    }

    #[test]
    fn checkpoint_serializes() {
        let checkpoint = ListingCheckpoint {
            container: "logs".into(),
            prefix: Some("2024/".into()),
            delimiter: None,
            depth: 0,
            page_size: 5,
            include: ListBlobsInclude::default().with_deleted(),
            marker: Some("2024/05.log".into()),
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: ListingCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
