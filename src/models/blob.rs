//! Blob data models.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::kv::{MetadataMap, TagMap};
use crate::context::parse_http_date;
use crate::error::BlobResult;
use crate::transport::TransportRequest;

/// Blob types supported by Azure Blob Storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BlobType {
    #[default]
    BlockBlob,
    PageBlob,
    AppendBlob,
}

impl BlobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobType::BlockBlob => "BlockBlob",
            BlobType::PageBlob => "PageBlob",
            BlobType::AppendBlob => "AppendBlob",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BlockBlob" => Some(BlobType::BlockBlob),
            "PageBlob" => Some(BlobType::PageBlob),
            "AppendBlob" => Some(BlobType::AppendBlob),
            _ => None,
        }
    }
}

/// Access tiers for blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessTier {
    #[default]
    Hot,
    Cool,
    Cold,
    Archive,
}

impl AccessTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessTier::Hot => "Hot",
            AccessTier::Cool => "Cool",
            AccessTier::Cold => "Cold",
            AccessTier::Archive => "Archive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hot" => Some(AccessTier::Hot),
            "cool" => Some(AccessTier::Cool),
            "cold" => Some(AccessTier::Cold),
            "archive" => Some(AccessTier::Archive),
            _ => None,
        }
    }
}

/// Lease state for containers and blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LeaseState {
    #[default]
    Available,
    Leased,
    Expired,
    Breaking,
    Broken,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Available => "available",
            LeaseState::Leased => "leased",
            LeaseState::Expired => "expired",
            LeaseState::Breaking => "breaking",
            LeaseState::Broken => "broken",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "available" => Some(LeaseState::Available),
            "leased" => Some(LeaseState::Leased),
            "expired" => Some(LeaseState::Expired),
            "breaking" => Some(LeaseState::Breaking),
            "broken" => Some(LeaseState::Broken),
            _ => None,
        }
    }
}

/// Lease status for containers and blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LeaseStatus {
    #[default]
    Unlocked,
    Locked,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Unlocked => "unlocked",
            LeaseStatus::Locked => "locked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unlocked" => Some(LeaseStatus::Unlocked),
            "locked" => Some(LeaseStatus::Locked),
            _ => None,
        }
    }
}

/// Lease duration kind, as reported in `x-ms-lease-duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LeaseDuration {
    #[default]
    Infinite,
    Fixed,
}

impl LeaseDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseDuration::Infinite => "infinite",
            LeaseDuration::Fixed => "fixed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "infinite" => Some(LeaseDuration::Infinite),
            "fixed" => Some(LeaseDuration::Fixed),
            _ => None,
        }
    }
}

/// Addresses one blob, optionally a specific historical version of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHandle {
    pub container: String,
    pub name: String,
    pub version_id: Option<String>,
}

impl BlobHandle {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
            version_id: None,
        }
    }

    /// Same blob, pinned to `version_id`.
    pub fn with_version(&self, version_id: impl Into<String>) -> Self {
        Self {
            version_id: Some(version_id.into()),
            ..self.clone()
        }
    }

    /// Resource path, `/container/name`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.container, self.name)
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_id {
            Some(v) => write!(f, "{}?versionid={}", self.path(), v),
            None => f.write_str(&self.path()),
        }
    }
}

/// The HTTP-header subset of blob properties. Replaced as a unit: a field left
/// `None` is cleared on the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHttpHeaders {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub content_md5: Option<String>,
}

impl BlobHttpHeaders {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_language(mut self, language: impl Into<String>) -> Self {
        self.content_language = Some(language.into());
        self
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }

    /// Writes the present fields as `x-ms-blob-*` request headers.
    pub(crate) fn apply(&self, request: &mut TransportRequest) -> BlobResult<()> {
        let fields = [
            ("x-ms-blob-content-type", &self.content_type),
            ("x-ms-blob-content-encoding", &self.content_encoding),
            ("x-ms-blob-content-language", &self.content_language),
            ("x-ms-blob-content-disposition", &self.content_disposition),
            ("x-ms-blob-cache-control", &self.cache_control),
            ("x-ms-blob-content-md5", &self.content_md5),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                request.set_header(name, value)?;
            }
        }
        Ok(())
    }
}

/// Blob properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobProperties {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub content_md5: Option<String>,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub created_on: Option<DateTime<Utc>>,
    pub blob_type: BlobType,
    pub access_tier: Option<AccessTier>,
    pub lease_state: LeaseState,
    pub lease_status: LeaseStatus,
    pub lease_duration: Option<LeaseDuration>,
    pub version_id: Option<String>,
    pub tag_count: Option<u32>,
    pub metadata: MetadataMap,
}

impl BlobProperties {
    /// Returns the HTTP-header subset.
    pub fn http_headers(&self) -> BlobHttpHeaders {
        BlobHttpHeaders {
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            content_language: self.content_language.clone(),
            content_disposition: self.content_disposition.clone(),
            cache_control: self.cache_control.clone(),
            content_md5: self.content_md5.clone(),
        }
    }

    /// Overwrites the HTTP-header subset.
    pub fn set_http_headers(&mut self, headers: BlobHttpHeaders) {
        self.content_type = headers.content_type;
        self.content_encoding = headers.content_encoding;
        self.content_language = headers.content_language;
        self.content_disposition = headers.content_disposition;
        self.cache_control = headers.cache_control;
        self.content_md5 = headers.content_md5;
    }

    /// Parses a Get Blob Properties (HEAD) response.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, String> {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let owned = |name: &str| get(name).map(String::from);

        let content_length = match get("content-range").and_then(total_from_content_range) {
            Some(total) => total,
            None => get("content-length")
                .map(|v| v.parse::<u64>().map_err(|_| format!("bad Content-Length {v:?}")))
                .transpose()?
                .unwrap_or(0),
        };
        let etag = owned("etag").ok_or_else(|| "response has no ETag".to_string())?;
        let last_modified = get("last-modified")
            .and_then(parse_http_date)
            .ok_or_else(|| "response has no valid Last-Modified".to_string())?;

        let mut metadata = MetadataMap::new();
        for (name, value) in headers {
            if let Some(key) = name.as_str().strip_prefix("x-ms-meta-") {
                if let Ok(value) = value.to_str() {
                    metadata.insert_unchecked(key, value);
                }
            }
        }

        Ok(Self {
            content_length,
            content_type: owned("content-type"),
            content_encoding: owned("content-encoding"),
            content_language: owned("content-language"),
            content_disposition: owned("content-disposition"),
            cache_control: owned("cache-control"),
            content_md5: owned("x-ms-blob-content-md5").or_else(|| owned("content-md5")),
            etag,
            last_modified,
            created_on: get("x-ms-creation-time").and_then(parse_http_date),
            blob_type: get("x-ms-blob-type")
                .and_then(BlobType::from_str)
                .unwrap_or_default(),
            access_tier: get("x-ms-access-tier").and_then(AccessTier::from_str),
            lease_state: get("x-ms-lease-state")
                .and_then(LeaseState::from_str)
                .unwrap_or_default(),
            lease_status: get("x-ms-lease-status")
                .and_then(LeaseStatus::from_str)
                .unwrap_or_default(),
            lease_duration: get("x-ms-lease-duration").and_then(LeaseDuration::from_str),
            version_id: owned("x-ms-version-id"),
            tag_count: get("x-ms-tag-count").and_then(|v| v.parse().ok()),
            metadata,
        })
    }
}

/// `bytes 0-99/1234` -> 1234.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.parse().ok()
}

/// One blob as it appears in a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobItem {
    pub name: String,
    pub deleted: bool,
    pub version_id: Option<String>,
    pub is_current_version: Option<bool>,
    pub properties: BlobProperties,
    /// Present when the listing asked for tags.
    pub tags: Option<TagMap>,
}
