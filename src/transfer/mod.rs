//! Chunked transfer engine.
//!
//! Uploads go single-shot below `single_upload_threshold` and through staged
//! blocks plus one commit above it. Downloads probe the blob once, pin its
//! ETag, then read fixed-size ranges concurrently and hand them to the caller
//! in offset order.

mod download;
mod upload;

pub(crate) use download::{download_stream, download_to};
pub(crate) use upload::{upload_bytes, upload_stream};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use futures::stream::BoxStream;
use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;

use crate::client::AccessConditions;
use crate::config::{ClientConfig, TransferOptions};
use crate::error::{BlobError, BlobResult};
use crate::models::{AccessTier, BlobHttpHeaders, MetadataMap, TagMap};
use crate::transport::TransportRequest;

/// Ordered byte chunks of a pull-based download.
pub type ChunkStream = BoxStream<'static, BlobResult<Bytes>>;

/// Base64 MD5 digest, as carried in `Content-MD5`.
pub(crate) fn md5_base64(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

/// What to write along with an upload's content.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub http_headers: BlobHttpHeaders,
    pub metadata: MetadataMap,
    /// Index tags sent as `x-ms-tags`; `None` keeps the blob's current tags.
    pub tags: Option<TagMap>,
    pub access_tier: Option<AccessTier>,
    /// When false the upload fails if the blob already exists.
    pub overwrite: bool,
    pub conditions: AccessConditions,
    /// Overrides the client's transfer settings for this upload.
    pub transfer: Option<TransferOptions>,
    pub cancel: Option<CancellationToken>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            http_headers: BlobHttpHeaders::default(),
            metadata: MetadataMap::new(),
            tags: None,
            access_tier: None,
            overwrite: true,
            conditions: AccessConditions::default(),
            transfer: None,
            cancel: None,
        }
    }
}

impl UploadOptions {
    pub fn with_http_headers(mut self, headers: BlobHttpHeaders) -> Self {
        self.http_headers = headers;
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_tags(mut self, tags: TagMap) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_access_tier(mut self, tier: AccessTier) -> Self {
        self.access_tier = Some(tier);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_conditions(mut self, conditions: AccessConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferOptions) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Headers shared by Put Blob and Put Block List.
    pub(crate) fn apply(&self, request: &mut TransportRequest) -> BlobResult<()> {
        self.http_headers.apply(request)?;
        for (key, value) in self.metadata.iter() {
            request.set_header(&format!("x-ms-meta-{key}"), value)?;
        }
        if let Some(ref tags) = self.tags {
            request.set_header("x-ms-tags", tags.to_header_value())?;
        }
        if let Some(tier) = self.access_tier {
            request.set_header("x-ms-access-tier", tier.as_str())?;
        }
        self.conditions.apply(request)?;
        if !self.overwrite && self.conditions.if_none_match.is_none() {
            request.set_header("if-none-match", "*")?;
        }
        Ok(())
    }
}

/// Which part of a blob to read and how.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Inclusive byte range; an open end reads to the end of the blob.
    pub range: Option<(u64, Option<u64>)>,
    /// Applied to the size probe; range reads are pinned to the probed ETag.
    pub conditions: AccessConditions,
    pub transfer: Option<TransferOptions>,
    pub cancel: Option<CancellationToken>,
}

impl DownloadOptions {
    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_conditions(mut self, conditions: AccessConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferOptions) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Per-call transfer settings, falling back to the client's.
fn effective(
    overrides: Option<&TransferOptions>,
    config: &ClientConfig,
) -> BlobResult<TransferOptions> {
    let transfer = overrides.cloned().unwrap_or_else(|| config.transfer.clone());
    transfer.validate()?;
    Ok(transfer)
}

fn cancelled(operation: &'static str, resource: &str) -> BlobError {
    BlobError::Cancelled {
        operation,
        resource: resource.to_string(),
    }
}
