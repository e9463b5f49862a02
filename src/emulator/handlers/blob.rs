//! Blob-level handlers: reads, properties, metadata, tags, deletion and copy.

use bytes::Bytes;
use http::StatusCode;
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::config::MAX_RANGE_MD5_SIZE;
use crate::context::RequestContext;
use crate::emulator::store::{new_etag, BlobModel, MetadataStore};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::{LeaseRecord, LeaseScope};
use crate::models::TagMap;
use crate::transport::TransportResponse;
use crate::xml::{deserialize::parse_tags, serialize::serialize_tags};

use super::{
    add_blob_property_headers, add_etag_headers, build_response, check_conditions,
    common_headers, content_md5, put_header, xml_response,
};

/// Loads the addressed blob, honouring `versionid`.
pub(crate) async fn load_blob(
    ctx: &RequestContext,
    metadata: &Arc<dyn MetadataStore>,
) -> StorageResult<BlobModel> {
    let container = ctx.container_name()?;
    let name = ctx.blob_name()?;
    match ctx.version_id() {
        Some(version) => metadata.get_blob_version(container, name, version).await,
        None => metadata.get_blob(container, name).await,
    }
}

/// Takes the live blob out of a write slot, or fails with BlobNotFound.
pub(crate) fn live_blob(slot: &mut Option<BlobModel>) -> StorageResult<&mut BlobModel> {
    match slot {
        Some(blob) if !blob.deleted => Ok(blob),
        _ => Err(StorageError::new(ErrorCode::BlobNotFound)),
    }
}

/// Applies the lease gate and the ETag conditions of a write request.
pub(crate) fn check_write(ctx: &RequestContext, blob: &mut BlobModel) -> StorageResult<()> {
    blob.lease
        .check_write(ctx.lease_id(), LeaseScope::Blob, ctx.timestamp)
        .map_err(StorageError::new)?;
    check_conditions(ctx, Some(&blob.properties.etag))
}

/// GET /{container}/{blob} - Download blob.
pub async fn download_blob(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let blob = load_blob(ctx, &metadata).await?;
    check_conditions(ctx, Some(&blob.properties.etag))?;

    let size = blob.content.len() as u64;
    let (data, status, content_range) = match ctx.range()? {
        None => (blob.content.clone(), StatusCode::OK, None),
        Some((start, end)) => {
            if start >= size {
                return Err(StorageError::new(ErrorCode::InvalidRange));
            }
            let end = end.map_or(size - 1, |e| e.min(size - 1));
            let data = blob.content.slice(start as usize..=end as usize);
            let range = format!("bytes {start}-{end}/{size}");
            (data, StatusCode::PARTIAL_CONTENT, Some(range))
        }
    };

    let mut headers = common_headers(ctx);
    add_blob_property_headers(&mut headers, &blob.observed_properties(ctx.timestamp));
    put_header(&mut headers, "content-length", &data.len().to_string());
    if let Some(range) = content_range {
        put_header(&mut headers, "content-range", &range);
    }

    if ctx.header("x-ms-range-get-content-md5") == Some("true") {
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(StorageError::with_message(
                ErrorCode::InvalidHeaderValue,
                "x-ms-range-get-content-md5 requires a range",
            ));
        }
        if data.len() as u64 > MAX_RANGE_MD5_SIZE {
            return Err(StorageError::new(ErrorCode::OutOfRangeInput));
        }
        put_header(&mut headers, "content-md5", &content_md5(&data));
    } else if status == StatusCode::OK {
        if let Some(ref md5) = blob.properties.content_md5 {
            put_header(&mut headers, "content-md5", md5);
        }
    }

    Ok(build_response(status, headers, data))
}

/// HEAD /{container}/{blob} - Get blob properties.
pub async fn get_blob_properties(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let blob = load_blob(ctx, &metadata).await?;
    check_conditions(ctx, Some(&blob.properties.etag))?;

    let mut headers = common_headers(ctx);
    add_blob_property_headers(&mut headers, &blob.observed_properties(ctx.timestamp));
    put_header(&mut headers, "content-length", &blob.content.len().to_string());
    Ok(build_response(StatusCode::OK, headers, Bytes::new()))
}

/// DELETE /{container}/{blob} - Soft-delete a blob, or drop one archived
/// version when `versionid` is given.
pub async fn delete_blob(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let container = ctx.container_name()?;
    let name = ctx.blob_name()?;

    if let Some(version) = ctx.version_id() {
        let current = metadata.get_blob(container, name).await.ok();
        if current.as_ref().and_then(|b| b.version_id()) != Some(version) {
            metadata.delete_blob_version(container, name, version).await?;
            return Ok(build_response(StatusCode::ACCEPTED, common_headers(ctx), Bytes::new()));
        }
    }

    metadata
        .write_blob(container, name, &mut |slot| {
            let blob = live_blob(slot)?;
            check_write(ctx, blob)?;
            blob.deleted = true;
            blob.deleted_on = Some(ctx.timestamp);
            blob.lease = LeaseRecord::default();
            Ok(())
        })
        .await?;
    debug!(container = %container, blob = %name, "blob soft-deleted");

    Ok(build_response(StatusCode::ACCEPTED, common_headers(ctx), Bytes::new()))
}

/// PUT /{container}/{blob}?comp=undelete - Restore a soft-deleted blob.
pub async fn undelete_blob(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    metadata
        .write_blob(ctx.container_name()?, ctx.blob_name()?, &mut |slot| {
            let blob = slot
                .as_mut()
                .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
            blob.deleted = false;
            blob.deleted_on = None;
            Ok(())
        })
        .await?;
    Ok(build_response(StatusCode::OK, common_headers(ctx), Bytes::new()))
}

/// PUT /{container}/{blob}?comp=properties - Replace the HTTP header set.
pub async fn set_blob_properties(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let replacement = ctx.http_headers();
    let blob = metadata
        .write_blob(ctx.container_name()?, ctx.blob_name()?, &mut |slot| {
            let blob = live_blob(slot)?;
            check_write(ctx, blob)?;
            blob.properties.set_http_headers(replacement.clone());
            blob.properties.etag = new_etag();
            blob.properties.last_modified = ctx.timestamp;
            Ok(())
        })
        .await?
        .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;

    let mut headers = common_headers(ctx);
    add_etag_headers(&mut headers, &blob.properties.etag, &blob.properties.last_modified);
    Ok(build_response(StatusCode::OK, headers, Bytes::new()))
}

/// PUT /{container}/{blob}?comp=metadata - Replace user metadata.
pub async fn set_blob_metadata(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let replacement = ctx.metadata()?;
    let version = metadata.next_version_id();
    let blob = metadata
        .write_blob(ctx.container_name()?, ctx.blob_name()?, &mut |slot| {
            let blob = live_blob(slot)?;
            check_write(ctx, blob)?;
            blob.properties.metadata = replacement.clone();
            blob.touch(version.clone());
            Ok(())
        })
        .await?
        .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;

    let mut headers = common_headers(ctx);
    add_etag_headers(&mut headers, &blob.properties.etag, &blob.properties.last_modified);
    if let Some(v) = blob.version_id() {
        put_header(&mut headers, "x-ms-version-id", v);
    }
    Ok(build_response(StatusCode::OK, headers, Bytes::new()))
}

/// GET /{container}/{blob}?comp=tags - Get blob tags.
pub async fn get_blob_tags(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let blob = load_blob(ctx, &metadata).await?;
    let mut response = xml_response(ctx, serialize_tags(&blob.tags));
    put_header(&mut response.headers, "etag", &blob.properties.etag);
    Ok(response)
}

/// PUT /{container}/{blob}?comp=tags - Replace blob tags. Tags are not part
/// of the blob's ETag, so the ETag is left unchanged.
pub async fn set_blob_tags(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let xml = std::str::from_utf8(&ctx.body)
        .map_err(|_| StorageError::new(ErrorCode::InvalidXmlDocument))?;
    let tags = TagMap::try_from_pairs(parse_tags(xml)?)
        .map_err(|e| StorageError::with_message(ErrorCode::InvalidTag, e.to_string()))?;

    metadata
        .write_blob(ctx.container_name()?, ctx.blob_name()?, &mut |slot| {
            let blob = live_blob(slot)?;
            check_write(ctx, blob)?;
            blob.tags = tags.clone();
            Ok(())
        })
        .await?;
    Ok(build_response(StatusCode::NO_CONTENT, common_headers(ctx), Bytes::new()))
}

/// Where a copy reads from.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CopySource {
    pub container: String,
    pub blob: String,
    pub version_id: Option<String>,
}

/// Parses `x-ms-copy-source`: an absolute URL under the account endpoint, or
/// a `/container/blob` path with an optional query.
pub(crate) fn parse_copy_source(source: &str, account: &str) -> StorageResult<CopySource> {
    let invalid = || StorageError::new(ErrorCode::InvalidSourceBlobUrl);
    let absolute = source.starts_with("http://") || source.starts_with("https://");
    let url = if absolute {
        Url::parse(source).map_err(|_| invalid())?
    } else {
        Url::parse("http://localhost")
            .and_then(|base| base.join(source))
            .map_err(|_| invalid())?
    };

    let path = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|_| invalid())?;
    let mut path = path.trim_start_matches('/');
    if absolute {
        if let Some(rest) = path.strip_prefix(account).and_then(|r| r.strip_prefix('/')) {
            path = rest;
        }
    }

    let (container, blob) = path.split_once('/').ok_or_else(invalid)?;
    if container.is_empty() || blob.is_empty() {
        return Err(invalid());
    }
    let version_id = url
        .query_pairs()
        .find(|(k, _)| k == "versionid")
        .map(|(_, v)| v.into_owned());

    Ok(CopySource {
        container: container.to_string(),
        blob: blob.to_string(),
        version_id,
    })
}

/// PUT /{container}/{blob} with x-ms-copy-source - Synchronous copy.
pub async fn copy_blob(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
    account: &str,
) -> StorageResult<TransportResponse> {
    let source_header = ctx
        .copy_source()
        .ok_or_else(|| StorageError::new(ErrorCode::MissingRequiredHeader))?;
    let source = parse_copy_source(source_header, account)?;
    let source_blob = match source.version_id.as_deref() {
        Some(v) => metadata.get_blob_version(&source.container, &source.blob, v).await,
        None => metadata.get_blob(&source.container, &source.blob).await,
    }
    .map_err(|_| StorageError::new(ErrorCode::CannotVerifyCopySource))?;

    let container = ctx.container_name()?;
    let name = ctx.blob_name()?;
    let request_metadata = ctx.metadata()?;
    let version = metadata.next_version_id();

    let blob = metadata
        .write_blob(container, name, &mut |slot| {
            let live = slot.as_mut().filter(|b| !b.deleted);
            let mut blob = match live {
                Some(existing) => {
                    check_write(ctx, existing)?;
                    existing.clone()
                }
                None => {
                    check_conditions(ctx, None)?;
                    BlobModel::new(container, name, version.clone())
                }
            };
            blob.set_content(source_blob.content.clone(), source_blob.blocks.clone());
            blob.properties.set_http_headers(source_blob.properties.http_headers());
            blob.properties.blob_type = source_blob.properties.blob_type;
            blob.properties.access_tier = source_blob.properties.access_tier;
            blob.properties.metadata = if request_metadata.is_empty() {
                source_blob.properties.metadata.clone()
            } else {
                request_metadata.clone()
            };
            blob.deleted = false;
            blob.deleted_on = None;
            blob.touch(version.clone());
            *slot = Some(blob);
            Ok(())
        })
        .await?
        .ok_or_else(|| StorageError::new(ErrorCode::InternalError))?;
    debug!(
        source = %source_header,
        container = %container,
        blob = %name,
        "blob copied"
    );

    let mut headers = common_headers(ctx);
    add_etag_headers(&mut headers, &blob.properties.etag, &blob.properties.last_modified);
    put_header(&mut headers, "x-ms-copy-id", &uuid::Uuid::new_v4().to_string());
    put_header(&mut headers, "x-ms-copy-status", "success");
    if let Some(v) = blob.version_id() {
        put_header(&mut headers, "x-ms-version-id", v);
    }
    Ok(build_response(StatusCode::ACCEPTED, headers, Bytes::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_forms() {
        let parsed = parse_copy_source(
            "http://127.0.0.1:10000/devstoreaccount1/photos/a%20b/c.png?versionid=2024-01-01T00%3A00%3A00.0000000Z",
            "devstoreaccount1",
        )
        .unwrap();
        assert_eq!(
            parsed,
            CopySource {
                container: "photos".into(),
                blob: "a b/c.png".into(),
                version_id: Some("2024-01-01T00:00:00.0000000Z".into()),
            }
        );

        let parsed = parse_copy_source("/photos/cat.png", "devstoreaccount1").unwrap();
        assert_eq!(parsed.container, "photos");
        assert_eq!(parsed.blob, "cat.png");
        assert_eq!(parsed.version_id, None);

        assert!(parse_copy_source("/photos", "devstoreaccount1").is_err());
    }
}
