//! Request handlers for the emulated blob service.

mod blob;
mod block_blob;
mod container;
mod lease;
mod service;

pub use blob::*;
pub use block_blob::*;
pub use container::*;
pub use lease::*;
pub use service::*;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use md5::{Digest, Md5};
use uuid::Uuid;

use crate::config::DEFAULT_API_VERSION;
use crate::context::{format_http_date, RequestContext};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{BlobProperties, MetadataMap};
use crate::transport::TransportResponse;

/// Inserts a header, skipping values that are not valid header text.
pub(crate) fn put_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

/// Creates common response headers for blob service responses.
pub fn common_headers(ctx: &RequestContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    put_header(&mut headers, "x-ms-request-id", &ctx.request_id);
    put_header(&mut headers, "x-ms-version", DEFAULT_API_VERSION);
    put_header(&mut headers, "date", &format_http_date(&Utc::now()));
    if let Some(ref id) = ctx.client_request_id {
        put_header(&mut headers, "x-ms-client-request-id", id);
    }
    headers
}

/// Adds ETag and Last-Modified headers.
pub fn add_etag_headers(headers: &mut HeaderMap, etag: &str, last_modified: &DateTime<Utc>) {
    put_header(headers, "etag", etag);
    put_header(headers, "last-modified", &format_http_date(last_modified));
}

/// Adds `x-ms-meta-*` headers.
pub fn add_metadata_headers(headers: &mut HeaderMap, metadata: &MetadataMap) {
    for (key, value) in metadata.iter() {
        put_header(headers, &format!("x-ms-meta-{key}"), value);
    }
}

/// Adds the property headers a Get Blob / Get Blob Properties response carries.
pub fn add_blob_property_headers(headers: &mut HeaderMap, props: &BlobProperties) {
    add_etag_headers(headers, &props.etag, &props.last_modified);
    put_header(headers, "x-ms-blob-type", props.blob_type.as_str());
    let optional = [
        ("content-type", &props.content_type),
        ("content-encoding", &props.content_encoding),
        ("content-language", &props.content_language),
        ("content-disposition", &props.content_disposition),
        ("cache-control", &props.cache_control),
        ("x-ms-blob-content-md5", &props.content_md5),
        ("x-ms-version-id", &props.version_id),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            put_header(headers, name, value);
        }
    }
    if let Some(created) = props.created_on {
        put_header(headers, "x-ms-creation-time", &format_http_date(&created));
    }
    if let Some(tier) = props.access_tier {
        put_header(headers, "x-ms-access-tier", tier.as_str());
    }
    put_header(headers, "x-ms-lease-state", props.lease_state.as_str());
    put_header(headers, "x-ms-lease-status", props.lease_status.as_str());
    if let Some(duration) = props.lease_duration {
        put_header(headers, "x-ms-lease-duration", duration.as_str());
    }
    if let Some(count) = props.tag_count {
        put_header(headers, "x-ms-tag-count", &count.to_string());
    }
    put_header(headers, "accept-ranges", "bytes");
    add_metadata_headers(headers, &props.metadata);
}

/// Builds a response with the given status, headers, and body.
pub fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> TransportResponse {
    TransportResponse::new(status, headers, body)
}

/// XML response with the common headers.
pub fn xml_response(ctx: &RequestContext, xml: String) -> TransportResponse {
    let mut headers = common_headers(ctx);
    put_header(&mut headers, "content-type", "application/xml");
    build_response(StatusCode::OK, headers, Bytes::from(xml))
}

/// Checks If-Match / If-None-Match against the current ETag. `existing` is
/// `None` when the target does not exist yet.
pub fn check_conditions(ctx: &RequestContext, existing: Option<&str>) -> StorageResult<()> {
    if let Some(expected) = ctx.if_match() {
        match existing {
            Some(etag) if expected == "*" || expected == etag => {}
            Some(_) => return Err(StorageError::new(ErrorCode::ConditionNotMet)),
            None => return Err(StorageError::new(ErrorCode::BlobNotFound)),
        }
    }
    if let Some(unwanted) = ctx.if_none_match() {
        if let Some(etag) = existing {
            if unwanted == "*" {
                return Err(StorageError::new(ErrorCode::BlobAlreadyExists));
            }
            if unwanted == etag {
                return Err(StorageError::new(ErrorCode::ConditionNotMet));
            }
        }
    }
    Ok(())
}

/// Base64 MD5 of `data`.
pub fn content_md5(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

/// Verifies a request's Content-MD5 header against its body.
pub fn verify_content_md5(ctx: &RequestContext, body: &[u8]) -> StorageResult<()> {
    if let Some(claimed) = ctx.content_md5() {
        let decoded = STANDARD
            .decode(claimed)
            .map_err(|_| StorageError::new(ErrorCode::InvalidMd5))?;
        if decoded.len() != 16 {
            return Err(StorageError::new(ErrorCode::InvalidMd5));
        }
        if claimed != content_md5(body) {
            return Err(StorageError::new(ErrorCode::Md5Mismatch));
        }
    }
    Ok(())
}

/// Lease ids must be UUIDs.
pub fn parse_lease_id(value: &str) -> StorageResult<String> {
    Uuid::parse_str(value)
        .map(|id| id.to_string())
        .map_err(|_| {
            StorageError::with_message(
                ErrorCode::InvalidHeaderValue,
                format!("lease id {value:?} is not a UUID"),
            )
        })
}
