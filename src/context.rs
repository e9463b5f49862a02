//! Request context extraction for the emulator, plus shared date and range
//! helpers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{BlobHttpHeaders, MetadataMap, TagMap};
use crate::transport::TransportRequest;

/// Everything a handler needs from one incoming request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request ID.
    pub request_id: String,
    pub method: Method,
    /// Container name (if present).
    pub container: Option<String>,
    /// Blob name (if present).
    pub blob: Option<String>,
    pub query_params: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Client request ID from x-ms-client-request-id header.
    pub client_request_id: Option<String>,
    /// Request timestamp.
    pub timestamp: DateTime<Utc>,
}

impl RequestContext {
    /// Splits `/container/blob/name` into its parts.
    pub fn from_request(request: TransportRequest) -> Self {
        let trimmed = request.path.trim_start_matches('/');
        let mut parts = trimmed.splitn(2, '/');
        let container = parts.next().filter(|s| !s.is_empty()).map(String::from);
        let blob = parts.next().filter(|s| !s.is_empty()).map(String::from);

        let client_request_id = request
            .headers
            .get("x-ms-client-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Self {
            request_id: Uuid::new_v4().to_string(),
            method: request.method,
            container,
            blob,
            query_params: request.query.into_iter().collect(),
            headers: request.headers,
            body: request.body,
            client_request_id,
            timestamp: Utc::now(),
        }
    }

    /// Returns the value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|s| s.as_str())
    }

    /// Returns the value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the Content-MD5 header value.
    pub fn content_md5(&self) -> Option<&str> {
        self.header("content-md5")
    }

    /// Returns the x-ms-range (or Range) header parsed as (start, end).
    pub fn range(&self) -> StorageResult<Option<(u64, Option<u64>)>> {
        match self.header("x-ms-range").or_else(|| self.header("range")) {
            None => Ok(None),
            Some(value) => parse_range_header(value)
                .map(Some)
                .ok_or_else(|| StorageError::new(ErrorCode::InvalidRange)),
        }
    }

    /// Returns the If-Match header value.
    pub fn if_match(&self) -> Option<&str> {
        self.header("if-match")
    }

    /// Returns the If-None-Match header value.
    pub fn if_none_match(&self) -> Option<&str> {
        self.header("if-none-match")
    }

    /// Returns the x-ms-lease-id header value.
    pub fn lease_id(&self) -> Option<&str> {
        self.header("x-ms-lease-id")
    }

    /// Returns the x-ms-copy-source header value.
    pub fn copy_source(&self) -> Option<&str> {
        self.header("x-ms-copy-source")
    }

    /// Returns user-defined metadata from x-ms-meta-* headers.
    pub fn metadata(&self) -> StorageResult<MetadataMap> {
        let mut metadata = MetadataMap::new();
        for (name, value) in &self.headers {
            let Some(key) = name.as_str().strip_prefix("x-ms-meta-") else {
                continue;
            };
            if key.is_empty() {
                return Err(StorageError::new(ErrorCode::EmptyMetadataKey));
            }
            let value = value
                .to_str()
                .map_err(|_| StorageError::new(ErrorCode::InvalidMetadata))?;
            metadata
                .insert(key, value)
                .map_err(|e| {
                    StorageError::with_message(ErrorCode::InvalidMetadata, e.to_string())
                })?;
        }
        Ok(metadata)
    }

    /// Returns index tags from the x-ms-tags header.
    pub fn tags(&self) -> StorageResult<Option<TagMap>> {
        self.header("x-ms-tags")
            .map(|value| {
                TagMap::from_header_value(value)
                    .map_err(|e| StorageError::with_message(ErrorCode::InvalidTag, e))
            })
            .transpose()
    }

    /// Returns the x-ms-blob-* HTTP header set.
    pub fn http_headers(&self) -> BlobHttpHeaders {
        let owned = |name: &str| self.header(name).map(String::from);
        BlobHttpHeaders {
            content_type: owned("x-ms-blob-content-type"),
            content_encoding: owned("x-ms-blob-content-encoding"),
            content_language: owned("x-ms-blob-content-language"),
            content_disposition: owned("x-ms-blob-content-disposition"),
            cache_control: owned("x-ms-blob-cache-control"),
            content_md5: owned("x-ms-blob-content-md5"),
        }
    }

    /// Returns the versionid query parameter.
    pub fn version_id(&self) -> Option<&str> {
        self.query_param("versionid")
    }

    /// Returns the restype query parameter.
    pub fn restype(&self) -> Option<&str> {
        self.query_param("restype")
    }

    /// Returns the comp query parameter.
    pub fn comp(&self) -> Option<&str> {
        self.query_param("comp")
    }

    pub fn container_name(&self) -> StorageResult<&str> {
        self.container
            .as_deref()
            .ok_or_else(|| StorageError::new(ErrorCode::InvalidResourceName))
    }

    pub fn blob_name(&self) -> StorageResult<&str> {
        self.blob
            .as_deref()
            .ok_or_else(|| StorageError::new(ErrorCode::InvalidResourceName))
    }
}

/// Parses a range header value like "bytes=0-1023" or "bytes=0-".
pub(crate) fn parse_range_header(value: &str) -> Option<(u64, Option<u64>)> {
    let value = value.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        let end: u64 = end.parse().ok()?;
        if end < start {
            return None;
        }
        Some(end)
    };
    Some((start, end))
}

/// Parses an HTTP date in RFC 1123 format.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .ok()
                .map(|dt| dt.and_utc())
        })
}

/// Query parameters for list operations.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub marker: Option<String>,
    pub maxresults: Option<u32>,
    pub include: Vec<String>,
}

impl ListParams {
    pub fn from_query(query: &HashMap<String, String>) -> StorageResult<Self> {
        let include = query
            .get("include")
            .map(|s| s.split(',').map(|p| p.trim().to_lowercase()).collect())
            .unwrap_or_default();

        let maxresults = match query.get("maxresults") {
            None => None,
            Some(v) => match v.parse::<u32>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    return Err(StorageError::with_message(
                        ErrorCode::InvalidQueryParameterValue,
                        format!("maxresults {v:?} is not a positive integer"),
                    ))
                }
            },
        };

        Ok(Self {
            prefix: query.get("prefix").cloned().filter(|s| !s.is_empty()),
            delimiter: query.get("delimiter").cloned().filter(|s| !s.is_empty()),
            marker: query.get("marker").cloned().filter(|s| !s.is_empty()),
            maxresults,
            include,
        })
    }

    pub fn includes(&self, dataset: &str) -> bool {
        self.include.iter().any(|i| i == dataset)
    }
}

/// Formats a DateTime as RFC 1123 format for HTTP headers.
pub fn format_http_date(dt: &DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Formats a DateTime as ISO 8601 with 100ns precision, the version id format.
pub fn format_iso8601(dt: &DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        dt.format("%Y-%m-%dT%H:%M:%S"),
        dt.timestamp_subsec_nanos() / 100
    )
}
