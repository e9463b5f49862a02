//! Transport abstraction: the raw HTTP exchange and credential acquisition
//! the client consumes but does not implement.

mod credential;

pub use credential::{AccessToken, StaticTokenCredential, TokenCredential};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::error::{BlobError, BlobResult};

/// Characters escaped inside a path segment. `/` is kept so blob names with
/// virtual directories map onto the URL path unchanged.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'\\')
    .add(b'^')
    .add(b'|');

/// Connection-level failures. The pipeline treats all of them as retryable.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("I/O error: {0}")]
    Io(String),
}

/// A request addressed to the blob endpoint.
///
/// `path` is the unencoded resource path (`/container/blob/name`); transports
/// that speak real HTTP build the final URL with [`TransportRequest::url`].
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a query parameter.
    pub fn with_query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_string(), value.into()));
        self
    }

    /// Sets the request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a header, rejecting names or values that are not valid HTTP.
    pub fn set_header(&mut self, name: &str, value: impl AsRef<str>) -> BlobResult<()> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| BlobError::InvalidInput(format!("invalid header name {name:?}")))?;
        let header_value = HeaderValue::from_str(value.as_ref()).map_err(|_| {
            BlobError::InvalidInput(format!("invalid value for header {name}"))
        })?;
        self.headers.insert(header_name, header_value);
        Ok(())
    }

    /// Builder form of [`set_header`](Self::set_header).
    pub fn with_header(mut self, name: &str, value: impl AsRef<str>) -> BlobResult<Self> {
        self.set_header(name, value)?;
        Ok(self)
    }

    /// Returns a query parameter value.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the percent-encoded path.
    pub fn encoded_path(&self) -> String {
        utf8_percent_encode(&self.path, PATH_SEGMENT).to_string()
    }

    /// Resolves the request against an account endpoint such as
    /// `https://account.blob.core.windows.net`.
    pub fn url(&self, endpoint: &Url) -> Url {
        let mut url = endpoint.clone();
        let base = endpoint.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", base, self.encoded_path()));
        if self.query.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        url
    }
}

/// A streamed response body.
pub struct ResponseBody(BoxStream<'static, Result<Bytes, TransportError>>);

impl ResponseBody {
    pub fn empty() -> Self {
        Self(stream::empty().boxed())
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self(stream::once(async move { Ok(bytes) }).boxed())
    }

    pub fn from_stream(stream: BoxStream<'static, Result<Bytes, TransportError>>) -> Self {
        Self(stream)
    }

    /// Buffers the whole body.
    pub async fn collect(mut self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.0.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, TransportError>> {
        self.0
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody { .. }")
    }
}

/// Status, headers and a body stream.
#[derive(Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::from_bytes(body),
        }
    }

    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the ETag header.
    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Sends one request. Connection pooling, TLS and DNS live behind this trait.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_path_and_keeps_slashes() {
        let request = TransportRequest::new(Method::GET, "/photos/2024/my cat#1.png")
            .with_query("comp", "tags")
            .with_query("versionid", "2024-01-01T00:00:00.0000000Z");
        let endpoint = Url::parse("https://acct.blob.core.windows.net").unwrap();
        let url = request.url(&endpoint);

        assert_eq!(url.path(), "/photos/2024/my%20cat%231.png");
        assert_eq!(
            url.query(),
            Some("comp=tags&versionid=2024-01-01T00%3A00%3A00.0000000Z")
        );
    }

    #[test]
    fn url_respects_endpoint_path() {
        let request = TransportRequest::new(Method::PUT, "/c/b");
        let endpoint = Url::parse("http://127.0.0.1:10000/devstoreaccount1").unwrap();
        assert_eq!(
            request.url(&endpoint).as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/c/b"
        );
    }

    #[test]
    fn invalid_header_value_is_rejected() {
        let mut request = TransportRequest::new(Method::PUT, "/c/b");
        assert!(request.set_header("x-ms-meta-k", "line\nbreak").is_err());
        assert!(request.set_header("x-ms-meta-k", "fine").is_ok());
        assert_eq!(request.header("x-ms-meta-k"), Some("fine"));
    }

    #[tokio::test]
    async fn body_collects_chunks() {
        let body = ResponseBody::from_stream(
            stream::iter(vec![
                Ok(Bytes::from_static(b"ab")),
                Ok(Bytes::from_static(b"cd")),
            ])
            .boxed(),
        );
        assert_eq!(body.collect().await.unwrap(), Bytes::from_static(b"abcd"));
    }
}
