//! In-process blob service speaking the wire protocol over an in-memory
//! store. Plugged in as a [`Transport`], it is the test double every client
//! engine runs against.

mod handlers;
mod router;
mod store;

pub use router::AppState;
pub use store::{BlobModel, ContainerModel, MemoryMetadataStore, MetadataStore};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::config::DEFAULT_ACCOUNT;
use crate::context::RequestContext;
use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse};

/// Emulated blob service for one storage account.
#[derive(Clone)]
pub struct MemoryBlobService {
    state: AppState,
}

impl MemoryBlobService {
    /// Service for the default development account.
    pub fn new() -> Self {
        Self::with_account(DEFAULT_ACCOUNT)
    }

    pub fn with_account(account: &str) -> Self {
        Self::with_store(account, Arc::new(MemoryMetadataStore::new()))
    }

    /// Service over a caller-supplied store.
    pub fn with_store(account: &str, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            state: AppState {
                account: Arc::from(account),
                metadata,
            },
        }
    }

    pub fn account(&self) -> &str {
        &self.state.account
    }

    /// The store, for inspecting state in tests.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Endpoint URL a real client would use for this account.
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("http://127.0.0.1:10000/{}", self.state.account))
    }

    /// Handles one request, rendering failures as service error responses.
    pub async fn handle(&self, request: TransportRequest) -> TransportResponse {
        let ctx = RequestContext::from_request(request);
        let result = router::route(&ctx, &self.state).await;
        match result {
            Ok(response) => {
                debug!(
                    request_id = %ctx.request_id,
                    method = %ctx.method,
                    status = %response.status,
                    "request handled"
                );
                response
            }
            Err(e) => {
                debug!(
                    request_id = %ctx.request_id,
                    method = %ctx.method,
                    code = %e.code,
                    "request failed"
                );
                e.with_request_id(&ctx.request_id).into_response()
            }
        }
    }
}

impl Default for MemoryBlobService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBlobService {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        Ok(self.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};

    #[tokio::test]
    async fn unknown_route_is_rejected() {
        let service = MemoryBlobService::new();
        let response = service
            .handle(TransportRequest::new(Method::POST, "/").with_query("comp", "nope"))
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.header("x-ms-error-code"), Some("UnsupportedHttpVerb"));
    }

    #[tokio::test]
    async fn put_then_get_over_the_wire() {
        let service = MemoryBlobService::new();
        let create =
            TransportRequest::new(Method::PUT, "/photos").with_query("restype", "container");
        assert_eq!(service.handle(create).await.status, StatusCode::CREATED);

        let put = TransportRequest::new(Method::PUT, "/photos/a/b.txt")
            .with_header("x-ms-blob-type", "BlockBlob")
            .unwrap()
            .with_body(&b"hello"[..]);
        assert_eq!(service.handle(put).await.status, StatusCode::CREATED);

        let get = TransportRequest::new(Method::GET, "/photos/a/b.txt")
            .with_header("x-ms-range", "bytes=1-3")
            .unwrap();
        let response = service.handle(get).await;
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.header("content-range"), Some("bytes 1-3/5"));
        assert_eq!(&response.body.collect().await.unwrap()[..], b"ell");
    }
}
