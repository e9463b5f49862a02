//! Client handles: service, container and blob. Every handle shares one
//! [`Pipeline`] and is cheap to clone.

mod blob;
mod container;

pub use blob::BlobClient;
pub use container::{ContainerClient, ListBlobsOptions};

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::{BlobError, BlobResult};
use crate::listing::{ContainerListing, Pager, TagFilterListing};
use crate::pipeline::Pipeline;
use crate::query::TagQuery;
use crate::transport::{TokenCredential, Transport, TransportRequest, TransportResponse};

/// Optimistic-concurrency and lease conditions attached to a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessConditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub lease_id: Option<String>,
}

impl AccessConditions {
    /// Succeeds only while the resource still carries `etag`.
    pub fn if_match(etag: impl Into<String>) -> Self {
        Self {
            if_match: Some(etag.into()),
            ..Self::default()
        }
    }

    /// Succeeds only if the resource does not exist yet.
    pub fn if_not_exists() -> Self {
        Self {
            if_none_match: Some("*".to_string()),
            ..Self::default()
        }
    }

    pub fn with_lease(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    pub(crate) fn apply(&self, request: &mut TransportRequest) -> BlobResult<()> {
        if let Some(ref etag) = self.if_match {
            request.set_header("if-match", etag)?;
        }
        if let Some(ref etag) = self.if_none_match {
            request.set_header("if-none-match", etag)?;
        }
        if let Some(ref id) = self.lease_id {
            request.set_header("x-ms-lease-id", id)?;
        }
        Ok(())
    }
}

/// Reads a response header the caller depends on.
pub(crate) fn required_header(
    response: &TransportResponse,
    operation: &'static str,
    resource: &str,
    name: &str,
) -> BlobResult<String> {
    response
        .header(name)
        .map(String::from)
        .ok_or_else(|| BlobError::malformed(operation, resource, format!("missing {name} header")))
}

/// Options for listing containers.
#[derive(Debug, Clone, Default)]
pub struct ListContainersOptions {
    pub prefix: Option<String>,
    pub page_size: Option<u32>,
    pub include_metadata: bool,
}

/// Entry point: one account endpoint reached through one transport.
#[derive(Clone)]
pub struct BlobServiceClient {
    pipeline: Arc<Pipeline>,
}

impl BlobServiceClient {
    /// Anonymous client with the default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, None, ClientConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        credential: Option<Arc<dyn TokenCredential>>,
        config: ClientConfig,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(transport, credential, config)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        self.pipeline.config()
    }

    pub fn container_client(&self, name: impl Into<String>) -> ContainerClient {
        ContainerClient::new(self.pipeline.clone(), name.into())
    }

    /// Lists containers page by page.
    pub fn list_containers(&self, options: ListContainersOptions) -> Pager<ContainerListing> {
        let page_size = options.page_size.unwrap_or(self.config().page_size);
        Pager::new(ContainerListing::new(
            self.pipeline.clone(),
            options.prefix,
            page_size,
            options.include_metadata,
        ))
    }

    /// Finds blobs across the account whose tags satisfy `query`.
    pub fn find_blobs_by_tags(&self, query: &TagQuery) -> Pager<TagFilterListing> {
        Pager::new(TagFilterListing::new(
            self.pipeline.clone(),
            None,
            query.clone(),
            self.config().page_size,
        ))
    }
}
