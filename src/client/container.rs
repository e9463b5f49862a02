use http::Method;
use std::sync::Arc;
use tracing::debug;

use super::{required_header, AccessConditions, BlobClient};
use crate::error::{BlobError, BlobResult};
use crate::lease::{LeaseClient, LeaseScope};
use crate::listing::{BlobListing, Pager, TagFilterListing};
use crate::models::{
    BlobPrefix, ContainerProperties, ListBlobsInclude, ListingCheckpoint, MetadataMap,
};
use crate::pipeline::Pipeline;
use crate::query::TagQuery;
use crate::transport::TransportRequest;

/// Options for a blob listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListBlobsOptions {
    pub prefix: Option<String>,
    /// Set for a hierarchical listing.
    pub delimiter: Option<String>,
    /// Depth recorded on the prefixes this listing produces.
    pub depth: usize,
    pub page_size: Option<u32>,
    pub include: ListBlobsInclude,
}

impl ListBlobsOptions {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_include(mut self, include: ListBlobsInclude) -> Self {
        self.include = include;
        self
    }
}

/// Handle to one container.
#[derive(Clone)]
pub struct ContainerClient {
    pipeline: Arc<Pipeline>,
    name: String,
}

impl ContainerClient {
    pub(crate) fn new(pipeline: Arc<Pipeline>, name: String) -> Self {
        Self { pipeline, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> String {
        format!("/{}", self.name)
    }

    fn request(&self, method: Method) -> TransportRequest {
        TransportRequest::new(method, self.path()).with_query("restype", "container")
    }

    pub fn blob_client(&self, name: impl Into<String>) -> BlobClient {
        BlobClient::new(self.pipeline.clone(), self.name.clone(), name.into())
    }

    /// Lease handle for this container. `lease_id` defaults to a fresh UUID.
    pub fn lease_client(&self, lease_id: Option<String>) -> LeaseClient {
        LeaseClient::new(self.pipeline.clone(), self.path(), LeaseScope::Container, lease_id)
    }

    pub async fn create(&self, metadata: &MetadataMap) -> BlobResult<()> {
        let mut request = self.request(Method::PUT);
        for (key, value) in metadata.iter() {
            request.set_header(&format!("x-ms-meta-{key}"), value)?;
        }
        self.pipeline.send("create_container", request).await?;
        debug!(container = %self.name, "container created");
        Ok(())
    }

    /// Creates the container; returns `false` if it already existed.
    pub async fn create_if_not_exists(&self) -> BlobResult<bool> {
        match self.create(&MetadataMap::new()).await {
            Ok(()) => Ok(true),
            Err(BlobError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, conditions: &AccessConditions) -> BlobResult<()> {
        let mut request = self.request(Method::DELETE);
        conditions.apply(&mut request)?;
        self.pipeline.send("delete_container", request).await?;
        debug!(container = %self.name, "container deleted");
        Ok(())
    }

    pub async fn exists(&self) -> BlobResult<bool> {
        match self.get_properties().await {
            Ok(_) => Ok(true),
            Err(BlobError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_properties(&self) -> BlobResult<ContainerProperties> {
        let response = self
            .pipeline
            .send("get_container_properties", self.request(Method::HEAD))
            .await?;
        ContainerProperties::from_headers(&response.headers)
            .map_err(|e| BlobError::malformed("get_container_properties", self.path(), e))
    }

    /// Replaces the container's metadata; returns the new ETag.
    pub async fn set_metadata(
        &self,
        metadata: &MetadataMap,
        conditions: &AccessConditions,
    ) -> BlobResult<String> {
        let mut request = self.request(Method::PUT).with_query("comp", "metadata");
        for (key, value) in metadata.iter() {
            request.set_header(&format!("x-ms-meta-{key}"), value)?;
        }
        conditions.apply(&mut request)?;
        let response = self.pipeline.send("set_container_metadata", request).await?;
        required_header(&response, "set_container_metadata", &self.path(), "etag")
    }

    /// Lazily lists blobs; prefixes appear only when a delimiter is set.
    pub fn list_blobs(&self, options: ListBlobsOptions) -> Pager<BlobListing> {
        let page_size = options.page_size.unwrap_or(self.pipeline.config().page_size);
        Pager::new(BlobListing::new(
            self.pipeline.clone(),
            self.name.clone(),
            ListBlobsOptions {
                page_size: Some(page_size),
                ..options
            },
        ))
    }

    /// Hierarchical listing one level below `prefix`, produced by an earlier
    /// listing with the same delimiter and page size.
    pub fn list_blobs_under(
        &self,
        prefix: &BlobPrefix,
        include: ListBlobsInclude,
    ) -> Pager<BlobListing> {
        self.list_blobs(ListBlobsOptions {
            prefix: Some(prefix.name.clone()),
            delimiter: Some(prefix.delimiter.clone()),
            depth: prefix.depth + 1,
            page_size: prefix.page_size,
            include,
        })
    }

    /// Continues a listing saved with [`Pager::checkpoint`].
    pub fn resume_listing(
        &self,
        checkpoint: &ListingCheckpoint,
    ) -> BlobResult<Pager<BlobListing>> {
        if checkpoint.container != self.name {
            return Err(BlobError::InvalidInput(format!(
                "checkpoint belongs to container {}, not {}",
                checkpoint.container, self.name
            )));
        }
        let options = ListBlobsOptions {
            prefix: checkpoint.prefix.clone(),
            delimiter: checkpoint.delimiter.clone(),
            depth: checkpoint.depth,
            page_size: Some(checkpoint.page_size),
            include: checkpoint.include,
        };
        Ok(self.list_blobs(options).starting_at(checkpoint.marker.clone()))
    }

    /// Finds blobs in this container whose tags satisfy `query`.
    pub fn find_blobs_by_tags(&self, query: &TagQuery) -> Pager<TagFilterListing> {
        Pager::new(TagFilterListing::new(
            self.pipeline.clone(),
            Some(self.name.clone()),
            query.clone(),
            self.pipeline.config().page_size,
        ))
    }
}
