use bytes::Bytes;
use futures::Stream;
use http::Method;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info};
use url::form_urlencoded;

use super::{required_header, AccessConditions};
use crate::error::{BlobError, BlobResult};
use crate::lease::{LeaseClient, LeaseScope};
use crate::models::{
    BlobHandle, BlobHttpHeaders, BlobProperties, BlobType, BlockId, BlockList, BlockListType,
    LeaseState, LeaseStatus, MetadataMap, TagMap, Versioned,
};
use crate::pipeline::Pipeline;
use crate::transfer::{self, ChunkStream, DownloadOptions, UploadOptions};
use crate::transport::{TransportRequest, TransportResponse};
use crate::xml::{deserialize, serialize};

/// Handle to one blob, or one historical version of it.
#[derive(Clone)]
pub struct BlobClient {
    pipeline: Arc<Pipeline>,
    handle: BlobHandle,
}

impl BlobClient {
    pub(crate) fn new(pipeline: Arc<Pipeline>, container: String, name: String) -> Self {
        Self {
            pipeline,
            handle: BlobHandle::new(container, name),
        }
    }

    pub fn handle(&self) -> &BlobHandle {
        &self.handle
    }

    /// The same blob pinned to `version_id`; reads go to that version.
    pub fn with_version(&self, version_id: impl Into<String>) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            handle: self.handle.with_version(version_id),
        }
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// `/container/name`, used in errors and logs.
    pub(crate) fn resource(&self) -> String {
        self.handle.to_string()
    }

    pub(crate) fn request(&self, method: Method) -> TransportRequest {
        let request = TransportRequest::new(method, self.handle.path());
        match &self.handle.version_id {
            Some(v) => request.with_query("versionid", v.clone()),
            None => request,
        }
    }

    pub fn lease_client(&self, lease_id: Option<String>) -> LeaseClient {
        LeaseClient::new(self.pipeline.clone(), self.handle.path(), LeaseScope::Blob, lease_id)
    }

    // Transfers

    /// Uploads a buffer, single-shot or in blocks depending on its size.
    pub async fn upload(
        &self,
        data: Bytes,
        options: &UploadOptions,
    ) -> BlobResult<BlobProperties> {
        transfer::upload_bytes(self, data, options).await
    }

    /// Uploads from a byte stream of unknown length.
    pub async fn upload_stream<S>(
        &self,
        source: S,
        options: &UploadOptions,
    ) -> BlobResult<BlobProperties>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    {
        transfer::upload_stream(self, source, options).await
    }

    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        options: &UploadOptions,
    ) -> BlobResult<BlobProperties> {
        let file = tokio::fs::File::open(path.as_ref())
            .await
            .map_err(|e| BlobError::InvalidInput(format!("{}: {e}", path.as_ref().display())))?;
        let source = tokio_util::io::ReaderStream::new(file);
        transfer::upload_stream(self, source, options).await
    }

    /// Streams the blob (or range) into `sink` in offset order; returns the
    /// number of bytes written.
    pub async fn download_to<W>(&self, sink: &mut W, options: &DownloadOptions) -> BlobResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        transfer::download_to(self, sink, options).await
    }

    pub async fn download_bytes(&self, options: &DownloadOptions) -> BlobResult<Bytes> {
        let mut buf = Vec::new();
        self.download_to(&mut buf, options).await?;
        Ok(Bytes::from(buf))
    }

    /// Downloads and decodes the blob as UTF-8.
    pub async fn download_text(&self, options: &DownloadOptions) -> BlobResult<String> {
        let bytes = self.download_bytes(options).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| BlobError::malformed("download_text", self.resource(), e))
    }

    pub async fn download_to_file(
        &self,
        path: impl AsRef<Path>,
        options: &DownloadOptions,
    ) -> BlobResult<u64> {
        let mut file = tokio::fs::File::create(path.as_ref())
            .await
            .map_err(|e| BlobError::InvalidInput(format!("{}: {e}", path.as_ref().display())))?;
        let written = self.download_to(&mut file, options).await?;
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| {
                BlobError::transfer(self.resource(), format!("flush failed: {e}"), None)
            })?;
        Ok(written)
    }

    /// Pull-based download: a lazy, single-pass stream of chunks in order.
    pub async fn download_stream(&self, options: &DownloadOptions) -> BlobResult<ChunkStream> {
        transfer::download_stream(self, options).await
    }

    // Properties, metadata, tags

    pub async fn get_properties(
        &self,
        conditions: &AccessConditions,
    ) -> BlobResult<BlobProperties> {
        let mut request = self.request(Method::HEAD);
        conditions.apply(&mut request)?;
        let response = self.pipeline.send("get_blob_properties", request).await?;
        BlobProperties::from_headers(&response.headers)
            .map_err(|e| BlobError::malformed("get_blob_properties", self.resource(), e))
    }

    /// Replaces the whole HTTP header set; fields left `None` are cleared.
    /// Returns the new ETag.
    pub async fn set_properties(
        &self,
        headers: &BlobHttpHeaders,
        conditions: &AccessConditions,
    ) -> BlobResult<String> {
        let mut request = self.request(Method::PUT).with_query("comp", "properties");
        headers.apply(&mut request)?;
        conditions.apply(&mut request)?;
        let response = self.pipeline.send("set_blob_properties", request).await?;
        required_header(&response, "set_blob_properties", &self.resource(), "etag")
    }

    pub async fn get_metadata(&self) -> BlobResult<Versioned<MetadataMap>> {
        let properties = self.get_properties(&AccessConditions::default()).await?;
        Ok(Versioned {
            value: properties.metadata,
            etag: properties.etag,
        })
    }

    /// Replaces all metadata. Returns the new ETag.
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
        let response = self.pipeline.send("set_blob_metadata", request).await?;
        let etag = required_header(&response, "set_blob_metadata", &self.resource(), "etag")?;
        debug!(blob = %self.handle, keys = metadata.len(), "metadata replaced");
        Ok(etag)
    }

    /// Tags together with the blob's ETag at the time of the read.
    pub async fn get_tags(&self) -> BlobResult<Versioned<TagMap>> {
        let request = self.request(Method::GET).with_query("comp", "tags");
        let (response, body) = self.pipeline.send_collect("get_blob_tags", request, None).await?;
        let etag = required_header(&response, "get_blob_tags", &self.resource(), "etag")?;
        let xml = String::from_utf8_lossy(&body);
        let tags = deserialize::parse_tags(&xml)
            .map_err(|e| BlobError::malformed("get_blob_tags", self.resource(), e))?;
        Ok(Versioned {
            value: TagMap::from_map_unchecked(tags),
            etag,
        })
    }

    /// Replaces all tags. Tags are not covered by the blob's ETag, so a
    /// successful write leaves the ETag unchanged.
    pub async fn set_tags(&self, tags: &TagMap, conditions: &AccessConditions) -> BlobResult<()> {
        let mut request = self
            .request(Method::PUT)
            .with_query("comp", "tags")
            .with_body(serialize::serialize_tags(tags));
        conditions.apply(&mut request)?;
        self.pipeline.send("set_blob_tags", request).await?;
        debug!(blob = %self.handle, count = tags.len(), "tags replaced");
        Ok(())
    }

    pub async fn clear_tags(&self, conditions: &AccessConditions) -> BlobResult<()> {
        self.set_tags(&TagMap::new(), conditions).await
    }

    // Lifecycle

    pub async fn exists(&self) -> BlobResult<bool> {
        match self.get_properties(&AccessConditions::default()).await {
            Ok(_) => Ok(true),
            Err(BlobError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Soft-deletes the blob; on a version handle, removes that version.
    pub async fn delete(&self, conditions: &AccessConditions) -> BlobResult<()> {
        let mut request = self.request(Method::DELETE);
        conditions.apply(&mut request)?;
        self.pipeline.send("delete_blob", request).await?;
        info!(blob = %self.handle, "blob deleted");
        Ok(())
    }

    pub async fn undelete(&self) -> BlobResult<()> {
        let request =
            TransportRequest::new(Method::PUT, self.handle.path()).with_query("comp", "undelete");
        self.pipeline.send("undelete_blob", request).await?;
        info!(blob = %self.handle, "blob undeleted");
        Ok(())
    }

    /// Copies `version_id` over the current blob, creating a new current
    /// version. Returns its properties.
    pub async fn restore_version(&self, version_id: &str) -> BlobResult<BlobProperties> {
        let base = BlobHandle::new(self.handle.container.clone(), self.handle.name.clone());
        let source = self.copy_source_url(&base, version_id);
        let request = TransportRequest::new(Method::PUT, base.path())
            .with_header("x-ms-copy-source", &source)?;
        let response = self.pipeline.send("restore_version", request).await?;
        let etag = required_header(&response, "restore_version", &self.resource(), "etag")?;
        let status = response.header("x-ms-copy-status").unwrap_or("success");
        if status != "success" {
            return Err(BlobError::malformed(
                "restore_version",
                self.resource(),
                format!("copy finished with status {status}"),
            ));
        }
        info!(blob = %base, version = version_id, "version restored");

        let current = BlobClient {
            pipeline: self.pipeline.clone(),
            handle: base,
        };
        // Pinned to the ETag the copy produced.
        current.get_properties(&AccessConditions::if_match(etag)).await
    }

    fn copy_source_url(&self, base: &BlobHandle, version_id: &str) -> String {
        let request =
            TransportRequest::new(Method::GET, base.path()).with_query("versionid", version_id);
        match &self.pipeline.config().account_url {
            Some(endpoint) => request.url(endpoint).to_string(),
            None => {
                let version: String =
                    form_urlencoded::byte_serialize(version_id.as_bytes()).collect();
                format!("{}?versionid={}", request.encoded_path(), version)
            }
        }
    }

    // Block primitives

    /// Single-shot Put Blob.
    pub(crate) async fn put_blob(
        &self,
        data: Bytes,
        options: &UploadOptions,
        md5: bool,
    ) -> BlobResult<BlobProperties> {
        let mut request = TransportRequest::new(Method::PUT, self.handle.path())
            .with_header("x-ms-blob-type", "BlockBlob")?
            .with_body(data.clone());
        options.apply(&mut request)?;
        if md5 {
            request.set_header("content-md5", transfer::md5_base64(&data))?;
        }
        let size = data.len() as u64;
        let response = self.pipeline.send("put_blob", request).await?;
        self.written_properties("put_blob", &response, size, options)
    }

    pub(crate) fn stage_block_request(
        &self,
        block_id: &BlockId,
        data: Bytes,
        md5: bool,
    ) -> BlobResult<TransportRequest> {
        let mut request = TransportRequest::new(Method::PUT, self.handle.path())
            .with_query("comp", "block")
            .with_query("blockid", block_id.as_str())
            .with_body(data.clone());
        if md5 {
            request.set_header("content-md5", transfer::md5_base64(&data))?;
        }
        Ok(request)
    }

    /// Stages one block, retried on its own.
    pub async fn stage_block(
        &self,
        block_id: &BlockId,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> BlobResult<()> {
        let mut request = self.stage_block_request(block_id, data, false)?;
        conditions.apply(&mut request)?;
        self.pipeline.send("stage_block", request).await?;
        Ok(())
    }

    /// Commits `block_ids` in order as the blob's content.
    pub(crate) async fn commit_block_list(
        &self,
        block_ids: &[BlockId],
        size: u64,
        options: &UploadOptions,
    ) -> BlobResult<BlobProperties> {
        let mut request = TransportRequest::new(Method::PUT, self.handle.path())
            .with_query("comp", "blocklist")
            .with_body(serialize::serialize_block_list_request(block_ids));
        options.apply(&mut request)?;
        let response = self.pipeline.send("commit_block_list", request).await?;
        self.written_properties("commit_block_list", &response, size, options)
    }

    /// Properties of the blob as this write left it: the write response's
    /// ETag, Last-Modified, MD5 and version id, plus what the upload sent.
    fn written_properties(
        &self,
        operation: &'static str,
        response: &TransportResponse,
        size: u64,
        options: &UploadOptions,
    ) -> BlobResult<BlobProperties> {
        let mut properties = BlobProperties::from_headers(&response.headers)
            .map_err(|e| BlobError::malformed(operation, self.resource(), e))?;
        let written_md5 = properties.content_md5.take();
        properties.set_http_headers(options.http_headers.clone());
        if properties.content_md5.is_none() {
            properties.content_md5 = written_md5;
        }
        properties.content_length = size;
        properties.blob_type = BlobType::BlockBlob;
        properties.access_tier = options.access_tier;
        properties.metadata = options.metadata.clone();
        properties.tag_count = options.tags.as_ref().map(|t| t.len() as u32);
        if options.conditions.lease_id.is_some() {
            properties.lease_state = LeaseState::Leased;
            properties.lease_status = LeaseStatus::Locked;
        }
        Ok(properties)
    }

    pub async fn get_block_list(&self, list_type: BlockListType) -> BlobResult<BlockList> {
        let request = TransportRequest::new(Method::GET, self.handle.path())
            .with_query("comp", "blocklist")
            .with_query("blocklisttype", list_type.as_str());
        let (_, body) = self.pipeline.send_collect("get_block_list", request, None).await?;
        deserialize::parse_block_list(&String::from_utf8_lossy(&body))
            .map_err(|e| BlobError::malformed("get_block_list", self.resource(), e))
    }
}
