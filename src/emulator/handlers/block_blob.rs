//! Block blob handlers: single-shot upload, staging and committing blocks.

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use std::sync::Arc;
use tracing::debug;

use crate::config::MAX_BLOCK_SIZE;
use crate::context::RequestContext;
use crate::emulator::store::{BlobModel, MetadataStore};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::{LeaseRecord, LeaseScope};
use crate::models::{
    AccessTier, BlobType, BlockId, BlockList, BlockListEntry, BlockListType, BlockState,
    MetadataMap, TagMap,
};
use crate::transport::TransportResponse;
use crate::xml::deserialize::{parse_block_list_request, BlockLookup};
use crate::xml::serialize::serialize_block_list;

use super::blob::check_write;
use super::{
    add_etag_headers, build_response, check_conditions, common_headers, content_md5,
    put_header, verify_content_md5, xml_response,
};

fn access_tier(ctx: &RequestContext) -> StorageResult<Option<AccessTier>> {
    ctx.header("x-ms-access-tier")
        .map(|value| {
            AccessTier::from_str(value).ok_or_else(|| StorageError::new(ErrorCode::InvalidBlobTier))
        })
        .transpose()
}

/// Builds the next current version of a blob being (re)written in full.
/// Creation time, tags (unless `x-ms-tags` is sent) and lease carry over.
struct Replacement<'a> {
    ctx: &'a RequestContext,
    metadata: MetadataMap,
    tags: Option<TagMap>,
    tier: Option<AccessTier>,
    version: String,
}

impl Replacement<'_> {
    fn apply(
        &self,
        slot: &mut Option<BlobModel>,
        content: Bytes,
        blocks: Vec<(BlockId, Bytes)>,
    ) -> StorageResult<BlobModel> {
        let ctx = self.ctx;
        let container = ctx.container_name()?;
        let name = ctx.blob_name()?;

        let mut blob = match slot.as_mut().filter(|b| !b.deleted) {
            Some(existing) => {
                check_write(ctx, existing)?;
                let mut next = BlobModel::new(container, name, self.version.clone());
                next.properties.created_on = existing.properties.created_on;
                next.tags = existing.tags.clone();
                next.lease = existing.lease.clone();
                next
            }
            None => {
                LeaseRecord::default()
                    .check_write(ctx.lease_id(), LeaseScope::Blob, ctx.timestamp)
                    .map_err(StorageError::new)?;
                check_conditions(ctx, None)?;
                BlobModel::new(container, name, self.version.clone())
            }
        };

        let mut headers = ctx.http_headers();
        if headers.content_md5.is_none() {
            headers.content_md5 = Some(content_md5(&content));
        }
        blob.properties.set_http_headers(headers);
        blob.properties.blob_type = BlobType::BlockBlob;
        blob.properties.access_tier = Some(self.tier.unwrap_or(AccessTier::Hot));
        blob.properties.metadata = self.metadata.clone();
        if let Some(ref tags) = self.tags {
            blob.tags = tags.clone();
        }
        blob.set_content(content, blocks);
        Ok(blob)
    }
}

fn write_response(ctx: &RequestContext, blob: &BlobModel) -> TransportResponse {
    let mut headers = common_headers(ctx);
    add_etag_headers(&mut headers, &blob.properties.etag, &blob.properties.last_modified);
    if let Some(ref md5) = blob.properties.content_md5 {
        put_header(&mut headers, "content-md5", md5);
    }
    if let Some(v) = blob.version_id() {
        put_header(&mut headers, "x-ms-version-id", v);
    }
    put_header(&mut headers, "x-ms-request-server-encrypted", "false");
    build_response(StatusCode::CREATED, headers, Bytes::new())
}

/// PUT /{container}/{blob} - Put Blob (block blobs only).
pub async fn upload_block_blob(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    match ctx.header("x-ms-blob-type") {
        None => {
            return Err(StorageError::with_message(
                ErrorCode::MissingRequiredHeader,
                "x-ms-blob-type is required",
            ))
        }
        Some(kind) if BlobType::from_str(kind) != Some(BlobType::BlockBlob) => {
            return Err(StorageError::with_message(
                ErrorCode::InvalidHeaderValue,
                format!("unsupported blob type {kind}"),
            ))
        }
        Some(_) => {}
    }
    verify_content_md5(ctx, &ctx.body)?;

    let container = ctx.container_name()?;
    let name = ctx.blob_name()?;
    let replacement = Replacement {
        ctx,
        metadata: ctx.metadata()?,
        tags: ctx.tags()?,
        tier: access_tier(ctx)?,
        version: metadata.next_version_id(),
    };

    let blob = metadata
        .write_blob(container, name, &mut |slot| {
            let blob = replacement.apply(slot, ctx.body.clone(), Vec::new())?;
            *slot = Some(blob);
            Ok(())
        })
        .await?
        .ok_or_else(|| StorageError::new(ErrorCode::InternalError))?;
    metadata.clear_staged_blocks(container, name).await;
    debug!(container = %container, blob = %name, size = ctx.body.len(), "blob uploaded");

    Ok(write_response(ctx, &blob))
}

/// PUT /{container}/{blob}?comp=block&blockid=... - Stage a block.
pub async fn stage_block(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let container = ctx.container_name()?;
    let name = ctx.blob_name()?;
    let block_id = ctx
        .query_param("blockid")
        .map(BlockId::from_encoded)
        .ok_or_else(|| StorageError::new(ErrorCode::MissingRequiredQueryParameter))?;
    if block_id.decode().is_none() {
        return Err(StorageError::new(ErrorCode::InvalidBlockId));
    }
    if ctx.body.len() as u64 > MAX_BLOCK_SIZE {
        return Err(StorageError::new(ErrorCode::OutOfRangeInput));
    }
    verify_content_md5(ctx, &ctx.body)?;

    // All uncommitted ids of one blob share an encoded length.
    let staged = metadata.staged_blocks(container, name).await;
    if staged
        .iter()
        .any(|(id, _)| id.as_str().len() != block_id.as_str().len())
    {
        return Err(StorageError::with_message(
            ErrorCode::InvalidBlobOrBlock,
            "block ids of one blob must have equal length",
        ));
    }

    if let Ok(mut current) = metadata.get_blob(container, name).await {
        current
            .lease
            .check_write(ctx.lease_id(), LeaseScope::Blob, ctx.timestamp)
            .map_err(StorageError::new)?;
    }

    metadata
        .stage_block(container, name, block_id, ctx.body.clone())
        .await?;

    let mut headers = common_headers(ctx);
    put_header(&mut headers, "content-md5", &content_md5(&ctx.body));
    put_header(&mut headers, "x-ms-request-server-encrypted", "false");
    Ok(build_response(StatusCode::CREATED, headers, Bytes::new()))
}

/// Finds a block for a commit, preferring the section the list names.
fn resolve_block<'a>(
    id: &BlockId,
    lookup: BlockLookup,
    staged: &'a [(BlockId, Bytes)],
    committed: &'a [(BlockId, Bytes)],
) -> Option<&'a Bytes> {
    let find = |set: &'a [(BlockId, Bytes)]| set.iter().find(|(b, _)| b == id).map(|(_, d)| d);
    match lookup {
        BlockLookup::Uncommitted => find(staged),
        BlockLookup::Committed => find(committed),
        BlockLookup::Latest => find(staged).or_else(|| find(committed)),
    }
}

/// PUT /{container}/{blob}?comp=blocklist - Commit a block list.
pub async fn commit_block_list(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let container = ctx.container_name()?;
    let name = ctx.blob_name()?;
    let xml = std::str::from_utf8(&ctx.body)
        .map_err(|_| StorageError::new(ErrorCode::InvalidXmlDocument))?;
    let requested = parse_block_list_request(xml)?;
    let staged = metadata.staged_blocks(container, name).await;

    let replacement = Replacement {
        ctx,
        metadata: ctx.metadata()?,
        tags: ctx.tags()?,
        tier: access_tier(ctx)?,
        version: metadata.next_version_id(),
    };

    let blob = metadata
        .write_blob(container, name, &mut |slot| {
            let committed = slot
                .as_ref()
                .filter(|b| !b.deleted)
                .map(|b| b.blocks.clone())
                .unwrap_or_default();

            let mut content = BytesMut::new();
            let mut layout = Vec::with_capacity(requested.len());
            for (id, lookup) in &requested {
                let data = resolve_block(id, *lookup, &staged, &committed).ok_or_else(|| {
                    StorageError::with_message(
                        ErrorCode::InvalidBlockList,
                        format!("block {id} was not found"),
                    )
                })?;
                content.extend_from_slice(data);
                layout.push((id.clone(), data.len()));
            }

            let content = content.freeze();
            let mut offset = 0;
            let blocks = layout
                .into_iter()
                .map(|(id, len)| {
                    let slice = content.slice(offset..offset + len);
                    offset += len;
                    (id, slice)
                })
                .collect();

            let blob = replacement.apply(slot, content, blocks)?;
            *slot = Some(blob);
            Ok(())
        })
        .await?
        .ok_or_else(|| StorageError::new(ErrorCode::InternalError))?;
    metadata.clear_staged_blocks(container, name).await;
    debug!(
        container = %container,
        blob = %name,
        blocks = requested.len(),
        "block list committed"
    );

    Ok(write_response(ctx, &blob))
}

/// GET /{container}/{blob}?comp=blocklist - Get the block list.
pub async fn get_block_list(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let container = ctx.container_name()?;
    let name = ctx.blob_name()?;
    let list_type = ctx
        .query_param("blocklisttype")
        .map(BlockListType::from_str)
        .unwrap_or(BlockListType::Committed);

    let current = metadata.get_blob(container, name).await.ok();
    let staged = metadata.staged_blocks(container, name).await;
    if current.is_none() && staged.is_empty() {
        return Err(StorageError::new(ErrorCode::BlobNotFound));
    }

    let mut list = BlockList::default();
    if list_type != BlockListType::Uncommitted {
        if let Some(ref blob) = current {
            list.entries.extend(blob.blocks.iter().map(|(id, data)| BlockListEntry {
                id: id.clone(),
                state: BlockState::Committed,
                size: data.len() as u64,
            }));
        }
    }
    if list_type != BlockListType::Committed {
        list.entries.extend(staged.iter().map(|(id, data)| BlockListEntry {
            id: id.clone(),
            state: BlockState::Uncommitted,
            size: data.len() as u64,
        }));
    }

    let mut response = xml_response(ctx, serialize_block_list(&list));
    if let Some(blob) = current {
        put_header(&mut response.headers, "etag", &blob.properties.etag);
        put_header(
            &mut response.headers,
            "x-ms-blob-content-length",
            &blob.content.len().to_string(),
        );
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_prefers_staged_block() {
        let id = BlockId::for_index("t", 0);
        let staged = vec![(id.clone(), Bytes::from_static(b"new"))];
        let committed = vec![(id.clone(), Bytes::from_static(b"old"))];

        let latest = resolve_block(&id, BlockLookup::Latest, &staged, &committed);
        assert_eq!(latest.map(|b| &b[..]), Some(&b"new"[..]));
        let pinned = resolve_block(&id, BlockLookup::Committed, &staged, &committed);
        assert_eq!(pinned.map(|b| &b[..]), Some(&b"old"[..]));

        let other = BlockId::for_index("t", 1);
        assert!(resolve_block(&other, BlockLookup::Latest, &staged, &committed).is_none());
    }
}
