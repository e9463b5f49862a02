//! Request routing for the emulated blob service.

use std::sync::Arc;

use crate::context::RequestContext;
use crate::emulator::handlers;
use crate::emulator::store::MetadataStore;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::transport::TransportResponse;

/// State shared between handlers.
#[derive(Clone)]
pub struct AppState {
    pub account: Arc<str>,
    pub metadata: Arc<dyn MetadataStore>,
}

/// Dispatches on the path depth: service, container or blob.
pub async fn route(ctx: &RequestContext, state: &AppState) -> StorageResult<TransportResponse> {
    match (&ctx.container, &ctx.blob) {
        (None, _) => route_service_request(ctx, state).await,
        (Some(_), None) => route_container_request(ctx, state).await,
        (Some(_), Some(_)) => route_blob_request(ctx, state).await,
    }
}

/// Routes service-level requests.
async fn route_service_request(
    ctx: &RequestContext,
    state: &AppState,
) -> StorageResult<TransportResponse> {
    match (ctx.method.as_str(), ctx.restype(), ctx.comp()) {
        // List containers
        ("GET", None, Some("list")) => {
            handlers::list_containers(ctx, state.metadata.clone()).await
        }
        // Filter blobs (service level)
        ("GET", None, Some("blobs")) => {
            handlers::filter_blobs_service(ctx, state.metadata.clone()).await
        }
        _ => Err(StorageError::new(ErrorCode::UnsupportedHttpVerb)),
    }
}

/// Routes container-level requests.
async fn route_container_request(
    ctx: &RequestContext,
    state: &AppState,
) -> StorageResult<TransportResponse> {
    match (ctx.method.as_str(), ctx.restype(), ctx.comp()) {
        // Create container
        ("PUT", Some("container"), None) => {
            handlers::create_container(ctx, state.metadata.clone()).await
        }
        // Delete container
        ("DELETE", Some("container"), None) => {
            handlers::delete_container(ctx, state.metadata.clone()).await
        }
        // Get container properties
        ("GET" | "HEAD", Some("container"), None) => {
            handlers::get_container_properties(ctx, state.metadata.clone()).await
        }
        // Set container metadata
        ("PUT", Some("container"), Some("metadata")) => {
            handlers::set_container_metadata(ctx, state.metadata.clone()).await
        }
        // Lease container
        ("PUT", Some("container"), Some("lease")) => {
            handlers::container_lease(ctx, state.metadata.clone()).await
        }
        // List blobs
        ("GET", Some("container"), Some("list")) => {
            handlers::list_blobs(ctx, state.metadata.clone()).await
        }
        // Filter blobs (container level)
        ("GET", Some("container"), Some("blobs")) => {
            handlers::filter_blobs_container(ctx, state.metadata.clone()).await
        }
        _ => Err(StorageError::new(ErrorCode::UnsupportedHttpVerb)),
    }
}

/// Routes blob-level requests.
async fn route_blob_request(
    ctx: &RequestContext,
    state: &AppState,
) -> StorageResult<TransportResponse> {
    let metadata = state.metadata.clone();
    match (ctx.method.as_str(), ctx.comp()) {
        // Download blob
        ("GET", None) => handlers::download_blob(ctx, metadata).await,
        // Get blob properties
        ("HEAD", None) => handlers::get_blob_properties(ctx, metadata).await,
        // Put blob or copy
        ("PUT", None) => {
            if ctx.copy_source().is_some() {
                handlers::copy_blob(ctx, metadata, &state.account).await
            } else {
                handlers::upload_block_blob(ctx, metadata).await
            }
        }
        // Delete blob
        ("DELETE", None) => handlers::delete_blob(ctx, metadata).await,
        // Undelete blob
        ("PUT", Some("undelete")) => handlers::undelete_blob(ctx, metadata).await,
        // Set blob properties
        ("PUT", Some("properties")) => handlers::set_blob_properties(ctx, metadata).await,
        // Set blob metadata
        ("PUT", Some("metadata")) => handlers::set_blob_metadata(ctx, metadata).await,
        // Blob tags
        ("GET", Some("tags")) => handlers::get_blob_tags(ctx, metadata).await,
        ("PUT", Some("tags")) => handlers::set_blob_tags(ctx, metadata).await,
        // Lease blob
        ("PUT", Some("lease")) => handlers::blob_lease(ctx, metadata).await,
        // Block blob operations
        ("PUT", Some("block")) => handlers::stage_block(ctx, metadata).await,
        ("PUT", Some("blocklist")) => handlers::commit_block_list(ctx, metadata).await,
        ("GET", Some("blocklist")) => handlers::get_block_list(ctx, metadata).await,
        _ => Err(StorageError::new(ErrorCode::UnsupportedHttpVerb)),
    }
}
