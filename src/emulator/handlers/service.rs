//! Service-level handlers: container listing and tag queries.

use std::sync::Arc;

use crate::config::DEFAULT_PAGE_SIZE;
use crate::context::{ListParams, RequestContext};
use crate::emulator::store::{ContainerModel, MetadataStore};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{ContainerItem, ContainerProperties, TaggedBlobItem};
use crate::query::TagQuery;
use crate::transport::TransportResponse;
use crate::xml::serialize::{serialize_container_list, serialize_filter_blobs};

use super::xml_response;

pub(crate) fn container_item(
    container: &ContainerModel,
    now: chrono::DateTime<chrono::Utc>,
) -> ContainerItem {
    let lease = container.lease.observed(now);
    ContainerItem {
        name: container.name.clone(),
        properties: ContainerProperties {
            etag: container.etag.clone(),
            last_modified: container.last_modified,
            lease_state: lease.state,
            lease_status: lease.status(),
            lease_duration: lease.duration(),
            metadata: container.metadata.clone(),
        },
    }
}

/// GET /?comp=list - List containers.
pub async fn list_containers(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let params = ListParams::from_query(&ctx.query_params)?;
    let maxresults = params.maxresults.unwrap_or(DEFAULT_PAGE_SIZE);

    let (containers, next_marker) = metadata
        .list_containers(
            params.prefix.as_deref(),
            params.marker.as_deref(),
            maxresults as usize,
        )
        .await?;

    let now = ctx.timestamp;
    let items: Vec<ContainerItem> = containers.iter().map(|c| container_item(c, now)).collect();
    let xml = serialize_container_list(
        &items,
        params.prefix.as_deref(),
        params.marker.as_deref(),
        maxresults,
        next_marker.as_deref(),
        params.includes("metadata"),
    );
    Ok(xml_response(ctx, xml))
}

/// GET /?comp=blobs&where=... - Find blobs by tags across the account.
pub async fn filter_blobs_service(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    filter_blobs(ctx, metadata, None).await
}

/// Evaluates a tag query over every container, or only `scope`.
///
/// Results are ordered by container then blob name; the marker is the
/// `container/name` of the last blob returned.
pub(crate) async fn filter_blobs(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
    scope: Option<&str>,
) -> StorageResult<TransportResponse> {
    let expression = ctx
        .query_param("where")
        .ok_or_else(|| StorageError::new(ErrorCode::MissingRequiredQueryParameter))?;
    let query = TagQuery::parse(expression).map_err(|e| {
        StorageError::with_message(ErrorCode::InvalidQueryParameterValue, e.to_string())
    })?;
    let params = ListParams::from_query(&ctx.query_params)?;
    let maxresults = params.maxresults.unwrap_or(DEFAULT_PAGE_SIZE) as usize;

    let containers = match scope {
        Some(name) => {
            metadata.get_container(name).await?;
            vec![name.to_string()]
        }
        None => metadata.container_names().await,
    };

    let marker = params.marker.as_deref().and_then(|m| m.split_once('/'));
    let mut matches = Vec::new();
    let mut next_marker = None;

    'outer: for container in &containers {
        if query.container().map_or(false, |c| c != container) {
            continue;
        }
        let blobs = metadata
            .list_blob_models(container, None, false, false)
            .await?;
        for blob in blobs {
            if let Some((mc, mn)) = marker {
                if (container.as_str(), blob.name.as_str()) <= (mc, mn) {
                    continue;
                }
            }
            if !query.matches_blob(container, &blob.tags) {
                continue;
            }
            if matches.len() == maxresults {
                next_marker = matches
                    .last()
                    .map(|m: &TaggedBlobItem| format!("{}/{}", m.container, m.name));
                break 'outer;
            }
            matches.push(TaggedBlobItem {
                container: container.clone(),
                name: blob.name,
                tags: blob.tags,
            });
        }
    }

    let xml = serialize_filter_blobs(query.as_str(), &matches, next_marker.as_deref());
    Ok(xml_response(ctx, xml))
}
