//! Container-level handlers.

use bytes::Bytes;
use http::StatusCode;
use std::sync::Arc;
use tracing::debug;

use crate::config::DEFAULT_PAGE_SIZE;
use crate::context::{ListParams, RequestContext};
use crate::emulator::store::{BlobModel, ContainerModel, MetadataStore};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::LeaseScope;
use crate::models::{validate_container_name, BlobItem, BlobListEntry, BlobPrefix, MetadataMap};
use crate::transport::TransportResponse;
use crate::xml::serialize::serialize_blob_list;

use super::{
    add_etag_headers, add_metadata_headers, build_response, check_conditions, common_headers,
    put_header, xml_response,
};

/// PUT /{container}?restype=container - Create container.
pub async fn create_container(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let name = ctx.container_name()?;
    validate_container_name(name)
        .map_err(|msg| StorageError::with_message(ErrorCode::InvalidResourceName, msg))?;

    let container = ContainerModel::new(name, ctx.metadata()?);
    metadata.create_container(container.clone()).await?;
    debug!(container = %name, "container created");

    let mut headers = common_headers(ctx);
    add_etag_headers(&mut headers, &container.etag, &container.last_modified);
    Ok(build_response(StatusCode::CREATED, headers, Bytes::new()))
}

/// DELETE /{container}?restype=container - Delete container.
pub async fn delete_container(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let name = ctx.container_name()?;
    let now = ctx.timestamp;
    let lease_id = ctx.lease_id();
    metadata
        .delete_container(name, &|container| {
            container
                .lease
                .observed(now)
                .check_write(lease_id, LeaseScope::Container, now)
                .map_err(StorageError::new)?;
            check_conditions(ctx, Some(&container.etag))
        })
        .await?;
    debug!(container = %name, "container deleted");
    Ok(build_response(StatusCode::ACCEPTED, common_headers(ctx), Bytes::new()))
}

/// GET/HEAD /{container}?restype=container - Get container properties.
pub async fn get_container_properties(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let container = metadata.get_container(ctx.container_name()?).await?;
    let lease = container.lease.observed(ctx.timestamp);

    let mut headers = common_headers(ctx);
    add_etag_headers(&mut headers, &container.etag, &container.last_modified);
    put_header(&mut headers, "x-ms-lease-state", lease.state.as_str());
    put_header(&mut headers, "x-ms-lease-status", lease.status().as_str());
    if let Some(duration) = lease.duration() {
        put_header(&mut headers, "x-ms-lease-duration", duration.as_str());
    }
    add_metadata_headers(&mut headers, &container.metadata);
    Ok(build_response(StatusCode::OK, headers, Bytes::new()))
}

/// PUT /{container}?restype=container&comp=metadata - Set container metadata.
pub async fn set_container_metadata(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let replacement = ctx.metadata()?;
    let now = ctx.timestamp;
    let lease_id = ctx.lease_id();

    let container = metadata
        .update_container(ctx.container_name()?, &mut |container| {
            container
                .lease
                .check_write(lease_id, LeaseScope::Container, now)
                .map_err(StorageError::new)?;
            check_conditions(ctx, Some(&container.etag))?;
            container.metadata = replacement.clone();
            container.touch();
            Ok(())
        })
        .await?;

    let mut headers = common_headers(ctx);
    add_etag_headers(&mut headers, &container.etag, &container.last_modified);
    Ok(build_response(StatusCode::OK, headers, Bytes::new()))
}

/// GET /{container}?restype=container&comp=blobs&where=... - Find blobs by
/// tags within one container.
pub async fn filter_blobs_container(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let name = ctx.container_name()?.to_string();
    super::service::filter_blobs(ctx, metadata, Some(&name)).await
}

/// One position in a listing: a virtual directory, or a blob name with its
/// current and (optionally) archived versions.
enum ListingUnit {
    Prefix(String),
    Blob(String, Vec<BlobModel>),
}

impl ListingUnit {
    fn key(&self) -> &str {
        match self {
            ListingUnit::Prefix(p) => p,
            ListingUnit::Blob(name, _) => name,
        }
    }
}

/// Whether `name` was already returned before `marker`. A marker that is a
/// delimiter prefix covers every name below it.
fn before_marker(name: &str, marker: &str, delimiter: Option<&str>) -> bool {
    if name <= marker {
        return true;
    }
    matches!(delimiter, Some(d) if marker.ends_with(d) && name.starts_with(marker))
}

/// Groups name-ordered blobs into listing units, collapsing names that
/// contain the delimiter past `prefix` into prefixes.
fn group_units(models: Vec<BlobModel>, prefix: &str, delimiter: Option<&str>) -> Vec<ListingUnit> {
    let mut units: Vec<ListingUnit> = Vec::new();
    for model in models {
        let virtual_dir = delimiter.and_then(|d| {
            let rest = model.name.get(prefix.len()..)?;
            rest.find(d)
                .map(|idx| format!("{}{}{}", prefix, &rest[..idx], d))
        });

        match virtual_dir {
            Some(dir) => {
                if !matches!(units.last(), Some(ListingUnit::Prefix(last)) if *last == dir) {
                    units.push(ListingUnit::Prefix(dir));
                }
            }
            None => match units.last_mut() {
                Some(ListingUnit::Blob(last, versions)) if *last == model.name => {
                    versions.push(model)
                }
                _ => units.push(ListingUnit::Blob(model.name.clone(), vec![model])),
            },
        }
    }
    units
}

/// GET /{container}?restype=container&comp=list - List blobs.
///
/// Blobs and prefixes are merged in name order and both count toward
/// `maxresults`. The continuation marker is the last name returned.
pub async fn list_blobs(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let container = ctx.container_name()?;
    let params = ListParams::from_query(&ctx.query_params)?;
    let maxresults = params.maxresults.unwrap_or(DEFAULT_PAGE_SIZE);
    let include_metadata = params.includes("metadata");
    let include_tags = params.includes("tags");
    let include_versions = params.includes("versions");

    let prefix = params.prefix.as_deref().unwrap_or("");
    let delimiter = params.delimiter.as_deref();

    let mut models = metadata
        .list_blob_models(
            container,
            params.prefix.as_deref(),
            params.includes("deleted"),
            include_versions,
        )
        .await?;
    if let Some(marker) = params.marker.as_deref() {
        models.retain(|m| !before_marker(&m.name, marker, delimiter));
    }

    let mut units = group_units(models, prefix, delimiter);
    let next_marker = if units.len() > maxresults as usize {
        units.truncate(maxresults as usize);
        units.last().map(|u| u.key().to_string())
    } else {
        None
    };

    let now = ctx.timestamp;
    let mut entries = Vec::new();
    for unit in units {
        match unit {
            ListingUnit::Prefix(name) => entries.push(BlobListEntry::Prefix(BlobPrefix {
                name,
                delimiter: delimiter.unwrap_or("/").to_string(),
                depth: 0,
                page_size: None,
            })),
            ListingUnit::Blob(_, versions) => {
                for model in versions {
                    let mut properties = model.observed_properties(now);
                    if !include_metadata {
                        properties.metadata = MetadataMap::new();
                    }
                    entries.push(BlobListEntry::Blob(BlobItem {
                        name: model.name,
                        deleted: model.deleted,
                        version_id: properties.version_id.clone(),
                        is_current_version: include_versions.then_some(model.is_current),
                        properties,
                        tags: include_tags.then_some(model.tags),
                    }));
                }
            }
        }
    }

    let xml = serialize_blob_list(
        container,
        &entries,
        params.prefix.as_deref(),
        delimiter,
        params.marker.as_deref(),
        maxresults,
        next_marker.as_deref(),
    );
    Ok(xml_response(ctx, xml))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> BlobModel {
        BlobModel::new("c", name, "v".to_string())
    }

    #[test]
    fn groups_by_first_delimiter_after_prefix() {
        let models = ["a/b/x", "a/b/y", "a/c/z", "top"].into_iter().map(model).collect();
        let keys: Vec<String> = group_units(models, "", Some("/"))
            .iter()
            .map(|u| u.key().to_string())
            .collect();
        assert_eq!(keys, vec!["a/", "top"]);

        let models = ["a/b/x", "a/b/y", "a/c/z"].into_iter().map(model).collect();
        let keys: Vec<String> = group_units(models, "a/", Some("/"))
            .iter()
            .map(|u| u.key().to_string())
            .collect();
        assert_eq!(keys, vec!["a/b/", "a/c/"]);
    }

    #[test]
    fn versions_share_one_unit() {
        let models = vec![model("a"), model("a"), model("b")];
        let units = group_units(models, "", None);
        assert_eq!(units.len(), 2);
        assert!(matches!(&units[0], ListingUnit::Blob(_, v) if v.len() == 2));
    }

    #[test]
    fn prefix_marker_skips_its_subtree() {
        assert!(before_marker("a/b/x", "a/", Some("/")));
        assert!(!before_marker("b", "a/", Some("/")));
        assert!(before_marker("a", "a", None));
        assert!(!before_marker("a/x", "a", None));
    }
}
