//! In-memory metadata store for the emulator: containers, blobs, staged
//! blocks and archived versions.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::context::format_iso8601;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::LeaseRecord;
use crate::models::{BlobProperties, BlockId, MetadataMap, TagMap};

/// Fresh opaque ETag.
pub fn new_etag() -> String {
    format!("\"0x{}\"", uuid::Uuid::new_v4().simple())
}

/// A stored container.
#[derive(Debug, Clone)]
pub struct ContainerModel {
    pub name: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub metadata: MetadataMap,
    pub lease: LeaseRecord,
}

impl ContainerModel {
    pub fn new(name: impl Into<String>, metadata: MetadataMap) -> Self {
        Self {
            name: name.into(),
            etag: new_etag(),
            last_modified: Utc::now(),
            metadata,
            lease: LeaseRecord::default(),
        }
    }

    pub fn touch(&mut self) {
        self.etag = new_etag();
        self.last_modified = Utc::now();
    }
}

/// A stored blob version. The current version lives in the blob table; older
/// ones are archived with `is_current == false`.
#[derive(Debug, Clone)]
pub struct BlobModel {
    pub container: String,
    pub name: String,
    pub properties: BlobProperties,
    pub tags: TagMap,
    pub lease: LeaseRecord,
    pub content: Bytes,
    /// Committed blocks in layout order, each a slice of `content`.
    pub blocks: Vec<(BlockId, Bytes)>,
    pub deleted: bool,
    pub deleted_on: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl BlobModel {
    pub fn new(container: &str, name: &str, version_id: String) -> Self {
        let now = Utc::now();
        let properties = BlobProperties {
            etag: new_etag(),
            last_modified: now,
            created_on: Some(now),
            version_id: Some(version_id),
            ..Default::default()
        };
        Self {
            container: container.to_string(),
            name: name.to_string(),
            properties,
            tags: TagMap::new(),
            lease: LeaseRecord::default(),
            content: Bytes::new(),
            blocks: Vec::new(),
            deleted: false,
            deleted_on: None,
            is_current: true,
        }
    }

    /// Marks a write: new ETag, Last-Modified and version id.
    pub fn touch(&mut self, version_id: String) {
        self.properties.etag = new_etag();
        self.properties.last_modified = Utc::now();
        self.properties.version_id = Some(version_id);
    }

    pub fn set_content(&mut self, content: Bytes, blocks: Vec<(BlockId, Bytes)>) {
        self.properties.content_length = content.len() as u64;
        self.content = content;
        self.blocks = blocks;
    }

    pub fn version_id(&self) -> Option<&str> {
        self.properties.version_id.as_deref()
    }

    /// Properties as reported at `now`, with lease fields resolved.
    pub fn observed_properties(&self, now: DateTime<Utc>) -> BlobProperties {
        let lease = self.lease.observed(now);
        let mut properties = self.properties.clone();
        properties.lease_state = lease.state;
        properties.lease_status = lease.status();
        properties.lease_duration = lease.duration();
        properties.tag_count = (!self.tags.is_empty()).then(|| self.tags.len() as u32);
        properties
    }
}

/// Mutation applied to a blob slot under its entry lock. `None` means no blob
/// (live or soft-deleted) exists under the name.
pub type BlobMutation<'a> =
    &'a mut (dyn FnMut(&mut Option<BlobModel>) -> StorageResult<()> + Send);

/// Mutation applied to a container under its entry lock.
pub type ContainerMutation<'a> =
    &'a mut (dyn FnMut(&mut ContainerModel) -> StorageResult<()> + Send);

/// Check a container must pass, under its entry lock, before it is removed.
pub type ContainerCheck<'a> = &'a (dyn Fn(&ContainerModel) -> StorageResult<()> + Send + Sync);

/// Storage operations the emulator handlers run against.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Container operations
    async fn create_container(&self, container: ContainerModel) -> StorageResult<()>;
    async fn get_container(&self, name: &str) -> StorageResult<ContainerModel>;
    async fn update_container(
        &self,
        name: &str,
        mutate: ContainerMutation<'_>,
    ) -> StorageResult<ContainerModel>;
    /// Deletes a container with all its blobs once `check` passes.
    async fn delete_container(&self, name: &str, check: ContainerCheck<'_>) -> StorageResult<()>;
    async fn list_containers(
        &self,
        prefix: Option<&str>,
        marker: Option<&str>,
        maxresults: usize,
    ) -> StorageResult<(Vec<ContainerModel>, Option<String>)>;
    async fn container_names(&self) -> Vec<String>;

    // Blob operations
    /// The live current version.
    async fn get_blob(&self, container: &str, name: &str) -> StorageResult<BlobModel>;
    /// A specific version, current or archived.
    async fn get_blob_version(
        &self,
        container: &str,
        name: &str,
        version_id: &str,
    ) -> StorageResult<BlobModel>;
    /// Applies `mutate` atomically. When the mutation changes the version id,
    /// the previous version is archived.
    async fn write_blob(
        &self,
        container: &str,
        name: &str,
        mutate: BlobMutation<'_>,
    ) -> StorageResult<Option<BlobModel>>;
    async fn delete_blob_version(
        &self,
        container: &str,
        name: &str,
        version_id: &str,
    ) -> StorageResult<()>;
    /// Blobs under `prefix` in name order. Each name yields its current
    /// version, then archived versions oldest first when requested.
    async fn list_blob_models(
        &self,
        container: &str,
        prefix: Option<&str>,
        include_deleted: bool,
        include_versions: bool,
    ) -> StorageResult<Vec<BlobModel>>;

    // Block operations
    async fn stage_block(
        &self,
        container: &str,
        blob: &str,
        block_id: BlockId,
        data: Bytes,
    ) -> StorageResult<()>;
    async fn staged_blocks(&self, container: &str, blob: &str) -> Vec<(BlockId, Bytes)>;
    async fn clear_staged_blocks(&self, container: &str, blob: &str);

    /// Next version id; strictly increasing.
    fn next_version_id(&self) -> String;
}

type BlobKey = (Arc<str>, Arc<str>);

/// In-memory implementation of the metadata store.
pub struct MemoryMetadataStore {
    containers: DashMap<Arc<str>, ContainerModel>,

    /// Current blob versions, live or soft-deleted.
    blobs: DashMap<BlobKey, BlobModel>,

    /// Secondary index: container -> sorted blob names.
    blob_index: DashMap<Arc<str>, BTreeSet<Arc<str>>>,

    /// Archived versions per blob, oldest first.
    versions: DashMap<BlobKey, Vec<BlobModel>>,

    /// Staged (uncommitted) blocks per blob, in staging order.
    staged: DashMap<BlobKey, Vec<(BlockId, Bytes)>>,

    last_version: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            blobs: DashMap::new(),
            blob_index: DashMap::new(),
            versions: DashMap::new(),
            staged: DashMap::new(),
            last_version: Mutex::new(None),
        }
    }

    #[inline]
    fn blob_key(container: &str, name: &str) -> BlobKey {
        (Arc::from(container), Arc::from(name))
    }

    fn require_container(&self, name: &str) -> StorageResult<()> {
        if self.containers.contains_key(name) {
            Ok(())
        } else {
            Err(StorageError::new(ErrorCode::ContainerNotFound))
        }
    }

    fn archive(&self, key: &BlobKey, mut previous: BlobModel) {
        previous.is_current = false;
        previous.lease = LeaseRecord::default();
        self.versions.entry(key.clone()).or_default().push(previous);
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_container(&self, container: ContainerModel) -> StorageResult<()> {
        match self.containers.entry(Arc::from(container.name.as_str())) {
            Entry::Occupied(_) => Err(StorageError::new(ErrorCode::ContainerAlreadyExists)),
            Entry::Vacant(slot) => {
                slot.insert(container);
                Ok(())
            }
        }
    }

    async fn get_container(&self, name: &str) -> StorageResult<ContainerModel> {
        self.containers
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| StorageError::new(ErrorCode::ContainerNotFound))
    }

    async fn update_container(
        &self,
        name: &str,
        mutate: ContainerMutation<'_>,
    ) -> StorageResult<ContainerModel> {
        let mut entry = self
            .containers
            .get_mut(name)
            .ok_or_else(|| StorageError::new(ErrorCode::ContainerNotFound))?;
        let mut updated = entry.value().clone();
        mutate(&mut updated)?;
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    async fn delete_container(&self, name: &str, check: ContainerCheck<'_>) -> StorageResult<()> {
        let mut denied = None;
        let removed = self.containers.remove_if(name, |_, container| match check(container) {
            Ok(()) => true,
            Err(err) => {
                denied = Some(err);
                false
            }
        });
        if let Some(err) = denied {
            return Err(err);
        }
        if removed.is_none() {
            return Err(StorageError::new(ErrorCode::ContainerNotFound));
        }

        self.blobs.retain(|(c, _), _| c.as_ref() != name);
        self.versions.retain(|(c, _), _| c.as_ref() != name);
        self.staged.retain(|(c, _), _| c.as_ref() != name);
        self.blob_index.remove(name);
        Ok(())
    }

    async fn list_containers(
        &self,
        prefix: Option<&str>,
        marker: Option<&str>,
        maxresults: usize,
    ) -> StorageResult<(Vec<ContainerModel>, Option<String>)> {
        let mut matching: Vec<ContainerModel> = self
            .containers
            .iter()
            .filter(|entry| prefix.map_or(true, |p| entry.key().starts_with(p)))
            .filter(|entry| marker.map_or(true, |m| entry.key().as_ref() > m))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));

        let next_marker = if matching.len() > maxresults {
            matching.truncate(maxresults);
            matching.last().map(|c| c.name.clone())
        } else {
            None
        };
        Ok((matching, next_marker))
    }

    async fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.iter().map(|c| c.key().to_string()).collect();
        names.sort();
        names
    }

    async fn get_blob(&self, container: &str, name: &str) -> StorageResult<BlobModel> {
        self.require_container(container)?;
        self.blobs
            .get(&Self::blob_key(container, name))
            .filter(|b| !b.deleted)
            .map(|b| b.value().clone())
            .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))
    }

    async fn get_blob_version(
        &self,
        container: &str,
        name: &str,
        version_id: &str,
    ) -> StorageResult<BlobModel> {
        self.require_container(container)?;
        let key = Self::blob_key(container, name);
        if let Some(current) = self.blobs.get(&key) {
            if current.version_id() == Some(version_id) {
                return Ok(current.value().clone());
            }
        }
        self.versions
            .get(&key)
            .and_then(|archived| {
                archived
                    .iter()
                    .find(|v| v.version_id() == Some(version_id))
                    .cloned()
            })
            .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))
    }

    async fn write_blob(
        &self,
        container: &str,
        name: &str,
        mutate: BlobMutation<'_>,
    ) -> StorageResult<Option<BlobModel>> {
        self.require_container(container)?;
        let key = Self::blob_key(container, name);

        match self.blobs.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = slot.get().clone();
                let mut working = Some(previous.clone());
                mutate(&mut working)?;
                match working {
                    Some(updated) => {
                        if updated.version_id() != previous.version_id() {
                            self.archive(&key, previous);
                        }
                        slot.insert(updated.clone());
                        Ok(Some(updated))
                    }
                    None => {
                        slot.remove();
                        if let Some(mut names) = self.blob_index.get_mut(container) {
                            names.remove(name);
                        }
                        Ok(None)
                    }
                }
            }
            Entry::Vacant(slot) => {
                let mut working = None;
                mutate(&mut working)?;
                if let Some(created) = working {
                    slot.insert(created.clone());
                    self.blob_index
                        .entry(Arc::from(container))
                        .or_default()
                        .insert(Arc::from(name));
                    return Ok(Some(created));
                }
                Ok(None)
            }
        }
    }

    async fn delete_blob_version(
        &self,
        container: &str,
        name: &str,
        version_id: &str,
    ) -> StorageResult<()> {
        self.require_container(container)?;
        let key = Self::blob_key(container, name);
        let mut archived = self
            .versions
            .get_mut(&key)
            .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
        let before = archived.len();
        archived.retain(|v| v.version_id() != Some(version_id));
        if archived.len() == before {
            return Err(StorageError::new(ErrorCode::BlobNotFound));
        }
        Ok(())
    }

    async fn list_blob_models(
        &self,
        container: &str,
        prefix: Option<&str>,
        include_deleted: bool,
        include_versions: bool,
    ) -> StorageResult<Vec<BlobModel>> {
        self.require_container(container)?;

        let names: Vec<Arc<str>> = self
            .blob_index
            .get(container)
            .map(|index| {
                index
                    .iter()
                    .filter(|n| prefix.map_or(true, |p| n.starts_with(p)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let container_arc: Arc<str> = Arc::from(container);
        let mut models = Vec::with_capacity(names.len());
        for name in names {
            let key = (container_arc.clone(), name);
            if let Some(current) = self.blobs.get(&key) {
                if include_deleted || !current.deleted {
                    models.push(current.value().clone());
                }
            }
            if include_versions {
                if let Some(archived) = self.versions.get(&key) {
                    models.extend(archived.iter().cloned());
                }
            }
        }
        Ok(models)
    }

    async fn stage_block(
        &self,
        container: &str,
        blob: &str,
        block_id: BlockId,
        data: Bytes,
    ) -> StorageResult<()> {
        self.require_container(container)?;
        let mut staged = self.staged.entry(Self::blob_key(container, blob)).or_default();
        if let Some(existing) = staged.iter_mut().find(|(id, _)| *id == block_id) {
            existing.1 = data;
        } else {
            staged.push((block_id, data));
        }
        Ok(())
    }

    async fn staged_blocks(&self, container: &str, blob: &str) -> Vec<(BlockId, Bytes)> {
        self.staged
            .get(&Self::blob_key(container, blob))
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    async fn clear_staged_blocks(&self, container: &str, blob: &str) {
        self.staged.remove(&Self::blob_key(container, blob));
    }

    fn next_version_id(&self) -> String {
        let mut last = self.last_version.lock();
        // Version ids have 100ns resolution; two ids never share a tick.
        let now = Utc::now();
        let now = now - Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos() % 100));
        let next = match *last {
            Some(prev) if now <= prev => prev + Duration::nanoseconds(100),
            _ => now,
        };
        *last = Some(next);
        format_iso8601(&next)
    }
}
