//! XML deserialization: emulator request bodies and client response bodies.

use std::collections::BTreeMap;

use super::{path_ends_with, walk_elements, XmlError};
use crate::context::parse_http_date;
use crate::models::{
    AccessTier, BlobItem, BlobListEntry, BlobPrefix, BlobProperties, BlobType, BlockId,
    BlockList, BlockListEntry, BlockState, ContainerItem, ContainerProperties, LeaseDuration,
    LeaseState, LeaseStatus, TagMap, TaggedBlobItem,
};

/// Section of a Put Block List body a block id appeared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLookup {
    Committed,
    Uncommitted,
    Latest,
}

/// Parses a Put Block List body, keeping document order across sections.
pub fn parse_block_list_request(xml: &str) -> Result<Vec<(BlockId, BlockLookup)>, XmlError> {
    let mut blocks = Vec::new();
    let mut saw_root = false;
    walk_elements(xml, |path, text| {
        let lookup = match path {
            [root, leaf] if root == "BlockList" => match leaf.as_str() {
                "Committed" => BlockLookup::Committed,
                "Uncommitted" => BlockLookup::Uncommitted,
                "Latest" => BlockLookup::Latest,
                other => return Err(XmlError(format!("unexpected element <{other}>"))),
            },
            [root] if root == "BlockList" => {
                saw_root = true;
                return Ok(());
            }
            _ => return Err(XmlError(format!("unexpected element <{}>", path.join("/")))),
        };
        blocks.push((BlockId::from_encoded(text.trim()), lookup));
        Ok(())
    })?;
    if !saw_root {
        return Err(XmlError("missing <BlockList> root".to_string()));
    }
    Ok(blocks)
}

/// Parses a `<Tags><TagSet>...` document into raw pairs.
pub fn parse_tags(xml: &str) -> Result<BTreeMap<String, String>, XmlError> {
    let mut tags = BTreeMap::new();
    let mut key: Option<String> = None;
    let mut value: Option<String> = None;
    walk_elements(xml, |path, text| {
        if path_ends_with(path, &["Tag", "Key"]) {
            key = Some(text.to_string());
        } else if path_ends_with(path, &["Tag", "Value"]) {
            value = Some(text.to_string());
        } else if path_ends_with(path, &["TagSet", "Tag"]) {
            let k = key
                .take()
                .ok_or_else(|| XmlError("<Tag> without <Key>".to_string()))?;
            tags.insert(k, value.take().unwrap_or_default());
        }
        Ok(())
    })?;
    Ok(tags)
}

/// Extracts `<Error><Code>` from an error body.
pub fn parse_error_code(xml: &str) -> Option<String> {
    error_field(xml, "Code")
}

/// Extracts the first line of `<Error><Message>` from an error body.
pub fn parse_error_message(xml: &str) -> Option<String> {
    error_field(xml, "Message").map(|m| m.lines().next().unwrap_or_default().to_string())
}

fn error_field(xml: &str, field: &str) -> Option<String> {
    if xml.trim().is_empty() {
        return None;
    }
    let mut found = None;
    walk_elements(xml, |path, text| {
        if path.len() == 2 && path[0] == "Error" && path[1] == field {
            found = Some(text.to_string());
        }
        Ok(())
    })
    .ok()?;
    found
}

fn apply_blob_property(props: &mut BlobProperties, name: &str, text: &str) {
    let owned = || Some(text.to_string()).filter(|t| !t.is_empty());
    match name {
        "Creation-Time" => props.created_on = parse_http_date(text),
        "Last-Modified" => {
            if let Some(dt) = parse_http_date(text) {
                props.last_modified = dt;
            }
        }
        "Etag" => props.etag = text.to_string(),
        "Content-Length" => props.content_length = text.parse().unwrap_or(0),
        "Content-Type" => props.content_type = owned(),
        "Content-Encoding" => props.content_encoding = owned(),
        "Content-Language" => props.content_language = owned(),
        "Content-MD5" => props.content_md5 = owned(),
        "Content-Disposition" => props.content_disposition = owned(),
        "Cache-Control" => props.cache_control = owned(),
        "BlobType" => props.blob_type = BlobType::from_str(text).unwrap_or_default(),
        "AccessTier" => props.access_tier = AccessTier::from_str(text),
        "LeaseStatus" => props.lease_status = LeaseStatus::from_str(text).unwrap_or_default(),
        "LeaseState" => props.lease_state = LeaseState::from_str(text).unwrap_or_default(),
        "LeaseDuration" => props.lease_duration = LeaseDuration::from_str(text),
        "TagCount" => props.tag_count = text.parse().ok(),
        _ => {}
    }
}

#[derive(Default)]
struct TagCollector {
    key: Option<String>,
    value: Option<String>,
    tags: BTreeMap<String, String>,
}

impl TagCollector {
    /// Feeds one closed element; returns true if it belonged to a tag set.
    fn feed(&mut self, path: &[String], text: &str) -> bool {
        if path_ends_with(path, &["Tag", "Key"]) {
            self.key = Some(text.to_string());
        } else if path_ends_with(path, &["Tag", "Value"]) {
            self.value = Some(text.to_string());
        } else if path_ends_with(path, &["TagSet", "Tag"]) {
            if let Some(k) = self.key.take() {
                self.tags.insert(k, self.value.take().unwrap_or_default());
            }
        } else {
            return path_ends_with(path, &["Tags", "TagSet"]);
        }
        true
    }

    fn take(&mut self) -> TagMap {
        TagMap::from_map_unchecked(std::mem::take(&mut self.tags))
    }
}

/// Parses one page of a List Blobs response. Prefix nodes are stamped with
/// `depth` and `delimiter` so callers can descend into them.
pub fn parse_blob_list(
    xml: &str,
    delimiter: Option<&str>,
    depth: usize,
) -> Result<(Vec<BlobListEntry>, Option<String>), XmlError> {
    let mut entries = Vec::new();
    let mut next_marker = None;
    let mut item: Option<BlobItem> = None;
    let mut has_tags = false;
    let mut tags = TagCollector::default();
    let mut prefix_name: Option<String> = None;

    walk_elements(xml, |path, text| {
        let inside_blob = path.len() >= 4 && path[1] == "Blobs" && path[2] == "Blob";
        if inside_blob {
            let blob = item.get_or_insert_with(|| BlobItem {
                name: String::new(),
                deleted: false,
                version_id: None,
                is_current_version: None,
                properties: BlobProperties::default(),
                tags: None,
            });
            match &path[3..] {
                [field] => match field.as_str() {
                    "Name" => blob.name = text.to_string(),
                    "Deleted" => blob.deleted = text == "true",
                    "VersionId" => blob.version_id = Some(text.to_string()),
                    "IsCurrentVersion" => blob.is_current_version = Some(text == "true"),
                    "Tags" => has_tags = true,
                    _ => {}
                },
                [group, name] if group == "Properties" => {
                    apply_blob_property(&mut blob.properties, name, text)
                }
                [group, name] if group == "Metadata" => {
                    blob.properties.metadata.insert_unchecked(name, text)
                }
                _ => {
                    tags.feed(path, text);
                }
            }
            return Ok(());
        }

        match path {
            [_, blobs, blob] if blobs == "Blobs" && blob == "Blob" => {
                let mut done = item.take().ok_or_else(|| XmlError("empty <Blob>".to_string()))?;
                if has_tags {
                    done.tags = Some(tags.take());
                    has_tags = false;
                }
                entries.push(BlobListEntry::Blob(done));
            }
            [_, blobs, prefix, name]
                if blobs == "Blobs" && prefix == "BlobPrefix" && name == "Name" =>
            {
                prefix_name = Some(text.to_string());
            }
            [_, blobs, prefix] if blobs == "Blobs" && prefix == "BlobPrefix" => {
                let name = prefix_name
                    .take()
                    .ok_or_else(|| XmlError("<BlobPrefix> without <Name>".to_string()))?;
                entries.push(BlobListEntry::Prefix(BlobPrefix {
                    name,
                    delimiter: delimiter.unwrap_or("/").to_string(),
                    depth,
                    page_size: None,
                }));
            }
            [_, marker] if marker == "NextMarker" => {
                next_marker = Some(text.to_string()).filter(|m| !m.is_empty());
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok((entries, next_marker))
}

/// Parses one page of a List Containers response.
pub fn parse_container_list(
    xml: &str,
) -> Result<(Vec<ContainerItem>, Option<String>), XmlError> {
    let mut items = Vec::new();
    let mut next_marker = None;
    let mut name = String::new();
    let mut props = ContainerProperties::default();

    walk_elements(xml, |path, text| {
        let in_container = path.len() >= 4 && path[1] == "Containers" && path[2] == "Container";
        if in_container {
            match &path[3..] {
                [field] if field == "Name" => name = text.to_string(),
                [group, field] if group == "Properties" => match field.as_str() {
                    "Last-Modified" => {
                        if let Some(dt) = parse_http_date(text) {
                            props.last_modified = dt;
                        }
                    }
                    "Etag" => props.etag = text.to_string(),
                    "LeaseStatus" => {
                        props.lease_status = LeaseStatus::from_str(text).unwrap_or_default()
                    }
                    "LeaseState" => {
                        props.lease_state = LeaseState::from_str(text).unwrap_or_default()
                    }
                    "LeaseDuration" => props.lease_duration = LeaseDuration::from_str(text),
                    _ => {}
                },
                [group, key] if group == "Metadata" => props.metadata.insert_unchecked(key, text),
                _ => {}
            }
            return Ok(());
        }
        match path {
            [_, containers, container]
                if containers == "Containers" && container == "Container" =>
            {
                items.push(ContainerItem {
                    name: std::mem::take(&mut name),
                    properties: std::mem::take(&mut props),
                });
            }
            [_, marker] if marker == "NextMarker" => {
                next_marker = Some(text.to_string()).filter(|m| !m.is_empty());
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok((items, next_marker))
}

/// Parses a Get Block List response.
pub fn parse_block_list(xml: &str) -> Result<BlockList, XmlError> {
    let mut list = BlockList::default();
    let mut name = String::new();
    let mut size = 0u64;

    walk_elements(xml, |path, text| {
        match path {
            [_, _, block, field] if block == "Block" && field == "Name" => {
                name = text.to_string()
            }
            [_, _, block, field] if block == "Block" && field == "Size" => {
                size = text
                    .parse()
                    .map_err(|_| XmlError(format!("bad block size {text:?}")))?
            }
            [_, section, block] if block == "Block" => {
                let state = match section.as_str() {
                    "CommittedBlocks" => BlockState::Committed,
                    "UncommittedBlocks" => BlockState::Uncommitted,
                    other => return Err(XmlError(format!("unexpected section <{other}>"))),
                };
                list.entries.push(BlockListEntry {
                    id: BlockId::from_encoded(std::mem::take(&mut name)),
                    state,
                    size,
                });
                size = 0;
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok(list)
}

/// Parses a Find Blobs by Tags response.
pub fn parse_filter_blobs(
    xml: &str,
) -> Result<(Vec<TaggedBlobItem>, Option<String>), XmlError> {
    let mut items = Vec::new();
    let mut next_marker = None;
    let mut name = String::new();
    let mut container = String::new();
    let mut tags = TagCollector::default();

    walk_elements(xml, |path, text| {
        if tags.feed(path, text) {
            return Ok(());
        }
        match path {
            [_, _, blob, field] if blob == "Blob" && field == "Name" => name = text.to_string(),
            [_, _, blob, field] if blob == "Blob" && field == "ContainerName" => {
                container = text.to_string()
            }
            [_, blobs, blob] if blobs == "Blobs" && blob == "Blob" => {
                items.push(TaggedBlobItem {
                    container: std::mem::take(&mut container),
                    name: std::mem::take(&mut name),
                    tags: tags.take(),
                });
            }
            [_, marker] if marker == "NextMarker" => {
                next_marker = Some(text.to_string()).filter(|m| !m.is_empty());
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok((items, next_marker))
}
