//! XML serialization: client request bodies and emulator response bodies.

use super::escape;
use crate::context::format_http_date;
use crate::models::{
    BlobItem, BlobListEntry, BlockId, BlockList, ContainerItem, TagMap, TaggedBlobItem,
};

const DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

/// Put Block List body: every id in the `Latest` section, in layout order.
pub fn serialize_block_list_request(ids: &[BlockId]) -> String {
    let mut xml = String::from(DECLARATION);
    xml.push_str("<BlockList>");
    for id in ids {
        xml.push_str(&format!("<Latest>{}</Latest>", escape(id.as_str())));
    }
    xml.push_str("</BlockList>");
    xml
}

/// Serializes tags for Set Blob Tags and Get Blob Tags.
pub fn serialize_tags(tags: &TagMap) -> String {
    let mut xml = String::from(DECLARATION);
    xml.push_str("<Tags>");
    push_tag_set(&mut xml, tags);
    xml.push_str("</Tags>");
    xml
}

fn push_tag_set(xml: &mut String, tags: &TagMap) {
    xml.push_str("<TagSet>");
    for (key, value) in tags.iter() {
        xml.push_str(&format!(
            "<Tag><Key>{}</Key><Value>{}</Value></Tag>",
            escape(key),
            escape(value)
        ));
    }
    xml.push_str("</TagSet>");
}

/// Serializes a list of containers to XML.
pub fn serialize_container_list(
    containers: &[ContainerItem],
    prefix: Option<&str>,
    marker: Option<&str>,
    maxresults: u32,
    next_marker: Option<&str>,
    include_metadata: bool,
) -> String {
    let mut xml = String::from(DECLARATION);
    xml.push_str("<EnumerationResults>");

    if let Some(p) = prefix {
        xml.push_str(&format!("<Prefix>{}</Prefix>", escape(p)));
    }
    if let Some(m) = marker {
        xml.push_str(&format!("<Marker>{}</Marker>", escape(m)));
    }
    xml.push_str(&format!("<MaxResults>{}</MaxResults>", maxresults));

    xml.push_str("<Containers>");
    for container in containers {
        let props = &container.properties;
        xml.push_str("<Container>");
        xml.push_str(&format!("<Name>{}</Name>", escape(&container.name)));
        xml.push_str("<Properties>");
        xml.push_str(&format!(
            "<Last-Modified>{}</Last-Modified>",
            format_http_date(&props.last_modified)
        ));
        xml.push_str(&format!("<Etag>{}</Etag>", escape(&props.etag)));
        xml.push_str(&format!("<LeaseStatus>{}</LeaseStatus>", props.lease_status.as_str()));
        xml.push_str(&format!("<LeaseState>{}</LeaseState>", props.lease_state.as_str()));
        if let Some(duration) = props.lease_duration {
            xml.push_str(&format!("<LeaseDuration>{}</LeaseDuration>", duration.as_str()));
        }
        xml.push_str("</Properties>");
        if include_metadata {
            xml.push_str("<Metadata>");
            for (key, value) in props.metadata.iter() {
                xml.push_str(&format!("<{key}>{}</{key}>", escape(value)));
            }
            xml.push_str("</Metadata>");
        }
        xml.push_str("</Container>");
    }
    xml.push_str("</Containers>");

    if let Some(nm) = next_marker {
        xml.push_str(&format!("<NextMarker>{}</NextMarker>", escape(nm)));
    }

    xml.push_str("</EnumerationResults>");
    xml
}

/// Serializes one page of a blob listing. Entries are written in the order
/// given, blobs and prefixes interleaved.
pub fn serialize_blob_list(
    container: &str,
    entries: &[BlobListEntry],
    prefix: Option<&str>,
    delimiter: Option<&str>,
    marker: Option<&str>,
    maxresults: u32,
    next_marker: Option<&str>,
) -> String {
    let mut xml = String::from(DECLARATION);
    xml.push_str(&format!(
        r#"<EnumerationResults ContainerName="{}">"#,
        escape(container)
    ));

    if let Some(p) = prefix {
        xml.push_str(&format!("<Prefix>{}</Prefix>", escape(p)));
    }
    if let Some(m) = marker {
        xml.push_str(&format!("<Marker>{}</Marker>", escape(m)));
    }
    xml.push_str(&format!("<MaxResults>{}</MaxResults>", maxresults));
    if let Some(d) = delimiter {
        xml.push_str(&format!("<Delimiter>{}</Delimiter>", escape(d)));
    }

    xml.push_str("<Blobs>");
    for entry in entries {
        match entry {
            BlobListEntry::Blob(blob) => xml.push_str(&serialize_blob(blob)),
            BlobListEntry::Prefix(p) => xml.push_str(&format!(
                "<BlobPrefix><Name>{}</Name></BlobPrefix>",
                escape(&p.name)
            )),
        }
    }
    xml.push_str("</Blobs>");

    if let Some(nm) = next_marker {
        xml.push_str(&format!("<NextMarker>{}</NextMarker>", escape(nm)));
    }

    xml.push_str("</EnumerationResults>");
    xml
}

/// Serializes a single blob for list results.
fn serialize_blob(blob: &BlobItem) -> String {
    let props = &blob.properties;
    let mut xml = String::from("<Blob>");
    xml.push_str(&format!("<Name>{}</Name>", escape(&blob.name)));
    if blob.deleted {
        xml.push_str("<Deleted>true</Deleted>");
    }
    if let Some(ref v) = blob.version_id {
        xml.push_str(&format!("<VersionId>{}</VersionId>", escape(v)));
    }
    if let Some(current) = blob.is_current_version {
        xml.push_str(&format!("<IsCurrentVersion>{}</IsCurrentVersion>", current));
    }

    xml.push_str("<Properties>");
    if let Some(created) = props.created_on {
        xml.push_str(&format!(
            "<Creation-Time>{}</Creation-Time>",
            format_http_date(&created)
        ));
    }
    xml.push_str(&format!(
        "<Last-Modified>{}</Last-Modified>",
        format_http_date(&props.last_modified)
    ));
    xml.push_str(&format!("<Etag>{}</Etag>", escape(&props.etag)));
    xml.push_str(&format!("<Content-Length>{}</Content-Length>", props.content_length));

    let optional = [
        ("Content-Type", &props.content_type),
        ("Content-Encoding", &props.content_encoding),
        ("Content-Language", &props.content_language),
        ("Content-MD5", &props.content_md5),
        ("Content-Disposition", &props.content_disposition),
        ("Cache-Control", &props.cache_control),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            xml.push_str(&format!("<{name}>{}</{name}>", escape(value)));
        }
    }

    xml.push_str(&format!("<BlobType>{}</BlobType>", props.blob_type.as_str()));
    if let Some(tier) = props.access_tier {
        xml.push_str(&format!("<AccessTier>{}</AccessTier>", tier.as_str()));
    }
    xml.push_str(&format!("<LeaseStatus>{}</LeaseStatus>", props.lease_status.as_str()));
    xml.push_str(&format!("<LeaseState>{}</LeaseState>", props.lease_state.as_str()));
    if let Some(duration) = props.lease_duration {
        xml.push_str(&format!("<LeaseDuration>{}</LeaseDuration>", duration.as_str()));
    }
    if let Some(count) = props.tag_count {
        xml.push_str(&format!("<TagCount>{}</TagCount>", count));
    }
    xml.push_str("</Properties>");

    if !props.metadata.is_empty() {
        xml.push_str("<Metadata>");
        for (key, value) in props.metadata.iter() {
            xml.push_str(&format!("<{key}>{}</{key}>", escape(value)));
        }
        xml.push_str("</Metadata>");
    }

    if let Some(ref tags) = blob.tags {
        xml.push_str("<Tags>");
        push_tag_set(&mut xml, tags);
        xml.push_str("</Tags>");
    }

    xml.push_str("</Blob>");
    xml
}

/// Serializes a Get Block List response.
pub fn serialize_block_list(list: &BlockList) -> String {
    let mut xml = String::from(DECLARATION);
    xml.push_str("<BlockList>");

    xml.push_str("<CommittedBlocks>");
    for block in list.committed() {
        xml.push_str(&format!(
            "<Block><Name>{}</Name><Size>{}</Size></Block>",
            escape(block.id.as_str()),
            block.size
        ));
    }
    xml.push_str("</CommittedBlocks>");

    xml.push_str("<UncommittedBlocks>");
    for block in list.uncommitted() {
        xml.push_str(&format!(
            "<Block><Name>{}</Name><Size>{}</Size></Block>",
            escape(block.id.as_str()),
            block.size
        ));
    }
    xml.push_str("</UncommittedBlocks>");

    xml.push_str("</BlockList>");
    xml
}

/// Serializes a Find Blobs by Tags response.
pub fn serialize_filter_blobs(
    expression: &str,
    blobs: &[TaggedBlobItem],
    next_marker: Option<&str>,
) -> String {
    let mut xml = String::from(DECLARATION);
    xml.push_str("<EnumerationResults>");
    xml.push_str(&format!("<Where>{}</Where>", escape(expression)));
    xml.push_str("<Blobs>");
    for blob in blobs {
        xml.push_str("<Blob>");
        xml.push_str(&format!("<Name>{}</Name>", escape(&blob.name)));
        xml.push_str(&format!("<ContainerName>{}</ContainerName>", escape(&blob.container)));
        xml.push_str("<Tags>");
        push_tag_set(&mut xml, &blob.tags);
        xml.push_str("</Tags>");
        xml.push_str("</Blob>");
    }
    xml.push_str("</Blobs>");
    match next_marker {
        Some(nm) => xml.push_str(&format!("<NextMarker>{}</NextMarker>", escape(nm))),
        None => xml.push_str("<NextMarker />"),
    }
    xml.push_str("</EnumerationResults>");
    xml
}
