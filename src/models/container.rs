//! Container data models.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use super::blob::{LeaseDuration, LeaseState, LeaseStatus};
use super::kv::MetadataMap;
use crate::context::parse_http_date;

/// Container properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerProperties {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub lease_state: LeaseState,
    pub lease_status: LeaseStatus,
    pub lease_duration: Option<LeaseDuration>,
    pub metadata: MetadataMap,
}

impl ContainerProperties {
    /// Parses a Get Container Properties response.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, String> {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let mut metadata = MetadataMap::new();
        for (name, value) in headers {
            if let Some(key) = name.as_str().strip_prefix("x-ms-meta-") {
                if let Ok(value) = value.to_str() {
                    metadata.insert_unchecked(key, value);
                }
            }
        }

        Ok(Self {
            etag: get("etag")
                .map(String::from)
                .ok_or_else(|| "response has no ETag".to_string())?,
            last_modified: get("last-modified")
                .and_then(parse_http_date)
                .ok_or_else(|| "response has no valid Last-Modified".to_string())?,
            lease_state: get("x-ms-lease-state")
                .and_then(LeaseState::from_str)
                .unwrap_or_default(),
            lease_status: get("x-ms-lease-status")
                .and_then(LeaseStatus::from_str)
                .unwrap_or_default(),
            lease_duration: get("x-ms-lease-duration").and_then(LeaseDuration::from_str),
            metadata,
        })
    }
}

/// One container as it appears in a service listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerItem {
    pub name: String,
    pub properties: ContainerProperties,
}

/// Checks the service's container naming rules.
pub fn validate_container_name(name: &str) -> Result<(), String> {
    if name == "$root" || name == "$logs" || name == "$web" {
        return Ok(());
    }
    if name.len() < 3 || name.len() > 63 {
        return Err("container name must be between 3 and 63 characters".to_string());
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err("container name must start with a letter or number".to_string());
    }
    if name.chars().any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')) {
        return Err(
            "container name can only contain lowercase letters, numbers, and hyphens".to_string(),
        );
    }
    if name.contains("--") || name.ends_with('-') {
        return Err("container name cannot have consecutive or trailing hyphens".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names() {
        assert!(validate_container_name("sample-container").is_ok());
        assert!(validate_container_name("$root").is_ok());
        assert!(validate_container_name("ab").is_err());
        assert!(validate_container_name("Upper").is_err());
        assert!(validate_container_name("-lead").is_err());
        assert!(validate_container_name("double--dash").is_err());
        assert!(validate_container_name("trail-").is_err());
    }
}
