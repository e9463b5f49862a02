//! Ordered key/value property bags: user metadata and index tags.
//!
//! Both are replaced wholesale on the service. `merge` is a purely local
//! operation for read-modify-write callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::form_urlencoded;

use crate::error::{BlobError, BlobResult};

/// Most index tags a blob may carry.
pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_KEY_LEN: usize = 128;
pub const MAX_TAG_VALUE_LEN: usize = 256;

/// User-defined metadata. Keys are case-insensitive and stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMap(BTreeMap<String, String>);

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from pairs, validating every entry.
    pub fn try_from_pairs<I, K, V>(pairs: I) -> BlobResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut map = Self::new();
        for (key, value) in pairs {
            map.insert(key.as_ref(), value)?;
        }
        Ok(map)
    }

    /// Checks that `key` is a valid metadata name (a C# identifier).
    pub fn validate_key(key: &str) -> Result<(), String> {
        let mut chars = key.chars();
        match chars.next() {
            None => return Err("metadata key is empty".to_string()),
            Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
                return Err(format!("metadata key {key:?} must start with a letter or '_'"))
            }
            _ => {}
        }
        if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_')) {
            return Err(format!("metadata key {key:?} is not a valid identifier"));
        }
        Ok(())
    }

    fn validate_value(key: &str, value: &str) -> Result<(), String> {
        if value.chars().any(|c| !(c == ' ' || c == '\t' || c.is_ascii_graphic())) {
            return Err(format!("metadata value for {key:?} must be printable ASCII"));
        }
        Ok(())
    }

    /// Inserts an entry, returning the previous value for the key.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> BlobResult<Option<String>> {
        let value = value.into();
        Self::validate_key(key).map_err(BlobError::InvalidInput)?;
        Self::validate_value(key, &value).map_err(BlobError::InvalidInput)?;
        Ok(self.0.insert(key.to_ascii_lowercase(), value))
    }

    /// Inserts without validation, for values read back from the service.
    pub(crate) fn insert_unchecked(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    /// Overlays `other` onto this map; keys in `other` win.
    pub fn merge(&mut self, other: &MetadataMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<'a> IntoIterator for &'a MetadataMap {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Blob index tags. Keys are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagMap(BTreeMap<String, String>);

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from pairs, validating every entry and the tag count.
    pub fn try_from_pairs<I, K, V>(pairs: I) -> BlobResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = Self::new();
        for (key, value) in pairs {
            map.insert(key, value)?;
        }
        Ok(map)
    }

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, ' ' | '+' | '-' | '.' | '/' | ':' | '=' | '_')
    }

    /// Checks one tag against the service's length and character rules.
    pub fn validate_entry(key: &str, value: &str) -> Result<(), String> {
        if key.is_empty() || key.len() > MAX_TAG_KEY_LEN {
            return Err(format!("tag key {key:?} must be 1 to {MAX_TAG_KEY_LEN} characters"));
        }
        if value.len() > MAX_TAG_VALUE_LEN {
            return Err(format!("tag value for {key:?} exceeds {MAX_TAG_VALUE_LEN} characters"));
        }
        if !key.chars().all(Self::valid_char) {
            return Err(format!("tag key {key:?} contains an unsupported character"));
        }
        if !value.chars().all(Self::valid_char) {
            return Err(format!("tag value for {key:?} contains an unsupported character"));
        }
        Ok(())
    }

    /// Inserts a tag, returning the previous value for the key.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> BlobResult<Option<String>> {
        let key = key.into();
        let value = value.into();
        Self::validate_entry(&key, &value).map_err(BlobError::InvalidInput)?;
        if !self.0.contains_key(&key) && self.0.len() >= MAX_TAGS {
            return Err(BlobError::InvalidInput(format!(
                "a blob may carry at most {MAX_TAGS} tags"
            )));
        }
        Ok(self.0.insert(key, value))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Overlays `other` onto this map; keys in `other` win. On error the map
    /// is left untouched.
    pub fn merge(&mut self, other: &TagMap) -> BlobResult<()> {
        let mut merged = self.clone();
        for (key, value) in &other.0 {
            merged.insert(key.clone(), value.clone())?;
        }
        *self = merged;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders the `x-ms-tags` header form, `k1=v1&k2=v2` url-encoded.
    pub fn to_header_value(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.0.iter())
            .finish()
    }

    /// Parses the `x-ms-tags` header form.
    pub fn from_header_value(value: &str) -> Result<Self, String> {
        let mut map = BTreeMap::new();
        for (key, value) in form_urlencoded::parse(value.as_bytes()) {
            Self::validate_entry(&key, &value)?;
            map.insert(key.into_owned(), value.into_owned());
        }
        if map.len() > MAX_TAGS {
            return Err(format!("a blob may carry at most {MAX_TAGS} tags"));
        }
        Ok(Self(map))
    }

    /// Wraps entries read back from the service.
    pub(crate) fn from_map_unchecked(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<'a> IntoIterator for &'a TagMap {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A value read from the service together with the ETag it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub etag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_keys_are_case_insensitive() {
        let mut map = MetadataMap::new();
        map.insert("DocType", "text").unwrap();
        assert_eq!(map.get("doctype"), Some("text"));
        assert_eq!(map.insert("DOCTYPE", "image").unwrap(), Some("text".to_string()));
        assert_eq!(map.len(), 1);
        assert_eq!(map.iter().next(), Some(("doctype", "image")));
    }

    #[test]
    fn metadata_rejects_bad_keys() {
        let mut map = MetadataMap::new();
        assert!(map.insert("", "v").is_err());
        assert!(map.insert("1abc", "v").is_err());
        assert!(map.insert("has-dash", "v").is_err());
        assert!(map.insert("_ok1", "v").is_ok());
        assert!(map.insert("ok", "new\nline").is_err());
    }

    #[test]
    fn metadata_merge_overlays() {
        let mut base = MetadataMap::try_from_pairs([("a", "1"), ("b", "2")]).unwrap();
        let update = MetadataMap::try_from_pairs([("b", "3"), ("c", "4")]).unwrap();
        base.merge(&update);
        let pairs: Vec<_> = base.iter().collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "3"), ("c", "4")]);
    }

    #[test]
    fn tags_enforce_limits() {
        let mut tags = TagMap::new();
        for i in 0..MAX_TAGS {
            tags.insert(format!("k{i}"), "v").unwrap();
        }
        assert!(tags.insert("one-more", "v").is_err());
        // Overwriting an existing key is still allowed at the limit.
        assert!(tags.insert("k0", "v2").is_ok());

        assert!(TagMap::validate_entry("", "v").is_err());
        assert!(TagMap::validate_entry(&"k".repeat(129), "v").is_err());
        assert!(TagMap::validate_entry("k", &"v".repeat(257)).is_err());
        assert!(TagMap::validate_entry("k", "bad'quote").is_err());
        assert!(TagMap::validate_entry("Project/Name", "a+b=c:d_e.f g").is_ok());
    }

    #[test]
    fn failed_tag_merge_leaves_map_unchanged() {
        let mut base = TagMap::try_from_pairs((0..8).map(|i| (format!("k{i}"), "v"))).unwrap();
        let before = base.clone();
        let update =
            TagMap::try_from_pairs([("k0", "new"), ("x1", "v"), ("x2", "v"), ("x3", "v")])
                .unwrap();
        assert!(base.merge(&update).is_err());
        assert_eq!(base, before);

        let fits = TagMap::try_from_pairs([("k0", "new"), ("x1", "v")]).unwrap();
        base.merge(&fits).unwrap();
        assert_eq!(base.len(), 9);
        assert_eq!(base.get("k0"), Some("new"));
    }

    #[test]
    fn tags_are_case_sensitive() {
        let tags = TagMap::try_from_pairs([("Content", "image"), ("content", "text")]).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("Content"), Some("image"));
    }

    #[test]
    fn tags_header_form() {
        let tags = TagMap::try_from_pairs([("Content", "image"), ("Date", "2022-01-01")]).unwrap();
        let header = tags.to_header_value();
        assert_eq!(header, "Content=image&Date=2022-01-01");
        assert_eq!(TagMap::from_header_value(&header).unwrap(), tags);

        let spaced = TagMap::try_from_pairs([("a b", "c+d")]).unwrap();
        assert_eq!(TagMap::from_header_value(&spaced.to_header_value()).unwrap(), spaced);
    }
}
