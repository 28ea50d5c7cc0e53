//! Metadata: an ordered multimap of header entries.
//!
//! Keys are ASCII strings; values are text (UTF-8) or binary (opaque bytes,
//! signaled by a trailing `-bin` in the key). Keys compare case-insensitively
//! but are preserved as written on emit. Metadata is used in two positions:
//! *initial* (sent before the first message) and *trailing* (delivered with
//! final status).

use crate::error::WeftError;
use bytes::Bytes;

/// A single metadata value, text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Text(String),
    Binary(Bytes),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

/// True if `key` names a binary-valued entry.
pub fn is_binary_key(key: &str) -> bool {
    key.to_ascii_lowercase().ends_with("-bin")
}

/// Ordered multimap of `(key, value)` metadata entries.
///
/// Cloning produces a fully independent copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a value under `key`, keeping any existing values.
    ///
    /// The key must be non-empty ASCII. A `-bin` key takes binary values
    /// only; any other key takes text values only.
    pub fn add(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), WeftError> {
        let key = key.into();
        let value = value.into();
        validate_entry(&key, &value)?;
        self.entries.push((key, value));
        Ok(())
    }

    /// Replace all values under `key` with a single value.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), WeftError> {
        let key = key.into();
        let value = value.into();
        validate_entry(&key, &value)?;
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(&key));
        self.entries.push((key, value));
        Ok(())
    }

    /// All values under `key`, in insertion order. Empty if absent.
    pub fn get(&self, key: &str) -> Vec<&MetadataValue> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
            .collect()
    }

    /// The first value under `key`, if any.
    pub fn first(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Remove all values under `key`.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// Append every entry of `other`, preserving its order.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_entry(key: &str, value: &MetadataValue) -> Result<(), WeftError> {
    if key.is_empty() {
        return Err(WeftError::invalid_argument("metadata key must not be empty"));
    }
    if !key.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(WeftError::invalid_argument(format!(
            "metadata key {:?} contains non-ASCII or whitespace bytes",
            key
        )));
    }
    match (is_binary_key(key), value.is_binary()) {
        (true, false) => Err(WeftError::invalid_argument(format!(
            "metadata key {:?} requires a binary value",
            key
        ))),
        (false, true) => Err(WeftError::invalid_argument(format!(
            "metadata key {:?} requires a text value",
            key
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get_ordered() {
        let mut md = Metadata::new();
        md.add("x-tag", "one").unwrap();
        md.add("x-other", "zzz").unwrap();
        md.add("x-tag", "two").unwrap();

        let values: Vec<_> = md.get("x-tag").iter().map(|v| v.as_text().unwrap()).collect();
        assert_eq!(values, vec!["one", "two"]);
        assert!(md.get("missing").is_empty());
    }

    #[test]
    fn test_set_replaces_all() {
        let mut md = Metadata::new();
        md.add("x-tag", "one").unwrap();
        md.add("x-tag", "two").unwrap();
        md.set("x-tag", "only").unwrap();

        assert_eq!(md.get("x-tag").len(), 1);
        assert_eq!(md.first("x-tag").unwrap().as_text(), Some("only"));
    }

    #[test]
    fn test_case_insensitive_keys_preserved_on_emit() {
        let mut md = Metadata::new();
        md.add("X-Mixed-Case", "v").unwrap();

        assert_eq!(md.get("x-mixed-case").len(), 1);
        let (key, _) = md.iter().next().unwrap();
        assert_eq!(key, "X-Mixed-Case");
    }

    #[test]
    fn test_binary_key_typing() {
        let mut md = Metadata::new();
        md.add("x-blob-bin", vec![0xab, 0xcd]).unwrap();
        assert_eq!(md.first("x-blob-bin").unwrap().as_bytes(), &[0xab, 0xcd]);

        assert!(md.add("x-blob-bin", "not binary").is_err());
        assert!(md.add("x-text", vec![1, 2, 3]).is_err());
        assert!(md.add("", "v").is_err());
        assert!(md.add("bad key", "v").is_err());
    }

    #[test]
    fn test_clone_independence() {
        let mut original = Metadata::new();
        original.add("x-tag", "one").unwrap();

        let mut copy = original.clone();
        copy.add("x-tag", "two").unwrap();
        copy.set("x-new", "n").unwrap();
        original.remove("x-tag");

        assert_eq!(copy.get("x-tag").len(), 2);
        assert!(original.get("x-tag").is_empty());
        assert!(original.get("x-new").is_empty());
    }

    #[test]
    fn test_merge_preserves_order() {
        let mut a = Metadata::new();
        a.add("x-a", "1").unwrap();
        let mut b = Metadata::new();
        b.add("x-a", "2").unwrap();
        b.add("x-b", "3").unwrap();

        a.merge(b);
        let values: Vec<_> = a.get("x-a").iter().map(|v| v.as_text().unwrap()).collect();
        assert_eq!(values, vec!["1", "2"]);
        assert_eq!(a.len(), 3);
    }
}
