//! Key/value dataset the guest reads through the lookup import.
//!
//! Values are kept as JSON text. Structure never crosses into guest memory;
//! the guest only ever sees the serialized form.

use crate::error::{BindingStage, BridgeError, BridgeResult};
use indexmap::IndexMap;
use serde_json::Value;

/// Text handed to the guest when a key is absent
pub const NULL_LITERAL: &str = "null";

/// String-keyed source of string values
pub trait Dataset: Send + Sync {
    /// Look up the serialized value for a key
    fn get(&self, key: &str) -> Option<&str>;

    /// Look up a key, substituting [`NULL_LITERAL`] when it is absent
    fn lookup_text(&self, key: &str) -> &str {
        self.get(key).unwrap_or(NULL_LITERAL)
    }
}

/// Dataset parsed from a JSON object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonDataset {
    entries: IndexMap<String, String>,
}

impl JsonDataset {
    /// Create an empty dataset
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a dataset from JSON bytes
    ///
    /// # Errors
    ///
    /// Returns a binding failure if the bytes are not a JSON object
    pub fn from_slice(bytes: &[u8]) -> BridgeResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| BridgeError::binding(BindingStage::ParseDataset, e.to_string()))?;
        Self::from_value(value)
    }

    /// Build a dataset from a parsed JSON value
    ///
    /// # Errors
    ///
    /// Returns a binding failure if the value is not an object
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        let Value::Object(map) = value else {
            return Err(BridgeError::binding(
                BindingStage::ParseDataset,
                "dataset must be a JSON object",
            ));
        };

        let mut dataset = Self::new();
        for (key, value) in map {
            dataset.insert(key, &value);
        }
        Ok(dataset)
    }

    /// Insert a value, storing its JSON text
    pub fn insert(&mut self, key: impl Into<String>, value: &Value) {
        self.entries.insert(key.into(), value.to_string());
    }

    /// Insert pre-serialized text as-is
    pub fn insert_text(&mut self, key: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(key.into(), text.into());
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the dataset is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl<K, V> FromIterator<(K, V)> for JsonDataset
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dataset = Self::new();
        for (key, text) in iter {
            dataset.insert_text(key, text);
        }
        dataset
    }
}

impl Dataset for JsonDataset {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_slice_serializes_values() {
        let dataset =
            JsonDataset::from_slice(br#"{"k1": "v1", "perm:1:2:edit": true, "n": 3}"#).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get("k1"), Some("\"v1\""));
        assert_eq!(dataset.get("perm:1:2:edit"), Some("true"));
        assert_eq!(dataset.get("n"), Some("3"));
    }

    #[test]
    fn test_lookup_text_missing_is_null() {
        let dataset = JsonDataset::from_value(json!({"k1": "v1"})).unwrap();
        assert_eq!(dataset.lookup_text("missing"), "null");
        assert_eq!(dataset.lookup_text("k1"), "\"v1\"");
    }

    #[test]
    fn test_nested_values_stay_text() {
        let dataset = JsonDataset::from_value(json!({"groups": {"admin": [1, 2]}})).unwrap();
        assert_eq!(dataset.get("groups"), Some(r#"{"admin":[1,2]}"#));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = JsonDataset::from_slice(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(
            err,
            BridgeError::BindingFailure {
                stage: BindingStage::ParseDataset,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(JsonDataset::from_slice(b"{not json").is_err());
    }

    #[test]
    fn test_from_iter_keeps_text_verbatim() {
        let dataset: JsonDataset = [("k1", "v1")].into_iter().collect();
        assert_eq!(dataset.get("k1"), Some("v1"));
        assert_eq!(dataset.lookup_text("missing"), NULL_LITERAL);
    }

    #[test]
    fn test_keys_keep_insertion_order() {
        let mut dataset = JsonDataset::new();
        dataset.insert("b", &json!(1));
        dataset.insert("a", &json!(2));
        assert_eq!(dataset.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
