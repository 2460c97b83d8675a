//! Label sets attached to log entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label identifying the file an entry was read from.
pub const FILENAME_LABEL: &str = "__filename__";

/// An ordered set of label name/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Create an empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a label, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style variant of [`LabelSet::insert`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Get a label value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Merge `other` into a copy of this set. Values in `other` win.
    #[must_use]
    pub fn merge(&self, other: &LabelSet) -> LabelSet {
        let mut merged = self.0.clone();
        merged.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        LabelSet(merged)
    }

    /// Number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set has no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over label pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_other() {
        let base = LabelSet::new().with("job", "varlogs").with("host", "a");
        let extra = LabelSet::new().with("host", "b");

        let merged = base.merge(&extra);
        assert_eq!(merged.get("job"), Some("varlogs"));
        assert_eq!(merged.get("host"), Some("b"));
        assert_eq!(merged.len(), 2);
        // Inputs are untouched.
        assert_eq!(base.get("host"), Some("a"));
    }

    #[test]
    fn test_merge_with_empty() {
        let base = LabelSet::new().with(FILENAME_LABEL, "/var/log/app.log");
        let merged = base.merge(&LabelSet::new());
        assert_eq!(merged, base);
    }

    #[test]
    fn test_serializes_as_flat_map() {
        let labels: LabelSet = [("a", "1"), ("b", "2")].into_iter().collect();
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"{"a":"1","b":"2"}"#);
    }
}
