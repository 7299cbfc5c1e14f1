//! Ordered string property bag.

use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Serialize};

/// Well-known property keys.
pub mod keys {
    pub const NODE_NAME: &str = "node.name";
    pub const NODE_ID: &str = "node.id";
    pub const OBJECT_PATH: &str = "object.path";
    pub const MEDIA_CLASS: &str = "media.class";
    pub const FACTORY_NAME: &str = "factory.name";
    pub const AUDIO_CHANNEL: &str = "audio.channel";
    pub const PORT_CONTROL: &str = "port.control";
    pub const PORT_MONITOR: &str = "port.monitor";

    pub const LINK_OUTPUT_NODE: &str = "link.output.node";
    pub const LINK_OUTPUT_PORT: &str = "link.output.port";
    pub const LINK_INPUT_NODE: &str = "link.input.node";
    pub const LINK_INPUT_PORT: &str = "link.input.port";
    pub const LINK_PASSIVE: &str = "link.passive";

    pub const ENDPOINT_NAME: &str = "endpoint.name";

    pub const ITEM_FACTORY_NAME: &str = "item.factory.name";
    pub const ITEM_NODE_TYPE: &str = "item.node.type";
    pub const ITEM_EXCLUSIVE: &str = "item.exclusive";
    pub const ITEM_FEATURES_NO_DSP: &str = "item.features.no-dsp";
    pub const STREAM_DONT_REMIX: &str = "stream.dont-remix";
}

/// Parse a boolean the way graph properties encode them.
///
/// `"true"` and any positive integer are true; everything else is false.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    value == "true" || value.trim().parse::<i64>().is_ok_and(|v| v > 0)
}

/// Ordered string-to-string map holding configuration and derived values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    /// Create an empty property bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style `set`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Boolean value of a key; missing keys are false.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).is_some_and(parse_bool)
    }

    /// Parse a value, if present.
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<Result<T, T::Err>> {
        self.get(key).map(str::parse)
    }

    /// Copy every entry of `other` into `self`.
    pub fn update(&mut self, other: &Self) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Properties {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool("7"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("yes"));
    }

    #[test]
    fn test_ordered_iteration() {
        let props: Properties = [("b", "2"), ("a", "1"), ("c", "3")].into_iter().collect();
        let keys: Vec<&str> = props.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn test_serialization_is_flat_map() {
        let props = Properties::new().with("node.name", "sink");
        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(json, r#"{"node.name":"sink"}"#);
        let parsed: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, props);
    }
}
