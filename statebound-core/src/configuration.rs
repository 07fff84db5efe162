//! Active-state configurations and their durable encoding.
//!
//! A configuration is encoded as a JSON array of state names in sorted
//! order, e.g. `["approved","confirmed"]`. The encoding only depends on the
//! set of states, never on the order they were entered in.

use crate::definition::Definition;
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The set of currently active states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeSet<String>);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, state: &str) -> bool {
        self.0.contains(state)
    }

    pub fn insert(&mut self, state: impl Into<String>) -> bool {
        self.0.insert(state.into())
    }

    pub fn remove(&mut self, state: &str) -> bool {
        self.0.remove(state)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates active states in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Configuration {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, state) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", state)?;
        }
        write!(f, "}}")
    }
}

/// Encodes configurations to the durable text field and back.
pub struct ConfigurationCodec;

impl ConfigurationCodec {
    /// Encodes a configuration. Deterministic for a given set of states.
    pub fn encode(configuration: &Configuration) -> String {
        // A set of strings always serializes.
        serde_json::to_string(configuration).unwrap_or_else(|_| "[]".to_string())
    }

    /// Decodes a configuration and checks every state exists in `definition`.
    pub fn decode(
        text: &str,
        definition: &Definition,
    ) -> Result<Configuration, ConfigurationError> {
        let configuration: Configuration = serde_json::from_str(text)?;
        definition.check_known(&configuration)?;
        Ok(configuration)
    }

    /// Returns true if the durable field means "never started".
    pub fn is_unset(text: Option<&str>) -> bool {
        text.map(|t| t.trim().is_empty()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::tests::PURCHASE;
    use proptest::prelude::*;

    fn purchase() -> Definition {
        Definition::from_yaml(PURCHASE).unwrap()
    }

    #[test]
    fn test_encoding_is_sorted() {
        let a = Configuration::from_iter(["to_approve", "confirmed"]);
        let b = Configuration::from_iter(["confirmed", "to_approve"]);
        assert_eq!(ConfigurationCodec::encode(&a), r#"["confirmed","to_approve"]"#);
        assert_eq!(ConfigurationCodec::encode(&a), ConfigurationCodec::encode(&b));
    }

    #[test]
    fn test_decode_roundtrip() {
        let def = purchase();
        let config = Configuration::from_iter(["confirmed", "approved"]);
        let text = ConfigurationCodec::encode(&config);
        assert_eq!(ConfigurationCodec::decode(&text, &def).unwrap(), config);
    }

    #[test]
    fn test_decode_accepts_any_order_and_duplicates() {
        let def = purchase();
        let decoded =
            ConfigurationCodec::decode(r#"["to_approve", "confirmed", "confirmed"]"#, &def).unwrap();
        assert_eq!(decoded, Configuration::from_iter(["confirmed", "to_approve"]));
    }

    #[test]
    fn test_decode_unknown_state() {
        let def = purchase();
        let result = ConfigurationCodec::decode(r#"["S9"]"#, &def);
        assert!(matches!(
            result,
            Err(ConfigurationError::UnknownState { ref state }) if state == "S9"
        ));
    }

    #[test]
    fn test_decode_malformed() {
        let def = purchase();
        for text in ["not json", r#"{"draft": true}"#, "[1, 2]", "\"draft\""] {
            assert!(matches!(
                ConfigurationCodec::decode(text, &def),
                Err(ConfigurationError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_is_unset() {
        assert!(ConfigurationCodec::is_unset(None));
        assert!(ConfigurationCodec::is_unset(Some("")));
        assert!(ConfigurationCodec::is_unset(Some("  ")));
        assert!(!ConfigurationCodec::is_unset(Some("[]")));
    }

    #[test]
    fn test_display() {
        let config = Configuration::from_iter(["b", "a"]);
        assert_eq!(config.to_string(), "{a, b}");
    }

    proptest! {
        #[test]
        fn prop_roundtrip(subset in proptest::collection::btree_set(0usize..5, 0..5)) {
            let def = purchase();
            let names = def.state_names();
            let config: Configuration = subset.iter().map(|i| names[*i]).collect();
            let text = ConfigurationCodec::encode(&config);
            prop_assert_eq!(ConfigurationCodec::decode(&text, &def).unwrap(), config);
        }

        #[test]
        fn prop_encoding_ignores_insertion_order(mut states in proptest::collection::vec("[a-z]{1,6}", 0..8)) {
            let forward: Configuration = states.iter().cloned().collect();
            states.reverse();
            let backward: Configuration = states.into_iter().collect();
            prop_assert_eq!(
                ConfigurationCodec::encode(&forward),
                ConfigurationCodec::encode(&backward)
            );
        }
    }
}
