//! Graph configuration.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Behaviour switches of one [`Graph`](crate::Graph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Target database name. Passed through to the protocol collaborator.
    pub database: Option<String>,
    /// Create nodes of types with merge keys through `MERGE` on those keys.
    pub keyed_upsert: bool,
    /// Load `Eager` relationships when a matched node is resolved.
    pub eager_loading: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            database: None,
            keyed_upsert: true,
            eager_loading: true,
        }
    }
}

impl GraphConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = GraphConfig::from_json(r#"{"database": "movies"}"#).unwrap();
        assert_eq!(config.database.as_deref(), Some("movies"));
        assert!(config.keyed_upsert);
        assert!(config.eager_loading);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(GraphConfig::from_json("{"), Err(Error::Config(_))));
        assert!(matches!(
            GraphConfig::from_json(r#"{"keyed_upsert": "yes"}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let config = GraphConfig { database: Some("x".into()), keyed_upsert: false, eager_loading: true };
        assert_eq!(GraphConfig::from_json(&config.to_json().unwrap()).unwrap(), config);
    }
}
