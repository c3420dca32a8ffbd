//! Node configuration.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tessera_core::{FeatureSet, ServerId, ServerRole};

/// Configuration of one mesh node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Server id; a random one is generated when absent
    pub id: Option<ServerId>,
    /// Advertised role
    pub role: ServerRole,
    /// Protocol version, compared for compatibility
    pub version: String,
    /// Capability tokens
    pub features: BTreeSet<String>,
    /// Addressable locations
    pub endpoints: Vec<String>,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
    /// Capacity metadata
    pub resources: BTreeMap<String, u64>,
    /// Discovery wait in milliseconds
    pub discovery_timeout_ms: u64,
    /// Remote task wait in milliseconds
    pub task_timeout_ms: u64,
    /// Health probe wait in milliseconds
    pub health_timeout_ms: u64,
    /// Silence after which an unprobed server is inferred unhealthy, in seconds
    pub health_threshold_secs: u64,
    /// Silence after which `clean_stale` drops a server, in seconds
    pub stale_max_age_secs: u64,
}

impl NodeConfig {
    /// Create a config for a named node with default settings
    #[must_use]
    pub fn new(id: ServerId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the config is invalid
    pub fn from_json(json: &str) -> MeshResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MeshError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or holds an invalid config
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Check timeouts, version and feature tokens
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Config` naming the first bad field
    pub fn validate(&self) -> MeshResult<()> {
        let timeouts = [
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("task_timeout_ms", self.task_timeout_ms),
            ("health_timeout_ms", self.health_timeout_ms),
            ("health_threshold_secs", self.health_threshold_secs),
            ("stale_max_age_secs", self.stale_max_age_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(MeshError::Config(format!("{field} must be positive")));
            }
        }
        self.feature_set().validate()?;
        Ok(())
    }

    /// Set the server id
    #[must_use]
    pub fn with_id(mut self, id: ServerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the role
    #[must_use]
    pub fn with_role(mut self, role: ServerRole) -> Self {
        self.role = role;
        self
    }

    /// Set the protocol version
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a capability token
    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    /// Add an endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Add a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a resource entry
    #[must_use]
    pub fn with_resource(mut self, key: impl Into<String>, amount: u64) -> Self {
        self.resources.insert(key.into(), amount);
        self
    }

    /// Set discovery timeout
    #[must_use]
    pub fn with_discovery_timeout(mut self, timeout_ms: u64) -> Self {
        self.discovery_timeout_ms = timeout_ms;
        self
    }

    /// Set task timeout
    #[must_use]
    pub fn with_task_timeout(mut self, timeout_ms: u64) -> Self {
        self.task_timeout_ms = timeout_ms;
        self
    }

    /// Set health probe timeout
    #[must_use]
    pub fn with_health_timeout(mut self, timeout_ms: u64) -> Self {
        self.health_timeout_ms = timeout_ms;
        self
    }

    /// Set the inferred health threshold
    #[must_use]
    pub fn with_health_threshold(mut self, secs: u64) -> Self {
        self.health_threshold_secs = secs;
        self
    }

    /// Set the stale max age
    #[must_use]
    pub fn with_stale_max_age(mut self, secs: u64) -> Self {
        self.stale_max_age_secs = secs;
        self
    }

    /// Feature set described by this config
    #[must_use]
    pub fn feature_set(&self) -> FeatureSet {
        FeatureSet::new(self.role, self.version.clone(), self.features.iter().cloned())
    }

    /// Discovery wait
    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Remote task wait
    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Health probe wait
    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Inferred health threshold
    #[must_use]
    pub fn health_threshold(&self) -> Duration {
        Duration::from_secs(self.health_threshold_secs)
    }

    /// Stale max age
    #[must_use]
    pub fn stale_max_age(&self) -> Duration {
        Duration::from_secs(self.stale_max_age_secs)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            role: ServerRole::Hybrid,
            version: "1.0.0".to_string(),
            features: BTreeSet::new(),
            endpoints: Vec::new(),
            metadata: BTreeMap::new(),
            resources: BTreeMap::new(),
            discovery_timeout_ms: 2000,
            task_timeout_ms: 2000,
            health_timeout_ms: 1000,
            health_threshold_secs: 300,
            stale_max_age_secs: 1800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.discovery_timeout(), Duration::from_secs(2));
        assert_eq!(config.health_timeout(), Duration::from_secs(1));
        assert_eq!(config.health_threshold(), Duration::from_secs(300));
        assert_eq!(config.stale_max_age(), Duration::from_secs(1800));
        assert_eq!(config.role, ServerRole::Hybrid);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = NodeConfig::new(ServerId::new("n1").unwrap())
            .with_role(ServerRole::Worker)
            .with_feature("ipfs")
            .with_feature("search")
            .with_task_timeout(150);
        let features = config.feature_set();
        assert!(features.has("ipfs"));
        assert_eq!(features.role(), ServerRole::Worker);
        assert_eq!(config.task_timeout(), Duration::from_millis(150));
    }

    #[test]
    fn test_from_json_partial() {
        let config = NodeConfig::from_json(
            r#"{"id": "edge-1", "role": "edge", "features": ["cache"], "health_timeout_ms": 20}"#,
        )
        .unwrap();
        assert_eq!(config.id, Some(ServerId::new("edge-1").unwrap()));
        assert_eq!(config.role, ServerRole::Edge);
        assert_eq!(config.health_timeout_ms, 20);
        assert_eq!(config.task_timeout_ms, 2000);
    }

    #[test]
    fn test_rejects_empty_id() {
        let err = NodeConfig::from_json(r#"{"id": ""}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = NodeConfig::default().with_task_timeout(0).validate().unwrap_err();
        assert!(err.to_string().contains("task_timeout_ms"));
    }

    #[test]
    fn test_rejects_bad_feature() {
        let config = NodeConfig::default().with_feature("two words");
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = NodeConfig::load("/nonexistent/tessera.json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
