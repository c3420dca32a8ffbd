//! Server descriptors: the identity record a node announces about itself.

use crate::error::CoreResult;
use crate::feature::{FeatureSet, Fingerprint, ServerRole};
use crate::id::ServerId;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Metrics a server reports about itself when probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Seconds since the node started
    pub uptime_secs: u64,
    /// Peers in the node's registry
    pub known_servers: u64,
    /// Registered task handlers
    pub handlers: u64,
    /// Requests awaiting a reply
    pub pending_requests: u64,
}

/// Last known health of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the server was considered healthy
    pub healthy: bool,
    /// When this status was determined
    pub last_checked: Timestamp,
    /// Reported metrics, present only for direct checks
    pub detail: Option<HealthMetrics>,
}

impl HealthStatus {
    /// Healthy as of `at`
    #[must_use]
    pub fn healthy(at: Timestamp) -> Self {
        Self {
            healthy: true,
            last_checked: at,
            detail: None,
        }
    }

    /// Unhealthy as of `at`
    #[must_use]
    pub fn unhealthy(at: Timestamp) -> Self {
        Self {
            healthy: false,
            last_checked: at,
            detail: None,
        }
    }

    /// Attach reported metrics
    #[must_use]
    pub fn with_detail(mut self, detail: HealthMetrics) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Full identity record of one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Server id, immutable for the node's lifetime
    pub id: ServerId,
    /// Advertised capabilities, including role and version
    pub feature_set: FeatureSet,
    /// Addressable locations
    pub endpoints: Vec<String>,
    /// Capacity metadata, e.g. `cpu_cores` or `memory_mb`
    pub resources: BTreeMap<String, u64>,
    /// Free-form key/value metadata
    pub metadata: BTreeMap<String, String>,
    /// When this record was first created
    pub first_seen: Timestamp,
    /// When the server was last heard from
    pub last_seen: Timestamp,
    /// Last known health
    pub health: HealthStatus,
}

impl ServerDescriptor {
    /// Create a descriptor seen for the first time at `now`
    #[must_use]
    pub fn new(id: ServerId, feature_set: FeatureSet, now: Timestamp) -> Self {
        Self {
            id,
            feature_set,
            endpoints: Vec::new(),
            resources: BTreeMap::new(),
            metadata: BTreeMap::new(),
            first_seen: now,
            last_seen: now,
            health: HealthStatus::healthy(now),
        }
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

    /// Server role
    #[must_use]
    pub fn role(&self) -> ServerRole {
        self.feature_set.role()
    }

    /// Fingerprint of the feature set
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.feature_set.fingerprint()
    }

    /// Check if the server was last known healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health.healthy
    }

    /// Time since the server was last heard from
    #[must_use]
    pub fn age(&self, now: Timestamp) -> Duration {
        now.duration_since(&self.last_seen)
    }

    /// Check if the server has been silent for longer than `max_age`
    #[must_use]
    pub fn is_stale(&self, now: Timestamp, max_age: Duration) -> bool {
        self.last_seen < now.saturating_sub(max_age)
    }

    /// Record contact at `now`
    pub fn touch(&mut self, now: Timestamp) {
        self.last_seen = now;
    }

    /// Copy the fields a later announcement may change, keeping `first_seen`
    pub fn refresh_from(&mut self, newer: &ServerDescriptor) {
        self.feature_set = newer.feature_set.clone();
        self.endpoints = newer.endpoints.clone();
        self.resources = newer.resources.clone();
        self.metadata = newer.metadata.clone();
        self.last_seen = self.last_seen.max(newer.last_seen);
        self.health = newer.health;
    }

    /// Encode with the compact binary codec
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// Decode from the compact binary codec
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid descriptor
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is not a valid descriptor
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerDescriptor {
        let id = ServerId::new("n1").unwrap();
        let features = FeatureSet::new(ServerRole::Worker, "1.0", ["ipfs", "search"]);
        ServerDescriptor::new(id, features, Timestamp::new(1_000, 42))
            .with_endpoint("tcp://10.0.0.1:4001")
            .with_metadata("zone", "eu-west")
            .with_resource("cpu_cores", 8)
    }

    #[test]
    fn test_new_descriptor_is_healthy() {
        let d = sample();
        assert!(d.is_healthy());
        assert_eq!(d.first_seen, d.last_seen);
        assert_eq!(d.role(), ServerRole::Worker);
    }

    #[test]
    fn test_binary_codec_preserves_every_field() {
        let mut d = sample();
        d.health = HealthStatus::healthy(Timestamp::from_secs(1_500)).with_detail(HealthMetrics {
            uptime_secs: 5,
            known_servers: 3,
            handlers: 1,
            pending_requests: 0,
        });
        let decoded = ServerDescriptor::from_bytes(&d.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, d);
        assert_eq!(decoded.fingerprint(), d.fingerprint());
    }

    #[test]
    fn test_json_codec_preserves_every_field() {
        let d = sample();
        let decoded = ServerDescriptor::from_json(&d.to_json().unwrap()).unwrap();
        assert_eq!(decoded, d);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(ServerDescriptor::from_bytes(&[0xff, 0x01]).is_err());
    }

    #[test]
    fn test_staleness() {
        let d = sample();
        let now = d.last_seen.saturating_add(Duration::from_secs(3_600));
        assert_eq!(d.age(now), Duration::from_secs(3_600));
        assert!(d.is_stale(now, Duration::from_secs(1_800)));
        assert!(!d.is_stale(now, Duration::from_secs(7_200)));
    }

    #[test]
    fn test_refresh_keeps_first_seen() {
        let mut d = sample();
        let mut newer = sample().with_endpoint("tcp://10.0.0.2:4001");
        newer.first_seen = Timestamp::from_secs(9_000);
        newer.last_seen = Timestamp::from_secs(9_000);

        d.refresh_from(&newer);
        assert_eq!(d.first_seen, Timestamp::new(1_000, 42));
        assert_eq!(d.last_seen, Timestamp::from_secs(9_000));
        assert_eq!(d.endpoints.len(), 2);
    }

    #[test]
    fn test_refresh_never_moves_last_seen_back() {
        let mut d = sample();
        d.last_seen = Timestamp::from_secs(5_000);
        let older = sample();
        d.refresh_from(&older);
        assert_eq!(d.last_seen, Timestamp::from_secs(5_000));
    }
}
