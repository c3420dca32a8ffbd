//! Announce, discover, and registry maintenance.

use crate::error::{MeshError, MeshResult};
use crate::message::{topics, Message};
use crate::node::{MeshNode, NodeShared};
use crate::registry::Registration;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tessera_core::{CorrelationId, ServerDescriptor, ServerId, Timestamp};
use tessera_fabric::Topic;
use tracing::{debug, info};

/// Filters applied by peers answering a discovery request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    /// Only servers version-compatible with the requester
    pub compatible_only: bool,
    /// Only servers offering all of these
    pub required_features: Option<BTreeSet<String>>,
}

impl DiscoveryQuery {
    /// Compatible servers, any features
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Include servers with other protocol versions
    #[must_use]
    pub fn any_version(mut self) -> Self {
        self.compatible_only = false;
        self
    }

    /// Require a feature token
    #[must_use]
    pub fn require(mut self, feature: impl Into<String>) -> Self {
        self.required_features
            .get_or_insert_with(BTreeSet::new)
            .insert(feature.into());
        self
    }
}

impl Default for DiscoveryQuery {
    fn default() -> Self {
        Self {
            compatible_only: true,
            required_features: None,
        }
    }
}

/// What one discovery round found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Every server reported, merged, in first-reported order
    pub servers: Vec<ServerDescriptor>,
    /// How many of them were not known before
    pub new_servers: usize,
    /// Peers that answered
    pub responders: usize,
    /// Peers the request reached
    pub reached: usize,
}

impl DiscoveryResult {
    /// Ids of the servers found
    #[must_use]
    pub fn ids(&self) -> Vec<ServerId> {
        self.servers.iter().map(|d| d.id.clone()).collect()
    }
}

impl MeshNode {
    /// Publish this node's descriptor to every connected peer
    ///
    /// Returns whether any peer received it.
    pub async fn announce(&self) -> bool {
        self.shared.announce().await
    }

    /// Ask every connected peer for itself and the servers it knows
    ///
    /// Waits until every reached peer has answered or the discovery timeout
    /// elapses, registering each reported server along the way.
    pub async fn discover(&self, query: DiscoveryQuery) -> DiscoveryResult {
        let shared = &self.shared;
        shared.bump(|stats| stats.discovery_rounds += 1).await;

        let correlation_id = CorrelationId::new();
        let (_guard, mut replies) = shared.pending.expect_many(correlation_id);
        let request = Message::DiscoveryRequest {
            correlation_id,
            requester: shared.self_descriptor(Timestamp::now()),
            compatible_only: query.compatible_only,
            required_features: query.required_features,
        };
        let reached = shared
            .fabric
            .deliver(&shared.id, &Topic::new(topics::DISCOVERY_REQUEST), request)
            .await;

        let deadline = tokio::time::Instant::now() + shared.config.discovery_timeout();
        let mut merged: IndexMap<ServerId, ServerDescriptor> = IndexMap::new();
        let mut new_servers = 0;
        let mut responders = 0;

        while responders < reached {
            let reply = match tokio::time::timeout_at(deadline, replies.recv()).await {
                Ok(Some(reply)) => reply,
                Ok(None) | Err(_) => break,
            };
            let Message::DiscoveryResponse {
                responder,
                descriptors,
                ..
            } = reply
            else {
                continue;
            };
            responders += 1;

            let now = Timestamp::now();
            let mut registry = shared.registry.write().await;
            for mut descriptor in descriptors {
                if descriptor.id == shared.id {
                    continue;
                }
                if descriptor.id == responder {
                    descriptor.touch(now);
                }
                let id = descriptor.id.clone();
                if registry.register(descriptor, now) == Registration::Inserted {
                    new_servers += 1;
                    info!(server = %shared.id, discovered = %id, via = %responder, "new server discovered");
                }
                if let Some(current) = registry.get(&id) {
                    merged.insert(id, current.clone());
                }
            }
        }

        if responders < reached {
            debug!(
                server = %shared.id,
                reached,
                responders,
                "discovery finished before every peer answered"
            );
        }
        info!(
            server = %shared.id,
            found = merged.len(),
            new_servers,
            responders,
            "discovery round complete"
        );

        DiscoveryResult {
            servers: merged.into_values().collect(),
            new_servers,
            responders,
            reached,
        }
    }

    /// Insert or refresh a peer descriptor. Our own id is ignored.
    pub async fn register_server(&self, descriptor: ServerDescriptor) -> Registration {
        let id = descriptor.id.clone();
        let outcome = self
            .shared
            .registry
            .write()
            .await
            .register(descriptor, Timestamp::now());
        if outcome == Registration::Inserted {
            info!(server = %self.shared.id, registered = %id, "server registered");
        }
        outcome
    }

    /// Known peers that can serve this node, without touching the network
    ///
    /// With `required`, every peer offering all of those features; without
    /// it, every peer whose protocol version matches ours.
    pub async fn get_compatible_servers(
        &self,
        required: Option<&BTreeSet<String>>,
    ) -> Vec<ServerDescriptor> {
        self.shared
            .registry
            .read()
            .await
            .compatible(&self.shared.descriptor.feature_set, required)
    }

    /// All known peers in registration order
    pub async fn known_servers(&self) -> Vec<ServerDescriptor> {
        self.shared.registry.read().await.descriptors().cloned().collect()
    }

    /// One known peer
    pub async fn get_server(&self, id: &ServerId) -> Option<ServerDescriptor> {
        self.shared.registry.read().await.get(id).cloned()
    }

    /// Forget a peer and cut the fabric link to it in both directions
    ///
    /// # Errors
    ///
    /// Returns `InvalidSelfOperation` for our own id and `UnknownServer`
    /// if the peer is not known
    pub async fn remove_server(&self, id: &ServerId) -> MeshResult<ServerDescriptor> {
        let shared = &self.shared;
        if *id == shared.id {
            return Err(MeshError::InvalidSelfOperation(
                "cannot remove own descriptor".to_string(),
            ));
        }

        let removed = {
            let mut registry = shared.registry.write().await;
            let removed = registry
                .remove(id)
                .ok_or_else(|| MeshError::UnknownServer(id.clone()))?;
            registry.stats_mut().removals += 1;
            removed
        };
        shared.fabric.set_connected(&shared.id, id, false).await;

        info!(server = %shared.id, removed = %id, "server removed and link cut");
        Ok(removed)
    }

    /// Drop every peer silent for longer than `max_age`
    ///
    /// Leaves fabric links alone. Returns the removed ids.
    pub async fn clean_stale(&self, max_age: Duration) -> Vec<ServerId> {
        let now = Timestamp::now();
        let mut registry = self.shared.registry.write().await;
        let stale = registry.stale(now, max_age);
        for id in &stale {
            registry.remove(id);
        }
        registry.stats_mut().stale_removals += stale.len() as u64;
        drop(registry);

        if !stale.is_empty() {
            info!(
                server = %self.shared.id,
                removed = ?stale,
                max_age_secs = max_age.as_secs(),
                "stale servers cleaned"
            );
        }
        stale
    }

    /// `clean_stale` with the configured max age
    pub async fn clean_stale_default(&self) -> Vec<ServerId> {
        self.clean_stale(self.shared.config.stale_max_age()).await
    }

    /// Forget everything, zero the counters, and announce again
    ///
    /// Returns whether the announcement reached any peer.
    pub async fn reset(&self) -> bool {
        self.shared.registry.write().await.clear();
        info!(server = %self.shared.id, "registry reset");
        self.shared.announce().await
    }

    /// Override a peer's `last_seen`, e.g. to age it in tests
    ///
    /// # Errors
    ///
    /// Returns `UnknownServer` if the peer is not known
    pub async fn set_last_seen(&self, id: &ServerId, at: Timestamp) -> MeshResult<()> {
        if self.shared.registry.write().await.set_last_seen(id, at) {
            Ok(())
        } else {
            Err(MeshError::UnknownServer(id.clone()))
        }
    }
}

impl NodeShared {
    pub(crate) async fn announce(&self) -> bool {
        let descriptor = self.self_descriptor(Timestamp::now());
        let delivered = self
            .fabric
            .publish(&self.id, &Topic::new(topics::ANNOUNCE), Message::Announce { descriptor })
            .await;
        self.bump(|stats| stats.announcements_sent += 1).await;
        debug!(server = %self.id, delivered, "announced");
        delivered
    }

    pub(crate) async fn on_announce(&self, from: &ServerId, mut descriptor: ServerDescriptor) {
        if descriptor.id != *from {
            debug!(from = %from, claimed = %descriptor.id, "announcement for another server ignored");
            return;
        }
        let now = Timestamp::now();
        descriptor.touch(now);

        let mut registry = self.registry.write().await;
        registry.stats_mut().announcements_received += 1;
        if registry.register(descriptor, now) == Registration::Inserted {
            info!(server = %self.id, announced = %from, "new server from announcement");
        }
    }

    pub(crate) async fn answer_discovery(
        &self,
        from: &ServerId,
        correlation_id: CorrelationId,
        mut requester: ServerDescriptor,
        compatible_only: bool,
        required_features: Option<BTreeSet<String>>,
    ) {
        let now = Timestamp::now();
        requester.touch(now);

        let keep = |descriptor: &ServerDescriptor| {
            (!compatible_only || descriptor.feature_set.is_compatible_with(&requester.feature_set))
                && required_features
                    .as_ref()
                    .is_none_or(|required| descriptor.feature_set.can_handle(required))
        };

        let descriptors = {
            let mut registry = self.registry.write().await;
            let mut descriptors = Vec::with_capacity(registry.len() + 1);
            let own = self.self_descriptor(now);
            if keep(&own) {
                descriptors.push(own);
            }
            descriptors.extend(
                registry
                    .descriptors()
                    .filter(|d| d.id != *from && keep(d))
                    .cloned(),
            );
            if requester.id == *from
                && registry.register(requester.clone(), now) == Registration::Inserted
            {
                info!(server = %self.id, requester = %from, "new server from discovery request");
            }
            descriptors
        };

        debug!(server = %self.id, requester = %from, count = descriptors.len(), "answering discovery");
        let response = Message::DiscoveryResponse {
            correlation_id,
            responder: self.id.clone(),
            descriptors,
        };
        self.fabric
            .publish(&self.id, &topics::discovery_reply(from), response)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::error::ErrorKind;
    use crate::message::MeshFabric;
    use std::sync::Arc;

    fn id(name: &str) -> ServerId {
        ServerId::new(name).unwrap()
    }

    fn fast(name: &str) -> NodeConfig {
        NodeConfig::new(id(name))
            .with_discovery_timeout(200)
            .with_health_timeout(100)
            .with_task_timeout(200)
    }

    async fn mesh(configs: Vec<NodeConfig>) -> (Arc<MeshFabric>, Vec<MeshNode>) {
        let fabric = Arc::new(MeshFabric::new());
        let mut nodes = Vec::new();
        for config in configs {
            nodes.push(MeshNode::start(Arc::clone(&fabric), config).await.unwrap());
        }
        (fabric, nodes)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_announce_is_learned_passively() {
        let (_fabric, nodes) = mesh(vec![fast("n1"), fast("n2"), fast("n3")]).await;
        assert!(nodes[0].announce().await);
        settle().await;

        for node in &nodes[1..] {
            let known = node.get_server(&id("n1")).await.unwrap();
            assert!(known.is_healthy());
            assert_eq!(node.stats().await.announcements_received, 1);
        }
        assert!(nodes[0].known_servers().await.is_empty());
        assert_eq!(nodes[0].stats().await.announcements_sent, 1);
    }

    #[tokio::test]
    async fn test_discover_collects_all_peers() {
        let (_fabric, nodes) = mesh(vec![fast("n1"), fast("n2"), fast("n3"), fast("n4")]).await;

        let result = nodes[0].discover(DiscoveryQuery::new()).await;
        assert_eq!(result.reached, 3);
        assert_eq!(result.responders, 3);
        assert_eq!(result.new_servers, 3);
        let mut ids = result.ids();
        ids.sort();
        assert_eq!(ids, vec![id("n2"), id("n3"), id("n4")]);

        // Responders learned about the requester.
        assert!(nodes[2].get_server(&id("n1")).await.is_some());

        let again = nodes[0].discover(DiscoveryQuery::new()).await;
        assert_eq!(again.new_servers, 0);
        assert_eq!(again.servers.len(), 3);
        assert_eq!(nodes[0].stats().await.discovery_rounds, 2);
    }

    #[tokio::test]
    async fn test_discover_learns_second_hand() {
        let (fabric, nodes) = mesh(vec![fast("n1"), fast("n2"), fast("n3")]).await;
        fabric.set_connected(&id("n1"), &id("n3"), false).await;
        nodes[2].announce().await;
        settle().await;
        assert!(nodes[0].get_server(&id("n3")).await.is_none());

        let result = nodes[0].discover(DiscoveryQuery::new()).await;
        assert_eq!(result.reached, 1);
        assert_eq!(result.new_servers, 2);
        let mut ids = result.ids();
        ids.sort();
        assert_eq!(ids, vec![id("n2"), id("n3")]);
    }

    #[tokio::test]
    async fn test_discover_filters_by_version_and_features() {
        let (_fabric, nodes) = mesh(vec![
            fast("n1"),
            fast("n2").with_version("2.0.0"),
            fast("n3").with_feature("gpu"),
        ])
        .await;

        let compatible = nodes[0].discover(DiscoveryQuery::new()).await;
        assert_eq!(compatible.ids(), vec![id("n3")]);
        assert_eq!(compatible.responders, 2);

        let everyone = nodes[0].discover(DiscoveryQuery::new().any_version()).await;
        assert_eq!(everyone.servers.len(), 2);

        let gpu = nodes[0]
            .discover(DiscoveryQuery::new().any_version().require("gpu"))
            .await;
        assert_eq!(gpu.ids(), vec![id("n3")]);
    }

    #[tokio::test]
    async fn test_discover_alone_returns_immediately() {
        let (_fabric, nodes) = mesh(vec![fast("solo")]).await;
        let result = nodes[0].discover(DiscoveryQuery::new()).await;
        assert_eq!(result.reached, 0);
        assert!(result.servers.is_empty());
    }

    #[tokio::test]
    async fn test_discover_times_out_on_one_way_link() {
        let (fabric, nodes) = mesh(vec![fast("n1"), fast("n2")]).await;
        fabric.set_link(&id("n2"), &id("n1"), false).await.unwrap();

        let started = tokio::time::Instant::now();
        let result = nodes[0].discover(DiscoveryQuery::new()).await;
        assert_eq!(result.reached, 1);
        assert_eq!(result.responders, 0);
        assert!(started.elapsed() >= Duration::from_millis(200));
        // The request itself still taught n2 about n1.
        assert!(nodes[1].get_server(&id("n1")).await.is_some());
    }

    #[tokio::test]
    async fn test_register_server_self_and_update() {
        let (_fabric, nodes) = mesh(vec![fast("n1"), fast("n2")]).await;
        assert_eq!(
            nodes[0].register_server(nodes[0].descriptor()).await,
            Registration::IgnoredSelf
        );
        assert_eq!(
            nodes[0].register_server(nodes[1].descriptor()).await,
            Registration::Inserted
        );
        assert_eq!(
            nodes[0].register_server(nodes[1].descriptor()).await,
            Registration::Updated
        );
        assert_eq!(nodes[0].stats().await.new_discoveries, 1);
    }

    #[tokio::test]
    async fn test_remove_server_cuts_link() {
        let (fabric, nodes) = mesh(vec![fast("n1"), fast("n2")]).await;
        nodes[1].announce().await;
        settle().await;

        nodes[0].remove_server(&id("n2")).await.unwrap();
        assert!(nodes[0].get_server(&id("n2")).await.is_none());
        assert!(!fabric.are_connected(&id("n1"), &id("n2")).await);
        assert!(!fabric.are_connected(&id("n2"), &id("n1")).await);

        assert_eq!(
            nodes[0].remove_server(&id("n2")).await.unwrap_err().kind(),
            ErrorKind::UnknownServer
        );
        assert_eq!(
            nodes[0].remove_server(&id("n1")).await.unwrap_err().kind(),
            ErrorKind::InvalidSelfOperation
        );
    }

    #[tokio::test]
    async fn test_clean_stale_keeps_links() {
        let (fabric, nodes) = mesh(vec![fast("n1"), fast("n2"), fast("n3")]).await;
        nodes[1].announce().await;
        nodes[2].announce().await;
        settle().await;

        let old = Timestamp::now().saturating_sub(Duration::from_secs(3_600));
        nodes[0].set_last_seen(&id("n2"), old).await.unwrap();

        let removed = nodes[0].clean_stale(Duration::from_secs(1_800)).await;
        assert_eq!(removed, vec![id("n2")]);
        assert!(nodes[0].get_server(&id("n3")).await.is_some());
        assert!(fabric.are_connected(&id("n1"), &id("n2")).await);
        assert_eq!(nodes[0].stats().await.stale_removals, 1);

        assert!(nodes[0].clean_stale_default().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_last_seen_unknown() {
        let (_fabric, nodes) = mesh(vec![fast("n1")]).await;
        assert_eq!(
            nodes[0]
                .set_last_seen(&id("ghost"), Timestamp::now())
                .await
                .unwrap_err(),
            MeshError::UnknownServer(id("ghost"))
        );
    }

    #[tokio::test]
    async fn test_reset_clears_and_reannounces() {
        let (_fabric, nodes) = mesh(vec![fast("n1"), fast("n2")]).await;
        nodes[1].announce().await;
        settle().await;
        assert_eq!(nodes[0].known_servers().await.len(), 1);

        assert!(nodes[0].reset().await);
        assert!(nodes[0].known_servers().await.is_empty());
        let stats = nodes[0].stats().await;
        assert_eq!(stats.new_discoveries, 0);
        assert_eq!(stats.announcements_sent, 1);
    }

    #[tokio::test]
    async fn test_get_compatible_servers() {
        let (_fabric, nodes) = mesh(vec![
            fast("n1"),
            fast("n2").with_feature("ipfs"),
            fast("n3").with_version("0.9.0").with_feature("ipfs"),
        ])
        .await;
        nodes[1].announce().await;
        nodes[2].announce().await;
        settle().await;

        let fast_path: Vec<ServerId> = nodes[0]
            .get_compatible_servers(None)
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(fast_path, vec![id("n2")]);

        let required: BTreeSet<String> = ["ipfs".to_string()].into_iter().collect();
        let mut scanned: Vec<ServerId> = nodes[0]
            .get_compatible_servers(Some(&required))
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();
        scanned.sort();
        assert_eq!(scanned, vec![id("n2"), id("n3")]);
    }
}
