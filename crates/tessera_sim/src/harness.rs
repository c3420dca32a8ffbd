//! Many mesh nodes on one fabric.

use crate::error::{SimError, SimResult};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::ServerId;
use tessera_mesh::{
    DiscoveryQuery, DiscoveryResult, ErrorKind, MeshError, MeshFabric, MeshNode, NodeConfig,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default pause that lets intake loops drain after a broadcast
pub const DEFAULT_SETTLE_MS: u64 = 25;

/// Simulation harness: one fabric shared by every spawned node
pub struct MeshHarness {
    fabric: Arc<MeshFabric>,
    nodes: RwLock<BTreeMap<ServerId, Arc<MeshNode>>>,
    settle: Duration,
}

impl MeshHarness {
    /// Harness with a fresh fabric
    #[must_use]
    pub fn new() -> Self {
        Self::with_fabric(Arc::new(MeshFabric::new()))
    }

    /// Harness around an existing fabric
    #[must_use]
    pub fn with_fabric(fabric: Arc<MeshFabric>) -> Self {
        Self {
            fabric,
            nodes: RwLock::new(BTreeMap::new()),
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
        }
    }

    /// Set the settle pause
    #[must_use]
    pub fn with_settle(mut self, settle_ms: u64) -> Self {
        self.settle = Duration::from_millis(settle_ms);
        self
    }

    /// The shared fabric
    #[must_use]
    pub fn fabric(&self) -> &Arc<MeshFabric> {
        &self.fabric
    }

    /// Start a node
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot join the fabric
    pub async fn spawn(&self, config: NodeConfig) -> SimResult<Arc<MeshNode>> {
        let node = Arc::new(MeshNode::start(Arc::clone(&self.fabric), config).await?);
        self.nodes
            .write()
            .await
            .insert(node.id().clone(), Arc::clone(&node));
        Ok(node)
    }

    /// Start `count` nodes named `{prefix}1..={prefix}{count}` from a template
    ///
    /// # Errors
    ///
    /// Returns error if a name is invalid or already taken
    pub async fn spawn_many(
        &self,
        prefix: &str,
        count: usize,
        template: &NodeConfig,
    ) -> SimResult<Vec<Arc<MeshNode>>> {
        let mut spawned = Vec::with_capacity(count);
        for i in 1..=count {
            let id = ServerId::new(format!("{prefix}{i}")).map_err(MeshError::from)?;
            spawned.push(self.spawn(template.clone().with_id(id)).await?);
        }
        Ok(spawned)
    }

    /// Look up a node by name
    ///
    /// # Errors
    ///
    /// Returns error if no such node was spawned
    pub async fn node(&self, name: &str) -> SimResult<Arc<MeshNode>> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .find(|(id, _)| id.as_str() == name)
            .map(|(_, node)| Arc::clone(node))
            .ok_or_else(|| SimError::UnknownNode(name.to_string()))
    }

    /// Ids of all spawned nodes, sorted
    pub async fn node_ids(&self) -> Vec<ServerId> {
        self.nodes.read().await.keys().cloned().collect()
    }

    async fn all(&self) -> Vec<Arc<MeshNode>> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Let in-flight messages be processed
    pub async fn settle(&self) {
        tokio::time::sleep(self.settle).await;
    }

    /// Every node announces, in id order
    ///
    /// Returns how many announcements reached at least one peer.
    pub async fn announce_all(&self) -> usize {
        let mut reached = 0;
        for node in self.all().await {
            if node.announce().await {
                reached += 1;
            }
        }
        self.settle().await;
        debug!(reached, "all nodes announced");
        reached
    }

    /// Every node runs one default discovery round, in id order
    pub async fn discover_all(&self) -> BTreeMap<ServerId, DiscoveryResult> {
        let mut results = BTreeMap::new();
        for node in self.all().await {
            results.insert(node.id().clone(), node.discover(DiscoveryQuery::new()).await);
        }
        results
    }

    /// Split the mesh between two groups
    ///
    /// Cuts the fabric links across the groups, and each node forgets the
    /// servers on the other side.
    ///
    /// # Errors
    ///
    /// Returns error if a removal fails for a reason other than the server
    /// being unknown already
    pub async fn partition(&self, group_a: &[ServerId], group_b: &[ServerId]) -> SimResult<()> {
        self.fabric.partition(group_a, group_b).await;

        let nodes = self.nodes.read().await;
        for (side, other) in [(group_a, group_b), (group_b, group_a)] {
            for id in side {
                let Some(node) = nodes.get(id) else {
                    continue;
                };
                for peer in other.iter().filter(|peer| *peer != id) {
                    match node.remove_server(peer).await {
                        Ok(_) => {}
                        Err(err) if err.kind() == ErrorKind::UnknownServer => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        info!(group_a = ?group_a, group_b = ?group_b, "mesh partitioned");
        Ok(())
    }

    /// Restore every fabric link. Registries refill on the next announcements.
    pub async fn resolve(&self) {
        self.fabric.resolve().await;
        info!("mesh resolved");
    }

    /// Restore fabric links between two groups only
    pub async fn resolve_groups(&self, group_a: &[ServerId], group_b: &[ServerId]) {
        self.fabric.resolve_groups(group_a, group_b).await;
        info!(group_a = ?group_a, group_b = ?group_b, "mesh groups resolved");
    }

    /// Take every node off the fabric
    pub async fn shutdown_all(&self) {
        let nodes = self.all().await;
        join_all(nodes.iter().map(|node| node.shutdown())).await;
        self.nodes.write().await.clear();
    }
}

impl Default for MeshHarness {
    fn default() -> Self {
        Self::new()
    }
}
