//! Connectivity-gated publish/subscribe.
//!
//! The fabric keeps a directed connectivity matrix over every registered
//! node. Normal operations (`set_connected`, `partition`, `resolve`) always
//! write both directions, so the matrix stays symmetric. `set_link` is the
//! one deliberate exception: it cuts or restores a single direction to model
//! NAT-like reachability, and `asymmetric_links` reports every pair it has
//! left lopsided.

use crate::error::{FabricError, FabricResult};
use crate::topic::{Envelope, Mailbox, Topic};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{ServerId, Timestamp};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

/// Snapshot of fabric traffic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FabricStats {
    /// `publish`/`deliver` calls
    pub published: u64,
    /// Envelopes placed in a subscriber's mailbox
    pub delivered: u64,
    /// Subscribers skipped because the link was down
    pub dropped_disconnected: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_disconnected: AtomicU64,
}

struct FabricState<M> {
    /// Delivery handle per node
    nodes: BTreeMap<ServerId, Mailbox<M>>,
    /// `matrix[from][to]`: whether `from` can reach `to`
    matrix: BTreeMap<ServerId, BTreeMap<ServerId, bool>>,
    /// Subscribers per topic, in subscription order
    subscriptions: HashMap<Topic, Vec<ServerId>>,
}

impl<M> FabricState<M> {
    fn link(&self, from: &ServerId, to: &ServerId) -> bool {
        from != to
            && self
                .matrix
                .get(from)
                .and_then(|row| row.get(to))
                .copied()
                .unwrap_or(false)
    }

    fn set_link(&mut self, from: &ServerId, to: &ServerId, connected: bool) {
        if let Some(cell) = self.matrix.get_mut(from).and_then(|row| row.get_mut(to)) {
            *cell = connected;
        }
    }

    fn set_pair(&mut self, a: &ServerId, b: &ServerId, connected: bool) {
        self.set_link(a, b, connected);
        self.set_link(b, a, connected);
    }
}

/// Shared in-process network for one simulation
///
/// Inject one instance (behind an `Arc`) into every node of a simulation;
/// independent fabrics never see each other's traffic.
pub struct ConnectivityFabric<M> {
    state: RwLock<FabricState<M>>,
    counters: Counters,
}

impl<M: Clone + Send + 'static> ConnectivityFabric<M> {
    /// Create an empty fabric
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FabricState {
                nodes: BTreeMap::new(),
                matrix: BTreeMap::new(),
                subscriptions: HashMap::new(),
            }),
            counters: Counters::default(),
        }
    }

    /// Register a node, fully connected to every node already present
    ///
    /// # Errors
    ///
    /// Returns error if the id is already registered
    pub async fn register_node(&self, id: ServerId, mailbox: Mailbox<M>) -> FabricResult<()> {
        let mut state = self.state.write().await;
        if state.nodes.contains_key(&id) {
            return Err(FabricError::AlreadyRegistered(id));
        }

        let existing: Vec<ServerId> = state.nodes.keys().cloned().collect();
        let mut row = BTreeMap::new();
        for other in &existing {
            row.insert(other.clone(), true);
            if let Some(their_row) = state.matrix.get_mut(other) {
                their_row.insert(id.clone(), true);
            }
        }
        state.matrix.insert(id.clone(), row);
        state.nodes.insert(id.clone(), mailbox);

        info!(server = %id, peers = existing.len(), "node registered on fabric");
        Ok(())
    }

    /// Remove a node, its matrix entries, and all of its subscriptions
    ///
    /// Returns whether the node was registered.
    pub async fn unregister_node(&self, id: &ServerId) -> bool {
        let mut state = self.state.write().await;
        if state.nodes.remove(id).is_none() {
            return false;
        }
        state.matrix.remove(id);
        for row in state.matrix.values_mut() {
            row.remove(id);
        }
        for subscribers in state.subscriptions.values_mut() {
            subscribers.retain(|s| s != id);
        }
        state.subscriptions.retain(|_, subscribers| !subscribers.is_empty());

        info!(server = %id, "node unregistered from fabric");
        true
    }

    /// Check if a node is registered
    pub async fn is_registered(&self, id: &ServerId) -> bool {
        self.state.read().await.nodes.contains_key(id)
    }

    /// All registered node ids, sorted
    pub async fn registered_nodes(&self) -> Vec<ServerId> {
        self.state.read().await.nodes.keys().cloned().collect()
    }

    /// Number of registered nodes
    pub async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    /// Connect or disconnect a pair in both directions
    ///
    /// Self pairs and unregistered ids are a no-op.
    pub async fn set_connected(&self, a: &ServerId, b: &ServerId, connected: bool) {
        if a == b {
            return;
        }
        let mut state = self.state.write().await;
        state.set_pair(a, b, connected);
        debug!(a = %a, b = %b, connected, "link updated");
    }

    /// Whether `a` can reach `b`. Self pairs are never connected.
    pub async fn are_connected(&self, a: &ServerId, b: &ServerId) -> bool {
        self.state.read().await.link(a, b)
    }

    /// Cut or restore a single direction of a link
    ///
    /// This is the only way to make the matrix asymmetric.
    ///
    /// # Errors
    ///
    /// Returns error for a self link or an unregistered endpoint
    pub async fn set_link(&self, from: &ServerId, to: &ServerId, connected: bool) -> FabricResult<()> {
        if from == to {
            return Err(FabricError::SelfLink(from.clone()));
        }
        let mut state = self.state.write().await;
        for id in [from, to] {
            if !state.nodes.contains_key(id) {
                return Err(FabricError::UnknownNode(id.clone()));
            }
        }
        state.set_link(from, to, connected);
        debug!(from = %from, to = %to, connected, "directed link updated");
        Ok(())
    }

    /// Pairs `(a, b)` with `a < b` whose two directions disagree
    pub async fn asymmetric_links(&self) -> Vec<(ServerId, ServerId)> {
        let state = self.state.read().await;
        let mut lopsided = Vec::new();
        for (a, row) in &state.matrix {
            for (b, forward) in row {
                if a < b && *forward != state.link(b, a) {
                    lopsided.push((a.clone(), b.clone()));
                }
            }
        }
        lopsided
    }

    /// Whether every link agrees in both directions
    pub async fn is_symmetric(&self) -> bool {
        self.asymmetric_links().await.is_empty()
    }

    /// Cut every link between the two groups; links inside a group are kept
    pub async fn partition(&self, group_a: &[ServerId], group_b: &[ServerId]) {
        let mut state = self.state.write().await;
        for a in group_a {
            for b in group_b {
                if a != b {
                    state.set_pair(a, b, false);
                }
            }
        }
        info!(
            group_a = ?group_a,
            group_b = ?group_b,
            "fabric partitioned"
        );
    }

    /// Restore every link, in both directions
    pub async fn resolve(&self) {
        let mut state = self.state.write().await;
        for (from, row) in state.matrix.iter_mut() {
            for (to, cell) in row.iter_mut() {
                *cell = from != to;
            }
        }
        info!("fabric fully resolved");
    }

    /// Restore only the links between the two groups
    pub async fn resolve_groups(&self, group_a: &[ServerId], group_b: &[ServerId]) {
        let mut state = self.state.write().await;
        for a in group_a {
            for b in group_b {
                if a != b {
                    state.set_pair(a, b, true);
                }
            }
        }
        info!(group_a = ?group_a, group_b = ?group_b, "fabric groups resolved");
    }

    /// Nodes `id` can currently reach
    pub async fn reachable_from(&self, id: &ServerId) -> BTreeSet<ServerId> {
        let state = self.state.read().await;
        state
            .matrix
            .get(id)
            .map(|row| {
                row.iter()
                    .filter(|(_, connected)| **connected)
                    .map(|(to, _)| to.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Groups of nodes linked in both directions, each sorted
    pub async fn connected_groups(&self) -> Vec<Vec<ServerId>> {
        let state = self.state.read().await;
        let mut seen = BTreeSet::new();
        let mut groups = Vec::new();

        for start in state.nodes.keys() {
            if !seen.insert(start.clone()) {
                continue;
            }
            let mut group = vec![start.clone()];
            let mut frontier = vec![start.clone()];
            while let Some(current) = frontier.pop() {
                for next in state.nodes.keys() {
                    if !seen.contains(next)
                        && state.link(&current, next)
                        && state.link(next, &current)
                    {
                        seen.insert(next.clone());
                        group.push(next.clone());
                        frontier.push(next.clone());
                    }
                }
            }
            group.sort();
            groups.push(group);
        }
        groups
    }

    /// Subscribe a registered node to a topic
    ///
    /// Subscribing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the node is not registered
    pub async fn subscribe(&self, id: &ServerId, topic: Topic) -> FabricResult<()> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(id) {
            return Err(FabricError::UnknownNode(id.clone()));
        }
        let subscribers = state.subscriptions.entry(topic.clone()).or_default();
        if !subscribers.contains(id) {
            subscribers.push(id.clone());
            trace!(server = %id, topic = %topic, "subscribed");
        }
        Ok(())
    }

    /// Remove a node's subscription. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, id: &ServerId, topic: &Topic) -> bool {
        let mut state = self.state.write().await;
        let Some(subscribers) = state.subscriptions.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            state.subscriptions.remove(topic);
        }
        removed
    }

    /// Current subscribers of a topic, in subscription order
    pub async fn subscribers(&self, topic: &Topic) -> Vec<ServerId> {
        self.state
            .read()
            .await
            .subscriptions
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Publish to every connected subscriber other than the sender
    ///
    /// Returns true iff at least one subscriber received the message.
    pub async fn publish(&self, sender: &ServerId, topic: &Topic, payload: M) -> bool {
        self.deliver(sender, topic, payload).await > 0
    }

    /// Publish and return how many subscribers received the message
    ///
    /// Disconnected or unsubscribed targets are skipped silently.
    pub async fn deliver(&self, sender: &ServerId, topic: &Topic, payload: M) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot the eligible mailboxes, then send without holding the lock.
        let (targets, dropped) = {
            let state = self.state.read().await;
            let Some(subscribers) = state.subscriptions.get(topic) else {
                trace!(sender = %sender, topic = %topic, "no subscribers");
                return 0;
            };
            let mut targets = Vec::with_capacity(subscribers.len());
            let mut dropped = 0u64;
            for subscriber in subscribers.iter().filter(|s| *s != sender) {
                if !state.link(sender, subscriber) {
                    trace!(sender = %sender, to = %subscriber, topic = %topic, "link down, dropped");
                    dropped += 1;
                    continue;
                }
                if let Some(mailbox) = state.nodes.get(subscriber) {
                    targets.push((subscriber.clone(), mailbox.clone()));
                }
            }
            (targets, dropped)
        };
        self.counters
            .dropped_disconnected
            .fetch_add(dropped, Ordering::Relaxed);

        let timestamp = Timestamp::now();
        let mut delivered = 0usize;
        for (subscriber, mailbox) in targets {
            let envelope = Envelope {
                from: sender.clone(),
                topic: topic.clone(),
                payload: payload.clone(),
                timestamp,
            };
            if mailbox.send(envelope).is_ok() {
                delivered += 1;
            } else {
                trace!(to = %subscriber, topic = %topic, "mailbox closed");
            }
        }
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Snapshot of the traffic counters
    #[must_use]
    pub fn stats(&self) -> FabricStats {
        FabricStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped_disconnected: self.counters.dropped_disconnected.load(Ordering::Relaxed),
        }
    }
}

impl<M: Clone + Send + 'static> Default for ConnectivityFabric<M> {
    fn default() -> Self {
        Self::new()
    }
}
