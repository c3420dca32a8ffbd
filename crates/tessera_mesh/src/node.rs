//! Mesh node lifecycle and message intake.
//!
//! A [`MeshNode`] owns its registry, handler table and pending-reply table.
//! Everything that arrives from the fabric goes through one intake loop,
//! which matches on [`Message`] and hands each variant to the protocol that
//! owns it. Operations that wait on the network (`discover`, remote
//! `dispatch`, `check_health`) run on the caller's task, so the intake loop
//! keeps answering peers while they wait.

use crate::config::NodeConfig;
use crate::dispatch::HandlerTable;
use crate::error::MeshResult;
use crate::message::{topics, MeshFabric, Message};
use crate::pending::PendingReplies;
use crate::registry::{LocalRegistry, MeshStats};
use std::sync::Arc;
use std::time::Instant;
use tessera_core::{HealthMetrics, HealthStatus, ServerDescriptor, ServerId, Timestamp};
use tessera_fabric::{mailbox, Envelope, Inbox};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, Instrument};

/// State shared between a node's public handle and its intake loop
pub(crate) struct NodeShared {
    pub(crate) id: ServerId,
    pub(crate) config: NodeConfig,
    pub(crate) fabric: Arc<MeshFabric>,
    /// Own descriptor as built at start; never stored in the registry
    pub(crate) descriptor: ServerDescriptor,
    pub(crate) registry: RwLock<LocalRegistry>,
    pub(crate) handlers: HandlerTable,
    pub(crate) pending: PendingReplies,
    started: Instant,
}

impl NodeShared {
    /// Own descriptor stamped as seen and healthy at `now`
    pub(crate) fn self_descriptor(&self, now: Timestamp) -> ServerDescriptor {
        let mut descriptor = self.descriptor.clone();
        descriptor.last_seen = now;
        descriptor.health = HealthStatus::healthy(now);
        descriptor
    }

    /// Current self-reported metrics
    pub(crate) async fn metrics(&self) -> HealthMetrics {
        let known_servers = self.registry.read().await.len() as u64;
        HealthMetrics {
            uptime_secs: self.started.elapsed().as_secs(),
            known_servers,
            handlers: self.handlers.len() as u64,
            pending_requests: self.pending.len() as u64,
        }
    }

    pub(crate) async fn bump(&self, update: impl FnOnce(&mut MeshStats)) {
        update(self.registry.write().await.stats_mut());
    }

    fn accept_reply(&self, from: &ServerId, reply: Message) {
        let kind = reply.kind();
        let Some(correlation_id) = reply.correlation_id() else {
            return;
        };
        if !self.pending.resolve(correlation_id, reply) {
            debug!(from = %from, kind, correlation = %correlation_id, "late or unknown reply dropped");
        }
    }
}

async fn run_intake(shared: Arc<NodeShared>, mut inbox: Inbox<Message>) {
    while let Some(envelope) = inbox.recv().await {
        let Envelope { from, payload, .. } = envelope;
        trace!(from = %from, kind = payload.kind(), "message received");

        match payload {
            Message::Announce { descriptor } => shared.on_announce(&from, descriptor).await,
            Message::DiscoveryRequest {
                correlation_id,
                requester,
                compatible_only,
                required_features,
            } => {
                shared
                    .answer_discovery(&from, correlation_id, requester, compatible_only, required_features)
                    .await;
            }
            Message::HealthProbe {
                correlation_id,
                target,
            } => shared.answer_probe(&from, correlation_id, &target).await,
            Message::TaskRequest(request) => shared.answer_task(&from, request).await,
            reply @ (Message::DiscoveryResponse { .. }
            | Message::HealthReport { .. }
            | Message::TaskResponse(_)) => shared.accept_reply(&from, reply),
        }
    }
    debug!("mailbox closed, intake stopped");
}

/// One server in the mesh
pub struct MeshNode {
    pub(crate) shared: Arc<NodeShared>,
    intake: JoinHandle<()>,
}

impl MeshNode {
    /// Join the fabric and start answering peers
    ///
    /// Registers the node, subscribes it to the shared and reply topics, and
    /// spawns its intake loop. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the id is already on the
    /// fabric
    pub async fn start(fabric: Arc<MeshFabric>, config: NodeConfig) -> MeshResult<Self> {
        config.validate()?;
        let id = config.id.clone().unwrap_or_else(ServerId::generate);
        let now = Timestamp::now();

        let mut descriptor = ServerDescriptor::new(id.clone(), config.feature_set(), now);
        descriptor.endpoints = config.endpoints.clone();
        descriptor.metadata = config.metadata.clone();
        descriptor.resources = config.resources.clone();

        let (tx, inbox) = mailbox();
        fabric.register_node(id.clone(), tx).await?;
        for topic in topics::shared().into_iter().chain(topics::replies(&id)) {
            fabric.subscribe(&id, topic).await?;
        }

        info!(
            server = %id,
            role = %descriptor.role(),
            fingerprint = %descriptor.fingerprint(),
            features = descriptor.feature_set.len(),
            "mesh node started"
        );

        let shared = Arc::new(NodeShared {
            registry: RwLock::new(LocalRegistry::new(id.clone())),
            id: id.clone(),
            config,
            fabric,
            descriptor,
            handlers: HandlerTable::default(),
            pending: PendingReplies::default(),
            started: Instant::now(),
        });
        let intake = tokio::spawn(
            run_intake(Arc::clone(&shared), inbox).instrument(info_span!("intake", server = %id)),
        );

        Ok(Self { shared, intake })
    }

    /// Leave the fabric; the intake loop stops once its mailbox closes
    pub async fn shutdown(&self) {
        if self.shared.fabric.unregister_node(&self.shared.id).await {
            info!(server = %self.shared.id, "mesh node stopped");
        }
    }

    /// Server id
    #[must_use]
    pub fn id(&self) -> &ServerId {
        &self.shared.id
    }

    /// Config the node was started with
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Own descriptor as it would be announced now
    #[must_use]
    pub fn descriptor(&self) -> ServerDescriptor {
        self.shared.self_descriptor(Timestamp::now())
    }

    /// Fabric this node is attached to
    #[must_use]
    pub fn fabric(&self) -> &Arc<MeshFabric> {
        &self.shared.fabric
    }

    /// Counters
    pub async fn stats(&self) -> MeshStats {
        self.shared.registry.read().await.stats()
    }

    /// Copy of the local registry
    pub async fn registry_snapshot(&self) -> LocalRegistry {
        self.shared.registry.read().await.clone()
    }

    /// Self-reported metrics, as sent in health reports
    pub async fn metrics(&self) -> HealthMetrics {
        self.shared.metrics().await
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.intake.abort();
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("id", &self.shared.id)
            .field("fingerprint", &self.shared.descriptor.fingerprint())
            .finish_non_exhaustive()
    }
}
