//! Health checks.
//!
//! A check first probes the target. If the target answers within the health
//! timeout the verdict is direct. Otherwise it is inferred from how long ago
//! the server was last heard from. A check never fails: an unreachable or
//! unknown server is simply reported unhealthy.

use crate::message::{topics, Message};
use crate::node::{MeshNode, NodeShared};
use serde::{Deserialize, Serialize};
use tessera_core::{CorrelationId, HealthMetrics, HealthStatus, ServerId, Timestamp};
use tessera_fabric::Topic;
use tracing::{debug, warn};

/// How a health verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSource {
    /// The server answered a probe
    Direct,
    /// Derived from the server's last contact
    Inferred,
}

/// Result of [`MeshNode::check_health`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Checked server
    pub server_id: ServerId,
    /// Verdict
    pub healthy: bool,
    /// How the verdict was reached
    pub source: HealthSource,
    /// When the check finished
    pub checked_at: Timestamp,
    /// Last contact, if the server is known
    pub last_seen: Option<Timestamp>,
    /// Metrics reported by the server, direct checks only
    pub detail: Option<HealthMetrics>,
}

impl MeshNode {
    /// Determine whether a server is healthy
    ///
    /// Checking ourselves needs no round-trip.
    pub async fn check_health(&self, id: &ServerId) -> HealthReport {
        let shared = &self.shared;
        if *id == shared.id {
            let now = Timestamp::now();
            return HealthReport {
                server_id: id.clone(),
                healthy: true,
                source: HealthSource::Direct,
                checked_at: now,
                last_seen: Some(now),
                detail: Some(shared.metrics().await),
            };
        }

        let correlation_id = CorrelationId::new();
        let (guard, reply) = shared.pending.expect_one(correlation_id);
        let probe = Message::HealthProbe {
            correlation_id,
            target: id.clone(),
        };
        shared
            .fabric
            .publish(&shared.id, &Topic::new(topics::HEALTH_PROBE), probe)
            .await;

        let answer = tokio::time::timeout(shared.config.health_timeout(), reply).await;
        drop(guard);

        match answer {
            Ok(Ok(Message::HealthReport { status, .. })) => self.record_direct(id, status).await,
            _ => self.infer(id).await,
        }
    }

    async fn record_direct(&self, id: &ServerId, status: HealthStatus) -> HealthReport {
        let now = Timestamp::now();
        let mut registry = self.shared.registry.write().await;
        registry.touch(id, now);
        registry.set_health(id, HealthStatus { last_checked: now, ..status });
        registry.stats_mut().direct_health_checks += 1;
        let last_seen = registry.get(id).map(|d| d.last_seen);
        drop(registry);

        debug!(server = %self.shared.id, target = %id, healthy = status.healthy, "direct health check");
        HealthReport {
            server_id: id.clone(),
            healthy: status.healthy,
            source: HealthSource::Direct,
            checked_at: now,
            last_seen,
            detail: status.detail,
        }
    }

    async fn infer(&self, id: &ServerId) -> HealthReport {
        let now = Timestamp::now();
        let threshold = self.shared.config.health_threshold();
        let mut registry = self.shared.registry.write().await;
        registry.stats_mut().inferred_health_checks += 1;

        let last_seen = registry.get(id).map(|d| d.last_seen);
        let healthy = last_seen.is_some_and(|seen| now.duration_since(&seen) < threshold);
        let status = if healthy {
            HealthStatus::healthy(now)
        } else {
            HealthStatus::unhealthy(now)
        };
        registry.set_health(id, status);
        drop(registry);

        if !healthy {
            warn!(
                server = %self.shared.id,
                target = %id,
                known = last_seen.is_some(),
                "no probe reply, server inferred unhealthy"
            );
        }
        HealthReport {
            server_id: id.clone(),
            healthy,
            source: HealthSource::Inferred,
            checked_at: now,
            last_seen,
            detail: None,
        }
    }
}

impl NodeShared {
    /// Report own status if the probe is for us
    pub(crate) async fn answer_probe(
        &self,
        from: &ServerId,
        correlation_id: CorrelationId,
        target: &ServerId,
    ) {
        if *target != self.id {
            return;
        }
        let now = Timestamp::now();
        self.registry.write().await.touch(from, now);

        let status = HealthStatus::healthy(now).with_detail(self.metrics().await);
        self.fabric
            .publish(
                &self.id,
                &topics::health_reply(from),
                Message::HealthReport {
                    correlation_id,
                    status,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::message::MeshFabric;
    use std::sync::Arc;
    use std::time::Duration;

    fn id(name: &str) -> ServerId {
        ServerId::new(name).unwrap()
    }

    fn fast(name: &str) -> NodeConfig {
        NodeConfig::new(id(name)).with_health_timeout(100)
    }

    async fn pair() -> (Arc<MeshFabric>, MeshNode, MeshNode) {
        let fabric = Arc::new(MeshFabric::new());
        let a = MeshNode::start(Arc::clone(&fabric), fast("a")).await.unwrap();
        let b = MeshNode::start(Arc::clone(&fabric), fast("b")).await.unwrap();
        b.announce().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        (fabric, a, b)
    }

    #[tokio::test]
    async fn test_self_is_healthy_without_probe() {
        let fabric = Arc::new(MeshFabric::new());
        let node = MeshNode::start(Arc::clone(&fabric), fast("a")).await.unwrap();
        let before = fabric.stats().published;

        let report = node.check_health(node.id()).await;
        assert!(report.healthy);
        assert_eq!(report.source, HealthSource::Direct);
        assert!(report.detail.is_some());
        assert_eq!(fabric.stats().published, before);
    }

    #[tokio::test]
    async fn test_direct_check_carries_metrics() {
        let (_fabric, a, b) = pair().await;
        b.register_handler("noop", |_: &serde_json::Value| Ok(serde_json::Value::Null), None);

        let report = a.check_health(&id("b")).await;
        assert!(report.healthy);
        assert_eq!(report.source, HealthSource::Direct);
        let detail = report.detail.unwrap();
        assert_eq!(detail.handlers, 1);
        assert_eq!(a.stats().await.direct_health_checks, 1);

        let stored = a.get_server(&id("b")).await.unwrap();
        assert!(stored.is_healthy());
        assert_eq!(stored.health.detail, Some(detail));
    }

    #[tokio::test]
    async fn test_recently_seen_peer_inferred_healthy() {
        let (fabric, a, _b) = pair().await;
        fabric.set_connected(&id("a"), &id("b"), false).await;

        let report = a.check_health(&id("b")).await;
        assert!(report.healthy);
        assert_eq!(report.source, HealthSource::Inferred);
        assert!(report.detail.is_none());
    }

    #[tokio::test]
    async fn test_silent_peer_inferred_unhealthy() {
        let (fabric, a, _b) = pair().await;
        fabric.set_connected(&id("a"), &id("b"), false).await;
        let old = Timestamp::now().saturating_sub(Duration::from_secs(3_600));
        a.set_last_seen(&id("b"), old).await.unwrap();

        let report = a.check_health(&id("b")).await;
        assert!(!report.healthy);
        assert_eq!(report.source, HealthSource::Inferred);
        assert_eq!(report.last_seen, Some(old));
        assert!(!a.get_server(&id("b")).await.unwrap().is_healthy());
        assert_eq!(a.stats().await.inferred_health_checks, 1);
    }

    #[tokio::test]
    async fn test_unknown_server_is_unhealthy() {
        let (_fabric, a, _b) = pair().await;
        let report = a.check_health(&id("ghost")).await;
        assert!(!report.healthy);
        assert_eq!(report.source, HealthSource::Inferred);
        assert_eq!(report.last_seen, None);
        assert_eq!(a.metrics().await.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_probe_only_answered_by_target() {
        let fabric = Arc::new(MeshFabric::new());
        let a = MeshNode::start(Arc::clone(&fabric), fast("a")).await.unwrap();
        let _b = MeshNode::start(Arc::clone(&fabric), fast("b")).await.unwrap();
        let _c = MeshNode::start(Arc::clone(&fabric), fast("c")).await.unwrap();

        let report = a.check_health(&id("c")).await;
        assert_eq!(report.source, HealthSource::Direct);
        assert_eq!(report.server_id, id("c"));
    }
}
