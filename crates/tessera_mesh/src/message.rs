//! Protocol messages and the topics they travel on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tessera_core::{CorrelationId, HealthStatus, ServerDescriptor, ServerId};
use tessera_fabric::{ConnectivityFabric, Topic};

/// Fabric carrying mesh messages
pub type MeshFabric = ConnectivityFabric<Message>;

/// Topic names shared by every node
pub mod topics {
    use super::{ServerId, Topic};

    /// Descriptor announcements
    pub const ANNOUNCE: &str = "mesh.announce";
    /// Discovery requests
    pub const DISCOVERY_REQUEST: &str = "mesh.discovery.request";
    /// Health probes
    pub const HEALTH_PROBE: &str = "mesh.health.probe";
    /// Task requests
    pub const TASK_REQUEST: &str = "mesh.task.request";

    const DISCOVERY_REPLY: &str = "mesh.discovery.reply";
    const HEALTH_REPLY: &str = "mesh.health.reply";
    const TASK_REPLY: &str = "mesh.task.reply";

    /// Topics every node subscribes to
    #[must_use]
    pub fn shared() -> [Topic; 4] {
        [
            Topic::new(ANNOUNCE),
            Topic::new(DISCOVERY_REQUEST),
            Topic::new(HEALTH_PROBE),
            Topic::new(TASK_REQUEST),
        ]
    }

    /// Reply topics owned by one requester
    #[must_use]
    pub fn replies(id: &ServerId) -> [Topic; 3] {
        [discovery_reply(id), health_reply(id), task_reply(id)]
    }

    /// Where discovery responses for `id` go
    #[must_use]
    pub fn discovery_reply(id: &ServerId) -> Topic {
        Topic::scoped(DISCOVERY_REPLY, id)
    }

    /// Where health reports for `id` go
    #[must_use]
    pub fn health_reply(id: &ServerId) -> Topic {
        Topic::scoped(HEALTH_REPLY, id)
    }

    /// Where task responses for `id` go
    #[must_use]
    pub fn task_reply(id: &ServerId) -> Topic {
        Topic::scoped(TASK_REPLY, id)
    }
}

/// Every message exchanged between mesh nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Sender's own descriptor
    Announce {
        /// Descriptor being announced
        descriptor: ServerDescriptor,
    },
    /// Ask peers for themselves and what they know
    DiscoveryRequest {
        /// Request correlation
        correlation_id: CorrelationId,
        /// Requester's descriptor
        requester: ServerDescriptor,
        /// Only return servers version-compatible with the requester
        compatible_only: bool,
        /// Only return servers offering all of these
        required_features: Option<BTreeSet<String>>,
    },
    /// One peer's answer to a discovery request
    DiscoveryResponse {
        /// Request correlation
        correlation_id: CorrelationId,
        /// Responding server
        responder: ServerId,
        /// Matching descriptors, possibly including the responder's own
        descriptors: Vec<ServerDescriptor>,
    },
    /// Ask one server for its health
    HealthProbe {
        /// Request correlation
        correlation_id: CorrelationId,
        /// Probed server
        target: ServerId,
    },
    /// A server's answer to a probe
    HealthReport {
        /// Request correlation
        correlation_id: CorrelationId,
        /// Reported status with metrics
        status: HealthStatus,
    },
    /// Run a task on one server
    TaskRequest(TaskRequest),
    /// Result of a task request
    TaskResponse(TaskResponse),
}

impl Message {
    /// Correlation id, for replies and requests that carry one
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Announce { .. } => None,
            Self::DiscoveryRequest { correlation_id, .. }
            | Self::DiscoveryResponse { correlation_id, .. }
            | Self::HealthProbe { correlation_id, .. }
            | Self::HealthReport { correlation_id, .. } => Some(*correlation_id),
            Self::TaskRequest(request) => Some(request.correlation_id),
            Self::TaskResponse(response) => Some(response.correlation_id),
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::DiscoveryRequest { .. } => "discovery_request",
            Self::DiscoveryResponse { .. } => "discovery_response",
            Self::HealthProbe { .. } => "health_probe",
            Self::HealthReport { .. } => "health_report",
            Self::TaskRequest(_) => "task_request",
            Self::TaskResponse(_) => "task_response",
        }
    }
}

/// Task sent to a remote server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Request correlation
    pub correlation_id: CorrelationId,
    /// Server expected to run it
    pub target: ServerId,
    /// Handler name
    pub task_type: String,
    /// Task input
    pub data: Value,
    /// Features the executing server must offer
    pub required_features: Option<BTreeSet<String>>,
}

/// Reply to a [`TaskRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Request correlation
    pub correlation_id: CorrelationId,
    /// Server that handled the request
    pub server_id: ServerId,
    /// What happened
    pub result: TaskResult,
}

/// Outcome reported by a remote server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    /// Handler returned a value
    Completed(Value),
    /// Handler failed or the task was refused
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{FeatureSet, Timestamp};

    #[test]
    fn test_reply_topics_are_scoped() {
        let id = ServerId::new("n1").unwrap();
        let names: Vec<String> = topics::replies(&id)
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "mesh.discovery.reply.n1",
                "mesh.health.reply.n1",
                "mesh.task.reply.n1"
            ]
        );
    }

    #[test]
    fn test_message_json_is_tagged() {
        let descriptor = ServerDescriptor::new(
            ServerId::new("n1").unwrap(),
            FeatureSet::default(),
            Timestamp::from_secs(10),
        );
        let json = serde_json::to_value(Message::Announce {
            descriptor: descriptor.clone(),
        })
        .unwrap();
        assert_eq!(json["type"], "announce");

        let decoded: Message = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, Message::Announce { descriptor });
        assert_eq!(decoded.correlation_id(), None);
    }

    #[test]
    fn test_task_response_correlation() {
        let correlation_id = CorrelationId::new();
        let message = Message::TaskResponse(TaskResponse {
            correlation_id,
            server_id: ServerId::new("n2").unwrap(),
            result: TaskResult::Failed("no handler".into()),
        });
        assert_eq!(message.correlation_id(), Some(correlation_id));
        assert_eq!(message.kind(), "task_response");
    }
}
