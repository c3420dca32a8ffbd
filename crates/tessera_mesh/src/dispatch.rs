//! Task dispatch: run locally when possible, otherwise route to a peer.
//!
//! Each dispatch moves through [`DispatchPhase`]s:
//! `Evaluating -> LocalExecute | AwaitingRemote -> Succeeded | Failed`.
//! A local handler that fails does not fail the dispatch; the task is
//! retried on a peer instead.

use crate::error::{MeshError, MeshResult};
use crate::message::{topics, Message, TaskRequest, TaskResponse, TaskResult};
use crate::node::{MeshNode, NodeShared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tessera_core::{CorrelationId, FeatureSet, ServerId};
use tessera_fabric::Topic;
use tracing::{debug, warn};

/// Failure raised by a task handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create from a message
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Something that can execute one task type
pub trait TaskHandler: Send + Sync {
    /// Run the task on `data`
    ///
    /// # Errors
    ///
    /// Returns error if the task cannot be completed
    fn handle(&self, data: &Value) -> Result<Value, HandlerError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Value) -> Result<Value, HandlerError> + Send + Sync,
{
    fn handle(&self, data: &Value) -> Result<Value, HandlerError> {
        self(data)
    }
}

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub(crate) handler: Arc<dyn TaskHandler>,
    /// Features the executing node must offer
    pub(crate) required: Option<BTreeSet<String>>,
}

impl HandlerEntry {
    /// Tokens from `extra` and the stored requirements that `own` lacks
    fn missing(&self, own: &FeatureSet, extra: Option<&BTreeSet<String>>) -> Vec<String> {
        let mut missing = BTreeSet::new();
        for required in [extra, self.required.as_ref()].into_iter().flatten() {
            missing.extend(own.missing(required).into_iter().map(str::to_string));
        }
        missing.into_iter().collect()
    }
}

/// Run a handler on the blocking pool; a panic comes back as a failure
async fn run_handler(handler: Arc<dyn TaskHandler>, data: Value) -> Result<Value, HandlerError> {
    match tokio::task::spawn_blocking(move || handler.handle(&data)).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            let panic = err.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HandlerError::new(format!("handler panicked: {message}")))
        }
        Err(_) => Err(HandlerError::new("handler cancelled")),
    }
}

/// Handlers by task type
#[derive(Default)]
pub(crate) struct HandlerTable {
    entries: RwLock<HashMap<String, HandlerEntry>>,
}

impl HandlerTable {
    pub(crate) fn insert(&self, task_type: String, entry: HandlerEntry) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_type, entry)
            .is_some()
    }

    pub(crate) fn get(&self, task_type: &str) -> Option<HandlerEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }

    pub(crate) fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Steps of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Deciding where the task runs
    Evaluating,
    /// Running on this node
    LocalExecute,
    /// Sent to a peer, waiting for its reply
    AwaitingRemote,
    /// Finished with a result
    Succeeded,
    /// Finished with an error
    Failed,
}

/// Placement hints for [`MeshNode::dispatch`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOptions {
    /// Features the executing server must offer; defaults to the local
    /// handler's stored requirements
    pub required_features: Option<BTreeSet<String>>,
    /// Server to try first
    pub preferred_server: Option<ServerId>,
}

impl DispatchOptions {
    /// No requirements, no preference
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a feature token
    #[must_use]
    pub fn require(mut self, feature: impl Into<String>) -> Self {
        self.required_features
            .get_or_insert_with(BTreeSet::new)
            .insert(feature.into());
        self
    }

    /// Prefer a server
    #[must_use]
    pub fn prefer(mut self, server: ServerId) -> Self {
        self.preferred_server = Some(server);
        self
    }
}

/// Result of a successful dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Id of the exchange; fresh even for local runs
    pub correlation_id: CorrelationId,
    /// Task that ran
    pub task_type: String,
    /// Server that ran it
    pub server_id: ServerId,
    /// Whether it ran without a network round-trip
    pub processed_locally: bool,
    /// Handler output
    pub output: Value,
}

fn phase(server: &ServerId, task_type: &str, correlation_id: CorrelationId, phase: DispatchPhase) {
    debug!(server = %server, task_type, correlation = %correlation_id, phase = ?phase, "dispatch phase");
}

impl MeshNode {
    /// Register a closure for a task type, replacing any previous handler
    ///
    /// `required` is checked against this node's own features whenever the
    /// handler runs, and adopted by `dispatch` when the caller gives none.
    pub fn register_handler<F>(
        &self,
        task_type: impl Into<String>,
        handler: F,
        required: Option<BTreeSet<String>>,
    ) where
        F: Fn(&Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register_task_handler(task_type, Arc::new(handler), required);
    }

    /// Register a shared handler object for a task type
    pub fn register_task_handler(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        required: Option<BTreeSet<String>>,
    ) {
        let task_type = task_type.into();
        let replaced = self
            .shared
            .handlers
            .insert(task_type.clone(), HandlerEntry { handler, required });
        debug!(server = %self.shared.id, task_type, replaced, "handler registered");
    }

    /// Task types with a local handler, sorted
    #[must_use]
    pub fn task_types(&self) -> Vec<String> {
        self.shared.handlers.task_types()
    }

    /// Run a task locally if possible, otherwise on a compatible peer
    ///
    /// # Errors
    ///
    /// - `InvalidSelfOperation` if `preferred_server` is this node and no
    ///   local handler can run the task
    /// - `NoCompatibleServer` if no known peer qualifies
    /// - `HandlerExecution` from this node if the local handler failed and
    ///   no peer qualifies
    /// - `DispatchTimeout` if the chosen peer does not answer in time
    /// - `HandlerExecution` if the peer's handler failed or refused the task
    pub async fn dispatch(
        &self,
        task_type: &str,
        data: Value,
        options: DispatchOptions,
    ) -> MeshResult<TaskOutcome> {
        let result = self.run_dispatch(task_type, data, options).await;
        self.shared
            .bump(|stats| match &result {
                Ok(outcome) if outcome.processed_locally => stats.local_dispatches += 1,
                Ok(_) => stats.remote_dispatches += 1,
                Err(_) => stats.failed_dispatches += 1,
            })
            .await;
        result
    }

    async fn run_dispatch(
        &self,
        task_type: &str,
        data: Value,
        options: DispatchOptions,
    ) -> MeshResult<TaskOutcome> {
        let shared = &self.shared;
        let correlation_id = CorrelationId::new();
        phase(&shared.id, task_type, correlation_id, DispatchPhase::Evaluating);

        let entry = shared.handlers.get(task_type);
        let required = options
            .required_features
            .or_else(|| entry.as_ref().and_then(|e| e.required.clone()));
        let own = &shared.descriptor.feature_set;
        let preferred = options.preferred_server;
        let prefers_self = preferred.as_ref().is_none_or(|p| *p == shared.id);

        let capable = entry.filter(|e| e.missing(own, required.as_ref()).is_empty());
        let mut local_error = None;
        match capable {
            Some(entry) if prefers_self => {
                phase(&shared.id, task_type, correlation_id, DispatchPhase::LocalExecute);
                match run_handler(entry.handler, data.clone()).await {
                    Ok(output) => {
                        phase(&shared.id, task_type, correlation_id, DispatchPhase::Succeeded);
                        return Ok(TaskOutcome {
                            correlation_id,
                            task_type: task_type.to_string(),
                            server_id: shared.id.clone(),
                            processed_locally: true,
                            output,
                        });
                    }
                    Err(err) => {
                        warn!(
                            server = %shared.id,
                            task_type,
                            error = %err,
                            "local handler failed, falling back to remote"
                        );
                        local_error = Some(err);
                    }
                }
            }
            None if preferred.as_ref() == Some(&shared.id) => {
                phase(&shared.id, task_type, correlation_id, DispatchPhase::Failed);
                return Err(MeshError::InvalidSelfOperation(format!(
                    "no local handler can run {task_type:?}"
                )));
            }
            _ => {}
        }

        let target = match self
            .select_target(required.as_ref(), preferred.as_ref())
            .await
        {
            Some(target) => target,
            None => {
                phase(&shared.id, task_type, correlation_id, DispatchPhase::Failed);
                // The local failure is the only attempt that was made
                return Err(match local_error {
                    Some(err) => MeshError::HandlerExecution {
                        server: shared.id.clone(),
                        message: err.to_string(),
                    },
                    None => MeshError::NoCompatibleServer {
                        task_type: task_type.to_string(),
                    },
                });
            }
        };

        phase(&shared.id, task_type, correlation_id, DispatchPhase::AwaitingRemote);
        let (_guard, reply) = shared.pending.expect_one(correlation_id);
        let request = Message::TaskRequest(TaskRequest {
            correlation_id,
            target: target.clone(),
            task_type: task_type.to_string(),
            data,
            required_features: required,
        });
        shared
            .fabric
            .publish(&shared.id, &Topic::new(topics::TASK_REQUEST), request)
            .await;

        let timeout = shared.config.task_timeout();
        let result = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(Message::TaskResponse(TaskResponse {
                server_id, result, ..
            }))) => match result {
                TaskResult::Completed(output) => Ok(TaskOutcome {
                    correlation_id,
                    task_type: task_type.to_string(),
                    server_id,
                    processed_locally: false,
                    output,
                }),
                TaskResult::Failed(message) => Err(MeshError::HandlerExecution {
                    server: server_id,
                    message,
                }),
            },
            Ok(Ok(other)) => Err(MeshError::HandlerExecution {
                server: target.clone(),
                message: format!("unexpected {} reply", other.kind()),
            }),
            Ok(Err(_)) | Err(_) => {
                warn!(
                    server = %shared.id,
                    target = %target,
                    task_type,
                    timeout_ms = shared.config.task_timeout_ms,
                    "task timed out"
                );
                Err(MeshError::DispatchTimeout {
                    task_type: task_type.to_string(),
                    server: target,
                    timeout_ms: shared.config.task_timeout_ms,
                })
            }
        };

        let done = if result.is_ok() {
            DispatchPhase::Succeeded
        } else {
            DispatchPhase::Failed
        };
        phase(&shared.id, task_type, correlation_id, done);
        result
    }

    /// Preferred server if it qualifies, else the first compatible peer
    async fn select_target(
        &self,
        required: Option<&BTreeSet<String>>,
        preferred: Option<&ServerId>,
    ) -> Option<ServerId> {
        let own = &self.shared.descriptor.feature_set;
        let registry = self.shared.registry.read().await;

        let qualifies = |features: &FeatureSet| match required {
            Some(required) => features.can_handle(required),
            None => features.is_compatible_with(own),
        };
        if let Some(preferred) = preferred.filter(|p| **p != self.shared.id) {
            if let Some(descriptor) = registry.get(preferred) {
                if descriptor.is_healthy() && qualifies(&descriptor.feature_set) {
                    return Some(preferred.clone());
                }
            }
            debug!(server = %self.shared.id, preferred = %preferred, "preferred server not usable");
        }

        registry
            .compatible(own, required)
            .into_iter()
            .next()
            .map(|descriptor| descriptor.id)
    }
}

impl NodeShared {
    /// Run a task addressed to this node and reply to the requester
    pub(crate) async fn answer_task(&self, from: &ServerId, request: TaskRequest) {
        if request.target != self.id {
            return;
        }

        let result = match self.handlers.get(&request.task_type) {
            None => TaskResult::Failed(format!("no handler for task {:?}", request.task_type)),
            Some(entry) => {
                let missing = entry.missing(
                    &self.descriptor.feature_set,
                    request.required_features.as_ref(),
                );
                if missing.is_empty() {
                    match run_handler(entry.handler, request.data).await {
                        Ok(output) => TaskResult::Completed(output),
                        Err(err) => {
                            warn!(from = %from, task_type = %request.task_type, error = %err, "handler failed");
                            TaskResult::Failed(err.to_string())
                        }
                    }
                } else {
                    TaskResult::Failed(format!("missing features: {}", missing.join(", ")))
                }
            }
        };

        debug!(from = %from, task_type = %request.task_type, ok = matches!(result, TaskResult::Completed(_)), "task answered");
        let response = Message::TaskResponse(TaskResponse {
            correlation_id: request.correlation_id,
            server_id: self.id.clone(),
            result,
        });
        self.fabric
            .publish(&self.id, &topics::task_reply(from), response)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::error::ErrorKind;
    use crate::message::MeshFabric;
    use serde_json::json;

    fn id(name: &str) -> ServerId {
        ServerId::new(name).unwrap()
    }

    fn fast(name: &str) -> NodeConfig {
        NodeConfig::new(id(name))
            .with_task_timeout(200)
            .with_discovery_timeout(200)
    }

    fn features(tokens: &[&str]) -> BTreeSet<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    async fn pair(a: NodeConfig, b: NodeConfig) -> (Arc<MeshFabric>, MeshNode, MeshNode) {
        let fabric = Arc::new(MeshFabric::new());
        let a = MeshNode::start(Arc::clone(&fabric), a).await.unwrap();
        let b = MeshNode::start(Arc::clone(&fabric), b).await.unwrap();
        b.announce().await;
        a.announce().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        (fabric, a, b)
    }

    fn double(data: &Value) -> Result<Value, HandlerError> {
        data.as_i64()
            .map(|n| json!(n * 2))
            .ok_or_else(|| HandlerError::new("expected an integer"))
    }

    #[tokio::test]
    async fn test_local_first_publishes_nothing() {
        let fabric = Arc::new(MeshFabric::new());
        let node = MeshNode::start(Arc::clone(&fabric), fast("n1")).await.unwrap();
        node.register_handler("double", double, None);

        let before = fabric.stats().published;
        let outcome = node
            .dispatch("double", json!(21), DispatchOptions::new())
            .await
            .unwrap();
        assert!(outcome.processed_locally);
        assert_eq!(outcome.output, json!(42));
        assert_eq!(outcome.server_id, id("n1"));
        assert_eq!(fabric.stats().published, before);
        assert_eq!(node.stats().await.local_dispatches, 1);
    }

    #[tokio::test]
    async fn test_remote_dispatch() {
        let (_fabric, a, b) = pair(fast("a"), fast("b")).await;
        b.register_handler("double", double, None);

        let outcome = a
            .dispatch("double", json!(5), DispatchOptions::new())
            .await
            .unwrap();
        assert!(!outcome.processed_locally);
        assert_eq!(outcome.server_id, id("b"));
        assert_eq!(outcome.output, json!(10));
        assert_eq!(a.stats().await.remote_dispatches, 1);
    }

    #[tokio::test]
    async fn test_local_failure_falls_back_to_remote() {
        let (_fabric, a, b) = pair(fast("a"), fast("b")).await;
        a.register_handler("double", |_: &Value| Err(HandlerError::new("disk full")), None);
        b.register_handler("double", double, None);

        let outcome = a
            .dispatch("double", json!(4), DispatchOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.server_id, id("b"));
        assert_eq!(outcome.output, json!(8));
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_verbatim() {
        let (_fabric, a, b) = pair(fast("a"), fast("b")).await;
        b.register_handler("double", double, None);

        let err = a
            .dispatch("double", json!("nope"), DispatchOptions::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MeshError::HandlerExecution {
                server: id("b"),
                message: "expected an integer".into(),
            }
        );
        assert_eq!(a.stats().await.failed_dispatches, 1);
    }

    #[tokio::test]
    async fn test_peer_without_handler_refuses() {
        let (_fabric, a, _b) = pair(fast("a"), fast("b")).await;
        let err = a
            .dispatch("missing", json!(null), DispatchOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerExecution);
        assert!(err.to_string().contains("no handler"));
    }

    #[tokio::test]
    async fn test_no_compatible_server() {
        let fabric = Arc::new(MeshFabric::new());
        let node = MeshNode::start(fabric, fast("solo")).await.unwrap();
        let err = node
            .dispatch("double", json!(1), DispatchOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCompatibleServer);
    }

    #[tokio::test]
    async fn test_required_features_pick_capable_peer() {
        let fabric = Arc::new(MeshFabric::new());
        let a = MeshNode::start(Arc::clone(&fabric), fast("a")).await.unwrap();
        let b = MeshNode::start(Arc::clone(&fabric), fast("b")).await.unwrap();
        let c = MeshNode::start(Arc::clone(&fabric), fast("c").with_feature("gpu"))
            .await
            .unwrap();
        for node in [&b, &c] {
            node.register_handler("render", |_: &Value| Ok(json!("frame")), None);
            node.announce().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let outcome = a
            .dispatch("render", json!({}), DispatchOptions::new().require("gpu"))
            .await
            .unwrap();
        assert_eq!(outcome.server_id, id("c"));
    }

    #[tokio::test]
    async fn test_stored_requirements_are_adopted() {
        let (_fabric, a, b) = pair(fast("a"), fast("b").with_feature("gpu")).await;
        // Local handler needs gpu, which `a` lacks, so the task goes to `b`.
        a.register_handler("render", |_: &Value| Ok(json!("local")), Some(features(&["gpu"])));
        b.register_handler("render", |_: &Value| Ok(json!("remote")), None);

        let outcome = a
            .dispatch("render", json!({}), DispatchOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.output, json!("remote"));
        assert_eq!(outcome.server_id, id("b"));
    }

    #[tokio::test]
    async fn test_receiver_enforces_its_requirements() {
        let (_fabric, a, b) = pair(fast("a"), fast("b")).await;
        b.register_handler("render", |_: &Value| Ok(json!("frame")), Some(features(&["gpu"])));

        let err = a
            .dispatch("render", json!({}), DispatchOptions::new().prefer(id("b")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerExecution);
        assert!(err.to_string().contains("gpu"));
    }

    #[tokio::test]
    async fn test_preferred_self_without_handler() {
        let (_fabric, a, b) = pair(fast("a"), fast("b")).await;
        b.register_handler("double", double, None);
        let err = a
            .dispatch("double", json!(1), DispatchOptions::new().prefer(id("a")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSelfOperation);
    }

    #[tokio::test]
    async fn test_preferred_peer_skips_local() {
        let (_fabric, a, b) = pair(fast("a"), fast("b")).await;
        a.register_handler("double", double, None);
        b.register_handler("double", |_: &Value| Ok(json!("from b")), None);

        let outcome = a
            .dispatch("double", json!(1), DispatchOptions::new().prefer(id("b")))
            .await
            .unwrap();
        assert!(!outcome.processed_locally);
        assert_eq!(outcome.output, json!("from b"));
    }

    #[tokio::test]
    async fn test_disconnected_target_times_out() {
        let (fabric, a, b) = pair(fast("a"), fast("b")).await;
        b.register_handler("double", double, None);
        fabric.set_connected(a.id(), b.id(), false).await;

        let err = a
            .dispatch("double", json!(1), DispatchOptions::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MeshError::DispatchTimeout {
                task_type: "double".into(),
                server: id("b"),
                timeout_ms: 200,
            }
        );
        assert_eq!(a.metrics().await.pending_requests, 0);
    }

    fn boom(_: &Value) -> Result<Value, HandlerError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_remote_panic_leaves_node_serving() {
        let (_fabric, a, b) = pair(fast("a"), fast("b")).await;
        b.register_handler("boom", boom, None);
        b.register_handler("double", double, None);

        let err = a
            .dispatch("boom", json!(null), DispatchOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerExecution);
        assert!(err.to_string().contains("handler panicked: boom"));

        let outcome = a
            .dispatch("double", json!(3), DispatchOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.output, json!(6));
        let report = a.check_health(b.id()).await;
        assert_eq!(report.source, crate::health::HealthSource::Direct);
        assert!(report.healthy);
    }

    #[tokio::test]
    async fn test_local_panic_falls_back_to_remote() {
        let (_fabric, a, b) = pair(fast("a"), fast("b")).await;
        a.register_handler("double", boom, None);
        b.register_handler("double", double, None);

        let outcome = a
            .dispatch("double", json!(7), DispatchOptions::new())
            .await
            .unwrap();
        assert!(!outcome.processed_locally);
        assert_eq!(outcome.output, json!(14));
    }

    #[tokio::test]
    async fn test_local_failure_without_peers_keeps_message() {
        let fabric = Arc::new(MeshFabric::new());
        let node = MeshNode::start(fabric, fast("solo")).await.unwrap();
        node.register_handler("double", |_: &Value| Err(HandlerError::new("disk full")), None);

        let err = node
            .dispatch("double", json!(1), DispatchOptions::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MeshError::HandlerExecution {
                server: id("solo"),
                message: "disk full".into(),
            }
        );
    }

    #[test]
    fn test_options_builder() {
        let options = DispatchOptions::new().require("gpu").require("ipfs").prefer(id("n4"));
        assert_eq!(options.required_features, Some(features(&["gpu", "ipfs"])));
        assert_eq!(options.preferred_server, Some(id("n4")));
    }
}
