//! Declarative scenarios.
//!
//! A scenario is a JSON document listing nodes (each a [`NodeConfig`] plus
//! the built-in handlers it registers) and the steps to run against them:
//!
//! ```json
//! {
//!   "name": "split",
//!   "nodes": [{"id": "n1"}, {"id": "n2", "handlers": ["echo"]}],
//!   "steps": [
//!     {"op": "announce_all"},
//!     {"op": "discover", "node": "n1", "expect": {"count": 1}},
//!     {"op": "partition", "a": ["n1"], "b": ["n2"]},
//!     {"op": "dispatch", "node": "n1", "task_type": "echo", "expect": {"success": false}}
//!   ]
//! }
//! ```

use crate::error::{SimError, SimResult};
use crate::handlers;
use crate::harness::{MeshHarness, DEFAULT_SETTLE_MS};
use crate::record::{ScenarioReport, StepRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{ServerId, Timestamp};
use tessera_mesh::{DiscoveryQuery, DispatchOptions, MeshNode, NodeConfig};
use tracing::{info, warn};

/// One node of a scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioNode {
    /// Node settings; `id` is required
    #[serde(flatten)]
    pub config: NodeConfig,
    /// Built-in handlers to register, by name
    #[serde(default)]
    pub handlers: Vec<String>,
}

impl ScenarioNode {
    /// Node with a config and no handlers
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
        }
    }

    /// Register a built-in handler
    #[must_use]
    pub fn with_handler(mut self, name: impl Into<String>) -> Self {
        self.handlers.push(name.into());
        self
    }
}

fn yes() -> bool {
    true
}

/// An operation in a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Every node announces
    AnnounceAll,
    /// One node announces
    Announce {
        /// Announcing node
        node: String,
    },
    /// One discovery round
    Discover {
        /// Requesting node
        node: String,
        /// Only version-compatible servers
        #[serde(default = "yes")]
        compatible_only: bool,
        /// Only servers with these features
        #[serde(default)]
        required_features: Option<BTreeSet<String>>,
    },
    /// Local compatibility query
    Compatible {
        /// Queried node
        node: String,
        /// Required features
        #[serde(default)]
        required_features: Option<BTreeSet<String>>,
    },
    /// Split two groups
    Partition {
        /// First group
        a: Vec<String>,
        /// Second group
        b: Vec<String>,
    },
    /// Heal links between two groups, or everywhere when omitted
    Resolve {
        /// First group
        #[serde(default)]
        a: Option<Vec<String>>,
        /// Second group
        #[serde(default)]
        b: Option<Vec<String>>,
    },
    /// Cut or restore one fabric link in both directions
    Link {
        /// One end
        a: String,
        /// Other end
        b: String,
        /// New state
        connected: bool,
    },
    /// Run a task
    Dispatch {
        /// Dispatching node
        node: String,
        /// Handler name
        task_type: String,
        /// Task input
        #[serde(default)]
        data: Value,
        /// Required features
        #[serde(default)]
        required_features: Option<BTreeSet<String>>,
        /// Preferred server
        #[serde(default)]
        preferred: Option<String>,
    },
    /// Health check
    CheckHealth {
        /// Checking node
        node: String,
        /// Checked server
        target: String,
    },
    /// Drop silent servers
    CleanStale {
        /// Cleaning node
        node: String,
        /// Max silence; the node's configured value when omitted
        #[serde(default)]
        max_age_secs: Option<u64>,
    },
    /// Pretend a server was last seen `secs` ago
    Age {
        /// Node whose registry is changed
        node: String,
        /// Aged server
        target: String,
        /// Seconds of silence
        secs: u64,
    },
    /// Clear a node's registry and re-announce
    Reset {
        /// Reset node
        node: String,
    },
    /// Remove a server and cut the link to it
    Remove {
        /// Removing node
        node: String,
        /// Removed server
        target: String,
    },
    /// Wait
    Sleep {
        /// Milliseconds
        ms: u64,
    },
}

impl Step {
    /// Operation name as written in JSON
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::AnnounceAll => "announce_all",
            Self::Announce { .. } => "announce",
            Self::Discover { .. } => "discover",
            Self::Compatible { .. } => "compatible",
            Self::Partition { .. } => "partition",
            Self::Resolve { .. } => "resolve",
            Self::Link { .. } => "link",
            Self::Dispatch { .. } => "dispatch",
            Self::CheckHealth { .. } => "check_health",
            Self::CleanStale { .. } => "clean_stale",
            Self::Age { .. } => "age",
            Self::Reset { .. } => "reset",
            Self::Remove { .. } => "remove",
            Self::Sleep { .. } => "sleep",
        }
    }

    /// Node the step runs on
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Announce { node }
            | Self::Discover { node, .. }
            | Self::Compatible { node, .. }
            | Self::Dispatch { node, .. }
            | Self::CheckHealth { node, .. }
            | Self::CleanStale { node, .. }
            | Self::Age { node, .. }
            | Self::Reset { node }
            | Self::Remove { node, .. } => Some(node.as_str()),
            _ => None,
        }
    }

    /// Every node name the step mentions
    fn mentions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.node().into_iter().collect();
        match self {
            Self::Partition { a, b } => names.extend(a.iter().chain(b).map(String::as_str)),
            Self::Resolve { a, b } => {
                names.extend(a.iter().flatten().chain(b.iter().flatten()).map(String::as_str));
            }
            Self::Link { a, b, .. } => names.extend([a.as_str(), b.as_str()]),
            Self::Dispatch {
                preferred: Some(p), ..
            } => names.push(p),
            Self::CheckHealth { target, .. }
            | Self::Age { target, .. }
            | Self::Remove { target, .. } => names.push(target),
            _ => {}
        }
        names
    }
}

/// Checks applied to a step's record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expect {
    /// Operation success
    pub success: Option<bool>,
    /// Result size
    pub count: Option<usize>,
    /// Produced ids, in any order
    pub ids: Option<Vec<String>>,
    /// Health verdict
    pub healthy: Option<bool>,
    /// Whether a dispatch ran locally
    pub processed_locally: Option<bool>,
    /// Dispatch output
    pub output: Option<Value>,
}

impl Expect {
    /// Check a record, returning a description of each mismatch
    #[must_use]
    pub fn check(&self, record: &StepRecord) -> Vec<String> {
        let mut mismatches = Vec::new();
        if let Some(success) = self.success.filter(|s| *s != record.success) {
            mismatches.push(format!("expected success={success}"));
        }
        if let Some(count) = self.count.filter(|c| Some(*c) != record.count) {
            mismatches.push(format!("expected count={count}, got {:?}", record.count));
        }
        if let Some(ids) = &self.ids {
            let want: BTreeSet<&String> = ids.iter().collect();
            let got: BTreeSet<&String> = record.ids.iter().flatten().collect();
            if want != got {
                mismatches.push(format!("expected ids {ids:?}, got {:?}", record.ids));
            }
        }
        for (field, want) in [
            ("healthy", self.healthy),
            ("processed_locally", self.processed_locally),
        ] {
            if let Some(want) = want {
                if record.detail.get(field).and_then(Value::as_bool) != Some(want) {
                    mismatches.push(format!("expected {field}={want}"));
                }
            }
        }
        if let Some(output) = &self.output {
            if record.detail.get("output") != Some(output) {
                mismatches.push(format!("expected output {output}"));
            }
        }
        mismatches
    }
}

/// A step with optional expectations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Operation
    #[serde(flatten)]
    pub step: Step,
    /// Expectations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Expect>,
}

impl From<Step> for ScenarioStep {
    fn from(step: Step) -> Self {
        Self { step, expect: None }
    }
}

/// Node count of the standard demo
pub const DEMO_NODES: usize = 5;

/// A complete scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Name used in reports
    pub name: String,
    /// Pause after broadcasts, in milliseconds
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Participating nodes
    pub nodes: Vec<ScenarioNode>,
    /// Steps, run in order
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

fn default_settle() -> u64 {
    DEFAULT_SETTLE_MS
}

impl Scenario {
    /// Empty scenario
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settle_ms: DEFAULT_SETTLE_MS,
            nodes: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Add a node
    #[must_use]
    pub fn with_node(mut self, node: ScenarioNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add a step without expectations
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Add a step with expectations
    #[must_use]
    pub fn step_expecting(mut self, step: Step, expect: Expect) -> Self {
        self.steps.push(ScenarioStep {
            step,
            expect: Some(expect),
        });
        self
    }

    /// Parse and validate JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the scenario is invalid
    pub fn from_json(json: &str) -> SimResult<Self> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not a valid scenario
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Serialize to pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check node ids, handler names and step references
    ///
    /// # Errors
    ///
    /// Returns error naming the first problem found
    pub fn validate(&self) -> SimResult<()> {
        if self.nodes.is_empty() {
            return Err(SimError::Scenario("scenario has no nodes".to_string()));
        }
        let mut names = BTreeSet::new();
        for node in &self.nodes {
            node.config.validate()?;
            let Some(id) = &node.config.id else {
                return Err(SimError::Scenario("every node needs an id".to_string()));
            };
            if !names.insert(id.as_str()) {
                return Err(SimError::Scenario(format!("duplicate node {id}")));
            }
            if let Some(name) = node
                .handlers
                .iter()
                .find(|h| handlers::builtin(h).is_none())
            {
                return Err(SimError::UnknownHandler(name.clone()));
            }
        }
        for (index, entry) in self.steps.iter().enumerate() {
            if let Some(name) = entry.step.mentions().into_iter().find(|n| !names.contains(n)) {
                return Err(SimError::Scenario(format!(
                    "step {index} ({}) names unknown node {name}",
                    entry.step.op()
                )));
            }
        }
        Ok(())
    }

    /// Spawn the nodes on a fresh fabric and run every step
    ///
    /// Step failures are recorded, never raised.
    ///
    /// # Errors
    ///
    /// Returns error if the scenario is invalid or a node fails to start
    pub async fn run(&self) -> SimResult<ScenarioReport> {
        self.validate()?;
        let started = Instant::now();
        let harness = MeshHarness::new().with_settle(self.settle_ms);

        for node in &self.nodes {
            let spawned = harness.spawn(node.config.clone()).await?;
            for name in &node.handlers {
                let handler = handlers::builtin(name)
                    .ok_or_else(|| SimError::UnknownHandler(name.clone()))?;
                spawned.register_task_handler(name.clone(), handler, None);
            }
        }

        let mut report = ScenarioReport::new(&self.name);
        report.nodes = harness
            .node_ids()
            .await
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        info!(scenario = %self.name, nodes = report.nodes.len(), steps = self.steps.len(), "scenario started");

        for (index, entry) in self.steps.iter().enumerate() {
            let step_started = Instant::now();
            let mut record = match execute(&harness, index, &entry.step).await {
                Ok(record) => record,
                Err(err) => StepRecord::failure(index, entry.step.op(), entry.step.node(), err.to_string()),
            };
            record.duration_ms = step_started.elapsed().as_millis() as u64;

            if let Some(expect) = &entry.expect {
                let mismatches = expect.check(&record);
                if !mismatches.is_empty() {
                    warn!(step = index, op = %record.op, mismatches = ?mismatches, "expectation failed");
                    record.expectations_met = false;
                }
            }
            report.steps.push(record);
        }

        report.fabric = harness.fabric().stats();
        report.duration_ms = started.elapsed().as_millis() as u64;
        harness.shutdown_all().await;
        info!(scenario = %self.name, passed = report.passed(), "scenario finished");
        Ok(report)
    }

    /// Partition-and-heal walkthrough over `nodes` nodes (at least 3)
    ///
    /// [`DEMO_NODES`] is the usual size.
    ///
    /// The last node alone offers `math` and the `sum` handler; every node
    /// can `echo`.
    #[must_use]
    pub fn demo(nodes: usize) -> Self {
        let nodes = nodes.max(3);
        let name = |i: usize| format!("n{i}");
        let last = name(nodes);
        let math: BTreeSet<String> = ["math".to_string()].into_iter().collect();

        let mut scenario = Self::new(format!("demo-{nodes}"));
        for i in 1..=nodes {
            let mut config = NodeConfig::default()
                .with_discovery_timeout(500)
                .with_task_timeout(500)
                .with_health_timeout(250);
            if let Ok(id) = ServerId::new(name(i)) {
                config = config.with_id(id);
            }
            let mut node = ScenarioNode::new(config).with_handler("echo");
            if i == nodes {
                node.config = node.config.with_feature("math");
                node = node.with_handler("sum");
            }
            scenario = scenario.with_node(node);
        }

        let peers = nodes - 1;
        let left = vec![name(1), name(2)];
        let right: Vec<String> = (3..=nodes).map(name).collect();
        let sum = |expect: Expect| {
            (
                Step::Dispatch {
                    node: name(1),
                    task_type: "sum".to_string(),
                    data: json!([1, 2, 3]),
                    required_features: Some(math.clone()),
                    preferred: Some(last.clone()),
                },
                expect,
            )
        };
        let (split_sum, split_expect) = sum(Expect {
            success: Some(false),
            ..Expect::default()
        });
        let (healed_sum, healed_expect) = sum(Expect {
            success: Some(true),
            processed_locally: Some(false),
            output: Some(json!(6)),
            ..Expect::default()
        });

        scenario
            .step(Step::AnnounceAll)
            .step_expecting(
                Step::Discover {
                    node: name(1),
                    compatible_only: true,
                    required_features: None,
                },
                Expect {
                    count: Some(peers),
                    ..Expect::default()
                },
            )
            .step(Step::Partition {
                a: left,
                b: right,
            })
            .step_expecting(
                Step::Compatible {
                    node: name(1),
                    required_features: None,
                },
                Expect {
                    ids: Some(vec![name(2)]),
                    ..Expect::default()
                },
            )
            .step_expecting(split_sum, split_expect)
            .step(Step::Resolve { a: None, b: None })
            .step(Step::AnnounceAll)
            .step_expecting(
                Step::Discover {
                    node: name(1),
                    compatible_only: true,
                    required_features: None,
                },
                Expect {
                    count: Some(peers),
                    ..Expect::default()
                },
            )
            .step_expecting(healed_sum, healed_expect)
            .step_expecting(
                Step::Dispatch {
                    node: name(1),
                    task_type: "echo".to_string(),
                    data: json!({"hello": "mesh"}),
                    required_features: None,
                    preferred: None,
                },
                Expect {
                    processed_locally: Some(true),
                    ..Expect::default()
                },
            )
            .step(Step::Age {
                node: name(1),
                target: name(2),
                secs: 3_600,
            })
            .step(Step::Link {
                a: name(1),
                b: name(2),
                connected: false,
            })
            .step_expecting(
                Step::CheckHealth {
                    node: name(1),
                    target: name(2),
                },
                Expect {
                    healthy: Some(false),
                    ..Expect::default()
                },
            )
            .step_expecting(
                Step::CleanStale {
                    node: name(1),
                    max_age_secs: Some(1_800),
                },
                Expect {
                    ids: Some(vec![name(2)]),
                    ..Expect::default()
                },
            )
    }
}

fn to_ids(names: &[String]) -> SimResult<Vec<ServerId>> {
    names
        .iter()
        .map(|n| ServerId::new(n.as_str()).map_err(|e| SimError::Scenario(e.to_string())))
        .collect()
}

fn id_strings(ids: impl IntoIterator<Item = ServerId>) -> Vec<String> {
    ids.into_iter().map(|id| id.to_string()).collect()
}

async fn execute(harness: &MeshHarness, index: usize, step: &Step) -> SimResult<StepRecord> {
    let op = step.op();
    let on = step.node();
    let target = match on {
        Some(name) => Some(harness.node(name).await?),
        None => None,
    };
    let node = || -> SimResult<Arc<MeshNode>> {
        target
            .clone()
            .ok_or_else(|| SimError::Scenario(format!("{op} needs a node")))
    };

    let record = match step {
        Step::AnnounceAll => {
            let reached = harness.announce_all().await;
            StepRecord::success(index, op, on, json!({ "reached": reached })).with_count(reached)
        }
        Step::Announce { .. } => {
            let delivered = node()?.announce().await;
            harness.settle().await;
            StepRecord::success(index, op, on, json!({ "delivered": delivered }))
        }
        Step::Discover {
            compatible_only,
            required_features,
            ..
        } => {
            let query = DiscoveryQuery {
                compatible_only: *compatible_only,
                required_features: required_features.clone(),
            };
            let result = node()?.discover(query).await;
            let detail = json!({
                "new_servers": result.new_servers,
                "responders": result.responders,
                "reached": result.reached,
            });
            StepRecord::success(index, op, on, detail).with_ids(id_strings(result.ids()))
        }
        Step::Compatible {
            required_features, ..
        } => {
            let servers = node()?
                .get_compatible_servers(required_features.as_ref())
                .await;
            StepRecord::success(index, op, on, Value::Null)
                .with_ids(id_strings(servers.into_iter().map(|d| d.id)))
        }
        Step::Partition { a, b } => {
            harness.partition(&to_ids(a)?, &to_ids(b)?).await?;
            StepRecord::success(index, op, on, json!({ "a": a, "b": b }))
        }
        Step::Resolve { a, b } => {
            match (a, b) {
                (Some(a), Some(b)) => harness.resolve_groups(&to_ids(a)?, &to_ids(b)?).await,
                _ => harness.resolve().await,
            }
            StepRecord::success(index, op, on, json!({ "a": a, "b": b }))
        }
        Step::Link { a, b, connected } => {
            let ids = to_ids(&[a.clone(), b.clone()])?;
            harness
                .fabric()
                .set_connected(&ids[0], &ids[1], *connected)
                .await;
            StepRecord::success(index, op, on, json!({ "a": a, "b": b, "connected": connected }))
        }
        Step::Dispatch {
            task_type,
            data,
            required_features,
            preferred,
            ..
        } => {
            let options = DispatchOptions {
                required_features: required_features.clone(),
                preferred_server: preferred.as_deref().map(to_id).transpose()?,
            };
            match node()?.dispatch(task_type, data.clone(), options).await {
                Ok(outcome) => StepRecord::success(index, op, on, serde_json::to_value(&outcome)?),
                Err(err) => {
                    let mut record = StepRecord::failure(index, op, on, err.to_string());
                    record.detail = json!({ "kind": format!("{:?}", err.kind()) });
                    record
                }
            }
        }
        Step::CheckHealth { target, .. } => {
            let report = node()?.check_health(&to_id(target)?).await;
            StepRecord::success(index, op, on, serde_json::to_value(&report)?)
        }
        Step::CleanStale { max_age_secs, .. } => {
            let cleaner = node()?;
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| cleaner.config().stale_max_age());
            let removed = cleaner.clean_stale(max_age).await;
            StepRecord::success(index, op, on, Value::Null).with_ids(id_strings(removed))
        }
        Step::Age { target, secs, .. } => {
            let at = Timestamp::now().saturating_sub(Duration::from_secs(*secs));
            node()?.set_last_seen(&to_id(target)?, at).await?;
            StepRecord::success(index, op, on, json!({ "target": target, "secs": secs }))
        }
        Step::Reset { .. } => {
            let delivered = node()?.reset().await;
            harness.settle().await;
            StepRecord::success(index, op, on, json!({ "delivered": delivered }))
        }
        Step::Remove { target, .. } => {
            node()?.remove_server(&to_id(target)?).await?;
            StepRecord::success(index, op, on, json!({ "target": target }))
        }
        Step::Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            StepRecord::success(index, op, on, Value::Null)
        }
    };
    Ok(record)
}

fn to_id(name: &str) -> SimResult<ServerId> {
    ServerId::new(name).map_err(|e| SimError::Scenario(e.to_string()))
}
