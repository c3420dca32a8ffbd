//! Recorded results of a scenario run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_fabric::FabricStats;

/// Outcome of one scenario step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Position in the scenario, from 0
    pub index: usize,
    /// Step operation name
    pub op: String,
    /// Node the step ran on, if any
    pub node: Option<String>,
    /// Whether the operation succeeded
    pub success: bool,
    /// Size of the result, e.g. servers found or ids removed
    pub count: Option<usize>,
    /// Server ids the step produced, if it produces a list
    pub ids: Option<Vec<String>>,
    /// Operation-specific result
    pub detail: Value,
    /// Error message, when the operation failed
    pub error: Option<String>,
    /// Whether the step's expectations held
    pub expectations_met: bool,
    /// Wall time taken
    pub duration_ms: u64,
}

impl StepRecord {
    /// Successful step
    #[must_use]
    pub fn success(index: usize, op: &str, node: Option<&str>, detail: Value) -> Self {
        Self {
            index,
            op: op.to_string(),
            node: node.map(str::to_string),
            success: true,
            count: None,
            ids: None,
            detail,
            error: None,
            expectations_met: true,
            duration_ms: 0,
        }
    }

    /// Failed step
    #[must_use]
    pub fn failure(index: usize, op: &str, node: Option<&str>, error: String) -> Self {
        Self {
            index,
            op: op.to_string(),
            node: node.map(str::to_string),
            success: false,
            count: None,
            ids: None,
            detail: Value::Null,
            error: Some(error),
            expectations_met: true,
            duration_ms: 0,
        }
    }

    /// Set the result size
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Set the produced ids; the count follows
    #[must_use]
    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.count = Some(ids.len());
        self.ids = Some(ids);
        self
    }
}

/// Record of a whole scenario run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    /// Scenario name
    pub name: String,
    /// Nodes that took part
    pub nodes: Vec<String>,
    /// Per-step outcomes, in order
    pub steps: Vec<StepRecord>,
    /// Fabric counters at the end of the run
    pub fabric: FabricStats,
    /// Total wall time
    pub duration_ms: u64,
}

impl ScenarioReport {
    /// Empty report for a named scenario
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            steps: Vec::new(),
            fabric: FabricStats::default(),
            duration_ms: 0,
        }
    }

    /// Whether every step met its expectations
    #[must_use]
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|step| step.expectations_met)
    }

    /// Steps whose expectations did not hold
    #[must_use]
    pub fn failed_steps(&self) -> Vec<&StepRecord> {
        self.steps.iter().filter(|s| !s.expectations_met).collect()
    }

    /// Steps that ran on a given node
    #[must_use]
    pub fn steps_for_node(&self, node: &str) -> Vec<&StepRecord> {
        self.steps
            .iter()
            .filter(|s| s.node.as_deref() == Some(node))
            .collect()
    }

    /// Serialize to pretty JSON
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// One line per step, for terminals
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!("scenario {} ({} nodes)\n", self.name, self.nodes.len());
        for step in &self.steps {
            let status = match (step.success, step.expectations_met) {
                (_, false) => "FAIL",
                (true, true) => "ok",
                (false, true) => "err",
            };
            out.push_str(&format!(
                "  [{:>2}] {:<4} {:<12} {:<6}",
                step.index,
                status,
                step.op,
                step.node.as_deref().unwrap_or("-"),
            ));
            if let Some(count) = step.count {
                out.push_str(&format!(" count={count}"));
            }
            if let Some(error) = &step.error {
                out.push_str(&format!(" error={error}"));
            }
            out.push('\n');
        }
        out.push_str(&format!(
            "published={} delivered={} dropped={} passed={}\n",
            self.fabric.published,
            self.fabric.delivered,
            self.fabric.dropped_disconnected,
            self.passed()
        ));
        out
    }
}
