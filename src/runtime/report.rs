use crate::runtime::plan::Phase;
use crate::runtime::state::NodeState;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: String,
    pub status: NodeStatus,
    pub state: NodeState,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeReport {
    fn pending(node: &str, state: NodeState) -> Self {
        Self {
            node: node.to_string(),
            status: NodeStatus::Pending,
            state,
            error: None,
            error_code: None,
            retries: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Live report of a run. Every node owns one slot behind its own lock, so
/// concurrent node tasks never contend on a shared collection.
#[derive(Debug)]
pub struct ExecutionReport {
    deployment_id: String,
    phase: Phase,
    started_at: DateTime<Utc>,
    slots: IndexMap<String, Mutex<NodeReport>>,
}

impl ExecutionReport {
    pub fn new<'a>(deployment_id: &str, phase: Phase, nodes: impl IntoIterator<Item = (&'a str, NodeState)>) -> Self {
        let slots = nodes
            .into_iter()
            .map(|(name, state)| (name.to_string(), Mutex::new(NodeReport::pending(name, state))))
            .collect();
        Self {
            deployment_id: deployment_id.to_string(),
            phase,
            started_at: Utc::now(),
            slots,
        }
    }

    pub fn update(&self, node: &str, f: impl FnOnce(&mut NodeReport)) {
        if let Some(slot) = self.slots.get(node) {
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard);
        }
    }

    pub fn get(&self, node: &str) -> Option<NodeReport> {
        self.slots
            .get(node)
            .map(|slot| slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone())
    }

    pub fn begin(&self, node: &str) {
        self.update(node, |r| {
            r.status = NodeStatus::Running;
            r.started_at = Some(Utc::now());
        });
    }

    pub fn set_state(&self, node: &str, state: NodeState) {
        self.update(node, |r| r.state = state);
    }

    pub fn add_retries(&self, node: &str, retries: u32) {
        self.update(node, |r| r.retries += retries);
    }

    pub fn succeed(&self, node: &str) {
        self.update(node, |r| {
            r.status = NodeStatus::Succeeded;
            r.finished_at = Some(Utc::now());
        });
    }

    pub fn fail(&self, node: &str, code: &str, message: &str) {
        self.update(node, |r| {
            r.status = NodeStatus::Failed;
            r.error_code = Some(code.to_string());
            r.error = Some(message.to_string());
            r.finished_at = Some(Utc::now());
        });
    }

    pub fn rolled_back(&self, node: &str) {
        self.update(node, |r| {
            if r.status != NodeStatus::Failed {
                r.status = NodeStatus::RolledBack;
            }
            r.finished_at = Some(Utc::now());
        });
    }

    pub fn has_failures(&self) -> bool {
        self.slots.keys().any(|n| self.get(n).is_some_and(|r| r.status == NodeStatus::Failed))
    }

    /// Freezes the report. Nodes still marked running lost their task.
    pub fn finish(&self, status: RunStatus) -> ExecutionSummary {
        let nodes = self
            .slots
            .keys()
            .filter_map(|n| self.get(n))
            .map(|mut r| {
                if r.status == NodeStatus::Running {
                    r.status = NodeStatus::Failed;
                    r.error_code.get_or_insert_with(|| "aborted".to_string());
                    r.error.get_or_insert_with(|| "node task ended without reporting".to_string());
                }
                r
            })
            .collect();
        ExecutionSummary {
            deployment_id: self.deployment_id.clone(),
            phase: self.phase,
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            nodes,
        }
    }
}

/// Final outcome of one install or uninstall run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub deployment_id: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
}

impl ExecutionSummary {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 4 }
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|r| r.node == name)
    }

    pub fn failed_nodes(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|r| r.status == NodeStatus::Failed)
    }
}

impl fmt::Display for ExecutionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} of '{}': {}", self.phase, self.deployment_id, self.status)?;
        for r in &self.nodes {
            write!(f, "  {:<24} {:<12} {:<14}", r.node, r.status, r.state)?;
            if r.retries > 0 {
                write!(f, " retries={}", r.retries)?;
            }
            if let Some(err) = &r.error {
                write!(f, " error={}", err)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_track_each_node() {
        let report = ExecutionReport::new(
            "dep",
            Phase::Install,
            [("a", NodeState::Uninitialized), ("b", NodeState::Started)],
        );
        report.begin("a");
        report.add_retries("a", 2);
        report.fail("a", "AuthFailure", "bad credentials");
        report.rolled_back("a");

        let a = report.get("a").unwrap();
        assert_eq!(a.status, NodeStatus::Failed);
        assert_eq!(a.retries, 2);
        assert_eq!(report.get("b").unwrap().status, NodeStatus::Pending);
        assert!(report.has_failures());
    }

    #[test]
    fn test_finish_marks_abandoned_nodes_failed() {
        let report = ExecutionReport::new("dep", Phase::Install, [("a", NodeState::Uninitialized)]);
        report.begin("a");
        let summary = report.finish(RunStatus::Failed);
        assert_eq!(summary.node("a").unwrap().status, NodeStatus::Failed);
        assert_eq!(summary.exit_code(), 4);
        assert_eq!(summary.failed_nodes().count(), 1);
    }
}
