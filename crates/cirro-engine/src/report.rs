use std::path::PathBuf;
use std::sync::Arc;

use cirro_domain::{Action, ComponentName};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::planner::Plan;

// ── Progress events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressError {
    pub kind: String,
    pub message: String,
}

/// One in-process progress notification. Observers see per-node order
/// (running, then one terminal status); a successor's `running` always
/// follows its predecessors' terminal events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub node_id: String,
    /// Resource kind.
    pub node_type: String,
    pub node_name: String,
    /// Owning component; empty for datacenter and environment modules.
    pub component: String,
    pub status: NodeStatus,
    pub action: Action,
    pub message: String,
    /// Present iff `status == failed`.
    pub error: Option<ProgressError>,
    /// Captured driver output, when any.
    pub logs: String,
    pub run_id: Uuid,
}

pub type OnProgress = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
pub type OnPlan = Arc<dyn Fn(&Plan) + Send + Sync>;

// ── Operation results ─────────────────────────────────────────────────────────

/// One root-cause or cascaded node failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeError {
    pub node_id: String,
    pub kind: String,
    pub message: String,
    /// Last captured driver log lines.
    pub logs: String,
    /// True when synthesized from an upstream failure rather than reported by
    /// a driver.
    pub cascaded: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Root-cause failures. Cascades are only counted.
    pub errors: Vec<NodeError>,
    pub cascaded_failures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
    pub success: bool,
    pub run_id: Uuid,
    pub execution: ExecutionSummary,
}

/// A declared component dependency the target environment does not satisfy.
/// The caller resolves it (fetch, prompt for variables) and re-enters the
/// engine with the dependency merged into the component set; the engine never
/// prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub name: ComponentName,
    pub local_path: Option<PathBuf>,
    pub oci_ref: Option<String>,
    /// The component that declared the dependency.
    pub required_by: ComponentName,
    /// Variables the dependency declaration references but the caller has not
    /// provided.
    pub missing_variables: Vec<String>,
}
