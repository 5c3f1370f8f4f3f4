//! Diff the target graph against recorded state into an ordered change set.

use std::collections::HashMap;

use cirro_domain::{Action, ComponentName, DatacenterName, EnvironmentName, ResourceKind};
use cirro_driver::{DriverError, DriverRegistry};
use cirro_graph::builder::PriorState;
use cirro_graph::error::ExprError;
use cirro_graph::expr::{render_value, RefResolver, Resolved};
use cirro_graph::{Graph, Node, NodeId, NodeScope};
use cirro_store::{input_digest, ResourceState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PlanError {
    /// The datacenter hook now selects a different driver than the one that
    /// wrote the node's state. Never silently migrated.
    #[error("node '{node}' is bound to driver '{bound}' but its state was written by '{recorded}'")]
    DriverRebound {
        node: NodeId,
        bound: String,
        recorded: String,
    },

    #[error("expression error in '{node}': {source}")]
    Render {
        node: NodeId,
        #[source]
        source: ExprError,
    },

    #[error("driver probe for '{node}' failed: {source}")]
    Probe {
        node: NodeId,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

// ── Plan model ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub name: String,
    /// Empty for datacenter and environment modules.
    pub component: String,
    pub depends_on: Vec<NodeId>,
}

impl NodeSummary {
    fn from_node(node: &Node) -> Self {
        let component = node
            .id
            .as_str()
            .split('/')
            .next()
            .filter(|_| matches!(node.scope, NodeScope::Component { .. }))
            .unwrap_or_default()
            .to_string();
        Self {
            id: node.id.clone(),
            kind: node.kind,
            name: node.name.clone(),
            component,
            depends_on: node.depends_on.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanChange {
    pub node: NodeSummary,
    pub action: Action,
    pub reason: String,
    /// Inputs rendered against recorded upstream outputs; unresolved upstream
    /// outputs remain as `${…}` holes the executor fills.
    pub rendered_inputs: Value,
    pub has_holes: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTotals {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub noop: usize,
    pub delete: usize,
}

impl ActionTotals {
    fn count(&mut self, action: Action) {
        match action {
            Action::Create => self.create += 1,
            Action::Update => self.update += 1,
            Action::Replace => self.replace += 1,
            Action::Noop => self.noop += 1,
            Action::Delete => self.delete += 1,
        }
    }
}

/// The ordered change set. Changes are grouped by topological layer; within a
/// layer they sort by `(kind, component, name)`, so identical inputs plan
/// byte-identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub changes: Vec<PlanChange>,
    pub total_by_action: ActionTotals,
}

impl Plan {
    pub fn change_for(&self, id: &NodeId) -> Option<&PlanChange> {
        self.changes.iter().find(|c| &c.node.id == id)
    }

    pub fn action_for(&self, id: &NodeId) -> Option<Action> {
        self.change_for(id).map(|c| c.action)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// ── Planning ──────────────────────────────────────────────────────────────────

pub struct PlanRequest<'a> {
    pub graph: &'a Graph,
    pub prior: &'a PriorState<'a>,
    pub registry: &'a DriverRegistry,
    /// Per-component variable values with declaration defaults already merged.
    pub variables: &'a HashMap<ComponentName, HashMap<String, String>>,
    pub datacenter: &'a DatacenterName,
    pub environment: &'a EnvironmentName,
    pub cancel: &'a CancellationToken,
}

pub async fn plan(req: &PlanRequest<'_>) -> Result<Plan, PlanError> {
    let layers = req
        .graph
        .topo_layers()
        .expect("graph is validated acyclic before planning");

    let mut changes = Vec::with_capacity(req.graph.len());
    let mut totals = ActionTotals::default();

    for layer in layers {
        let mut layer_changes = Vec::with_capacity(layer.len());
        for id in layer {
            let node = req.graph.get(&id).expect("layer ids come from the graph");
            let change = plan_node(req, node).await?;
            totals.count(change.action);
            layer_changes.push(change);
        }
        layer_changes.sort_by(|a, b| {
            (a.node.kind.as_str(), &a.node.component, &a.node.name).cmp(&(
                b.node.kind.as_str(),
                &b.node.component,
                &b.node.name,
            ))
        });
        changes.extend(layer_changes);
    }

    Ok(Plan {
        changes,
        total_by_action: totals,
    })
}

async fn plan_node(req: &PlanRequest<'_>, node: &Node) -> Result<PlanChange, PlanError> {
    let summary = NodeSummary::from_node(node);

    if node.delete_only {
        return Ok(PlanChange {
            node: summary,
            action: Action::Delete,
            reason: "absent from the target".to_string(),
            rendered_inputs: node.inputs.clone(),
            has_holes: false,
        });
    }

    let record = find_record(req.prior, node);

    if let Some(record) = record {
        if record.driver != node.binding.driver {
            return Err(PlanError::DriverRebound {
                node: node.id.clone(),
                bound: node.binding.driver.clone(),
                recorded: record.driver.clone(),
            });
        }
    }

    let resolver = PlannerResolver { req, node };
    let (rendered, has_holes) =
        render_value(&node.inputs, &resolver).map_err(|e| PlanError::Render {
            node: node.id.clone(),
            source: e,
        })?;

    let (action, reason) = match record {
        None => (Action::Create, "not in state".to_string()),
        Some(_) if has_holes => (
            Action::Update,
            "inputs depend on upstream changes".to_string(),
        ),
        Some(record) if input_digest(&rendered) == record.inputs_digest => {
            probe_drift(req, node, &rendered, record).await?
        }
        Some(record) => {
            let driver = req.registry.create(&node.binding.driver)?;
            let changed = changed_paths(&record.inputs, &rendered);
            let immutable = driver.metadata().immutable_inputs;
            let forces_replace = changed.iter().any(|path| {
                immutable
                    .iter()
                    .any(|prefix| path == prefix || path.starts_with(&format!("{}.", prefix)))
            });
            if forces_replace {
                (
                    Action::Replace,
                    format!("immutable input changed: {}", changed.join(", ")),
                )
            } else {
                (
                    Action::Update,
                    format!("inputs changed: {}", changed.join(", ")),
                )
            }
        }
    };

    Ok(PlanChange {
        node: summary,
        action,
        reason,
        rendered_inputs: rendered,
        has_holes,
    })
}

/// Inputs are byte-equal to the last apply; ask the driver whether reality
/// still matches. Side-effect free.
async fn probe_drift(
    req: &PlanRequest<'_>,
    node: &Node,
    rendered: &Value,
    record: &ResourceState,
) -> Result<(Action, String), PlanError> {
    let driver = req.registry.create(&node.binding.driver)?;
    let probe = driver
        .plan(
            req.cancel,
            &node.binding.module_source,
            rendered,
            Some(&record.external_state),
        )
        .await
        .map_err(|e| PlanError::Probe {
            node: node.id.clone(),
            source: e,
        })?;

    match probe.action {
        Action::Noop => Ok((Action::Noop, "no changes".to_string())),
        drifted => {
            debug!(node = %node.id, ?drifted, "driver reported drift");
            Ok((Action::Update, format!("drift detected: {}", probe.diff)))
        }
    }
}

/// Locate a node's recorded state, honoring its scope.
pub fn find_record<'a>(prior: &'a PriorState<'a>, node: &Node) -> Option<&'a ResourceState> {
    match &node.scope {
        NodeScope::Datacenter => prior.datacenter?.modules.get(&node.name),
        NodeScope::Environment => prior.environment?.modules.get(&node.name),
        NodeScope::Component {
            component,
            instance,
        } => {
            let state = prior.components.iter().find(|c| &c.name == component)?;
            let key = node.resource_key();
            match instance {
                Some(instance) => state.instances.get(instance)?.resources.get(&key),
                None => state.resources.get(&key),
            }
        }
    }
}

// ── Reference resolution against recorded state ───────────────────────────────

/// Resolves upstream outputs from recorded state; outputs of nodes that have
/// never applied answer Deferred and stay holes.
struct PlannerResolver<'a> {
    req: &'a PlanRequest<'a>,
    node: &'a Node,
}

impl PlannerResolver<'_> {
    fn virtual_component(&self) -> &str {
        self.node.id.as_str().split('/').next().unwrap_or_default()
    }

    fn component_name(&self) -> Option<&ComponentName> {
        self.node.scope.component()
    }

    fn lookup_output(&self, record: Option<&ResourceState>, field_path: &[String]) -> Resolved {
        let Some(record) = record else {
            return Resolved::Deferred;
        };
        let Some(first) = field_path.first() else {
            return Resolved::Deferred;
        };
        let Some(mut current) = record.outputs.get(first) else {
            return Resolved::Deferred;
        };
        for segment in &field_path[1..] {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Resolved::Deferred,
            }
        }
        Resolved::Value(current.clone())
    }
}

impl RefResolver for PlannerResolver<'_> {
    fn resolve(&self, path: &[String]) -> Result<Resolved, ExprError> {
        match path {
            [head, kind, name, outputs, field @ ..]
                if head == "resources" && outputs == "outputs" =>
            {
                let kind: ResourceKind = kind
                    .parse()
                    .map_err(|_| ExprError::UnknownReference(path.join(".")))?;
                let target_id =
                    NodeId::for_resource(self.virtual_component(), kind, name);
                let target = self
                    .req
                    .graph
                    .get(&target_id)
                    .ok_or_else(|| ExprError::UnknownReference(path.join(".")))?;
                Ok(self.lookup_output(find_record(self.req.prior, target), field))
            }
            [head, component, outputs, field @ ..]
                if head == "deps" && outputs == "outputs" =>
            {
                let dep = ComponentName::new(component.clone());
                let Some(state) = self.req.prior.components.iter().find(|c| c.name == dep)
                else {
                    return Ok(Resolved::Deferred);
                };
                // A component's outputs are the flat merge of its resources'
                // outputs, later keys in id order winning.
                let Some(first) = field.first() else {
                    return Ok(Resolved::Deferred);
                };
                let mut found: Option<&Value> = None;
                for record in state.resources.values() {
                    if let Some(value) = record.outputs.get(first) {
                        found = Some(value);
                    }
                }
                let Some(mut current) = found else {
                    return Ok(Resolved::Deferred);
                };
                for segment in &field[1..] {
                    match current.get(segment) {
                        Some(next) => current = next,
                        None => return Ok(Resolved::Deferred),
                    }
                }
                Ok(Resolved::Value(current.clone()))
            }
            [head, name] if head == "variables" => {
                let component = self
                    .component_name()
                    .ok_or_else(|| ExprError::UnknownReference(path.join(".")))?;
                self.req
                    .variables
                    .get(component)
                    .and_then(|vars| vars.get(name))
                    .map(|v| Resolved::Value(Value::String(v.clone())))
                    .ok_or_else(|| ExprError::UnknownReference(path.join(".")))
            }
            [head] | [head, _] if head == "environment" => Ok(Resolved::Value(Value::String(
                self.req.environment.to_string(),
            ))),
            [head] | [head, _] if head == "datacenter" => Ok(Resolved::Value(Value::String(
                self.req.datacenter.to_string(),
            ))),
            _ => Err(ExprError::UnknownReference(path.join("."))),
        }
    }
}

// ── Input diffing ─────────────────────────────────────────────────────────────

/// Dot-separated paths whose values differ between two input trees, sorted.
pub fn changed_paths(old: &Value, new: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    diff_values("", old, new, &mut paths);
    paths.sort();
    paths
}

fn diff_values(prefix: &str, old: &Value, new: &Value, out: &mut Vec<String>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let path = join_path(prefix, key);
                match new_map.get(key) {
                    Some(new_value) => diff_values(&path, old_value, new_value, out),
                    None => out.push(path),
                }
            }
            for key in new_map.keys() {
                if !old_map.contains_key(key) {
                    out.push(join_path(prefix, key));
                }
            }
        }
        (old, new) if old != new => {
            out.push(if prefix.is_empty() {
                ".".to_string()
            } else {
                prefix.to_string()
            });
        }
        _ => {}
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}
