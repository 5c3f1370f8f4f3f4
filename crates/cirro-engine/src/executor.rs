//! Bounded-parallel execution of a plan over the dependency graph.
//!
//! Scheduling runs in a single task: it claims ready nodes, renders their
//! inputs from in-memory upstream outputs, and hands driver calls to worker
//! tasks gated by a semaphore. All state mutation and event emission happens
//! back in the scheduler, so every entity has a single writer and a node's
//! state write is durable before its `completed` event is observable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use cirro_domain::{Action, ComponentName, ResourceKind};
use cirro_driver::{Driver, DriverError, DriverRegistry};
use cirro_graph::error::ExprError;
use cirro_graph::expr::{render_value, RefResolver, Resolved};
use cirro_graph::{Graph, Node, NodeId, NodeScope};
use cirro_store::{
    ComponentState, DatacenterState, EnvironmentState, ExternalState, ResourceState,
    StateStore,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::planner::{Plan, PlanChange};
use crate::report::{
    ExecutionSummary, NodeError, NodeStatus, OnProgress, ProgressError, ProgressEvent,
};

/// Lines of driver output attached to a failure report.
const ERROR_LOG_LINES: usize = 30;

/// Mutable copies of every entity an execution may touch. The executor is
/// their single writer; entities are persisted whole as nodes finish.
#[derive(Debug, Clone)]
pub struct WorkingSet {
    pub datacenter: DatacenterState,
    pub environment: EnvironmentState,
    pub components: BTreeMap<ComponentName, ComponentState>,
}

pub struct ExecuteRequest<'a> {
    pub graph: &'a Graph,
    pub plan: &'a Plan,
    pub working: WorkingSet,
    pub parallelism: usize,
    pub cancel: CancellationToken,
    pub on_progress: Option<OnProgress>,
    pub run_id: Uuid,
    /// Execute only this node, resolving upstream outputs from state.
    pub only: Option<NodeId>,
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub statuses: BTreeMap<NodeId, NodeStatus>,
    pub summary: ExecutionSummary,
    pub cancelled: bool,
    pub working: WorkingSet,
}

pub struct Executor {
    store: StateStore,
    registry: Arc<DriverRegistry>,
}

enum WorkerResult {
    Applied {
        outputs: HashMap<String, Value>,
        external_state: ExternalState,
        logs: String,
    },
    Failed {
        kind: &'static str,
        message: String,
        logs: String,
    },
    Cancelled,
}

struct WorkerDone {
    id: NodeId,
    result: WorkerResult,
}

impl Executor {
    pub fn new(store: StateStore, registry: Arc<DriverRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn execute(
        &self,
        req: ExecuteRequest<'_>,
    ) -> Result<ExecutionReport, EngineError> {
        // Driver instances live for this operation only.
        let mut drivers: HashMap<String, Arc<dyn Driver>> = HashMap::new();
        for node in req.graph.nodes() {
            if !drivers.contains_key(&node.binding.driver) {
                drivers.insert(
                    node.binding.driver.clone(),
                    self.registry.create(&node.binding.driver)?,
                );
            }
        }

        let mut run = Run {
            store: &self.store,
            graph: req.graph,
            plan: req.plan,
            working: req.working,
            cancel: req.cancel,
            on_progress: req.on_progress,
            run_id: req.run_id,
            drivers,
            semaphore: Arc::new(Semaphore::new(req.parallelism.max(1))),
            outputs: HashMap::new(),
            statuses: BTreeMap::new(),
            failed_deps: HashMap::new(),
            successors: req.graph.successors(),
            in_degree: HashMap::new(),
            ready: BTreeSet::new(),
            summary: ExecutionSummary::default(),
            only: req.only,
        };
        run.seed();
        run.drive().await;
        Ok(run.finish())
    }
}

struct Run<'a> {
    store: &'a StateStore,
    graph: &'a Graph,
    plan: &'a Plan,
    working: WorkingSet,
    cancel: CancellationToken,
    on_progress: Option<OnProgress>,
    run_id: Uuid,
    drivers: HashMap<String, Arc<dyn Driver>>,
    semaphore: Arc<Semaphore>,
    /// In-memory outputs observed from finished nodes, keyed by node id.
    outputs: HashMap<NodeId, HashMap<String, Value>>,
    statuses: BTreeMap<NodeId, NodeStatus>,
    /// Direct predecessors that terminated unsuccessfully, per node.
    failed_deps: HashMap<NodeId, Vec<NodeId>>,
    successors: HashMap<NodeId, Vec<NodeId>>,
    in_degree: HashMap<NodeId, usize>,
    ready: BTreeSet<NodeId>,
    summary: ExecutionSummary,
    only: Option<NodeId>,
}

impl Run<'_> {
    fn seed(&mut self) {
        match &self.only {
            Some(only) => {
                // Single-node execution: dependencies are assumed satisfied
                // from recorded state.
                self.in_degree.insert(only.clone(), 0);
                self.ready.insert(only.clone());
            }
            None => {
                for node in self.graph.nodes() {
                    self.in_degree
                        .insert(node.id.clone(), node.depends_on.len());
                    if node.depends_on.is_empty() {
                        self.ready.insert(node.id.clone());
                    }
                }
            }
        }
    }

    async fn drive(&mut self) {
        let mut tasks: JoinSet<WorkerDone> = JoinSet::new();

        loop {
            while !self.cancel.is_cancelled() {
                let Some(id) = self.ready.iter().next().cloned() else {
                    break;
                };
                self.ready.remove(&id);
                self.claim(&id, &mut tasks).await;
            }

            match tasks.join_next().await {
                Some(Ok(done)) => self.settle(done).await,
                Some(Err(join_err)) => {
                    // A panicking worker fails its node like any driver error.
                    warn!(error = %join_err, "worker task aborted");
                }
                None => {
                    if self.cancel.is_cancelled() || self.ready.is_empty() {
                        break;
                    }
                }
            }
        }

        // Everything still pending was never claimed.
        let unclaimed: Vec<NodeId> = self
            .scheduled_ids()
            .filter(|id| !self.statuses.contains_key(id))
            .collect();
        for id in unclaimed {
            self.mark_cancelled(&id, "cancelled before execution");
        }
    }

    fn scheduled_ids(&self) -> Box<dyn Iterator<Item = NodeId> + '_> {
        match &self.only {
            Some(only) => Box::new(std::iter::once(only.clone())),
            None => Box::new(self.graph.ids().cloned()),
        }
    }

    /// Claim one ready node: resolve its inputs and either finish it inline
    /// (noop, cascade, render failure) or hand it to a worker.
    async fn claim(&mut self, id: &NodeId, tasks: &mut JoinSet<WorkerDone>) {
        let node = self.graph.get(id).expect("ready ids come from the graph");
        let change = self
            .plan
            .change_for(id)
            .expect("plan covers every graph node");

        // Predecessor failures cascade before any driver work happens.
        if let Some(failed) = self.failed_deps.get(id).cloned() {
            self.cascade_failure(id, &failed).await;
            return;
        }

        if change.action == Action::Noop {
            // No driver call; outputs come from the recorded state so
            // successors can still render.
            let outputs: HashMap<String, Value> = self
                .record_of(node)
                .map(|r| r.outputs.clone().into_iter().collect())
                .unwrap_or_default();
            self.outputs.insert(id.clone(), outputs);
            self.statuses.insert(id.clone(), NodeStatus::Skipped);
            self.emit(node, NodeStatus::Skipped, change.action, "no changes", None, "");
            self.complete(id);
            return;
        }

        let inputs = match self.render_final(node, change) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail_node(
                    id,
                    "UnresolvedReference",
                    format!("rendering inputs: {}", e),
                    String::new(),
                    false,
                )
                .await;
                return;
            }
        };

        let driver = self.drivers[&node.binding.driver].clone();
        let prior = self.record_of(node).map(|r| r.external_state.clone());
        let module_source = node.binding.module_source.clone();
        let action = change.action;
        let cancel = self.cancel.clone();
        let semaphore = self.semaphore.clone();
        let running_event = self.event_prototype(node, NodeStatus::Running, action);
        let on_progress = self.on_progress.clone();
        let worker_id = id.clone();

        tasks.spawn(async move {
            // The permit bounds concurrent driver calls; waiting for one is
            // interruptible so cancellation drains promptly.
            let _permit = tokio::select! {
                () = cancel.cancelled() => {
                    return WorkerDone { id: worker_id, result: WorkerResult::Cancelled };
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        return WorkerDone { id: worker_id, result: WorkerResult::Cancelled };
                    }
                },
            };

            if let Some(on_progress) = &on_progress {
                on_progress(&running_event);
            }

            let result = match action {
                Action::Delete => driver
                    .destroy(&cancel, &module_source, prior.as_ref())
                    .await
                    .map(|destroyed| WorkerResult::Applied {
                        outputs: HashMap::new(),
                        external_state: ExternalState::default(),
                        logs: destroyed.logs,
                    }),
                _ => driver
                    .apply(&cancel, &module_source, &inputs, prior.as_ref(), action)
                    .await
                    .map(|applied| WorkerResult::Applied {
                        outputs: applied.outputs,
                        external_state: applied.external_state,
                        logs: applied.logs,
                    }),
            };

            let result = match result {
                Ok(applied) => applied,
                Err(DriverError::Cancelled) => WorkerResult::Cancelled,
                Err(e) => WorkerResult::Failed {
                    kind: match e {
                        DriverError::Transient(_) => "DriverTransient",
                        _ => "DriverFatal",
                    },
                    message: e.to_string(),
                    logs: String::new(),
                },
            };
            WorkerDone { id: worker_id, result }
        });
    }

    async fn settle(&mut self, done: WorkerDone) {
        let node = self
            .graph
            .get(&done.id)
            .expect("worker ids come from the graph");
        let change = self
            .plan
            .change_for(&done.id)
            .expect("plan covers every graph node");

        match done.result {
            WorkerResult::Applied {
                outputs,
                external_state,
                logs,
            } => {
                let inputs = match self.render_final(node, change) {
                    Ok(inputs) => inputs,
                    // Upstream outputs cannot regress between claim and
                    // settle; re-render only fails if they did.
                    Err(e) => {
                        self.fail_node(
                            &done.id,
                            "UnresolvedReference",
                            e.to_string(),
                            logs,
                            false,
                        )
                        .await;
                        return;
                    }
                };

                let persist = self
                    .persist_success(node, change.action, inputs, &outputs, external_state)
                    .await;
                if let Err(e) = persist {
                    // The cloud side-effect is real; state is now behind it.
                    // A re-run reconciles through the driver's plan + apply.
                    self.fail_node(
                        &done.id,
                        "StateError",
                        format!(
                            "cloud state is unreconciled with stored state: {}",
                            e
                        ),
                        logs,
                        false,
                    )
                    .await;
                    return;
                }

                match change.action {
                    Action::Create => self.summary.created += 1,
                    Action::Update | Action::Replace => self.summary.updated += 1,
                    Action::Delete => self.summary.deleted += 1,
                    Action::Noop => {}
                }

                self.outputs.insert(done.id.clone(), outputs);
                self.statuses.insert(done.id.clone(), NodeStatus::Completed);
                self.emit(node, NodeStatus::Completed, change.action, "", None, &logs);
                info!(node = %done.id, action = %change.action, "node completed");
                self.complete(&done.id);
            }
            WorkerResult::Failed {
                kind,
                message,
                logs,
            } => {
                self.fail_node(&done.id, kind, message, logs, false).await;
            }
            WorkerResult::Cancelled => {
                self.mark_cancelled(&done.id, "driver call cancelled");
                self.propagate_terminal(&done.id);
            }
        }
    }

    /// A node finished successfully (completed or skipped): unblock its
    /// successors.
    fn complete(&mut self, id: &NodeId) {
        if self.only.is_some() {
            return;
        }
        for successor in self.successors.get(id).cloned().unwrap_or_default() {
            let degree = self
                .in_degree
                .get_mut(&successor)
                .expect("successors are graph nodes");
            *degree -= 1;
            if *degree == 0 {
                self.ready.insert(successor);
            }
        }
    }

    /// A node terminated unsuccessfully: record it against each successor and
    /// unblock them so the cascade resolves in dependency order.
    fn propagate_terminal(&mut self, id: &NodeId) {
        if self.only.is_some() {
            return;
        }
        for successor in self.successors.get(id).cloned().unwrap_or_default() {
            self.failed_deps
                .entry(successor.clone())
                .or_default()
                .push(id.clone());
            let degree = self
                .in_degree
                .get_mut(&successor)
                .expect("successors are graph nodes");
            *degree -= 1;
            if *degree == 0 {
                self.ready.insert(successor);
            }
        }
    }

    async fn fail_node(
        &mut self,
        id: &NodeId,
        kind: &str,
        message: String,
        logs: String,
        cascaded: bool,
    ) {
        let node = self.graph.get(id).expect("failing ids come from the graph");
        let change_action = self.plan.action_for(id).unwrap_or(Action::Update);

        // Root-cause failures leave a durable failed record; cascaded nodes
        // were never attempted and write nothing.
        if !cascaded {
            if let Err(e) = self.persist_failure(node, &message).await {
                warn!(node = %id, error = %e, "failed to persist failure state");
            }
        }

        warn!(node = %id, kind, error = %message, "node failed");
        self.statuses.insert(id.clone(), NodeStatus::Failed);
        let error = ProgressError {
            kind: kind.to_string(),
            message: message.clone(),
        };
        self.emit(
            node,
            NodeStatus::Failed,
            change_action,
            "",
            Some(error),
            &logs,
        );

        if cascaded {
            self.summary.cascaded_failures += 1;
        } else {
            self.summary.errors.push(NodeError {
                node_id: id.to_string(),
                kind: kind.to_string(),
                message,
                logs: tail_lines(&logs, ERROR_LOG_LINES),
                cascaded: false,
            });
        }

        self.propagate_terminal(id);
    }

    async fn cascade_failure(&mut self, id: &NodeId, failed: &[NodeId]) {
        let failed_only: Vec<&NodeId> = failed
            .iter()
            .filter(|dep| self.statuses.get(*dep) == Some(&NodeStatus::Failed))
            .collect();

        if failed_only.is_empty() {
            // Every unsuccessful predecessor was cancelled, not failed.
            self.mark_cancelled(id, "upstream cancelled");
            self.propagate_terminal(id);
            return;
        }

        let message = if let [single] = failed_only.as_slice() {
            format!("dependency {} failed", single)
        } else {
            format!(
                "dependencies failed: {}",
                failed_only
                    .iter()
                    .map(|d| d.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        self.fail_node(id, "DependencyFailed", message, String::new(), true)
            .await;
    }

    fn mark_cancelled(&mut self, id: &NodeId, message: &str) {
        let Some(node) = self.graph.get(id) else {
            return;
        };
        let action = self.plan.action_for(id).unwrap_or(Action::Noop);
        debug!(node = %id, "node cancelled");
        self.statuses.insert(id.clone(), NodeStatus::Cancelled);
        self.emit(node, NodeStatus::Cancelled, action, message, None, "");
    }

    // ── State mutation ────────────────────────────────────────────────────────

    fn record_of(&self, node: &Node) -> Option<&ResourceState> {
        match &node.scope {
            NodeScope::Datacenter => self.working.datacenter.modules.get(&node.name),
            NodeScope::Environment => self.working.environment.modules.get(&node.name),
            NodeScope::Component {
                component,
                instance,
            } => {
                let state = self.working.components.get(component)?;
                let key = node.resource_key();
                match instance {
                    Some(instance) => state.instances.get(instance)?.resources.get(&key),
                    None => state.resources.get(&key),
                }
            }
        }
    }

    async fn persist_success(
        &mut self,
        node: &Node,
        action: Action,
        inputs: Value,
        outputs: &HashMap<String, Value>,
        external_state: ExternalState,
    ) -> Result<(), EngineError> {
        let now = Utc::now();

        if action == Action::Delete {
            self.with_record(node, |records, key| {
                records.remove(&key);
            });
        } else {
            let depends_on: Vec<String> =
                node.depends_on.iter().map(|d| d.to_string()).collect();
            let binding = node.binding.clone();
            let kind = node.kind;
            let name = node.name.clone();
            let outputs = outputs.clone();
            self.with_record(node, move |records, key| {
                let record = records
                    .entry(key)
                    .or_insert_with(|| ResourceState::new(kind, name, binding.driver.clone()));
                record.driver = binding.driver;
                record.module_source = binding.module_source;
                record.depends_on = depends_on;
                record.mark_ready(now, inputs, outputs, external_state);
            });
        }

        self.save_entity(node).await
    }

    async fn persist_failure(&mut self, node: &Node, message: &str) -> Result<(), EngineError> {
        let now = Utc::now();
        let binding = node.binding.clone();
        let kind = node.kind;
        let name = node.name.clone();
        let message = message.to_string();
        self.with_record(node, move |records, key| {
            let record = records
                .entry(key)
                .or_insert_with(|| ResourceState::new(kind, name, binding.driver.clone()));
            record.mark_failed(now, message);
        });
        self.save_entity(node).await
    }

    /// Run `f` against the record map owning this node, creating the
    /// enclosing component entry if needed.
    fn with_record<F>(&mut self, node: &Node, f: F)
    where
        F: FnOnce(&mut BTreeMap<String, ResourceState>, String),
    {
        match &node.scope {
            NodeScope::Datacenter => {
                f(&mut self.working.datacenter.modules, node.name.clone());
                self.working.datacenter.updated_at = Some(Utc::now());
            }
            NodeScope::Environment => {
                f(&mut self.working.environment.modules, node.name.clone());
                self.working.environment.updated_at = Some(Utc::now());
            }
            NodeScope::Component {
                component,
                instance,
            } => {
                let datacenter = self.working.environment.datacenter.clone();
                let environment = self.working.environment.name.clone();
                let state = self
                    .working
                    .components
                    .entry(component.clone())
                    .or_insert_with(|| {
                        ComponentState::new(datacenter, environment, component.clone())
                    });
                let key = node.resource_key();
                match instance {
                    Some(instance) => {
                        let entry = state
                            .instances
                            .entry(instance.clone())
                            .or_insert_with(|| cirro_store::InstanceState {
                                source: None,
                                weight: 0,
                                resources: BTreeMap::new(),
                            });
                        f(&mut entry.resources, key);
                    }
                    None => f(&mut state.resources, key),
                }
                state.updated_at = Some(Utc::now());
                if state.created_at.is_none() {
                    state.created_at = state.updated_at;
                }
            }
        }
    }

    async fn save_entity(&self, node: &Node) -> Result<(), EngineError> {
        match &node.scope {
            NodeScope::Datacenter => {
                self.store.save_datacenter(&self.working.datacenter).await?
            }
            NodeScope::Environment => {
                self.store
                    .save_environment(&self.working.environment)
                    .await?
            }
            NodeScope::Component { component, .. } => {
                let state = self
                    .working
                    .components
                    .get(component)
                    .expect("with_record created the component entry");
                self.store.save_component(state).await?
            }
        }
        Ok(())
    }

    // ── Rendering & events ────────────────────────────────────────────────────

    /// Fill any holes left by the planner from in-memory upstream outputs.
    fn render_final(&self, node: &Node, change: &PlanChange) -> Result<Value, ExprError> {
        if !change.has_holes {
            return Ok(change.rendered_inputs.clone());
        }
        let resolver = ExecutorResolver { run: self, node };
        let (rendered, has_holes) = render_value(&change.rendered_inputs, &resolver)?;
        if has_holes {
            return Err(ExprError::UnknownReference(
                "upstream outputs still unresolved".to_string(),
            ));
        }
        Ok(rendered)
    }

    fn event_prototype(
        &self,
        node: &Node,
        status: NodeStatus,
        action: Action,
    ) -> ProgressEvent {
        let component = node
            .id
            .as_str()
            .split('/')
            .next()
            .filter(|_| matches!(node.scope, NodeScope::Component { .. }))
            .unwrap_or_default()
            .to_string();
        ProgressEvent {
            node_id: node.id.to_string(),
            node_type: node.kind.to_string(),
            node_name: node.name.clone(),
            component,
            status,
            action,
            message: String::new(),
            error: None,
            logs: String::new(),
            run_id: self.run_id,
        }
    }

    fn emit(
        &self,
        node: &Node,
        status: NodeStatus,
        action: Action,
        message: &str,
        error: Option<ProgressError>,
        logs: &str,
    ) {
        let Some(on_progress) = &self.on_progress else {
            return;
        };
        let mut event = self.event_prototype(node, status, action);
        event.message = message.to_string();
        event.error = error;
        event.logs = logs.to_string();
        on_progress(&event);
    }

    fn finish(self) -> ExecutionReport {
        let cancelled = self.cancel.is_cancelled();
        ExecutionReport {
            statuses: self.statuses,
            summary: self.summary,
            cancelled,
            working: self.working,
        }
    }
}

// ── Executor-time reference resolution ────────────────────────────────────────

/// Resolves the holes the planner deferred: upstream outputs now observed
/// in-memory, falling back to recorded state.
struct ExecutorResolver<'a> {
    run: &'a Run<'a>,
    node: &'a Node,
}

impl ExecutorResolver<'_> {
    fn output_of(&self, id: &NodeId, field_path: &[String]) -> Option<Value> {
        let from_memory = self
            .run
            .outputs
            .get(id)
            .and_then(|outputs| outputs.get(field_path.first()?));
        let from_state = || {
            self.run
                .graph
                .get(id)
                .and_then(|node| self.run.record_of(node))
                .and_then(|record| record.outputs.get(field_path.first()?))
        };
        let mut current = from_memory.or_else(from_state)?;
        for segment in &field_path[1..] {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }
}

impl RefResolver for ExecutorResolver<'_> {
    fn resolve(&self, path: &[String]) -> Result<Resolved, ExprError> {
        match path {
            [head, kind, name, outputs, field @ ..]
                if head == "resources" && outputs == "outputs" =>
            {
                let kind: ResourceKind = kind
                    .parse()
                    .map_err(|_| ExprError::UnknownReference(path.join(".")))?;
                let virtual_component = self
                    .node
                    .id
                    .as_str()
                    .split('/')
                    .next()
                    .unwrap_or_default();
                let target = NodeId::for_resource(virtual_component, kind, name);
                self.output_of(&target, field)
                    .map(Resolved::Value)
                    .ok_or_else(|| ExprError::UnknownReference(path.join(".")))
            }
            [head, component, outputs, field @ ..]
                if head == "deps" && outputs == "outputs" =>
            {
                // Flat merge of the dependency component's node outputs, id
                // order, later keys winning.
                let prefix = format!("{}/", component);
                let mut found = None;
                for id in self.run.graph.ids() {
                    if id.as_str().starts_with(&prefix)
                        || id.as_str().starts_with(&format!("{}@", component))
                    {
                        if let Some(value) = self.output_of(id, field) {
                            found = Some(value);
                        }
                    }
                }
                found
                    .map(Resolved::Value)
                    .ok_or_else(|| ExprError::UnknownReference(path.join(".")))
            }
            _ => Err(ExprError::UnknownReference(path.join("."))),
        }
    }
}

fn tail_lines(log: &str, n: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
