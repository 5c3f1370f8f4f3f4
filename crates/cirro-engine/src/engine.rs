//! The engine facade: Deploy, Destroy, ApplyNode, and Import compose the
//! graph builder, planner, and executor end to end.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use cirro_domain::{
    Component, ComponentName, Datacenter, DatacenterName, DomainError, EnvironmentName,
};
use cirro_driver::{DriverRegistry, ImportMapping};
use cirro_graph::builder::{self, BuildRequest, PriorState};
use cirro_graph::expr::Template;
use cirro_graph::NodeId;
use cirro_store::{
    ComponentState, DatacenterState, EnvironmentState, ResourceState, StateStore,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::executor::{ExecuteRequest, ExecutionReport, Executor, WorkingSet};
use crate::planner::{self, Plan, PlanRequest};
use crate::report::{DeployResult, NodeStatus, OnPlan, OnProgress, ResolvedDependency};

const DEFAULT_PARALLELISM: usize = 10;

/// Cancellation and progress callbacks shared by every operation.
#[derive(Clone, Default)]
pub struct OperationSignals {
    pub cancel: CancellationToken,
    pub on_plan: Option<OnPlan>,
    pub on_progress: Option<OnProgress>,
}

pub struct DeployRequest {
    pub datacenter: Datacenter,
    pub environment: EnvironmentName,
    pub components: Vec<Component>,
    /// Caller-provided variable values per component; declaration defaults
    /// fill the gaps.
    pub variables: HashMap<ComponentName, HashMap<String, String>>,
    /// Concurrent driver call cap. Zero means the default of 10.
    pub parallelism: usize,
}

pub struct DestroyRequest {
    pub datacenter: DatacenterName,
    pub environment: EnvironmentName,
    pub parallelism: usize,
}

pub struct ImportRequest {
    pub datacenter: Datacenter,
    pub environment: EnvironmentName,
    pub components: Vec<Component>,
    pub variables: HashMap<ComponentName, HashMap<String, String>>,
    pub component: ComponentName,
    /// Type-qualified resource key, `kind.name`.
    pub resource: String,
    pub mappings: Vec<ImportMapping>,
    /// Re-plan after adopting state to surface drift.
    pub replan: bool,
}

#[derive(Debug)]
pub struct ImportOutcome {
    pub outputs: HashMap<String, Value>,
    pub plan: Option<Plan>,
}

pub struct Engine {
    store: StateStore,
    registry: Arc<DriverRegistry>,
}

impl Engine {
    pub fn new(store: StateStore, registry: Arc<DriverRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Deploy ────────────────────────────────────────────────────────────────

    pub async fn deploy(
        &self,
        req: DeployRequest,
        signals: OperationSignals,
    ) -> Result<DeployResult, EngineError> {
        let run_id = Uuid::new_v4();
        info!(
            datacenter = %req.datacenter.name,
            environment = %req.environment,
            components = req.components.len(),
            %run_id,
            "starting deploy"
        );

        let prior = self
            .load_prior(&req.datacenter.name, &req.environment)
            .await?;
        let variables = merge_variable_defaults(&req.components, &req.variables)?;

        let graph = builder::build(&BuildRequest {
            datacenter: &req.datacenter,
            environment: &req.environment,
            components: &req.components,
            prior: prior.as_refs(),
        })?;

        let plan = planner::plan(&PlanRequest {
            graph: &graph,
            prior: &prior.as_refs(),
            registry: &self.registry,
            variables: &variables,
            datacenter: &req.datacenter.name,
            environment: &req.environment,
            cancel: &signals.cancel,
        })
        .await?;
        if let Some(on_plan) = &signals.on_plan {
            on_plan(&plan);
        }

        let working = prior.into_working(
            &req.datacenter.name,
            &req.environment,
            Some(&req.components),
        );
        let executor = Executor::new(self.store.clone(), self.registry.clone());
        let report = executor
            .execute(ExecuteRequest {
                graph: &graph,
                plan: &plan,
                working,
                parallelism: effective_parallelism(req.parallelism),
                cancel: signals.cancel.clone(),
                on_progress: signals.on_progress.clone(),
                run_id,
                only: None,
            })
            .await?;

        let target: Vec<&ComponentName> = req.components.iter().map(|c| &c.name).collect();
        self.finalize_environment(&report, &target, run_id).await?;

        if report.cancelled {
            return Err(EngineError::Cancelled(status_summary(&report)));
        }

        let success =
            report.summary.errors.is_empty() && report.summary.cascaded_failures == 0;
        info!(%run_id, success, "deploy finished");
        Ok(DeployResult {
            success,
            run_id,
            execution: report.summary,
        })
    }

    // ── Destroy ───────────────────────────────────────────────────────────────

    /// Tear down every component and environment module recorded in the
    /// environment. Datacenter root modules are shared across environments
    /// and stay.
    pub async fn destroy(
        &self,
        req: DestroyRequest,
        signals: OperationSignals,
    ) -> Result<DeployResult, EngineError> {
        let run_id = Uuid::new_v4();
        let prior = self.load_prior(&req.datacenter, &req.environment).await?;
        if prior.environment.is_none() && prior.components.is_empty() {
            return Err(EngineError::UnknownEnvironment(req.environment.clone()));
        }
        info!(
            datacenter = %req.datacenter,
            environment = %req.environment,
            %run_id,
            "starting destroy"
        );

        // Environment-scoped teardown: exclude datacenter root modules from
        // the delete graph.
        let refs = PriorState {
            datacenter: None,
            environment: prior.environment.as_ref(),
            components: prior.components.values().collect(),
        };
        let graph = builder::build_delete_graph(&refs);

        let variables = HashMap::new();
        let plan = planner::plan(&PlanRequest {
            graph: &graph,
            prior: &refs,
            registry: &self.registry,
            variables: &variables,
            datacenter: &req.datacenter,
            environment: &req.environment,
            cancel: &signals.cancel,
        })
        .await?;
        if let Some(on_plan) = &signals.on_plan {
            on_plan(&plan);
        }

        let working = prior.into_working(&req.datacenter, &req.environment, None);
        let executor = Executor::new(self.store.clone(), self.registry.clone());
        let report = executor
            .execute(ExecuteRequest {
                graph: &graph,
                plan: &plan,
                working,
                parallelism: effective_parallelism(req.parallelism),
                cancel: signals.cancel.clone(),
                on_progress: signals.on_progress.clone(),
                run_id,
                only: None,
            })
            .await?;

        let success =
            report.summary.errors.is_empty() && report.summary.cascaded_failures == 0;
        if success && !report.cancelled {
            // Empty entities disappear rather than lingering as husks.
            for (name, state) in &report.working.components {
                debug_assert!(state.resources.is_empty());
                self.store
                    .delete_component(&req.datacenter, &req.environment, name)
                    .await?;
                debug!(component = %name, "component state removed");
            }
            self.store
                .delete_environment(&req.datacenter, &req.environment)
                .await?;
            info!(environment = %req.environment, "environment state removed");
        } else {
            self.finalize_environment(&report, &[], run_id).await?;
        }

        if report.cancelled {
            return Err(EngineError::Cancelled(status_summary(&report)));
        }
        Ok(DeployResult {
            success,
            run_id,
            execution: report.summary,
        })
    }

    // ── Apply a single node ───────────────────────────────────────────────────

    /// Plan the full graph for context, then execute only `node_id`,
    /// resolving upstream outputs from recorded state.
    pub async fn apply_node(
        &self,
        req: DeployRequest,
        node_id: NodeId,
        signals: OperationSignals,
    ) -> Result<DeployResult, EngineError> {
        let run_id = Uuid::new_v4();
        let prior = self
            .load_prior(&req.datacenter.name, &req.environment)
            .await?;
        let variables = merge_variable_defaults(&req.components, &req.variables)?;

        let graph = builder::build(&BuildRequest {
            datacenter: &req.datacenter,
            environment: &req.environment,
            components: &req.components,
            prior: prior.as_refs(),
        })?;
        if !graph.contains(&node_id) {
            return Err(EngineError::UnknownNode(node_id.to_string()));
        }

        let plan = planner::plan(&PlanRequest {
            graph: &graph,
            prior: &prior.as_refs(),
            registry: &self.registry,
            variables: &variables,
            datacenter: &req.datacenter.name,
            environment: &req.environment,
            cancel: &signals.cancel,
        })
        .await?;
        if let Some(on_plan) = &signals.on_plan {
            on_plan(&plan);
        }

        let working = prior.into_working(
            &req.datacenter.name,
            &req.environment,
            Some(&req.components),
        );
        let executor = Executor::new(self.store.clone(), self.registry.clone());
        let report = executor
            .execute(ExecuteRequest {
                graph: &graph,
                plan: &plan,
                working,
                parallelism: 1,
                cancel: signals.cancel.clone(),
                on_progress: signals.on_progress.clone(),
                run_id,
                only: Some(node_id),
            })
            .await?;

        let target: Vec<&ComponentName> = req.components.iter().map(|c| &c.name).collect();
        self.finalize_environment(&report, &target, run_id).await?;

        if report.cancelled {
            return Err(EngineError::Cancelled(status_summary(&report)));
        }
        Ok(DeployResult {
            success: report.summary.errors.is_empty(),
            run_id,
            execution: report.summary,
        })
    }

    // ── Import ────────────────────────────────────────────────────────────────

    /// Adopt existing cloud resources into a node's external state, then
    /// optionally re-plan to surface drift.
    pub async fn import(
        &self,
        req: ImportRequest,
        signals: OperationSignals,
    ) -> Result<ImportOutcome, EngineError> {
        let prior = self
            .load_prior(&req.datacenter.name, &req.environment)
            .await?;
        let variables = merge_variable_defaults(&req.components, &req.variables)?;

        let graph = builder::build(&BuildRequest {
            datacenter: &req.datacenter,
            environment: &req.environment,
            components: &req.components,
            prior: prior.as_refs(),
        })?;
        let node_id = NodeId::new(format!(
            "{}/{}",
            req.component,
            req.resource.replacen('.', "/", 1)
        ));
        let Some(node) = graph.get(&node_id) else {
            return Err(EngineError::UnknownNode(node_id.to_string()));
        };

        let plan = planner::plan(&PlanRequest {
            graph: &graph,
            prior: &prior.as_refs(),
            registry: &self.registry,
            variables: &variables,
            datacenter: &req.datacenter.name,
            environment: &req.environment,
            cancel: &signals.cancel,
        })
        .await?;
        let change = plan
            .change_for(&node_id)
            .expect("plan covers every graph node");

        let driver = self.registry.create(&node.binding.driver)?;
        let imported = driver
            .import(&signals.cancel, &node.binding.module_source, &req.mappings)
            .await?;
        info!(node = %node_id, "imported external state");

        // Record the rendered inputs alongside the adopted state so an
        // in-sync import re-plans to noop.
        let mut working =
            prior.into_working(&req.datacenter.name, &req.environment, Some(&req.components));
        let state = working
            .components
            .entry(req.component.clone())
            .or_insert_with(|| {
                ComponentState::new(
                    req.datacenter.name.clone(),
                    req.environment.clone(),
                    req.component.clone(),
                )
            });
        let record = state
            .resources
            .entry(req.resource.clone())
            .or_insert_with(|| {
                ResourceState::new(node.kind, node.name.clone(), node.binding.driver.clone())
            });
        record.driver = node.binding.driver.clone();
        record.module_source = node.binding.module_source.clone();
        record.mark_ready(
            Utc::now(),
            change.rendered_inputs.clone(),
            imported.outputs.clone(),
            imported.external_state,
        );
        if change.has_holes {
            // Holes mean upstream outputs are unknown; the digest cannot
            // claim equality with a future render.
            record.inputs_digest = String::new();
        }
        self.store.save_component(state).await?;

        let plan = if req.replan {
            let prior = self
                .load_prior(&req.datacenter.name, &req.environment)
                .await?;
            Some(
                planner::plan(&PlanRequest {
                    graph: &graph,
                    prior: &prior.as_refs(),
                    registry: &self.registry,
                    variables: &variables,
                    datacenter: &req.datacenter.name,
                    environment: &req.environment,
                    cancel: &signals.cancel,
                })
                .await?,
            )
        } else {
            None
        };

        Ok(ImportOutcome {
            outputs: imported.outputs,
            plan,
        })
    }

    // ── Dependency resolution ─────────────────────────────────────────────────

    /// Which declared component dependencies the target environment does not
    /// satisfy. The caller fetches them, gathers missing variables, and
    /// re-enters with the dependency merged into the component set.
    pub async fn resolve_dependencies(
        &self,
        datacenter: &DatacenterName,
        environment: &EnvironmentName,
        components: &[Component],
        variables: &HashMap<ComponentName, HashMap<String, String>>,
    ) -> Result<Vec<ResolvedDependency>, EngineError> {
        let deployed = self.store.list_components(datacenter, environment).await?;
        let target: Vec<&ComponentName> = components.iter().map(|c| &c.name).collect();

        let mut missing = Vec::new();
        for component in components {
            for dependency in &component.dependencies {
                if target.contains(&&dependency.component)
                    || deployed.contains(&dependency.component)
                {
                    continue;
                }
                let provided = variables.get(&component.name);
                let mut missing_variables = Vec::new();
                for value in dependency.variables.values() {
                    for path in template_refs(value)? {
                        if let [head, name] = path.as_slice() {
                            if head == "variables"
                                && provided.map_or(true, |vars| !vars.contains_key(name))
                            {
                                missing_variables.push(name.clone());
                            }
                        }
                    }
                }
                missing_variables.sort();
                missing_variables.dedup();
                missing.push(ResolvedDependency {
                    name: dependency.component.clone(),
                    local_path: dependency.local_path.clone(),
                    oci_ref: dependency.oci_ref.clone(),
                    required_by: component.name.clone(),
                    missing_variables,
                });
            }
        }
        Ok(missing)
    }

    // ── Progressive delivery ──────────────────────────────────────────────────

    /// Shift all traffic to one instance. Mutates state directly; no executor
    /// involvement.
    pub async fn promote(
        &self,
        datacenter: &DatacenterName,
        environment: &EnvironmentName,
        component: &ComponentName,
        instance: &str,
    ) -> Result<(), EngineError> {
        let mut weights = HashMap::new();
        weights.insert(instance.to_string(), 100u8);
        self.set_instance_weights(datacenter, environment, component, weights, true)
            .await
    }

    /// Set instance traffic weights explicitly. Weights must cover existing
    /// instances and sum to 100; `zero_others` fills unmentioned instances
    /// with zero.
    pub async fn set_instance_weights(
        &self,
        datacenter: &DatacenterName,
        environment: &EnvironmentName,
        component: &ComponentName,
        weights: HashMap<String, u8>,
        zero_others: bool,
    ) -> Result<(), EngineError> {
        let mut state = self
            .store
            .get_component(datacenter, environment, component)
            .await?
            .ok_or_else(|| EngineError::UnknownComponent(component.clone()))?;

        for name in weights.keys() {
            if !state.instances.contains_key(name) {
                return Err(EngineError::Config(DomainError::InvalidConfig(format!(
                    "component '{}' has no instance '{}'",
                    component, name
                ))));
            }
        }
        let total: u32 = state
            .instances
            .iter()
            .map(|(name, instance)| {
                u32::from(weights.get(name).copied().unwrap_or(if zero_others {
                    0
                } else {
                    instance.weight
                }))
            })
            .sum();
        if total != 100 {
            return Err(EngineError::Config(DomainError::InvalidConfig(format!(
                "instance weights for '{}' sum to {}, expected 100",
                component, total
            ))));
        }

        for (name, instance) in state.instances.iter_mut() {
            match weights.get(name) {
                Some(weight) => instance.weight = *weight,
                None if zero_others => instance.weight = 0,
                None => {}
            }
        }
        state.updated_at = Some(Utc::now());
        self.store.save_component(&state).await?;
        info!(component = %component, "instance weights updated");
        Ok(())
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// Flattened resource records across every component in an environment.
    pub async fn list_resources(
        &self,
        datacenter: &DatacenterName,
        environment: &EnvironmentName,
    ) -> Result<Vec<(ComponentName, ResourceState)>, EngineError> {
        let mut out = Vec::new();
        for name in self.store.list_components(datacenter, environment).await? {
            if let Some(state) = self
                .store
                .get_component(datacenter, environment, &name)
                .await?
            {
                for (_, record) in state.all_resources() {
                    out.push((name.clone(), record.clone()));
                }
            }
        }
        Ok(out)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn load_prior(
        &self,
        datacenter: &DatacenterName,
        environment: &EnvironmentName,
    ) -> Result<LoadedPrior, EngineError> {
        let dc_state = self.store.get_datacenter(datacenter).await?;
        let env_state = self.store.get_environment(datacenter, environment).await?;
        let mut components = BTreeMap::new();
        for name in self.store.list_components(datacenter, environment).await? {
            if let Some(state) = self
                .store
                .get_component(datacenter, environment, &name)
                .await?
            {
                components.insert(name, state);
            }
        }
        Ok(LoadedPrior {
            datacenter: dc_state,
            environment: env_state,
            components,
        })
    }

    /// Stamp the environment after an execution: component membership, run
    /// id, timestamps; prune component states emptied by deletes.
    async fn finalize_environment(
        &self,
        report: &ExecutionReport,
        target: &[&ComponentName],
        run_id: Uuid,
    ) -> Result<(), EngineError> {
        let mut environment = report.working.environment.clone();
        let datacenter = environment.datacenter.clone();
        let env_name = environment.name.clone();

        let mut remaining = Vec::new();
        for (name, state) in &report.working.components {
            let empty = state.resources.is_empty()
                && state.instances.values().all(|i| i.resources.is_empty());
            if empty && !target.contains(&name) {
                self.store
                    .delete_component(&datacenter, &env_name, name)
                    .await?;
                debug!(component = %name, "pruned empty component state");
            } else {
                remaining.push(name.clone());
            }
        }

        environment.components = remaining;
        environment.last_run = Some(run_id);
        let now = Utc::now();
        if environment.created_at.is_none() {
            environment.created_at = Some(now);
        }
        environment.updated_at = Some(now);
        self.store.save_environment(&environment).await?;
        Ok(())
    }
}

// ── Prior state plumbing ──────────────────────────────────────────────────────

struct LoadedPrior {
    datacenter: Option<DatacenterState>,
    environment: Option<EnvironmentState>,
    components: BTreeMap<ComponentName, ComponentState>,
}

impl LoadedPrior {
    fn as_refs(&self) -> PriorState<'_> {
        PriorState {
            datacenter: self.datacenter.as_ref(),
            environment: self.environment.as_ref(),
            components: self.components.values().collect(),
        }
    }

    /// Convert into the executor's working set, stamping target component
    /// sources and declared instance weights.
    fn into_working(
        self,
        datacenter: &DatacenterName,
        environment: &EnvironmentName,
        target: Option<&[Component]>,
    ) -> WorkingSet {
        let mut components = self.components;
        if let Some(target) = target {
            for component in target {
                let state = components.entry(component.name.clone()).or_insert_with(|| {
                    ComponentState::new(
                        datacenter.clone(),
                        environment.clone(),
                        component.name.clone(),
                    )
                });
                state.source = component.source.clone();
                for instance in &component.instances {
                    let entry = state
                        .instances
                        .entry(instance.name.clone())
                        .or_insert_with(|| cirro_store::InstanceState {
                            source: None,
                            weight: 0,
                            resources: BTreeMap::new(),
                        });
                    entry.source = instance.source.clone();
                    entry.weight = instance.weight;
                }
            }
        }

        WorkingSet {
            datacenter: self
                .datacenter
                .unwrap_or_else(|| DatacenterState::new(datacenter.clone())),
            environment: self
                .environment
                .unwrap_or_else(|| EnvironmentState::new(datacenter.clone(), environment.clone())),
            components,
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn effective_parallelism(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_PARALLELISM
    } else {
        requested
    }
}

/// Merge declaration defaults under caller-provided values, per component.
fn merge_variable_defaults(
    components: &[Component],
    provided: &HashMap<ComponentName, HashMap<String, String>>,
) -> Result<HashMap<ComponentName, HashMap<String, String>>, EngineError> {
    let mut merged: HashMap<ComponentName, HashMap<String, String>> = HashMap::new();
    for component in components {
        let mut values: HashMap<String, String> = component
            .variables
            .iter()
            .filter_map(|v| v.default.clone().map(|d| (v.name.clone(), d)))
            .collect();
        if let Some(overrides) = provided.get(&component.name) {
            values.extend(overrides.clone());
        }
        merged.insert(component.name.clone(), values);
    }
    Ok(merged)
}

fn template_refs(value: &str) -> Result<Vec<Vec<String>>, EngineError> {
    let mut refs = Vec::new();
    if value.contains("${") {
        let template = Template::parse(value).map_err(|e| {
            EngineError::Config(DomainError::InvalidConfig(format!(
                "invalid expression in dependency variables: {}",
                e
            )))
        })?;
        template.refs(&mut refs);
    }
    Ok(refs)
}

fn status_summary(report: &ExecutionReport) -> String {
    let mut counts: BTreeMap<NodeStatus, usize> = BTreeMap::new();
    for status in report.statuses.values() {
        *counts.entry(*status).or_default() += 1;
    }
    counts
        .iter()
        .map(|(status, count)| format!("{}: {}", status, count))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirro_domain::VariableSpec;

    #[test]
    fn defaults_fill_missing_variables() {
        let components = vec![Component {
            name: ComponentName::new("api"),
            source: None,
            variables: vec![
                VariableSpec {
                    name: "region".into(),
                    default: Some("us-east-1".into()),
                },
                VariableSpec {
                    name: "replicas".into(),
                    default: Some("2".into()),
                },
            ],
            dependencies: vec![],
            resources: vec![],
            instances: vec![],
        }];
        let mut provided = HashMap::new();
        provided.insert(ComponentName::new("api"), {
            let mut m = HashMap::new();
            m.insert("replicas".to_string(), "5".to_string());
            m
        });

        let merged = merge_variable_defaults(&components, &provided).unwrap();
        let api = &merged[&ComponentName::new("api")];
        assert_eq!(api["region"], "us-east-1");
        assert_eq!(api["replicas"], "5");
    }

    #[test]
    fn template_refs_extracts_variable_names() {
        let refs = template_refs("${variables.db_password}").unwrap();
        assert_eq!(refs, vec![vec!["variables".to_string(), "db_password".to_string()]]);
        assert!(template_refs("plain value").unwrap().is_empty());
    }
}
