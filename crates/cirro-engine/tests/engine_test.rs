//! End-to-end engine scenarios over an in-memory store and a scripted driver.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cirro_domain::{
    Action, Component, ComponentName, Datacenter, DatacenterName, EnvironmentName,
    HookVariant, ModuleSpec, ResourceKind, ResourceSpec,
};
use cirro_driver::{
    ApplyResult, DestroyResult, Driver, DriverError, DriverMetadata, DriverRegistry,
    ImportMapping, ImportResult, PlanResult,
};
use cirro_engine::{
    DeployRequest, DestroyRequest, Engine, ImportRequest, NodeStatus, OperationSignals,
    Plan, ProgressEvent,
};
use cirro_store::{input_digest, ExternalState, MemoryBackend, StateStore};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// ── Scripted driver ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Call {
    ApplyStart { name: String },
    ApplyEnd { name: String, inputs: Value },
    Destroy { name: String },
}

#[derive(Default)]
struct Script {
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Script {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn apply_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::ApplyEnd { .. }))
            .count()
    }
}

/// Driver whose behavior is scripted through node inputs:
/// `fail` makes apply fail, `sleep_ms` makes it linger (cancellable).
/// Outputs are derived from the rendered inputs so replaces change them.
struct FakeDriver {
    script: Arc<Script>,
}

fn node_name(inputs: &Value) -> String {
    inputs
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unnamed")
        .to_string()
}

fn fake_outputs(inputs: &Value) -> HashMap<String, Value> {
    let digest = input_digest(inputs);
    let mut outputs = HashMap::new();
    outputs.insert(
        "url".to_string(),
        json!(format!("fake://{}-{}", node_name(inputs), &digest[..8])),
    );
    outputs
}

fn fake_external(inputs: &Value) -> ExternalState {
    ExternalState::new(
        serde_json::to_vec(&json!({"digest": input_digest(inputs)})).unwrap(),
    )
}

fn external_digest(prior: Option<&ExternalState>) -> Option<Value> {
    let prior = prior.filter(|p| !p.is_empty())?;
    serde_json::from_slice::<Value>(prior.as_bytes()).ok()
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            immutable_inputs: vec!["type".to_string()],
            retry: Default::default(),
        }
    }

    async fn plan(
        &self,
        _cancel: &CancellationToken,
        _module_source: &Path,
        inputs: &Value,
        prior: Option<&ExternalState>,
    ) -> Result<PlanResult, DriverError> {
        let action = match external_digest(prior) {
            None => Action::Create,
            Some(state) => {
                let matches = state["digest"] == json!(input_digest(inputs))
                    || state["imported"] == json!(true);
                if matches {
                    Action::Noop
                } else {
                    Action::Update
                }
            }
        };
        Ok(PlanResult {
            action,
            diff: String::new(),
            estimated_outputs: None,
        })
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        _module_source: &Path,
        inputs: &Value,
        _prior: Option<&ExternalState>,
        _action: Action,
    ) -> Result<ApplyResult, DriverError> {
        let name = node_name(inputs);
        let active = self.script.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_active.fetch_max(active, Ordering::SeqCst);
        self.script
            .calls
            .lock()
            .unwrap()
            .push(Call::ApplyStart { name: name.clone() });

        let result = async {
            if let Some(ms) = inputs.get("sleep_ms").and_then(Value::as_u64) {
                tokio::select! {
                    () = cancel.cancelled() => return Err(DriverError::Cancelled),
                    () = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
            if let Some(reason) = inputs.get("fail").and_then(Value::as_str) {
                return Err(DriverError::Fatal(reason.to_string()));
            }
            Ok(ApplyResult {
                outputs: fake_outputs(inputs),
                external_state: fake_external(inputs),
                logs: format!("applied {}\n", name),
            })
        }
        .await;

        self.script.active.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.script.calls.lock().unwrap().push(Call::ApplyEnd {
                name,
                inputs: inputs.clone(),
            });
        }
        result
    }

    async fn destroy(
        &self,
        _cancel: &CancellationToken,
        _module_source: &Path,
        prior: Option<&ExternalState>,
    ) -> Result<DestroyResult, DriverError> {
        let name = external_digest(prior)
            .map(|_| "recorded".to_string())
            .unwrap_or_else(|| "absent".to_string());
        self.script.calls.lock().unwrap().push(Call::Destroy { name });
        Ok(DestroyResult { logs: String::new() })
    }

    async fn import(
        &self,
        _cancel: &CancellationToken,
        _module_source: &Path,
        mappings: &[ImportMapping],
    ) -> Result<ImportResult, DriverError> {
        let mut outputs = HashMap::new();
        if let Some(mapping) = mappings.first() {
            outputs.insert("url".to_string(), json!(mapping.cloud_id));
        }
        Ok(ImportResult {
            outputs,
            external_state: ExternalState::new(
                serde_json::to_vec(&json!({"imported": true})).unwrap(),
            ),
            logs: String::new(),
        })
    }

    fn discover_addresses(&self, _module_source: &Path) -> Result<Vec<String>, DriverError> {
        Ok(vec!["fake".to_string()])
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

struct Harness {
    engine: Engine,
    script: Arc<Script>,
    events: Arc<Mutex<Vec<ProgressEvent>>>,
    plans: Arc<Mutex<Vec<Plan>>>,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let script = Arc::new(Script::default());
        let mut registry = DriverRegistry::new();
        let for_fake = script.clone();
        registry.register("fake", move || {
            Arc::new(FakeDriver {
                script: for_fake.clone(),
            })
        });
        let for_other = script.clone();
        registry.register("fake2", move || {
            Arc::new(FakeDriver {
                script: for_other.clone(),
            })
        });

        let store = StateStore::new(Arc::new(MemoryBackend::new()));
        Self {
            engine: Engine::new(store, Arc::new(registry)),
            script,
            events: Arc::new(Mutex::new(Vec::new())),
            plans: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn signals(&self) -> OperationSignals {
        self.signals_with(CancellationToken::new())
    }

    fn signals_with(&self, cancel: CancellationToken) -> OperationSignals {
        let events = self.events.clone();
        let plans = self.plans.clone();
        OperationSignals {
            cancel,
            on_plan: Some(Arc::new(move |plan: &Plan| {
                plans.lock().unwrap().push(plan.clone());
            })),
            on_progress: Some(Arc::new(move |event: &ProgressEvent| {
                events.lock().unwrap().push(event.clone());
            })),
        }
    }

    fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    fn last_plan(&self) -> Plan {
        self.plans.lock().unwrap().last().unwrap().clone()
    }
}

fn datacenter(kinds: &[ResourceKind]) -> Datacenter {
    let mut hooks = HashMap::new();
    for kind in kinds {
        hooks.insert(
            *kind,
            vec![HookVariant {
                when: None,
                modules: vec![ModuleSpec {
                    name: "default".into(),
                    driver: "fake".into(),
                    source: "/modules/fake".into(),
                    inputs: json!({}),
                }],
            }],
        );
    }
    Datacenter {
        name: DatacenterName::new("dc1"),
        hooks,
        modules: vec![],
        environment_modules: vec![],
    }
}

fn component(name: &str, resources: Vec<ResourceSpec>) -> Component {
    Component {
        name: ComponentName::new(name),
        source: Some("v1".into()),
        variables: vec![],
        dependencies: vec![],
        resources,
        instances: vec![],
    }
}

fn resource(kind: ResourceKind, name: &str, inputs: Value) -> ResourceSpec {
    ResourceSpec {
        kind,
        name: name.into(),
        inputs,
    }
}

fn deploy_request(dc: Datacenter, components: Vec<Component>) -> DeployRequest {
    DeployRequest {
        datacenter: dc,
        environment: EnvironmentName::new("prod"),
        components,
        variables: HashMap::new(),
        parallelism: 4,
    }
}

fn linear_components() -> Vec<Component> {
    vec![component(
        "api",
        vec![
            resource(ResourceKind::Database, "main", json!({"name": "main"})),
            resource(
                ResourceKind::Deployment,
                "api",
                json!({
                    "name": "api",
                    "env": {"DATABASE_URL": "${resources.database.main.outputs.url}"},
                }),
            ),
        ],
    )]
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn linear_dependency_orders_applies_and_propagates_outputs() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);

    let result = h
        .engine
        .deploy(deploy_request(dc, linear_components()), h.signals())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.execution.created, 2);

    // Plan orders the database before the deployment.
    let plan = h.last_plan();
    let ids: Vec<&str> = plan.changes.iter().map(|c| c.node.id.as_str()).collect();
    assert_eq!(ids, vec!["api/database/main", "api/deployment/api"]);
    assert!(plan.changes.iter().all(|c| c.action == Action::Create));

    // The deployment's apply starts only after the database's returns, and
    // its rendered input carries the database's actual output.
    let calls = h.script.calls();
    let db_end = calls
        .iter()
        .position(|c| matches!(c, Call::ApplyEnd { name, .. } if name == "main"))
        .unwrap();
    let api_start = calls
        .iter()
        .position(|c| matches!(c, Call::ApplyStart { name } if name == "api"))
        .unwrap();
    assert!(db_end < api_start, "apply order violated: {:?}", calls);

    let db_inputs = calls.iter().find_map(|c| match c {
        Call::ApplyEnd { name, inputs } if name == "main" => Some(inputs.clone()),
        _ => None,
    });
    let expected_url = fake_outputs(&db_inputs.unwrap())["url"].clone();
    let api_inputs = calls
        .iter()
        .find_map(|c| match c {
            Call::ApplyEnd { name, inputs } if name == "api" => Some(inputs.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(api_inputs["env"]["DATABASE_URL"], expected_url);
}

#[tokio::test]
async fn fan_out_runs_concurrently_after_shared_dependency() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);
    let components = vec![component(
        "api",
        vec![
            resource(ResourceKind::Database, "main", json!({"name": "main"})),
            resource(
                ResourceKind::Deployment,
                "api",
                json!({
                    "name": "api",
                    "sleep_ms": 80,
                    "db": "${resources.database.main.outputs.url}",
                }),
            ),
            resource(
                ResourceKind::Deployment,
                "worker",
                json!({
                    "name": "worker",
                    "sleep_ms": 80,
                    "db": "${resources.database.main.outputs.url}",
                }),
            ),
        ],
    )];

    let result = h
        .engine
        .deploy(deploy_request(dc, components), h.signals())
        .await
        .unwrap();
    assert!(result.success);

    let calls = h.script.calls();
    let db_end = calls
        .iter()
        .position(|c| matches!(c, Call::ApplyEnd { name, .. } if name == "main"))
        .unwrap();
    for dependent in ["api", "worker"] {
        let start = calls
            .iter()
            .position(|c| matches!(c, Call::ApplyStart { name } if name == dependent))
            .unwrap();
        assert!(db_end < start);
    }
    assert!(
        h.script.max_active.load(Ordering::SeqCst) >= 2,
        "dependents should overlap"
    );
}

#[tokio::test]
async fn failure_cascades_to_dependents_without_writing_their_state() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Bucket, ResourceKind::Deployment]);
    let components = vec![component(
        "site",
        vec![
            resource(
                ResourceKind::Bucket,
                "assets",
                json!({"name": "assets", "fail": "quota exceeded"}),
            ),
            resource(
                ResourceKind::Deployment,
                "web",
                json!({"name": "web", "cdn": "${resources.bucket.assets.outputs.url}"}),
            ),
        ],
    )];

    let result = h
        .engine
        .deploy(deploy_request(dc, components), h.signals())
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.execution.errors.len(), 1);
    assert_eq!(result.execution.errors[0].node_id, "site/bucket/assets");
    assert_eq!(result.execution.cascaded_failures, 1);

    let web_failure = h
        .events()
        .into_iter()
        .find(|e| e.node_id == "site/deployment/web" && e.status == NodeStatus::Failed)
        .unwrap();
    assert_eq!(
        web_failure.error.unwrap().message,
        "dependency site/bucket/assets failed"
    );

    // The cascaded node was never attempted and has no state record.
    let resources = h
        .engine
        .list_resources(&DatacenterName::new("dc1"), &EnvironmentName::new("prod"))
        .await
        .unwrap();
    assert!(!resources.iter().any(|(_, r)| r.name == "web"));
}

#[tokio::test]
async fn cancellation_drains_quickly_and_marks_nodes() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Deployment]);
    let components = vec![
        component(
            "a",
            vec![resource(
                ResourceKind::Deployment,
                "slow",
                json!({"name": "a-slow", "sleep_ms": 5000}),
            )],
        ),
        component(
            "b",
            vec![resource(
                ResourceKind::Deployment,
                "slow",
                json!({"name": "b-slow", "sleep_ms": 5000}),
            )],
        ),
    ];

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = h
        .engine
        .deploy(deploy_request(dc, components), h.signals_with(cancel))
        .await
        .unwrap_err();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "cancellation should not wait for the full sleep"
    );
    assert!(err.to_string().contains("cancelled"), "{}", err);

    let events = h.events();
    let terminal: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| e.status != NodeStatus::Running)
        .collect();
    assert_eq!(terminal.len(), 2);
    assert!(terminal.iter().all(|e| e.status == NodeStatus::Cancelled));
    // No apply finished.
    assert_eq!(h.script.apply_count(), 0);
}

#[tokio::test]
async fn immutable_input_change_plans_replace_and_changes_outputs() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database]);
    let v14 = vec![component(
        "api",
        vec![resource(
            ResourceKind::Database,
            "main",
            json!({"name": "main", "type": "postgres:14"}),
        )],
    )];
    h.engine
        .deploy(deploy_request(dc.clone(), v14), h.signals())
        .await
        .unwrap();

    let url_before = h
        .engine
        .list_resources(&DatacenterName::new("dc1"), &EnvironmentName::new("prod"))
        .await
        .unwrap()[0]
        .1
        .outputs["url"]
        .clone();

    let v16 = vec![component(
        "api",
        vec![resource(
            ResourceKind::Database,
            "main",
            json!({"name": "main", "type": "postgres:16"}),
        )],
    )];
    let result = h
        .engine
        .deploy(deploy_request(dc, v16), h.signals())
        .await
        .unwrap();
    assert!(result.success);

    let plan = h.last_plan();
    assert_eq!(
        plan.action_for(&cirro_graph::NodeId::new("api/database/main")),
        Some(Action::Replace)
    );
    assert_eq!(plan.total_by_action.replace, 1);

    let url_after = h
        .engine
        .list_resources(&DatacenterName::new("dc1"), &EnvironmentName::new("prod"))
        .await
        .unwrap()[0]
        .1
        .outputs["url"]
        .clone();
    assert_ne!(url_before, url_after);
}

#[tokio::test]
async fn redeploy_with_unchanged_inputs_is_all_noop() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);

    h.engine
        .deploy(deploy_request(dc.clone(), linear_components()), h.signals())
        .await
        .unwrap();
    let applies_after_first = h.script.apply_count();

    let component_before = h
        .engine
        .store()
        .get_component(
            &DatacenterName::new("dc1"),
            &EnvironmentName::new("prod"),
            &ComponentName::new("api"),
        )
        .await
        .unwrap()
        .unwrap();

    let result = h
        .engine
        .deploy(deploy_request(dc, linear_components()), h.signals())
        .await
        .unwrap();
    assert!(result.success);

    let plan = h.last_plan();
    assert_eq!(plan.total_by_action.noop, 2);
    assert_eq!(plan.total_by_action.create, 0);
    assert_eq!(plan.total_by_action.update, 0);

    // No driver apply ran for noop nodes; component state is byte-stable.
    assert_eq!(h.script.apply_count(), applies_after_first);
    let component_after = h
        .engine
        .store()
        .get_component(
            &DatacenterName::new("dc1"),
            &EnvironmentName::new("prod"),
            &ComponentName::new("api"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        serde_json::to_vec(&component_before).unwrap(),
        serde_json::to_vec(&component_after).unwrap()
    );

    let skipped: Vec<ProgressEvent> = h
        .events()
        .into_iter()
        .filter(|e| e.status == NodeStatus::Skipped)
        .collect();
    assert_eq!(skipped.len(), 2);
}

#[tokio::test]
async fn destroy_after_deploy_leaves_nothing_behind() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);
    h.engine
        .deploy(deploy_request(dc, linear_components()), h.signals())
        .await
        .unwrap();

    let result = h
        .engine
        .destroy(
            DestroyRequest {
                datacenter: DatacenterName::new("dc1"),
                environment: EnvironmentName::new("prod"),
                parallelism: 2,
            },
            h.signals(),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.execution.deleted, 2);

    let resources = h
        .engine
        .list_resources(&DatacenterName::new("dc1"), &EnvironmentName::new("prod"))
        .await
        .unwrap();
    assert!(resources.is_empty());
    assert!(h
        .engine
        .store()
        .get_environment(&DatacenterName::new("dc1"), &EnvironmentName::new("prod"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn terminal_event_actions_match_the_published_plan() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);
    h.engine
        .deploy(deploy_request(dc, linear_components()), h.signals())
        .await
        .unwrap();

    let plan = h.last_plan();
    let mut seen = std::collections::HashSet::new();
    for event in h.events() {
        // No duplicate (node, status) pairs.
        assert!(
            seen.insert((event.node_id.clone(), event.status)),
            "duplicate event for {} {:?}",
            event.node_id,
            event.status
        );
        if event.status.is_terminal() {
            assert_eq!(
                Some(event.action),
                plan.action_for(&cirro_graph::NodeId::new(event.node_id.clone())),
                "event action diverges from plan for {}",
                event.node_id
            );
        }
    }
}

#[tokio::test]
async fn planning_is_deterministic() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);
    h.engine
        .deploy(deploy_request(dc.clone(), linear_components()), h.signals())
        .await
        .unwrap();

    // Two plans over identical inputs and identical prior state.
    h.engine
        .deploy(deploy_request(dc.clone(), linear_components()), h.signals())
        .await
        .unwrap();
    h.engine
        .deploy(deploy_request(dc, linear_components()), h.signals())
        .await
        .unwrap();

    let plans = h.plans.lock().unwrap();
    let second = serde_json::to_vec(&plans[plans.len() - 2]).unwrap();
    let third = serde_json::to_vec(&plans[plans.len() - 1]).unwrap();
    assert_eq!(second, third);
}

#[tokio::test]
async fn cycle_is_rejected_before_any_driver_call() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Service]);
    let components = vec![component(
        "api",
        vec![
            resource(
                ResourceKind::Service,
                "a",
                json!({"name": "a", "peer": "${resources.service.b.outputs.url}"}),
            ),
            resource(
                ResourceKind::Service,
                "b",
                json!({"name": "b", "peer": "${resources.service.a.outputs.url}"}),
            ),
        ],
    )];

    let err = h
        .engine
        .deploy(deploy_request(dc, components), h.signals())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cycle"), "{}", err);
    assert!(h.script.calls().is_empty(), "no driver may run");
}

#[tokio::test]
async fn hook_rebinding_to_another_driver_fails_planning() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database]);
    let components = vec![component(
        "api",
        vec![resource(
            ResourceKind::Database,
            "main",
            json!({"name": "main"}),
        )],
    )];
    h.engine
        .deploy(deploy_request(dc, components.clone()), h.signals())
        .await
        .unwrap();

    // Same resource, hook now selects a different driver.
    let mut rebound = datacenter(&[]);
    rebound.hooks.insert(
        ResourceKind::Database,
        vec![HookVariant {
            when: None,
            modules: vec![ModuleSpec {
                name: "default".into(),
                driver: "fake2".into(),
                source: "/modules/fake".into(),
                inputs: json!({}),
            }],
        }],
    );

    let err = h
        .engine
        .deploy(deploy_request(rebound, components), h.signals())
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("bound to driver"),
        "expected DriverRebound, got: {}",
        err
    );
}

#[tokio::test]
async fn import_then_plan_reports_noop() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database]);
    let components = vec![component(
        "api",
        vec![resource(
            ResourceKind::Database,
            "main",
            json!({"name": "main"}),
        )],
    )];

    let outcome = h
        .engine
        .import(
            ImportRequest {
                datacenter: dc,
                environment: EnvironmentName::new("prod"),
                components,
                variables: HashMap::new(),
                component: ComponentName::new("api"),
                resource: "database.main".into(),
                mappings: vec![ImportMapping {
                    address: "fake".into(),
                    cloud_id: "existing-db-42".into(),
                }],
                replan: true,
            },
            h.signals(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.outputs["url"], json!("existing-db-42"));
    let plan = outcome.plan.unwrap();
    assert_eq!(plan.total_by_action.noop, 1);
    assert_eq!(plan.total_by_action.create, 0);
}

#[tokio::test]
async fn apply_single_node_touches_only_the_target() {
    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);
    h.engine
        .deploy(deploy_request(dc.clone(), linear_components()), h.signals())
        .await
        .unwrap();
    let before = h.script.apply_count();

    // Change only the deployment's inputs; apply just that node.
    let mut components = linear_components();
    components[0].resources[1].inputs["replicas"] = json!(3);
    let result = h
        .engine
        .apply_node(
            deploy_request(dc, components),
            cirro_graph::NodeId::new("api/deployment/api"),
            h.signals(),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.execution.updated, 1);
    assert_eq!(h.script.apply_count(), before + 1);

    // Upstream output came from recorded state, not a re-run.
    let calls = h.script.calls();
    let Call::ApplyEnd { inputs, .. } = calls.last().unwrap() else {
        panic!("expected an apply call");
    };
    assert!(inputs["env"]["DATABASE_URL"]
        .as_str()
        .unwrap()
        .starts_with("fake://main-"));
}

#[tokio::test]
async fn multi_instance_deploy_and_promote() {
    use cirro_domain::ComponentInstance;

    let h = Harness::new();
    let dc = datacenter(&[ResourceKind::Deployment]);
    let mut comp = component("api", vec![]);
    comp.instances = vec![
        ComponentInstance {
            name: "blue".into(),
            source: Some("v1".into()),
            weight: 80,
            resources: vec![resource(
                ResourceKind::Deployment,
                "web",
                json!({"name": "web-blue"}),
            )],
        },
        ComponentInstance {
            name: "green".into(),
            source: Some("v2".into()),
            weight: 20,
            resources: vec![resource(
                ResourceKind::Deployment,
                "web",
                json!({"name": "web-green"}),
            )],
        },
    ];

    let result = h
        .engine
        .deploy(deploy_request(dc, vec![comp]), h.signals())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.execution.created, 2);

    let dc_name = DatacenterName::new("dc1");
    let env = EnvironmentName::new("prod");
    let state = h
        .engine
        .store()
        .get_component(&dc_name, &env, &ComponentName::new("api"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.instances["blue"].weight, 80);
    assert_eq!(state.instances["green"].weight, 20);
    assert!(state.instances["blue"].resources.contains_key("deployment.web"));

    // Promote mutates weights directly; no executor involvement.
    let applies = h.script.apply_count();
    h.engine
        .promote(&dc_name, &env, &ComponentName::new("api"), "green")
        .await
        .unwrap();
    assert_eq!(h.script.apply_count(), applies);

    let state = h
        .engine
        .store()
        .get_component(&dc_name, &env, &ComponentName::new("api"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.instances["blue"].weight, 0);
    assert_eq!(state.instances["green"].weight, 100);
}

#[tokio::test]
async fn missing_dependency_is_reported_for_resolution() {
    let h = Harness::new();
    let mut api = component(
        "api",
        vec![resource(ResourceKind::Deployment, "web", json!({"name": "web"}))],
    );
    api.dependencies.push(cirro_domain::ComponentDependency {
        component: ComponentName::new("auth"),
        oci_ref: Some("registry.example.com/auth:v2".into()),
        local_path: None,
        variables: {
            let mut vars = HashMap::new();
            vars.insert("admin_email".to_string(), "${variables.admin_email}".to_string());
            vars
        },
    });

    let missing = h
        .engine
        .resolve_dependencies(
            &DatacenterName::new("dc1"),
            &EnvironmentName::new("prod"),
            &[api],
            &HashMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].name, ComponentName::new("auth"));
    assert_eq!(missing[0].oci_ref.as_deref(), Some("registry.example.com/auth:v2"));
    assert_eq!(missing[0].required_by, ComponentName::new("api"));
    assert_eq!(missing[0].missing_variables, vec!["admin_email"]);
}

#[tokio::test]
async fn deploy_writes_canonical_state_layout_on_disk() {
    use cirro_store::FsBackend;

    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();

    let script = Arc::new(Script::default());
    let mut registry = DriverRegistry::new();
    let for_fake = script.clone();
    registry.register("fake", move || {
        Arc::new(FakeDriver {
            script: for_fake.clone(),
        })
    });
    let store = StateStore::new(Arc::new(FsBackend::new(dir.path())));
    let engine = Engine::new(store, Arc::new(registry));

    let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);
    let result = engine
        .deploy(
            deploy_request(dc, linear_components()),
            OperationSignals::default(),
        )
        .await
        .unwrap();
    assert!(result.success);

    let component_path = dir
        .path()
        .join("datacenters/dc1/environments/prod/components/api/component.state.json");
    let environment_path = dir
        .path()
        .join("datacenters/dc1/environments/prod/environment.state.json");
    assert!(component_path.exists());
    assert!(environment_path.exists());

    // Self-describing documents.
    let doc: Value =
        serde_json::from_slice(&std::fs::read(&component_path).unwrap()).unwrap();
    assert_eq!(doc["schema_version"], json!("v1"));
    assert_eq!(doc["kind"], json!("Component"));
    assert!(doc["resources"]["database.main"]["outputs"]["url"].is_string());
}
