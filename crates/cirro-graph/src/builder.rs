//! Graph construction: declared components plus datacenter hooks plus prior
//! state become the typed dependency DAG the planner and executor run over.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use cirro_domain::{
    Component, ComponentName, Datacenter, EnvironmentName, HookVariant, ModuleSpec,
    ResourceKind, ResourceSpec,
};
use cirro_store::{ComponentState, DatacenterState, EnvironmentState, ResourceState};
use serde_json::Value;

use crate::error::{ExprError, GraphError};
use crate::expr::{extract_refs, parse_expr, render_value, RefResolver, Resolved};
use crate::node::{DriverBinding, Graph, Node, NodeId, NodeScope};

/// Recorded state consulted for delete planning and driver-rebinding checks.
#[derive(Debug, Clone, Default)]
pub struct PriorState<'a> {
    pub datacenter: Option<&'a DatacenterState>,
    pub environment: Option<&'a EnvironmentState>,
    pub components: Vec<&'a ComponentState>,
}

pub struct BuildRequest<'a> {
    pub datacenter: &'a Datacenter,
    pub environment: &'a EnvironmentName,
    pub components: &'a [Component],
    pub prior: PriorState<'a>,
}

/// Build the execution DAG for a deploy.
///
/// Node iteration order in the result is id-sorted, so plans diff stably
/// across runs.
pub fn build(req: &BuildRequest<'_>) -> Result<Graph, GraphError> {
    let mut errors: Vec<GraphError> = Vec::new();

    for component in req.components {
        if let Err(e) = component.validate() {
            errors.push(e.into());
        }
    }
    if !errors.is_empty() {
        return Err(collapse(errors));
    }

    let mut graph = Graph::new();

    // Root modules first: datacenter-level, then environment-level behind them.
    let mut root_ids: Vec<NodeId> = Vec::new();
    for module in &req.datacenter.modules {
        let id = NodeId::for_datacenter_module(&module.name);
        graph.insert(module_node(id.clone(), module, NodeScope::Datacenter, &[]));
        root_ids.push(id);
    }
    let datacenter_ids = root_ids.clone();
    for module in &req.datacenter.environment_modules {
        let id = NodeId::for_environment_module(&module.name);
        graph.insert(module_node(
            id.clone(),
            module,
            NodeScope::Environment,
            &datacenter_ids,
        ));
        root_ids.push(id);
    }

    // Component resource nodes, instances projected as virtual components.
    let mut virtual_components: HashMap<String, Vec<NodeId>> = HashMap::new();
    let mut declared_by: HashMap<ComponentName, Vec<String>> = HashMap::new();
    for component in req.components {
        let mut projections: Vec<(String, Option<String>, &[ResourceSpec])> = Vec::new();
        if component.is_multi_instance() {
            for instance in &component.instances {
                projections.push((
                    format!("{}@{}", component.name, instance.name),
                    Some(instance.name.clone()),
                    &instance.resources,
                ));
            }
        } else {
            projections.push((component.name.0.clone(), None, &component.resources));
        }

        for (virtual_name, instance, resources) in projections {
            declared_by
                .entry(component.name.clone())
                .or_default()
                .push(virtual_name.clone());
            let ids = virtual_components.entry(virtual_name.clone()).or_default();
            for resource in resources {
                match resource_node(req, component, &virtual_name, instance.clone(), resource, &root_ids)
                {
                    Ok(node) => {
                        ids.push(node.id.clone());
                        graph.insert(node);
                    }
                    Err(e) => errors.push(e),
                }
            }
        }
    }
    if !errors.is_empty() {
        return Err(collapse(errors));
    }

    // Implicit edges from expression references.
    let prior_component_names: HashSet<&ComponentName> =
        req.prior.components.iter().map(|c| &c.name).collect();
    let mut implicit: Vec<(NodeId, NodeId)> = Vec::new();
    for node in graph.nodes() {
        if !matches!(node.scope, NodeScope::Component { .. }) {
            continue;
        }
        let virtual_name = node
            .id
            .as_str()
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let refs = extract_refs(&node.inputs).map_err(|e| expr_err(&node.id, e))?;
        for path in refs {
            match classify_reference(&path) {
                Reference::Resource { kind, name } => {
                    let target = NodeId::for_resource(&virtual_name, kind, &name);
                    if !graph.contains(&target) {
                        errors.push(GraphError::UnresolvedReference {
                            node: node.id.clone(),
                            reference: path.join("."),
                        });
                        continue;
                    }
                    implicit.push((node.id.clone(), target));
                }
                Reference::Dependency { component: dep } => {
                    if let Some(projections) = declared_by.get(&dep) {
                        for projection in projections {
                            for target in
                                virtual_components.get(projection).into_iter().flatten()
                            {
                                implicit.push((node.id.clone(), target.clone()));
                            }
                        }
                    } else if !prior_component_names.contains(&dep) {
                        errors.push(GraphError::UnresolvedReference {
                            node: node.id.clone(),
                            reference: path.join("."),
                        });
                    }
                }
                Reference::Ambient => {}
                Reference::Invalid => {
                    errors.push(GraphError::UnresolvedReference {
                        node: node.id.clone(),
                        reference: path.join("."),
                    });
                }
            }
        }
    }
    if !errors.is_empty() {
        return Err(collapse(errors));
    }
    for (from, to) in implicit {
        if let Some(node) = graph.get_mut(&from) {
            node.depends_on.insert(to);
        }
    }

    // Explicit cross-component dependency edges.
    for component in req.components {
        for dependency in &component.dependencies {
            if let Some(projections) = declared_by.get(&dependency.component) {
                let targets: Vec<NodeId> = projections
                    .iter()
                    .flat_map(|p| virtual_components.get(p).into_iter().flatten().cloned())
                    .collect();
                for projection in declared_by.get(&component.name).into_iter().flatten() {
                    for id in virtual_components.get(projection).into_iter().flatten() {
                        let node_id = id.clone();
                        if let Some(node) = graph.get_mut(&node_id) {
                            node.depends_on.extend(targets.iter().cloned());
                        }
                    }
                }
            } else if !prior_component_names.contains(&dependency.component) {
                errors.push(GraphError::UnknownDependency {
                    component: component.name.clone(),
                    dependency: dependency.component.clone(),
                });
            }
        }
    }
    if !errors.is_empty() {
        return Err(collapse(errors));
    }

    add_delete_nodes(&mut graph, req);

    graph.check_acyclic()?;
    Ok(graph)
}

/// Build a graph for destroying everything recorded in `prior`. Every node is
/// delete-only; the executor runs the reversed graph so dependents tear down
/// before their dependencies and root modules go strictly last.
pub fn build_delete_graph(prior: &PriorState<'_>) -> Graph {
    let mut graph = Graph::new();
    let mut recorded_deps: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

    if let Some(dc) = prior.datacenter {
        for (name, record) in &dc.modules {
            let id = NodeId::for_datacenter_module(name);
            recorded_deps.insert(id.clone(), recorded_dep_ids(record));
            graph.insert(delete_node(id, record, NodeScope::Datacenter));
        }
    }
    if let Some(env) = prior.environment {
        for (name, record) in &env.modules {
            let id = NodeId::for_environment_module(name);
            recorded_deps.insert(id.clone(), recorded_dep_ids(record));
            graph.insert(delete_node(id, record, NodeScope::Environment));
        }
    }
    for component in &prior.components {
        for (virtual_name, instance, record) in recorded_resources(component) {
            let id = NodeId::for_resource(&virtual_name, record.kind, &record.name);
            recorded_deps.insert(id.clone(), recorded_dep_ids(record));
            graph.insert(delete_node(
                id,
                record,
                NodeScope::Component {
                    component: component.name.clone(),
                    instance,
                },
            ));
        }
    }

    wire_recorded_edges(&mut graph, &recorded_deps);
    graph
}

// ── Node construction ─────────────────────────────────────────────────────────

fn module_node(
    id: NodeId,
    module: &ModuleSpec,
    scope: NodeScope,
    depends_on: &[NodeId],
) -> Node {
    Node {
        id,
        kind: ResourceKind::Module,
        name: module.name.clone(),
        scope,
        depends_on: depends_on.iter().cloned().collect(),
        inputs: module.inputs.clone(),
        binding: DriverBinding {
            driver: module.driver.clone(),
            module_name: module.name.clone(),
            module_source: module.source.clone(),
        },
        delete_only: false,
    }
}

fn resource_node(
    req: &BuildRequest<'_>,
    component: &Component,
    virtual_name: &str,
    instance: Option<String>,
    resource: &ResourceSpec,
    root_ids: &[NodeId],
) -> Result<Node, GraphError> {
    let id = NodeId::for_resource(virtual_name, resource.kind, &resource.name);
    let scope = NodeScope::Component {
        component: component.name.clone(),
        instance,
    };

    let resolver = ResourceScopeResolver {
        resource,
        environment: req.environment,
        datacenter: req.datacenter,
    };

    let (binding, module_inputs) = select_binding(req, component, resource, &resolver)
        .map_err(|e| match e {
            BindError::Graph(e) => e,
            BindError::Expr(e) => expr_err(&id, e),
        })?;

    // Module inputs may reference the triggering resource; those are static,
    // so render them now and leave everything else for the planner.
    let (module_inputs, _) =
        render_value(&module_inputs, &resolver).map_err(|e| expr_err(&id, e))?;
    let inputs = merge_inputs(&resource.inputs, &module_inputs);

    Ok(Node {
        id,
        kind: resource.kind,
        name: resource.name.clone(),
        scope,
        depends_on: root_ids.iter().cloned().collect(),
        inputs,
        binding,
        delete_only: false,
    })
}

enum BindError {
    Graph(GraphError),
    Expr(ExprError),
}

/// Match hook variants in declaration order; the first satisfied guard wins.
/// `module`-kind resources bind directly from their declared inputs instead.
fn select_binding(
    req: &BuildRequest<'_>,
    component: &Component,
    resource: &ResourceSpec,
    resolver: &dyn RefResolver,
) -> Result<(DriverBinding, Value), BindError> {
    if resource.kind == ResourceKind::Module {
        let driver = resource
            .inputs
            .get("driver")
            .and_then(Value::as_str)
            .unwrap_or("opentofu")
            .to_string();
        let source = resource
            .inputs
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BindError::Graph(GraphError::NoHookMatched {
                    component: component.name.clone(),
                    resource: resource.key(),
                })
            })?;
        return Ok((
            DriverBinding {
                driver,
                module_name: resource.name.clone(),
                module_source: source.into(),
            },
            Value::Object(serde_json::Map::new()),
        ));
    }

    for variant in req.datacenter.hook_variants(resource.kind) {
        if !variant_matches(variant, resolver).map_err(BindError::Expr)? {
            continue;
        }
        let module = match variant.modules.as_slice() {
            [module] => module,
            modules => {
                return Err(BindError::Graph(GraphError::AmbiguousHookModules {
                    component: component.name.clone(),
                    resource: resource.key(),
                    count: modules.len(),
                }))
            }
        };
        return Ok((
            DriverBinding {
                driver: module.driver.clone(),
                module_name: module.name.clone(),
                module_source: module.source.clone(),
            },
            module.inputs.clone(),
        ));
    }

    Err(BindError::Graph(GraphError::NoHookMatched {
        component: component.name.clone(),
        resource: resource.key(),
    }))
}

fn variant_matches(variant: &HookVariant, resolver: &dyn RefResolver) -> Result<bool, ExprError> {
    if variant.is_catch_all() {
        return Ok(true);
    }
    let guard = variant.when.as_deref().unwrap_or_default();
    let expr = parse_expr(guard)?;
    match expr.eval(resolver)? {
        Resolved::Value(Value::Bool(b)) => Ok(b),
        Resolved::Value(other) => Err(ExprError::NonBooleanCondition(other.to_string())),
        // Guards see only static resource attributes; a deferred answer means
        // the guard reached outside its scope.
        Resolved::Deferred => Err(ExprError::NonBooleanCondition("deferred".to_string())),
    }
}

/// Shallow merge: the resource's declared inputs, overlaid by the hook
/// module's inputs.
fn merge_inputs(resource_inputs: &Value, module_inputs: &Value) -> Value {
    match (resource_inputs, module_inputs) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (Value::Null, overlay) => overlay.clone(),
        (_, overlay) => overlay.clone(),
    }
}

// ── Delete planning ───────────────────────────────────────────────────────────

fn add_delete_nodes(graph: &mut Graph, req: &BuildRequest<'_>) {
    let mut recorded_deps: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

    if let Some(dc) = req.prior.datacenter {
        let declared: HashSet<&str> = req
            .datacenter
            .modules
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        for (name, record) in &dc.modules {
            if !declared.contains(name.as_str()) {
                let id = NodeId::for_datacenter_module(name);
                recorded_deps.insert(id.clone(), recorded_dep_ids(record));
                graph.insert(delete_node(id, record, NodeScope::Datacenter));
            }
        }
    }
    if let Some(env) = req.prior.environment {
        let declared: HashSet<&str> = req
            .datacenter
            .environment_modules
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        for (name, record) in &env.modules {
            if !declared.contains(name.as_str()) {
                let id = NodeId::for_environment_module(name);
                recorded_deps.insert(id.clone(), recorded_dep_ids(record));
                graph.insert(delete_node(id, record, NodeScope::Environment));
            }
        }
    }

    for component in &req.prior.components {
        for (virtual_name, instance, record) in recorded_resources(component) {
            let id = NodeId::for_resource(&virtual_name, record.kind, &record.name);
            if !graph.contains(&id) {
                recorded_deps.insert(id.clone(), recorded_dep_ids(record));
                graph.insert(delete_node(
                    id,
                    record,
                    NodeScope::Component {
                        component: component.name.clone(),
                        instance,
                    },
                ));
            }
        }
    }

    wire_recorded_edges(graph, &recorded_deps);
}

/// All recorded resources of a component as `(virtual component, instance,
/// record)` triples.
fn recorded_resources<'a>(
    component: &'a ComponentState,
) -> Vec<(String, Option<String>, &'a ResourceState)> {
    let mut out = Vec::new();
    for record in component.resources.values() {
        out.push((component.name.0.clone(), None, record));
    }
    for (instance_name, instance) in &component.instances {
        for record in instance.resources.values() {
            out.push((
                format!("{}@{}", component.name, instance_name),
                Some(instance_name.clone()),
                record,
            ));
        }
    }
    out
}

fn delete_node(id: NodeId, record: &ResourceState, scope: NodeScope) -> Node {
    Node {
        id,
        kind: record.kind,
        name: record.name.clone(),
        scope,
        depends_on: BTreeSet::new(),
        inputs: record.inputs.clone(),
        binding: DriverBinding {
            driver: record.driver.clone(),
            module_name: record.name.clone(),
            module_source: record.module_source.clone(),
        },
        delete_only: true,
    }
}

fn recorded_dep_ids(record: &ResourceState) -> Vec<NodeId> {
    record.depends_on.iter().map(NodeId::new).collect()
}

/// Wire edges among delete-only nodes from the dependency lists recorded at
/// apply time, reversed: a recorded dependent must tear down before the node
/// it depended on. Module delete nodes additionally trail every component
/// delete node, so root infrastructure goes last even for pre-upgrade state
/// files that recorded no edges.
fn wire_recorded_edges(graph: &mut Graph, recorded_deps: &HashMap<NodeId, Vec<NodeId>>) {
    let delete_ids: Vec<NodeId> = graph
        .nodes()
        .filter(|n| n.delete_only)
        .map(|n| n.id.clone())
        .collect();
    let delete_set: HashSet<&NodeId> = delete_ids.iter().collect();

    let mut reversed: Vec<(NodeId, NodeId)> = Vec::new();

    // record.depends_on says "dependency → dependent must wait"; for deletes
    // the dependent goes first, so the edge flips.
    for (dependent, deps) in recorded_deps {
        for dependency in deps {
            if delete_set.contains(dependency) && delete_set.contains(dependent) {
                reversed.push((dependency.clone(), dependent.clone()));
            }
        }
    }

    // Root and environment modules trail every component delete node.
    for id in &delete_ids {
        let node = graph.get(id).expect("delete node present");
        if matches!(node.scope, NodeScope::Datacenter | NodeScope::Environment) {
            for other in &delete_ids {
                if other != id
                    && graph
                        .get(other)
                        .is_some_and(|n| matches!(n.scope, NodeScope::Component { .. }))
                {
                    reversed.push((id.clone(), other.clone()));
                }
            }
        }
    }
    // Datacenter modules also trail environment modules.
    for id in &delete_ids {
        let node = graph.get(id).expect("delete node present");
        if matches!(node.scope, NodeScope::Datacenter) {
            for other in &delete_ids {
                if other != id
                    && graph
                        .get(other)
                        .is_some_and(|n| matches!(n.scope, NodeScope::Environment))
                {
                    reversed.push((id.clone(), other.clone()));
                }
            }
        }
    }

    for (from, to) in reversed {
        if let Some(node) = graph.get_mut(&from) {
            node.depends_on.insert(to);
        }
    }
}

// ── Reference classification ──────────────────────────────────────────────────

enum Reference {
    Resource { kind: ResourceKind, name: String },
    Dependency { component: ComponentName },
    /// Variables and static scope; resolved later, never an edge.
    Ambient,
    Invalid,
}

fn classify_reference(path: &[String]) -> Reference {
    match path {
        [head, kind, name, outputs, ..] if head == "resources" && outputs == "outputs" => {
            match ResourceKind::from_str(kind) {
                Ok(kind) => Reference::Resource {
                    kind,
                    name: name.clone(),
                },
                Err(_) => Reference::Invalid,
            }
        }
        [head, component, outputs, ..] if head == "deps" && outputs == "outputs" => {
            Reference::Dependency {
                component: ComponentName::new(component.clone()),
            }
        }
        [head, ..]
            if head == "variables"
                || head == "environment"
                || head == "datacenter"
                || head == "resource" =>
        {
            Reference::Ambient
        }
        _ => Reference::Invalid,
    }
}

/// Resolves the static scope visible while building one resource's node:
/// the triggering resource's attributes plus environment and datacenter
/// names. Planner-scope references answer Deferred.
struct ResourceScopeResolver<'a> {
    resource: &'a ResourceSpec,
    environment: &'a EnvironmentName,
    datacenter: &'a Datacenter,
}

impl RefResolver for ResourceScopeResolver<'_> {
    fn resolve(&self, path: &[String]) -> Result<Resolved, ExprError> {
        match path {
            [head, attr] if head == "resource" && attr == "kind" => Ok(Resolved::Value(
                Value::String(self.resource.kind.to_string()),
            )),
            [head, attr] if head == "resource" && attr == "name" => Ok(Resolved::Value(
                Value::String(self.resource.name.clone()),
            )),
            [head, attr, rest @ ..] if head == "resource" && attr == "inputs" => {
                // Absent attributes compare as null rather than erroring, so
                // guards can probe optional fields.
                let mut current = &self.resource.inputs;
                for segment in rest {
                    match current.get(segment) {
                        Some(next) => current = next,
                        None => return Ok(Resolved::Value(Value::Null)),
                    }
                }
                Ok(Resolved::Value(current.clone()))
            }
            [head] | [head, _] if head == "environment" => Ok(Resolved::Value(Value::String(
                self.environment.to_string(),
            ))),
            [head] | [head, _] if head == "datacenter" => Ok(Resolved::Value(Value::String(
                self.datacenter.name.to_string(),
            ))),
            [head, ..] if head == "resources" || head == "deps" || head == "variables" => {
                Ok(Resolved::Deferred)
            }
            _ => Err(ExprError::UnknownReference(path.join("."))),
        }
    }
}

fn collapse(mut errors: Vec<GraphError>) -> GraphError {
    if errors.len() == 1 {
        errors.remove(0)
    } else {
        GraphError::Multiple(errors)
    }
}

fn expr_err(node: &NodeId, source: ExprError) -> GraphError {
    GraphError::Expr {
        context: node.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirro_domain::{ComponentInstance, VariableSpec};
    use serde_json::json;

    fn catch_all_hook(driver: &str, source: &str) -> Vec<HookVariant> {
        vec![HookVariant {
            when: None,
            modules: vec![ModuleSpec {
                name: "default".into(),
                driver: driver.into(),
                source: source.into(),
                inputs: json!({}),
            }],
        }]
    }

    fn datacenter(kinds: &[ResourceKind]) -> Datacenter {
        let mut hooks = HashMap::new();
        for kind in kinds {
            hooks.insert(*kind, catch_all_hook("native", "/modules/default"));
        }
        Datacenter {
            name: cirro_domain::DatacenterName::new("dc1"),
            hooks,
            modules: vec![],
            environment_modules: vec![],
        }
    }

    fn component(name: &str, resources: Vec<ResourceSpec>) -> Component {
        Component {
            name: ComponentName::new(name),
            source: Some("v1".into()),
            variables: vec![VariableSpec { name: "region".into(), default: Some("local".into()) }],
            dependencies: vec![],
            resources,
            instances: vec![],
        }
    }

    fn resource(kind: ResourceKind, name: &str, inputs: Value) -> ResourceSpec {
        ResourceSpec { kind, name: name.into(), inputs }
    }

    fn request<'a>(
        dc: &'a Datacenter,
        env: &'a EnvironmentName,
        components: &'a [Component],
    ) -> BuildRequest<'a> {
        BuildRequest {
            datacenter: dc,
            environment: env,
            components,
            prior: PriorState::default(),
        }
    }

    #[test]
    fn expression_reference_becomes_edge() {
        let dc = datacenter(&[ResourceKind::Database, ResourceKind::Deployment]);
        let env = EnvironmentName::new("prod");
        let components = vec![component(
            "api",
            vec![
                resource(ResourceKind::Database, "main", json!({"engine": "postgres"})),
                resource(
                    ResourceKind::Deployment,
                    "web",
                    json!({"env": {"DATABASE_URL": "${resources.database.main.outputs.url}"}}),
                ),
            ],
        )];

        let graph = build(&request(&dc, &env, &components)).unwrap();
        let web = graph.get(&NodeId::new("api/deployment/web")).unwrap();
        assert!(web.depends_on.contains(&NodeId::new("api/database/main")));
    }

    #[test]
    fn no_hook_matched_fails_build() {
        let dc = datacenter(&[ResourceKind::Database]);
        let env = EnvironmentName::new("prod");
        let components = vec![component(
            "api",
            vec![resource(ResourceKind::Bucket, "assets", json!({}))],
        )];

        let err = build(&request(&dc, &env, &components)).unwrap_err();
        assert!(matches!(err, GraphError::NoHookMatched { .. }), "{:?}", err);
    }

    #[test]
    fn when_guard_selects_first_matching_variant() {
        let mut dc = datacenter(&[]);
        dc.hooks.insert(
            ResourceKind::Database,
            vec![
                HookVariant {
                    when: Some("resource.inputs.engine == 'mysql'".into()),
                    modules: vec![ModuleSpec {
                        name: "mysql".into(),
                        driver: "opentofu".into(),
                        source: "/modules/mysql".into(),
                        inputs: json!({}),
                    }],
                },
                HookVariant {
                    when: Some("resource.inputs.engine == 'postgres'".into()),
                    modules: vec![ModuleSpec {
                        name: "postgres".into(),
                        driver: "native".into(),
                        source: "/modules/postgres".into(),
                        inputs: json!({"engine_version": "${resource.inputs.version}"}),
                    }],
                },
            ],
        );
        let env = EnvironmentName::new("prod");
        let components = vec![component(
            "api",
            vec![resource(
                ResourceKind::Database,
                "main",
                json!({"engine": "postgres", "version": "16"}),
            )],
        )];

        let graph = build(&request(&dc, &env, &components)).unwrap();
        let node = graph.get(&NodeId::new("api/database/main")).unwrap();
        assert_eq!(node.binding.module_name, "postgres");
        assert_eq!(node.binding.driver, "native");
        // Module inputs referencing the resource render at build time.
        assert_eq!(node.inputs["engine_version"], json!("16"));
    }

    #[test]
    fn unresolved_reference_fails_build() {
        let dc = datacenter(&[ResourceKind::Deployment]);
        let env = EnvironmentName::new("prod");
        let components = vec![component(
            "api",
            vec![resource(
                ResourceKind::Deployment,
                "web",
                json!({"url": "${resources.database.missing.outputs.url}"}),
            )],
        )];

        let err = build(&request(&dc, &env, &components)).unwrap_err();
        assert!(matches!(err, GraphError::UnresolvedReference { .. }), "{:?}", err);
    }

    #[test]
    fn mutual_references_detected_as_cycle() {
        let dc = datacenter(&[ResourceKind::Service]);
        let env = EnvironmentName::new("prod");
        let components = vec![component(
            "api",
            vec![
                resource(
                    ResourceKind::Service,
                    "a",
                    json!({"peer": "${resources.service.b.outputs.host}"}),
                ),
                resource(
                    ResourceKind::Service,
                    "b",
                    json!({"peer": "${resources.service.a.outputs.host}"}),
                ),
            ],
        )];

        let err = build(&request(&dc, &env, &components)).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { .. }), "{:?}", err);
    }

    #[test]
    fn root_modules_precede_component_nodes() {
        let mut dc = datacenter(&[ResourceKind::Deployment]);
        dc.modules.push(ModuleSpec {
            name: "vpc".into(),
            driver: "opentofu".into(),
            source: "/modules/vpc".into(),
            inputs: json!({}),
        });
        dc.environment_modules.push(ModuleSpec {
            name: "namespace".into(),
            driver: "native".into(),
            source: "/modules/namespace".into(),
            inputs: json!({}),
        });
        let env = EnvironmentName::new("prod");
        let components = vec![component(
            "api",
            vec![resource(ResourceKind::Deployment, "web", json!({}))],
        )];

        let graph = build(&request(&dc, &env, &components)).unwrap();
        let web = graph.get(&NodeId::new("api/deployment/web")).unwrap();
        assert!(web.depends_on.contains(&NodeId::new("datacenter/module/vpc")));
        assert!(web.depends_on.contains(&NodeId::new("environment/module/namespace")));

        let namespace = graph.get(&NodeId::new("environment/module/namespace")).unwrap();
        assert!(namespace.depends_on.contains(&NodeId::new("datacenter/module/vpc")));
    }

    #[test]
    fn cross_component_dependency_adds_edges() {
        let dc = datacenter(&[ResourceKind::Deployment, ResourceKind::Database]);
        let env = EnvironmentName::new("prod");
        let mut api = component(
            "api",
            vec![resource(ResourceKind::Deployment, "web", json!({}))],
        );
        api.dependencies.push(cirro_domain::ComponentDependency {
            component: ComponentName::new("auth"),
            oci_ref: None,
            local_path: None,
            variables: Default::default(),
        });
        let auth = component(
            "auth",
            vec![resource(ResourceKind::Database, "users", json!({}))],
        );
        let components = vec![api, auth];

        let graph = build(&request(&dc, &env, &components)).unwrap();
        let web = graph.get(&NodeId::new("api/deployment/web")).unwrap();
        assert!(web.depends_on.contains(&NodeId::new("auth/database/users")));
    }

    #[test]
    fn missing_dependency_rejected() {
        let dc = datacenter(&[ResourceKind::Deployment]);
        let env = EnvironmentName::new("prod");
        let mut api = component(
            "api",
            vec![resource(ResourceKind::Deployment, "web", json!({}))],
        );
        api.dependencies.push(cirro_domain::ComponentDependency {
            component: ComponentName::new("auth"),
            oci_ref: Some("registry.example.com/auth:v1".into()),
            local_path: None,
            variables: Default::default(),
        });
        let components = vec![api];

        let err = build(&request(&dc, &env, &components)).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }), "{:?}", err);
    }

    #[test]
    fn state_resource_absent_from_target_becomes_delete_node() {
        use cirro_store::ResourceState;

        let dc = datacenter(&[ResourceKind::Deployment]);
        let env = EnvironmentName::new("prod");
        let components = vec![component(
            "api",
            vec![resource(ResourceKind::Deployment, "web", json!({}))],
        )];

        let mut prior_comp = ComponentState::new(
            dc.name.clone(),
            env.clone(),
            ComponentName::new("api"),
        );
        prior_comp.resources.insert(
            "deployment.web".into(),
            ResourceState::new(ResourceKind::Deployment, "web", "native"),
        );
        let mut old = ResourceState::new(ResourceKind::Bucket, "assets", "native");
        old.depends_on = vec!["api/deployment/web".into()];
        prior_comp.resources.insert("bucket.assets".into(), old);

        let req = BuildRequest {
            datacenter: &dc,
            environment: &env,
            components: &components,
            prior: PriorState {
                datacenter: None,
                environment: None,
                components: vec![&prior_comp],
            },
        };
        let graph = build(&req).unwrap();

        let delete = graph.get(&NodeId::new("api/bucket/assets")).unwrap();
        assert!(delete.delete_only);
        // Still-declared resources are not marked for deletion.
        assert!(!graph.get(&NodeId::new("api/deployment/web")).unwrap().delete_only);
    }

    #[test]
    fn multi_instance_components_project_virtual_components() {
        let dc = datacenter(&[ResourceKind::Deployment]);
        let env = EnvironmentName::new("prod");
        let mut comp = component("api", vec![]);
        comp.instances = vec![
            ComponentInstance {
                name: "blue".into(),
                source: Some("v1".into()),
                weight: 80,
                resources: vec![resource(ResourceKind::Deployment, "web", json!({}))],
            },
            ComponentInstance {
                name: "green".into(),
                source: Some("v2".into()),
                weight: 20,
                resources: vec![resource(ResourceKind::Deployment, "web", json!({}))],
            },
        ];
        let components = vec![comp];

        let graph = build(&request(&dc, &env, &components)).unwrap();
        assert!(graph.contains(&NodeId::new("api@blue/deployment/web")));
        assert!(graph.contains(&NodeId::new("api@green/deployment/web")));
    }

    #[test]
    fn delete_graph_tears_modules_down_last() {
        use cirro_store::{DatacenterState, EnvironmentState, ResourceState};

        let mut dc_state = DatacenterState::new(cirro_domain::DatacenterName::new("dc1"));
        dc_state.modules.insert(
            "vpc".into(),
            ResourceState::new(ResourceKind::Module, "vpc", "opentofu"),
        );
        let mut env_state = EnvironmentState::new(
            cirro_domain::DatacenterName::new("dc1"),
            EnvironmentName::new("prod"),
        );
        env_state.modules.insert(
            "namespace".into(),
            ResourceState::new(ResourceKind::Module, "namespace", "native"),
        );
        let mut comp_state = ComponentState::new(
            cirro_domain::DatacenterName::new("dc1"),
            EnvironmentName::new("prod"),
            ComponentName::new("api"),
        );
        let mut web = ResourceState::new(ResourceKind::Deployment, "web", "native");
        web.depends_on = vec!["api/database/main".into()];
        comp_state.resources.insert("deployment.web".into(), web);
        comp_state.resources.insert(
            "database.main".into(),
            ResourceState::new(ResourceKind::Database, "main", "native"),
        );

        let prior = PriorState {
            datacenter: Some(&dc_state),
            environment: Some(&env_state),
            components: vec![&comp_state],
        };
        let graph = build_delete_graph(&prior);
        let order = graph.topo_order().unwrap();
        let pos = |id: &str| order.iter().position(|n| n.as_str() == id).unwrap();

        // Dependents tear down first; modules strictly last, datacenter after
        // environment.
        assert!(pos("api/deployment/web") < pos("api/database/main"));
        assert!(pos("api/database/main") < pos("environment/module/namespace"));
        assert!(pos("environment/module/namespace") < pos("datacenter/module/vpc"));
    }
}
