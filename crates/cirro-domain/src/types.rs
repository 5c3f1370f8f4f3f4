use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatacenterName(pub String);

impl DatacenterName {
    pub fn new(s: impl Into<String>) -> Self {
        DatacenterName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatacenterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentName(pub String);

impl EnvironmentName {
    pub fn new(s: impl Into<String>) -> Self {
        EnvironmentName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentName(pub String);

impl ComponentName {
    pub fn new(s: impl Into<String>) -> Self {
        ComponentName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Resource kinds ────────────────────────────────────────────────────────────

/// The closed set of resource kinds a component may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Database,
    Bucket,
    Deployment,
    Function,
    Service,
    Route,
    Cronjob,
    Task,
    DockerBuild,
    EncryptionKey,
    Smtp,
    Observability,
    Port,
    Module,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 14] = [
        ResourceKind::Database,
        ResourceKind::Bucket,
        ResourceKind::Deployment,
        ResourceKind::Function,
        ResourceKind::Service,
        ResourceKind::Route,
        ResourceKind::Cronjob,
        ResourceKind::Task,
        ResourceKind::DockerBuild,
        ResourceKind::EncryptionKey,
        ResourceKind::Smtp,
        ResourceKind::Observability,
        ResourceKind::Port,
        ResourceKind::Module,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Database => "database",
            ResourceKind::Bucket => "bucket",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Function => "function",
            ResourceKind::Service => "service",
            ResourceKind::Route => "route",
            ResourceKind::Cronjob => "cronjob",
            ResourceKind::Task => "task",
            ResourceKind::DockerBuild => "dockerBuild",
            ResourceKind::EncryptionKey => "encryptionKey",
            ResourceKind::Smtp => "smtp",
            ResourceKind::Observability => "observability",
            ResourceKind::Port => "port",
            ResourceKind::Module => "module",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| DomainError::UnknownResourceKind(s.to_string()))
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// The lifecycle state of a declared resource.
///
/// Transitions:
///   Pending → Provisioning → Ready ↔ Updating
///   Provisioning | Updating → Failed
///   Ready → Destroying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Known but not yet provisioned.
    #[default]
    Pending,
    /// Driver call in-flight for initial creation.
    Provisioning,
    /// Last apply succeeded; resource should exist.
    Ready,
    /// Driver call in-flight for an update.
    Updating,
    /// Driver teardown in-flight.
    Destroying,
    /// Last driver call failed; the state record carries the error.
    Failed,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Provisioning => "provisioning",
            ResourceStatus::Ready => "ready",
            ResourceStatus::Updating => "updating",
            ResourceStatus::Destroying => "destroying",
            ResourceStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// The change a plan assigns to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    /// Destroy + create, atomic from the driver's perspective.
    Replace,
    Noop,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Replace => "replace",
            Action::Noop => "noop",
            Action::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

// ── Resources ─────────────────────────────────────────────────────────────────

/// One declared resource inside a component.
///
/// `inputs` is a JSON object whose string values may embed `${…}` expressions
/// referencing other resources' outputs; they are rendered by the planner and
/// executor, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub inputs: Value,
}

impl ResourceSpec {
    /// Type-qualified key, unique within a component: `kind.name`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }
}

// ── Components ────────────────────────────────────────────────────────────────

/// A variable a component declares it consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub default: Option<String>,
}

impl VariableSpec {
    pub fn required(&self) -> bool {
        self.default.is_none()
    }
}

/// A declared dependency on another component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDependency {
    pub component: ComponentName,
    /// OCI reference to fetch the dependency from, if not already present.
    pub oci_ref: Option<String>,
    /// Local path override for development flows.
    pub local_path: Option<PathBuf>,
    /// Variable values passed down to the dependency.
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// One instance of a component in multi-instance (progressive rollout) mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub name: String,
    /// Source reference for this instance's version.
    pub source: Option<String>,
    /// Traffic weight in percent. Weights across all instances sum to 100.
    pub weight: u8,
    pub resources: Vec<ResourceSpec>,
}

/// A user's deployable unit: declared resources plus dependencies on other
/// components. Exactly one of `resources` (single-instance) or `instances`
/// (multi-instance) is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: ComponentName,
    /// Version reference ("source") in single-instance mode.
    pub source: Option<String>,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub dependencies: Vec<ComponentDependency>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub instances: Vec<ComponentInstance>,
}

impl Component {
    /// Whether this component runs in multi-instance (progressive rollout) mode.
    pub fn is_multi_instance(&self) -> bool {
        !self.instances.is_empty()
    }

    /// Structural validation: unique resource keys, single XOR multi instance
    /// mode, instance weights summing to 100.
    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.resources.is_empty() && !self.instances.is_empty() {
            return Err(DomainError::MixedInstanceMode {
                component: self.name.clone(),
            });
        }

        check_unique_keys(&self.name, &self.resources)?;
        for instance in &self.instances {
            check_unique_keys(&self.name, &instance.resources)?;
        }

        if !self.instances.is_empty() {
            let total: u32 = self.instances.iter().map(|i| u32::from(i.weight)).sum();
            if total != 100 {
                return Err(DomainError::InstanceWeights {
                    component: self.name.clone(),
                    total,
                });
            }
        }

        Ok(())
    }
}

fn check_unique_keys(
    component: &ComponentName,
    resources: &[ResourceSpec],
) -> Result<(), DomainError> {
    let mut seen = std::collections::HashSet::new();
    for res in resources {
        if res.name.is_empty() {
            return Err(DomainError::EmptyResourceName {
                component: component.clone(),
                kind: res.kind,
            });
        }
        if !seen.insert(res.key()) {
            return Err(DomainError::DuplicateResource {
                component: component.clone(),
                key: res.key(),
            });
        }
    }
    Ok(())
}

// ── Datacenters ───────────────────────────────────────────────────────────────

/// A unit of IaC managed by a single driver, invoked with typed inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    /// Driver plugin name: `native`, `opentofu`, `pulumi`, …
    pub driver: String,
    /// Local path to the module source after any required fetch.
    pub source: PathBuf,
    #[serde(default)]
    pub inputs: Value,
}

/// One `when`-guarded variant of a datacenter hook. The first variant whose
/// guard is satisfied selects the module(s) attached to a resource node; an
/// absent guard is the catch-all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookVariant {
    pub when: Option<String>,
    pub modules: Vec<ModuleSpec>,
}

impl HookVariant {
    pub fn is_catch_all(&self) -> bool {
        self.when.as_deref().map_or(true, |w| w.trim().is_empty())
    }
}

/// A reusable infrastructure template. Hooks bind resource kinds to IaC
/// modules; root and environment modules provide shared infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datacenter {
    pub name: DatacenterName,
    /// Per-kind hook variants, matched in declaration order.
    #[serde(default)]
    pub hooks: HashMap<ResourceKind, Vec<HookVariant>>,
    /// Root-level modules, provisioned once per datacenter.
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    /// Environment-level modules, provisioned once per environment.
    #[serde(default)]
    pub environment_modules: Vec<ModuleSpec>,
}

impl Datacenter {
    /// Hook variants for a kind, empty if the datacenter declares none.
    pub fn hook_variants(&self, kind: ResourceKind) -> &[HookVariant] {
        self.hooks.get(&kind).map_or(&[], Vec::as_slice)
    }
}

// ── Environments ──────────────────────────────────────────────────────────────

/// A named runtime scope under exactly one datacenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: EnvironmentName,
    pub datacenter: DatacenterName,
}

impl Environment {
    pub fn new(datacenter: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: EnvironmentName::new(name),
            datacenter: DatacenterName::new(datacenter),
        }
    }
}
