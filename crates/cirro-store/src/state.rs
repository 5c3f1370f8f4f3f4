use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use cirro_domain::{
    ComponentName, DatacenterName, EnvironmentName, ResourceKind, ResourceStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

/// Schema version stamped on every persisted entity.
pub const SCHEMA_VERSION: &str = "v1";

// ── External state ────────────────────────────────────────────────────────────

/// Driver-opaque bytes representing the provider's view of a module's current
/// reality. Stored verbatim, embedded base64 in the JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExternalState(pub Vec<u8>);

impl ExternalState {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        ExternalState(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for ExternalState {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ExternalState {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        use base64::Engine;
        use serde::de::Error;
        let s = String::deserialize(d)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(ExternalState(bytes))
    }
}

// ── Input digests ─────────────────────────────────────────────────────────────

/// Serialize `value` to canonical JSON (object keys sorted) and return its
/// SHA-256 hex digest. The planner compares digests instead of diffing the
/// full rendered input tree.
pub fn input_digest(value: &Value) -> String {
    let canonical = sort_json_keys(value.clone());
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

/// Recursively sort JSON object keys so map field ordering doesn't affect
/// the digest.
fn sort_json_keys(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_keys).collect()),
        other => other,
    }
}

// ── Resource state ────────────────────────────────────────────────────────────

/// A persisted record of the most recent provisioning failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecordError {
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// The durable record of one provisioned resource.
///
/// Keyed `(datacenter, environment, component, kind, name)` through its
/// enclosing [`ComponentState`]; root and environment modules use the same
/// record keyed by module name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub kind: ResourceKind,
    pub name: String,
    pub status: ResourceStatus,
    /// Driver plugin name bound at last apply. A later hook re-selection that
    /// changes this fails planning rather than silently migrating.
    pub driver: String,
    pub module_source: PathBuf,
    /// Fully rendered inputs as passed to the driver at last apply.
    pub inputs: Value,
    /// Canonical-JSON SHA-256 of `inputs`.
    pub inputs_digest: String,
    /// Typed outputs produced by the driver.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Graph node ids this resource depended on at last apply. Lets delete
    /// planning order teardown correctly after the declaration is gone.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Driver-opaque external state blob.
    #[serde(default, skip_serializing_if = "ExternalState::is_empty")]
    pub external_state: ExternalState,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<StateRecordError>,
}

impl ResourceState {
    pub fn new(kind: ResourceKind, name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            status: ResourceStatus::Pending,
            driver: driver.into(),
            module_source: PathBuf::new(),
            inputs: Value::Null,
            inputs_digest: String::new(),
            outputs: BTreeMap::new(),
            depends_on: Vec::new(),
            external_state: ExternalState::default(),
            created_at: None,
            updated_at: None,
            last_error: None,
        }
    }

    /// Type-qualified key within the component: `kind.name`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    /// Transition to Ready after a successful apply.
    pub fn mark_ready(
        &mut self,
        now: DateTime<Utc>,
        inputs: Value,
        outputs: HashMap<String, Value>,
        external_state: ExternalState,
    ) {
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.updated_at = Some(now);
        self.inputs_digest = input_digest(&inputs);
        self.inputs = inputs;
        self.outputs = outputs.into_iter().collect();
        self.external_state = external_state;
        self.status = ResourceStatus::Ready;
        self.last_error = None;
    }

    /// Transition to Failed after a failed apply or destroy.
    pub fn mark_failed(&mut self, now: DateTime<Utc>, message: String) {
        self.status = ResourceStatus::Failed;
        self.last_error = Some(StateRecordError {
            message,
            occurred_at: now,
        });
    }
}

// ── Component state ───────────────────────────────────────────────────────────

/// Per-instance state in multi-instance (progressive rollout) mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub source: Option<String>,
    pub weight: u8,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    pub schema_version: String,
    /// Entity discriminator; always `"Component"`.
    pub kind: String,
    pub datacenter: DatacenterName,
    pub environment: EnvironmentName,
    pub name: ComponentName,
    pub source: Option<String>,
    /// Resource records keyed `kind.name` (single-instance mode).
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Instance records keyed by instance name (multi-instance mode).
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceState>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Unknown fields preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ComponentState {
    pub fn new(
        datacenter: DatacenterName,
        environment: EnvironmentName,
        name: ComponentName,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            kind: "Component".to_string(),
            datacenter,
            environment,
            name,
            source: None,
            resources: BTreeMap::new(),
            instances: BTreeMap::new(),
            created_at: None,
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// All resource records, instance-scoped ones included.
    pub fn all_resources(&self) -> impl Iterator<Item = (&String, &ResourceState)> {
        self.resources.iter().chain(
            self.instances
                .values()
                .flat_map(|i| i.resources.iter()),
        )
    }
}

// ── Environment state ─────────────────────────────────────────────────────────

/// Cheap reference to an environment, derived from key layout without reading
/// the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub datacenter: DatacenterName,
    pub name: EnvironmentName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub schema_version: String,
    /// Entity discriminator; always `"Environment"`.
    pub kind: String,
    pub datacenter: DatacenterName,
    pub name: EnvironmentName,
    /// Component names present in this environment. The component states
    /// themselves live under their own keys.
    #[serde(default)]
    pub components: Vec<ComponentName>,
    /// Environment-level module records keyed by module name.
    #[serde(default)]
    pub modules: BTreeMap<String, ResourceState>,
    /// Run id of the last execution that touched this environment.
    pub last_run: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl EnvironmentState {
    pub fn new(datacenter: DatacenterName, name: EnvironmentName) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            kind: "Environment".to_string(),
            datacenter,
            name,
            components: Vec::new(),
            modules: BTreeMap::new(),
            last_run: None,
            created_at: None,
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

// ── Datacenter state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatacenterState {
    pub schema_version: String,
    /// Entity discriminator; always `"Datacenter"`.
    pub kind: String,
    pub name: DatacenterName,
    /// Root-level module records keyed by module name.
    #[serde(default)]
    pub modules: BTreeMap<String, ResourceState>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl DatacenterState {
    pub fn new(name: DatacenterName) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            kind: "Datacenter".to_string(),
            name,
            modules: BTreeMap::new(),
            created_at: None,
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }
}
