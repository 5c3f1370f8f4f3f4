use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use cirro_domain::Action;
use cirro_store::{input_digest, ExternalState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{
    ApplyResult, DestroyResult, Driver, DriverMetadata, ImportMapping, ImportResult,
    PlanResult,
};
use crate::error::DriverError;

const COMMAND_TIMEOUT_SECS: u64 = 600;

/// Reference driver that realizes typed resource ops through a container
/// runtime CLI (`docker` by default, `podman` works unchanged).
///
/// A native module is a directory containing a `module.json` manifest
/// describing one op. Ops that have no runtime footprint (`synthetic`)
/// produce outputs only, which keeps kinds like `route` or `port` cheap.
pub struct NativeDriver {
    runtime: String,
}

impl NativeDriver {
    pub fn new() -> Self {
        Self::with_runtime("docker")
    }

    pub fn with_runtime(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }
}

impl Default for NativeDriver {
    fn default() -> Self {
        Self::new()
    }
}

// ── Module manifest ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum NativeOp {
    /// `docker run -d` a container; inputs become environment variables.
    Container,
    /// `docker volume create`.
    Volume,
    /// `docker build` the module directory.
    Build,
    /// No runtime footprint; outputs rendered from templates alone.
    #[default]
    Synthetic,
}

impl NativeOp {
    fn as_str(self) -> &'static str {
        match self {
            NativeOp::Container => "container",
            NativeOp::Volume => "volume",
            NativeOp::Build => "build",
            NativeOp::Synthetic => "synthetic",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct NativeModule {
    #[serde(default)]
    op: NativeOp,
    image: Option<String>,
    #[serde(default)]
    ports: Vec<u16>,
    /// Output templates. Placeholders: `{name}`, `{id}`, `{image}` and
    /// `{inputs.<key>}`.
    #[serde(default)]
    outputs: HashMap<String, String>,
}

fn load_module(module_source: &Path) -> Result<NativeModule, DriverError> {
    let manifest = module_source.join("module.json");
    let bytes = std::fs::read(&manifest).map_err(|e| DriverError::InvalidModule {
        path: module_source.display().to_string(),
        reason: format!("read module.json: {}", e),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| DriverError::InvalidModule {
        path: module_source.display().to_string(),
        reason: format!("parse module.json: {}", e),
    })
}

// ── Recorded state ────────────────────────────────────────────────────────────

/// What the native driver knows about a realized op. Serialized into the
/// engine's opaque external-state blob.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct NativeRecord {
    op: NativeOp,
    /// Runtime object name (`cirro-<hex>` container / volume name, image tag).
    name: String,
    /// Container id when `op == container`.
    id: Option<String>,
    inputs_digest: String,
    outputs: HashMap<String, Value>,
}

impl NativeRecord {
    fn decode(prior: Option<&ExternalState>) -> Option<NativeRecord> {
        let prior = prior.filter(|p| !p.is_empty())?;
        match serde_json::from_slice(prior.as_bytes()) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "undecodable native external state; treating as absent");
                None
            }
        }
    }

    fn encode(&self) -> ExternalState {
        ExternalState::new(serde_json::to_vec(self).unwrap_or_default())
    }
}

// ── Driver impl ───────────────────────────────────────────────────────────────

#[async_trait]
impl Driver for NativeDriver {
    fn name(&self) -> &'static str {
        "native"
    }

    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            // A different image cannot be updated in place.
            immutable_inputs: vec!["image".to_string()],
            retry: Default::default(),
        }
    }

    async fn plan(
        &self,
        _cancel: &CancellationToken,
        module_source: &Path,
        inputs: &Value,
        prior: Option<&ExternalState>,
    ) -> Result<PlanResult, DriverError> {
        let module = load_module(module_source)?;
        let digest = input_digest(inputs);

        let result = match NativeRecord::decode(prior) {
            None => PlanResult {
                action: Action::Create,
                diff: format!("{} will be created", module.op.as_str()),
                estimated_outputs: None,
            },
            Some(record) if record.inputs_digest == digest => PlanResult {
                action: Action::Noop,
                diff: "no changes".to_string(),
                estimated_outputs: Some(record.outputs),
            },
            Some(record) => PlanResult {
                action: Action::Update,
                diff: format!("{} '{}' will be updated in place", module.op.as_str(), record.name),
                estimated_outputs: None,
            },
        };
        Ok(result)
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        inputs: &Value,
        prior: Option<&ExternalState>,
        action: Action,
    ) -> Result<ApplyResult, DriverError> {
        let module = load_module(module_source)?;
        let prior_record = NativeRecord::decode(prior);
        let digest = input_digest(inputs);

        // Re-applying a completed create is a noop with identical outputs.
        if let Some(record) = &prior_record {
            if action == Action::Noop
                || (action == Action::Create && record.inputs_digest == digest)
            {
                return Ok(ApplyResult {
                    outputs: record.outputs.clone(),
                    external_state: record.encode(),
                    logs: String::new(),
                });
            }
        }
        if action == Action::Noop {
            return Ok(ApplyResult {
                outputs: HashMap::new(),
                external_state: ExternalState::default(),
                logs: String::new(),
            });
        }

        let mut logs = String::new();

        // Replace and update both tear the old object down first; container
        // runtime objects are immutable once created.
        if let Some(record) = &prior_record {
            if matches!(action, Action::Replace | Action::Update) {
                logs.push_str(&self.teardown(cancel, record).await?);
            }
        }

        let name = match (&prior_record, action) {
            // An update keeps the stable name so outputs stay referenceable.
            (Some(record), Action::Update) => record.name.clone(),
            _ => format!("cirro-{}", &Uuid::new_v4().simple().to_string()[..12]),
        };

        let (id, run_logs) = match module.op {
            NativeOp::Container => {
                let image = module.image.clone().ok_or_else(|| DriverError::InvalidModule {
                    path: module_source.display().to_string(),
                    reason: "container op requires an image".to_string(),
                })?;
                let mut args = vec![
                    "run".to_string(),
                    "-d".to_string(),
                    "--name".to_string(),
                    name.clone(),
                ];
                for port in &module.ports {
                    args.push("-p".to_string());
                    args.push(port.to_string());
                }
                for (key, value) in env_from_inputs(inputs) {
                    args.push("-e".to_string());
                    args.push(format!("{}={}", key, value));
                }
                args.push(image);
                let (out, log) = self.run(cancel, &args).await?;
                (Some(out.trim().to_string()), log)
            }
            NativeOp::Volume => {
                let (_, log) = self
                    .run(cancel, &["volume".into(), "create".into(), name.clone()])
                    .await?;
                (None, log)
            }
            NativeOp::Build => {
                let source = module_source.display().to_string();
                let (_, log) = self
                    .run(cancel, &["build".into(), "-t".into(), name.clone(), source])
                    .await?;
                (None, log)
            }
            NativeOp::Synthetic => (None, String::new()),
        };
        logs.push_str(&run_logs);

        let outputs = render_outputs(&module, inputs, &name, id.as_deref());
        let record = NativeRecord {
            op: module.op,
            name,
            id,
            inputs_digest: digest,
            outputs: outputs.clone(),
        };

        info!(op = module.op.as_str(), name = %record.name, "native apply complete");
        Ok(ApplyResult {
            outputs,
            external_state: record.encode(),
            logs,
        })
    }

    async fn destroy(
        &self,
        cancel: &CancellationToken,
        _module_source: &Path,
        prior: Option<&ExternalState>,
    ) -> Result<DestroyResult, DriverError> {
        let Some(record) = NativeRecord::decode(prior) else {
            debug!("nothing recorded; nothing to destroy");
            return Ok(DestroyResult { logs: String::new() });
        };
        let logs = self.teardown(cancel, &record).await?;
        Ok(DestroyResult { logs })
    }

    async fn import(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        mappings: &[ImportMapping],
    ) -> Result<ImportResult, DriverError> {
        let module = load_module(module_source)?;
        let mapping = mappings
            .iter()
            .find(|m| m.address == module.op.as_str())
            .ok_or_else(|| {
                DriverError::Fatal(format!(
                    "no mapping for address '{}'",
                    module.op.as_str()
                ))
            })?;

        let mut logs = String::new();
        let id = match module.op {
            NativeOp::Container => {
                // Confirm the container exists before adopting it.
                let (out, log) = self
                    .run(
                        cancel,
                        &[
                            "inspect".into(),
                            "--format".into(),
                            "{{.Id}}".into(),
                            mapping.cloud_id.clone(),
                        ],
                    )
                    .await?;
                logs.push_str(&log);
                Some(out.trim().to_string())
            }
            _ => None,
        };

        let outputs = render_outputs(&module, &Value::Null, &mapping.cloud_id, id.as_deref());
        let record = NativeRecord {
            op: module.op,
            name: mapping.cloud_id.clone(),
            id,
            // Imported state has no rendered-input history; the next plan
            // reports an update until a deploy records one.
            inputs_digest: String::new(),
            outputs: outputs.clone(),
        };

        Ok(ImportResult {
            outputs,
            external_state: record.encode(),
            logs,
        })
    }

    fn discover_addresses(&self, module_source: &Path) -> Result<Vec<String>, DriverError> {
        let module = load_module(module_source)?;
        Ok(match module.op {
            NativeOp::Synthetic => vec![],
            op => vec![op.as_str().to_string()],
        })
    }
}

impl NativeDriver {
    async fn teardown(
        &self,
        cancel: &CancellationToken,
        record: &NativeRecord,
    ) -> Result<String, DriverError> {
        match record.op {
            NativeOp::Container => {
                let (_, logs) = self
                    .run(cancel, &["rm".into(), "-f".into(), record.name.clone()])
                    .await?;
                Ok(logs)
            }
            NativeOp::Volume => {
                let (_, logs) = self
                    .run(
                        cancel,
                        &["volume".into(), "rm".into(), "-f".into(), record.name.clone()],
                    )
                    .await?;
                Ok(logs)
            }
            NativeOp::Build => {
                let (_, logs) = self
                    .run(cancel, &["rmi".into(), "-f".into(), record.name.clone()])
                    .await?;
                Ok(logs)
            }
            NativeOp::Synthetic => Ok(String::new()),
        }
    }

    /// Run the container runtime CLI, honoring cancellation. Returns
    /// `(stdout, combined log)`.
    async fn run(
        &self,
        cancel: &CancellationToken,
        args: &[String],
    ) -> Result<(String, String), DriverError> {
        debug!(runtime = %self.runtime, ?args, "running container runtime command");

        let mut child = Command::new(&self.runtime)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Fatal(format!("spawn {}: {}", self.runtime, e)))?;

        let wait = child.wait_with_output();
        let output = tokio::select! {
            () = cancel.cancelled() => {
                // kill_on_drop reaps the child when the future is dropped.
                return Err(DriverError::Cancelled);
            }
            result = tokio::time::timeout(
                std::time::Duration::from_secs(COMMAND_TIMEOUT_SECS),
                wait,
            ) => match result {
                Err(_) => {
                    return Err(DriverError::Fatal(format!(
                        "{} {} timed out after {}s",
                        self.runtime,
                        args.first().map(String::as_str).unwrap_or(""),
                        COMMAND_TIMEOUT_SECS,
                    )));
                }
                Ok(wait_result) => wait_result
                    .map_err(|e| DriverError::Fatal(format!("wait {}: {}", self.runtime, e)))?,
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let mut logs = stdout.clone();
        logs.push_str(&stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(runtime = %self.runtime, code, "container runtime command exited non-zero");
            return Err(DriverError::Fatal(format!(
                "{} {} exited with code {}: {}",
                self.runtime,
                args.first().map(String::as_str).unwrap_or(""),
                code,
                stderr.trim(),
            )));
        }

        Ok((stdout, logs))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Top-level scalar inputs become container environment variables, sorted for
/// a stable command line.
fn env_from_inputs(inputs: &Value) -> Vec<(String, String)> {
    let Some(map) = inputs.as_object() else {
        return vec![];
    };
    let mut pairs: Vec<(String, String)> = map
        .iter()
        .filter_map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.to_uppercase(), value))
        })
        .collect();
    pairs.sort();
    pairs
}

/// Render the manifest's output templates. Placeholders: `{name}`, `{id}`,
/// `{image}`, `{inputs.<key>}`.
fn render_outputs(
    module: &NativeModule,
    inputs: &Value,
    name: &str,
    id: Option<&str>,
) -> HashMap<String, Value> {
    module
        .outputs
        .iter()
        .map(|(key, template)| {
            let mut rendered = template.replace("{name}", name);
            rendered = rendered.replace("{id}", id.unwrap_or(""));
            if let Some(image) = &module.image {
                rendered = rendered.replace("{image}", image);
            }
            if let Some(map) = inputs.as_object() {
                for (input_key, value) in map {
                    let needle = format!("{{inputs.{}}}", input_key);
                    if rendered.contains(&needle) {
                        let value = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        rendered = rendered.replace(&needle, &value);
                    }
                }
            }
            (key.clone(), Value::String(rendered))
        })
        .collect()
}
