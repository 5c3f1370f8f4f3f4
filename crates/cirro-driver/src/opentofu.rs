use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cirro_domain::Action;
use cirro_store::ExternalState;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{
    ApplyResult, DestroyResult, Driver, ImportMapping, ImportResult, PlanResult,
};
use crate::error::DriverError;

const COMMAND_TIMEOUT_SECS: u64 = 1800;

/// Driver that realizes modules by invoking the `tofu` binary (the
/// `terraform` binary works unchanged via [`OpenTofuDriver::with_binary`]).
///
/// Each call materializes an ephemeral workspace: the module's `.tf` files
/// are linked in, inputs land in `cirro.auto.tfvars.json`, and the prior
/// external-state blob is written back as the local `terraform.tfstate`. The
/// updated state file is returned verbatim as the new external state, so the
/// engine remains the single place module state is persisted.
pub struct OpenTofuDriver {
    binary: String,
    workspace_root: PathBuf,
}

impl OpenTofuDriver {
    pub fn new() -> Self {
        Self::with_binary("tofu")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            workspace_root: std::env::temp_dir().join("cirro-opentofu"),
        }
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }
}

impl Default for OpenTofuDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for OpenTofuDriver {
    fn name(&self) -> &'static str {
        "opentofu"
    }

    async fn plan(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        inputs: &Value,
        prior: Option<&ExternalState>,
    ) -> Result<PlanResult, DriverError> {
        let workspace = self.prepare_workspace(module_source, Some(inputs), prior).await?;
        let result = async {
            self.init(cancel, &workspace.dir).await?;

            // -detailed-exitcode: 0 = no changes, 2 = changes pending.
            let (code, log) = self
                .run(
                    cancel,
                    &workspace.dir,
                    &["plan", "-no-color", "-input=false", "-detailed-exitcode"],
                )
                .await?;

            let action = match code {
                0 => Action::Noop,
                2 if prior.map_or(true, ExternalState::is_empty) => Action::Create,
                2 => Action::Update,
                _ => {
                    return Err(DriverError::Fatal(format!(
                        "{} plan exited with code {}: {}",
                        self.binary,
                        code,
                        tail(&log, 10),
                    )))
                }
            };

            Ok(PlanResult {
                action,
                diff: log,
                estimated_outputs: None,
            })
        }
        .await;
        workspace.cleanup().await;
        result
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        inputs: &Value,
        prior: Option<&ExternalState>,
        action: Action,
    ) -> Result<ApplyResult, DriverError> {
        let workspace = self.prepare_workspace(module_source, Some(inputs), prior).await?;
        let result = async {
            self.init(cancel, &workspace.dir).await?;
            let mut logs = String::new();

            // Replace is destroy + create, atomic from the engine's
            // perspective: a failure between the two leaves the state file
            // reflecting the destroy, which the returned blob captures.
            if action == Action::Replace {
                let (code, destroy_log) = self
                    .run(
                        cancel,
                        &workspace.dir,
                        &["destroy", "-auto-approve", "-no-color", "-input=false"],
                    )
                    .await?;
                logs.push_str(&destroy_log);
                if code != 0 {
                    return Err(DriverError::Fatal(format!(
                        "{} destroy (replace) exited with code {}: {}",
                        self.binary,
                        code,
                        tail(&destroy_log, 10),
                    )));
                }
            }

            let (code, apply_log) = self
                .run(
                    cancel,
                    &workspace.dir,
                    &["apply", "-auto-approve", "-no-color", "-input=false"],
                )
                .await?;
            logs.push_str(&apply_log);
            if code != 0 {
                return Err(DriverError::Fatal(format!(
                    "{} apply exited with code {}: {}",
                    self.binary,
                    code,
                    tail(&apply_log, 10),
                )));
            }

            let outputs = self.read_outputs(cancel, &workspace.dir).await?;
            let external_state = workspace.read_state().await?;

            info!(module = %module_source.display(), "opentofu apply complete");
            Ok(ApplyResult {
                outputs,
                external_state,
                logs,
            })
        }
        .await;
        workspace.cleanup().await;
        result
    }

    async fn destroy(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        prior: Option<&ExternalState>,
    ) -> Result<DestroyResult, DriverError> {
        if prior.map_or(true, ExternalState::is_empty) {
            debug!(module = %module_source.display(), "no recorded state; nothing to destroy");
            return Ok(DestroyResult { logs: String::new() });
        }

        let workspace = self.prepare_workspace(module_source, None, prior).await?;
        let result = async {
            self.init(cancel, &workspace.dir).await?;
            let (code, logs) = self
                .run(
                    cancel,
                    &workspace.dir,
                    &["destroy", "-auto-approve", "-no-color", "-input=false"],
                )
                .await?;
            if code != 0 {
                return Err(DriverError::Fatal(format!(
                    "{} destroy exited with code {}: {}",
                    self.binary,
                    code,
                    tail(&logs, 10),
                )));
            }
            Ok(DestroyResult { logs })
        }
        .await;
        workspace.cleanup().await;
        result
    }

    async fn import(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        mappings: &[ImportMapping],
    ) -> Result<ImportResult, DriverError> {
        let workspace = self.prepare_workspace(module_source, None, None).await?;
        let result = async {
            self.init(cancel, &workspace.dir).await?;
            let mut logs = String::new();

            for mapping in mappings {
                let (code, log) = self
                    .run(
                        cancel,
                        &workspace.dir,
                        &[
                            "import",
                            "-no-color",
                            "-input=false",
                            &mapping.address,
                            &mapping.cloud_id,
                        ],
                    )
                    .await?;
                logs.push_str(&log);
                if code != 0 {
                    return Err(DriverError::Fatal(format!(
                        "{} import {} exited with code {}: {}",
                        self.binary,
                        mapping.address,
                        code,
                        tail(&log, 10),
                    )));
                }
            }

            let outputs = self.read_outputs(cancel, &workspace.dir).await?;
            let external_state = workspace.read_state().await?;
            Ok(ImportResult {
                outputs,
                external_state,
                logs,
            })
        }
        .await;
        workspace.cleanup().await;
        result
    }

    /// Scan `.tf` files for `resource "type" "name"` blocks. Static; the
    /// binary is not invoked.
    fn discover_addresses(&self, module_source: &Path) -> Result<Vec<String>, DriverError> {
        let entries = std::fs::read_dir(module_source).map_err(|e| DriverError::InvalidModule {
            path: module_source.display().to_string(),
            reason: format!("read module dir: {}", e),
        })?;

        let mut addresses = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "tf") {
                continue;
            }
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                DriverError::InvalidModule {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            for line in contents.lines() {
                if let Some(address) = parse_resource_address(line) {
                    addresses.push(address);
                }
            }
        }
        addresses.sort();
        Ok(addresses)
    }
}

// ── Workspace ─────────────────────────────────────────────────────────────────

struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    async fn read_state(&self) -> Result<ExternalState, DriverError> {
        match tokio::fs::read(self.dir.join("terraform.tfstate")).await {
            Ok(bytes) => Ok(ExternalState::new(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ExternalState::default()),
            Err(e) => Err(DriverError::Fatal(format!("read state file: {}", e))),
        }
    }

    async fn cleanup(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            debug!(dir = %self.dir.display(), error = %e, "workspace cleanup failed");
        }
    }
}

impl OpenTofuDriver {
    async fn prepare_workspace(
        &self,
        module_source: &Path,
        inputs: Option<&Value>,
        prior: Option<&ExternalState>,
    ) -> Result<Workspace, DriverError> {
        let dir = self
            .workspace_root
            .join(Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DriverError::Fatal(format!("create workspace dir: {}", e)))?;

        link_tf_files(&dir, module_source).await?;

        if let Some(inputs) = inputs {
            write_tfvars(&dir, inputs)?;
        }
        if let Some(prior) = prior.filter(|p| !p.is_empty()) {
            tokio::fs::write(dir.join("terraform.tfstate"), prior.as_bytes())
                .await
                .map_err(|e| DriverError::Fatal(format!("write state file: {}", e)))?;
        }

        Ok(Workspace { dir })
    }

    async fn init(&self, cancel: &CancellationToken, workspace: &Path) -> Result<(), DriverError> {
        let (code, log) = self
            .run(cancel, workspace, &["init", "-no-color", "-input=false"])
            .await?;
        if code != 0 {
            return Err(DriverError::Fatal(format!(
                "{} init exited with code {}: {}",
                self.binary,
                code,
                tail(&log, 10),
            )));
        }
        Ok(())
    }

    /// Run a sub-command, capturing combined stdout+stderr in arrival order.
    /// Returns `(exit_code, combined_log)`.
    async fn run(
        &self,
        cancel: &CancellationToken,
        workspace: &Path,
        args: &[&str],
    ) -> Result<(i32, String), DriverError> {
        info!(binary = %self.binary, ?args, workspace = %workspace.display(), "running IaC command");

        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(workspace)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Fatal(format!("spawn {}: {}", self.binary, e)))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            DriverError::Fatal("child stdout not piped".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            DriverError::Fatal("child stderr not piped".to_string())
        })?;

        // Merge the two streams by reading them concurrently into a channel;
        // each line is mirrored to tracing for live visibility.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let tx2 = tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(line);
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx2.send(line);
            }
        });

        let mut log = String::new();
        let collect = async {
            while let Some(line) = rx.recv().await {
                debug!(target: "cirro::iac", "{}", line);
                log.push_str(&line);
                log.push('\n');
            }
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(DriverError::Cancelled);
            }
            result = tokio::time::timeout(
                std::time::Duration::from_secs(COMMAND_TIMEOUT_SECS),
                collect,
            ) => result,
        };

        stdout_task.await.ok();
        stderr_task.await.ok();

        if outcome.is_err() {
            let _ = child.kill().await;
            return Err(DriverError::Fatal(format!(
                "{} {} timed out after {} minutes",
                self.binary,
                args.first().copied().unwrap_or(""),
                COMMAND_TIMEOUT_SECS / 60,
            )));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DriverError::Fatal(format!("wait {}: {}", self.binary, e)))?;

        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(binary = %self.binary, code, "IaC command exited non-zero");
        }
        Ok((code, log))
    }

    /// Run `output -json` and collect every declared output's value.
    async fn read_outputs(
        &self,
        cancel: &CancellationToken,
        workspace: &Path,
    ) -> Result<HashMap<String, Value>, DriverError> {
        let (code, log) = self
            .run(cancel, workspace, &["output", "-json", "-no-color"])
            .await?;
        if code != 0 {
            return Err(DriverError::Fatal(format!(
                "{} output exited with code {}",
                self.binary, code,
            )));
        }

        let map: Value = serde_json::from_str(log.trim())
            .map_err(|e| DriverError::Fatal(format!("parse {} output: {}", self.binary, e)))?;
        let Some(object) = map.as_object() else {
            return Ok(HashMap::new());
        };

        Ok(object
            .iter()
            .filter_map(|(key, entry)| {
                entry.get("value").map(|v| (key.clone(), v.clone()))
            })
            .collect())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Symlink all `.tf` files from `source_dir` into `workspace`. The workspace
/// is fresh per call, so there are no stale links to replace.
async fn link_tf_files(workspace: &Path, source_dir: &Path) -> Result<(), DriverError> {
    let mut read_dir = tokio::fs::read_dir(source_dir)
        .await
        .map_err(|e| DriverError::InvalidModule {
            path: source_dir.display().to_string(),
            reason: format!("read module dir: {}", e),
        })?;

    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| DriverError::Fatal(e.to_string()))?
    {
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(".tf") {
            continue;
        }
        let link = workspace.join(&name);
        let target = tokio::fs::canonicalize(entry.path())
            .await
            .map_err(|e| DriverError::Fatal(format!("canonicalize {:?}: {}", entry.path(), e)))?;

        #[cfg(unix)]
        tokio::fs::symlink(&target, &link)
            .await
            .map_err(|e| DriverError::Fatal(format!("symlink {:?} → {:?}: {}", link, target, e)))?;

        #[cfg(not(unix))]
        tokio::fs::copy(&target, &link)
            .await
            .map_err(|e| DriverError::Fatal(format!("copy {:?} → {:?}: {}", target, link, e)))?;
    }

    Ok(())
}

/// Write the rendered inputs as `cirro.auto.tfvars.json`. JSON tfvars keep
/// the inputs typed; no HCL quoting rules to get wrong.
fn write_tfvars(workspace: &Path, inputs: &Value) -> Result<(), DriverError> {
    let object = match inputs {
        Value::Object(_) => inputs.clone(),
        Value::Null => Value::Object(serde_json::Map::new()),
        other => {
            return Err(DriverError::Fatal(format!(
                "module inputs must be an object, got {}",
                other
            )))
        }
    };
    let bytes = serde_json::to_vec_pretty(&object)
        .map_err(|e| DriverError::Fatal(format!("serialize tfvars: {}", e)))?;
    std::fs::write(workspace.join("cirro.auto.tfvars.json"), bytes)
        .map_err(|e| DriverError::Fatal(format!("write cirro.auto.tfvars.json: {}", e)))?;
    Ok(())
}

/// Parse a `resource "type" "name"` block opener into `type.name`.
fn parse_resource_address(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("resource")?;
    if !rest.starts_with([' ', '\t', '"']) {
        return None;
    }
    let mut quoted = rest.split('"');
    quoted.next()?; // before first quote
    let resource_type = quoted.next()?;
    quoted.next()?; // between the two labels
    let resource_name = quoted.next()?;
    if resource_type.is_empty() || resource_name.is_empty() {
        return None;
    }
    Some(format!("{}.{}", resource_type, resource_name))
}

/// Last `n` lines of a log, for compact error messages.
fn tail(log: &str, n: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
