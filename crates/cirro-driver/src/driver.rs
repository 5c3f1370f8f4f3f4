use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use cirro_domain::Action;
use cirro_store::ExternalState;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::DriverError;

/// Result of a side-effect-free `plan` call.
#[derive(Debug, Clone)]
pub struct PlanResult {
    pub action: Action,
    /// Human-readable change summary.
    pub diff: String,
    /// Outputs the driver can predict without applying, if any.
    pub estimated_outputs: Option<HashMap<String, Value>>,
}

/// Result of a successful `apply` call.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Typed outputs produced by the module.
    pub outputs: HashMap<String, Value>,
    /// The provider's view of reality after the apply. Must reflect partial
    /// successes; the engine stores it verbatim.
    pub external_state: ExternalState,
    /// Combined captured driver output.
    pub logs: String,
}

#[derive(Debug, Clone)]
pub struct DestroyResult {
    pub logs: String,
}

/// One `(driver-internal address, cloud id)` pair for adopting an existing
/// cloud resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportMapping {
    pub address: String,
    pub cloud_id: String,
}

#[derive(Debug, Clone)]
pub struct ImportResult {
    pub outputs: HashMap<String, Value>,
    pub external_state: ExternalState,
    pub logs: String,
}

/// Driver-internal retry behavior, surfaced for reporting. The engine never
/// retries on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

/// Static facts about a driver the planner consults.
#[derive(Debug, Clone, Default)]
pub struct DriverMetadata {
    /// Input paths (dot-separated, e.g. `type`) whose change forces a
    /// replace instead of an update. Empty means the driver decides
    /// internally and `update` is planned by default.
    pub immutable_inputs: Vec<String>,
    pub retry: RetryPolicy,
}

/// The capability contract every IaC backend satisfies.
///
/// Instances are created per operation through the
/// [`DriverRegistry`](crate::DriverRegistry) and dropped when the operation
/// ends. All inputs arrive fully rendered; expression resolution never
/// reaches a driver.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn metadata(&self) -> DriverMetadata {
        DriverMetadata::default()
    }

    /// Compute the change applying `inputs` would make. Side-effect free with
    /// respect to cloud state; read-only probes are permitted.
    async fn plan(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        inputs: &Value,
        prior: Option<&ExternalState>,
    ) -> Result<PlanResult, DriverError>;

    /// Realize `inputs`. Idempotent with respect to `prior`: re-applying a
    /// completed create yields a noop with identical outputs. Must return
    /// promptly with [`DriverError::Cancelled`] when `cancel` fires.
    async fn apply(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        inputs: &Value,
        prior: Option<&ExternalState>,
        action: Action,
    ) -> Result<ApplyResult, DriverError>;

    async fn destroy(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        prior: Option<&ExternalState>,
    ) -> Result<DestroyResult, DriverError>;

    /// Adopt existing cloud resources into the driver's external state.
    async fn import(
        &self,
        cancel: &CancellationToken,
        module_source: &Path,
        mappings: &[ImportMapping],
    ) -> Result<ImportResult, DriverError>;

    /// Enumerate the driver-internal addresses a module declares. Static; no
    /// cloud I/O. Used by import-mapping tools.
    fn discover_addresses(&self, module_source: &Path) -> Result<Vec<String>, DriverError>;
}
