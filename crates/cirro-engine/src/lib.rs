pub mod engine;
pub mod error;
pub mod executor;
pub mod planner;
pub mod report;

pub use engine::{
    DeployRequest, DestroyRequest, Engine, ImportOutcome, ImportRequest, OperationSignals,
};
pub use error::EngineError;
pub use executor::{ExecutionReport, Executor};
pub use planner::{ActionTotals, NodeSummary, Plan, PlanChange, PlanError};
pub use report::{
    DeployResult, ExecutionSummary, NodeError, NodeStatus, OnPlan, OnProgress,
    ProgressEvent, ResolvedDependency,
};
