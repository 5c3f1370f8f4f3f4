use thiserror::Error;

use cirro_domain::{ComponentName, DomainError, EnvironmentName};
use cirro_driver::DriverError;
use cirro_graph::GraphError;
use cirro_store::StoreError;

use crate::planner::PlanError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] DomainError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    State(#[from] StoreError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("environment '{0}' does not exist")]
    UnknownEnvironment(EnvironmentName),

    #[error("component '{0}' does not exist in this environment")]
    UnknownComponent(ComponentName),

    #[error("node '{0}' is not part of the graph")]
    UnknownNode(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}
