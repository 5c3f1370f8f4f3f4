pub mod error;
pub mod types;


pub use error::DomainError;
pub use types::{
    Action, Component, ComponentDependency, ComponentInstance, ComponentName,
    Datacenter, DatacenterName, Environment, EnvironmentName, HookVariant,
    ModuleSpec, ResourceKind, ResourceSpec, ResourceStatus, VariableSpec,
};
