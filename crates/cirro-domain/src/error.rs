use thiserror::Error;

use crate::types::{ComponentName, ResourceKind};

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown resource kind: {0}")]
    UnknownResourceKind(String),

    #[error("component '{component}' declares resource '{key}' more than once")]
    DuplicateResource { component: ComponentName, key: String },

    #[error("component '{component}' declares a {kind} resource with an empty name")]
    EmptyResourceName {
        component: ComponentName,
        kind: ResourceKind,
    },

    #[error("component '{component}' declares both top-level resources and instances")]
    MixedInstanceMode { component: ComponentName },

    #[error("component '{component}' instance weights sum to {total}, expected 100")]
    InstanceWeights { component: ComponentName, total: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
