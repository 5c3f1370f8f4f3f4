use thiserror::Error;

use cirro_domain::{ComponentName, DomainError};

use crate::node::NodeId;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Config(#[from] DomainError),

    #[error("no datacenter hook matched resource '{resource}' of component '{component}'")]
    NoHookMatched {
        component: ComponentName,
        resource: String,
    },

    #[error("hook variant for '{resource}' of component '{component}' declares {count} modules, expected exactly one")]
    AmbiguousHookModules {
        component: ComponentName,
        resource: String,
        count: usize,
    },

    #[error("node '{node}' references '{reference}' which does not exist")]
    UnresolvedReference { node: NodeId, reference: String },

    #[error("component '{component}' depends on '{dependency}' which is not part of the deployment")]
    UnknownDependency {
        component: ComponentName,
        dependency: ComponentName,
    },

    #[error("dependency cycle: {}", cycle.iter().map(|n| n.0.as_str()).collect::<Vec<_>>().join(" → "))]
    CyclicDependency { cycle: Vec<NodeId> },

    #[error("expression error in '{context}': {source}")]
    Expr {
        context: String,
        #[source]
        source: ExprError,
    },

    #[error("multiple errors")]
    Multiple(Vec<GraphError>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unterminated interpolation")]
    UnterminatedInterpolation,

    #[error("reference '{0}' cannot be resolved")]
    UnknownReference(String),

    #[error("condition must evaluate to a boolean, got {0}")]
    NonBooleanCondition(String),
}
