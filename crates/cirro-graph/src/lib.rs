pub mod builder;
pub mod error;
pub mod expr;
pub mod node;

pub use builder::{build, build_delete_graph, BuildRequest, PriorState};
pub use error::GraphError;
pub use expr::{extract_refs, render_value, Expr, RefResolver, Resolved, Template};
pub use node::{DriverBinding, Graph, Node, NodeId, NodeScope};
