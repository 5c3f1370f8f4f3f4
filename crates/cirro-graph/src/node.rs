use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use cirro_domain::{ComponentName, ResourceKind};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;

/// Stable node identifier: `component/kind/name` for component resources,
/// `datacenter/module/name` and `environment/module/name` for root modules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        NodeId(s.into())
    }

    pub fn for_resource(component: &str, kind: ResourceKind, name: &str) -> Self {
        NodeId(format!("{}/{}/{}", component, kind, name))
    }

    pub fn for_datacenter_module(name: &str) -> Self {
        NodeId(format!("datacenter/module/{}", name))
    }

    pub fn for_environment_module(name: &str) -> Self {
        NodeId(format!("environment/module/{}", name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a node's state record lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeScope {
    /// A component resource; `instance` is set for multi-instance components
    /// (the component acts as the virtual component `name@instance`).
    Component {
        component: ComponentName,
        instance: Option<String>,
    },
    /// An environment-level module; state lives in the environment record.
    Environment,
    /// A datacenter root module; state lives in the datacenter record.
    Datacenter,
}

impl NodeScope {
    pub fn component(&self) -> Option<&ComponentName> {
        match self {
            NodeScope::Component { component, .. } => Some(component),
            _ => None,
        }
    }
}

/// The driver binding selected for a node by hook matching (or declared
/// directly for modules).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverBinding {
    pub driver: String,
    pub module_name: String,
    pub module_source: PathBuf,
}

/// One unit of work in the execution DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: ResourceKind,
    pub name: String,
    pub scope: NodeScope,
    pub depends_on: BTreeSet<NodeId>,
    /// Input template; `${…}` expressions not yet rendered.
    pub inputs: Value,
    pub binding: DriverBinding,
    /// Present in state but absent from the target: plan as delete.
    pub delete_only: bool,
}

impl Node {
    /// Resource key within its component state: `kind.name`.
    pub fn resource_key(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }
}

/// The typed dependency DAG. Node iteration is ordered by id so builder
/// output and plans diff stably across runs.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Map from node to the nodes depending on it.
    pub fn successors(&self) -> HashMap<NodeId, Vec<NodeId>> {
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                successors
                    .entry(dep.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }
        successors
    }

    /// Reject any cycle, reporting the members of the first non-trivial
    /// strongly connected component in id order.
    pub fn check_acyclic(&self) -> Result<(), GraphError> {
        let graph = self.petgraph();

        for component in tarjan_scc(&graph) {
            if component.len() > 1 {
                let mut cycle: Vec<NodeId> = component
                    .iter()
                    .map(|idx| graph[*idx].clone())
                    .collect();
                cycle.sort();
                return Err(GraphError::CyclicDependency { cycle });
            }
        }

        // Tarjan reports self-loops as size-1 components; catch them here.
        for node in self.nodes.values() {
            if node.depends_on.contains(&node.id) {
                return Err(GraphError::CyclicDependency {
                    cycle: vec![node.id.clone()],
                });
            }
        }

        Ok(())
    }

    /// Deterministic topological order: Kahn's algorithm with an id-sorted
    /// frontier.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
        self.check_acyclic()?;

        let successors = self.successors();
        let mut in_degree: BTreeMap<&NodeId, usize> = self
            .nodes
            .values()
            .map(|n| (&n.id, n.depends_on.len()))
            .collect();

        let mut ready: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.iter().next().copied() {
            ready.remove(id);
            order.push(id.clone());
            for successor in successors.get(id).into_iter().flatten() {
                let degree = in_degree
                    .get_mut(successor)
                    .expect("successor is a graph node");
                *degree -= 1;
                if *degree == 0 {
                    let (key, _) = self
                        .nodes
                        .get_key_value(successor)
                        .expect("successor is a graph node");
                    ready.insert(key);
                }
            }
        }

        Ok(order)
    }

    /// Topological layers: layer N holds nodes whose longest dependency chain
    /// has length N. Each layer is sorted by id.
    pub fn topo_layers(&self) -> Result<Vec<Vec<NodeId>>, GraphError> {
        let order = self.topo_order()?;
        let mut depth: HashMap<&NodeId, usize> = HashMap::new();
        let mut layers: Vec<Vec<NodeId>> = Vec::new();

        for id in &order {
            let node = &self.nodes[id];
            let level = node
                .depends_on
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(&node.id, level);
            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(id.clone());
        }

        Ok(layers)
    }

    fn petgraph(&self) -> DiGraph<NodeId, ()> {
        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let index_of: HashMap<&NodeId, NodeIndex> = self
            .nodes
            .keys()
            .map(|id| (id, graph.add_node(id.clone())))
            .collect();
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                if let Some(&from) = index_of.get(dep) {
                    graph.add_edge(from, index_of[&node.id], ());
                }
            }
        }
        graph
    }
}
