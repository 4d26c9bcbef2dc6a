//! The pipeline DAG representation.
//!
//! A pipeline is an ordered list of nodes, each a single typed function call.
//! Clients submit pipelines as JSON (`inputs` as node-id strings); after
//! optimization an input may also be an inline literal produced by constant
//! folding.

use crate::error::{DfmError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Stable identifier of a node, unique within its pipeline.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// One upstream input of a node.
///
/// On the wire this is always a node-id string. The `Literal` form only
/// appears internally, when the optimizer folds a constant node into its
/// consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSource {
    /// The stream of values produced by another node in the same pipeline.
    Node(NodeId),
    /// A folded constant: a single-value, immediately-closed stream.
    Literal { literal: Value },
}

impl InputSource {
    /// The upstream node id, if this input is an edge.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            InputSource::Node(id) => Some(id),
            InputSource::Literal { .. } => None,
        }
    }
}

fn default_provider() -> String {
    "dfm".to_string()
}

fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A single function call in a pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    /// Client-assigned ("well-known") or deterministically generated id.
    pub node_id: NodeId,

    /// Registry tag selecting the function being invoked,
    /// e.g. `dfm.api.data_loader.LoadEra5ModelData`.
    pub api_class: String,

    /// Provider namespace resolving the adapter implementation.
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Parameter record, validated against the api-class schema.
    #[serde(default = "default_params")]
    pub params: Value,

    /// Ordered upstream inputs feeding this node.
    #[serde(default)]
    pub inputs: Vec<InputSource>,

    /// Pure ordering constraints: these nodes must reach a terminal state
    /// before this node becomes eligible. No values flow along these edges.
    #[serde(default)]
    pub after: Vec<NodeId>,

    /// Route produced values to the client response queue.
    #[serde(default)]
    pub is_output: bool,

    /// Skip cache lookups (always recompute); produced values may still be
    /// written to the cache.
    #[serde(default)]
    pub force_compute: bool,

    /// Earliest wall-clock time this node may run. Routed through the
    /// delayed-scheduling queue instead of the execution queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<chrono::DateTime<chrono::Utc>>,
}

impl Node {
    /// A minimal node with defaults for everything but identity and class.
    pub fn new(node_id: impl Into<NodeId>, api_class: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            api_class: api_class.into(),
            provider: default_provider(),
            params: default_params(),
            inputs: Vec::new(),
            after: Vec::new(),
            is_output: false,
            force_compute: false,
            not_before: None,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    #[must_use]
    pub fn with_inputs<I: Into<NodeId>>(mut self, inputs: impl IntoIterator<Item = I>) -> Self {
        self.inputs = inputs
            .into_iter()
            .map(|id| InputSource::Node(id.into()))
            .collect();
        self
    }

    #[must_use]
    pub fn with_after<I: Into<NodeId>>(mut self, after: impl IntoIterator<Item = I>) -> Self {
        self.after = after.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_not_before(mut self, when: chrono::DateTime<chrono::Utc>) -> Self {
        self.not_before = Some(when);
        self
    }

    #[must_use]
    pub fn output(mut self) -> Self {
        self.is_output = true;
        self
    }

    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force_compute = true;
        self
    }

    /// Upstream node ids among this node's inputs, in port order.
    pub fn input_node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.inputs.iter().filter_map(InputSource::node_id)
    }
}

/// An immutable DAG of nodes, as submitted by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    pub nodes: Vec<Node>,
}

impl Pipeline {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look a node up by id.
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.node_id == id)
    }

    /// Consumers of `id` via value edges, as `(consumer, port)` pairs in
    /// pipeline order.
    pub fn consumers(&self, id: &NodeId) -> Vec<(NodeId, usize)> {
        let mut out = Vec::new();
        for node in &self.nodes {
            for (port, input) in node.inputs.iter().enumerate() {
                if input.node_id() == Some(id) {
                    out.push((node.node_id.clone(), port));
                }
            }
        }
        out
    }

    /// Nodes listing `id` in their `after` set, in pipeline order.
    pub fn after_dependents(&self, id: &NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.after.contains(id))
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// Transitive dependents of `id` over both value and `after` edges,
    /// in pipeline order. Used for failure cascades.
    pub fn transitive_dependents(&self, id: &NodeId) -> Vec<NodeId> {
        let mut reached: HashSet<NodeId> = HashSet::new();
        let mut frontier: Vec<NodeId> = vec![id.clone()];
        while let Some(current) = frontier.pop() {
            for node in &self.nodes {
                if reached.contains(&node.node_id) || node.node_id == current {
                    continue;
                }
                let depends = node.input_node_ids().any(|up| *up == current)
                    || node.after.contains(&current);
                if depends {
                    reached.insert(node.node_id.clone());
                    frontier.push(node.node_id.clone());
                }
            }
        }
        self.nodes
            .iter()
            .filter(|n| reached.contains(&n.node_id))
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// Check that every `inputs`/`after` edge points at a node in this
    /// pipeline and that node ids are unique.
    pub fn validate_edges(&self) -> Result<()> {
        let mut seen: HashSet<&NodeId> = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.node_id) {
                return Err(DfmError::BadPipeline(format!(
                    "duplicate node_id '{}'",
                    node.node_id
                )));
            }
        }
        for node in &self.nodes {
            for upstream in node.input_node_ids() {
                if !seen.contains(upstream) {
                    return Err(DfmError::BadPipeline(format!(
                        "node '{}' has input edge to unknown node '{upstream}'",
                        node.node_id
                    )));
                }
            }
            for target in &node.after {
                if !seen.contains(target) {
                    return Err(DfmError::BadPipeline(format!(
                        "node '{}' has after edge to unknown node '{target}'",
                        node.node_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Topological order over value and `after` edges. Fails on cycles.
    pub fn topo_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree: HashMap<&NodeId, usize> = HashMap::new();
        let mut edges: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for node in &self.nodes {
            indegree.entry(&node.node_id).or_insert(0);
            for upstream in node
                .input_node_ids()
                .chain(node.after.iter())
            {
                edges.entry(upstream).or_default().push(&node.node_id);
                *indegree.entry(&node.node_id).or_insert(0) += 1;
            }
        }

        // Seed with zero-indegree nodes in pipeline order for determinism.
        let mut queue: VecDeque<&NodeId> = self
            .nodes
            .iter()
            .filter(|n| indegree.get(&n.node_id) == Some(&0))
            .map(|n| &n.node_id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(downstream) = edges.get(id) {
                for d in downstream {
                    if let Some(deg) = indegree.get_mut(d) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(d);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(DfmError::BadPipeline(
                "pipeline contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }
}
