//! Graph snapshot - the immutable workflow definition the runtime executes.
//!
//! A [`GraphSnapshot`] is the runtime's view of one parsed DSL program:
//! nodes (states, tasks, tools, contexts, inputs, outputs, start/end
//! markers) and edges (control, data, transform, dependency) addressed **by
//! name**, with adjacency resolved through indices rather than live
//! pointers. That keeps the whole definition plain, serializable data even
//! when the drawn graph is cyclic, and lets an `ExecutionState` carry its
//! snapshot through checkpoints.
//!
//! The snapshot is owned by the runtime for the lifetime of one execution.
//! It only changes through the meta-programming tools, which build a fresh
//! snapshot rather than mutating the one already referenced by earlier
//! states.
//!
//! # Semantic edge kinds
//!
//! Whether an edge can ever cause a transition is decided by its semantic
//! kind: `control` and `transform` edges transition, `data` and
//! `dependency` edges only declare read/write permission or ordering. The
//! kind is resolved once at snapshot construction, from the first matching
//! source in priority order:
//!
//! 1. the arrow token the DSL author wrote (`->`, `=>`, `-->`, `..>`)
//! 2. an explicit kind annotation (`@data`, `@transform`, ...)
//! 3. a keyword in the edge label ("reads", "writes", "requires", ...)
//! 4. a `type` attribute on the edge
//! 5. inference from the endpoint node kinds (context ⇒ data, tool ⇒
//!    dependency, otherwise control)
//!
//! # Example
//!
//! ```rust
//! use agentflow_core::graph::{Edge, EdgeKind, GraphSnapshot, Node, NodeKind};
//!
//! let snapshot = GraphSnapshot::new(
//!     vec![
//!         Node::new("begin", NodeKind::Start),
//!         Node::new("work", NodeKind::Task),
//!         Node::new("done", NodeKind::End),
//!     ],
//!     vec![
//!         Edge::new("begin", "work"),
//!         Edge::new("work", "done").with_condition("finished == true"),
//!     ],
//! );
//!
//! assert!(snapshot.validate().is_ok());
//! assert_eq!(snapshot.outgoing("work")[0].semantic_kind(), EdgeKind::Control);
//! ```

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

/// Kind of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A workflow state
    State,
    /// A unit of work, possibly agent-driven
    Task,
    /// An external capability attached to tasks
    Tool,
    /// A holder of mutable runtime attribute values
    Context,
    /// An external input source
    Input,
    /// An external output sink
    Output,
    /// An execution entry point
    Start,
    /// An execution exit point
    End,
}

/// One node of the workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique name; dotted names (`pipeline.fetch`) express scope nesting
    pub name: String,

    /// Node kind
    pub kind: NodeKind,

    /// Attribute map from the DSL (`prompt`, `max_turns`, declared context
    /// fields, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Value>,

    /// Raw annotations carried through from the DSL
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
}

impl Node {
    /// Create a node with no attributes or annotations.
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            attributes: HashMap::new(),
            annotations: Vec::new(),
        }
    }

    /// Builder-style attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Builder-style annotation.
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotations.push(annotation.into());
        self
    }

    /// Attribute lookup.
    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// String attribute lookup.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Truthy attribute lookup (`true`, non-empty string, non-zero number).
    pub fn attr_truthy(&self, key: &str) -> bool {
        match self.attributes.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty() && s != "false",
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    /// The node's agent prompt, when it has one.
    pub fn prompt(&self) -> Option<&str> {
        self.attr_str("prompt")
    }

    /// True when executing this node requires an agent decision.
    pub fn requires_agent(&self) -> bool {
        self.prompt().is_some()
    }

    /// Per-node turn budget override.
    pub fn max_turns(&self) -> Option<u32> {
        self.attr("max_turns")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
    }

    /// True when the node prefers the generated-code path over the agent.
    pub fn prefers_code(&self) -> bool {
        self.attr_truthy("codegen") || self.annotations.iter().any(|a| a == "@codegen")
    }

    /// True when the node itself grants the meta capability.
    pub fn grants_meta(&self) -> bool {
        self.attr_truthy("meta")
    }

    /// Enclosing scope names, nearest first (`a.b.c` → `a.b`, `a`).
    pub fn scope_ancestors(&self) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut name = self.name.as_str();
        while let Some(idx) = name.rfind('.') {
            name = &name[..idx];
            ancestors.push(name.to_string());
        }
        ancestors
    }
}

/// Semantic classification of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Transitions execution between nodes
    Control,
    /// Declares context read/write permission; never transitions
    Data,
    /// Transitions while reshaping data
    Transform,
    /// Declares ordering/attachment; never transitions
    Dependency,
}

impl EdgeKind {
    /// Whether edges of this kind can ever fire a transition.
    pub fn can_transition(&self) -> bool {
        matches!(self, EdgeKind::Control | EdgeKind::Transform)
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "control" => Some(EdgeKind::Control),
            "data" => Some(EdgeKind::Data),
            "transform" => Some(EdgeKind::Transform),
            "dep" | "dependency" => Some(EdgeKind::Dependency),
            _ => None,
        }
    }
}

/// Structured edge annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeAnnotation {
    /// `@auto` - transition fires without consulting the agent
    Auto,
    /// `@parallel` - fork a new path at evaluation time
    Parallel,
    /// `@async` - spawn a detached path (or offer a spawn tool)
    Async,
    /// `@barrier(name[, group])` - synchronization point
    Barrier {
        /// Barrier name
        name: String,
        /// Optional group membership this arrival counts for
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
    /// `@map(source[, group])` - data-driven fan-out
    Map {
        /// Qualified context field holding the array (`Items.pending`)
        source: String,
        /// Optional group id stamped onto spawned paths
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
    /// Anything else, carried through verbatim
    Other {
        /// Raw annotation text without the leading `@`
        raw: String,
    },
}

impl EdgeAnnotation {
    /// Parse a raw DSL annotation (`"@barrier(sync, readers)"`).
    pub fn parse(raw: &str) -> Self {
        let body = raw.trim().trim_start_matches('@');
        let (head, args) = match body.find('(') {
            Some(idx) if body.ends_with(')') => {
                (&body[..idx], Some(&body[idx + 1..body.len() - 1]))
            }
            _ => (body, None),
        };

        let split_args = |args: &str| -> (String, Option<String>) {
            let mut parts = args.splitn(2, ',').map(|p| p.trim().to_string());
            let first = parts.next().unwrap_or_default();
            let second = parts.next().filter(|s| !s.is_empty());
            (first, second)
        };

        match head {
            "auto" => EdgeAnnotation::Auto,
            "parallel" => EdgeAnnotation::Parallel,
            "async" => EdgeAnnotation::Async,
            "barrier" => {
                let (name, group) = split_args(args.unwrap_or(""));
                EdgeAnnotation::Barrier { name, group }
            }
            "map" => {
                let (source, group) = split_args(args.unwrap_or(""));
                EdgeAnnotation::Map { source, group }
            }
            _ => EdgeAnnotation::Other {
                raw: body.to_string(),
            },
        }
    }
}

/// One edge of the workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node name
    pub source: String,

    /// Target node name
    pub target: String,

    /// Arrow token the DSL author wrote, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrow: Option<String>,

    /// Resolved semantic kind; filled at snapshot construction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EdgeKind>,

    /// Condition expression gating the edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Structured annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<EdgeAnnotation>,

    /// Human label from the DSL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Attribute map from the DSL
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Value>,
}

impl Edge {
    /// Create a bare edge between two nodes.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            arrow: None,
            kind: None,
            condition: None,
            annotations: Vec::new(),
            label: None,
            attributes: HashMap::new(),
        }
    }

    /// Builder-style arrow token.
    pub fn with_arrow(mut self, arrow: impl Into<String>) -> Self {
        self.arrow = Some(arrow.into());
        self
    }

    /// Builder-style explicit kind (bypasses resolution).
    pub fn with_kind(mut self, kind: EdgeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Builder-style condition expression.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Builder-style annotation.
    pub fn with_annotation(mut self, annotation: EdgeAnnotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    /// Builder-style label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Builder-style attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Resolved semantic kind. Defaults to control for edges that were
    /// never run through snapshot construction.
    pub fn semantic_kind(&self) -> EdgeKind {
        self.kind.unwrap_or(EdgeKind::Control)
    }

    /// `@auto` present.
    pub fn is_auto(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| matches!(a, EdgeAnnotation::Auto))
    }

    /// `@parallel` present.
    pub fn is_parallel(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| matches!(a, EdgeAnnotation::Parallel))
    }

    /// `@async` present.
    pub fn is_async(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| matches!(a, EdgeAnnotation::Async))
    }

    /// `@barrier` spec, when present.
    pub fn barrier(&self) -> Option<(&str, Option<&str>)> {
        self.annotations.iter().find_map(|a| match a {
            EdgeAnnotation::Barrier { name, group } => Some((name.as_str(), group.as_deref())),
            _ => None,
        })
    }

    /// `@map` spec, when present.
    pub fn map_spec(&self) -> Option<(&str, Option<&str>)> {
        self.annotations.iter().find_map(|a| match a {
            EdgeAnnotation::Map { source, group } => Some((source.as_str(), group.as_deref())),
            _ => None,
        })
    }

    /// True when no synchronization annotation is attached.
    pub fn is_plain(&self) -> bool {
        !self.is_parallel() && !self.is_async() && self.barrier().is_none() && self.map_spec().is_none()
    }
}

fn kind_from_arrow(arrow: &str) -> Option<EdgeKind> {
    match arrow {
        "->" => Some(EdgeKind::Control),
        "=>" => Some(EdgeKind::Transform),
        "-->" => Some(EdgeKind::Data),
        "..>" | "-.->" => Some(EdgeKind::Dependency),
        _ => None,
    }
}

fn kind_from_annotations(annotations: &[EdgeAnnotation]) -> Option<EdgeKind> {
    annotations.iter().find_map(|a| match a {
        EdgeAnnotation::Other { raw } => EdgeKind::parse(raw),
        _ => None,
    })
}

fn kind_from_label(label: &str) -> Option<EdgeKind> {
    let lower = label.to_lowercase();
    if lower.contains("transform") {
        Some(EdgeKind::Transform)
    } else if lower.contains("read") || lower.contains("write") || lower.contains("data") {
        Some(EdgeKind::Data)
    } else if lower.contains("depend") || lower.contains("require") {
        Some(EdgeKind::Dependency)
    } else {
        None
    }
}

fn kind_from_attributes(attributes: &HashMap<String, Value>) -> Option<EdgeKind> {
    attributes
        .get("type")
        .and_then(Value::as_str)
        .and_then(EdgeKind::parse)
}

fn kind_from_node_kinds(source: Option<NodeKind>, target: Option<NodeKind>) -> EdgeKind {
    let touches = |k: NodeKind| source == Some(k) || target == Some(k);
    if touches(NodeKind::Context) || touches(NodeKind::Input) || touches(NodeKind::Output) {
        EdgeKind::Data
    } else if touches(NodeKind::Tool) {
        EdgeKind::Dependency
    } else {
        EdgeKind::Control
    }
}

/// Resolve an edge's semantic kind. First match wins, in the priority order
/// documented at module level.
pub fn resolve_edge_kind(
    edge: &Edge,
    source_kind: Option<NodeKind>,
    target_kind: Option<NodeKind>,
) -> EdgeKind {
    edge.arrow
        .as_deref()
        .and_then(kind_from_arrow)
        .or_else(|| kind_from_annotations(&edge.annotations))
        .or_else(|| edge.label.as_deref().and_then(kind_from_label))
        .or_else(|| kind_from_attributes(&edge.attributes))
        .unwrap_or_else(|| kind_from_node_kinds(source_kind, target_kind))
}

/// The serialized document shape: just nodes and edges. Indices are derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotDoc {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

/// The immutable workflow definition.
///
/// Constructing a snapshot resolves every edge's semantic kind and builds
/// name-based adjacency indices. Deserializing rebuilds the indices, so a
/// snapshot survives checkpointing without any fixup step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SnapshotDoc", into = "SnapshotDoc")]
pub struct GraphSnapshot {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    node_index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
}

impl From<SnapshotDoc> for GraphSnapshot {
    fn from(doc: SnapshotDoc) -> Self {
        GraphSnapshot::new(doc.nodes, doc.edges)
    }
}

impl From<GraphSnapshot> for SnapshotDoc {
    fn from(snapshot: GraphSnapshot) -> Self {
        SnapshotDoc {
            nodes: snapshot.nodes,
            edges: snapshot.edges,
        }
    }
}

impl GraphSnapshot {
    /// Build a snapshot, resolving edge kinds and adjacency.
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let mut snapshot = Self {
            nodes,
            edges,
            node_index: HashMap::new(),
            outgoing: HashMap::new(),
        };
        snapshot.reindex();
        snapshot
    }

    /// Load a snapshot from a JSON document produced by the external parser.
    pub fn from_json(text: &str) -> Result<Self> {
        let snapshot: GraphSnapshot = serde_json::from_str(text)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Load a snapshot from a YAML document produced by the external parser.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let snapshot: GraphSnapshot = serde_yaml::from_str(text)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn reindex(&mut self) {
        self.node_index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();

        for edge in &mut self.edges {
            if edge.kind.is_none() {
                let source_kind = self
                    .node_index
                    .get(&edge.source)
                    .map(|&i| self.nodes[i].kind);
                let target_kind = self
                    .node_index
                    .get(&edge.target)
                    .map(|&i| self.nodes[i].kind);
                edge.kind = Some(resolve_edge_kind(edge, source_kind, target_kind));
            }
        }

        self.outgoing.clear();
        for (i, edge) in self.edges.iter().enumerate() {
            self.outgoing.entry(edge.source.clone()).or_default().push(i);
        }
    }

    /// All nodes, in definition order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges, in definition order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.node_index.get(name).map(|&i| &self.nodes[i])
    }

    /// Outbound edges of a node, in definition order.
    pub fn outgoing(&self, name: &str) -> Vec<&Edge> {
        self.outgoing
            .get(name)
            .map(|idxs| idxs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Inbound edges of a node.
    pub fn incoming(&self, name: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == name).collect()
    }

    /// Start nodes, in definition order.
    pub fn start_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Start)
            .collect()
    }

    /// Context nodes, in definition order.
    pub fn context_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Context)
            .collect()
    }

    /// Validate the graph structure.
    ///
    /// Checks: at least one start node; every edge endpoint exists; every
    /// node is reachable - transitively over control/transform edges from a
    /// start node, or attached by a data/dependency edge to a reachable
    /// node.
    pub fn validate(&self) -> Result<()> {
        let starts = self.start_nodes();
        if starts.is_empty() {
            return Err(FlowError::Validation(
                "graph has no start node".to_string(),
            ));
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !self.node_index.contains_key(endpoint) {
                    return Err(FlowError::Validation(format!(
                        "edge {} -> {} references missing node '{}'",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
        }

        // Reachability over transition edges.
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = starts.iter().map(|n| n.name.as_str()).collect();
        for start in &starts {
            reachable.insert(start.name.as_str());
        }
        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing(current) {
                if edge.semantic_kind().can_transition() && reachable.insert(edge.target.as_str()) {
                    queue.push_back(edge.target.as_str());
                }
            }
        }

        // Data/dependency edges attach their far endpoint to the reachable set.
        let mut grew = true;
        while grew {
            grew = false;
            for edge in &self.edges {
                if edge.semantic_kind().can_transition() {
                    continue;
                }
                let src_in = reachable.contains(edge.source.as_str());
                let tgt_in = reachable.contains(edge.target.as_str());
                if src_in && !tgt_in {
                    reachable.insert(edge.target.as_str());
                    grew = true;
                } else if tgt_in && !src_in {
                    reachable.insert(edge.source.as_str());
                    grew = true;
                }
            }
        }

        let unreachable: Vec<&str> = self
            .nodes
            .iter()
            .filter(|n| !reachable.contains(n.name.as_str()))
            .map(|n| n.name.as_str())
            .collect();
        if !unreachable.is_empty() {
            return Err(FlowError::Validation(format!(
                "unreachable nodes: {}",
                unreachable.join(", ")
            )));
        }

        Ok(())
    }

    /// Add a node. Fails on duplicate names.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.node_index.contains_key(&node.name) {
            return Err(FlowError::Validation(format!(
                "node '{}' already exists",
                node.name
            )));
        }
        self.nodes.push(node);
        self.reindex();
        Ok(())
    }

    /// Add an edge between existing nodes.
    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        for endpoint in [&edge.source, &edge.target] {
            if !self.node_index.contains_key(endpoint) {
                return Err(FlowError::Validation(format!(
                    "cannot add edge: node '{}' does not exist",
                    endpoint
                )));
            }
        }
        self.edges.push(edge);
        self.reindex();
        Ok(())
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, name: &str) -> Result<()> {
        if !self.node_index.contains_key(name) {
            return Err(FlowError::Validation(format!(
                "node '{}' does not exist",
                name
            )));
        }
        self.nodes.retain(|n| n.name != name);
        self.edges.retain(|e| e.source != name && e.target != name);
        self.reindex();
        Ok(())
    }

    /// Set one attribute on an existing node.
    pub fn set_node_attribute(&mut self, name: &str, key: &str, value: Value) -> Result<()> {
        let idx = *self
            .node_index
            .get(name)
            .ok_or_else(|| FlowError::Validation(format!("node '{}' does not exist", name)))?;
        self.nodes[idx].attributes.insert(key.to_string(), value);
        Ok(())
    }

    /// Serialize to the plain document shape (for meta-tool inspection and
    /// the definition-update callback).
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
