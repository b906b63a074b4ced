//! Meta-programming tools - letting the agent inspect and reshape the
//! running workflow.
//!
//! Nodes (or enclosing scopes) carrying the `meta` capability get an extra
//! tool menu whose calls are delegated to a [`MetaToolHandler`]. A handler
//! never mutates the snapshot referenced by earlier states; it returns a
//! fresh [`GraphSnapshot`], which the effect executor swaps into the state
//! under construction. The mutation is visible to every subsequent step of
//! the same execution, and the runtime's definition-update callback gives
//! an external collaborator the chance to persist it - the runtime itself
//! does not version or roll back definitions.

use crate::error::{FlowError, Result};
use crate::graph::{Edge, GraphSnapshot, Node, NodeKind};
use crate::llm::{ToolCall, ToolDefinition};
use serde_json::{json, Value};

/// What handling one meta tool call produced.
#[derive(Debug, Clone)]
pub struct MetaOutcome {
    /// Tool result payload returned to the agent
    pub result: Value,

    /// Replacement snapshot, when the call mutated the definition
    pub updated_snapshot: Option<GraphSnapshot>,
}

impl MetaOutcome {
    /// A read-only outcome.
    pub fn read(result: Value) -> Self {
        Self {
            result,
            updated_snapshot: None,
        }
    }

    /// An outcome that replaces the live snapshot.
    pub fn mutated(result: Value, snapshot: GraphSnapshot) -> Self {
        Self {
            result,
            updated_snapshot: Some(snapshot),
        }
    }
}

/// The meta-tool collaborator.
pub trait MetaToolHandler: Send + Sync {
    /// Tools this handler exposes on meta-capable nodes.
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Handle one call. `offered_tools` is the complete menu of the current
    /// round (for `list_tools`). Errors fail the owning path only.
    fn handle(
        &self,
        snapshot: &GraphSnapshot,
        call: &ToolCall,
        offered_tools: &[ToolDefinition],
    ) -> Result<MetaOutcome>;
}

/// Default handler: inspect the definition, list the round's tools, add
/// nodes and edges, set attributes, and construct new tool nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphMetaTools;

impl GraphMetaTools {
    fn require_str<'a>(call: &'a ToolCall, key: &str) -> Result<&'a str> {
        call.arguments
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                FlowError::tool_execution(&call.name, format!("missing string argument '{}'", key))
            })
    }
}

impl MetaToolHandler for GraphMetaTools {
    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "inspect_graph",
                "Return the full workflow definition as a JSON document.",
            )
            .with_parameters(json!({"type": "object", "properties": {}})),
            ToolDefinition::new("list_tools", "List the tools available in this round.")
                .with_parameters(json!({"type": "object", "properties": {}})),
            ToolDefinition::new("add_node", "Add a node to the workflow definition.")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "kind": {
                            "type": "string",
                            "enum": ["state", "task", "tool", "context", "input", "output", "start", "end"]
                        },
                        "attributes": {"type": "object"}
                    },
                    "required": ["name", "kind"]
                })),
            ToolDefinition::new("add_edge", "Add an edge between existing nodes.")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "source": {"type": "string"},
                        "target": {"type": "string"},
                        "condition": {"type": "string"},
                        "kind": {
                            "type": "string",
                            "enum": ["control", "data", "transform", "dependency"]
                        }
                    },
                    "required": ["source", "target"]
                })),
            ToolDefinition::new("set_node_attribute", "Set one attribute on an existing node.")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "node": {"type": "string"},
                        "key": {"type": "string"},
                        "value": {}
                    },
                    "required": ["node", "key", "value"]
                })),
            ToolDefinition::new(
                "define_tool",
                "Construct a new tool node that later tasks can depend on.",
            )
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "parameters": {"type": "object"}
                },
                "required": ["name", "description"]
            })),
        ]
    }

    fn handle(
        &self,
        snapshot: &GraphSnapshot,
        call: &ToolCall,
        offered_tools: &[ToolDefinition],
    ) -> Result<MetaOutcome> {
        match call.name.as_str() {
            "inspect_graph" => Ok(MetaOutcome::read(snapshot.to_document())),

            "list_tools" => {
                let tools: Vec<Value> = offered_tools
                    .iter()
                    .map(|t| json!({"name": t.name, "description": t.description}))
                    .collect();
                Ok(MetaOutcome::read(json!({ "tools": tools })))
            }

            "add_node" => {
                let name = Self::require_str(call, "name")?;
                let kind: NodeKind =
                    serde_json::from_value(call.arguments["kind"].clone()).map_err(|_| {
                        FlowError::tool_execution(&call.name, "invalid node kind")
                    })?;
                let mut node = Node::new(name, kind);
                if let Some(attrs) = call.arguments.get("attributes").and_then(Value::as_object) {
                    for (k, v) in attrs {
                        node.attributes.insert(k.clone(), v.clone());
                    }
                }
                let mut updated = snapshot.clone();
                updated
                    .add_node(node)
                    .map_err(|e| FlowError::tool_execution(&call.name, e.to_string()))?;
                Ok(MetaOutcome::mutated(json!({"added": name}), updated))
            }

            "add_edge" => {
                let source = Self::require_str(call, "source")?;
                let target = Self::require_str(call, "target")?;
                let mut edge = Edge::new(source, target);
                if let Some(cond) = call.arguments.get("condition").and_then(Value::as_str) {
                    edge = edge.with_condition(cond);
                }
                if let Some(kind) = call.arguments.get("kind") {
                    if !kind.is_null() {
                        let kind = serde_json::from_value(kind.clone()).map_err(|_| {
                            FlowError::tool_execution(&call.name, "invalid edge kind")
                        })?;
                        edge = edge.with_kind(kind);
                    }
                }
                let mut updated = snapshot.clone();
                updated
                    .add_edge(edge)
                    .map_err(|e| FlowError::tool_execution(&call.name, e.to_string()))?;
                Ok(MetaOutcome::mutated(
                    json!({"added": format!("{} -> {}", source, target)}),
                    updated,
                ))
            }

            "set_node_attribute" => {
                let node = Self::require_str(call, "node")?;
                let key = Self::require_str(call, "key")?;
                let value = call.arguments.get("value").cloned().ok_or_else(|| {
                    FlowError::tool_execution(&call.name, "missing argument 'value'")
                })?;
                let mut updated = snapshot.clone();
                updated
                    .set_node_attribute(node, key, value)
                    .map_err(|e| FlowError::tool_execution(&call.name, e.to_string()))?;
                Ok(MetaOutcome::mutated(
                    json!({"node": node, "key": key}),
                    updated,
                ))
            }

            "define_tool" => {
                let name = Self::require_str(call, "name")?;
                let description = Self::require_str(call, "description")?;
                let mut node = Node::new(name, NodeKind::Tool)
                    .with_attribute("description", json!(description));
                if let Some(params) = call.arguments.get("parameters") {
                    if !params.is_null() {
                        node = node.with_attribute("parameters", params.clone());
                    }
                }
                let mut updated = snapshot.clone();
                updated
                    .add_node(node)
                    .map_err(|e| FlowError::tool_execution(&call.name, e.to_string()))?;
                Ok(MetaOutcome::mutated(json!({"defined": name}), updated))
            }

            other => Err(FlowError::tool_execution(
                other,
                "unknown meta tool".to_string(),
            )),
        }
    }
}
