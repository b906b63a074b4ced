//! Context values: initialization, staged writes, and evaluation scope.
//!
//! Context nodes hold the workflow's mutable runtime variables. The
//! committed `context_state` map inside [`ExecutionState`] is the sole
//! source of truth; nothing writes it directly. Tool handlers *stage*
//! field-level writes during an agent round, and the whole batch commits as
//! one immutable transition after the round - a multi-tool-call round is
//! never observable half-applied.
//!
//! Access rules come from the graph: a data edge between a context and a
//! node declares read permission, a node→context data edge additionally
//! declares write permission, and nodes nested inside a scope
//! (`pipeline.fetch` inside `pipeline`) inherit read access to contexts
//! attached to their ancestors.

use crate::error::{FlowError, Result};
use crate::graph::{EdgeKind, GraphSnapshot, Node, NodeKind};
use crate::state::{ExecutionState, Path};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// One staged field-level mutation, buffered until its round commits.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    /// Context node name
    pub context: String,
    /// Field name
    pub key: String,
    /// New value (coerced to the declared type at commit)
    pub value: Value,
}

/// Build the initial context map from every context node's declared
/// attribute values, with type coercion applied to string literals.
pub fn initial_context_state(
    snapshot: &GraphSnapshot,
) -> BTreeMap<String, BTreeMap<String, Value>> {
    snapshot
        .context_nodes()
        .into_iter()
        .map(|node| {
            let fields = node
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), coerce_literal(v)))
                .collect();
            (node.name.clone(), fields)
        })
        .collect()
}

/// Coerce a DSL literal: strings that parse as bool/number/JSON become the
/// parsed value, everything else passes through.
pub fn coerce_literal(value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    let trimmed = s.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            return parsed;
        }
    }
    value.clone()
}

/// Coerce an incoming write toward the declared field's type. Writes to
/// undeclared fields get literal coercion only.
pub fn coerce_to_declared(declared: Option<&Value>, incoming: Value) -> Value {
    match declared {
        Some(Value::Number(_)) => match &incoming {
            Value::String(s) => {
                if let Ok(n) = s.trim().parse::<i64>() {
                    Value::Number(n.into())
                } else if let Ok(f) = s.trim().parse::<f64>() {
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .unwrap_or(incoming)
                } else {
                    incoming
                }
            }
            _ => incoming,
        },
        Some(Value::Bool(_)) => match &incoming {
            Value::String(s) => match s.trim() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => incoming,
            },
            _ => incoming,
        },
        Some(Value::String(_)) => match incoming {
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => other,
        },
        _ => coerce_literal(&incoming),
    }
}

/// Commit a batch of staged writes as one transition. Last write wins
/// within the batch. Unknown contexts are an error - tools are only built
/// for declared contexts, so hitting this means a misconfigured effect.
pub fn commit_writes(state: &mut ExecutionState, writes: &[StagedWrite]) -> Result<()> {
    if writes.is_empty() {
        return Ok(());
    }

    // Declared field types come from the context node's attributes.
    let snapshot = state.snapshot.clone();
    for write in writes {
        let declared = snapshot
            .node(&write.context)
            .and_then(|n| n.attr(&write.key));
        let fields = state
            .context_state
            .get_mut(&write.context)
            .ok_or_else(|| {
                FlowError::structural(format!("write to unknown context '{}'", write.context))
            })?;
        let coerced = coerce_to_declared(declared, write.value.clone());
        fields.insert(write.key.clone(), coerced);
    }
    Ok(())
}

/// Read the committed snapshot of one context's fields.
pub fn read_context(state: &ExecutionState, name: &str) -> Result<BTreeMap<String, Value>> {
    state
        .context_state
        .get(name)
        .cloned()
        .ok_or_else(|| FlowError::structural(format!("unknown context '{}'", name)))
}

/// Build the evaluation scope for condition/template evaluation: the global
/// context state (each context as a nested object) overlaid with the path's
/// map fan-out locals (`item`, `index`, `group`).
pub fn evaluation_scope(state: &ExecutionState, path: Option<&Path>) -> Value {
    let mut scope = Map::new();
    for (name, fields) in &state.context_state {
        let obj: Map<String, Value> =
            fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        scope.insert(name.clone(), Value::Object(obj));
    }

    if let Some(map_ctx) = path.and_then(|p| p.map_context.as_ref()) {
        scope.insert("item".to_string(), map_ctx.item.clone());
        scope.insert("index".to_string(), Value::Number(map_ctx.index.into()));
        if let Some(group) = &map_ctx.group {
            scope.insert("group".to_string(), Value::String(group.clone()));
        }
    }

    Value::Object(scope)
}

fn is_data_edge_between(snapshot: &GraphSnapshot, a: &str, b: &str) -> bool {
    snapshot.edges().iter().any(|e| {
        e.semantic_kind() == EdgeKind::Data
            && ((e.source == a && e.target == b) || (e.source == b && e.target == a))
    })
}

fn contexts_attached_to(snapshot: &GraphSnapshot, node: &str) -> BTreeSet<String> {
    snapshot
        .context_nodes()
        .into_iter()
        .filter(|ctx| is_data_edge_between(snapshot, &ctx.name, node))
        .map(|ctx| ctx.name.clone())
        .collect()
}

/// Contexts a node may read: directly attached by a data edge, or attached
/// to an enclosing scope node.
pub fn readable_contexts(snapshot: &GraphSnapshot, node: &Node) -> Vec<String> {
    let mut readable = contexts_attached_to(snapshot, &node.name);
    for ancestor in node.scope_ancestors() {
        readable.extend(contexts_attached_to(snapshot, &ancestor));
    }
    readable.into_iter().collect()
}

/// Contexts a node may write: a direct node→context data edge is required;
/// write access is never inherited.
pub fn writable_contexts(snapshot: &GraphSnapshot, node: &Node) -> Vec<String> {
    snapshot
        .edges()
        .iter()
        .filter(|e| {
            e.semantic_kind() == EdgeKind::Data
                && e.source == node.name
                && snapshot
                    .node(&e.target)
                    .map(|n| n.kind == NodeKind::Context)
                    .unwrap_or(false)
        })
        .map(|e| e.target.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
