//! Generated-code execution path.
//!
//! Nodes annotated to prefer generated code (`codegen` attribute or
//! `@codegen` annotation) can skip the agent round entirely: a registered
//! [`CodeTaskHandler`] receives the node's readable context values (plus
//! fan-out locals), runs, and returns context writes. Input and output are
//! validated against the node's declared `input_schema` / `output_schema`
//! attributes; a missing handler or any validation failure falls back to
//! the agent path - the workflow degrades, it does not stop.
//!
//! The output contract is `{ "<Context>": { "<field>": value, ... }, ... }`
//! where every context must be writable from the node.
//!
//! With the `json-validation` feature the schemas are enforced with the
//! `jsonschema` crate; without it a structural subset (type + required) is
//! checked.

use crate::context;
use crate::error::{FlowError, Result};
use crate::state::{ExecutionState, Path};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A generated-code implementation for one node, registered by node name.
#[async_trait]
pub trait CodeTaskHandler: Send + Sync {
    /// Run against the validated input object; return the output object.
    async fn run(&self, input: Value) -> Result<Value>;
}

/// Validate `value` against a JSON Schema.
#[cfg(feature = "json-validation")]
pub fn validate_schema(schema: &Value, value: &Value, what: &str) -> Result<()> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| FlowError::SchemaValidation(format!("invalid {} schema: {}", what, e)))?;
    if let Err(errors) = compiled.validate(value) {
        let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(FlowError::SchemaValidation(format!(
            "{} does not match schema: {}",
            what,
            detail.join("; ")
        )));
    }
    Ok(())
}

/// Structural subset check when the `jsonschema` crate is not enabled:
/// `type: object` and `required` keys.
#[cfg(not(feature = "json-validation"))]
pub fn validate_schema(schema: &Value, value: &Value, what: &str) -> Result<()> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !value.is_object() {
        return Err(FlowError::SchemaValidation(format!(
            "{} must be an object",
            what
        )));
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if value.get(key).is_none() {
                return Err(FlowError::SchemaValidation(format!(
                    "{} is missing required key '{}'",
                    what, key
                )));
            }
        }
    }
    Ok(())
}

/// Assemble the code path's input: readable contexts as nested objects,
/// plus the path's fan-out locals.
pub fn code_input(state: &ExecutionState, path: &Path) -> Value {
    let snapshot = &state.snapshot;
    let mut input = Map::new();
    if let Some(node) = snapshot.node(&path.current_node) {
        for ctx in context::readable_contexts(snapshot, node) {
            if let Some(fields) = state.context_state.get(&ctx) {
                let obj: Map<String, Value> =
                    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                input.insert(ctx, Value::Object(obj));
            }
        }
    }
    if let Some(map_ctx) = &path.map_context {
        input.insert("item".to_string(), map_ctx.item.clone());
        input.insert("index".to_string(), Value::Number(map_ctx.index.into()));
    }
    Value::Object(input)
}

/// Run the generated-code path for a node that prefers it.
///
/// Returns the staged writes the code produced. Every error here
/// (validation, handler failure, write outside the node's write set) is a
/// fallback signal, not a path failure - the caller logs it and runs the
/// agent instead.
pub async fn run_code_path(
    handler: &dyn CodeTaskHandler,
    state: &ExecutionState,
    path: &Path,
) -> Result<Vec<context::StagedWrite>> {
    let node = state
        .snapshot
        .node(&path.current_node)
        .ok_or_else(|| FlowError::structural(format!("unknown node '{}'", path.current_node)))?;

    let input = code_input(state, path);
    if let Some(schema) = node.attr("input_schema") {
        validate_schema(schema, &input, "code input")?;
    }

    let output = handler.run(input).await?;
    if let Some(schema) = node.attr("output_schema") {
        validate_schema(schema, &output, "code output")?;
    }

    let Value::Object(contexts) = output else {
        return Err(FlowError::SchemaValidation(
            "code output must be an object of context writes".to_string(),
        ));
    };

    let writable = context::writable_contexts(&state.snapshot, node);
    let mut writes = Vec::new();
    for (ctx, fields) in contexts {
        if !writable.contains(&ctx) {
            return Err(FlowError::SchemaValidation(format!(
                "code output writes context '{}' which '{}' cannot write",
                ctx, node.name
            )));
        }
        let Value::Object(fields) = fields else {
            return Err(FlowError::SchemaValidation(format!(
                "code output for context '{}' must be an object",
                ctx
            )));
        };
        for (key, value) in fields {
            writes.push(context::StagedWrite {
                context: ctx.clone(),
                key,
                value,
            });
        }
    }
    Ok(writes)
}
