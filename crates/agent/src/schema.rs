//! Translation of the internal tool catalog into vendor tool declarations.
//!
//! Two wire shapes exist:
//! - flat `{name, description, input_schema}` (Anthropic Messages API)
//! - nested `{type: "function", function: {name, description, parameters}}`
//!   (OpenAI Chat Completions and compatible endpoints)

use std::collections::HashMap;

use proto::{LlmError, ToolApiDefinition, ToolParameters};
use serde_json::{Map, Value, json};

/// Renders a parameter declaration as a JSON-Schema object.
pub fn parameters_schema(params: &ToolParameters) -> Value {
    let properties: Map<String, Value> = params
        .properties
        .iter()
        .map(|(name, prop)| {
            let mut schema = json!({
                "type": prop.kind,
                "description": prop.description,
            });
            if let Some(values) = &prop.allowed {
                schema["enum"] = json!(values);
            }
            (name.clone(), schema)
        })
        .collect();

    json!({
        "type": params.kind,
        "properties": properties,
        "required": params.required,
    })
}

/// Flat Anthropic tool declarations.
pub fn to_anthropic_tools(tools: &[ToolApiDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": parameters_schema(&t.parameters),
            })
        })
        .collect()
}

/// Nested OpenAI function-tool declarations.
pub fn to_openai_tools(tools: &[ToolApiDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": parameters_schema(&t.parameters),
                }
            })
        })
        .collect()
}

/// Sanitizes a tool name so it matches the `^[a-zA-Z0-9_-]+$` pattern both
/// vendors enforce. Non-conforming characters (e.g. `.`) are replaced with `_`.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Bidirectional mapping between catalog names and wire-safe names for one request.
#[derive(Debug, Clone, Default)]
pub struct ToolNameMap {
    from_wire: HashMap<String, String>,
}

impl ToolNameMap {
    /// Builds the mapping, rejecting catalogs where two tools sanitize to the
    /// same wire name (responses could not be routed back).
    pub fn new(tools: &[ToolApiDefinition]) -> Result<Self, LlmError> {
        let mut from_wire: HashMap<String, String> = HashMap::with_capacity(tools.len());
        for t in tools {
            let sanitized = sanitize_tool_name(&t.name);
            if let Some(existing) = from_wire.get(&sanitized)
                && existing != &t.name
            {
                return Err(LlmError::Config(format!(
                    "Tool name collision: '{}' and '{}' both sanitize to '{}'",
                    existing, t.name, sanitized
                )));
            }
            from_wire.insert(sanitized, t.name.clone());
        }
        Ok(Self { from_wire })
    }

    /// Wire name for a catalog name.
    pub fn wire_name(&self, name: &str) -> String {
        sanitize_tool_name(name)
    }

    /// Catalog name for a wire name; unknown names pass through unchanged.
    pub fn original_name(&self, wire: &str) -> String {
        self.from_wire
            .get(wire)
            .cloned()
            .unwrap_or_else(|| wire.to_string())
    }

    /// Copies of the catalog carrying wire-safe names.
    pub fn wire_definitions(&self, tools: &[ToolApiDefinition]) -> Vec<ToolApiDefinition> {
        tools
            .iter()
            .map(|t| ToolApiDefinition {
                name: self.wire_name(&t.name),
                ..t.clone()
            })
            .collect()
    }
}
