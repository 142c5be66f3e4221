//! Tool schema and tool result types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One declared tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterProperty {
    /// JSON-Schema type name (`string`, `integer`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// Allowed string values, in declaration order.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

impl ParameterProperty {
    /// Creates a property of the given JSON-Schema type.
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            allowed: None,
        }
    }

    /// Shorthand for a `string` property.
    pub fn string(description: impl Into<String>) -> Self {
        Self::new("string", description)
    }

    /// Restricts the property to the given values.
    pub fn with_enum<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Object-typed parameter declaration of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    /// Always `"object"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Parameter name to declaration.
    pub properties: BTreeMap<String, ParameterProperty>,
    /// Names of mandatory parameters.
    #[serde(default)]
    pub required: Vec<String>,
}

impl ToolParameters {
    /// Creates an empty object schema.
    pub fn new() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    /// Adds a required property.
    pub fn required(mut self, name: impl Into<String>, property: ParameterProperty) -> Self {
        let name = name.into();
        if !self.required.contains(&name) {
            self.required.push(name.clone());
        }
        self.properties.insert(name, property);
        self
    }

    /// Adds an optional property.
    pub fn optional(mut self, name: impl Into<String>, property: ParameterProperty) -> Self {
        self.properties.insert(name.into(), property);
        self
    }
}

impl Default for ToolParameters {
    fn default() -> Self {
        Self::new()
    }
}

/// Vendor-neutral tool declaration exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolApiDefinition {
    /// Dot-namespaced tool name, e.g. `sms.send`.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// Accepted parameters.
    pub parameters: ToolParameters,
}

impl ToolApiDefinition {
    /// Creates a new tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Outcome of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolResult {
    /// Opaque JSON payload produced by the tool.
    Success(serde_json::Value),
    /// Failure message.
    Error(String),
}

impl ToolResult {
    /// Creates a successful result.
    pub fn success(payload: impl Into<serde_json::Value>) -> Self {
        Self::Success(payload.into())
    }

    /// Creates an error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Whether this result represents a failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// String form forwarded to the model. String payloads are passed through
    /// without JSON quoting.
    pub fn render(&self) -> String {
        match self {
            Self::Success(serde_json::Value::String(s)) => s.clone(),
            Self::Success(value) => value.to_string(),
            Self::Error(message) => message.clone(),
        }
    }
}

impl From<crate::error::ToolError> for ToolResult {
    fn from(err: crate::error::ToolError) -> Self {
        Self::Error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolError;

    #[test]
    fn parameters_builder_tracks_required_names_once() {
        let params = ToolParameters::new()
            .required("to", ParameterProperty::string("Recipient"))
            .required("to", ParameterProperty::string("Recipient again"))
            .optional("body", ParameterProperty::string("Text"));

        assert_eq!(params.kind, "object");
        assert_eq!(params.required, vec!["to".to_string()]);
        assert_eq!(params.properties.len(), 2);
        assert_eq!(params.properties["to"].description, "Recipient again");
    }

    #[test]
    fn enum_values_keep_declaration_order() {
        let prop = ParameterProperty::string("Mode").with_enum(["silent", "vibrate", "normal"]);
        let value = serde_json::to_value(&prop).expect("serialize");
        assert_eq!(value["enum"], serde_json::json!(["silent", "vibrate", "normal"]));
        assert_eq!(value["type"], "string");
    }

    #[test]
    fn render_passes_strings_through_and_serializes_objects() {
        assert_eq!(ToolResult::success("plain").render(), "plain");
        assert_eq!(
            ToolResult::success(serde_json::json!({"ok":true})).render(),
            r#"{"ok":true}"#
        );
        assert_eq!(ToolResult::error("boom").render(), "boom");
        assert!(ToolResult::error("boom").is_error());
    }

    #[test]
    fn tool_error_converts_into_error_result() {
        let result: ToolResult = ToolError::Timeout(30).into();
        assert_eq!(result, ToolResult::error("Timeout after 30s"));
    }
}
