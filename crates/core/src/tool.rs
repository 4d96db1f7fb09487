//! Tool types shared between the MCP registry and the agent loop.
//!
//! Tools live on external servers. The runtime only sees their
//! descriptors, the invocations the model asks for, and the result
//! envelopes that come back.

use serde::{Deserialize, Serialize};
use crate::provider::{FunctionTool, ToolDefinition};

/// A tool advertised by a server during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema for the arguments
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: serde_json::Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Convert into a catalog entry for the model.
    ///
    /// A missing description becomes `Execute <name>`, a missing or
    /// non-object schema becomes an empty object schema.
    pub fn to_function_tool(&self) -> FunctionTool {
        let description = match self.description.as_deref() {
            Some(d) if !d.trim().is_empty() => d.to_string(),
            _ => format!("Execute {}", self.name),
        };
        let parameters = if self.input_schema.is_object() {
            self.input_schema.clone()
        } else {
            serde_json::json!({ "type": "object", "properties": {} })
        };
        FunctionTool::function(ToolDefinition {
            name: self.name.clone(),
            description,
            parameters,
        })
    }
}

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The result envelope of a tool execution.
///
/// Failures are carried in `error` instead of being raised, so a batch
/// can continue past a single bad call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Name of the tool that was requested
    pub name: String,

    /// Arguments the call was made with
    #[serde(default)]
    pub arguments: serde_json::Value,

    /// Raw result payload returned by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: serde_json::Value) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Render the envelope as the content of a `tool` turn.
    pub fn to_content(&self) -> String {
        if let Some(error) = &self.error {
            return format!("Error: {error}");
        }
        match &self.output {
            Some(output) => render_content_blocks(output),
            None => String::new(),
        }
    }
}

/// Flatten an MCP result payload into text.
///
/// `text` blocks contribute their text, any other block is emitted as
/// compact JSON. Payloads without a `content` array are emitted whole.
pub fn render_content_blocks(output: &serde_json::Value) -> String {
    let Some(blocks) = output.get("content").and_then(|c| c.as_array()) else {
        return match output {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    };

    blocks
        .iter()
        .map(|block| match (block.get("type").and_then(|t| t.as_str()), block.get("text")) {
            (Some("text"), Some(serde_json::Value::String(text))) => text.clone(),
            _ => block.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
