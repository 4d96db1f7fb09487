//! Agent-level streaming events.
//!
//! `AgentStreamEvent` lifts provider chunks and tool activity into the
//! events a front end renders while a request is in flight.

use rosiwit_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// Events emitted by the agent during streaming execution.
///
/// - `chunk`       - partial text from the model
/// - `tool_call`   - a finalized invocation is about to run
/// - `tool_result` - the invocation finished
/// - `done`        - the request is complete
/// - `error`       - the request failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// Partial text from the model.
    Chunk { content: String },

    /// The agent is calling a tool.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Tool execution completed.
    ToolResult {
        id: String,
        name: String,
        output: String,
        success: bool,
    },

    /// The request is complete.
    Done {
        usage: Option<Usage>,
        iterations: usize,
        tool_calls_made: usize,
    },

    /// An error occurred mid-stream.
    Error { message: String },
}

impl AgentStreamEvent {
    /// Short event name, matching the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_chunk() {
        let event = AgentStreamEvent::Chunk {
            content: "Hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert!(json.contains(r#""content":"Hello""#));
    }

    #[test]
    fn event_serialization_tool_result() {
        let event = AgentStreamEvent::ToolResult {
            id: "call_1".into(),
            name: "read_file".into(),
            output: "Error: not found".into(),
            success: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_result""#));
        assert!(json.contains(r#""success":false"#));
    }

    #[test]
    fn event_serialization_done() {
        let event = AgentStreamEvent::Done {
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            }),
            iterations: 2,
            tool_calls_made: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"done""#));
        assert!(json.contains(r#""iterations":2"#));
    }

    #[test]
    fn event_type_matches_tag() {
        let events = [
            AgentStreamEvent::Chunk { content: "x".into() },
            AgentStreamEvent::ToolCall {
                id: "a".into(),
                name: "b".into(),
                input: serde_json::Value::Null,
            },
            AgentStreamEvent::Error { message: "x".into() },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"type":"chunk","content":"hi"}"#;
        let event: AgentStreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, AgentStreamEvent::Chunk { content: "hi".into() });
    }
}
