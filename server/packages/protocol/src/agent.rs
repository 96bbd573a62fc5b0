use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One raw streaming event from an agent driver.
///
/// The envelope fields can appear on any event kind; the translator captures
/// `session_id` from whichever event carries it first.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    /// Driver/runtime announcement carrying model and command inventories.
    Init {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default)]
        slash_commands: Vec<String>,
        #[serde(default)]
        skills: Vec<String>,
    },

    /// Runtime status toggle (e.g. "compacting").
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    /// Content-block lifecycle event.
    StreamEvent { event: StreamEvent },

    /// A complete assistant message (may duplicate streamed deltas).
    Assistant { message: RawMessage },

    /// A complete user-side message (tool results, slash command output).
    User { message: RawMessage },

    /// Terminal event for the turn.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockStart {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RawMessage {
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<RawContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Parts(Vec::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    /// Unknown block kinds are tolerated, never fatal.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<RawContentBlock>),
}

/// How the agent driver's permission or question callback resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum ToolDecision {
    Allow { updated_input: Value },
    Deny { message: String },
}

impl ToolDecision {
    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_event_round_trip() {
        let event: AgentEvent = serde_json::from_value(json!({
            "type": "stream_event",
            "session_id": "abc",
            "event": {
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": "Lo" }
            }
        }))
        .unwrap();
        assert_eq!(event.session_id.as_deref(), Some("abc"));
        match event.kind {
            AgentEventKind::StreamEvent {
                event: StreamEvent::ContentBlockDelta { index, delta },
            } => {
                assert_eq!(index, 0);
                assert!(matches!(delta, ContentDelta::TextDelta { text } if text == "Lo"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_content_block_is_tolerated() {
        let message: RawMessage = serde_json::from_value(json!({
            "content": [
                { "type": "shiny_new_kind", "payload": 1 },
                { "type": "text", "text": "hello" }
            ]
        }))
        .unwrap();
        match message.content {
            MessageContent::Parts(parts) => {
                assert!(matches!(parts[0], RawContentBlock::Other));
                assert!(matches!(&parts[1], RawContentBlock::Text { text } if text == "hello"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn string_content_parses() {
        let message: RawMessage =
            serde_json::from_value(json!({ "content": "plain text" })).unwrap();
        assert!(matches!(message.content, MessageContent::Text(text) if text == "plain text"));
    }
}
