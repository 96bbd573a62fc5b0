use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ImageAttachment;

/// Outbound normalized messages. Every client-visible event the bridge emits
/// is one of these; they are also what gets appended to the session history.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The agent assigned a remote session id to this conversation.
    #[serde(rename_all = "camelCase")]
    SessionId { cli_session_id: String },

    /// Rewind cursor entry: a message uuid observed in the raw stream.
    #[serde(rename_all = "camelCase")]
    MessageUuid {
        uuid: String,
        message_type: MessageKind,
    },

    /// A user prompt as recorded in history (text plus attachment counts).
    #[serde(rename_all = "camelCase")]
    UserMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pastes: Option<Vec<String>>,
    },

    SlashCommands {
        commands: Vec<String>,
    },

    ModelInfo {
        model: String,
        models: Vec<String>,
    },

    /// Incremental assistant text, forwarded as it streams.
    Delta {
        text: String,
    },

    ThinkingStart,
    ThinkingDelta {
        text: String,
    },
    ThinkingStop,

    /// A tool-use block opened.
    ToolStart {
        id: String,
        name: String,
    },

    /// A tool-use block closed and its accumulated input parsed.
    ToolExecuting {
        id: String,
        name: String,
        input: Value,
    },

    /// Tool output, at most once per tool-use id.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        id: String,
        content: String,
        is_error: bool,
    },

    /// Output of a locally executed slash command.
    SlashCommandResult {
        text: String,
    },

    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: Value,
        tool_use_id: String,
        decision_reason: String,
    },

    /// Replayed to a reconnecting client while a request is still open.
    #[serde(rename_all = "camelCase")]
    PermissionRequestPending {
        request_id: String,
        tool_name: String,
        tool_input: Value,
        tool_use_id: String,
        decision_reason: String,
    },

    #[serde(rename_all = "camelCase")]
    PermissionResolved {
        request_id: String,
        decision: PermissionDecision,
    },

    /// The request expired or was cancelled; clients should clear stale UI.
    #[serde(rename_all = "camelCase")]
    PermissionCancel {
        request_id: String,
    },

    #[serde(rename_all = "camelCase")]
    AskUserRequest {
        tool_id: String,
        input: Value,
    },

    #[serde(rename_all = "camelCase")]
    AskUserAnswered {
        tool_id: String,
    },

    #[serde(rename_all = "camelCase")]
    AskUserCancel {
        tool_id: String,
    },

    Status {
        status: TurnStatus,
    },

    Compacting {
        active: bool,
    },

    /// Terminal turn event; cost/usage metadata is passed through opaquely.
    #[serde(rename_all = "camelCase")]
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    Done {
        code: i32,
    },

    Error {
        text: String,
    },

    Info {
        text: String,
    },

    RewindComplete,

    SessionList {
        sessions: Vec<SessionSummary>,
    },

    #[serde(rename_all = "camelCase")]
    SessionSwitched {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cli_session_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Processing,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    AllowAlways,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_session_id: Option<String>,
    pub title: String,
    pub active: bool,
    pub is_processing: bool,
    pub last_activity: i64,
    /// First 200 chars of the latest assistant response, for list previews.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Inbound client messages, as delivered by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start a turn, or push a mid-turn message if one is already running.
    Message {
        #[serde(default)]
        text: String,
        #[serde(default)]
        images: Vec<ImageAttachment>,
        #[serde(default)]
        pastes: Vec<String>,
    },

    /// Interrupt the active turn.
    Stop,

    /// Switch the agent's active model for subsequent turns.
    SetModel {
        model: String,
    },

    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
    },

    #[serde(rename_all = "camelCase")]
    AskUserResponse {
        tool_id: String,
        #[serde(default)]
        answers: Value,
    },

    NewSession,

    SwitchSession {
        id: String,
    },

    #[serde(rename_all = "camelCase")]
    ResumeSession {
        cli_session_id: String,
    },

    DeleteSession {
        id: String,
    },

    RenameSession {
        id: String,
        title: String,
    },

    RewindExecute {
        uuid: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_message_wire_shape() {
        let msg = ServerMessage::PermissionRequest {
            request_id: "r1".to_string(),
            tool_name: "bash".to_string(),
            tool_input: json!({"command": "ls"}),
            tool_use_id: "t1".to_string(),
            decision_reason: String::new(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "permission_request");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["toolName"], "bash");
    }

    #[test]
    fn client_command_parses_defaults() {
        let cmd: ClientCommand =
            serde_json::from_value(json!({"type": "message", "text": "fix bug"})).unwrap();
        match cmd {
            ClientCommand::Message {
                text,
                images,
                pastes,
            } => {
                assert_eq!(text, "fix bug");
                assert!(images.is_empty());
                assert!(pastes.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn decision_is_snake_case() {
        let value = serde_json::to_value(PermissionDecision::AllowAlways).unwrap();
        assert_eq!(value, "allow_always");
    }
}
