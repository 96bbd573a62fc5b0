use serde_json::{json, Value};
use tracing::warn;

use coderelay_protocol::{
    AgentEvent, AgentEventKind, ContentBlockStart, ContentDelta, MessageContent, MessageKind,
    RawContentBlock, RawMessage, ServerMessage, StreamEvent, ToolResultContent,
};

use crate::session::{BlockState, SessionState, SharedAgentConfig};

const LOCAL_STDOUT_OPEN: &str = "<local-command-stdout>";
const LOCAL_STDOUT_CLOSE: &str = "</local-command-stdout>";

/// What one raw event turns into.
///
/// `record` is appended to history and broadcast; `transient` is broadcast
/// only (global config that clients refetch on reconnect).
#[derive(Debug, Default)]
pub struct TranslateOutcome {
    pub record: Vec<ServerMessage>,
    pub transient: Vec<ServerMessage>,
    /// The turn reached its terminal result event.
    pub completed: bool,
    /// Session metadata changed in a way worth persisting now.
    pub snapshot: bool,
}

/// Translates one raw agent event into normalized messages, updating the
/// session's stream bookkeeping as a side effect.
///
/// The caller is responsible for staleness checks: events stamped with an old
/// turn sequence must not reach this function.
pub fn apply_event(
    state: &mut SessionState,
    config: &mut SharedAgentConfig,
    event: AgentEvent,
) -> TranslateOutcome {
    let mut out = TranslateOutcome::default();

    if let Some(remote) = event.session_id.as_deref() {
        if state.cli_session_id.as_deref() != Some(remote) {
            state.cli_session_id = Some(remote.to_string());
            out.record.push(ServerMessage::SessionId {
                cli_session_id: remote.to_string(),
            });
            out.snapshot = true;
        }
    }

    match event.kind {
        AgentEventKind::Init {
            model,
            slash_commands,
            skills,
        } => {
            out.transient
                .extend(apply_init(config, model, slash_commands, skills));
        }

        AgentEventKind::Status { status } => {
            let compacting = status.as_deref() == Some("compacting");
            if compacting != state.compacting {
                state.compacting = compacting;
                out.record.push(ServerMessage::Compacting { active: compacting });
            }
        }

        AgentEventKind::StreamEvent { event } => apply_stream_event(state, event, &mut out),

        AgentEventKind::Assistant { message } => {
            note_uuid(state, event.uuid.as_deref(), MessageKind::Assistant, &mut out);
            // Fallback for drivers that never stream deltas: forward the
            // complete text once, unless deltas already covered it.
            if !state.streamed_text {
                let text = collect_text(&message);
                if !text.is_empty() {
                    state.push_preview(&text);
                    out.record.push(ServerMessage::Delta { text });
                }
            }
            state.streamed_text = false;
        }

        AgentEventKind::User { message } => {
            // Tool-result echoes carry a parent tool_use id; they are not
            // rewind targets, so only top-level user messages get a cursor.
            if event.parent_tool_use_id.is_none() {
                note_uuid(state, event.uuid.as_deref(), MessageKind::User, &mut out);
            }
            apply_user_message(state, &message, &mut out);
        }

        AgentEventKind::Result {
            total_cost_usd,
            duration_ms,
            usage,
        } => {
            state.blocks.clear();
            state.streamed_text = false;
            state.sent_tool_results.clear();
            state.is_processing = false;
            if state.compacting {
                state.compacting = false;
                out.record.push(ServerMessage::Compacting { active: false });
            }
            out.record.push(ServerMessage::Result {
                cost: total_cost_usd,
                duration: duration_ms,
                usage,
                session_id: state.cli_session_id.clone(),
            });
            out.record.push(ServerMessage::Done { code: 0 });
            out.completed = true;
            out.snapshot = true;
        }
    }

    out
}

/// Folds an init announcement into the shared config and returns the
/// broadcast-only messages describing the new state. Also used when priming
/// the config at startup, before any session exists.
pub(crate) fn apply_init(
    config: &mut SharedAgentConfig,
    model: Option<String>,
    slash_commands: Vec<String>,
    skills: Vec<String>,
) -> Vec<ServerMessage> {
    if let Some(model) = model {
        if !config.models.contains(&model) {
            config.models.push(model.clone());
        }
        config.model = Some(model);
    }
    if !slash_commands.is_empty() {
        config.slash_commands = slash_commands;
    }
    if !skills.is_empty() {
        config.skills = skills;
    }
    // Skills show up in the raw command list too; clients get them
    // separately.
    let skills = config.skills.clone();
    config.slash_commands.retain(|c| !skills.contains(c));

    let mut messages = Vec::new();
    if !config.slash_commands.is_empty() {
        messages.push(ServerMessage::SlashCommands {
            commands: config.slash_commands.clone(),
        });
    }
    if let Some(model) = config.model.clone() {
        messages.push(ServerMessage::ModelInfo {
            model,
            models: config.models.clone(),
        });
    }
    messages
}

fn apply_stream_event(state: &mut SessionState, event: StreamEvent, out: &mut TranslateOutcome) {
    match event {
        StreamEvent::ContentBlockStart {
            index,
            content_block,
        } => match content_block {
            ContentBlockStart::Text => {
                state.blocks.insert(index, BlockState::Text);
            }
            ContentBlockStart::Thinking => {
                state.blocks.insert(index, BlockState::Thinking);
                out.record.push(ServerMessage::ThinkingStart);
            }
            ContentBlockStart::ToolUse { id, name } => {
                out.record.push(ServerMessage::ToolStart {
                    id: id.clone(),
                    name: name.clone(),
                });
                state.blocks.insert(
                    index,
                    BlockState::ToolUse {
                        id,
                        name,
                        input_json: String::new(),
                    },
                );
            }
        },

        StreamEvent::ContentBlockDelta { index, delta } => match delta {
            ContentDelta::TextDelta { text } => {
                state.streamed_text = true;
                state.push_preview(&text);
                out.record.push(ServerMessage::Delta { text });
            }
            ContentDelta::ThinkingDelta { thinking } => {
                out.record.push(ServerMessage::ThinkingDelta { text: thinking });
            }
            ContentDelta::InputJsonDelta { partial_json } => {
                if let Some(BlockState::ToolUse { input_json, .. }) = state.blocks.get_mut(&index) {
                    input_json.push_str(&partial_json);
                }
            }
        },

        StreamEvent::ContentBlockStop { index } => match state.blocks.remove(&index) {
            Some(BlockState::Thinking) => {
                out.record.push(ServerMessage::ThinkingStop);
            }
            Some(BlockState::ToolUse {
                id,
                name,
                input_json,
            }) => {
                let input = parse_tool_input(&id, &input_json);
                out.record.push(ServerMessage::ToolExecuting { id, name, input });
            }
            Some(BlockState::Text) | None => {}
        },
    }
}

fn apply_user_message(state: &mut SessionState, message: &RawMessage, out: &mut TranslateOutcome) {
    let parts = match &message.content {
        MessageContent::Parts(parts) => parts.as_slice(),
        MessageContent::Text(text) => {
            if let Some(stdout) = extract_local_stdout(text) {
                out.record.push(ServerMessage::SlashCommandResult { text: stdout });
            }
            return;
        }
    };
    for part in parts {
        match part {
            RawContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if !state.sent_tool_results.insert(tool_use_id.clone()) {
                    continue;
                }
                out.record.push(ServerMessage::ToolResult {
                    id: tool_use_id.clone(),
                    content: tool_result_text(content.as_ref()),
                    is_error: *is_error,
                });
            }
            RawContentBlock::Text { text } => {
                if let Some(stdout) = extract_local_stdout(text) {
                    out.record.push(ServerMessage::SlashCommandResult { text: stdout });
                }
            }
            RawContentBlock::ToolUse { .. } | RawContentBlock::Other => {}
        }
    }
}

fn note_uuid(
    state: &mut SessionState,
    uuid: Option<&str>,
    kind: MessageKind,
    out: &mut TranslateOutcome,
) {
    if let Some(uuid) = uuid {
        if state.note_message_uuid(uuid) {
            out.record.push(ServerMessage::MessageUuid {
                uuid: uuid.to_string(),
                message_type: kind,
            });
        }
    }
}

/// Accumulated tool input arrives as a JSON fragment stream; an empty or
/// malformed accumulation degrades to `{}` rather than dropping the tool.
fn parse_tool_input(id: &str, input_json: &str) -> Value {
    if input_json.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str(input_json) {
        Ok(value) => value,
        Err(error) => {
            warn!(tool_use_id = id, %error, "malformed tool input json");
            json!({})
        }
    }
}

fn collect_text(message: &RawMessage) -> String {
    match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => join_text_parts(parts),
    }
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Parts(parts)) => join_text_parts(parts),
    }
}

fn join_text_parts(parts: &[RawContentBlock]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            RawContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_local_stdout(text: &str) -> Option<String> {
    let start = text.find(LOCAL_STDOUT_OPEN)? + LOCAL_STDOUT_OPEN.len();
    let end = text[start..].find(LOCAL_STDOUT_CLOSE)? + start;
    Some(text[start..end].trim().to_string())
}
