use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use coderelay_error::BridgeError;
use coderelay_protocol::{
    AgentEvent, AgentEventKind, ImageAttachment, PromptMessage, ServerMessage, TurnStatus,
};

use crate::permissions::TurnPermissions;
use crate::queue::MessageQueue;
use crate::session::{SessionRegistry, SessionState};
use crate::supervisor::TurnFailureSink;
use crate::translate::{apply_event, apply_init, TranslateOutcome};

pub const INTERRUPTED_NOTICE: &str = "Interrupted · What should the agent do instead?";

pub type AgentEventStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, BridgeError>> + Send>>;

/// Everything a driver needs to run one turn against the agent backend.
pub struct TurnRequest {
    /// User messages for this turn; stays open for mid-turn pushes and
    /// follow-up turns on the same stream.
    pub prompt: Arc<MessageQueue>,
    /// Remote session id to resume, if the agent already assigned one.
    pub resume: Option<String>,
    /// Message uuid to rewind to before processing the prompt.
    pub resume_at: Option<String>,
    pub abort: CancellationToken,
    pub permissions: TurnPermissions,
}

/// Adapter over one agent backend. Implementations spawn or attach to the
/// agent process and surface its output as a raw event stream.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn run_turn(&self, request: TurnRequest) -> Result<AgentEventStream, BridgeError>;

    /// Switches the backend's active model for subsequent turns.
    async fn set_model(&self, _model: &str) -> Result<(), BridgeError> {
        Ok(())
    }

    /// Primes the backend before the first turn. Implementations return
    /// whatever announcement events the backend produced (typically one init
    /// event carrying model and command inventories).
    async fn warmup(&self) -> Result<Vec<AgentEvent>, BridgeError> {
        Ok(Vec::new())
    }
}

struct EngineInner {
    registry: SessionRegistry,
    driver: Arc<dyn AgentDriver>,
}

/// Drives turns: feeds user messages into queues, pumps driver event streams
/// through the translator, and tears turns down on interrupt or failure.
#[derive(Clone)]
pub struct TurnEngine {
    inner: Arc<EngineInner>,
}

enum MessageDisposition {
    Started {
        seq: u64,
        queue: Arc<MessageQueue>,
        abort: CancellationToken,
        resume: Option<String>,
        resume_at: Option<String>,
    },
    Queued,
}

/// Turn-scoped state pulled out of a session during teardown.
struct Teardown {
    was_processing: bool,
    thinking_open: bool,
    cancel_messages: Vec<ServerMessage>,
    queue: Option<Arc<MessageQueue>>,
    abort: Option<CancellationToken>,
}

fn tear_down(session: &mut SessionState) -> Teardown {
    let was_processing = session.is_processing;
    let thinking_open = session
        .blocks
        .values()
        .any(|b| matches!(b, crate::session::BlockState::Thinking));
    let cancelled = session.reset_turn_state();
    Teardown {
        was_processing,
        thinking_open,
        cancel_messages: cancelled.cancel_messages(),
        queue: session.queue.take(),
        abort: session.abort.take(),
    }
}

impl TurnEngine {
    pub fn new(registry: SessionRegistry, driver: Arc<dyn AgentDriver>) -> Self {
        Self {
            inner: Arc::new(EngineInner { registry, driver }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Switches the active model: the driver first, then the shared config,
    /// then the announcement to clients.
    pub async fn set_model(&self, model: &str) -> Result<(), BridgeError> {
        self.inner.driver.set_model(model).await?;
        let registry = &self.inner.registry;
        let mut announce = None;
        registry.update_config(|config| {
            if !config.models.iter().any(|m| m == model) {
                config.models.push(model.to_string());
            }
            config.model = Some(model.to_string());
            announce = Some((model.to_string(), config.models.clone()));
        });
        info!(model, "model switched");
        if let Some((model, models)) = announce {
            registry.broadcast(ServerMessage::ModelInfo { model, models });
        }
        Ok(())
    }

    /// Primes the shared config before the first turn by letting the driver
    /// announce its inventories. Non-init events are ignored.
    pub async fn warmup(&self) -> Result<(), BridgeError> {
        let events = self.inner.driver.warmup().await?;
        let registry = &self.inner.registry;
        for event in events {
            if let AgentEventKind::Init {
                model,
                slash_commands,
                skills,
            } = event.kind
            {
                let mut messages = Vec::new();
                registry.update_config(|config| {
                    messages = apply_init(config, model, slash_commands, skills);
                });
                for message in messages {
                    registry.broadcast(message);
                }
            }
        }
        Ok(())
    }

    /// Handles one inbound user message: records it, then either starts a
    /// turn or feeds the already running one.
    pub async fn send_user_message(
        &self,
        session_id: &str,
        text: &str,
        images: Vec<ImageAttachment>,
        pastes: Vec<String>,
    ) -> Result<(), BridgeError> {
        let registry = &self.inner.registry;

        registry
            .record_and_send(
                session_id,
                ServerMessage::UserMessage {
                    text: text.to_string(),
                    image_count: if images.is_empty() {
                        None
                    } else {
                        Some(images.len() as u32)
                    },
                    pastes: if pastes.is_empty() {
                        None
                    } else {
                        Some(pastes.clone())
                    },
                },
            )
            .await?;
        registry.auto_title(session_id, text).await;

        let mut full_text = text.to_string();
        for paste in &pastes {
            if !full_text.is_empty() {
                full_text.push_str("\n\n");
            }
            full_text.push_str(paste);
        }
        let prompt = PromptMessage::from_user_input(&full_text, &images);

        let disposition = registry
            .with_session(session_id, |session| {
                session.preview.clear();
                if let Some(queue) = session.queue.clone() {
                    if !queue.is_ended() {
                        queue.push(prompt);
                        session.is_processing = true;
                        return MessageDisposition::Queued;
                    }
                    session.queue = None;
                }
                let queue = Arc::new(MessageQueue::new());
                queue.push(prompt);
                let abort = CancellationToken::new();
                session.queue = Some(queue.clone());
                session.abort = Some(abort.clone());
                session.is_processing = true;
                MessageDisposition::Started {
                    seq: session.turn_seq,
                    queue,
                    abort,
                    resume: session.cli_session_id.clone(),
                    resume_at: session.last_rewind_uuid.take(),
                }
            })
            .await?;

        registry.broadcast(ServerMessage::Status {
            status: TurnStatus::Processing,
        });
        registry.broadcast_session_list().await;

        if let MessageDisposition::Started {
            seq,
            queue,
            abort,
            resume,
            resume_at,
        } = disposition
        {
            let engine = self.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                engine
                    .drive_turn(session_id, seq, queue, abort, resume, resume_at)
                    .await;
            });
        }
        Ok(())
    }

    async fn drive_turn(
        &self,
        session_id: String,
        seq: u64,
        queue: Arc<MessageQueue>,
        abort: CancellationToken,
        resume: Option<String>,
        resume_at: Option<String>,
    ) {
        let permissions = TurnPermissions::new(
            self.inner.registry.clone(),
            session_id.clone(),
            seq,
            abort.clone(),
        );
        let request = TurnRequest {
            prompt: queue,
            resume,
            resume_at,
            abort,
            permissions,
        };
        debug!(session_id = %session_id, seq, "starting turn");

        let mut stream = match self.inner.driver.run_turn(request).await {
            Ok(stream) => stream,
            Err(err) => {
                self.fail_turn(&session_id, seq, &err.to_string()).await;
                return;
            }
        };

        loop {
            match stream.next().await {
                Some(Ok(event)) => {
                    self.apply_agent_event(&session_id, seq, event).await;
                }
                Some(Err(err)) => {
                    self.fail_turn(&session_id, seq, &err.to_string()).await;
                    return;
                }
                None => {
                    self.finish_stream(&session_id, seq).await;
                    return;
                }
            }
        }
    }

    /// Translates one raw event under the session lock, then records and
    /// broadcasts the results. Stale events (an older turn's stragglers after
    /// an interrupt) are dropped.
    async fn apply_agent_event(&self, session_id: &str, seq: u64, event: AgentEvent) {
        let registry = self.inner.registry.clone();
        let config_registry = registry.clone();
        let outcome: Option<TranslateOutcome> = registry
            .with_session(session_id, move |session| {
                if session.turn_seq != seq {
                    return None;
                }
                let mut config = config_registry.config();
                let outcome = apply_event(session, &mut config, event);
                config_registry.update_config(|c| *c = config);
                Some(outcome)
            })
            .await
            .ok()
            .flatten();
        let Some(outcome) = outcome else { return };

        let mut send = outcome.record.clone();
        send.extend(outcome.transient);
        if let Err(err) = registry
            .record_batch(session_id, outcome.record, send)
            .await
        {
            debug!(session_id, %err, "session gone while recording turn output");
            return;
        }

        if outcome.completed {
            registry.broadcast(ServerMessage::Status {
                status: TurnStatus::Idle,
            });
            registry.broadcast_session_list().await;
        }
        if outcome.snapshot {
            registry.save_snapshot(session_id).await;
        }
    }

    /// The driver stream ended. Mid-turn that is a failure; between turns it
    /// is a normal stream shutdown.
    async fn finish_stream(&self, session_id: &str, seq: u64) {
        let mid_turn = self
            .inner
            .registry
            .with_session(session_id, |session| {
                session.turn_seq == seq && session.is_processing
            })
            .await
            .unwrap_or(false);
        if mid_turn {
            self.fail_turn(session_id, seq, "agent stream ended unexpectedly")
                .await;
            return;
        }
        let _ = self
            .inner
            .registry
            .with_session(session_id, |session| {
                if session.turn_seq != seq {
                    return;
                }
                if let Some(queue) = session.queue.take() {
                    queue.end();
                }
                session.abort = None;
            })
            .await;
        debug!(session_id, seq, "turn stream closed");
    }

    /// Tears the turn down after a stream or driver error. No-op when the
    /// sequence is stale, which is how errors from an already interrupted
    /// turn stay silent.
    pub async fn fail_turn(&self, session_id: &str, seq: u64, text: &str) {
        let registry = &self.inner.registry;
        let teardown = registry
            .with_session(session_id, |session| {
                if session.turn_seq != seq {
                    return None;
                }
                Some(tear_down(session))
            })
            .await
            .ok()
            .flatten();
        let Some(teardown) = teardown else {
            debug!(session_id, seq, "stale turn failure ignored");
            return;
        };
        error!(session_id, seq, text, "turn failed");
        self.emit_teardown(
            session_id,
            teardown,
            ServerMessage::Error {
                text: text.to_string(),
            },
            1,
        )
        .await;
    }

    /// Client-requested stop. Emits the interruption notice and a clean done
    /// so the conversation can continue.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), BridgeError> {
        let registry = &self.inner.registry;
        let teardown = registry
            .with_session(session_id, |session| {
                if session.queue.is_none() && !session.is_processing {
                    return None;
                }
                Some(tear_down(session))
            })
            .await?;
        let Some(teardown) = teardown else {
            return Ok(());
        };
        info!(session_id, "turn interrupted");
        if teardown.was_processing {
            self.emit_teardown(
                session_id,
                teardown,
                ServerMessage::Info {
                    text: INTERRUPTED_NOTICE.to_string(),
                },
                0,
            )
            .await;
        } else {
            // Idle stream between turns: just close it.
            if let Some(abort) = teardown.abort {
                abort.cancel();
            }
            if let Some(queue) = teardown.queue {
                queue.end();
            }
        }
        Ok(())
    }

    async fn emit_teardown(
        &self,
        session_id: &str,
        teardown: Teardown,
        notice: ServerMessage,
        code: i32,
    ) {
        if let Some(abort) = teardown.abort {
            abort.cancel();
        }
        if let Some(queue) = teardown.queue {
            queue.end();
        }

        let mut record = Vec::new();
        if teardown.thinking_open {
            record.push(ServerMessage::ThinkingStop);
        }
        record.extend(teardown.cancel_messages);
        record.push(notice);
        record.push(ServerMessage::Done { code });
        let send = record.clone();
        let registry = &self.inner.registry;
        let _ = registry.record_batch(session_id, record, send).await;
        registry.broadcast(ServerMessage::Status {
            status: TurnStatus::Idle,
        });
        registry.broadcast_session_list().await;
        registry.save_snapshot(session_id).await;
    }

    /// Fails every mid-turn session. Sessions idle on a live stream get their
    /// queue closed quietly; sessions with no turn state are untouched.
    pub async fn fail_all_live(&self, text: &str) {
        enum Live {
            Processing(u64),
            IdleStream(Option<Arc<MessageQueue>>, Option<CancellationToken>),
        }
        for session_id in self.inner.registry.session_ids().await {
            let live = self
                .inner
                .registry
                .with_session(&session_id, |session| {
                    if session.is_processing {
                        Some(Live::Processing(session.turn_seq))
                    } else if session.queue.is_some() {
                        Some(Live::IdleStream(session.queue.take(), session.abort.take()))
                    } else {
                        None
                    }
                })
                .await
                .ok()
                .flatten();
            match live {
                Some(Live::Processing(seq)) => self.fail_turn(&session_id, seq, text).await,
                Some(Live::IdleStream(queue, abort)) => {
                    if let Some(abort) = abort {
                        abort.cancel();
                    }
                    if let Some(queue) = queue {
                        queue.end();
                    }
                }
                None => {}
            }
        }
    }

    /// Rewinds a session to just before the turn containing `uuid`. The next
    /// turn resumes the remote session at that point.
    pub async fn rewind_to(&self, session_id: &str, uuid: &str) -> Result<(), BridgeError> {
        self.interrupt(session_id).await?;
        let registry = &self.inner.registry;
        registry
            .with_session(session_id, |session| {
                if !session.has_message_uuid(uuid) {
                    return Err(BridgeError::InvalidRequest {
                        message: format!("unknown rewind target {uuid}"),
                    });
                }
                let anchor = session.history.iter().position(
                    |m| matches!(m, ServerMessage::MessageUuid { uuid: u, .. } if u == uuid),
                );
                let Some(anchor) = anchor else {
                    return Err(BridgeError::InvalidRequest {
                        message: format!("rewind target {uuid} not in history"),
                    });
                };
                let mut cut = 0;
                for i in (0..=anchor).rev() {
                    if matches!(session.history[i], ServerMessage::UserMessage { .. }) {
                        cut = i;
                        break;
                    }
                }
                session.history.truncate(cut);
                session.last_rewind_uuid = Some(uuid.to_string());
                session.touch();
                Ok(())
            })
            .await??;
        registry
            .record_and_send(session_id, ServerMessage::RewindComplete)
            .await?;
        registry.save_snapshot(session_id).await;
        registry.broadcast_session_list().await;
        Ok(())
    }

    /// Interrupts a running turn (if any) and deletes the session.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), BridgeError> {
        let _ = self.interrupt(session_id).await;
        self.inner.registry.delete_session(session_id).await
    }
}

#[async_trait]
impl TurnFailureSink for TurnEngine {
    async fn backend_lost(&self, text: &str) {
        self.fail_all_live(text).await;
    }

    async fn announce(&self, text: &str) {
        self.inner.registry.broadcast(ServerMessage::Error {
            text: text.to_string(),
        });
    }

    async fn shutdown_turns(&self) {
        for session_id in self.inner.registry.session_ids().await {
            let _ = self.interrupt(&session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;

    struct NeverDriver;

    #[async_trait]
    impl AgentDriver for NeverDriver {
        async fn run_turn(&self, _request: TurnRequest) -> Result<AgentEventStream, BridgeError> {
            Err(BridgeError::Unavailable {
                reason: "no backend in this test".to_string(),
            })
        }
    }

    fn engine() -> TurnEngine {
        let registry = SessionRegistry::new(Arc::new(MemorySessionStore::new()));
        TurnEngine::new(registry, Arc::new(NeverDriver))
    }

    #[tokio::test]
    async fn interrupt_without_turn_is_a_no_op() {
        let engine = engine();
        let id = engine.registry().create_session().await;
        engine.interrupt(&id).await.unwrap();
        let history_len = engine
            .registry()
            .with_session(&id, |s| s.history.len())
            .await
            .unwrap();
        assert_eq!(history_len, 0);
    }

    #[tokio::test]
    async fn rewind_unknown_uuid_is_rejected() {
        let engine = engine();
        let id = engine.registry().create_session().await;
        let err = engine.rewind_to(&id, "nope").await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn rewind_trims_back_to_the_turn_start() {
        let engine = engine();
        let id = engine.registry().create_session().await;
        engine
            .registry()
            .with_session(&id, |session| {
                session.history = vec![
                    ServerMessage::UserMessage {
                        text: "first".to_string(),
                        image_count: None,
                        pastes: None,
                    },
                    ServerMessage::Delta {
                        text: "answer one".to_string(),
                    },
                    ServerMessage::UserMessage {
                        text: "second".to_string(),
                        image_count: None,
                        pastes: None,
                    },
                    ServerMessage::MessageUuid {
                        uuid: "u2".to_string(),
                        message_type: coderelay_protocol::MessageKind::Assistant,
                    },
                    ServerMessage::Delta {
                        text: "answer two".to_string(),
                    },
                ];
                session.note_message_uuid("u2");
            })
            .await
            .unwrap();

        engine.rewind_to(&id, "u2").await.unwrap();

        engine
            .registry()
            .with_session(&id, |session| {
                // Trimmed through the second user message; RewindComplete was
                // recorded afterwards.
                assert_eq!(session.history.len(), 3);
                assert!(matches!(
                    session.history[2],
                    ServerMessage::RewindComplete
                ));
                assert_eq!(session.last_rewind_uuid.as_deref(), Some("u2"));
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn driver_start_failure_fails_the_turn() {
        let engine = engine();
        let id = engine.registry().create_session().await;
        engine
            .send_user_message(&id, "hello", Vec::new(), Vec::new())
            .await
            .unwrap();
        // The spawned drive task fails fast; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        engine
            .registry()
            .with_session(&id, |session| {
                assert!(!session.is_processing);
                assert!(session
                    .history
                    .iter()
                    .any(|m| matches!(m, ServerMessage::Error { .. })));
                assert!(session
                    .history
                    .iter()
                    .any(|m| matches!(m, ServerMessage::Done { code: 1 })));
            })
            .await
            .unwrap();
    }
}
