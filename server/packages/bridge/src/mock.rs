//! Scripted driver and transport doubles used by the test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use coderelay_error::BridgeError;
use coderelay_protocol::{
    AgentEvent, AgentEventKind, ContentBlockStart, ContentDelta, MessageContent, RawMessage,
    StreamEvent, ToolDecision,
};

use crate::supervisor::{
    Availability, BackendConnection, BackendHandle, BackendTransport, TurnFailureSink,
};
use crate::turn::{AgentDriver, AgentEventStream, TurnRequest};

/// One scripted action for a mock turn.
pub enum MockStep {
    /// Wait for the next prompt from the queue.
    AwaitPrompt,
    /// Emit a raw event.
    Event(AgentEvent),
    /// Emit a stream error.
    Fail(BridgeError),
    /// Ask for permission through the turn's arbitrator and record the
    /// decision.
    Permission {
        tool_name: String,
        input: Value,
        tool_use_id: String,
    },
    /// Raise an AskUserQuestion and record the decision.
    AskUser { input: Value, tool_use_id: String },
    /// Park until the turn is aborted, then fail like a cancelled request.
    WaitAbort,
    /// Close the stream cleanly.
    EndStream,
}

#[derive(Debug, Clone, Default)]
pub struct TurnRecord {
    pub resume: Option<String>,
    pub resume_at: Option<String>,
    pub prompts: Vec<String>,
}

struct MockDriverInner {
    scripts: Mutex<VecDeque<Vec<MockStep>>>,
    warmup_events: Mutex<Vec<AgentEvent>>,
    decisions: Mutex<Vec<ToolDecision>>,
    turns: Mutex<Vec<TurnRecord>>,
    model_changes: Mutex<Vec<String>>,
}

/// Agent driver that replays a per-turn script instead of talking to a real
/// backend.
#[derive(Clone)]
pub struct MockDriver {
    inner: Arc<MockDriverInner>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockDriverInner {
                scripts: Mutex::new(VecDeque::new()),
                warmup_events: Mutex::new(Vec::new()),
                decisions: Mutex::new(Vec::new()),
                turns: Mutex::new(Vec::new()),
                model_changes: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn script_turn(&self, steps: Vec<MockStep>) {
        self.inner
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(steps);
    }

    pub fn decisions(&self) -> Vec<ToolDecision> {
        self.inner
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn turns(&self) -> Vec<TurnRecord> {
        self.inner
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Events replayed by the next `warmup` call.
    pub fn script_warmup(&self, events: Vec<AgentEvent>) {
        *self
            .inner
            .warmup_events
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = events;
    }

    pub fn model_changes(&self) -> Vec<String> {
        self.inner
            .model_changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDriver for MockDriver {
    async fn run_turn(&self, request: TurnRequest) -> Result<AgentEventStream, BridgeError> {
        let steps = self
            .inner
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| vec![MockStep::EndStream]);

        let turn_index = {
            let mut turns = self.inner.turns.lock().unwrap_or_else(|e| e.into_inner());
            turns.push(TurnRecord {
                resume: request.resume.clone(),
                resume_at: request.resume_at.clone(),
                prompts: Vec::new(),
            });
            turns.len() - 1
        };

        let (tx, rx) = mpsc::channel(32);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            for step in steps {
                match step {
                    MockStep::AwaitPrompt => {
                        let Some(prompt) = request.prompt.next().await else {
                            return;
                        };
                        let mut turns = inner.turns.lock().unwrap_or_else(|e| e.into_inner());
                        turns[turn_index].prompts.push(prompt.text());
                    }
                    MockStep::Event(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    MockStep::Fail(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    MockStep::Permission {
                        tool_name,
                        input,
                        tool_use_id,
                    } => {
                        let decision = request
                            .permissions
                            .can_use_tool(&tool_name, input, &tool_use_id, "")
                            .await;
                        inner
                            .decisions
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(decision);
                    }
                    MockStep::AskUser { input, tool_use_id } => {
                        let decision = request.permissions.ask_user(input, &tool_use_id).await;
                        inner
                            .decisions
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(decision);
                    }
                    MockStep::WaitAbort => {
                        request.abort.cancelled().await;
                        let _ = tx.send(Err(BridgeError::stream("request aborted"))).await;
                        return;
                    }
                    MockStep::EndStream => return,
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn set_model(&self, model: &str) -> Result<(), BridgeError> {
        self.inner
            .model_changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(model.to_string());
        Ok(())
    }

    async fn warmup(&self) -> Result<Vec<AgentEvent>, BridgeError> {
        Ok(self
            .inner
            .warmup_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

pub fn envelope(kind: AgentEventKind) -> AgentEvent {
    AgentEvent {
        session_id: None,
        uuid: None,
        parent_tool_use_id: None,
        kind,
    }
}

pub fn init_event(model: &str) -> AgentEvent {
    envelope(AgentEventKind::Init {
        model: Some(model.to_string()),
        slash_commands: vec!["/compact".to_string()],
        skills: Vec::new(),
    })
}

pub fn session_id_event(remote: &str) -> AgentEvent {
    let mut event = envelope(AgentEventKind::Status { status: None });
    event.session_id = Some(remote.to_string());
    event
}

pub fn text_block_start(index: u32) -> AgentEvent {
    envelope(AgentEventKind::StreamEvent {
        event: StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockStart::Text,
        },
    })
}

pub fn thinking_block_start(index: u32) -> AgentEvent {
    envelope(AgentEventKind::StreamEvent {
        event: StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockStart::Thinking,
        },
    })
}

pub fn text_delta(index: u32, text: &str) -> AgentEvent {
    envelope(AgentEventKind::StreamEvent {
        event: StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::TextDelta {
                text: text.to_string(),
            },
        },
    })
}

pub fn block_stop(index: u32) -> AgentEvent {
    envelope(AgentEventKind::StreamEvent {
        event: StreamEvent::ContentBlockStop { index },
    })
}

pub fn assistant_event(uuid: &str, text: &str) -> AgentEvent {
    let mut event = envelope(AgentEventKind::Assistant {
        message: RawMessage {
            content: MessageContent::Text(text.to_string()),
        },
    });
    event.uuid = Some(uuid.to_string());
    event
}

pub fn result_event() -> AgentEvent {
    envelope(AgentEventKind::Result {
        total_cost_usd: Some(0.01),
        duration_ms: Some(1200),
        usage: None,
    })
}

struct MockTransportInner {
    available: AtomicBool,
    reason: Mutex<String>,
    availability_checks: AtomicUsize,
    connect_attempts: AtomicUsize,
    fail_connects: AtomicUsize,
    closers: Mutex<Vec<oneshot::Sender<String>>>,
}

/// Backend transport double with knobs for availability, connect failures,
/// and remote-initiated closes.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

impl MockTransport {
    pub fn available() -> Self {
        Self::with_availability(true, "")
    }

    pub fn unavailable(reason: &str) -> Self {
        Self::with_availability(false, reason)
    }

    fn with_availability(available: bool, reason: &str) -> Self {
        Self {
            inner: Arc::new(MockTransportInner {
                available: AtomicBool::new(available),
                reason: Mutex::new(reason.to_string()),
                availability_checks: AtomicUsize::new(0),
                connect_attempts: AtomicUsize::new(0),
                fail_connects: AtomicUsize::new(0),
                closers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_available(&self) {
        self.inner.available.store(true, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, reason: &str) {
        let mut stored = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
        *stored = reason.to_string();
        self.inner.available.store(false, Ordering::SeqCst);
    }

    /// The next `n` connect calls fail with a connect error.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn availability_checks(&self) -> usize {
        self.inner.availability_checks.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Simulates the backend dropping the most recent connection.
    pub fn close_current(&self, reason: &str) {
        let closer = self
            .inner
            .closers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        if let Some(closer) = closer {
            let _ = closer.send(reason.to_string());
        }
    }
}

#[async_trait]
impl BackendTransport for MockTransport {
    async fn availability(&self) -> Availability {
        self.inner.availability_checks.fetch_add(1, Ordering::SeqCst);
        if self.inner.available.load(Ordering::SeqCst) {
            Availability::Available
        } else {
            let reason = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            Availability::Unavailable { reason }
        }
    }

    async fn connect(&self) -> Result<BackendHandle, BridgeError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.inner.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BridgeError::ConnectFailed {
                message: "mock connect refused".to_string(),
            });
        }
        let (closer, closed) = oneshot::channel();
        self.inner
            .closers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(closer);
        Ok(BackendHandle {
            connection: Arc::new(MockConnection {
                closed: AtomicBool::new(false),
            }),
            closed,
        })
    }
}

pub struct MockConnection {
    closed: AtomicBool,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnection for MockConnection {
    async fn close(&self) -> Result<(), BridgeError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Failure sink that swallows everything.
pub struct NullSink;

#[async_trait]
impl TurnFailureSink for NullSink {
    async fn backend_lost(&self, _text: &str) {}
    async fn announce(&self, _text: &str) {}
    async fn shutdown_turns(&self) {}
}

/// Failure sink that records what the supervisor reported.
#[derive(Default)]
pub struct RecordingSink {
    lost: Mutex<Vec<String>>,
    announced: Mutex<Vec<String>>,
    shutdowns: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lost(&self) -> Vec<String> {
        self.lost.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn announced(&self) -> Vec<String> {
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TurnFailureSink for RecordingSink {
    async fn backend_lost(&self, text: &str) {
        self.lost
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
    }

    async fn announce(&self, text: &str) {
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
    }

    async fn shutdown_turns(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
