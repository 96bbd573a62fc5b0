use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use coderelay_error::BridgeError;
use coderelay_protocol::{PermissionDecision, ServerMessage, SessionSummary, TurnStatus};

use crate::queue::MessageQueue;
use crate::store::{SessionSnapshot, SessionStore};

/// Messages per history page sent to a client.
pub const HISTORY_PAGE_SIZE: usize = 200;

/// Rewind cursors kept per session before the oldest are forgotten.
const MAX_MESSAGE_CURSORS: usize = 5000;

const DEFAULT_TITLE: &str = "New session";
const MAX_AUTO_TITLE_LEN: usize = 50;
const MAX_TITLE_LEN: usize = 100;
const MAX_PREVIEW_LEN: usize = 200;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Agent-wide configuration learned from init events, shared across sessions.
#[derive(Debug, Clone, Default)]
pub struct SharedAgentConfig {
    pub model: Option<String>,
    pub models: Vec<String>,
    pub slash_commands: Vec<String>,
    pub skills: Vec<String>,
}

/// An open permission request awaiting a client decision.
pub struct PendingPermission {
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: String,
    pub decision_reason: String,
    pub turn_seq: u64,
    pub responder: oneshot::Sender<PermissionDecision>,
}

/// An open AskUserQuestion awaiting client answers. Resolved with the tool
/// input merged with the answers.
pub struct PendingQuestion {
    pub input: Value,
    pub turn_seq: u64,
    pub responder: oneshot::Sender<Value>,
}

/// Everything the bridge tracks for one conversation.
pub struct SessionState {
    pub id: String,
    pub cli_session_id: Option<String>,
    pub title: String,
    pub created_at: i64,
    pub last_activity: i64,

    pub is_processing: bool,
    pub compacting: bool,
    /// Bumped whenever the running turn is torn down; events stamped with an
    /// older value are stale and ignored.
    pub turn_seq: u64,
    pub queue: Option<Arc<MessageQueue>>,
    pub abort: Option<CancellationToken>,

    pub blocks: HashMap<u32, BlockState>,
    pub streamed_text: bool,
    /// Leading text of the current assistant response, for list previews.
    pub preview: String,
    pub sent_tool_results: HashSet<String>,
    pub pending_permissions: HashMap<String, PendingPermission>,
    pub pending_questions: HashMap<String, PendingQuestion>,
    pub allowed_tools: HashSet<String>,

    pub history: Vec<ServerMessage>,
    message_cursor_order: VecDeque<String>,
    message_cursor_set: HashSet<String>,
    pub last_rewind_uuid: Option<String>,
}

/// A content block currently open in the raw stream, keyed by index.
#[derive(Debug, Clone)]
pub enum BlockState {
    Text,
    Thinking,
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

impl SessionState {
    fn new(id: String, now: i64) -> Self {
        Self {
            id,
            cli_session_id: None,
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            last_activity: now,
            is_processing: false,
            compacting: false,
            turn_seq: 0,
            queue: None,
            abort: None,
            blocks: HashMap::new(),
            streamed_text: false,
            preview: String::new(),
            sent_tool_results: HashSet::new(),
            pending_permissions: HashMap::new(),
            pending_questions: HashMap::new(),
            allowed_tools: HashSet::new(),
            history: Vec::new(),
            message_cursor_order: VecDeque::new(),
            message_cursor_set: HashSet::new(),
            last_rewind_uuid: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = now_ms();
    }

    /// Records a rewind cursor. Returns false if the uuid was already seen.
    pub fn note_message_uuid(&mut self, uuid: &str) -> bool {
        if !self.message_cursor_set.insert(uuid.to_string()) {
            return false;
        }
        self.message_cursor_order.push_back(uuid.to_string());
        if self.message_cursor_order.len() > MAX_MESSAGE_CURSORS {
            if let Some(oldest) = self.message_cursor_order.pop_front() {
                self.message_cursor_set.remove(&oldest);
            }
        }
        true
    }

    pub fn has_message_uuid(&self, uuid: &str) -> bool {
        self.message_cursor_set.contains(uuid)
    }

    pub fn push_preview(&mut self, text: &str) {
        let have = self.preview.chars().count();
        if have >= MAX_PREVIEW_LEN {
            return;
        }
        self.preview.extend(text.chars().take(MAX_PREVIEW_LEN - have));
    }

    /// Drops all turn-scoped stream state. Pending requests are returned to
    /// the caller so cancellations can be emitted outside the table lock.
    pub fn reset_turn_state(&mut self) -> CancelledRequests {
        self.turn_seq += 1;
        self.is_processing = false;
        self.compacting = false;
        self.blocks.clear();
        self.streamed_text = false;
        self.sent_tool_results.clear();
        CancelledRequests {
            permissions: self.pending_permissions.drain().map(|(k, _)| k).collect(),
            questions: self.pending_questions.drain().map(|(k, _)| k).collect(),
        }
    }

    pub fn summary(&self, active: bool) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            cli_session_id: self.cli_session_id.clone(),
            title: self.title.clone(),
            active,
            is_processing: self.is_processing,
            last_activity: self.last_activity,
            preview: if self.preview.is_empty() {
                None
            } else {
                Some(self.preview.clone())
            },
        }
    }
}

/// Ids of requests dropped by a turn teardown. Dropping the responder halves
/// resolves the awaiting callbacks with a deny.
pub struct CancelledRequests {
    pub permissions: Vec<String>,
    pub questions: Vec<String>,
}

impl CancelledRequests {
    pub fn cancel_messages(&self) -> Vec<ServerMessage> {
        let mut out = Vec::with_capacity(self.permissions.len() + self.questions.len());
        for request_id in &self.permissions {
            out.push(ServerMessage::PermissionCancel {
                request_id: request_id.clone(),
            });
        }
        for tool_id in &self.questions {
            out.push(ServerMessage::AskUserCancel {
                tool_id: tool_id.clone(),
            });
        }
        out
    }
}

struct SessionTable {
    map: HashMap<String, SessionState>,
    active: Option<String>,
}

struct RegistryInner {
    store: Arc<dyn SessionStore>,
    broadcast: broadcast::Sender<ServerMessage>,
    table: Mutex<SessionTable>,
    config: std::sync::Mutex<SharedAgentConfig>,
    next_local_id: AtomicU64,
}

/// Owns all sessions, the shared agent config, and the outbound broadcast
/// channel. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (broadcast, _) = broadcast::channel(512);
        Self {
            inner: Arc::new(RegistryInner {
                store,
                broadcast,
                table: Mutex::new(SessionTable {
                    map: HashMap::new(),
                    active: None,
                }),
                config: std::sync::Mutex::new(SharedAgentConfig::default()),
                next_local_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.broadcast.subscribe()
    }

    /// Sends a message to all connected clients without recording it.
    pub fn broadcast(&self, message: ServerMessage) {
        let _ = self.inner.broadcast.send(message);
    }

    pub fn config(&self) -> SharedAgentConfig {
        self.inner
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update_config(&self, f: impl FnOnce(&mut SharedAgentConfig)) {
        let mut config = self.inner.config.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut config);
    }

    /// Runs `f` against a session's state under the table lock.
    pub async fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Result<T, BridgeError> {
        let mut table = self.inner.table.lock().await;
        let session = table
            .map
            .get_mut(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Ok(f(session))
    }

    pub async fn active_session_id(&self) -> Option<String> {
        self.inner.table.lock().await.active.clone()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.inner.table.lock().await.map.keys().cloned().collect()
    }

    /// Creates a session and makes it active.
    pub async fn create_session(&self) -> String {
        let n = self.inner.next_local_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("sess_{n}");
        {
            let mut table = self.inner.table.lock().await;
            table.map.insert(id.clone(), SessionState::new(id.clone(), now_ms()));
            table.active = Some(id.clone());
        }
        debug!(session_id = %id, "created session");
        self.broadcast(ServerMessage::SessionSwitched {
            id: id.clone(),
            cli_session_id: None,
        });
        self.broadcast_session_list().await;
        id
    }

    pub async fn switch_session(&self, session_id: &str) -> Result<(), BridgeError> {
        let cli_session_id = {
            let mut table = self.inner.table.lock().await;
            let session =
                table
                    .map
                    .get(session_id)
                    .ok_or_else(|| BridgeError::SessionNotFound {
                        session_id: session_id.to_string(),
                    })?;
            let cli = session.cli_session_id.clone();
            table.active = Some(session_id.to_string());
            cli
        };
        self.broadcast(ServerMessage::SessionSwitched {
            id: session_id.to_string(),
            cli_session_id,
        });
        self.broadcast_session_list().await;
        Ok(())
    }

    /// Finds the session owning a remote agent session id and makes it
    /// active. Creates a fresh session bound to that id if none matches.
    pub async fn resume_session(&self, cli_session_id: &str) -> String {
        let existing = {
            let table = self.inner.table.lock().await;
            table
                .map
                .values()
                .find(|s| s.cli_session_id.as_deref() == Some(cli_session_id))
                .map(|s| s.id.clone())
        };
        if let Some(id) = existing {
            // Already known; switching cannot fail for an id we just saw.
            if self.switch_session(&id).await.is_ok() {
                return id;
            }
        }
        let id = self.create_session().await;
        let _ = self
            .with_session(&id, |session| {
                session.cli_session_id = Some(cli_session_id.to_string());
            })
            .await;
        id
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> Result<(), BridgeError> {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::InvalidRequest {
                message: "session title cannot be empty".to_string(),
            });
        }
        let title = truncate_chars(trimmed, MAX_TITLE_LEN);
        self.with_session(session_id, |session| {
            session.title = title;
            session.touch();
        })
        .await?;
        self.save_snapshot(session_id).await;
        self.broadcast_session_list().await;
        Ok(())
    }

    /// Removes a session. The caller must interrupt any running turn first.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), BridgeError> {
        let removed = {
            let mut table = self.inner.table.lock().await;
            let removed = table.map.remove(session_id);
            if table.active.as_deref() == Some(session_id) {
                table.active = None;
            }
            removed
        };
        let mut removed = removed.ok_or_else(|| BridgeError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        removed.reset_turn_state();
        if let Some(queue) = removed.queue.take() {
            queue.end();
        }
        if let Some(abort) = removed.abort.take() {
            abort.cancel();
        }
        if let Err(error) = self.inner.store.delete(session_id).await {
            warn!(session_id, %error, "failed to delete stored session");
        }
        self.broadcast_session_list().await;
        Ok(())
    }

    /// Appends to history, persists, and broadcasts in one step.
    pub async fn record_and_send(
        &self,
        session_id: &str,
        message: ServerMessage,
    ) -> Result<(), BridgeError> {
        self.record_batch(session_id, vec![message.clone()], vec![message])
            .await
    }

    /// Records `record` into the session history and broadcasts `send`. The
    /// two differ when a translator emits broadcast-only messages.
    pub async fn record_batch(
        &self,
        session_id: &str,
        record: Vec<ServerMessage>,
        send: Vec<ServerMessage>,
    ) -> Result<(), BridgeError> {
        if !record.is_empty() {
            self.with_session(session_id, |session| {
                session.history.extend(record.iter().cloned());
                session.touch();
            })
            .await?;
            for message in &record {
                if let Err(error) = self.inner.store.append(session_id, message).await {
                    warn!(session_id, %error, "failed to append to session store");
                }
            }
        }
        for message in send {
            self.broadcast(message);
        }
        Ok(())
    }

    pub async fn save_snapshot(&self, session_id: &str) {
        let snapshot = {
            let table = self.inner.table.lock().await;
            table.map.get(session_id).map(|session| SessionSnapshot {
                id: session.id.clone(),
                cli_session_id: session.cli_session_id.clone(),
                title: session.title.clone(),
                created_at: session.created_at,
                last_activity: session.last_activity,
                history: session.history.clone(),
            })
        };
        if let Some(snapshot) = snapshot {
            if let Err(error) = self.inner.store.save_snapshot(&snapshot).await {
                warn!(session_id, %error, "failed to save session snapshot");
            }
        }
    }

    pub async fn broadcast_session_list(&self) {
        let sessions = {
            let table = self.inner.table.lock().await;
            let active = table.active.clone();
            let mut sessions: Vec<SessionSummary> = table
                .map
                .values()
                .map(|s| s.summary(active.as_deref() == Some(s.id.as_str())))
                .collect();
            sessions.sort_by_key(|s| std::cmp::Reverse(s.last_activity));
            sessions
        };
        self.broadcast(ServerMessage::SessionList { sessions });
    }

    /// Sets the session title from its first user message, if still unnamed.
    pub async fn auto_title(&self, session_id: &str, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let title = truncate_chars(trimmed, MAX_AUTO_TITLE_LEN);
        let _ = self
            .with_session(session_id, |session| {
                if session.title == DEFAULT_TITLE {
                    session.title = title;
                }
            })
            .await;
    }

    /// Open permission requests for one session, in replay form. Sent to
    /// clients that connect while a decision is outstanding.
    pub async fn pending_permission_requests(&self, session_id: &str) -> Vec<ServerMessage> {
        self.with_session(session_id, |session| {
            session
                .pending_permissions
                .iter()
                .map(|(request_id, pending)| ServerMessage::PermissionRequestPending {
                    request_id: request_id.clone(),
                    tool_name: pending.tool_name.clone(),
                    tool_input: pending.tool_input.clone(),
                    tool_use_id: pending.tool_use_id.clone(),
                    decision_reason: pending.decision_reason.clone(),
                })
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    /// Resolves an open permission request by id, searching all sessions.
    pub async fn resolve_permission(
        &self,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), BridgeError> {
        let resolved = {
            let mut table = self.inner.table.lock().await;
            let mut found = None;
            for session in table.map.values_mut() {
                if let Some(pending) = session.pending_permissions.remove(request_id) {
                    if decision == PermissionDecision::AllowAlways {
                        session.allowed_tools.insert(pending.tool_name.clone());
                    }
                    found = Some(pending);
                    break;
                }
            }
            found
        };
        // Already resolved elsewhere (timeout, teardown, a faster client).
        let Some(pending) = resolved else {
            debug!(request_id, "permission decision for absent request ignored");
            return Ok(());
        };
        if pending.responder.send(decision).is_err() {
            debug!(request_id, "permission responder already gone");
        }
        self.broadcast(ServerMessage::PermissionResolved {
            request_id: request_id.to_string(),
            decision,
        });
        Ok(())
    }

    /// Resolves an open AskUserQuestion by tool id, merging the answers into
    /// the original tool input.
    pub async fn answer_question(&self, tool_id: &str, answers: Value) -> Result<(), BridgeError> {
        let resolved = {
            let mut table = self.inner.table.lock().await;
            let mut found = None;
            for session in table.map.values_mut() {
                if let Some(pending) = session.pending_questions.remove(tool_id) {
                    found = Some(pending);
                    break;
                }
            }
            found
        };
        let Some(pending) = resolved else {
            debug!(tool_id, "answers for absent question ignored");
            return Ok(());
        };
        let mut merged = pending.input;
        if let Value::Object(ref mut map) = merged {
            map.insert("answers".to_string(), answers);
        } else {
            merged = serde_json::json!({ "answers": answers });
        }
        if pending.responder.send(merged).is_err() {
            debug!(tool_id, "question responder already gone");
        }
        self.broadcast(ServerMessage::AskUserAnswered {
            tool_id: tool_id.to_string(),
        });
        Ok(())
    }

    /// One page of history ending just before `before` (an index into the
    /// history vec), aligned backward to a turn boundary.
    pub async fn history_page(
        &self,
        session_id: &str,
        before: Option<usize>,
    ) -> Result<HistoryPage, BridgeError> {
        self.with_session(session_id, |session| {
            let end = before.unwrap_or(session.history.len()).min(session.history.len());
            let naive_start = end.saturating_sub(HISTORY_PAGE_SIZE);
            let start = find_turn_boundary(&session.history, naive_start);
            HistoryPage {
                messages: session.history[start..end].to_vec(),
                earlier: if start > 0 { Some(start) } else { None },
            }
        })
        .await
    }

    pub async fn session_status(&self, session_id: &str) -> Result<TurnStatus, BridgeError> {
        self.with_session(session_id, |session| {
            if session.is_processing {
                TurnStatus::Processing
            } else {
                TurnStatus::Idle
            }
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<ServerMessage>,
    /// Index to pass as `before` for the next (older) page, if any.
    pub earlier: Option<usize>,
}

/// Walks backward from `index` to the nearest user message so pages never
/// start mid-turn.
fn find_turn_boundary(history: &[ServerMessage], index: usize) -> usize {
    let mut i = index.min(history.len());
    while i > 0 {
        if matches!(history[i - 1], ServerMessage::UserMessage { .. }) {
            return i - 1;
        }
        i -= 1;
    }
    0
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn blank_session(id: &str) -> SessionState {
        SessionState::new(id.to_string(), now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(MemorySessionStore::new()))
    }

    fn user(text: &str) -> ServerMessage {
        ServerMessage::UserMessage {
            text: text.to_string(),
            image_count: None,
            pastes: None,
        }
    }

    #[tokio::test]
    async fn create_and_switch() {
        let registry = registry();
        let a = registry.create_session().await;
        let b = registry.create_session().await;
        assert_ne!(a, b);
        assert_eq!(registry.active_session_id().await, Some(b.clone()));
        registry.switch_session(&a).await.unwrap();
        assert_eq!(registry.active_session_id().await, Some(a));
    }

    #[tokio::test]
    async fn auto_title_only_before_first_user_message() {
        let registry = registry();
        let id = registry.create_session().await;
        registry.auto_title(&id, "fix the flaky websocket test").await;
        registry.record_and_send(&id, user("fix the flaky websocket test")).await.unwrap();
        registry.auto_title(&id, "something else entirely").await;
        let title = registry.with_session(&id, |s| s.title.clone()).await.unwrap();
        assert_eq!(title, "fix the flaky websocket test");
    }

    #[tokio::test]
    async fn auto_title_truncates_on_char_boundary() {
        let registry = registry();
        let id = registry.create_session().await;
        let long = "é".repeat(80);
        registry.auto_title(&id, &long).await;
        let title = registry.with_session(&id, |s| s.title.clone()).await.unwrap();
        assert_eq!(title.chars().count(), 50);
    }

    #[tokio::test]
    async fn message_uuid_dedup_and_cap() {
        let registry = registry();
        let id = registry.create_session().await;
        registry
            .with_session(&id, |session| {
                assert!(session.note_message_uuid("u1"));
                assert!(!session.note_message_uuid("u1"));
                for i in 0..MAX_MESSAGE_CURSORS {
                    session.note_message_uuid(&format!("fill-{i}"));
                }
                assert!(!session.has_message_uuid("u1"));
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn history_paging_aligns_to_user_message() {
        let registry = registry();
        let id = registry.create_session().await;
        registry
            .with_session(&id, |session| {
                for turn in 0..3 {
                    session.history.push(user(&format!("turn {turn}")));
                    for _ in 0..150 {
                        session.history.push(ServerMessage::Delta {
                            text: "x".to_string(),
                        });
                    }
                }
            })
            .await
            .unwrap();
        let page = registry.history_page(&id, None).await.unwrap();
        assert!(matches!(page.messages[0], ServerMessage::UserMessage { .. }));
        let earlier = page.earlier.unwrap();
        let older = registry.history_page(&id, Some(earlier)).await.unwrap();
        assert!(matches!(older.messages[0], ServerMessage::UserMessage { .. }));
    }

    #[tokio::test]
    async fn resolve_permission_allow_always_preapproves() {
        let registry = registry();
        let id = registry.create_session().await;
        let (tx, rx) = oneshot::channel();
        registry
            .with_session(&id, |session| {
                session.pending_permissions.insert(
                    "req-1".to_string(),
                    PendingPermission {
                        tool_name: "bash".to_string(),
                        tool_input: serde_json::json!({"command": "ls"}),
                        tool_use_id: "t1".to_string(),
                        decision_reason: String::new(),
                        turn_seq: 1,
                        responder: tx,
                    },
                );
            })
            .await
            .unwrap();
        registry
            .resolve_permission("req-1", PermissionDecision::AllowAlways)
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), PermissionDecision::AllowAlways);
        let allowed = registry
            .with_session(&id, |s| s.allowed_tools.contains("bash"))
            .await
            .unwrap();
        assert!(allowed);
        // A second decision for the same request is silently dropped.
        registry
            .resolve_permission("req-1", PermissionDecision::Deny)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn answer_question_merges_answers() {
        let registry = registry();
        let id = registry.create_session().await;
        let (tx, rx) = oneshot::channel();
        registry
            .with_session(&id, |session| {
                session.pending_questions.insert(
                    "tool-9".to_string(),
                    PendingQuestion {
                        input: serde_json::json!({"questions": ["pick one"]}),
                        turn_seq: 1,
                        responder: tx,
                    },
                );
            })
            .await
            .unwrap();
        registry
            .answer_question("tool-9", serde_json::json!(["option a"]))
            .await
            .unwrap();
        let merged = rx.await.unwrap();
        assert_eq!(merged["questions"][0], "pick one");
        assert_eq!(merged["answers"][0], "option a");
    }

    #[tokio::test]
    async fn delete_session_ends_queue() {
        let registry = registry();
        let id = registry.create_session().await;
        let queue = Arc::new(MessageQueue::new());
        registry
            .with_session(&id, |session| {
                session.queue = Some(queue.clone());
            })
            .await
            .unwrap();
        registry.delete_session(&id).await.unwrap();
        assert!(queue.is_ended());
        assert!(registry.with_session(&id, |_| ()).await.is_err());
    }
}
