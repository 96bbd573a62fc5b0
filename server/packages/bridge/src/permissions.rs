use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use coderelay_protocol::{PermissionDecision, ServerMessage, ToolDecision};

use crate::session::{PendingPermission, PendingQuestion, SessionRegistry};

/// How long a permission request or question stays open before it is denied.
pub const DECISION_TIMEOUT: Duration = Duration::from_secs(300);

const QUESTION_TOOL_NAME: &str = "AskUserQuestion";

/// Per-turn handle the agent driver calls into when the agent wants to use a
/// tool. Registers the request, broadcasts it, and parks until a client
/// decides, the timeout fires, or the turn is aborted.
#[derive(Clone)]
pub struct TurnPermissions {
    registry: SessionRegistry,
    session_id: String,
    turn_seq: u64,
    abort: CancellationToken,
}

enum Wait {
    Decided(Result<PermissionDecision, oneshot::error::RecvError>),
    Answered(Result<Value, oneshot::error::RecvError>),
    TimedOut,
    Aborted,
}

impl TurnPermissions {
    pub fn new(
        registry: SessionRegistry,
        session_id: String,
        turn_seq: u64,
        abort: CancellationToken,
    ) -> Self {
        Self {
            registry,
            session_id,
            turn_seq,
            abort,
        }
    }

    pub async fn can_use_tool(
        &self,
        tool_name: &str,
        input: Value,
        tool_use_id: &str,
        decision_reason: &str,
    ) -> ToolDecision {
        if tool_name == QUESTION_TOOL_NAME {
            return self.ask_user(input, tool_use_id).await;
        }

        let pre_approved = self
            .registry
            .with_session(&self.session_id, |session| {
                session.allowed_tools.contains(tool_name)
            })
            .await
            .unwrap_or(false);
        if pre_approved {
            return ToolDecision::Allow {
                updated_input: input,
            };
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        let registered = self
            .registry
            .with_session(&self.session_id, |session| {
                if session.turn_seq != self.turn_seq {
                    return false;
                }
                session.pending_permissions.insert(
                    request_id.clone(),
                    PendingPermission {
                        tool_name: tool_name.to_string(),
                        tool_input: input.clone(),
                        tool_use_id: tool_use_id.to_string(),
                        decision_reason: decision_reason.to_string(),
                        turn_seq: self.turn_seq,
                        responder: tx,
                    },
                );
                true
            })
            .await
            .unwrap_or(false);
        if !registered {
            return ToolDecision::deny("Request cancelled");
        }

        let request = ServerMessage::PermissionRequest {
            request_id: request_id.clone(),
            tool_name: tool_name.to_string(),
            tool_input: input.clone(),
            tool_use_id: tool_use_id.to_string(),
            decision_reason: decision_reason.to_string(),
        };
        if self
            .registry
            .record_and_send(&self.session_id, request)
            .await
            .is_err()
        {
            return ToolDecision::deny("Request cancelled");
        }
        info!(
            session_id = %self.session_id,
            request_id = %request_id,
            tool_name,
            "permission requested"
        );

        let waited = tokio::select! {
            decision = &mut rx => Wait::Decided(decision),
            _ = tokio::time::sleep(DECISION_TIMEOUT) => Wait::TimedOut,
            _ = self.abort.cancelled() => Wait::Aborted,
        };

        match waited {
            Wait::Decided(Ok(decision)) => map_decision(decision, input),
            Wait::Decided(Err(_)) => {
                // The turn was torn down; its teardown already broadcast the
                // cancellation.
                ToolDecision::deny("Request cancelled")
            }
            Wait::TimedOut => {
                self.expire_permission(&request_id, rx, input, "Permission request timed out")
                    .await
            }
            Wait::Aborted => {
                self.expire_permission(&request_id, rx, input, "Request cancelled")
                    .await
            }
            Wait::Answered(_) => unreachable!(),
        }
    }

    /// AskUserQuestion flow: the decision is the answers themselves, merged
    /// into the tool input.
    pub async fn ask_user(&self, input: Value, tool_use_id: &str) -> ToolDecision {
        let (tx, mut rx) = oneshot::channel();
        let registered = self
            .registry
            .with_session(&self.session_id, |session| {
                if session.turn_seq != self.turn_seq {
                    return false;
                }
                session.pending_questions.insert(
                    tool_use_id.to_string(),
                    PendingQuestion {
                        input: input.clone(),
                        turn_seq: self.turn_seq,
                        responder: tx,
                    },
                );
                true
            })
            .await
            .unwrap_or(false);
        if !registered {
            return ToolDecision::deny("Request cancelled");
        }

        let request = ServerMessage::AskUserRequest {
            tool_id: tool_use_id.to_string(),
            input,
        };
        if self
            .registry
            .record_and_send(&self.session_id, request)
            .await
            .is_err()
        {
            return ToolDecision::deny("Request cancelled");
        }

        let waited = tokio::select! {
            answers = &mut rx => Wait::Answered(answers),
            _ = tokio::time::sleep(DECISION_TIMEOUT) => Wait::TimedOut,
            _ = self.abort.cancelled() => Wait::Aborted,
        };

        match waited {
            Wait::Answered(Ok(updated_input)) => ToolDecision::Allow { updated_input },
            Wait::Answered(Err(_)) => ToolDecision::deny("Request cancelled"),
            Wait::TimedOut => self.expire_question(tool_use_id, rx, "Question timed out").await,
            Wait::Aborted => self.expire_question(tool_use_id, rx, "Request cancelled").await,
            Wait::Decided(_) => unreachable!(),
        }
    }

    /// Timeout/abort path. If a client decision raced in and already removed
    /// the entry, defer to it instead of denying.
    async fn expire_permission(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<PermissionDecision>,
        input: Value,
        message: &str,
    ) -> ToolDecision {
        let removed = self
            .registry
            .with_session(&self.session_id, |session| {
                session.pending_permissions.remove(request_id).is_some()
            })
            .await
            .unwrap_or(false);
        if !removed {
            debug!(request_id, "decision raced with expiry, deferring");
            return match rx.await {
                Ok(decision) => map_decision(decision, input),
                Err(_) => ToolDecision::deny(message),
            };
        }
        let _ = self
            .registry
            .record_and_send(
                &self.session_id,
                ServerMessage::PermissionCancel {
                    request_id: request_id.to_string(),
                },
            )
            .await;
        ToolDecision::deny(message)
    }

    async fn expire_question(
        &self,
        tool_id: &str,
        rx: oneshot::Receiver<Value>,
        message: &str,
    ) -> ToolDecision {
        let removed = self
            .registry
            .with_session(&self.session_id, |session| {
                session.pending_questions.remove(tool_id).is_some()
            })
            .await
            .unwrap_or(false);
        if !removed {
            return match rx.await {
                Ok(updated_input) => ToolDecision::Allow { updated_input },
                Err(_) => ToolDecision::deny(message),
            };
        }
        let _ = self
            .registry
            .record_and_send(
                &self.session_id,
                ServerMessage::AskUserCancel {
                    tool_id: tool_id.to_string(),
                },
            )
            .await;
        ToolDecision::deny(message)
    }
}

fn map_decision(decision: PermissionDecision, input: Value) -> ToolDecision {
    match decision {
        PermissionDecision::Allow | PermissionDecision::AllowAlways => ToolDecision::Allow {
            updated_input: input,
        },
        PermissionDecision::Deny => ToolDecision::deny("User denied permission"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::store::MemorySessionStore;

    async fn setup() -> (SessionRegistry, String, TurnPermissions) {
        let registry = SessionRegistry::new(Arc::new(MemorySessionStore::new()));
        let session_id = registry.create_session().await;
        let perms = TurnPermissions::new(
            registry.clone(),
            session_id.clone(),
            0,
            CancellationToken::new(),
        );
        (registry, session_id, perms)
    }

    #[tokio::test]
    async fn pre_approved_tool_skips_the_request() {
        let (registry, session_id, perms) = setup().await;
        registry
            .with_session(&session_id, |s| {
                s.allowed_tools.insert("bash".to_string());
            })
            .await
            .unwrap();
        let decision = perms
            .can_use_tool("bash", json!({"command": "ls"}), "t1", "")
            .await;
        assert!(decision.is_allow());
        let open = registry
            .with_session(&session_id, |s| s.pending_permissions.len())
            .await
            .unwrap();
        assert_eq!(open, 0);
    }

    #[tokio::test]
    async fn client_deny_resolves_request() {
        let (registry, session_id, perms) = setup().await;
        let mut rx = registry.subscribe();
        let task = tokio::spawn(async move {
            perms.can_use_tool("bash", json!({}), "t1", "").await
        });
        let request_id = loop {
            match rx.recv().await.unwrap() {
                ServerMessage::PermissionRequest { request_id, .. } => break request_id,
                _ => continue,
            }
        };
        registry
            .resolve_permission(&request_id, PermissionDecision::Deny)
            .await
            .unwrap();
        let decision = task.await.unwrap();
        assert_eq!(decision, ToolDecision::deny("User denied permission"));
        let open = registry
            .with_session(&session_id, |s| s.pending_permissions.len())
            .await
            .unwrap();
        assert_eq!(open, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_denies_and_cancels() {
        let (registry, session_id, perms) = setup().await;
        let task = tokio::spawn(async move {
            perms.can_use_tool("bash", json!({}), "t1", "").await
        });
        tokio::time::sleep(DECISION_TIMEOUT + Duration::from_secs(1)).await;
        let decision = task.await.unwrap();
        assert_eq!(decision, ToolDecision::deny("Permission request timed out"));
        let cancelled = registry
            .with_session(&session_id, |s| {
                s.history
                    .iter()
                    .any(|m| matches!(m, ServerMessage::PermissionCancel { .. }))
            })
            .await
            .unwrap();
        assert!(cancelled);
    }

    #[tokio::test]
    async fn abort_token_cancels_the_wait() {
        let (registry, _session_id, _) = setup().await;
        let session_id = registry.active_session_id().await.unwrap();
        let abort = CancellationToken::new();
        let perms = TurnPermissions::new(registry.clone(), session_id, 0, abort.clone());
        let task = tokio::spawn(async move {
            perms.can_use_tool("bash", json!({}), "t1", "").await
        });
        tokio::task::yield_now().await;
        abort.cancel();
        let decision = task.await.unwrap();
        assert_eq!(decision, ToolDecision::deny("Request cancelled"));
    }

    #[tokio::test]
    async fn ask_user_merges_answers() {
        let (registry, _session_id, perms) = setup().await;
        let mut rx = registry.subscribe();
        let task = tokio::spawn(async move {
            perms
                .ask_user(json!({"questions": ["which?"]}), "toolu_1")
                .await
        });
        loop {
            if let ServerMessage::AskUserRequest { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        registry
            .answer_question("toolu_1", json!(["the first one"]))
            .await
            .unwrap();
        match task.await.unwrap() {
            ToolDecision::Allow { updated_input } => {
                assert_eq!(updated_input["answers"][0], "the first one");
                assert_eq!(updated_input["questions"][0], "which?");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_turn_seq_is_denied_without_registering() {
        let (registry, session_id, _) = setup().await;
        registry
            .with_session(&session_id, |s| {
                s.turn_seq = 3;
            })
            .await
            .unwrap();
        let perms = TurnPermissions::new(
            registry.clone(),
            session_id.clone(),
            1,
            CancellationToken::new(),
        );
        let decision = perms.can_use_tool("bash", json!({}), "t1", "").await;
        assert_eq!(decision, ToolDecision::deny("Request cancelled"));
    }
}
