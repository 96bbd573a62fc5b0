use tracing::warn;

use coderelay_error::BridgeError;
use coderelay_protocol::{ClientCommand, ServerMessage};

use crate::session::SessionRegistry;
use crate::supervisor::ConnectionSupervisor;
use crate::turn::TurnEngine;

/// Entry point the client transport calls into: routes the closed inbound
/// command set to the engine, registry, and supervisor.
#[derive(Clone)]
pub struct Bridge {
    engine: TurnEngine,
    supervisor: ConnectionSupervisor,
}

impl Bridge {
    pub fn new(engine: TurnEngine, supervisor: ConnectionSupervisor) -> Self {
        Self { engine, supervisor }
    }

    pub fn engine(&self) -> &TurnEngine {
        &self.engine
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.engine.registry()
    }

    pub async fn handle_command(&self, command: ClientCommand) -> Result<(), BridgeError> {
        match command {
            ClientCommand::Message {
                text,
                images,
                pastes,
            } => {
                if let Err(err) = self.supervisor.ensure_connected(false).await {
                    warn!(%err, "message rejected, backend not connected");
                    self.registry().broadcast(ServerMessage::Error {
                        text: err.to_string(),
                    });
                    return Err(err);
                }
                let session_id = self.active_or_create().await;
                self.engine
                    .send_user_message(&session_id, &text, images, pastes)
                    .await
            }

            ClientCommand::Stop => {
                let Some(session_id) = self.registry().active_session_id().await else {
                    return Ok(());
                };
                self.engine.interrupt(&session_id).await
            }

            ClientCommand::SetModel { model } => self.engine.set_model(&model).await,

            ClientCommand::PermissionResponse {
                request_id,
                decision,
            } => self.registry().resolve_permission(&request_id, decision).await,

            ClientCommand::AskUserResponse { tool_id, answers } => {
                self.registry().answer_question(&tool_id, answers).await
            }

            ClientCommand::NewSession => {
                self.registry().create_session().await;
                Ok(())
            }

            ClientCommand::SwitchSession { id } => self.registry().switch_session(&id).await,

            ClientCommand::ResumeSession { cli_session_id } => {
                self.registry().resume_session(&cli_session_id).await;
                Ok(())
            }

            ClientCommand::DeleteSession { id } => self.engine.delete_session(&id).await,

            ClientCommand::RenameSession { id, title } => {
                self.registry().rename_session(&id, &title).await
            }

            ClientCommand::RewindExecute { uuid } => {
                let session_id =
                    self.registry()
                        .active_session_id()
                        .await
                        .ok_or(BridgeError::InvalidRequest {
                            message: "no active session to rewind".to_string(),
                        })?;
                self.engine.rewind_to(&session_id, &uuid).await
            }
        }
    }

    /// Connects to the backend (when available) and primes the shared agent
    /// config, so the first client sees models and slash commands before any
    /// turn runs. Call once at startup.
    pub async fn warmup(&self) -> Result<(), BridgeError> {
        self.supervisor.ensure_connected(false).await?;
        self.engine.warmup().await
    }

    /// What a freshly connected client needs to render the active session:
    /// the latest history page, current status, and any still-open permission
    /// requests.
    pub async fn reconnect_replay(&self, session_id: &str) -> Result<Vec<ServerMessage>, BridgeError> {
        let registry = self.registry();
        let page = registry.history_page(session_id, None).await?;
        let mut out = page.messages;
        out.push(ServerMessage::Status {
            status: registry.session_status(session_id).await?,
        });
        out.extend(registry.pending_permission_requests(session_id).await);
        Ok(out)
    }

    async fn active_or_create(&self) -> String {
        match self.registry().active_session_id().await {
            Some(id) => id,
            None => self.registry().create_session().await,
        }
    }
}
