//! Agent bridge: session state, turn driving, and backend supervision.
//!
//! The bridge sits between client transports (WebSocket servers, TUIs) and an
//! agent backend reached through an [`AgentDriver`]. Inbound user messages are
//! queued per turn, the driver's raw event stream is translated into the
//! normalized [`coderelay_protocol::ServerMessage`] set, tool permissions are
//! arbitrated against connected clients, and the backend connection is kept
//! alive with bounded reconnect retries.

pub mod commands;
pub mod mock;
pub mod permissions;
pub mod queue;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod translate;
pub mod turn;

pub use commands::Bridge;
pub use permissions::{TurnPermissions, DECISION_TIMEOUT};
pub use queue::MessageQueue;
pub use session::{SessionRegistry, SharedAgentConfig, HISTORY_PAGE_SIZE};
pub use store::{MemorySessionStore, NullSessionStore, SessionSnapshot, SessionStore};
pub use supervisor::{
    Availability, BackendConnection, BackendHandle, BackendTransport, ConnectionSupervisor,
    SupervisorStatus, TurnFailureSink, MAX_RETRIES, RETRY_DELAYS,
};
pub use turn::{AgentDriver, AgentEventStream, TurnEngine, TurnRequest};
