//! Wire types for the coderelay bridge.
//!
//! Three closed sets:
//! - [`ClientCommand`]: inbound messages from browser clients (delivered by the
//!   WebSocket transport, which is not part of this workspace).
//! - [`ServerMessage`]: outbound normalized messages broadcast to clients and
//!   appended to the session history log.
//! - [`AgentEvent`]: raw streaming events produced by an agent driver, consumed
//!   by the bridge's event translator.

mod agent;
mod client;
mod prompt;

pub use agent::*;
pub use client::*;
pub use prompt::*;
