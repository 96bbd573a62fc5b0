use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use coderelay_error::BridgeError;

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

const DISCONNECT_NOTICE: &str = "Agent backend disconnected.";
const EXHAUSTED_NOTICE: &str = "Agent backend is unavailable after 3 reconnect attempts.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable { reason: String },
}

/// A live backend connection plus the channel that reports its death.
pub struct BackendHandle {
    pub connection: Arc<dyn BackendConnection>,
    pub closed: oneshot::Receiver<String>,
}

/// Factory for backend connections: probes whether the agent runtime exists
/// at all, and establishes transports to it.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn availability(&self) -> Availability;
    async fn connect(&self) -> Result<BackendHandle, BridgeError>;
}

#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn close(&self) -> Result<(), BridgeError>;
}

/// What the supervisor does to running turns when the backend comes and goes.
/// Implemented by the turn engine.
#[async_trait]
pub trait TurnFailureSink: Send + Sync {
    /// The backend dropped with turns possibly in flight: fail them all.
    async fn backend_lost(&self, text: &str);
    /// Broadcast-only notice, no turn state touched.
    async fn announce(&self, text: &str);
    /// Orderly stop of every running turn ahead of shutdown.
    async fn shutdown_turns(&self);
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), BridgeError>>>;

struct SupervisorState {
    connected: bool,
    connection: Option<Arc<dyn BackendConnection>>,
    connecting: Option<ConnectFuture>,
    retry_count: u32,
    retry_task: Option<JoinHandle<()>>,
    runtime_available: bool,
    unavailable_reason: String,
    shutting_down: bool,
    /// Ties close notifications to the connection that produced them, so a
    /// stale watcher cannot tear down its successor.
    generation: u64,
}

struct SupervisorInner {
    transport: Arc<dyn BackendTransport>,
    sink: Arc<dyn TurnFailureSink>,
    state: Mutex<SupervisorState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub connected: bool,
    pub runtime_available: bool,
    pub retry_count: u32,
    pub shutting_down: bool,
    pub unavailable_reason: String,
}

/// Keeps one backend connection alive: shares concurrent connect attempts,
/// watches for transport loss, fails affected turns, and retries a bounded
/// number of times before giving up.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn BackendTransport>, sink: Arc<dyn TurnFailureSink>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                transport,
                sink,
                state: Mutex::new(SupervisorState {
                    connected: false,
                    connection: None,
                    connecting: None,
                    retry_count: 0,
                    retry_task: None,
                    runtime_available: true,
                    unavailable_reason: String::new(),
                    shutting_down: false,
                    generation: 0,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.lock();
        SupervisorStatus {
            connected: state.connected,
            runtime_available: state.runtime_available,
            retry_count: state.retry_count,
            shutting_down: state.shutting_down,
            unavailable_reason: state.unavailable_reason.clone(),
        }
    }

    pub fn connection(&self) -> Option<Arc<dyn BackendConnection>> {
        self.lock().connection.clone()
    }

    /// Connects if not already connected. Concurrent callers share one
    /// in-flight attempt. `force` bypasses the cached unavailable verdict.
    pub async fn ensure_connected(&self, force: bool) -> Result<(), BridgeError> {
        let fut = {
            let mut state = self.lock();
            if state.shutting_down {
                return Err(BridgeError::ShuttingDown);
            }
            if state.connected && !force {
                return Ok(());
            }
            if !force && !state.runtime_available {
                return Err(BridgeError::Unavailable {
                    reason: state.unavailable_reason.clone(),
                });
            }
            match state.connecting.clone() {
                Some(fut) => fut,
                None => {
                    let this = self.clone();
                    let fut = async move { this.connect_once().await }.boxed().shared();
                    state.connecting = Some(fut.clone());
                    fut
                }
            }
        };
        let result = fut.await;
        self.lock().connecting = None;
        result
    }

    async fn connect_once(&self) -> Result<(), BridgeError> {
        match self.inner.transport.availability().await {
            Availability::Unavailable { reason } => {
                let mut state = self.lock();
                state.runtime_available = false;
                state.unavailable_reason = reason.clone();
                return Err(BridgeError::Unavailable { reason });
            }
            Availability::Available => {}
        }

        let handle = self.inner.transport.connect().await?;
        let generation = {
            let mut state = self.lock();
            if state.shutting_down {
                return Err(BridgeError::ShuttingDown);
            }
            state.generation += 1;
            state.connected = true;
            state.connection = Some(handle.connection);
            state.runtime_available = true;
            state.unavailable_reason.clear();
            state.retry_count = 0;
            state.generation
        };
        info!(generation, "agent backend connected");

        let this = self.clone();
        tokio::spawn(async move {
            let reason = handle
                .closed
                .await
                .unwrap_or_else(|_| "transport dropped".to_string());
            this.handle_transport_close(generation, reason).await;
        });
        Ok(())
    }

    async fn handle_transport_close(&self, generation: u64, reason: String) {
        {
            let mut state = self.lock();
            if state.shutting_down || state.generation != generation || !state.connected {
                return;
            }
            state.connected = false;
            state.connection = None;
        }
        warn!(%reason, "agent backend transport closed");
        self.inner.sink.backend_lost(DISCONNECT_NOTICE).await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let mut state = self.lock();
        if state.shutting_down || state.retry_task.is_some() || state.connected {
            return;
        }
        if state.retry_count >= MAX_RETRIES {
            state.runtime_available = false;
            state.unavailable_reason = EXHAUSTED_NOTICE.to_string();
            drop(state);
            warn!(max_retries = MAX_RETRIES, "backend reconnect attempts exhausted");
            let sink = self.inner.sink.clone();
            tokio::spawn(async move {
                sink.announce(EXHAUSTED_NOTICE).await;
            });
            return;
        }
        let delay = RETRY_DELAYS[state.retry_count as usize];
        state.retry_count += 1;
        let attempt = state.retry_count;
        let this = self.clone();
        state.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.lock().retry_task = None;
            info!(attempt, "attempting backend reconnect");
            match this.ensure_connected(true).await {
                Ok(()) => info!(attempt, "backend reconnected"),
                Err(error) => {
                    warn!(attempt, %error, "reconnect attempt failed");
                    this.schedule_reconnect();
                }
            }
        }));
    }

    /// Irreversible shutdown: stops retries, interrupts all turns, and closes
    /// the connection best-effort.
    pub async fn shutdown(&self) {
        let (connection, retry_task) = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.connected = false;
            state.connecting = None;
            (state.connection.take(), state.retry_task.take())
        };
        info!("shutting down backend supervisor");
        if let Some(task) = retry_task {
            task.abort();
        }
        self.inner.sink.shutdown_turns().await;
        if let Some(connection) = connection {
            if let Err(error) = connection.close().await {
                warn!(%error, "backend close during shutdown failed");
            }
        }
    }
}
