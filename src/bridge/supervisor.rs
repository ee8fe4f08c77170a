//! Agent app-server supervisor
//!
//! Owns the agent process for the lifetime of one session and exposes the
//! public control surface: `start`, `stop`, `send`, `status`, plus the event
//! subscription point. One supervisor manages at most one process at a time;
//! independent supervisors are independent - there is no global state.

use crate::bridge::error::BridgeError;
use crate::bridge::events::{EventBus, ServerEvent};
use crate::bridge::handshake::{ClientInfo, HandshakeController};
use crate::io::process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    StderrMonitor, StopMode,
};
use crate::io::transport::{StdioTransport, Transport};
use crate::log_rpc_frame;
use crate::preferences::BridgePreferences;
use crate::rpc::codec::{
    CodecError, IncomingFrame, JsonRpcRequest, JsonRpcResponse, decode_frame, encode_frame,
};
use crate::rpc::pending::{FlushReason, PendingCalls};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Level, debug, info, warn};

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of the supervised server
///
/// Monotonic within one process instance:
/// `Idle → Starting → (Ready | Error) → Stopped`. Restarting begins a new
/// instance with a fresh arc, never a re-entry into `Ready` from `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Idle,
    Starting,
    Ready,
    Stopped,
    Error,
}

/// Point-in-time view of the supervised server
///
/// Mutated only by the supervisor; callers get snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub pid: Option<u32>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub last_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            state: ServerState::Idle,
            pid: None,
            host: None,
            port: None,
            last_message: None,
            started_at: None,
        }
    }
}

// ============================================================================
// Start options / result
// ============================================================================

/// Options for launching the agent app-server
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Path to the agent binary
    pub binary_path: String,
    /// Working directory; defaults to the binary's own directory when unset
    pub working_directory: Option<PathBuf>,
    /// Optional bind host, forwarded as `--host`
    pub host: Option<String>,
    /// Optional bind port, forwarded as `--port`
    pub port: Option<u16>,
    /// Client identity for the handshake; crate default when unset
    pub client_info: Option<ClientInfo>,
}

impl From<&BridgePreferences> for StartOptions {
    fn from(prefs: &BridgePreferences) -> Self {
        Self {
            binary_path: prefs.binary_path.clone(),
            working_directory: prefs.working_directory.clone().map(PathBuf::from),
            host: Some(prefs.host.clone()),
            port: Some(prefs.port),
            client_info: None,
        }
    }
}

/// What `start` resolved, reported synchronously to the caller
#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    /// Agent-advertised user agent string from the initialize response
    pub user_agent: Option<String>,
    /// The binary path that was actually spawned
    pub binary_path: String,
    /// The working directory the process runs in, if any
    pub working_directory: Option<String>,
}

/// Tunables for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Deadline for the initialize response
    pub handshake_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop
    pub stop_grace_period: Duration,
    /// Event bus buffer capacity
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            stop_grace_period: Duration::from_secs(5),
            event_capacity: crate::bridge::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// One live process instance's plumbing
struct Session {
    process: ChildProcessManager,
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingCalls,
    io_task: JoinHandle<()>,
}

/// Flushes pending calls and publishes the exit event when the wait task
/// detects process termination
struct ExitRelay {
    pending: PendingCalls,
    status: Arc<StdMutex<ServerStatus>>,
    events: EventBus,
}

#[async_trait]
impl ProcessExitHandler for ExitRelay {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        info!(
            "Agent process exited (code: {:?}, signal: {:?})",
            event.code, event.signal
        );

        self.pending.flush_all(FlushReason::Disconnected).await;

        {
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            let mut status = self.status.lock().unwrap();
            // A failed start already recorded Error; keep that verdict
            if matches!(status.state, ServerState::Starting | ServerState::Ready) {
                status.state = ServerState::Stopped;
            }
            status.pid = None;
            status.last_message = Some(match (event.code, event.signal) {
                (Some(code), _) => format!("agent exited with code {code}"),
                (None, Some(signal)) => format!("agent killed by signal {signal}"),
                (None, None) => "agent exited".to_string(),
            });
        }

        self.events.publish(ServerEvent::Exit {
            code: event.code,
            signal: event.signal,
        });
    }
}

/// Supervises one agent app-server process and bridges its JSON-RPC traffic
pub struct Supervisor {
    config: SupervisorConfig,
    status: Arc<StdMutex<ServerStatus>>,
    events: EventBus,
    session: Mutex<Option<Session>>,
}

impl Supervisor {
    /// Create a supervisor with default tunables
    pub fn new() -> Self {
        Self::with_config(SupervisorConfig::default())
    }

    /// Create a supervisor with explicit tunables
    pub fn with_config(config: SupervisorConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            status: Arc::new(StdMutex::new(ServerStatus::default())),
            events,
            session: Mutex::new(None),
        }
    }

    /// Point-in-time status snapshot, no side effects
    pub fn status(&self) -> ServerStatus {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.status.lock().unwrap().clone()
    }

    /// Subscribe to the server event stream
    ///
    /// Events produced before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn current_state(&self) -> ServerState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.status.lock().unwrap().state
    }

    fn update_status(&self, update: impl FnOnce(&mut ServerStatus)) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut status = self.status.lock().unwrap();
        update(&mut status);
    }

    /// Start the agent app-server and complete the handshake
    ///
    /// Spawns `<binary> app-server [--host H] [--port P]`, wires the event
    /// plumbing, and drives initialize/initialized. On success status is
    /// `Ready`; on any failure the process is torn down and status records
    /// `Error` - a partial handshake is never left running.
    pub async fn start(&self, options: StartOptions) -> Result<StartResult, BridgeError> {
        let mut guard = self.session.lock().await;

        if matches!(
            self.current_state(),
            ServerState::Starting | ServerState::Ready
        ) {
            return Err(BridgeError::AlreadyRunning);
        }

        // Drop plumbing left over from a crashed instance
        if let Some(stale) = guard.take() {
            stale.io_task.abort();
        }

        let binary_path = options.binary_path.trim().to_string();
        if binary_path.is_empty() {
            return Err(BridgeError::spawn("no agent binary path configured"));
        }

        let working_directory = Self::resolve_working_directory(
            &binary_path,
            options.working_directory.as_deref(),
        )?;

        let mut args = vec!["app-server".to_string()];
        if let Some(host) = &options.host {
            args.push("--host".to_string());
            args.push(host.clone());
        }
        if let Some(port) = options.port {
            args.push("--port".to_string());
            args.push(port.to_string());
        }

        info!("Starting agent app-server: {} {:?}", binary_path, args);

        // Fresh instance: a new monotonic status arc begins here
        self.update_status(|status| {
            *status = ServerStatus {
                state: ServerState::Starting,
                pid: None,
                host: options.host.clone(),
                port: options.port,
                last_message: None,
                started_at: Some(Utc::now()),
            };
        });

        let pending = PendingCalls::new();

        let mut process =
            ChildProcessManager::new(binary_path.clone(), args, working_directory.clone())
                .with_stop_grace_period(self.config.stop_grace_period);

        let stderr_events = self.events.clone();
        process.on_stderr_line(move |line| {
            stderr_events.publish(ServerEvent::Stderr { line });
        });

        process.on_exit(Arc::new(ExitRelay {
            pending: pending.clone(),
            status: Arc::clone(&self.status),
            events: self.events.clone(),
        }));

        if let Err(e) = process.start().await {
            let error = match e {
                ProcessError::Spawn(source) => BridgeError::spawn(source.to_string()),
                other => BridgeError::from(other),
            };
            self.update_status(|status| {
                status.state = ServerState::Error;
                status.last_message = Some(error.to_string());
            });
            return Err(error);
        }

        self.update_status(|status| {
            status.pid = process.get_state().pid();
        });

        let transport = process.create_stdio_transport()?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let io_task = Self::spawn_io_loop(transport, outbound_rx, pending.clone(), &self.events);

        let client = options.client_info.unwrap_or_default();
        let mut handshake =
            HandshakeController::new().with_timeout(self.config.handshake_timeout);

        match handshake.run(&outbound, &pending, &client).await {
            Ok(user_agent) => {
                self.update_status(|status| {
                    status.state = ServerState::Ready;
                    status.last_message = Some("agent app-server ready".to_string());
                });

                *guard = Some(Session {
                    process,
                    outbound,
                    pending,
                    io_task,
                });

                Ok(StartResult {
                    user_agent,
                    binary_path,
                    working_directory: working_directory
                        .map(|dir| dir.to_string_lossy().into_owned()),
                })
            }
            Err(e) => {
                let error = BridgeError::handshake(e.to_string());
                // Record the verdict before teardown so the exit relay
                // does not overwrite it with Stopped
                self.update_status(|status| {
                    status.state = ServerState::Error;
                    status.last_message = Some(error.to_string());
                });

                if let Err(stop_err) = process.stop(StopMode::Force).await {
                    debug!("Teardown after failed handshake: {}", stop_err);
                }
                io_task.abort();
                pending.flush_all(FlushReason::Cancelled).await;

                Err(error)
            }
        }
    }

    /// Stop the agent app-server
    ///
    /// Idempotent: a no-op when nothing is running. Sends SIGTERM, waits up
    /// to the grace period, SIGKILLs on timeout. Every in-flight call fails
    /// with `Cancelled` and status always ends `Stopped`.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let mut guard = self.session.lock().await;
        let Some(mut session) = guard.take() else {
            debug!("stop() with no active session is a no-op");
            return Ok(());
        };

        info!("Stopping agent app-server");

        // Fail callers first so nobody waits out the grace period
        session.pending.flush_all(FlushReason::Cancelled).await;

        self.update_status(|status| {
            status.state = ServerState::Stopped;
            status.pid = None;
            status.last_message = Some("agent app-server stopped".to_string());
        });

        let result = session.process.stop(StopMode::Graceful).await;
        session.io_task.abort();

        match result {
            Ok(()) => Ok(()),
            // The process already exited on its own; stop stays idempotent
            Err(ProcessError::NotStarted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Send a JSON-RPC message to the agent
    ///
    /// With an id, registers a pending call and waits (without deadline)
    /// until the matching response arrives, the call is cancelled, or the
    /// process exits. Without an id the frame is fire-and-forget and `None`
    /// comes back immediately.
    pub async fn send(
        &self,
        request: JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, BridgeError> {
        self.send_with_deadline(request, None).await
    }

    /// Like [`send`](Self::send), but gives up after `deadline` with
    /// [`BridgeError::Timeout`]. The request may still reach the agent; the
    /// caller only stops waiting for its response.
    pub async fn send_with_deadline(
        &self,
        request: JsonRpcRequest,
        deadline: Option<Duration>,
    ) -> Result<Option<JsonRpcResponse>, BridgeError> {
        if request.method.is_empty() {
            return Err(CodecError::EmptyMethod.into());
        }

        let (outbound, pending) = {
            let guard = self.session.lock().await;
            if self.current_state() != ServerState::Ready {
                return Err(BridgeError::NotReady);
            }
            let session = guard.as_ref().ok_or(BridgeError::NotReady)?;
            (session.outbound.clone(), session.pending.clone())
        };

        let frame = encode_frame(&request)?;

        let Some(id) = request.id.clone() else {
            log_rpc_frame!(Level::DEBUG, "outgoing", frame);
            outbound.send(frame).map_err(|_| BridgeError::Disconnected)?;
            return Ok(None);
        };

        let receiver = pending.register(id.clone()).await?;

        log_rpc_frame!(Level::DEBUG, "outgoing", frame);
        if outbound.send(frame).is_err() {
            pending.abandon(&id).await;
            return Err(BridgeError::Disconnected);
        }

        let outcome = match deadline {
            None => receiver.await,
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    pending.abandon(&id).await;
                    return Err(BridgeError::Timeout);
                }
            },
        };

        match outcome {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(reason)) => Err(reason.into()),
            // The session plumbing was dropped out from under the call
            Err(_) => Err(BridgeError::Disconnected),
        }
    }

    /// Working directory rules: an explicit directory must exist; otherwise
    /// fall back to the binary's own directory when it has one
    fn resolve_working_directory(
        binary_path: &str,
        explicit: Option<&Path>,
    ) -> Result<Option<PathBuf>, BridgeError> {
        if let Some(dir) = explicit {
            if !dir.is_dir() {
                return Err(BridgeError::InvalidWorkingDirectory {
                    path: dir.to_string_lossy().into_owned(),
                });
            }
            return Ok(Some(dir.to_path_buf()));
        }

        Ok(Path::new(binary_path)
            .parent()
            .filter(|parent| parent.is_dir())
            .map(Path::to_path_buf))
    }

    /// The session I/O loop: one task owns the transport, draining outbound
    /// frames and decoding inbound ones
    ///
    /// Responses resolve pending calls; strays and server-initiated
    /// requests/notifications go to the event bus; malformed frames are
    /// logged and dropped without ending the session.
    fn spawn_io_loop(
        mut transport: StdioTransport,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        pending: PendingCalls,
        events: &EventBus,
    ) -> JoinHandle<()> {
        let events = events.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_frame = outbound_rx.recv() => {
                        let Some(frame) = maybe_frame else {
                            debug!("Outbound channel closed, ending session I/O loop");
                            break;
                        };
                        if let Err(e) = transport.send(&frame).await {
                            warn!("Failed to write frame to agent: {}", e);
                            break;
                        }
                    }
                    inbound = transport.receive() => {
                        match inbound {
                            Ok(frame) => {
                                log_rpc_frame!(Level::DEBUG, "incoming", frame);
                                Self::process_inbound_frame(&frame, &pending, &events).await;
                            }
                            Err(e) => {
                                debug!("Agent output stream closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            debug!("Session I/O loop finished");
        })
    }

    async fn process_inbound_frame(frame: &str, pending: &PendingCalls, events: &EventBus) {
        match decode_frame(frame) {
            Ok(IncomingFrame::Response(response)) => {
                if let Some(stray) = pending.resolve(response).await {
                    // Some agents push unsolicited result-shaped messages;
                    // surface them instead of discarding
                    events.publish(ServerEvent::Rpc {
                        message: serde_json::to_value(&stray).unwrap_or_default(),
                    });
                }
            }
            Ok(message @ IncomingFrame::Request(_)) => {
                events.publish(ServerEvent::Rpc {
                    message: message.to_value(),
                });
            }
            Ok(IncomingFrame::Uncorrelated(message)) => {
                events.publish(ServerEvent::Rpc { message });
            }
            Err(e) => {
                warn!("Dropping malformed frame: {} | frame: {}", e, frame);
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Force cleanup fallback when the supervisor is dropped mid-session
impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.session.try_lock() {
            if let Some(session) = guard.as_mut() {
                if session.process.is_running() {
                    warn!("Supervisor dropped with a running agent - force killing");
                    session.process.kill_sync();
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
