//! Agent process lifecycle management
//!
//! Handles spawning and stopping the agent binary, stderr monitoring, and
//! exit detection, completely separate from transport concerns.

use crate::io::transport::{StdioTransport, Transport};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

/// Polling interval while waiting out the stop grace period
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Try graceful shutdown first (SIGTERM), force kill after the grace period
    Graceful,
    /// Force kill immediately (SIGKILL)
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has been stopped (either gracefully or forcefully)
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Final exit information, fired exactly once when the process terminates
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal number, if the process was killed (unix only)
    pub signal: Option<i32>,
}

/// Trait for handling process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    /// Called once when the process exits, with the final code/signal
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from the agent process
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// The handler will be called for each line received from stderr.
    /// Only one handler can be active at a time - installing a new handler
    /// will replace the previous one.
    ///
    /// Note: Monitoring starts automatically when the process starts. Stderr
    /// is always drained even without a handler so the child cannot block.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing the agent process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the agent process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the agent process
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Create a stdio transport for communicating with the process
    /// This consumes the stdin/stdout from the process
    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error>;

    /// Synchronous force kill for Drop trait implementations
    ///
    /// Skips async transport cleanup and directly kills the process.
    fn kill_sync(&mut self);
}

/// Manages the agent child process spawned via Command
pub struct ChildProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Working directory for the process (optional)
    working_directory: Option<PathBuf>,

    /// Grace period between SIGTERM and SIGKILL on graceful stop
    stop_grace_period: Duration,

    /// Thread-safe process state
    state: Arc<Mutex<ProcessState>>,

    /// Stdio transport (created when process starts)
    stdio_transport: Option<StdioTransport>,

    /// Stderr handler
    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,

    /// Stderr monitoring task handle
    stderr_task: Option<JoinHandle<()>>,

    /// Process wait task handle (waits for child to exit)
    wait_task: Option<JoinHandle<()>>,

    /// Process exit event handler
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `command` - The binary to execute
    /// * `args` - Command line arguments
    /// * `working_dir` - Optional working directory for the process
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            args,
            working_directory: working_dir,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            wait_task: None,
            exit_handler: None,
        }
    }

    /// Override the graceful-stop grace period
    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Install a handler for the process exit event
    pub fn on_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    /// Get current process state (thread-safe)
    pub fn get_state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Spawn the stderr monitoring task with a provided stderr pipe
    ///
    /// Always drains stderr to prevent the child process from blocking.
    /// If a handler is installed, lines are forwarded to it.
    fn spawn_stderr_monitor_with_pipe(&mut self, stderr: tokio::process::ChildStderr) {
        if self.stderr_task.is_some() {
            return;
        }

        // Move handler into task (take ownership, no cloning needed)
        let handler = self.stderr_handler.take();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            trace!(
                "ChildProcessManager: Starting stderr monitoring (handler: {})",
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim_end_matches(['\r', '\n']).to_string();
                        if !line_content.is_empty() {
                            if let Some(ref handler) = handler {
                                trace!("ChildProcessManager: stderr line: {}", line_content);
                                handler(line_content);
                            } else {
                                trace!("ChildProcessManager: stderr drained: {}", line_content);
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }

            trace!("ChildProcessManager: stderr monitoring finished");
        });

        self.stderr_task = Some(task);
    }

    /// Spawn the wait task that detects child process exit exactly once
    fn spawn_wait_task(&mut self, mut child: Child) {
        let current_pid = self.get_state().pid();
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            trace!(
                "ChildProcessManager: Starting wait task for PID {:?}",
                current_pid
            );

            let event = match child.wait().await {
                Ok(exit_status) => {
                    info!(
                        "Process PID {:?} exited with status: {}",
                        current_pid, exit_status
                    );

                    #[cfg(unix)]
                    let signal = {
                        use std::os::unix::process::ExitStatusExt;
                        exit_status.signal()
                    };
                    #[cfg(not(unix))]
                    let signal = None;

                    ProcessExitEvent {
                        code: exit_status.code(),
                        signal,
                    }
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    ProcessExitEvent {
                        code: None,
                        signal: None,
                    }
                }
            };

            // Transition state to Stopped before notifying, so handlers
            // observe a consistent view
            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }

            if let Some(handler) = &exit_handler {
                handler.on_process_exit(event).await;
            }

            trace!(
                "ChildProcessManager: Wait task finished for PID {:?}",
                current_pid
            );
        });

        self.wait_task = Some(task);
    }

    /// Send a signal to the process (unix)
    #[cfg(unix)]
    fn send_signal(pid: u32, signal: libc::c_int) {
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn().map_err(ProcessError::Spawn)?;

        let pid = child.id();
        info!("Process started with PID: {:?}", pid);

        if let Some(pid) = pid {
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            *self.state.lock().unwrap() = ProcessState::Running { pid };
        } else {
            return Err(ProcessError::Io(std::io::Error::other(
                "Failed to get process ID",
            )));
        }

        // Extract stdio streams before moving the child into the wait task
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio_transport = Some(StdioTransport::new(stdin, stdout));

        self.spawn_stderr_monitor_with_pipe(stderr);
        self.spawn_wait_task(child);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => info!("Gracefully stopping process with PID: {}", pid),
            StopMode::Force => info!("Force killing process with PID: {}", pid),
        }

        // Close stdio transport first; for stdio-driven servers a closed stdin
        // is itself a shutdown request
        if let Some(mut transport) = self.stdio_transport.take() {
            let _ = transport.close().await;
        }

        #[cfg(unix)]
        {
            match mode {
                StopMode::Graceful => {
                    Self::send_signal(pid, libc::SIGTERM);
                    info!("Sent SIGTERM to process {}", pid);

                    // Wait out the grace period; the wait task flips the state
                    // to Stopped when the child actually exits
                    let deadline = tokio::time::Instant::now() + self.stop_grace_period;
                    while tokio::time::Instant::now() < deadline {
                        if !self.get_state().is_running() {
                            break;
                        }
                        tokio::time::sleep(STOP_POLL_INTERVAL).await;
                    }

                    if self.get_state().is_running() {
                        warn!(
                            "Process {} did not exit within {:?}, sending SIGKILL",
                            pid, self.stop_grace_period
                        );
                        Self::send_signal(pid, libc::SIGKILL);
                    }
                }
                StopMode::Force => {
                    Self::send_signal(pid, libc::SIGKILL);
                    info!("Sent SIGKILL to process {}", pid);
                }
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Non-unix process termination not fully implemented");
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        // Update state immediately for API consistency; the wait task also
        // updates it when it observes the actual exit
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Stopped;

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return, // Already stopped
        };

        info!("Synchronously force killing process with PID: {}", pid);

        #[cfg(unix)]
        {
            Self::send_signal(pid, libc::SIGKILL);
            info!("Sent SIGKILL to process {}", pid);
        }

        #[cfg(not(unix))]
        {
            warn!("Non-unix sync process kill not implemented - process may remain");
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Stopped;
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_child_process_manager_lifecycle() {
        let mut manager =
            ChildProcessManager::new("sleep".to_string(), vec!["5".to_string()], None);

        assert!(!manager.is_running());

        manager.start().await.unwrap();
        assert!(manager.is_running());

        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_stderr_monitoring() {
        let mut manager = ChildProcessManager::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                "echo 'error message' >&2; sleep 1".to_string(),
            ],
            None,
        );

        let stderr_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let stderr_lines_clone = Arc::clone(&stderr_lines);

        manager.on_stderr_line(move |line| {
            if let Ok(mut lines) = stderr_lines_clone.lock() {
                lines.push(line);
            }
        });

        manager.start().await.unwrap();

        // Wait a bit for stderr to be captured
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager.stop(StopMode::Graceful).await.unwrap();

        let lines = stderr_lines.lock().unwrap();
        assert!(!lines.is_empty());
        assert_eq!(lines[0], "error message");
    }

    struct ChannelExitHandler {
        sender: mpsc::UnboundedSender<ProcessExitEvent>,
    }

    #[async_trait]
    impl ProcessExitHandler for ChannelExitHandler {
        async fn on_process_exit(&self, event: ProcessExitEvent) {
            let _ = self.sender.send(event);
        }
    }

    #[tokio::test]
    async fn test_exit_event_carries_exit_code() {
        let mut manager = ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), "exit 7".to_string()],
            None,
        );

        let (sender, mut receiver) = mpsc::unbounded_channel();
        manager.on_exit(Arc::new(ChannelExitHandler { sender }));

        manager.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for exit event")
            .expect("exit event channel closed");

        assert_eq!(event.code, Some(7));
        assert_eq!(event.signal, None);
        assert!(!manager.is_running());

        // Exit is detected exactly once
        assert!(receiver.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_event_carries_signal_on_kill() {
        let mut manager =
            ChildProcessManager::new("sleep".to_string(), vec!["30".to_string()], None);

        let (sender, mut receiver) = mpsc::unbounded_channel();
        manager.on_exit(Arc::new(ChannelExitHandler { sender }));

        manager.start().await.unwrap();
        manager.stop(StopMode::Force).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for exit event")
            .expect("exit event channel closed");

        assert_eq!(event.code, None);
        assert_eq!(event.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_process_state_transitions() {
        let mut manager =
            ChildProcessManager::new("sleep".to_string(), vec!["5".to_string()], None);

        assert_eq!(manager.get_state(), ProcessState::NotStarted);
        assert!(!manager.is_running());

        manager.start().await.unwrap();
        let running_state = manager.get_state();
        assert!(matches!(running_state, ProcessState::Running { .. }));
        assert!(manager.is_running());

        manager.stop(StopMode::Graceful).await.unwrap();
        assert_eq!(manager.get_state(), ProcessState::Stopped);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_invalid_operations() {
        let mut manager =
            ChildProcessManager::new("sleep".to_string(), vec!["5".to_string()], None);

        // Cannot stop when not started
        let result = manager.stop(StopMode::Graceful).await;
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        manager.start().await.unwrap();

        // Cannot start when already running
        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::AlreadyStarted)));

        manager.stop(StopMode::Graceful).await.unwrap();

        // Stopping again just reports NotStarted
        let result = manager.stop(StopMode::Graceful).await;
        assert!(matches!(result, Err(ProcessError::NotStarted)));
    }

    #[tokio::test]
    async fn test_spawn_failure_for_missing_binary() {
        let mut manager = ChildProcessManager::new(
            "/nonexistent/path/to/agent-binary".to_string(),
            vec![],
            None,
        );

        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::Spawn(_))));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_create_transport_consumes_it() {
        let mut manager =
            ChildProcessManager::new("sleep".to_string(), vec!["5".to_string()], None);

        // Cannot create transport when not started
        let result = manager.create_stdio_transport();
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        manager.start().await.unwrap();

        let _transport = manager.create_stdio_transport().unwrap();

        // Transport is consumed, so second call fails
        let result = manager.create_stdio_transport();
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        manager.stop(StopMode::Force).await.unwrap();
    }

    #[test]
    fn test_process_state_methods() {
        let not_started = ProcessState::NotStarted;
        assert!(!not_started.is_running());
        assert!(not_started.pid().is_none());

        let running = ProcessState::Running { pid: 12345 };
        assert!(running.is_running());
        assert_eq!(running.pid(), Some(12345));

        let stopped = ProcessState::Stopped;
        assert!(!stopped.is_running());
        assert!(stopped.pid().is_none());
    }
}
