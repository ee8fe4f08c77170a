//! Frame transport over the agent process's stdio
//!
//! Pure I/O layer: moves newline-delimited frames in and out of the child
//! process without knowing anything about JSON-RPC or process lifecycle.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Core transport trait for bidirectional frame exchange
///
/// One frame is one complete serialized message. Framing on the wire
/// (a trailing newline for the stdio implementation) is the transport's
/// business; callers hand over and receive bare payloads.
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send one frame
    async fn send(&mut self, frame: &str) -> Result<(), Self::Error>;

    /// Receive one frame
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over a child process's stdin/stdout pipes
///
/// Writes go through a single writer task, so concurrent senders can never
/// interleave partial frames. Reads come from a dedicated loop that splits
/// the stream on newlines.
pub struct StdioTransport {
    /// Channel feeding the stdin writer task
    stdin_sender: Option<mpsc::UnboundedSender<String>>,

    /// Channel fed by the stdout reader task
    stdout_receiver: Option<mpsc::UnboundedReceiver<String>>,

    /// Connection status
    connected: bool,
}

impl StdioTransport {
    /// Create a new StdioTransport from child process streams
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::stdin_writer_task(stdin, stdin_receiver));
        tokio::spawn(Self::stdout_reader_task(stdout, stdout_sender));

        Self {
            stdin_sender: Some(stdin_sender),
            stdout_receiver: Some(stdout_receiver),
            connected: true,
        }
    }

    /// Background task that writes frames to stdin in submission order
    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(frame) = receiver.recv().await {
            trace!("StdioTransport: writing frame: {}", frame);

            if let Err(e) = stdin.write_all(frame.as_bytes()).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }

            if let Err(e) = stdin.write_all(b"\n").await {
                error!("Failed to write frame delimiter: {}", e);
                break;
            }

            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }

        trace!("StdioTransport: stdin writer task finished");
    }

    /// Background task that reads newline-delimited frames from stdout
    async fn stdout_reader_task(stdout: ChildStdout, sender: mpsc::UnboundedSender<String>) {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    trace!("StdioTransport: stdout reader reached EOF");
                    break;
                }
                Ok(_) => {
                    let frame = line.trim_end_matches(['\r', '\n']).to_string();
                    if frame.trim().is_empty() {
                        continue;
                    }

                    trace!("StdioTransport: read frame: {}", frame);

                    if sender.send(frame).is_err() {
                        trace!("StdioTransport: frame receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: stdout reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, frame: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let sender = self
            .stdin_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?;

        sender
            .send(frame.to_string())
            .map_err(|e| StdioTransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let receiver = self
            .stdout_receiver
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?;

        receiver
            .recv()
            .await
            .ok_or(StdioTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.stdin_sender.take();
        self.stdout_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
    #[error("No more frames available")]
    NoMoreFrames,
}

/// Mock transport for testing - records sent frames, replays scripted ones
pub struct MockTransport {
    /// Frames that were sent via this transport
    sent_frames: Arc<Mutex<Vec<String>>>,

    /// Predefined frames to return when receive() is called
    scripted_frames: Arc<Mutex<VecDeque<String>>>,

    /// Connection status
    connected: bool,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            sent_frames: Arc::new(Mutex::new(Vec::new())),
            scripted_frames: Arc::new(Mutex::new(VecDeque::new())),
            connected: true,
        }
    }

    /// Create a mock transport with predefined inbound frames
    pub fn with_frames(frames: Vec<String>) -> Self {
        let transport = Self::new();
        {
            let mut queue = transport.scripted_frames.lock().unwrap();
            queue.extend(frames);
        }
        transport
    }

    /// Queue a frame for the next receive() call
    pub fn push_frame(&mut self, frame: String) {
        let mut frames = self.scripted_frames.lock().unwrap();
        frames.push_back(frame);
    }

    /// Get all frames that were sent via this transport
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent_frames.lock().unwrap().clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, frame: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.sent_frames.lock().unwrap().push(frame.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        let mut frames = self.scripted_frames.lock().unwrap();
        frames.pop_front().ok_or(MockTransportError::NoMoreFrames)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_stdio_transport_reads_frames() {
        // Spawn a process that emits two frames on stdout
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("printf 'first\\nsecond\\n'")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sh");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StdioTransport::new(stdin, stdout);

        assert_eq!(transport.receive().await.unwrap(), "first");
        assert_eq!(transport.receive().await.unwrap(), "second");
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_stdio_transport_round_trip() {
        // cat echoes stdin back, so sent frames come back delimited
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StdioTransport::new(stdin, stdout);

        transport.send("{\"method\":\"ping\"}").await.unwrap();
        transport.send("{\"method\":\"pong\"}").await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), "{\"method\":\"ping\"}");
        assert_eq!(transport.receive().await.unwrap(), "{\"method\":\"pong\"}");

        transport.close().await.unwrap();
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_mock_transport_send_receive() {
        let mut transport =
            MockTransport::with_frames(vec!["frame1".to_string(), "frame2".to_string()]);

        transport.send("out1").await.unwrap();
        transport.send("out2").await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), "frame1");
        assert_eq!(transport.receive().await.unwrap(), "frame2");

        assert_eq!(transport.sent_frames(), vec!["out1", "out2"]);

        // Scripted frames exhausted
        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_transport_disconnect() {
        let mut transport = MockTransport::new();

        assert!(transport.is_connected());

        transport.close().await.unwrap();

        assert!(!transport.is_connected());
        assert!(transport.send("test").await.is_err());
        assert!(transport.receive().await.is_err());
    }
}
