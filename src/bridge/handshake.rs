//! Initialize/initialized handshake
//!
//! Drives the mandatory negotiation that must complete before any other
//! traffic: send `initialize` with the caller's identity, await its response,
//! then send the `initialized` notification. Single path, no branch back;
//! any failure leaves the phase short of `Ready` and the caller tears the
//! process down - partial handshakes are never left running.

use crate::rpc::codec::{JsonRpcRequest, RpcId, encode_frame};
use crate::rpc::pending::{FlushReason, PendingCalls};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Fixed id for the initialize request
///
/// The correlation table is empty when the handshake runs, so a constant id
/// is safe; caller ids only need to be unique while in flight.
pub const HANDSHAKE_ID: i64 = 0;

/// Default deadline for the initialize response
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The caller's identity, sent with `initialize`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "agent-bridge".to_string(),
            title: "Agent Bridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Handshake progression; one-way, no re-entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    NotStarted,
    InitializeSent,
    Initialized,
    Ready,
}

/// Errors aborting the handshake
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake already ran (phase: {0:?})")]
    AlreadyRan(HandshakePhase),

    #[error("failed to write handshake frame: outbound channel closed")]
    SendFailed,

    #[error("no response to initialize within {0:?}")]
    Timeout(Duration),

    #[error("agent rejected initialize ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("agent exited during handshake")]
    Disconnected,
}

/// Drives one initialize/initialized exchange over an open session
pub struct HandshakeController {
    phase: HandshakePhase,
    timeout: Duration,
}

impl HandshakeController {
    pub fn new() -> Self {
        Self {
            phase: HandshakePhase::NotStarted,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current phase
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Run the handshake to completion
    ///
    /// On success the phase is `Ready` and the agent's advertised user agent
    /// string (if any) is returned. On failure the phase records how far the
    /// exchange got; the session must not be used.
    pub async fn run(
        &mut self,
        outbound: &mpsc::UnboundedSender<String>,
        pending: &PendingCalls,
        client: &ClientInfo,
    ) -> Result<Option<String>, HandshakeError> {
        if self.phase != HandshakePhase::NotStarted {
            return Err(HandshakeError::AlreadyRan(self.phase));
        }

        let id = RpcId::Number(HANDSHAKE_ID);
        let receiver = pending
            .register(id.clone())
            .await
            .map_err(|_| HandshakeError::AlreadyRan(self.phase))?;

        let initialize = JsonRpcRequest::new(
            HANDSHAKE_ID,
            "initialize",
            Some(json!({
                "clientInfo": {
                    "name": client.name,
                    "title": client.title,
                    "version": client.version,
                }
            })),
        );

        // Serialization of a request we just built cannot fail
        let frame = encode_frame(&initialize).map_err(|_| HandshakeError::SendFailed)?;
        debug!("Sending initialize request");
        outbound
            .send(frame)
            .map_err(|_| HandshakeError::SendFailed)?;
        self.phase = HandshakePhase::InitializeSent;

        let response = match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(FlushReason::Disconnected))) | Ok(Ok(Err(FlushReason::Cancelled))) => {
                return Err(HandshakeError::Disconnected);
            }
            Ok(Err(_)) => return Err(HandshakeError::Disconnected),
            Err(_) => {
                pending.abandon(&id).await;
                return Err(HandshakeError::Timeout(self.timeout));
            }
        };

        if let Some(error) = response.error {
            return Err(HandshakeError::Rejected {
                code: error.code,
                message: error.message,
            });
        }
        self.phase = HandshakePhase::Initialized;

        let user_agent = response
            .result
            .as_ref()
            .and_then(|result| result.get("userAgent"))
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());

        let initialized = JsonRpcRequest::notification("initialized", Some(json!({})));
        let frame = encode_frame(&initialized).map_err(|_| HandshakeError::SendFailed)?;
        debug!("Sending initialized notification");
        outbound
            .send(frame)
            .map_err(|_| HandshakeError::SendFailed)?;

        self.phase = HandshakePhase::Ready;
        info!("Handshake complete (user agent: {:?})", user_agent);

        Ok(user_agent)
    }
}

impl Default for HandshakeController {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::JsonRpcResponse;

    fn session() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
        PendingCalls,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, receiver, PendingCalls::new())
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let (outbound, mut wire, pending) = session();
        let mut controller = HandshakeController::new();
        assert_eq!(controller.phase(), HandshakePhase::NotStarted);

        let pending_clone = pending.clone();
        let handshake = tokio::spawn(async move {
            controller
                .run(&outbound, &pending_clone, &ClientInfo::default())
                .await
                .map(|ua| (ua, controller.phase()))
        });

        // The initialize request goes out first, carrying clientInfo
        let frame = wire.recv().await.unwrap();
        assert!(frame.contains("\"method\":\"initialize\""));
        assert!(frame.contains("\"clientInfo\""));
        assert!(frame.contains("\"id\":0"));

        // Answer it the way the agent would
        let response = JsonRpcResponse::success(
            RpcId::Number(HANDSHAKE_ID),
            serde_json::json!({"userAgent": "agent/2.1"}),
        );
        pending.resolve(response).await;

        // The initialized notification follows, with no id
        let frame = wire.recv().await.unwrap();
        assert!(frame.contains("\"method\":\"initialized\""));
        assert!(!frame.contains("\"id\""));

        let (user_agent, phase) = handshake.await.unwrap().unwrap();
        assert_eq!(user_agent.as_deref(), Some("agent/2.1"));
        assert_eq!(phase, HandshakePhase::Ready);
    }

    #[tokio::test]
    async fn test_error_response_aborts_handshake() {
        let (outbound, mut wire, pending) = session();
        let mut controller = HandshakeController::new();

        let pending_clone = pending.clone();
        let handshake = tokio::spawn(async move {
            let result = controller
                .run(&outbound, &pending_clone, &ClientInfo::default())
                .await;
            (result, controller.phase())
        });

        let _ = wire.recv().await.unwrap();

        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: RpcId::Number(HANDSHAKE_ID),
            result: None,
            error: Some(crate::rpc::codec::JsonRpcErrorObject {
                code: -32600,
                message: "unsupported client".to_string(),
                data: None,
            }),
        };
        pending.resolve(response).await;

        let (result, phase) = handshake.await.unwrap();
        assert!(matches!(
            result,
            Err(HandshakeError::Rejected { code: -32600, .. })
        ));
        // Never reached Initialized, and no initialized notification was sent
        assert_eq!(phase, HandshakePhase::InitializeSent);
        assert!(wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handshake_timeout_abandons_pending_call() {
        let (outbound, _wire, pending) = session();
        let mut controller = HandshakeController::new().with_timeout(Duration::from_millis(50));

        let result = controller
            .run(&outbound, &pending, &ClientInfo::default())
            .await;

        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake() {
        let (outbound, mut wire, pending) = session();
        let mut controller = HandshakeController::new();

        let pending_clone = pending.clone();
        let handshake = tokio::spawn(async move {
            controller
                .run(&outbound, &pending_clone, &ClientInfo::default())
                .await
        });

        let _ = wire.recv().await.unwrap();
        pending.flush_all(FlushReason::Disconnected).await;

        assert!(matches!(
            handshake.await.unwrap(),
            Err(HandshakeError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_handshake_runs_once() {
        let (outbound, mut wire, pending) = session();
        let mut controller = HandshakeController::new();

        let pending_clone = pending.clone();
        let resolver = tokio::spawn(async move {
            let _ = wire.recv().await;
            pending_clone
                .resolve(JsonRpcResponse::success(
                    RpcId::Number(HANDSHAKE_ID),
                    serde_json::json!({}),
                ))
                .await;
            // Hand the receiver back so the outbound channel stays open for
            // the initialized notification
            wire
        });

        controller
            .run(&outbound, &pending, &ClientInfo::default())
            .await
            .unwrap();
        let _wire = resolver.await.unwrap();

        let result = controller
            .run(&outbound, &pending, &ClientInfo::default())
            .await;
        assert!(matches!(result, Err(HandshakeError::AlreadyRan(_))));
    }
}
