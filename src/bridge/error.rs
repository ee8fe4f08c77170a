//! Error types for the supervisor and bridge surface

use crate::io::process::ProcessError;
use crate::rpc::codec::{CodecError, RpcId};
use crate::rpc::pending::{DuplicateId, FlushReason};

/// Errors surfaced by the bridge API
///
/// Spawn and handshake failures are fatal to `start` and reported
/// synchronously; protocol anomalies are contained (logged, frame dropped);
/// process death fails the affected calls and forces a status transition.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The agent binary is missing, not executable, or otherwise unspawnable
    #[error("Failed to spawn agent binary: {reason}")]
    Spawn { reason: String },

    /// Initialize negotiation failed or timed out; the process was torn down
    #[error("Handshake failed: {reason}")]
    Handshake { reason: String },

    /// start() while a session is starting or ready
    #[error("Agent app-server is already running")]
    AlreadyRunning,

    /// send() while status is not ready
    #[error("Agent app-server is not ready")]
    NotReady,

    /// Request id reused while the previous call is still in flight
    #[error("Request id {0} is already in flight")]
    DuplicateId(RpcId),

    /// Malformed outbound message; nothing was sent
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// The process exited while the call was in flight
    #[error("Agent app-server disconnected")]
    Disconnected,

    /// Per-call deadline elapsed before a response arrived
    #[error("Request timed out")]
    Timeout,

    /// The call was cancelled by stop()
    #[error("Request cancelled")]
    Cancelled,

    /// The given working directory does not exist or is not a directory
    #[error("Invalid working directory: {path}")]
    InvalidWorkingDirectory { path: String },

    /// Process layer failure outside spawn
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

impl BridgeError {
    /// Spawn failure with context
    pub fn spawn(reason: impl Into<String>) -> Self {
        Self::Spawn {
            reason: reason.into(),
        }
    }

    /// Handshake failure with context
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }
}

impl From<DuplicateId> for BridgeError {
    fn from(err: DuplicateId) -> Self {
        Self::DuplicateId(err.0)
    }
}

impl From<FlushReason> for BridgeError {
    fn from(reason: FlushReason) -> Self {
        match reason {
            FlushReason::Cancelled => Self::Cancelled,
            FlushReason::Disconnected => Self::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_reason_conversion() {
        assert!(matches!(
            BridgeError::from(FlushReason::Cancelled),
            BridgeError::Cancelled
        ));
        assert!(matches!(
            BridgeError::from(FlushReason::Disconnected),
            BridgeError::Disconnected
        ));
    }

    #[test]
    fn test_duplicate_id_conversion() {
        let err: BridgeError = DuplicateId(RpcId::Number(4)).into();
        assert!(matches!(err, BridgeError::DuplicateId(RpcId::Number(4))));
    }
}
