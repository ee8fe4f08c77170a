//! Correlation table for in-flight requests
//!
//! Maps outstanding request ids to the callers awaiting their responses.
//! Entries are resolved exactly once: by a matching response, by an explicit
//! flush on stop/disconnect, or by the caller abandoning the wait.

use crate::rpc::codec::{JsonRpcResponse, RpcId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

/// Why pending calls were flushed without a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The supervisor was stopped while the call was in flight
    Cancelled,
    /// The agent process exited while the call was in flight
    Disconnected,
}

/// Outcome delivered to a waiting caller
pub type CallOutcome = Result<JsonRpcResponse, FlushReason>;

/// Error returned when a caller reuses an id that is still in flight
#[derive(Debug, thiserror::Error)]
#[error("request id {0} is already in flight")]
pub struct DuplicateId(pub RpcId);

/// One in-flight request
struct PendingCall {
    submitted_at: Instant,
    waiter: oneshot::Sender<CallOutcome>,
}

/// Table of in-flight requests, keyed by id
///
/// Shared between the caller path (`register`, abandon) and the read loop
/// (`resolve`, `flush_all`); a single lock serializes both.
#[derive(Clone, Default)]
pub struct PendingCalls {
    inner: Arc<Mutex<HashMap<RpcId, PendingCall>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request and get the receiver its outcome will
    /// arrive on
    ///
    /// Fails if the id already has an outstanding call - ids must be
    /// caller-unique while in flight.
    pub async fn register(&self, id: RpcId) -> Result<oneshot::Receiver<CallOutcome>, DuplicateId> {
        let mut pending = self.inner.lock().await;
        if pending.contains_key(&id) {
            return Err(DuplicateId(id));
        }

        let (waiter, receiver) = oneshot::channel();
        pending.insert(
            id,
            PendingCall {
                submitted_at: Instant::now(),
                waiter,
            },
        );
        Ok(receiver)
    }

    /// Complete the call matching the response's id
    ///
    /// Returns the response back when no call matches (a stray), so the
    /// caller can surface it instead of silently discarding it.
    pub async fn resolve(&self, response: JsonRpcResponse) -> Option<JsonRpcResponse> {
        let entry = {
            let mut pending = self.inner.lock().await;
            pending.remove(&response.id)
        };

        match entry {
            Some(call) => {
                debug!(
                    "Resolved request {} after {:?}",
                    response.id,
                    call.submitted_at.elapsed()
                );
                if let Err(outcome) = call.waiter.send(Ok(response)) {
                    // The caller gave up (timeout or dropped future); nothing
                    // left to do with the response
                    if let Ok(response) = outcome {
                        debug!("Waiter for request {} is gone", response.id);
                    }
                }
                None
            }
            None => {
                warn!("Received response for unknown request {}", response.id);
                Some(response)
            }
        }
    }

    /// Drop the entry for an abandoned call (e.g. a per-call timeout)
    pub async fn abandon(&self, id: &RpcId) {
        let mut pending = self.inner.lock().await;
        if pending.remove(id).is_some() {
            debug!("Abandoned pending request {}", id);
        }
    }

    /// Complete every pending call with the given reason
    ///
    /// Invoked on stop and on process exit so no caller is left waiting.
    pub async fn flush_all(&self, reason: FlushReason) {
        let drained: Vec<(RpcId, PendingCall)> = {
            let mut pending = self.inner.lock().await;
            pending.drain().collect()
        };

        for (id, call) in drained {
            debug!(
                "Flushing pending request {} ({:?}) after {:?}",
                id,
                reason,
                call.submitted_at.elapsed()
            );
            let _ = call.waiter.send(Err(reason));
        }
    }

    /// Number of calls currently in flight
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether no calls are in flight
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
