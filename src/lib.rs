//! Supervisor and JSON-RPC bridge for a long-lived agent app-server process.
//!
//! Spawns `<binary> app-server` as a child, speaks newline-delimited JSON-RPC
//! 2.0 over its stdio, correlates requests with responses by id, and surfaces
//! everything else (server-initiated traffic, stderr, process exit) as a
//! typed event stream.
//!
//! The entry point is [`Supervisor`]:
//!
//! ```no_run
//! use agent_bridge::{JsonRpcRequest, StartOptions, Supervisor};
//!
//! # async fn example() -> Result<(), agent_bridge::BridgeError> {
//! let supervisor = Supervisor::new();
//! let mut events = supervisor.subscribe();
//!
//! supervisor
//!     .start(StartOptions {
//!         binary_path: "/usr/local/bin/agent".to_string(),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! let response = supervisor
//!     .send(JsonRpcRequest::new(1i64, "model/list", None))
//!     .await?;
//!
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod io;
pub mod logging;
pub mod preferences;
pub mod rpc;

pub use bridge::{
    BridgeError, ClientInfo, EventBus, ServerEvent, ServerState, ServerStatus, StartOptions,
    StartResult, Supervisor, SupervisorConfig,
};
pub use preferences::{BridgePreferences, FilePreferencesStore, PreferencesStore};
pub use rpc::codec::{JsonRpcErrorObject, JsonRpcRequest, JsonRpcResponse, RpcId};
