//! Supervisor layer: lifecycle, handshake, events, and the public error type

pub mod error;
pub mod events;
pub mod handshake;
pub mod supervisor;

pub use error::BridgeError;
pub use events::{EventBus, ServerEvent};
pub use handshake::{ClientInfo, HandshakeController, HandshakePhase};
pub use supervisor::{
    ServerState, ServerStatus, StartOptions, StartResult, Supervisor, SupervisorConfig,
};
