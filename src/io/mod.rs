//! I/O layer - process management and frame transport
//!
//! Generic abstractions with no knowledge of JSON-RPC:
//!
//! - **Transport**: bidirectional newline-delimited frame exchange
//! - **Process**: agent process lifecycle, stderr monitoring, exit detection

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{MockTransport, StdioTransport, Transport};
