//! JSON-RPC protocol layer
//!
//! - **Codec**: wire types and frame encode/decode
//! - **Pending**: correlation of responses back to waiting callers

pub mod codec;
pub mod pending;

pub use codec::{
    CodecError, IncomingFrame, JSONRPC_VERSION, JsonRpcErrorObject, JsonRpcRequest,
    JsonRpcResponse, RpcId, decode_frame, encode_frame,
};
pub use pending::{CallOutcome, DuplicateId, FlushReason, PendingCalls};
