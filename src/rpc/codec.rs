//! JSON-RPC 2.0 message codec
//!
//! Serializes and deserializes the frames exchanged with the agent process.
//! A frame is exactly one JSON document; malformed frames are reported as
//! errors for the caller to log and drop - they must never take the session
//! down.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

// ============================================================================
// Wire Types
// ============================================================================

/// Request/response identifier
///
/// The wire representation (string vs number) is preserved exactly, because
/// responses are correlated by the id's round-trip: a server answering `"1"`
/// to a request sent with `1` has not answered that request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{n}"),
            RpcId::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RpcId {
    fn from(value: i64) -> Self {
        RpcId::Number(value)
    }
}

impl From<&str> for RpcId {
    fn from(value: &str) -> Self {
        RpcId::Text(value.to_string())
    }
}

/// JSON-RPC 2.0 request message
///
/// A request without an id is a notification: no response is expected and
/// none is ever awaited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "default_version")]
    pub jsonrpc: String,

    /// Request identifier; absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request expecting a response
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Create a fire-and-forget notification
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Whether this request is a notification (no id, no response expected)
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response message
///
/// Exactly one of the `result`/`error` keys is present on the wire. A null
/// `result` is a legal success and decodes as `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "default_version")]
    pub jsonrpc: String,

    /// Request identifier (matches the request)
    pub id: RpcId,

    /// Result (present if successful)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    /// Build a success response
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Whether the response carries an error object
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i64,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ============================================================================
// Codec
// ============================================================================

/// Codec errors for malformed frames
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame is neither a request nor a response")]
    UnknownShape,

    #[error("Request method must be a non-empty string")]
    EmptyMethod,

    #[error("Response must carry exactly one of result/error")]
    AmbiguousResponse,
}

/// A decoded inbound frame
#[derive(Debug, Clone)]
pub enum IncomingFrame {
    /// A response to some request, pending or not
    Response(JsonRpcResponse),
    /// A server-initiated request or notification
    Request(JsonRpcRequest),
    /// An outcome-carrying message whose id shape (null, fractional, out of
    /// range) can never match a registered call
    Uncorrelated(Value),
}

impl IncomingFrame {
    /// The frame as a raw JSON value, for event emission
    pub fn to_value(&self) -> Value {
        // Serialization of these structs cannot fail
        match self {
            IncomingFrame::Response(response) => {
                serde_json::to_value(response).unwrap_or(Value::Null)
            }
            IncomingFrame::Request(request) => serde_json::to_value(request).unwrap_or(Value::Null),
            IncomingFrame::Uncorrelated(value) => value.clone(),
        }
    }
}

/// Decode one frame into a request or response
///
/// Classification: an object carrying a `result` or `error` key alongside an
/// `id` is a response; an object carrying `method` is a request (a
/// notification if the id is absent). Anything else is malformed.
///
/// Presence of the keys decides the response shape, not their values, so
/// `"result": null` is a success, and a response whose id can never match a
/// registered call surfaces as [`IncomingFrame::Uncorrelated`] rather than
/// being dropped.
pub fn decode_frame(frame: &str) -> Result<IncomingFrame, CodecError> {
    let value: Value = serde_json::from_str(frame)?;

    let object = value.as_object().ok_or(CodecError::NotAnObject)?;

    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");
    if (has_result || has_error) && object.contains_key("id") {
        if has_result && has_error {
            return Err(CodecError::AmbiguousResponse);
        }
        let mut response = match JsonRpcResponse::deserialize(&value) {
            Ok(response) => response,
            Err(_) => return Ok(IncomingFrame::Uncorrelated(value)),
        };
        // serde turns a null result into None; keep the key's presence
        if has_result && response.result.is_none() {
            response.result = Some(Value::Null);
        }
        return Ok(IncomingFrame::Response(response));
    }

    if object.contains_key("method") {
        let request: JsonRpcRequest = serde_json::from_value(value)?;
        if request.method.is_empty() {
            return Err(CodecError::EmptyMethod);
        }
        return Ok(IncomingFrame::Request(request));
    }

    Err(CodecError::UnknownShape)
}

/// Encode a message as one frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_response() {
        let frame = r#"{"jsonrpc":"2.0","id":1,"result":["model-a","model-b"]}"#;
        match decode_frame(frame).unwrap() {
            IncomingFrame::Response(response) => {
                assert_eq!(response.id, RpcId::Number(1));
                assert_eq!(response.result, Some(json!(["model-a", "model-b"])));
                assert!(!response.is_error());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_response() {
        let frame = r#"{"id":"req-9","error":{"code":-32601,"message":"no such method"}}"#;
        match decode_frame(frame).unwrap() {
            IncomingFrame::Response(response) => {
                assert_eq!(response.id, RpcId::Text("req-9".to_string()));
                let error = response.error.unwrap();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "no such method");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_notification() {
        let frame = r#"{"method":"session/update","params":{"tokens":42}}"#;
        match decode_frame(frame).unwrap() {
            IncomingFrame::Request(request) => {
                assert!(request.is_notification());
                assert_eq!(request.method, "session/update");
                assert_eq!(request.params, Some(json!({"tokens": 42})));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_server_request() {
        let frame = r#"{"id":7,"method":"client/confirm","params":null}"#;
        match decode_frame(frame).unwrap() {
            IncomingFrame::Request(request) => {
                assert!(!request.is_notification());
                assert_eq!(request.id, Some(RpcId::Number(7)));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_null_result_is_a_success() {
        let frame = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        match decode_frame(frame).unwrap() {
            IncomingFrame::Response(response) => {
                assert_eq!(response.id, RpcId::Number(1));
                assert_eq!(response.result, Some(Value::Null));
                assert!(!response.is_error());
            }
            other => panic!("expected response, got {other:?}"),
        }

        // The key survives a re-encode
        let IncomingFrame::Response(response) = decode_frame(frame).unwrap() else {
            unreachable!()
        };
        let encoded = encode_frame(&response).unwrap();
        assert!(encoded.contains(r#""result":null"#));
    }

    #[test]
    fn test_decode_uncorrelatable_response_ids_surface() {
        for frame in [
            r#"{"id":null,"result":"lost"}"#,
            r#"{"id":1.5,"result":"lost"}"#,
            r#"{"id":18446744073709551615,"result":"lost"}"#,
        ] {
            match decode_frame(frame).unwrap() {
                IncomingFrame::Uncorrelated(value) => {
                    assert_eq!(value["result"], json!("lost"));
                }
                other => panic!("expected uncorrelated frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(decode_frame("not json"), Err(CodecError::Parse(_))));
        assert!(matches!(decode_frame("[1,2]"), Err(CodecError::NotAnObject)));
        assert!(matches!(
            decode_frame(r#"{"foo":"bar"}"#),
            Err(CodecError::UnknownShape)
        ));
        assert!(matches!(
            decode_frame(r#"{"method":""}"#),
            Err(CodecError::EmptyMethod)
        ));
        assert!(matches!(
            decode_frame(r#"{"id":1,"result":1,"error":{"code":1,"message":"x"}}"#),
            Err(CodecError::AmbiguousResponse)
        ));
        assert!(matches!(
            decode_frame(r#"{"id":1}"#),
            Err(CodecError::UnknownShape)
        ));
    }

    #[test]
    fn test_id_representation_round_trips() {
        // Numeric id stays numeric
        let frame = r#"{"id":1,"result":{}}"#;
        let IncomingFrame::Response(response) = decode_frame(frame).unwrap() else {
            panic!("expected response");
        };
        let encoded = encode_frame(&response).unwrap();
        assert!(encoded.contains(r#""id":1"#));
        assert!(!encoded.contains(r#""id":"1""#));

        // String id stays a string
        let frame = r#"{"id":"1","result":{}}"#;
        let IncomingFrame::Response(response) = decode_frame(frame).unwrap() else {
            panic!("expected response");
        };
        let encoded = encode_frame(&response).unwrap();
        assert!(encoded.contains(r#""id":"1""#));

        // And the two ids do not correlate
        assert_ne!(RpcId::Number(1), RpcId::Text("1".to_string()));
    }

    #[test]
    fn test_encode_request_skips_absent_fields() {
        let notification = JsonRpcRequest::notification("ping", None);
        let encoded = encode_frame(&notification).unwrap();
        assert!(!encoded.contains("\"id\""));
        assert!(!encoded.contains("\"params\""));
        assert!(encoded.contains(r#""method":"ping""#));
        assert!(encoded.contains(r#""jsonrpc":"2.0""#));
    }

    #[test]
    fn test_frame_to_value_keeps_payload() {
        let frame = r#"{"id":3,"result":{"userAgent":"agent/1.0"}}"#;
        let decoded = decode_frame(frame).unwrap();
        let value = decoded.to_value();
        assert_eq!(value["result"]["userAgent"], json!("agent/1.0"));
    }
}
