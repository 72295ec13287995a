//! Wire protocol: line-delimited JSON-RPC-like frames (§4.4.1, §6.1).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default broker listen port.
pub const DEFAULT_PORT: u16 = 9001;

/// JSON-RPC style error codes used on the broker wire (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    /// Unknown `method` on a request.
    MethodNotFound,
    /// `params` failed validation for the given method.
    InvalidParams,
    /// Internal failure: buffer full, timeout, or another server-side
    /// validation failure.
    Internal,
}

impl RpcErrorCode {
    /// The JSON-RPC integer this code maps to.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::Internal => -32603,
        }
    }

    /// Recovers a code from its JSON-RPC integer, if recognized.
    #[must_use]
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            -32601 => Some(Self::MethodNotFound),
            -32602 => Some(Self::InvalidParams),
            -32603 => Some(Self::Internal),
            _ => None,
        }
    }
}

/// A request frame as sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlates this request with its response.
    pub id: String,
    /// One of the broker's supported methods (§4.4.1).
    pub method: String,
    /// Method-specific parameters.
    #[serde(default)]
    pub params: Value,
}

/// A response frame as sent by the broker, either to acknowledge a request
/// or to push an unsolicited topic delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Matches the originating request's id, or a fresh id for an
    /// unsolicited push (e.g. a topic delivery).
    pub id: String,
    /// Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Builds a successful response carrying `result`.
    #[must_use]
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self { id: id.into(), result: Some(result), error: None }
    }

    /// Builds an error response.
    #[must_use]
    pub fn err(id: impl Into<String>, code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError { code: code.as_i64(), message: message.into() }),
        }
    }
}

/// The `{ code, message }` shape of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// One of the codes in [`RpcErrorCode`].
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_through_their_integers() {
        for code in [RpcErrorCode::MethodNotFound, RpcErrorCode::InvalidParams, RpcErrorCode::Internal] {
            assert_eq!(RpcErrorCode::from_i64(code.as_i64()), Some(code));
        }
    }

    #[test]
    fn response_serializes_result_xor_error() {
        let ok = Response::ok("1", serde_json::json!({"status": "ready"}));
        let wire = serde_json::to_string(&ok).unwrap();
        assert!(wire.contains("result"));
        assert!(!wire.contains("error"));

        let failed = Response::err("1", RpcErrorCode::InvalidParams, "bad params");
        let wire = serde_json::to_string(&failed).unwrap();
        assert!(wire.contains("-32602"));
    }
}
