//! Measurement RPC envelope (§4.4): `uint32_be length || JSON-RPC-2.0 object`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Length of the big-endian length prefix that precedes every RPC object on
/// the wire.
pub const RPC_LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }
}

/// Standard JSON-RPC transport/parse codes plus the application codes named
/// in §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    SampleAlreadyActive,
    SampleNotFound,
    SampleIdMismatch,
    InvalidSession,
    SessionExpired,
}

impl RpcErrorCode {
    pub fn code(self) -> i32 {
        match self {
            RpcErrorCode::ParseError => -32700,
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::InternalError => -32603,
            RpcErrorCode::SampleAlreadyActive => 1001,
            RpcErrorCode::SampleNotFound => 1002,
            RpcErrorCode::SampleIdMismatch => 1003,
            RpcErrorCode::InvalidSession => 1004,
            RpcErrorCode::SessionExpired => 1005,
        }
    }
}

/// Recognized RPC methods (§4.4).
pub mod methods {
    pub const SESSION_HELLO: &str = "session.hello";
    pub const SESSION_GOODBYE: &str = "session.goodbye";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SAMPLE_START: &str = "sample.start";
    pub const SAMPLE_START_REVERSE: &str = "sample.start_reverse";
    pub const SAMPLE_STOP: &str = "sample.stop";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub session_id: String,
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStartParams {
    pub sample_id: u32,
    pub network: String, // "tcp" | "udp"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStartReverseParams {
    pub sample_id: u32,
    pub network: String,
    pub target_bps: f64,
    pub chunk_size: u32,
    pub byte_budget: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStopParams {
    pub sample_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = RpcRequest::new(
            methods::SAMPLE_START,
            serde_json::to_value(SampleStartParams {
                sample_id: 1,
                network: "tcp".into(),
            })
            .unwrap(),
            42,
        );
        let json = serde_json::to_string(&req).unwrap();
        let back: RpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 42);
        assert_eq!(back.method, methods::SAMPLE_START);
    }

    #[test]
    fn error_response_carries_application_code() {
        let resp = RpcResponse::err(
            7,
            RpcError::new(RpcErrorCode::SampleNotFound, "no such sample"),
        );
        assert_eq!(resp.error.unwrap().code, 1002);
    }
}
