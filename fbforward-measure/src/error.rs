//! Error types for the measurement subsystem (§7: transient network,
//! protocol violation, measurement staleness all surface through here).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeasureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("legacy control-channel dispatch byte {0:?} is not supported")]
    LegacyProtocolUnsupported(Vec<u8>),

    #[error("session {0} not found")]
    InvalidSession(String),

    #[error("session {0} expired")]
    SessionExpired(String),

    #[error("sample {0} already active")]
    SampleAlreadyActive(u32),

    #[error("sample {0} not found")]
    SampleNotFound(u32),

    #[error("sample id mismatch: expected {expected}, got {got}")]
    SampleIdMismatch { expected: u32, got: u32 },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection error: {0}")]
    ConnectionError(String),
}

pub type Result<T> = std::result::Result<T, MeasureError>;

impl MeasureError {
    /// Maps onto an RPC application error code for wire responses (§4.4).
    pub fn rpc_code(&self) -> fbforward_protocol::RpcErrorCode {
        use fbforward_protocol::RpcErrorCode;
        match self {
            MeasureError::InvalidSession(_) => RpcErrorCode::InvalidSession,
            MeasureError::SessionExpired(_) => RpcErrorCode::SessionExpired,
            MeasureError::SampleAlreadyActive(_) => RpcErrorCode::SampleAlreadyActive,
            MeasureError::SampleNotFound(_) => RpcErrorCode::SampleNotFound,
            MeasureError::SampleIdMismatch { .. } => RpcErrorCode::SampleIdMismatch,
            MeasureError::Json(_) => RpcErrorCode::ParseError,
            _ => RpcErrorCode::InternalError,
        }
    }
}
