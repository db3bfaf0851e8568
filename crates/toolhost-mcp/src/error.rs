//! Error types for the protocol crate.

use crate::protocol::{ErrorCode, ParseError, RpcError};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Result type for protocol and client operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur while talking to a tool server.
#[derive(Debug, Error)]
pub enum McpError {
    /// Protocol violation by the peer.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A frame could not be decoded.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The server answered with an error response.
    #[error("Server error [{code}]: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The method is unknown or the capability was never advertised.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// No response within the deadline.
    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// Connection could not be established or failed mid-flight.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection closed while the operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server process failed.
    #[error("Server process error: {0}")]
    ProcessError(String),

    /// The handshake was rejected.
    #[error("Server initialization failed: {0}")]
    InitializationFailed(String),

    /// Transport kind recognised but not available.
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Authenticated but not allowed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Convert an error response into an error value.
    pub fn from_rpc(error: RpcError) -> Self {
        match error.kind() {
            Some(ErrorCode::MethodNotFound) => Self::MethodNotFound(error.message),
            _ => Self::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            },
        }
    }

    /// The closed error code this error maps onto.
    pub fn code(&self) -> ErrorCode {
        match self {
            McpError::ProtocolError(_) => ErrorCode::InvalidRequest,
            McpError::Parse(e) => e.code(),
            McpError::Rpc { code, .. } => {
                ErrorCode::from_code(*code).unwrap_or(ErrorCode::ServerError)
            }
            McpError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            McpError::Timeout { .. } => ErrorCode::Timeout,
            McpError::ConnectionFailed(_)
            | McpError::ConnectionClosed
            | McpError::ProcessError(_)
            | McpError::InitializationFailed(_)
            | McpError::UnsupportedTransport(_)
            | McpError::Io(_) => ErrorCode::ConnectionError,
            McpError::AuthFailed(_) => ErrorCode::AuthenticationError,
            McpError::Unauthorized(_) => ErrorCode::AuthorizationError,
            McpError::Json(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the connection this error came from should be considered dead.
    pub fn is_connection_error(&self) -> bool {
        self.code() == ErrorCode::ConnectionError
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// Wire form of this error.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            McpError::Rpc {
                code,
                message,
                data,
            } => RpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => RpcError::new(other.code(), other.to_string()),
        }
    }
}
