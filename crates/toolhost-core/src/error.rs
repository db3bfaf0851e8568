//! Error types for the core crate.

use thiserror::Error;
use toolhost_mcp::{ErrorCode, McpError};

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error talking to a tool server.
    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server already registered: {0}")]
    ServerAlreadyRegistered(String),

    /// The server exists but is not in a state that accepts calls.
    #[error("server {id} is not running (status: {status})")]
    ServerNotRunning { id: String, status: String },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The tool exists but is disabled, missing or deprecated.
    #[error("tool {name} is not available (status: {status})")]
    ToolUnavailable { name: String, status: String },

    /// Arguments rejected before reaching the server.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Declared extension point without an implementation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Protocol error code reported for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Mcp(e) => e.code(),
            CoreError::ServerNotRunning { .. } => ErrorCode::ConnectionError,
            CoreError::ServerNotFound(_) | CoreError::ToolNotFound(_) => {
                ErrorCode::MethodNotFound
            }
            CoreError::InvalidInput(_) => ErrorCode::InvalidParams,
            CoreError::ToolUnavailable { .. } | CoreError::NotImplemented(_) => {
                ErrorCode::ServerError
            }
            CoreError::Config(_)
            | CoreError::ServerAlreadyRegistered(_)
            | CoreError::Io(_)
            | CoreError::Json(_) => ErrorCode::InternalError,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Mcp(e) if e.is_timeout())
    }
}

/// Configuration-specific errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid JSON/JSONC syntax.
    #[error("invalid config at {path}: {message}")]
    InvalidJson { path: String, message: String },

    /// Config validation failed.
    #[error("config validation failed: {message}")]
    Validation { message: String },

    /// Config file not found.
    #[error("config file not found: {path}")]
    NotFound { path: String },

    /// Environment variable not found during substitution.
    #[error("environment variable not found: {name}")]
    EnvVarNotFound { name: String },

    /// File reference not found during substitution.
    #[error("file reference not found: {path}")]
    FileRefNotFound { path: String },
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_codes() {
        let timeout = CoreError::Mcp(McpError::Timeout {
            method: "tools/call".into(),
            timeout: Duration::from_millis(100),
        });
        assert_eq!(timeout.code(), ErrorCode::Timeout);
        assert!(timeout.is_timeout());
        assert_eq!(
            CoreError::InvalidInput("x".into()).code(),
            ErrorCode::InvalidParams
        );
        assert!(!CoreError::ToolNotFound("x".into()).is_timeout());
    }

    #[test]
    fn test_display() {
        let err = CoreError::ToolUnavailable {
            name: "echo".into(),
            status: "error".into(),
        };
        assert_eq!(err.to_string(), "tool echo is not available (status: error)");
        let err: CoreError = ConfigError::validation("empty command").into();
        assert!(err.to_string().contains("empty command"));
    }
}
