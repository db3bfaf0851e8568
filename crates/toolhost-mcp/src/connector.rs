//! Factory seam between the pool and concrete transports.

use crate::client::{ClientOptions, McpClient};
use crate::error::McpResult;
use crate::transport::{self, TransportConfig};
use async_trait::async_trait;
use std::time::Duration;

/// Produces uninitialized clients for a server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a transport to `server_id` and wrap it in a client.
    ///
    /// The handshake is left to the caller.
    async fn connect(&self, server_id: &str, config: &TransportConfig) -> McpResult<McpClient>;
}

/// Connector backed by the real transports.
#[derive(Debug, Clone)]
pub struct TransportConnector {
    options: ClientOptions,
    shutdown_grace: Duration,
}

impl TransportConnector {
    pub fn new(options: ClientOptions, shutdown_grace: Duration) -> Self {
        Self {
            options,
            shutdown_grace,
        }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(ClientOptions::default(), Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, server_id: &str, config: &TransportConfig) -> McpResult<McpClient> {
        let connected = transport::connect(server_id, config, self.shutdown_grace).await?;
        Ok(McpClient::new(server_id, connected, self.options.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::McpError;

    #[tokio::test]
    async fn test_websocket_is_unsupported() {
        let connector = TransportConnector::default();
        let config = TransportConfig::WebSocket {
            url: "ws://localhost:9".into(),
        };
        let err = connector.connect("ws", &config).await.err().unwrap();
        assert!(matches!(err, McpError::UnsupportedTransport(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_binary_is_process_error() {
        let connector = TransportConnector::default();
        let config = TransportConfig::Process(crate::transport::ProcessConfig::new([
            "/nonexistent/toolhost-server",
        ]));
        let err = connector.connect("missing", &config).await.err().unwrap();
        assert!(matches!(err, McpError::ProcessError(_)));
    }
}
