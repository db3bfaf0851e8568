//! Transport abstraction.
//!
//! A transport moves [`Message`]s to and from one server. Outbound messages go
//! through [`Transport::send`]; inbound messages arrive on the [`Inbound`]
//! channel handed out when the transport is created.

use crate::error::{McpError, McpResult};
use crate::process::ProcessTransport;
use crate::protocol::{Message, ParseError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One inbound frame.
#[derive(Debug)]
pub enum Incoming {
    Message(Message),
    /// The frame did not decode, but its request id could still be read.
    Malformed(ParseError),
}

/// Receiving half of a transport.
pub type Inbound = mpsc::UnboundedReceiver<Incoming>;

/// Kind of channel a transport runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Process,
    Stream,
    Http,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Process => "process",
            TransportKind::Stream => "stream",
            TransportKind::Http => "http",
            TransportKind::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// Outbound half of a connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one message.
    async fn send(&self, message: &Message) -> McpResult<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> McpResult<()>;

    /// False once the read loop has ended or `close` was called.
    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;
}

/// A freshly established transport and its inbound stream.
pub struct Connected {
    pub transport: Arc<dyn Transport>,
    pub inbound: Inbound,
}

/// Launch parameters for a child process server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// How to reach a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Process(ProcessConfig),
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    #[serde(rename = "websocket")]
    WebSocket { url: String },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Process(_) => TransportKind::Process,
            TransportConfig::Http { .. } => TransportKind::Http,
            TransportConfig::WebSocket { .. } => TransportKind::WebSocket,
        }
    }
}

/// Establish a transport for `config`.
///
/// Only the process variant is available; the network variants are rejected
/// with [`McpError::UnsupportedTransport`].
pub async fn connect(
    label: &str,
    config: &TransportConfig,
    shutdown_grace: Duration,
) -> McpResult<Connected> {
    match config {
        TransportConfig::Process(process) => {
            let (transport, inbound) = ProcessTransport::spawn(label, process, shutdown_grace)?;
            Ok(Connected {
                transport: Arc::new(transport),
                inbound,
            })
        }
        other => Err(McpError::UnsupportedTransport(other.kind().to_string())),
    }
}
