//! Server descriptors and lifecycle status.

use crate::config::ServerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use toolhost_mcp::{ServerCapabilities, TransportConfig, TransportKind};

/// Lifecycle state of a registered server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Disconnected,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Unknown => "unknown",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
            ServerStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiated capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub logging: bool,
}

impl From<&ServerCapabilities> for CapabilityFlags {
    fn from(caps: &ServerCapabilities) -> Self {
        Self {
            tools: caps.supports_tools(),
            resources: caps.supports_resources(),
            prompts: caps.supports_prompts(),
            logging: caps.supports_logging(),
        }
    }
}

/// A registered tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    pub transport: TransportConfig,
    pub enabled: bool,
    /// Default tool call timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub capabilities: CapabilityFlags,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Consecutive failed health checks.
    pub health_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ServerDescriptor {
    pub fn new(id: impl Into<String>, transport: TransportConfig) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            transport,
            enabled: true,
            timeout_ms: None,
            capabilities: CapabilityFlags::default(),
            status: ServerStatus::Unknown,
            last_error: None,
            health_failures: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }

    pub fn from_config(id: &str, config: &ServerConfig) -> Self {
        let mut descriptor = Self::new(id, config.to_transport());
        if let Some(name) = config.name() {
            descriptor.name = name.to_string();
        }
        descriptor.enabled = config.is_enabled();
        descriptor.timeout_ms = config.timeout().map(|t| t.as_millis() as u64);
        descriptor
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Move to `status`, recording `error` when given. Entering `Running`
    /// clears the last error and stamps `started_at`.
    pub fn set_status(&mut self, status: ServerStatus, error: Option<String>) {
        let now = Utc::now();
        if status == ServerStatus::Running {
            self.started_at = Some(now);
            self.last_error = None;
            self.health_failures = 0;
        }
        if error.is_some() {
            self.last_error = error;
        }
        self.status = status;
        self.updated_at = now;
    }
}
