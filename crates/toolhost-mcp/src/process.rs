//! Child-process transport (JSON-RPC over stdio).

use crate::error::{McpError, McpResult};
use crate::protocol::Message;
use crate::stream::StreamTransport;
use crate::transport::{Inbound, ProcessConfig, Transport, TransportKind};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Transport that owns a spawned server process.
pub struct ProcessTransport {
    inner: StreamTransport,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    shutdown_grace: Duration,
}

impl ProcessTransport {
    /// Spawn the server process and start reading its stdout.
    pub fn spawn(
        label: &str,
        config: &ProcessConfig,
        shutdown_grace: Duration,
    ) -> McpResult<(Self, Inbound)> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| McpError::ProcessError(format!("{label}: empty command")))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&config.environment)
            .kill_on_drop(true);

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        debug!(server = %label, command = %program, args = ?args, "Starting server process");

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::ProcessError(format!("failed to start {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ProcessError("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ProcessError("Failed to get stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let label = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %label, stderr = %line, "Server stderr");
                }
            });
        }

        let pid = child.id();
        info!(server = %label, pid = ?pid, "Server process started");

        let (inner, inbound) = StreamTransport::new(label, stdout, stdin);
        let transport = Self {
            inner,
            child: Mutex::new(Some(child)),
            pid,
            shutdown_grace,
        };
        Ok((transport, inbound))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(server = %self.inner.label(), error = %e, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&self, message: &Message) -> McpResult<()> {
        self.inner.send(message).await
    }

    /// Close stdin, ask the process to exit, then kill it after the grace
    /// period.
    async fn close(&self) -> McpResult<()> {
        self.inner.close_writer().await;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let label = self.inner.label();
            if matches!(child.try_wait(), Ok(None)) {
                self.terminate();
            }
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %label, status = %status, "Server process exited");
                }
                Ok(Err(e)) => {
                    warn!(server = %label, error = %e, "Failed waiting for server process");
                }
                Err(_) => {
                    warn!(
                        server = %label,
                        grace_ms = self.shutdown_grace.as_millis() as u64,
                        "Server did not exit in time, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(server = %label, error = %e, "Failed to kill server process");
                    }
                }
            }
        }

        self.inner.close().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }
}
