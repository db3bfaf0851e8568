//! The assembled runtime.
//!
//! A [`ToolRuntime`] owns the connection pool, the server manager and the
//! tool registry built from one [`Config`], plus the background loops that
//! keep them fresh.
//!
//! # Example
//!
//! ```ignore
//! use toolhost_core::ToolRuntime;
//!
//! let runtime = ToolRuntime::load(Some(project_dir), None).await?;
//! runtime.start().await;
//!
//! let result = runtime.execute("read_file", json!({"path": "README.md"}), None).await;
//!
//! runtime.shutdown().await;
//! ```

use crate::config::Config;
use crate::error::CoreResult;
use crate::manager::ServerManager;
use crate::pool::{ConnectionPool, PoolStats};
use crate::registry::{DiscoveryReport, ExecutionResult, RegisteredTool, SearchResult, ToolRegistry};
use crate::server::{ServerDescriptor, ServerStatus};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolhost_mcp::Connector;
use tracing::{debug, info, warn};

/// Background loops run by [`ToolRuntime::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    Maintenance,
    HealthChecks,
    Discovery,
}

impl BackgroundTask {
    const ALL: [BackgroundTask; 3] = [
        BackgroundTask::Maintenance,
        BackgroundTask::HealthChecks,
        BackgroundTask::Discovery,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            BackgroundTask::Maintenance => "maintenance",
            BackgroundTask::HealthChecks => "health_checks",
            BackgroundTask::Discovery => "discovery",
        }
    }
}

struct RunningTask {
    kind: BackgroundTask,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Pool, manager and registry wired together.
#[derive(Clone)]
pub struct ToolRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: Config,
    sources: Vec<PathBuf>,
    pool: Arc<ConnectionPool>,
    manager: Arc<ServerManager>,
    registry: Arc<ToolRegistry>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<RunningTask>>,
}

impl ToolRuntime {
    /// Load config from the standard locations and connect over the real
    /// transports.
    pub async fn load(project_dir: Option<&Path>, explicit: Option<&Path>) -> CoreResult<Self> {
        let (config, sources) = Config::load(project_dir, explicit).await?;
        let connector = Arc::new(config.connector());
        let runtime = Self::build(config, sources, connector).await?;
        Ok(runtime)
    }

    /// Build a runtime over an arbitrary connector. Servers are registered
    /// but not started.
    pub async fn from_config(config: Config, connector: Arc<dyn Connector>) -> CoreResult<Self> {
        Self::build(config, Vec::new(), connector).await
    }

    async fn build(
        config: Config,
        sources: Vec<PathBuf>,
        connector: Arc<dyn Connector>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let validator = config.validator()?;

        let pool = Arc::new(ConnectionPool::new(connector, config.pool_options()));
        let manager = Arc::new(ServerManager::new(
            Arc::clone(&pool),
            config.lifecycle_options(),
        ));
        let registry = Arc::new(ToolRegistry::new(
            Arc::clone(&manager),
            validator,
            config.environment(),
            config.registry_options(),
        ));
        registry.attach();

        let registered = manager.register_from_config(&config).await?;
        debug!(servers = registered.len(), "Runtime assembled");

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                sources,
                pool,
                manager,
                registry,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Config files the runtime was loaded from.
    pub fn config_sources(&self) -> &[PathBuf] {
        &self.inner.sources
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn manager(&self) -> &Arc<ServerManager> {
        &self.inner.manager
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start every enabled server and the background loops.
    ///
    /// Servers that fail to start are logged and returned; the rest of the
    /// runtime keeps going.
    pub async fn start(&self) -> Vec<(String, CoreResult<()>)> {
        let results = self.inner.manager.start_all().await;
        for (id, result) in &results {
            if let Err(e) = result {
                warn!(server = %id, error = %e, "Server failed to start");
            }
        }
        self.start_background().await;
        info!(
            running = results.iter().filter(|(_, r)| r.is_ok()).count(),
            failed = results.iter().filter(|(_, r)| r.is_err()).count(),
            "Runtime started"
        );
        results
    }

    /// Spawn any background loop that is not already running.
    pub async fn start_background(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        for kind in BackgroundTask::ALL {
            if tasks.iter().any(|t| t.kind == kind) {
                continue;
            }
            let token = self.inner.shutdown.child_token();
            let handle = match kind {
                BackgroundTask::Maintenance => self.inner.pool.spawn_maintenance(token.clone()),
                BackgroundTask::HealthChecks => {
                    self.inner.manager.spawn_health_checks(token.clone())
                }
                BackgroundTask::Discovery => self.inner.registry.spawn_discovery(token.clone()),
            };
            debug!(task = kind.as_str(), "Background task started");
            tasks.push(RunningTask {
                kind,
                token,
                handle,
            });
        }
    }

    pub async fn stop_maintenance(&self) {
        self.stop_task(BackgroundTask::Maintenance).await;
    }

    pub async fn stop_health_checks(&self) {
        self.stop_task(BackgroundTask::HealthChecks).await;
    }

    pub async fn stop_discovery(&self) {
        self.stop_task(BackgroundTask::Discovery).await;
    }

    /// Whether `kind` is currently running.
    pub async fn is_running(&self, kind: BackgroundTask) -> bool {
        self.inner.tasks.lock().await.iter().any(|t| t.kind == kind)
    }

    async fn stop_task(&self, kind: BackgroundTask) {
        let task = {
            let mut tasks = self.inner.tasks.lock().await;
            match tasks.iter().position(|t| t.kind == kind) {
                Some(index) => tasks.swap_remove(index),
                None => return,
            }
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            warn!(task = kind.as_str(), error = %e, "Background task ended abnormally");
        }
        debug!(task = kind.as_str(), "Background task stopped");
    }

    /// Stop the background loops, every server and every connection.
    pub async fn shutdown(&self) {
        info!("Shutting down runtime");
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.handle.await {
                warn!(task = task.kind.as_str(), error = %e, "Background task ended abnormally");
            }
        }
        self.inner.manager.stop_all().await;
        self.inner.pool.shutdown().await;
        self.inner.registry.clear().await;
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub async fn execute(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        self.inner.registry.execute(tool, arguments, timeout).await
    }

    pub async fn discover(&self, server_id: Option<&str>) -> CoreResult<DiscoveryReport> {
        self.inner.registry.discover(server_id).await
    }

    pub async fn list_tools(&self) -> Vec<RegisteredTool> {
        self.inner.registry.list().await
    }

    pub async fn search_tools(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        self.inner.registry.search(query, limit).await
    }

    pub async fn list_servers(&self) -> Vec<ServerDescriptor> {
        self.inner.manager.list_servers().await
    }

    pub async fn get_server_status(&self, server_id: &str) -> CoreResult<ServerStatus> {
        self.inner.manager.get_server_status(server_id).await
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolhost_mcp::echo_server;
    use toolhost_test_utils::MemoryConnector;

    fn config(servers: &[&str]) -> Config {
        let servers: serde_json::Map<String, Value> = servers
            .iter()
            .map(|id| (id.to_string(), json!({"type": "local", "command": ["memory"]})))
            .collect();
        serde_json::from_value(json!({ "servers": servers })).unwrap()
    }

    #[tokio::test]
    async fn test_start_execute_shutdown() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let runtime = ToolRuntime::from_config(config(&["echo"]), Arc::new(connector))
            .await
            .unwrap();
        assert_eq!(runtime.get_server_status("echo").await.unwrap(), ServerStatus::Unknown);

        let results = runtime.start().await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(runtime.get_server_status("echo").await.unwrap(), ServerStatus::Running);
        assert!(runtime.is_running(BackgroundTask::Discovery).await);

        let result = runtime.execute("echo", json!({"hello": "world"}), None).await;
        assert!(result.success, "{result:?}");
        assert_eq!(runtime.search_tools("echo", 5).await.len(), 1);

        runtime.shutdown().await;
        assert_eq!(runtime.get_server_status("echo").await.unwrap(), ServerStatus::Stopped);
        assert!(runtime.list_tools().await.is_empty());
        assert!(runtime.pool().is_empty().await);
        assert!(!runtime.is_running(BackgroundTask::Maintenance).await);
    }

    #[tokio::test]
    async fn test_failed_server_does_not_block_others() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        connector.refuse("down");
        let runtime = ToolRuntime::from_config(config(&["echo", "down"]), Arc::new(connector))
            .await
            .unwrap();

        let results = runtime.start().await;
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(failed, vec!["down"]);
        assert_eq!(runtime.get_server_status("down").await.unwrap(), ServerStatus::Error);
        assert!(runtime.execute("echo", json!({}), None).await.success);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_individual_loops_stop() {
        let runtime = ToolRuntime::from_config(config(&[]), Arc::new(MemoryConnector::new()))
            .await
            .unwrap();
        runtime.start_background().await;

        runtime.stop_discovery().await;
        assert!(!runtime.is_running(BackgroundTask::Discovery).await);
        assert!(runtime.is_running(BackgroundTask::HealthChecks).await);

        runtime.stop_health_checks().await;
        runtime.stop_maintenance().await;
        assert!(!runtime.is_running(BackgroundTask::Maintenance).await);

        // Restarting only spawns what is missing.
        runtime.start_background().await;
        assert!(runtime.is_running(BackgroundTask::Discovery).await);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config: Config = serde_json::from_value(json!({
            "servers": {"bad": {"type": "local", "command": []}}
        }))
        .unwrap();
        let result = ToolRuntime::from_config(config, Arc::new(MemoryConnector::new())).await;
        assert!(result.is_err());
    }
}
