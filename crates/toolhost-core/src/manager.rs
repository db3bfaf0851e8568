//! Server lifecycle management.
//!
//! Each registered server moves through [`ServerStatus`]:
//!
//! ```text
//! Unknown ─▶ Starting ─▶ Running ─▶ Stopping ─▶ Stopped
//!               │           │
//!               ▼           ▼
//!             Error    Disconnected
//! ```
//!
//! Lifecycle operations on one server are serialized; different servers
//! proceed independently. Failed starts leave the server in `Error` until an
//! explicit restart.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::pool::ConnectionPool;
use crate::server::{CapabilityFlags, ServerDescriptor, ServerStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use toolhost_mcp::{McpClient, Prompt, Resource, Tool};
use tracing::{debug, error, info, warn};

/// Lifecycle settings.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub health_check_interval: Duration,
    /// Failed health checks in a row before a server is marked disconnected.
    pub max_health_failures: u32,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            max_health_failures: 3,
        }
    }
}

/// Receives catalog changes from the manager.
///
/// Callbacks run after the manager has released its locks.
#[async_trait]
pub trait ServerObserver: Send + Sync {
    /// A server finished starting and advertised `tools`.
    async fn server_discovered(&self, server_id: &str, tools: &[Tool]);

    /// A server was stopped or unregistered.
    async fn server_stopped(&self, server_id: &str);

    /// A server failed its health checks.
    async fn server_disconnected(&self, server_id: &str) {
        self.server_stopped(server_id).await;
    }
}

/// What a server advertised at its last discovery.
#[derive(Debug, Clone)]
pub struct ServerCatalog {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
    pub discovered_at: DateTime<Utc>,
}

pub struct ServerManager {
    pool: Arc<ConnectionPool>,
    options: LifecycleOptions,
    servers: RwLock<HashMap<String, ServerDescriptor>>,
    catalogs: RwLock<HashMap<String, ServerCatalog>>,
    observer: std::sync::RwLock<Option<Weak<dyn ServerObserver>>>,
    operations: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServerManager {
    pub fn new(pool: Arc<ConnectionPool>, options: LifecycleOptions) -> Self {
        Self {
            pool,
            options,
            servers: RwLock::new(HashMap::new()),
            catalogs: RwLock::new(HashMap::new()),
            observer: std::sync::RwLock::new(None),
            operations: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    pub fn set_observer(&self, observer: Weak<dyn ServerObserver>) {
        *self
            .observer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn ServerObserver>> {
        self.observer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn operation_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut operations = self
            .operations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(operations.entry(server_id.to_string()).or_default())
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Add a server in `Unknown` state.
    pub async fn register_server(&self, mut descriptor: ServerDescriptor) -> CoreResult<()> {
        let mut servers = self.servers.write().await;
        if servers.contains_key(&descriptor.id) {
            return Err(CoreError::ServerAlreadyRegistered(descriptor.id));
        }
        descriptor.set_status(ServerStatus::Unknown, None);
        info!(server = %descriptor.id, transport = %descriptor.transport_kind(), "Registered server");
        servers.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Register every enabled server in `config`. Returns the ids registered.
    pub async fn register_from_config(&self, config: &Config) -> CoreResult<Vec<String>> {
        let mut registered = Vec::new();
        for (id, server) in config.servers() {
            if !server.is_enabled() {
                debug!(server = %id, "Skipping disabled server");
                continue;
            }
            self.register_server(ServerDescriptor::from_config(id, server))
                .await?;
            registered.push(id.to_string());
        }
        Ok(registered)
    }

    /// Stop `server_id` and forget it.
    pub async fn unregister_server(&self, server_id: &str) -> CoreResult<()> {
        self.stop_server(server_id).await?;
        self.servers.write().await.remove(server_id);
        self.catalogs.write().await.remove(server_id);
        self.operations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(server_id);
        info!(server = %server_id, "Unregistered server");
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect, handshake and discover. A no-op for running or starting
    /// servers.
    pub async fn start_server(&self, server_id: &str) -> CoreResult<()> {
        let operation = self.operation_lock(server_id);
        let _guard = operation.lock().await;

        let transport = {
            let mut servers = self.servers.write().await;
            let descriptor = servers
                .get_mut(server_id)
                .ok_or_else(|| CoreError::ServerNotFound(server_id.to_string()))?;
            if matches!(descriptor.status, ServerStatus::Running | ServerStatus::Starting) {
                debug!(server = %server_id, status = %descriptor.status, "Server already started");
                return Ok(());
            }
            descriptor.set_status(ServerStatus::Starting, None);
            descriptor.transport.clone()
        };
        info!(server = %server_id, "Starting server");

        let outcome = async {
            let client = self.pool.create(server_id, &transport).await?;
            let catalog = discover_catalog(&client).await?;
            let flags = client
                .capabilities()
                .map(CapabilityFlags::from)
                .unwrap_or_default();
            Ok::<_, CoreError>((flags, catalog))
        }
        .await;

        match outcome {
            Ok((flags, catalog)) => {
                let tools = catalog.tools.clone();
                self.catalogs
                    .write()
                    .await
                    .insert(server_id.to_string(), catalog);
                if let Some(descriptor) = self.servers.write().await.get_mut(server_id) {
                    descriptor.capabilities = flags;
                    descriptor.set_status(ServerStatus::Running, None);
                }
                info!(server = %server_id, tools = tools.len(), "Server running");
                if let Some(observer) = self.observer() {
                    observer.server_discovered(server_id, &tools).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(server = %server_id, error = %e, "Server failed to start");
                self.pool.close(server_id).await;
                if let Some(descriptor) = self.servers.write().await.get_mut(server_id) {
                    descriptor.set_status(ServerStatus::Error, Some(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Close the connection and drop the server's catalog.
    pub async fn stop_server(&self, server_id: &str) -> CoreResult<()> {
        let operation = self.operation_lock(server_id);
        let _guard = operation.lock().await;

        {
            let mut servers = self.servers.write().await;
            let descriptor = servers
                .get_mut(server_id)
                .ok_or_else(|| CoreError::ServerNotFound(server_id.to_string()))?;
            descriptor.set_status(ServerStatus::Stopping, None);
        }
        info!(server = %server_id, "Stopping server");

        self.pool.close(server_id).await;
        self.catalogs.write().await.remove(server_id);
        if let Some(descriptor) = self.servers.write().await.get_mut(server_id) {
            descriptor.set_status(ServerStatus::Stopped, None);
        }
        info!(server = %server_id, "Server stopped");

        if let Some(observer) = self.observer() {
            observer.server_stopped(server_id).await;
        }
        Ok(())
    }

    pub async fn restart_server(&self, server_id: &str) -> CoreResult<()> {
        self.stop_server(server_id).await?;
        self.start_server(server_id).await
    }

    /// Start every registered enabled server concurrently.
    pub async fn start_all(&self) -> Vec<(String, CoreResult<()>)> {
        let ids: Vec<String> = self
            .list_servers()
            .await
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| d.id)
            .collect();
        let results = join_all(ids.iter().map(|id| self.start_server(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// Stop every server that is not already stopped.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .list_servers()
            .await
            .into_iter()
            .filter(|d| !matches!(d.status, ServerStatus::Stopped | ServerStatus::Unknown))
            .map(|d| d.id)
            .collect();
        for result in join_all(ids.iter().map(|id| self.stop_server(id))).await {
            if let Err(e) = result {
                warn!(error = %e, "Failed to stop server");
            }
        }
    }

    /// Live client for a running server, reconnecting if the pool evicted it.
    pub async fn connection(&self, server_id: &str) -> CoreResult<Arc<McpClient>> {
        let transport = {
            let servers = self.servers.read().await;
            let descriptor = servers
                .get(server_id)
                .ok_or_else(|| CoreError::ServerNotFound(server_id.to_string()))?;
            if descriptor.status != ServerStatus::Running {
                return Err(CoreError::ServerNotRunning {
                    id: server_id.to_string(),
                    status: descriptor.status.to_string(),
                });
            }
            descriptor.transport.clone()
        };

        if let Some(client) = self.pool.get(server_id).await {
            return Ok(client);
        }
        debug!(server = %server_id, "Connection not pooled, reconnecting");
        Ok(self.pool.create(server_id, &transport).await?)
    }

    /// Re-fetch the catalog of a running server and return its tools.
    pub async fn refresh_tools(&self, server_id: &str) -> CoreResult<Vec<Tool>> {
        let client = self.connection(server_id).await?;
        let catalog = match discover_catalog(&client).await {
            Ok(catalog) => catalog,
            Err(e) => {
                if let CoreError::Mcp(mcp) = &e {
                    self.pool.report_failure(server_id, mcp).await;
                }
                return Err(e);
            }
        };
        let tools = catalog.tools.clone();
        self.catalogs
            .write()
            .await
            .insert(server_id.to_string(), catalog);
        Ok(tools)
    }

    // ========================================================================
    // Health checks
    // ========================================================================

    /// Health-check every running server once. Returns each checked
    /// server's result; servers without a pooled connection are skipped.
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let ids = self.running_servers().await;
        let results = join_all(ids.iter().map(|id| self.health_check(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, healthy)| healthy.map(|h| (id, h)))
            .collect()
    }

    /// `None` when the server is busy with a lifecycle operation.
    async fn health_check(&self, server_id: &str) -> Option<bool> {
        let operation = self.operation_lock(server_id);
        let _guard = operation.try_lock().ok()?;

        {
            let servers = self.servers.read().await;
            let descriptor = servers.get(server_id)?;
            if descriptor.status != ServerStatus::Running {
                return None;
            }
        }

        // Reaped connections stay closed until the next call reconnects.
        if !self.pool.contains(server_id).await {
            debug!(server = %server_id, "No pooled connection, skipping health check");
            return None;
        }
        let healthy = self.pool.health_check(server_id).await;

        let disconnected = {
            let mut servers = self.servers.write().await;
            let descriptor = servers.get_mut(server_id)?;
            if healthy {
                descriptor.health_failures = 0;
                false
            } else {
                descriptor.health_failures += 1;
                if descriptor.health_failures >= self.options.max_health_failures {
                    let message = format!(
                        "health check failed {} times in a row",
                        descriptor.health_failures
                    );
                    descriptor.set_status(ServerStatus::Disconnected, Some(message));
                    true
                } else {
                    false
                }
            }
        };

        if disconnected {
            error!(server = %server_id, "Server disconnected");
            self.pool.close(server_id).await;
            self.catalogs.write().await.remove(server_id);
            if let Some(observer) = self.observer() {
                observer.server_disconnected(server_id).await;
            }
        }
        Some(healthy)
    }

    /// Run [`health_check_all`](Self::health_check_all) every
    /// `health_check_interval` until `token` is cancelled.
    pub fn spawn_health_checks(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.options.health_check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let results = manager.health_check_all().await;
                        let failed = results.iter().filter(|(_, healthy)| !healthy).count();
                        debug!(checked = results.len(), failed, "Health checks complete");
                    }
                }
            }
            debug!("Health checks stopped");
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// All registered servers sorted by id.
    pub async fn list_servers(&self) -> Vec<ServerDescriptor> {
        let mut servers: Vec<_> = self.servers.read().await.values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    pub async fn get_server(&self, server_id: &str) -> Option<ServerDescriptor> {
        self.servers.read().await.get(server_id).cloned()
    }

    pub async fn get_server_status(&self, server_id: &str) -> CoreResult<ServerStatus> {
        self.servers
            .read()
            .await
            .get(server_id)
            .map(|d| d.status)
            .ok_or_else(|| CoreError::ServerNotFound(server_id.to_string()))
    }

    /// Ids of running servers, sorted.
    pub async fn running_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .servers
            .read()
            .await
            .values()
            .filter(|d| d.status == ServerStatus::Running)
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn tools(&self, server_id: &str) -> Vec<Tool> {
        self.catalog(server_id, |c| c.tools.clone()).await
    }

    pub async fn resources(&self, server_id: &str) -> Vec<Resource> {
        self.catalog(server_id, |c| c.resources.clone()).await
    }

    pub async fn prompts(&self, server_id: &str) -> Vec<Prompt> {
        self.catalog(server_id, |c| c.prompts.clone()).await
    }

    async fn catalog<T: Default>(&self, server_id: &str, f: impl Fn(&ServerCatalog) -> T) -> T {
        self.catalogs
            .read()
            .await
            .get(server_id)
            .map(f)
            .unwrap_or_default()
    }

    pub async fn discovered_at(&self, server_id: &str) -> Option<DateTime<Utc>> {
        self.catalogs
            .read()
            .await
            .get(server_id)
            .map(|c| c.discovered_at)
    }
}

async fn discover_catalog(client: &McpClient) -> CoreResult<ServerCatalog> {
    let tools = client.list_tools().await?;
    let resources = client.list_resources().await?;
    let prompts = client.list_prompts().await?;
    debug!(
        server = %client.server_id(),
        tools = tools.len(),
        resources = resources.len(),
        prompts = prompts.len(),
        "Discovered catalog"
    );
    Ok(ServerCatalog {
        tools,
        resources,
        prompts,
        discovered_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolOptions;
    use toolhost_mcp::echo_server;
    use toolhost_test_utils::{fixtures, memory_transport, MemoryConnector};

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServerObserver for Recorder {
        async fn server_discovered(&self, server_id: &str, tools: &[Tool]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("discovered:{server_id}:{}", tools.len()));
        }

        async fn server_stopped(&self, server_id: &str) {
            self.events.lock().unwrap().push(format!("stopped:{server_id}"));
        }

        async fn server_disconnected(&self, server_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("disconnected:{server_id}"));
        }
    }

    fn manager_with(connector: &MemoryConnector, options: LifecycleOptions) -> Arc<ServerManager> {
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(connector.clone()),
            PoolOptions {
                health_check_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        ));
        Arc::new(ServerManager::new(pool, options))
    }

    async fn register(manager: &ServerManager, id: &str) {
        manager
            .register_server(ServerDescriptor::new(id, memory_transport()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_discovers_catalog() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let manager = manager_with(&connector, LifecycleOptions::default());
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn ServerObserver> = recorder.clone();
        manager.set_observer(Arc::downgrade(&observer));
        register(&manager, "echo").await;
        assert_eq!(manager.get_server_status("echo").await.unwrap(), ServerStatus::Unknown);

        manager.start_server("echo").await.unwrap();

        let descriptor = manager.get_server("echo").await.unwrap();
        assert_eq!(descriptor.status, ServerStatus::Running);
        assert!(descriptor.capabilities.tools);
        assert!(descriptor.capabilities.resources);
        assert!(descriptor.started_at.is_some());
        assert_eq!(manager.tools("echo").await[0].name, "echo");
        assert_eq!(manager.resources("echo").await.len(), 1);
        assert_eq!(manager.prompts("echo").await.len(), 1);
        assert_eq!(recorder.events(), vec!["discovered:echo:1"]);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let manager = manager_with(&connector, LifecycleOptions::default());
        register(&manager, "echo").await;

        manager.start_server("echo").await.unwrap();
        manager.start_server("echo").await.unwrap();
        assert_eq!(connector.connect_count("echo"), 1);
    }

    #[tokio::test]
    async fn test_failed_start_records_error() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        connector.refuse("echo");
        let manager = manager_with(&connector, LifecycleOptions::default());
        register(&manager, "echo").await;

        assert!(manager.start_server("echo").await.is_err());
        let descriptor = manager.get_server("echo").await.unwrap();
        assert_eq!(descriptor.status, ServerStatus::Error);
        assert!(descriptor.last_error.unwrap().contains("refused"));
        assert!(!manager.pool().contains("echo").await);

        // Only an explicit restart retries.
        connector.allow("echo");
        manager.restart_server("echo").await.unwrap();
        assert_eq!(manager.get_server_status("echo").await.unwrap(), ServerStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_clears_catalog() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let manager = manager_with(&connector, LifecycleOptions::default());
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn ServerObserver> = recorder.clone();
        manager.set_observer(Arc::downgrade(&observer));
        register(&manager, "echo").await;
        manager.start_server("echo").await.unwrap();
        let client = manager.connection("echo").await.unwrap();

        manager.stop_server("echo").await.unwrap();
        assert_eq!(manager.get_server_status("echo").await.unwrap(), ServerStatus::Stopped);
        assert!(manager.tools("echo").await.is_empty());
        assert!(!client.is_connected());
        assert!(matches!(
            manager.connection("echo").await,
            Err(CoreError::ServerNotRunning { .. })
        ));
        assert_eq!(recorder.events(), vec!["discovered:echo:1", "stopped:echo"]);
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let manager = manager_with(&connector, LifecycleOptions::default());
        register(&manager, "echo").await;
        assert!(matches!(
            manager
                .register_server(ServerDescriptor::new("echo", memory_transport()))
                .await,
            Err(CoreError::ServerAlreadyRegistered(_))
        ));

        manager.start_server("echo").await.unwrap();
        manager.unregister_server("echo").await.unwrap();
        assert!(manager.get_server("echo").await.is_none());
        assert!(!manager.pool().contains("echo").await);
        assert!(matches!(
            manager.start_server("echo").await,
            Err(CoreError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_from_config_skips_disabled() {
        let config = Config::parse_jsonc(
            r#"{ "servers": {
                "b": { "type": "local", "command": ["b"] },
                "a": { "type": "local", "command": ["a"] },
                "off": { "type": "local", "command": ["x"], "enabled": false }
            } }"#,
            "test",
        )
        .unwrap();
        let manager = manager_with(&MemoryConnector::new(), LifecycleOptions::default());
        let ids = manager.register_from_config(&config).await.unwrap();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(manager.list_servers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_start_all_and_stop_all() {
        let connector = MemoryConnector::new()
            .with_server("a", echo_server)
            .with_server("b", echo_server);
        connector.refuse("b");
        let manager = manager_with(&connector, LifecycleOptions::default());
        register(&manager, "a").await;
        register(&manager, "b").await;

        let results = manager.start_all().await;
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert_eq!(manager.running_servers().await, vec!["a"]);

        manager.stop_all().await;
        assert!(manager.running_servers().await.is_empty());
        assert_eq!(manager.get_server_status("b").await.unwrap(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_connection_reconnects_after_eviction() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let manager = manager_with(&connector, LifecycleOptions::default());
        register(&manager, "echo").await;
        manager.start_server("echo").await.unwrap();

        manager.pool().close("echo").await;
        let client = manager.connection("echo").await.unwrap();
        assert!(client.is_connected());
        assert_eq!(connector.connect_count("echo"), 2);
    }

    #[tokio::test]
    async fn test_health_failures_disconnect() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let manager = manager_with(
            &connector,
            LifecycleOptions {
                max_health_failures: 2,
                ..Default::default()
            },
        );
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn ServerObserver> = recorder.clone();
        manager.set_observer(Arc::downgrade(&observer));
        register(&manager, "echo").await;
        manager.start_server("echo").await.unwrap();

        assert_eq!(manager.health_check_all().await, vec![("echo".to_string(), true)]);

        connector.refuse("echo");
        connector.kill("echo");
        assert_eq!(manager.health_check_all().await, vec![("echo".to_string(), false)]);
        assert_eq!(manager.get_server_status("echo").await.unwrap(), ServerStatus::Running);

        assert_eq!(manager.health_check_all().await, vec![("echo".to_string(), false)]);
        let descriptor = manager.get_server("echo").await.unwrap();
        assert_eq!(descriptor.status, ServerStatus::Disconnected);
        assert!(descriptor.last_error.is_some());
        assert!(!manager.pool().contains("echo").await);
        assert_eq!(recorder.events().last().unwrap(), "disconnected:echo");

        // Disconnected servers are no longer checked.
        assert!(manager.health_check_all().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_leaves_reaped_connection_closed() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(connector.clone()),
            PoolOptions {
                idle_ttl: Duration::from_secs(60),
                ..Default::default()
            },
        ));
        let manager = ServerManager::new(Arc::clone(&pool), LifecycleOptions::default());
        register(&manager, "echo").await;
        manager.start_server("echo").await.unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(61)).await;
            assert_eq!(pool.run_maintenance().await, vec!["echo".to_string()]);
            assert!(manager.health_check_all().await.is_empty());
            assert!(!pool.contains("echo").await);
        }
        assert_eq!(connector.connect_count("echo"), 1);
        assert_eq!(manager.get_server_status("echo").await.unwrap(), ServerStatus::Running);

        // The next call reconnects on demand.
        assert!(manager.connection("echo").await.unwrap().is_connected());
        assert_eq!(connector.connect_count("echo"), 2);
    }

    #[tokio::test]
    async fn test_no_resources_server() {
        let connector = MemoryConnector::new().with_server("bare", fixtures::no_resources_server);
        let manager = manager_with(&connector, LifecycleOptions::default());
        register(&manager, "bare").await;
        manager.start_server("bare").await.unwrap();

        let descriptor = manager.get_server("bare").await.unwrap();
        assert!(!descriptor.capabilities.resources);
        assert!(manager.resources("bare").await.is_empty());
        assert!(manager.discovered_at("bare").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_cancellable() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let manager = manager_with(
            &connector,
            LifecycleOptions {
                health_check_interval: Duration::from_secs(1),
                max_health_failures: 1,
            },
        );
        register(&manager, "echo").await;
        manager.start_server("echo").await.unwrap();

        let token = CancellationToken::new();
        let handle = manager.spawn_health_checks(token.clone());
        connector.refuse("echo");
        connector.kill("echo");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(
            manager.get_server_status("echo").await.unwrap(),
            ServerStatus::Disconnected
        );

        token.cancel();
        handle.await.unwrap();
    }
}
