//! Bounded pool of live server connections.
//!
//! The pool owns every [`McpClient`] it creates. Callers borrow clients as
//! `Arc`s; the pool decides when a connection is evicted and closed.
//!
//! - Creation is serialized per server id, so concurrent `create` calls for
//!   the same id share one handshake.
//! - At capacity, the least recently used connection is evicted before a new
//!   one is built.
//! - A maintenance loop reaps idle, unhealthy and disconnected entries.
//! - The map lock is never held across I/O; evicted clients are closed after
//!   it is released.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use toolhost_mcp::{methods, Connector, McpClient, McpError, McpResult, TransportConfig};
use tracing::{debug, info, warn};

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: usize,
    /// Unused connections older than this are reaped.
    pub idle_ttl: Duration,
    pub maintenance_interval: Duration,
    pub health_check_timeout: Duration,
    /// Consecutive failures before a connection is closed.
    pub max_consecutive_errors: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_ttl: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            max_consecutive_errors: 3,
        }
    }
}

struct Connection {
    client: Arc<McpClient>,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    consecutive_errors: u32,
}

impl Connection {
    fn new(client: Arc<McpClient>) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_used: now,
            healthy: true,
            consecutive_errors: 0,
        }
    }

    fn is_usable(&mut self) -> bool {
        if self.healthy && !self.client.is_connected() {
            self.healthy = false;
        }
        self.healthy
    }
}

/// Per-connection snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub server_id: String,
    pub healthy: bool,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub consecutive_errors: u32,
}

/// Pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub capacity: usize,
    pub healthy: usize,
    pub connections: Vec<ConnectionStats>,
}

type Evicted = Vec<(String, Arc<McpClient>)>;

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    connections: Mutex<HashMap<String, Connection>>,
    creating: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
        Self {
            connector,
            options,
            connections: Mutex::new(HashMap::new()),
            creating: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn key_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut creating = self
            .creating
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(creating.entry(server_id.to_string()).or_default())
    }

    /// A healthy connection for `server_id`, marking it used.
    pub async fn get(&self, server_id: &str) -> Option<Arc<McpClient>> {
        let mut connections = self.connections.lock().await;
        let conn = connections.get_mut(server_id)?;
        if !conn.is_usable() {
            debug!(server = %server_id, "Pooled connection is unhealthy");
            return None;
        }
        conn.last_used = Instant::now();
        Some(Arc::clone(&conn.client))
    }

    /// Return the existing healthy connection or build and initialize one.
    pub async fn create(
        &self,
        server_id: &str,
        transport: &TransportConfig,
    ) -> McpResult<Arc<McpClient>> {
        let key_lock = self.key_lock(server_id);
        let _creating = key_lock.lock().await;

        if let Some(client) = self.get(server_id).await {
            return Ok(client);
        }

        let evicted = {
            let mut connections = self.connections.lock().await;
            let mut evicted = Evicted::new();
            if let Some(stale) = connections.remove(server_id) {
                evicted.push((server_id.to_string(), stale.client));
            }
            evicted.extend(self.evict_to_fit(&mut connections, server_id));
            evicted
        };
        close_evicted(evicted).await;

        debug!(server = %server_id, transport = %transport.kind(), "Creating connection");
        let client = self.connector.connect(server_id, transport).await?;
        if let Err(e) = client.initialize().await {
            warn!(server = %server_id, error = %e, "Handshake failed");
            let _ = client.close().await;
            return Err(e);
        }
        let client = Arc::new(client);

        let evicted = {
            let mut connections = self.connections.lock().await;
            let evicted = self.evict_to_fit(&mut connections, server_id);
            connections.insert(server_id.to_string(), Connection::new(Arc::clone(&client)));
            evicted
        };
        close_evicted(evicted).await;

        info!(server = %server_id, "Connection established");
        Ok(client)
    }

    /// Remove least recently used entries until one more fits.
    fn evict_to_fit(&self, connections: &mut HashMap<String, Connection>, keep: &str) -> Evicted {
        let mut evicted = Evicted::new();
        while connections.len() >= self.options.max_connections {
            let Some(lru) = connections
                .iter()
                .filter(|(id, _)| id.as_str() != keep)
                .min_by_key(|(_, c)| c.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            if let Some(conn) = connections.remove(&lru) {
                info!(server = %lru, "Evicting least recently used connection");
                evicted.push((lru, conn.client));
            }
        }
        evicted
    }

    /// Close and remove the connection for `server_id`, if any.
    pub async fn close(&self, server_id: &str) -> bool {
        let key_lock = self.key_lock(server_id);
        let _creating = key_lock.lock().await;
        let removed = self.connections.lock().await.remove(server_id);
        match removed {
            Some(conn) => {
                close_evicted(vec![(server_id.to_string(), conn.client)]).await;
                true
            }
            None => false,
        }
    }

    /// Probe `server_id` with a cheap request.
    ///
    /// Returns `false` if the server is not pooled or the probe failed. After
    /// `max_consecutive_errors` failures the connection is closed.
    pub async fn health_check(&self, server_id: &str) -> bool {
        let client = {
            let connections = self.connections.lock().await;
            match connections.get(server_id) {
                Some(conn) => Arc::clone(&conn.client),
                None => return false,
            }
        };

        let timeout = self.options.health_check_timeout;
        let probe = if client.capabilities().is_some_and(|c| !c.supports_tools()) {
            client
                .send_request(methods::PING, None, timeout)
                .await
                .map(|_| ())
        } else {
            client.list_tools_within(timeout).await.map(|_| ())
        };

        match probe {
            Ok(()) => {
                let mut connections = self.connections.lock().await;
                if let Some(conn) = connections.get_mut(server_id) {
                    if Arc::ptr_eq(&conn.client, &client) {
                        conn.healthy = true;
                        conn.consecutive_errors = 0;
                    }
                }
                true
            }
            Err(e) => {
                warn!(server = %server_id, error = %e, "Health check failed");
                self.record_failure(server_id, &client, &e, false).await;
                false
            }
        }
    }

    /// Feed a failed call on `server_id` back into its health state.
    ///
    /// Connection-level errors evict immediately. Call-local errors
    /// (timeouts, error responses) leave the connection untouched.
    pub async fn report_failure(&self, server_id: &str, error: &McpError) {
        if !error.is_connection_error() {
            debug!(server = %server_id, error = %error, "Ignoring call-local failure");
            return;
        }
        let client = {
            let connections = self.connections.lock().await;
            match connections.get(server_id) {
                Some(conn) => Arc::clone(&conn.client),
                None => return,
            }
        };
        self.record_failure(server_id, &client, error, error.is_connection_error())
            .await;
    }

    pub async fn report_success(&self, server_id: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get_mut(server_id) {
            conn.consecutive_errors = 0;
            conn.last_used = Instant::now();
        }
    }

    async fn record_failure(
        &self,
        server_id: &str,
        client: &Arc<McpClient>,
        error: &McpError,
        evict_now: bool,
    ) {
        let evicted = {
            let mut connections = self.connections.lock().await;
            let Some(conn) = connections.get_mut(server_id) else {
                return;
            };
            if !Arc::ptr_eq(&conn.client, client) {
                return;
            }
            conn.consecutive_errors += 1;
            if error.is_connection_error() || !conn.client.is_connected() {
                conn.healthy = false;
            }
            let exhausted = conn.consecutive_errors >= self.options.max_consecutive_errors;
            if evict_now || exhausted {
                if exhausted {
                    warn!(
                        server = %server_id,
                        errors = conn.consecutive_errors,
                        "Too many consecutive errors, closing connection"
                    );
                }
                connections
                    .remove(server_id)
                    .map(|c| (server_id.to_string(), c.client))
            } else {
                None
            }
        };
        close_evicted(evicted.into_iter().collect()).await;
    }

    /// Evict idle, unhealthy and disconnected connections.
    ///
    /// Entries whose creation lock is held are left alone. Returns the ids
    /// that were removed.
    pub async fn run_maintenance(&self) -> Vec<String> {
        let now = Instant::now();
        let evicted = {
            let mut connections = self.connections.lock().await;
            let candidates: Vec<String> = connections
                .iter_mut()
                .filter_map(|(id, conn)| {
                    let idle = now.duration_since(conn.last_used) >= self.options.idle_ttl;
                    (idle || !conn.is_usable()).then(|| id.clone())
                })
                .collect();

            let mut evicted = Evicted::new();
            for id in candidates {
                let key_lock = self.key_lock(&id);
                let Ok(_creating) = key_lock.try_lock() else {
                    continue;
                };
                if let Some(conn) = connections.remove(&id) {
                    debug!(server = %id, healthy = conn.healthy, "Reaping connection");
                    evicted.push((id, conn.client));
                }
            }
            evicted
        };

        let ids = evicted.iter().map(|(id, _)| id.clone()).collect();
        close_evicted(evicted).await;
        ids
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every
    /// `maintenance_interval` until `token` is cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.options.maintenance_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = pool.run_maintenance().await;
                        if !evicted.is_empty() {
                            info!(count = evicted.len(), servers = ?evicted, "Pool maintenance evicted connections");
                        }
                    }
                }
            }
            debug!("Pool maintenance stopped");
        })
    }

    pub async fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let connections = self.connections.lock().await;
        let mut stats: Vec<ConnectionStats> = connections
            .iter()
            .map(|(id, conn)| ConnectionStats {
                server_id: id.clone(),
                healthy: conn.healthy && conn.client.is_connected(),
                age_ms: now.duration_since(conn.created_at).as_millis() as u64,
                idle_ms: now.duration_since(conn.last_used).as_millis() as u64,
                consecutive_errors: conn.consecutive_errors,
            })
            .collect();
        stats.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        PoolStats {
            size: stats.len(),
            capacity: self.options.max_connections,
            healthy: stats.iter().filter(|c| c.healthy).count(),
            connections: stats,
        }
    }

    pub async fn contains(&self, server_id: &str) -> bool {
        self.connections.lock().await.contains_key(server_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let evicted: Evicted = self
            .connections
            .lock()
            .await
            .drain()
            .map(|(id, c)| (id, c.client))
            .collect();
        info!(count = evicted.len(), "Closing all pooled connections");
        close_evicted(evicted).await;
        self.creating
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

async fn close_evicted(evicted: Evicted) {
    join_all(evicted.into_iter().map(|(id, client)| async move {
        if let Err(e) = client.close().await {
            debug!(server = %id, error = %e, "Error closing connection");
        }
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolhost_mcp::echo_server;
    use toolhost_test_utils::{memory_transport, MemoryConnector};

    fn pool_with(connector: &MemoryConnector, options: PoolOptions) -> ConnectionPool {
        ConnectionPool::new(Arc::new(connector.clone()), options)
    }

    fn echo_connector(ids: &[&str]) -> MemoryConnector {
        ids.iter()
            .fold(MemoryConnector::new(), |c, id| c.with_server(id, echo_server))
    }

    #[tokio::test]
    async fn test_create_reuses_connection() {
        let connector = echo_connector(&["a"]);
        let pool = pool_with(&connector, PoolOptions::default());

        let first = pool.create("a", &memory_transport()).await.unwrap();
        let second = pool.create("a", &memory_transport()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_initialized());
        assert_eq!(connector.connect_count("a"), 1);
        assert!(pool.get("a").await.is_some());
        assert!(pool.get("b").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_lru() {
        let connector = echo_connector(&["a", "b", "c"]);
        let pool = pool_with(
            &connector,
            PoolOptions {
                max_connections: 2,
                ..Default::default()
            },
        );

        let a = pool.create("a", &memory_transport()).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.create("b", &memory_transport()).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        // Touch "a" so "b" becomes least recently used.
        pool.get("a").await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;

        pool.create("c", &memory_transport()).await.unwrap();
        assert_eq!(pool.len().await, 2);
        assert!(pool.contains("a").await);
        assert!(!pool.contains("b").await);
        assert!(pool.contains("c").await);
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_create_shares_handshake() {
        let connector = echo_connector(&["a"]).with_connect_delay(Duration::from_millis(20));
        let pool = Arc::new(pool_with(&connector, PoolOptions::default()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.create("a", &memory_transport()).await })
            })
            .collect();
        let clients: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(connector.connect_count("a"), 1);
        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_failed_handshake_is_not_pooled() {
        let connector = MemoryConnector::new().with_server("mute", || {
            echo_server().silence(methods::INITIALIZE)
        });
        let connector = connector.with_options(toolhost_mcp::ClientOptions {
            init_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let pool = pool_with(&connector, PoolOptions::default());

        let err = pool.create("mute", &memory_transport()).await.unwrap_err();
        assert!(err.is_connection_error(), "{err:?}");
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_health_check_dead_process() {
        let connector = echo_connector(&["a"]);
        let pool = pool_with(&connector, PoolOptions::default());
        pool.create("a", &memory_transport()).await.unwrap();

        assert!(pool.health_check("a").await);

        connector.kill("a");
        assert!(!pool.health_check("a").await);
        assert!(pool.get("a").await.is_none());

        let evicted = pool.run_maintenance().await;
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(!pool.contains("a").await);
        assert!(!pool.health_check("a").await);
    }

    #[tokio::test]
    async fn test_health_check_failures_close_connection() {
        let connector = MemoryConnector::new()
            .with_server("slow", || echo_server().silence(methods::TOOLS_LIST));
        let pool = pool_with(
            &connector,
            PoolOptions {
                health_check_timeout: Duration::from_millis(20),
                max_consecutive_errors: 2,
                ..Default::default()
            },
        );
        pool.create("slow", &memory_transport()).await.unwrap();

        assert!(!pool.health_check("slow").await);
        assert!(pool.contains("slow").await);
        assert_eq!(pool.stats().await.connections[0].consecutive_errors, 1);

        assert!(!pool.health_check("slow").await);
        assert!(!pool.contains("slow").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_reaps_idle() {
        let connector = echo_connector(&["a", "b"]);
        let pool = pool_with(
            &connector,
            PoolOptions {
                idle_ttl: Duration::from_secs(60),
                ..Default::default()
            },
        );
        pool.create("a", &memory_transport()).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        pool.create("b", &memory_transport()).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(pool.run_maintenance().await, vec!["a".to_string()]);
        assert!(pool.contains("b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_loop_cancellable() {
        let connector = echo_connector(&["a"]);
        let pool = Arc::new(pool_with(
            &connector,
            PoolOptions {
                idle_ttl: Duration::from_secs(10),
                maintenance_interval: Duration::from_secs(5),
                ..Default::default()
            },
        ));
        pool.create("a", &memory_transport()).await.unwrap();

        let token = CancellationToken::new();
        let handle = pool.spawn_maintenance(token.clone());
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!pool.contains("a").await);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_only_connection_errors_evict() {
        let connector = echo_connector(&["a"]);
        let pool = pool_with(&connector, PoolOptions::default());
        pool.create("a", &memory_transport()).await.unwrap();

        let timeout = McpError::Timeout {
            method: methods::TOOLS_CALL.into(),
            timeout: Duration::from_millis(1),
        };
        for _ in 0..5 {
            pool.report_failure("a", &timeout).await;
        }
        let rpc = McpError::Rpc {
            code: -32602,
            message: "Unknown tool".into(),
            data: None,
        };
        for _ in 0..5 {
            pool.report_failure("a", &rpc).await;
            pool.report_failure("a", &McpError::MethodNotFound("x".into())).await;
        }
        assert!(pool.contains("a").await);
        assert_eq!(pool.stats().await.connections[0].consecutive_errors, 0);
        assert_eq!(connector.connect_count("a"), 1);

        pool.report_failure("a", &McpError::ConnectionClosed).await;
        assert!(!pool.contains("a").await);
    }

    #[tokio::test]
    async fn test_refused_connect_surfaces_error() {
        let connector = echo_connector(&["a"]);
        connector.refuse("a");
        let pool = pool_with(&connector, PoolOptions::default());
        assert!(pool.create("a", &memory_transport()).await.is_err());
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let connector = echo_connector(&["a", "b"]);
        let pool = pool_with(&connector, PoolOptions::default());
        let a = pool.create("a", &memory_transport()).await.unwrap();
        pool.create("b", &memory_transport()).await.unwrap();

        pool.shutdown().await;
        assert!(pool.is_empty().await);
        assert!(!a.is_connected());
    }
}
