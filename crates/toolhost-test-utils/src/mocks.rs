//! In-memory connector for testing pool, manager and registry code without
//! spawning processes.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use toolhost_mcp::{
    ClientOptions, Connected, Connector, McpClient, McpError, McpResult, StreamTransport,
    ToolServer, TransportConfig,
};

type ServerFactory = Arc<dyn Fn() -> ToolServer + Send + Sync>;

#[derive(Default)]
struct State {
    factories: HashMap<String, ServerFactory>,
    refused: HashSet<String>,
    connects: HashMap<String, usize>,
    live: HashMap<String, Vec<JoinHandle<()>>>,
}

/// A connector that serves each server id from an in-process [`ToolServer`]
/// over a duplex pipe.
///
/// # Example
///
/// ```rust
/// use toolhost_mcp::echo_server;
/// use toolhost_test_utils::mocks::MemoryConnector;
///
/// let connector = MemoryConnector::new().with_server("echo", echo_server);
/// assert_eq!(connector.connect_count("echo"), 0);
/// ```
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<State>>,
    options: ClientOptions,
    connect_delay: Option<Duration>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `id` from servers built by `factory`, one per connection.
    pub fn with_server<F>(self, id: &str, factory: F) -> Self
    where
        F: Fn() -> ToolServer + Send + Sync + 'static,
    {
        self.set_server(id, factory);
        self
    }

    /// Replace the factory for `id`; affects later connections only.
    pub fn set_server<F>(&self, id: &str, factory: F)
    where
        F: Fn() -> ToolServer + Send + Sync + 'static,
    {
        self.state
            .lock()
            .unwrap()
            .factories
            .insert(id.to_string(), Arc::new(factory));
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Sleep before every connect, widening race windows in tests.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Make future connects to `id` fail.
    pub fn refuse(&self, id: &str) {
        self.state.lock().unwrap().refused.insert(id.to_string());
    }

    pub fn allow(&self, id: &str) {
        self.state.lock().unwrap().refused.remove(id);
    }

    /// Kill every live server for `id`, as if its process exited.
    pub fn kill(&self, id: &str) {
        let handles = self
            .state
            .lock()
            .unwrap()
            .live
            .remove(id)
            .unwrap_or_default();
        for handle in handles {
            handle.abort();
        }
    }

    /// Number of connects attempted for `id`.
    pub fn connect_count(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connects
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, server_id: &str, _config: &TransportConfig) -> McpResult<McpClient> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        let factory = {
            let mut state = self.state.lock().unwrap();
            *state.connects.entry(server_id.to_string()).or_insert(0) += 1;
            if state.refused.contains(server_id) {
                return Err(McpError::connection_failed(format!(
                    "{server_id}: connection refused"
                )));
            }
            state.factories.get(server_id).cloned().ok_or_else(|| {
                McpError::ProcessError(format!("{server_id}: no such server"))
            })?
        };

        let (client_end, server_end) = tokio::io::duplex(256 * 1024);
        let (server_read, server_write) = tokio::io::split(server_end);
        let server = Arc::new(factory());
        let handle = tokio::spawn(async move {
            let _ = server.serve(server_read, server_write).await;
        });
        self.state
            .lock()
            .unwrap()
            .live
            .entry(server_id.to_string())
            .or_default()
            .push(handle);

        let (read, write) = tokio::io::split(client_end);
        let (transport, inbound) = StreamTransport::new(server_id, read, write);
        Ok(McpClient::new(
            server_id,
            Connected {
                transport: Arc::new(transport),
                inbound,
            },
            self.options.clone(),
        ))
    }
}
