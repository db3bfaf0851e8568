//! Tool catalog and executor.
//!
//! Tools discovered on running servers are merged into one catalog indexed
//! by name, server, category and tag. [`ToolRegistry::execute`] resolves a
//! tool to its server connection and tracks per-tool usage. A tool that
//! fails `error_threshold` times in a row is disabled (`Error`) until it is
//! rediscovered or reset.

use crate::category::{infer_tags, ToolCategory};
use crate::error::{CoreError, CoreResult};
use crate::manager::{ServerManager, ServerObserver};
use crate::security::{ExecutionEnvironment, InputValidator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use toolhost_mcp::Tool;
use toolhost_util::TimingGuard;
use tracing::{debug, error, info, warn};

/// Availability of a registered tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    #[default]
    Available,
    /// The owning server stopped advertising it or went away.
    Unavailable,
    /// Disabled after repeated failures.
    Error,
    /// Disabled by an operator. Survives rediscovery.
    Deprecated,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ToolStatus::Available => "available",
            ToolStatus::Unavailable => "unavailable",
            ToolStatus::Error => "error",
            ToolStatus::Deprecated => "deprecated",
        })
    }
}

/// A tool in the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTool {
    /// Catalog key. Equal to `remote_name` unless another server already
    /// owned that name, in which case it is `<server_id>.<remote_name>`.
    pub name: String,
    /// Name the server knows the tool by.
    pub remote_name: String,
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    pub category: ToolCategory,
    pub tags: Vec<String>,
    pub status: ToolStatus,
    /// Successful calls.
    pub call_count: u64,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Call timeout inherited from the server config, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub registered_at: DateTime<Utc>,
}

impl RegisteredTool {
    fn new(name: String, server_id: &str, tool: &Tool, timeout_ms: Option<u64>) -> Self {
        let category = ToolCategory::infer(&tool.name, tool.description.as_deref());
        Self {
            name,
            remote_name: tool.name.clone(),
            server_id: server_id.to_string(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
            category,
            tags: infer_tags(&tool.name, category),
            status: ToolStatus::Available,
            call_count: 0,
            consecutive_errors: 0,
            total_errors: 0,
            last_used: None,
            last_error: None,
            timeout_ms,
            registered_at: Utc::now(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_available(&self) -> bool {
        self.status == ToolStatus::Available
    }
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub discovery_interval: Duration,
    /// Consecutive failures that disable a tool.
    pub error_threshold: u32,
    /// Call timeout when neither the caller nor the server config sets one.
    pub default_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(300),
            error_threshold: 5,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of merging one or more server tool lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    /// Known tools the server no longer advertises.
    pub missing: Vec<String>,
    /// Servers whose tool list could not be fetched.
    pub failed: Vec<String>,
}

impl DiscoveryReport {
    fn absorb(&mut self, other: DiscoveryReport) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.missing.extend(other.missing);
        self.failed.extend(other.failed);
    }
}

/// Bookkeeping attached to every execution result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetadata {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub call_count: u64,
    pub consecutive_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolStatus>,
}

/// Result of [`ToolRegistry::execute`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// The tool call result as sent by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Protocol error code; absent when the tool itself reported the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    fn rejected(metadata: ExecutionMetadata, error: CoreError, duration: Duration) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
            error_code: Some(error.code().code()),
            duration,
            metadata,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error_code == Some(toolhost_mcp::ErrorCode::Timeout.code())
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// A search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub tool: RegisteredTool,
    pub score: u32,
}

type Entry = Arc<Mutex<RegisteredTool>>;

#[derive(Default)]
struct Catalog {
    tools: HashMap<String, Entry>,
    /// `(server_id, remote_name)` to catalog key.
    remote: HashMap<(String, String), String>,
    by_server: HashMap<String, BTreeSet<String>>,
    by_category: HashMap<ToolCategory, BTreeSet<String>>,
    by_tag: HashMap<String, BTreeSet<String>>,
}

impl Catalog {
    fn insert(&mut self, tool: RegisteredTool) {
        let key = tool.name.clone();
        self.remote
            .insert((tool.server_id.clone(), tool.remote_name.clone()), key.clone());
        self.by_server
            .entry(tool.server_id.clone())
            .or_default()
            .insert(key.clone());
        self.index_labels(&key, tool.category, &tool.tags);
        self.tools.insert(key, Arc::new(Mutex::new(tool)));
    }

    fn index_labels(&mut self, key: &str, category: ToolCategory, tags: &[String]) {
        self.by_category
            .entry(category)
            .or_default()
            .insert(key.to_string());
        for tag in tags {
            self.by_tag.entry(tag.clone()).or_default().insert(key.to_string());
        }
    }

    fn unindex_labels(&mut self, key: &str, category: ToolCategory, tags: &[String]) {
        remove_from(&mut self.by_category, &category, key);
        for tag in tags {
            remove_from(&mut self.by_tag, tag, key);
        }
    }

    /// Remove `key` and return the entry.
    async fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.tools.remove(key)?;
        let tool = entry.lock().await;
        self.remote
            .remove(&(tool.server_id.clone(), tool.remote_name.clone()));
        remove_from(&mut self.by_server, &tool.server_id, key);
        self.unindex_labels(key, tool.category, &tool.tags);
        drop(tool);
        Some(entry)
    }

    fn entries(&self, keys: Option<&BTreeSet<String>>) -> Vec<Entry> {
        keys.into_iter()
            .flatten()
            .filter_map(|key| self.tools.get(key).cloned())
            .collect()
    }
}

fn remove_from<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<String>>,
    label: &K,
    key: &str,
) {
    if let Some(keys) = index.get_mut(label) {
        keys.remove(key);
        if keys.is_empty() {
            index.remove(label);
        }
    }
}

async fn snapshot(entries: Vec<Entry>) -> Vec<RegisteredTool> {
    let mut tools = Vec::with_capacity(entries.len());
    for entry in entries {
        tools.push(entry.lock().await.clone());
    }
    tools.sort_by(|a, b| a.name.cmp(&b.name));
    tools
}

pub struct ToolRegistry {
    manager: Arc<ServerManager>,
    validator: InputValidator,
    environment: ExecutionEnvironment,
    options: RegistryOptions,
    catalog: RwLock<Catalog>,
}

impl ToolRegistry {
    pub fn new(
        manager: Arc<ServerManager>,
        validator: InputValidator,
        environment: ExecutionEnvironment,
        options: RegistryOptions,
    ) -> Self {
        Self {
            manager,
            validator,
            environment,
            options,
            catalog: RwLock::new(Catalog::default()),
        }
    }

    /// Subscribe to the manager so started servers are merged and stopped
    /// servers dropped automatically.
    pub fn attach(self: &Arc<Self>) {
        let observer: Arc<dyn ServerObserver> = Arc::clone(self) as Arc<dyn ServerObserver>;
        self.manager.set_observer(Arc::downgrade(&observer));
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Fetch tool lists from `server_id`, or from every running server, and
    /// merge them.
    ///
    /// With an explicit server a fetch failure is an error; otherwise failed
    /// servers are listed in the report.
    pub async fn discover(&self, server_id: Option<&str>) -> CoreResult<DiscoveryReport> {
        let ids = match server_id {
            Some(id) => vec![id.to_string()],
            None => self.manager.running_servers().await,
        };

        let mut report = DiscoveryReport::default();
        for id in ids {
            match self.manager.refresh_tools(&id).await {
                Ok(tools) => report.absorb(self.merge(&id, &tools).await),
                Err(e) if server_id.is_some() => return Err(e),
                Err(e) => {
                    warn!(server = %id, error = %e, "Tool discovery failed");
                    report.failed.push(id);
                }
            }
        }
        debug!(
            added = report.added.len(),
            updated = report.updated.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Discovery complete"
        );
        Ok(report)
    }

    /// Merge the tools `server_id` currently advertises.
    pub async fn merge(&self, server_id: &str, tools: &[Tool]) -> DiscoveryReport {
        let timeout_ms = self
            .manager
            .get_server(server_id)
            .await
            .and_then(|d| d.timeout_ms);

        let mut report = DiscoveryReport::default();
        let mut seen = HashSet::new();
        let mut catalog = self.catalog.write().await;

        for tool in tools {
            let existing = catalog
                .remote
                .get(&(server_id.to_string(), tool.name.clone()))
                .cloned();

            if let Some(key) = existing {
                let Some(entry) = catalog.tools.get(&key).cloned() else {
                    continue;
                };
                let mut registered = entry.lock().await;
                let category = ToolCategory::infer(&tool.name, tool.description.as_deref());
                let tags = infer_tags(&tool.name, category);
                if category != registered.category || tags != registered.tags {
                    catalog.unindex_labels(&key, registered.category, &registered.tags);
                    catalog.index_labels(&key, category, &tags);
                    registered.category = category;
                    registered.tags = tags;
                }
                registered.description = tool.description.clone();
                registered.input_schema = tool.input_schema.clone();
                registered.timeout_ms = timeout_ms;
                registered.consecutive_errors = 0;
                if registered.status != ToolStatus::Deprecated {
                    registered.status = ToolStatus::Available;
                }
                drop(registered);
                seen.insert(key.clone());
                report.updated.push(key);
                continue;
            }

            let key = if catalog.tools.contains_key(&tool.name) {
                format!("{server_id}.{}", tool.name)
            } else {
                tool.name.clone()
            };
            if catalog.tools.contains_key(&key) {
                warn!(server = %server_id, tool = %tool.name, "Tool name already taken, skipping");
                continue;
            }
            if key != tool.name {
                info!(server = %server_id, tool = %tool.name, registered_as = %key, "Tool name collision");
            }
            catalog.insert(RegisteredTool::new(key.clone(), server_id, tool, timeout_ms));
            seen.insert(key.clone());
            report.added.push(key);
        }

        let owned = catalog.entries(catalog.by_server.get(server_id));
        for entry in owned {
            let mut registered = entry.lock().await;
            if seen.contains(&registered.name) {
                continue;
            }
            if registered.status != ToolStatus::Deprecated {
                registered.status = ToolStatus::Unavailable;
            }
            report.missing.push(registered.name.clone());
        }

        report.added.sort();
        report.updated.sort();
        report.missing.sort();
        report
    }

    /// Run [`discover`](Self::discover) over all servers every
    /// `discovery_interval` until `token` is cancelled.
    pub fn spawn_discovery(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.options.discovery_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = registry.discover(None).await {
                            error!(error = %e, "Periodic discovery failed");
                        }
                    }
                }
            }
            debug!("Discovery stopped");
        })
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Call a tool. Never fails; errors are reported in the result.
    ///
    /// The timeout is `timeout`, else the server's configured timeout, else
    /// the registry default.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        let timing = TimingGuard::tool(name);
        let mut metadata = ExecutionMetadata {
            tool: name.to_string(),
            ..Default::default()
        };

        let entry = self.catalog.read().await.tools.get(name).cloned();
        let Some(entry) = entry else {
            return ExecutionResult::rejected(
                metadata,
                CoreError::ToolNotFound(name.to_string()),
                timing.elapsed(),
            );
        };

        let (server_id, remote_name, tool_timeout) = {
            let tool = entry.lock().await;
            metadata.server_id = Some(tool.server_id.clone());
            metadata.call_count = tool.call_count;
            metadata.consecutive_errors = tool.consecutive_errors;
            metadata.status = Some(tool.status);
            if !tool.is_available() {
                debug!(tool = %name, status = %tool.status, "Rejecting call to unavailable tool");
                let error = CoreError::ToolUnavailable {
                    name: name.to_string(),
                    status: tool.status.to_string(),
                };
                return ExecutionResult::rejected(metadata, error, timing.elapsed());
            }
            (tool.server_id.clone(), tool.remote_name.clone(), tool.timeout())
        };

        let screened = self
            .environment
            .ensure_supported()
            .and_then(|()| self.validator.validate(&arguments));
        if let Err(e) = screened {
            warn!(tool = %name, error = %e, "Call rejected before dispatch");
            return ExecutionResult::rejected(metadata, e, timing.elapsed());
        }

        let client = match self.manager.connection(&server_id).await {
            Ok(client) => client,
            Err(e) => {
                let metadata = self.record_failure(&entry, &e.to_string()).await;
                return ExecutionResult::rejected(metadata, e, timing.elapsed());
            }
        };

        let timeout = timeout
            .or(tool_timeout)
            .unwrap_or(self.options.default_timeout);
        debug!(tool = %name, server = %server_id, timeout_ms = timeout.as_millis() as u64, "Executing tool");

        match client
            .call_tool_with_timeout(&remote_name, arguments, timeout)
            .await
        {
            Ok(result) if !result.is_error => {
                self.manager.pool().report_success(&server_id).await;
                let metadata = self.record_success(&entry).await;
                ExecutionResult {
                    success: true,
                    result: serde_json::to_value(&result).ok(),
                    error: None,
                    error_code: None,
                    duration: timing.elapsed(),
                    metadata,
                }
            }
            Ok(result) => {
                let message = result.text_content();
                let metadata = self.record_failure(&entry, &message).await;
                ExecutionResult {
                    success: false,
                    result: serde_json::to_value(&result).ok(),
                    error: Some(message),
                    error_code: None,
                    duration: timing.elapsed(),
                    metadata,
                }
            }
            Err(e) => {
                // Timeouts and error responses belong to this call only.
                if e.is_connection_error() {
                    self.manager.pool().report_failure(&server_id, &e).await;
                }
                let metadata = self.record_failure(&entry, &e.to_string()).await;
                ExecutionResult::rejected(metadata, e.into(), timing.elapsed())
            }
        }
    }

    async fn record_success(&self, entry: &Entry) -> ExecutionMetadata {
        let mut tool = entry.lock().await;
        tool.call_count += 1;
        tool.consecutive_errors = 0;
        tool.last_used = Some(Utc::now());
        metadata_of(&tool)
    }

    async fn record_failure(&self, entry: &Entry, message: &str) -> ExecutionMetadata {
        let mut tool = entry.lock().await;
        tool.consecutive_errors += 1;
        tool.total_errors += 1;
        tool.last_used = Some(Utc::now());
        tool.last_error = Some(message.to_string());
        if tool.consecutive_errors >= self.options.error_threshold
            && tool.status == ToolStatus::Available
        {
            tool.status = ToolStatus::Error;
            warn!(
                tool = %tool.name,
                server = %tool.server_id,
                errors = tool.consecutive_errors,
                "Tool disabled after repeated failures"
            );
        }
        metadata_of(&tool)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get(&self, name: &str) -> Option<RegisteredTool> {
        let entry = self.catalog.read().await.tools.get(name).cloned()?;
        let tool = entry.lock().await.clone();
        Some(tool)
    }

    /// All tools sorted by name.
    pub async fn list(&self) -> Vec<RegisteredTool> {
        let entries: Vec<Entry> = self.catalog.read().await.tools.values().cloned().collect();
        snapshot(entries).await
    }

    pub async fn list_by_server(&self, server_id: &str) -> Vec<RegisteredTool> {
        let entries = {
            let catalog = self.catalog.read().await;
            catalog.entries(catalog.by_server.get(server_id))
        };
        snapshot(entries).await
    }

    pub async fn list_by_category(&self, category: ToolCategory) -> Vec<RegisteredTool> {
        let entries = {
            let catalog = self.catalog.read().await;
            catalog.entries(catalog.by_category.get(&category))
        };
        snapshot(entries).await
    }

    pub async fn list_by_tag(&self, tag: &str) -> Vec<RegisteredTool> {
        let entries = {
            let catalog = self.catalog.read().await;
            catalog.entries(catalog.by_tag.get(&tag.to_lowercase()))
        };
        snapshot(entries).await
    }

    /// Rank tools by weighted substring matches of each query term.
    ///
    /// Per term: exact name 20, name substring 10, description 5, each tag 3.
    /// An empty query returns every tool with score 0.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let mut hits: Vec<SearchResult> = self
            .list()
            .await
            .into_iter()
            .filter_map(|tool| {
                let score = score(&tool, &terms);
                (terms.is_empty() || score > 0).then_some(SearchResult { tool, score })
            })
            .collect();
        hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.tool.name.cmp(&b.tool.name)));
        hits.truncate(limit);
        hits
    }

    pub async fn len(&self) -> usize {
        self.catalog.read().await.tools.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Clear a tool's error state and make it available again.
    pub async fn reset_tool(&self, name: &str) -> CoreResult<()> {
        let entry = self.entry(name).await?;
        let mut tool = entry.lock().await;
        tool.status = ToolStatus::Available;
        tool.consecutive_errors = 0;
        tool.last_error = None;
        info!(tool = %name, "Tool reset");
        Ok(())
    }

    pub async fn set_deprecated(&self, name: &str, deprecated: bool) -> CoreResult<()> {
        let entry = self.entry(name).await?;
        let mut tool = entry.lock().await;
        tool.status = if deprecated {
            ToolStatus::Deprecated
        } else {
            ToolStatus::Available
        };
        Ok(())
    }

    /// Drop every tool owned by `server_id`. Returns the removed names.
    pub async fn remove_server(&self, server_id: &str) -> Vec<String> {
        let mut catalog = self.catalog.write().await;
        let keys: Vec<String> = catalog
            .by_server
            .get(server_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            catalog.remove(key).await;
        }
        if !keys.is_empty() {
            info!(server = %server_id, count = keys.len(), "Removed server tools");
        }
        keys
    }

    /// Mark every tool owned by `server_id` unavailable, keeping its stats.
    pub async fn mark_server_unavailable(&self, server_id: &str) {
        let entries = {
            let catalog = self.catalog.read().await;
            catalog.entries(catalog.by_server.get(server_id))
        };
        for entry in entries {
            let mut tool = entry.lock().await;
            if tool.status != ToolStatus::Deprecated {
                tool.status = ToolStatus::Unavailable;
            }
        }
    }

    pub async fn clear(&self) {
        *self.catalog.write().await = Catalog::default();
    }

    async fn entry(&self, name: &str) -> CoreResult<Entry> {
        self.catalog
            .read()
            .await
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::ToolNotFound(name.to_string()))
    }
}

#[async_trait]
impl ServerObserver for ToolRegistry {
    async fn server_discovered(&self, server_id: &str, tools: &[Tool]) {
        self.merge(server_id, tools).await;
    }

    async fn server_stopped(&self, server_id: &str) {
        self.remove_server(server_id).await;
    }

    async fn server_disconnected(&self, server_id: &str) {
        self.mark_server_unavailable(server_id).await;
    }
}

fn metadata_of(tool: &RegisteredTool) -> ExecutionMetadata {
    ExecutionMetadata {
        tool: tool.name.clone(),
        server_id: Some(tool.server_id.clone()),
        call_count: tool.call_count,
        consecutive_errors: tool.consecutive_errors,
        status: Some(tool.status),
    }
}

fn score(tool: &RegisteredTool, terms: &[String]) -> u32 {
    let name = tool.name.to_lowercase();
    let description = tool
        .description
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();
    terms
        .iter()
        .map(|term| {
            let name_score = if name == *term {
                20
            } else if name.contains(term.as_str()) {
                10
            } else {
                0
            };
            let description_score = if description.contains(term.as_str()) { 5 } else { 0 };
            let tag_score = tool.tags.iter().filter(|t| t.contains(term.as_str())).count() as u32 * 3;
            name_score + description_score + tag_score
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LifecycleOptions;
    use crate::pool::{ConnectionPool, PoolOptions};
    use crate::server::ServerDescriptor;
    use serde_json::json;
    use toolhost_mcp::{echo_server, ToolServer};
    use toolhost_test_utils::{fixtures, memory_transport, MemoryConnector};

    struct Harness {
        connector: MemoryConnector,
        manager: Arc<ServerManager>,
        registry: Arc<ToolRegistry>,
    }

    impl Harness {
        fn new(connector: MemoryConnector) -> Self {
            Self::with_options(connector, RegistryOptions::default())
        }

        fn with_options(connector: MemoryConnector, options: RegistryOptions) -> Self {
            let pool = Arc::new(ConnectionPool::new(
                Arc::new(connector.clone()),
                PoolOptions::default(),
            ));
            let manager = Arc::new(ServerManager::new(pool, LifecycleOptions::default()));
            let registry = Arc::new(ToolRegistry::new(
                Arc::clone(&manager),
                InputValidator::default(),
                ExecutionEnvironment::Host,
                options,
            ));
            registry.attach();
            Self {
                connector,
                manager,
                registry,
            }
        }

        async fn start(&self, id: &str) {
            self.manager
                .register_server(ServerDescriptor::new(id, memory_transport()))
                .await
                .unwrap();
            self.manager.start_server(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_merges_tools() {
        let h = Harness::new(MemoryConnector::new().with_server("echo", echo_server));
        h.start("echo").await;

        let tool = h.registry.get("echo").await.unwrap();
        assert_eq!(tool.server_id, "echo");
        assert_eq!(tool.status, ToolStatus::Available);
        assert_eq!(tool.category, ToolCategory::General);

        let report = h.registry.discover(None).await.unwrap();
        assert_eq!(report.updated, vec!["echo"]);
        assert!(report.added.is_empty());
    }

    #[tokio::test]
    async fn test_execute_echoes_arguments() {
        let h = Harness::new(MemoryConnector::new().with_server("echo", echo_server));
        h.start("echo").await;

        let result = h.registry.execute("echo", json!({"x": 1}), None).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.result.as_ref().unwrap()["structuredContent"], json!({"x": 1}));
        assert_eq!(result.metadata.call_count, 1);
        assert_eq!(result.metadata.server_id.as_deref(), Some("echo"));

        let serialized = serde_json::to_value(&result).unwrap();
        assert!(serialized["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let h = Harness::new(MemoryConnector::new());
        let result = h.registry.execute("nope", json!({}), None).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(toolhost_mcp::ErrorCode::MethodNotFound.code()));
    }

    #[tokio::test]
    async fn test_timeout_counts_one_error() {
        let h = Harness::new(MemoryConnector::new().with_server("slow", fixtures::silent_server));
        h.start("slow").await;

        let started = std::time::Instant::now();
        let result = h
            .registry
            .execute("echo", json!({}), Some(Duration::from_millis(100)))
            .await;
        assert!(result.is_timeout(), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.metadata.consecutive_errors, 1);
        assert_eq!(h.registry.get("echo").await.unwrap().consecutive_errors, 1);
        // A timeout leaves the connection pooled.
        assert!(h.manager.pool().contains("slow").await);
    }

    #[tokio::test]
    async fn test_auto_disable_after_threshold() {
        let h = Harness::new(MemoryConnector::new().with_server("failing", fixtures::failing_server));
        h.start("failing").await;

        for attempt in 1..=5 {
            let result = h.registry.execute("broken", json!({}), None).await;
            assert!(!result.success);
            assert!(result.error_code.is_none());
            assert_eq!(result.metadata.consecutive_errors, attempt);
        }
        let tool = h.registry.get("broken").await.unwrap();
        assert_eq!(tool.status, ToolStatus::Error);
        assert_eq!(tool.call_count, 0);

        // The sixth call is rejected without reaching the server.
        let result = h.registry.execute("broken", json!({}), None).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(toolhost_mcp::ErrorCode::ServerError.code()));
        assert_eq!(h.registry.get("broken").await.unwrap().total_errors, 5);

        // Rediscovery heals it.
        h.registry.discover(Some("failing")).await.unwrap();
        let tool = h.registry.get("broken").await.unwrap();
        assert_eq!(tool.status, ToolStatus::Available);
        assert_eq!(tool.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_success_resets_error_counter() {
        let h = Harness::new(MemoryConnector::new().with_server("echo", echo_server));
        h.start("echo").await;

        let failed = h.registry.execute("echo", json!({"fail": true}), None).await;
        assert!(!failed.success);
        assert_eq!(failed.metadata.consecutive_errors, 1);

        let ok = h.registry.execute("echo", json!({}), None).await;
        assert!(ok.success);
        assert_eq!(ok.metadata.consecutive_errors, 0);
        let tool = h.registry.get("echo").await.unwrap();
        assert_eq!(tool.total_errors, 1);
        assert_eq!(tool.call_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_do_not_lose_updates() {
        let h = Harness::new(MemoryConnector::new().with_server("echo", echo_server));
        h.start("echo").await;

        let calls = (0..20).map(|i| h.registry.execute("echo", json!({ "i": i }), None));
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(h.registry.get("echo").await.unwrap().call_count, 20);
    }

    #[tokio::test]
    async fn test_blocked_input_not_counted() {
        let h = Harness::new(MemoryConnector::new().with_server("echo", echo_server));
        h.start("echo").await;

        let result = h
            .registry
            .execute("echo", json!({"path": "../../etc/passwd"}), None)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(toolhost_mcp::ErrorCode::InvalidParams.code()));
        assert_eq!(h.registry.get("echo").await.unwrap().consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_sandbox_environment_not_implemented() {
        let connector = MemoryConnector::new().with_server("echo", echo_server);
        let pool = Arc::new(ConnectionPool::new(Arc::new(connector), PoolOptions::default()));
        let manager = Arc::new(ServerManager::new(pool, LifecycleOptions::default()));
        let registry = Arc::new(ToolRegistry::new(
            Arc::clone(&manager),
            InputValidator::default(),
            ExecutionEnvironment::Sandbox,
            RegistryOptions::default(),
        ));
        registry.attach();
        manager
            .register_server(ServerDescriptor::new("echo", memory_transport()))
            .await
            .unwrap();
        manager.start_server("echo").await.unwrap();

        let result = registry.execute("echo", json!({}), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not implemented"));
    }

    #[tokio::test]
    async fn test_name_collision_is_qualified() {
        let connector = MemoryConnector::new()
            .with_server("a", echo_server)
            .with_server("b", echo_server);
        let h = Harness::new(connector);
        h.start("a").await;
        h.start("b").await;

        let names: Vec<String> = h.registry.list().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["b.echo", "echo"]);
        let qualified = h.registry.get("b.echo").await.unwrap();
        assert_eq!(qualified.remote_name, "echo");

        let result = h.registry.execute("b.echo", json!({"y": 2}), None).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.metadata.server_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_missing_tools_become_unavailable() {
        let h = Harness::new(MemoryConnector::new().with_server("fs", || {
            fixtures::tools_server("fs", &[("read_file", "Read a file"), ("write_file", "Write a file")])
        }));
        h.start("fs").await;
        assert_eq!(h.registry.len().await, 2);

        h.connector.set_server("fs", || {
            fixtures::tools_server("fs", &[("read_file", "Read a file")])
        });
        // Stopping drops the server's tools, so a restart starts clean.
        h.manager.restart_server("fs").await.unwrap();
        assert!(h.registry.get("write_file").await.is_none());

        // A server that stops advertising a tool flags it on rediscovery.
        h.connector.set_server("fs", || ToolServer::new("fs"));
        h.manager.pool().close("fs").await;
        let report = h.registry.discover(Some("fs")).await.unwrap();
        assert_eq!(report.missing, vec!["read_file"]);
        let tool = h.registry.get("read_file").await.unwrap();
        assert_eq!(tool.status, ToolStatus::Unavailable);
        assert!(!h.registry.execute("read_file", json!({}), None).await.success);
    }

    #[tokio::test]
    async fn test_indices_and_search() {
        let h = Harness::new(MemoryConnector::new().with_server("mixed", || {
            fixtures::tools_server(
                "mixed",
                &[
                    ("read_file", "Read a file from disk"),
                    ("fetch_url", "Fetch a web page"),
                    ("search_files", "Find files matching a pattern"),
                ],
            )
        }));
        h.start("mixed").await;

        assert_eq!(h.registry.list_by_server("mixed").await.len(), 3);
        let fs: Vec<String> = h
            .registry
            .list_by_category(ToolCategory::Filesystem)
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(fs, vec!["read_file"]);
        assert_eq!(h.registry.list_by_tag("url").await[0].name, "fetch_url");

        let hits = h.registry.search("file", 10).await;
        assert_eq!(hits[0].tool.name, "read_file");
        assert!(hits.iter().all(|hit| hit.tool.name != "fetch_url"));

        let exact = h.registry.search("fetch_url", 10).await;
        assert_eq!(exact[0].tool.name, "fetch_url");
        assert!(exact[0].score >= 20);

        assert_eq!(h.registry.search("", 2).await.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_removes_and_disconnect_marks_unavailable() {
        let h = Harness::new(MemoryConnector::new().with_server("echo", echo_server));
        h.start("echo").await;

        h.registry.server_disconnected("echo").await;
        assert_eq!(h.registry.get("echo").await.unwrap().status, ToolStatus::Unavailable);

        h.manager.stop_server("echo").await.unwrap();
        assert!(h.registry.get("echo").await.is_none());
        assert!(h.registry.list_by_tag("echo").await.is_empty());
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_deprecated_survives_discovery() {
        let h = Harness::new(MemoryConnector::new().with_server("echo", echo_server));
        h.start("echo").await;

        h.registry.set_deprecated("echo", true).await.unwrap();
        h.registry.discover(None).await.unwrap();
        assert_eq!(h.registry.get("echo").await.unwrap().status, ToolStatus::Deprecated);
        assert!(!h.registry.execute("echo", json!({}), None).await.success);

        h.registry.reset_tool("echo").await.unwrap();
        assert!(h.registry.execute("echo", json!({}), None).await.success);
        assert!(h.registry.reset_tool("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_dead_server_call_evicts_connection() {
        let h = Harness::with_options(
            MemoryConnector::new().with_server("echo", echo_server),
            RegistryOptions {
                default_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        h.start("echo").await;

        h.connector.refuse("echo");
        h.connector.kill("echo");
        let result = h.registry.execute("echo", json!({}), None).await;
        assert!(!result.success);
        assert_eq!(result.metadata.consecutive_errors, 1);
        assert!(!h.manager.pool().contains("echo").await);
    }

    #[tokio::test]
    async fn test_timeouts_do_not_disturb_inflight_calls() {
        let h = Harness::new(MemoryConnector::new().with_server("echo", echo_server));
        h.start("echo").await;
        let before = h.manager.pool().get("echo").await.unwrap();

        let slow = {
            let registry = Arc::clone(&h.registry);
            tokio::spawn(async move {
                registry
                    .execute("echo", json!({"delay_ms": 1500}), Some(Duration::from_secs(5)))
                    .await
            })
        };

        for _ in 0..3 {
            let result = h
                .registry
                .execute("echo", json!({"delay_ms": 10_000}), Some(Duration::from_millis(100)))
                .await;
            assert!(result.is_timeout(), "{result:?}");
        }
        assert!(h.manager.pool().contains("echo").await);

        let slow = slow.await.unwrap();
        assert!(slow.success, "{slow:?}");
        assert_eq!(slow.metadata.consecutive_errors, 0);

        let after = h.manager.pool().get("echo").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(h.connector.connect_count("echo"), 1);
    }

    #[tokio::test]
    async fn test_error_responses_keep_connection() {
        let h = Harness::new(MemoryConnector::new().with_server("rejecting", fixtures::rejecting_server));
        h.start("rejecting").await;
        let before = h.manager.pool().get("rejecting").await.unwrap();

        for _ in 0..4 {
            let result = h.registry.execute("strict", json!({}), None).await;
            assert!(!result.success);
            assert_eq!(
                result.error_code,
                Some(toolhost_mcp::ErrorCode::InvalidParams.code())
            );
        }

        let tool = h.registry.get("strict").await.unwrap();
        assert_eq!(tool.consecutive_errors, 4);
        assert_eq!(tool.status, ToolStatus::Available);

        let after = h.manager.pool().get("rejecting").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(h.connector.connect_count("rejecting"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_loop() {
        let h = Harness::with_options(
            MemoryConnector::new().with_server("echo", echo_server),
            RegistryOptions {
                discovery_interval: Duration::from_secs(10),
                ..Default::default()
            },
        );
        h.start("echo").await;
        h.registry.clear().await;

        let token = CancellationToken::new();
        let handle = h.registry.spawn_discovery(token.clone());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(h.registry.get("echo").await.is_some());

        token.cancel();
        handle.await.unwrap();
    }
}
