//! Configuration management for toolhost.
//!
//! Configuration is loaded from multiple sources and merged:
//! 1. Global config: `~/.config/toolhost/toolhost.jsonc` (or `toolhost.json`, `config.json`)
//! 2. Environment variable: `TOOLHOST_CONFIG_CONTENT`
//! 3. Project config: `toolhost.jsonc` or `toolhost.json` in the project directory
//! 4. An explicit file passed with `--config`
//!
//! Supports JSONC (JSON with comments) and variable substitution:
//! - `{env:VAR_NAME}` - Substitute environment variable
//! - `{file:path}` - Substitute file contents (relative to the config file)

use crate::error::{ConfigError, CoreResult};
use crate::manager::LifecycleOptions;
use crate::pool::PoolOptions;
use crate::registry::RegistryOptions;
use crate::security::{
    ExecutionEnvironment, InputValidator, DEFAULT_BLOCKED_PATTERNS, DEFAULT_MAX_ARGUMENT_BYTES,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use toolhost_mcp::{ClientOptions, ProcessConfig, TransportConfig, TransportConnector};
use toolhost_util::LogLevel;

/// Environment variable holding inline config content.
pub const CONFIG_CONTENT_ENV: &str = "TOOLHOST_CONFIG_CONTENT";

const GLOBAL_FILE_NAMES: &[&str] = &["toolhost.jsonc", "toolhost.json", "config.json"];
const PROJECT_FILE_NAMES: &[&str] = &["toolhost.jsonc", "toolhost.json"];

static VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn var_regex() -> &'static regex::Regex {
    VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\{(env|file):([^}]+)\}")
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON Schema reference.
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Log level for the workspace crates (`trace` .. `error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityConfig>,

    /// Tool servers keyed by id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<HashMap<String, ServerConfig>>,
}

/// Connection pool settings. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_ttl_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_errors: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,
}

impl PoolConfig {
    pub fn merge(self, other: Self) -> Self {
        Self {
            max_connections: other.max_connections.or(self.max_connections),
            idle_ttl_ms: other.idle_ttl_ms.or(self.idle_ttl_ms),
            maintenance_interval_ms: other.maintenance_interval_ms.or(self.maintenance_interval_ms),
            health_check_timeout_ms: other.health_check_timeout_ms.or(self.health_check_timeout_ms),
            max_consecutive_errors: other.max_consecutive_errors.or(self.max_consecutive_errors),
            init_timeout_ms: other.init_timeout_ms.or(self.init_timeout_ms),
            shutdown_grace_ms: other.shutdown_grace_ms.or(self.shutdown_grace_ms),
        }
    }
}

/// Server lifecycle settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_health_failures: Option<u32>,
}

impl LifecycleConfig {
    pub fn merge(self, other: Self) -> Self {
        Self {
            health_check_interval_ms: other
                .health_check_interval_ms
                .or(self.health_check_interval_ms),
            max_health_failures: other.max_health_failures.or(self.max_health_failures),
        }
    }
}

/// Tool registry settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_interval_ms: Option<u64>,
    /// Consecutive failures before a tool is disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
}

impl RegistryConfig {
    pub fn merge(self, other: Self) -> Self {
        Self {
            discovery_interval_ms: other.discovery_interval_ms.or(self.discovery_interval_ms),
            error_threshold: other.error_threshold.or(self.error_threshold),
            default_timeout_ms: other.default_timeout_ms.or(self.default_timeout_ms),
        }
    }
}

/// Argument screening and execution environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<ExecutionEnvironment>,
    /// Regexes matched against every string argument. Replaces the defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_patterns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_argument_bytes: Option<usize>,
}

impl SecurityConfig {
    pub fn merge(self, other: Self) -> Self {
        Self {
            environment: other.environment.or(self.environment),
            blocked_patterns: other.blocked_patterns.or(self.blocked_patterns),
            max_argument_bytes: other.max_argument_bytes.or(self.max_argument_bytes),
        }
    }
}

/// Tool server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerConfig {
    Local(LocalServerConfig),
    Remote(RemoteServerConfig),
}

/// Server launched as a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalServerConfig {
    /// Command and arguments.
    pub command: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Default tool call timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Server reached over the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    pub url: String,

    #[serde(default)]
    pub transport: RemoteTransport,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTransport {
    #[default]
    Http,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl ServerConfig {
    pub fn is_enabled(&self) -> bool {
        match self {
            ServerConfig::Local(c) => c.enabled.unwrap_or(true),
            ServerConfig::Remote(c) => c.enabled.unwrap_or(true),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ServerConfig::Local(c) => c.name.as_deref(),
            ServerConfig::Remote(c) => c.name.as_deref(),
        }
    }

    /// Default tool call timeout for this server.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            ServerConfig::Local(c) => c.timeout,
            ServerConfig::Remote(c) => c.timeout,
        }
        .map(Duration::from_millis)
    }

    pub fn to_transport(&self) -> TransportConfig {
        match self {
            ServerConfig::Local(c) => TransportConfig::Process(ProcessConfig {
                command: c.command.clone(),
                environment: c.environment.clone().unwrap_or_default(),
                cwd: c.cwd.clone(),
            }),
            ServerConfig::Remote(c) => match c.transport {
                RemoteTransport::Http => TransportConfig::Http {
                    url: c.url.clone(),
                    headers: c.headers.clone().unwrap_or_default(),
                },
                RemoteTransport::WebSocket => TransportConfig::WebSocket { url: c.url.clone() },
            },
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Returns the merged config and the files it was read from. A missing
    /// `explicit` file is an error; the other sources are optional.
    pub async fn load(
        project_dir: Option<&Path>,
        explicit: Option<&Path>,
    ) -> CoreResult<(Self, Vec<PathBuf>)> {
        let mut config = Config::default();
        let mut sources = Vec::new();

        // 1. Global config
        if let Some(global_dir) = Self::global_config_dir() {
            if let Some(path) = first_existing(&global_dir, GLOBAL_FILE_NAMES) {
                config = config.merge(Self::load_file(&path).await?);
                sources.push(path);
            }
        }

        // 2. Inline content from the environment
        if let Ok(content) = std::env::var(CONFIG_CONTENT_ENV) {
            let content = Self::substitute_variables(&content, Path::new("."))?;
            config = config.merge(Self::parse_jsonc(&content, "<env>")?);
        }

        // 3. Project config
        if let Some(dir) = project_dir {
            if let Some(path) = first_existing(dir, PROJECT_FILE_NAMES) {
                config = config.merge(Self::load_file(&path).await?);
                sources.push(path);
            }
        }

        // 4. Explicit file
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
            config = config.merge(Self::load_file(path).await?);
            sources.push(path.to_path_buf());
        }

        config.validate()?;
        tracing::debug!(sources = sources.len(), "Loaded configuration");
        Ok((config, sources))
    }

    /// Get the global config directory.
    ///
    /// On Unix, prefers `~/.config/toolhost` over the platform directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            if let Some(home) = dirs::home_dir() {
                let xdg_config = home.join(".config").join("toolhost");
                if xdg_config.exists() {
                    return Some(xdg_config);
                }
            }
        }

        dirs::config_dir().map(|d| d.join("toolhost"))
    }

    /// Load configuration from a file.
    pub async fn load_file(path: &Path) -> CoreResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let content = Self::substitute_variables(&content, path)?;
        Self::parse_jsonc(&content, &path.display().to_string())
    }

    /// Parse JSONC (JSON with comments).
    pub fn parse_jsonc(content: &str, source: &str) -> CoreResult<Self> {
        let stripped = strip_comments(content);
        serde_json::from_str(&stripped).map_err(|e| {
            ConfigError::InvalidJson {
                path: source.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Replace `{env:NAME}` and `{file:path}` placeholders.
    ///
    /// `{file:}` paths are resolved against the directory of `config_path`.
    fn substitute_variables(content: &str, config_path: &Path) -> CoreResult<String> {
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        let mut failure: Option<ConfigError> = None;

        let result = var_regex().replace_all(content, |caps: &regex::Captures<'_>| {
            let (kind, value) = (&caps[1], &caps[2]);
            let replacement = match kind {
                "env" => std::env::var(value).map_err(|_| ConfigError::EnvVarNotFound {
                    name: value.to_string(),
                }),
                _ => {
                    let file_path = config_dir.join(value);
                    std::fs::read_to_string(&file_path)
                        .map(|v| json_escape(v.trim()))
                        .map_err(|_| ConfigError::FileRefNotFound {
                            path: file_path.display().to_string(),
                        })
                }
            };
            replacement.unwrap_or_else(|e| {
                failure.get_or_insert(e);
                caps[0].to_string()
            })
        });

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(result.into_owned()),
        }
    }

    /// Merge another config into this one (other takes precedence).
    pub fn merge(self, other: Self) -> Self {
        Self {
            schema: other.schema.or(self.schema),
            log_level: other.log_level.or(self.log_level),
            pool: merge_section(self.pool, other.pool, PoolConfig::merge),
            lifecycle: merge_section(self.lifecycle, other.lifecycle, LifecycleConfig::merge),
            registry: merge_section(self.registry, other.registry, RegistryConfig::merge),
            security: merge_section(self.security, other.security, SecurityConfig::merge),
            servers: merge_hashmap(self.servers, other.servers),
        }
    }

    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(level) = &self.log_level {
            if LogLevel::parse(level).is_none() {
                return Err(ConfigError::validation(format!(
                    "unknown log_level {level:?}"
                )));
            }
        }
        if self.pool_options().max_connections == 0 {
            return Err(ConfigError::validation("pool.max_connections must be at least 1"));
        }
        if self.registry_options().error_threshold == 0 {
            return Err(ConfigError::validation("registry.error_threshold must be at least 1"));
        }
        for (id, server) in self.servers.iter().flatten() {
            if id.trim().is_empty() {
                return Err(ConfigError::validation("server id must not be empty"));
            }
            match server {
                ServerConfig::Local(c) if c.command.is_empty() => {
                    return Err(ConfigError::validation(format!(
                        "server {id}: command must not be empty"
                    )));
                }
                ServerConfig::Remote(c) if c.url.trim().is_empty() => {
                    return Err(ConfigError::validation(format!(
                        "server {id}: url must not be empty"
                    )));
                }
                _ => {}
            }
        }
        self.validator()?;
        Ok(())
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level.as_deref().and_then(LogLevel::parse)
    }

    pub fn pool_options(&self) -> PoolOptions {
        let c = self.pool.clone().unwrap_or_default();
        let d = PoolOptions::default();
        PoolOptions {
            max_connections: c.max_connections.unwrap_or(d.max_connections),
            idle_ttl: millis_or(c.idle_ttl_ms, d.idle_ttl),
            maintenance_interval: millis_or(c.maintenance_interval_ms, d.maintenance_interval),
            health_check_timeout: millis_or(c.health_check_timeout_ms, d.health_check_timeout),
            max_consecutive_errors: c.max_consecutive_errors.unwrap_or(d.max_consecutive_errors),
        }
    }

    pub fn lifecycle_options(&self) -> LifecycleOptions {
        let c = self.lifecycle.clone().unwrap_or_default();
        let d = LifecycleOptions::default();
        LifecycleOptions {
            health_check_interval: millis_or(c.health_check_interval_ms, d.health_check_interval),
            max_health_failures: c.max_health_failures.unwrap_or(d.max_health_failures),
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        let c = self.registry.clone().unwrap_or_default();
        let d = RegistryOptions::default();
        RegistryOptions {
            discovery_interval: millis_or(c.discovery_interval_ms, d.discovery_interval),
            error_threshold: c.error_threshold.unwrap_or(d.error_threshold),
            default_timeout: millis_or(c.default_timeout_ms, d.default_timeout),
        }
    }

    pub fn environment(&self) -> ExecutionEnvironment {
        self.security
            .as_ref()
            .and_then(|s| s.environment)
            .unwrap_or_default()
    }

    pub fn validator(&self) -> Result<InputValidator, ConfigError> {
        let security = self.security.clone().unwrap_or_default();
        let max_bytes = security
            .max_argument_bytes
            .unwrap_or(DEFAULT_MAX_ARGUMENT_BYTES);
        match security.blocked_patterns {
            Some(patterns) => InputValidator::new(&patterns, max_bytes),
            None => InputValidator::new(DEFAULT_BLOCKED_PATTERNS, max_bytes),
        }
    }

    /// Connector for the real transports using the pool timing settings.
    pub fn connector(&self) -> TransportConnector {
        let pool = self.pool.clone().unwrap_or_default();
        let defaults = ClientOptions::default();
        let options = ClientOptions {
            init_timeout: millis_or(pool.init_timeout_ms, defaults.init_timeout),
            request_timeout: millis_or(
                self.registry.as_ref().and_then(|r| r.default_timeout_ms),
                defaults.request_timeout,
            ),
            ..defaults
        };
        TransportConnector::new(
            options,
            millis_or(pool.shutdown_grace_ms, Duration::from_secs(5)),
        )
    }

    /// Configured servers sorted by id.
    pub fn servers(&self) -> Vec<(&str, &ServerConfig)> {
        let mut servers: Vec<_> = self
            .servers
            .iter()
            .flatten()
            .map(|(id, c)| (id.as_str(), c))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(b.0));
        servers
    }
}

fn first_existing(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|name| dir.join(name)).find(|p| p.exists())
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

/// Escape file contents for use inside a JSON string literal.
fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn merge_section<T>(base: Option<T>, other: Option<T>, merge: fn(T, T) -> T) -> Option<T> {
    match (base, other) {
        (Some(b), Some(o)) => Some(merge(b, o)),
        (b, None) => b,
        (None, o) => o,
    }
}

fn merge_hashmap<K: std::hash::Hash + Eq, V>(
    base: Option<HashMap<K, V>>,
    other: Option<HashMap<K, V>>,
) -> Option<HashMap<K, V>> {
    match (base, other) {
        (Some(mut b), Some(o)) => {
            b.extend(o);
            Some(b)
        }
        (b, None) => b,
        (None, o) => o,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Lexer {
    Code,
    Slash,
    Str,
    StrEscape,
    LineComment,
    BlockComment,
    BlockStar,
}

/// Remove `//` and `/* */` comments outside string literals.
///
/// Newlines inside comments are kept so parse errors report the right line.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut state = Lexer::Code;

    for c in input.chars() {
        state = match (state, c) {
            (Lexer::Code, '"') => {
                out.push(c);
                Lexer::Str
            }
            (Lexer::Code, '/') => Lexer::Slash,
            (Lexer::Code, _) => {
                out.push(c);
                Lexer::Code
            }
            (Lexer::Slash, '/') => Lexer::LineComment,
            (Lexer::Slash, '*') => Lexer::BlockComment,
            (Lexer::Slash, _) => {
                out.push('/');
                out.push(c);
                if c == '"' {
                    Lexer::Str
                } else {
                    Lexer::Code
                }
            }
            (Lexer::Str, '\\') => {
                out.push(c);
                Lexer::StrEscape
            }
            (Lexer::Str, '"') => {
                out.push(c);
                Lexer::Code
            }
            (Lexer::Str, _) | (Lexer::StrEscape, _) => {
                out.push(c);
                Lexer::Str
            }
            (Lexer::LineComment, '\n') => {
                out.push('\n');
                Lexer::Code
            }
            (Lexer::LineComment, _) => Lexer::LineComment,
            (Lexer::BlockComment | Lexer::BlockStar, '\n') => {
                out.push('\n');
                Lexer::BlockComment
            }
            (Lexer::BlockComment | Lexer::BlockStar, '*') => Lexer::BlockStar,
            (Lexer::BlockStar, '/') => Lexer::Code,
            (Lexer::BlockComment | Lexer::BlockStar, _) => Lexer::BlockComment,
        };
    }

    if state == Lexer::Slash {
        out.push('/');
    }
    out
}
