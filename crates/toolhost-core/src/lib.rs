//! Tool server runtime for toolhost.
//!
//! This crate coordinates many tool servers behind one catalog:
//! - Configuration management (multi-source, JSONC support)
//! - Connection pooling with health checks and idle eviction
//! - Server lifecycle and capability discovery
//! - Tool registry with search, usage tracking and auto-disable
//! - Argument screening before dispatch

pub mod category;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod security;
pub mod server;

pub use category::ToolCategory;
pub use config::{Config, ServerConfig};
pub use error::{ConfigError, CoreError, CoreResult};
pub use manager::{LifecycleOptions, ServerManager, ServerObserver};
pub use pool::{ConnectionPool, PoolOptions, PoolStats};
pub use registry::{
    DiscoveryReport, ExecutionResult, RegisteredTool, RegistryOptions, SearchResult, ToolRegistry,
    ToolStatus,
};
pub use runtime::{BackgroundTask, ToolRuntime};
pub use security::{ExecutionEnvironment, InputValidator};
pub use server::{CapabilityFlags, ServerDescriptor, ServerStatus};
