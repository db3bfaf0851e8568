//! Shared utilities for toolhost.
//!
//! - Logging setup with tracing (always on stderr, stdout carries the wire protocol)
//! - RAII-based timing for requests and tool executions

pub mod log;
pub mod timing;

pub use log::{LogConfig, LogLevel};
pub use timing::TimingGuard;
