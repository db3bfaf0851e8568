//! Testing utilities for toolhost.
//!
//! - **Mocks**: [`MemoryConnector`], an in-memory [`toolhost_mcp::Connector`]
//!   backed by in-process tool servers
//! - **Fixtures**: scripted fake servers and temporary config directories
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use toolhost_test_utils::{fixtures, MemoryConnector};
//!
//! #[tokio::test]
//! async fn test_timeout() {
//!     let connector = MemoryConnector::new().with_server("slow", fixtures::silent_server);
//!     // Hand the connector to a ConnectionPool...
//! }
//! ```

pub mod fixtures;
pub mod mocks;

pub use fixtures::{memory_transport, ConfigDir};
pub use mocks::MemoryConnector;
