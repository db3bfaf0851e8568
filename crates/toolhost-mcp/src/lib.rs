//! Tool server protocol and client runtime for toolhost.
//!
//! Tool servers are independent processes exposing tools, resources and
//! prompts over JSON-RPC 2.0, one JSON object per line on stdin/stdout.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  send   ┌──────────────┐  stdin   ┌─────────────┐
//! │  McpClient  │────────▶│  Transport   │─────────▶│ tool server │
//! │ (pending    │◀────────│ (read loop)  │◀─────────│  (process)  │
//! │  requests)  │ inbound └──────────────┘  stdout  └─────────────┘
//! └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use toolhost_mcp::{Connector, ProcessConfig, TransportConfig, TransportConnector};
//!
//! # async fn example() -> toolhost_mcp::McpResult<()> {
//! let config = TransportConfig::Process(ProcessConfig::new(["toolhost", "serve-echo"]));
//! let client = TransportConnector::default().connect("echo", &config).await?;
//! client.initialize().await?;
//!
//! let tools = client.list_tools().await?;
//! let result = client.call_tool("echo", serde_json::json!({"x": 1})).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connector;
mod error;
pub mod framing;
pub mod process;
pub mod protocol;
pub mod serve;
pub mod stream;
pub mod transport;
pub mod types;

pub use client::{handler_fn, ClientOptions, McpClient, MessageHandler};
pub use connector::{Connector, TransportConnector};
pub use error::{McpError, McpResult};
pub use protocol::{
    methods, ErrorCode, Message, Notification, ParseError, ParseErrorKind, Request, RequestId,
    Response, RpcError,
};
pub use serve::{echo_server, ToolHandler, ToolServer};
pub use stream::StreamTransport;
pub use transport::{
    Connected, Inbound, Incoming, ProcessConfig, Transport, TransportConfig, TransportKind,
};
pub use types::{
    CallToolResult, InitializeResult, Prompt, Resource, ServerCapabilities, Tool, ToolContent,
};
