//! Fake tool servers and config fixtures.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use toolhost_mcp::serve::{ClosureHandler, EchoTool};
use toolhost_mcp::{
    echo_server, methods, CallToolResult, ProcessConfig, RpcError, Tool, ToolServer,
    TransportConfig,
};

/// Placeholder transport for connectors that ignore it.
pub fn memory_transport() -> TransportConfig {
    TransportConfig::Process(ProcessConfig::new(["memory"]))
}

/// Echo server that accepts `tools/call` but never answers it.
pub fn silent_server() -> ToolServer {
    echo_server().silence(methods::TOOLS_CALL)
}

/// Echo server whose handshake reports `resources: false`.
pub fn no_resources_server() -> ToolServer {
    echo_server().without_resources()
}

/// Server exposing echo-behaved tools with the given names and descriptions.
pub fn tools_server(name: &str, tools: &[(&str, &str)]) -> ToolServer {
    tools
        .iter()
        .fold(ToolServer::new(name), |server, (tool, description)| {
            server.with_tool(Tool::new(*tool, *description), EchoTool)
        })
}

/// Server with one tool `broken` that always reports an error result.
pub fn failing_server() -> ToolServer {
    ToolServer::new("failing").with_tool(
        Tool::new("broken", "Always fails"),
        ClosureHandler::new(|_| Ok(CallToolResult::error("tool is broken"))),
    )
}

/// Server with one tool `strict` that answers every call with an
/// Invalid-Params error response.
pub fn rejecting_server() -> ToolServer {
    ToolServer::new("rejecting").with_tool(
        Tool::new("strict", "Rejects all arguments"),
        ClosureHandler::new(|_| Err(RpcError::invalid_params("missing field `path`"))),
    )
}

/// A temporary directory holding config files.
///
/// # Example
///
/// ```rust
/// use toolhost_test_utils::fixtures::ConfigDir;
///
/// let dir = ConfigDir::new().with_file("toolhost.jsonc", "{ /* empty */ }");
/// assert!(dir.path().join("toolhost.jsonc").exists());
/// ```
pub struct ConfigDir {
    temp_dir: TempDir,
}

impl ConfigDir {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Write `contents` to `name`, creating parent directories.
    pub fn with_file(self, name: impl AsRef<Path>, contents: &str) -> Self {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create directory");
        }
        fs::write(&path, contents).expect("Failed to write file");
        self
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn file(&self, name: impl AsRef<Path>) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

impl Default for ConfigDir {
    fn default() -> Self {
        Self::new()
    }
}
