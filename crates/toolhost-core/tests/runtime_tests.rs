//! Runtime integration tests.
//!
//! Drive the full pool → manager → registry stack through [`ToolRuntime`]
//! against in-memory tool servers.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use toolhost_core::{Config, ServerStatus, ToolCategory, ToolRuntime, ToolStatus};
use toolhost_mcp::echo_server;
use toolhost_test_utils::{fixtures, ConfigDir, MemoryConnector};

fn parse(content: &str) -> Config {
    Config::parse_jsonc(content, "test").expect("Failed to parse config")
}

async fn runtime(config: &str, connector: MemoryConnector) -> ToolRuntime {
    let runtime = ToolRuntime::from_config(parse(config), Arc::new(connector))
        .await
        .expect("Failed to build runtime");
    runtime.start().await;
    runtime
}

/// Test that a project config file drives server registration.
#[tokio::test]
async fn test_runtime_from_project_config() {
    let dir = ConfigDir::new().with_file(
        "toolhost.jsonc",
        r#"{
            // two servers, one disabled
            "servers": {
                "echo": {"type": "local", "command": ["toolhost", "serve-echo"], "timeout": 2000},
                "off": {"type": "local", "command": ["nothing"], "enabled": false}
            }
        }"#,
    );
    let (config, sources) = Config::load(Some(dir.path()), None)
        .await
        .expect("Failed to load config");
    assert!(sources.contains(&dir.file("toolhost.jsonc")));

    let connector = MemoryConnector::new().with_server("echo", echo_server);
    let runtime = ToolRuntime::from_config(config, Arc::new(connector))
        .await
        .unwrap();
    let ids: Vec<String> = runtime.list_servers().await.into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["echo"]);

    runtime.start().await;
    let tool = runtime.registry().get("echo").await.unwrap();
    assert_eq!(tool.timeout(), Some(Duration::from_millis(2000)));
    runtime.shutdown().await;
}

/// Test discovery, search and a successful call end to end.
#[tokio::test]
async fn test_discover_search_execute() {
    let connector = MemoryConnector::new()
        .with_server("echo", echo_server)
        .with_server("fs", || {
            fixtures::tools_server("fs", &[("read_file", "Read a file"), ("list_directory", "List a directory")])
        });
    let runtime = runtime(
        r#"{"servers": {
            "echo": {"type": "local", "command": ["echo-server"]},
            "fs": {"type": "local", "command": ["fs-server"]}
        }}"#,
        connector,
    )
    .await;

    let names: Vec<String> = runtime.list_tools().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo", "list_directory", "read_file"]);

    let fs_tools = runtime
        .registry()
        .list_by_category(ToolCategory::Filesystem)
        .await;
    assert_eq!(fs_tools.len(), 2);

    let hits = runtime.search_tools("read", 1).await;
    assert_eq!(hits[0].tool.name, "read_file");

    let result = runtime
        .execute("read_file", json!({"path": "README.md"}), None)
        .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.metadata.server_id.as_deref(), Some("fs"));

    let report = runtime.discover(None).await.unwrap();
    assert_eq!(report.updated.len(), 3);
    assert!(report.failed.is_empty());

    let stats = runtime.pool_stats().await;
    assert_eq!(stats.size, 2);
    runtime.shutdown().await;
}

/// Test that a tool is disabled after `error_threshold` failures and
/// comes back after rediscovery.
#[tokio::test]
async fn test_auto_disable_and_recover() {
    let connector = MemoryConnector::new().with_server("failing", fixtures::failing_server);
    let runtime = runtime(
        r#"{
            "registry": {"error_threshold": 2},
            "servers": {"failing": {"type": "local", "command": ["failing"]}}
        }"#,
        connector,
    )
    .await;

    assert!(!runtime.execute("broken", json!({}), None).await.success);
    let second = runtime.execute("broken", json!({}), None).await;
    assert_eq!(second.metadata.status, Some(ToolStatus::Error));
    assert_eq!(second.error.as_deref(), Some("tool is broken"));

    let rejected = runtime.execute("broken", json!({}), None).await;
    assert!(rejected.error.unwrap().contains("not available"));
    assert_eq!(runtime.registry().get("broken").await.unwrap().total_errors, 2);

    runtime.discover(Some("failing")).await.unwrap();
    let tool = runtime.registry().get("broken").await.unwrap();
    assert_eq!(tool.status, ToolStatus::Available);
    runtime.shutdown().await;
}

/// Test that the registry default timeout applies and counts once.
#[tokio::test]
async fn test_default_timeout_from_config() {
    let connector = MemoryConnector::new().with_server("slow", fixtures::silent_server);
    let runtime = runtime(
        r#"{
            "registry": {"default_timeout_ms": 100},
            "servers": {"slow": {"type": "local", "command": ["slow"]}}
        }"#,
        connector,
    )
    .await;

    let result = runtime.execute("echo", json!({}), None).await;
    assert!(result.is_timeout(), "{result:?}");
    assert!(result.duration >= Duration::from_millis(100));
    assert!(result.duration < Duration::from_secs(2));
    assert_eq!(runtime.registry().get("echo").await.unwrap().consecutive_errors, 1);
    runtime.shutdown().await;
}

/// Test that capabilities gate catalog discovery.
#[tokio::test]
async fn test_capability_gating() {
    let connector = MemoryConnector::new().with_server("bare", fixtures::no_resources_server);
    let runtime = runtime(
        r#"{"servers": {"bare": {"type": "local", "command": ["bare"]}}}"#,
        connector,
    )
    .await;

    let descriptor = runtime.manager().get_server("bare").await.unwrap();
    assert_eq!(descriptor.status, ServerStatus::Running);
    assert!(descriptor.capabilities.tools);
    assert!(!descriptor.capabilities.resources);
    assert!(runtime.manager().resources("bare").await.is_empty());
    assert_eq!(runtime.manager().prompts("bare").await.len(), 1);
    runtime.shutdown().await;
}

/// Test that a server failing health checks takes its tools offline.
#[tokio::test]
async fn test_disconnect_marks_tools_unavailable() {
    let connector = MemoryConnector::new().with_server("echo", echo_server);
    let runtime = runtime(
        r#"{
            "lifecycle": {"max_health_failures": 1},
            "servers": {"echo": {"type": "local", "command": ["echo"]}}
        }"#,
        connector.clone(),
    )
    .await;

    connector.refuse("echo");
    connector.kill("echo");
    runtime.manager().health_check_all().await;

    assert_eq!(
        runtime.get_server_status("echo").await.unwrap(),
        ServerStatus::Disconnected
    );
    let tool = runtime.registry().get("echo").await.unwrap();
    assert_eq!(tool.status, ToolStatus::Unavailable);
    assert!(!runtime.execute("echo", json!({}), None).await.success);

    connector.allow("echo");
    runtime.manager().restart_server("echo").await.unwrap();
    assert!(runtime.execute("echo", json!({}), None).await.success);
    runtime.shutdown().await;
}

/// Test that blocked arguments never reach the server.
#[tokio::test]
async fn test_custom_blocked_patterns() {
    let connector = MemoryConnector::new().with_server("echo", echo_server);
    let runtime = runtime(
        r#"{
            "security": {"blocked_patterns": ["rm -rf"], "max_argument_bytes": 64},
            "servers": {"echo": {"type": "local", "command": ["echo"]}}
        }"#,
        connector,
    )
    .await;

    let blocked = runtime
        .execute("echo", json!({"cmd": "rm -rf /"}), None)
        .await;
    assert!(!blocked.success);
    assert!(blocked.error.unwrap().contains("$.cmd"));

    let too_big = runtime
        .execute("echo", json!({"text": "x".repeat(100)}), None)
        .await;
    assert!(!too_big.success);

    // Default patterns are replaced, not extended.
    assert!(runtime.execute("echo", json!({"p": "../x"}), None).await.success);
    assert_eq!(runtime.registry().get("echo").await.unwrap().call_count, 1);
    runtime.shutdown().await;
}

/// Test that `ToolRuntime::load` reads the project config and records sources.
#[tokio::test]
async fn test_load_without_servers() {
    let dir = ConfigDir::new().with_file("toolhost.json", r#"{"log_level": "debug"}"#);
    let runtime = ToolRuntime::load(Some(dir.path()), None).await.unwrap();
    assert!(runtime
        .config_sources()
        .contains(&dir.file("toolhost.json")));
    assert!(runtime.list_servers().await.is_empty());
    assert!(runtime.start().await.is_empty());
    runtime.shutdown().await;
}
