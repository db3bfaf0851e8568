//! Server and tool command handlers.

use super::init_logging;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use toolhost_core::{Config, ToolRuntime};
use tracing::debug;

/// Load the config, initialize logging from it and start every server.
pub async fn start_runtime(
    cwd: &Path,
    explicit: Option<&Path>,
    verbose: bool,
) -> anyhow::Result<ToolRuntime> {
    let (config, sources) = Config::load(Some(cwd), explicit).await?;
    init_logging(verbose, config.log_level());
    debug!(sources = ?sources, "Config loaded");

    let connector = Arc::new(config.connector());
    let runtime = ToolRuntime::from_config(config, connector).await?;
    runtime.start().await;
    Ok(runtime)
}

/// Print configured servers and their status.
pub async fn list_servers(runtime: &ToolRuntime, json: bool) -> anyhow::Result<()> {
    let servers = runtime.list_servers().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
    } else if servers.is_empty() {
        println!("No servers configured.");
    } else {
        println!(
            "{:<20} {:<24} {:<14} {:<6} {}",
            "ID", "NAME", "STATUS", "TOOLS", "ERROR"
        );
        println!("{}", "-".repeat(80));
        for server in &servers {
            let tools = runtime.registry().list_by_server(&server.id).await.len();
            println!(
                "{:<20} {:<24} {:<14} {:<6} {}",
                server.id,
                server.name,
                server.status,
                tools,
                server.last_error.as_deref().unwrap_or("")
            );
        }
    }

    runtime.shutdown().await;
    Ok(())
}

/// List tools, or search them when `query` is given.
pub async fn list_tools(
    runtime: &ToolRuntime,
    query: Option<&str>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let tools = match query {
        Some(query) => runtime
            .search_tools(query, limit)
            .await
            .into_iter()
            .map(|hit| hit.tool)
            .collect(),
        None => runtime.list_tools().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else if tools.is_empty() {
        println!("No tools found.");
    } else {
        println!("{:<24} {:<16} {:<14} {}", "NAME", "SERVER", "CATEGORY", "DESCRIPTION");
        println!("{}", "-".repeat(80));
        for tool in &tools {
            let description = tool.description.as_deref().unwrap_or("");
            let description = if description.chars().count() > 40 {
                format!("{}...", description.chars().take(37).collect::<String>())
            } else {
                description.to_string()
            };
            println!(
                "{:<24} {:<16} {:<14} {}",
                tool.name, tool.server_id, tool.category, description
            );
        }
    }

    runtime.shutdown().await;
    Ok(())
}

/// Execute one tool and print the result as JSON. Fails if the call failed.
pub async fn call_tool(
    runtime: &ToolRuntime,
    tool: &str,
    args: &str,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let arguments: serde_json::Value = match serde_json::from_str(args) {
        Ok(value) => value,
        Err(e) => {
            runtime.shutdown().await;
            anyhow::bail!("--args is not valid JSON: {e}");
        }
    };

    let result = runtime
        .execute(tool, arguments, timeout_ms.map(Duration::from_millis))
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    runtime.shutdown().await;

    if !result.success {
        anyhow::bail!(
            "tool {tool} failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
