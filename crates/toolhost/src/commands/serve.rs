//! The demo echo server.

use std::sync::Arc;
use std::time::Duration;
use toolhost_mcp::{echo_server, methods};
use tracing::info;

pub struct EchoOptions {
    pub no_resources: bool,
    pub silent_calls: bool,
    pub exit_after_ms: Option<u64>,
}

/// Serve the echo tool on stdio until stdin closes.
pub async fn serve_echo(options: EchoOptions) -> anyhow::Result<()> {
    let mut server = echo_server();
    if options.no_resources {
        server = server.without_resources();
    }
    if options.silent_calls {
        server = server.silence(methods::TOOLS_CALL);
    }
    let server = Arc::new(server);
    info!(name = server.name(), "Serving on stdio");

    match options.exit_after_ms {
        Some(ms) => {
            tokio::select! {
                result = server.serve_stdio() => result?,
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    info!(after_ms = ms, "Exiting on request");
                    std::process::exit(3);
                }
            }
        }
        None => server.serve_stdio().await?,
    }
    Ok(())
}
