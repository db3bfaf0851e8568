//! Toolhost - pooled runtime for external tool servers.
//!
//! This is the main entry point for the toolhost CLI.

mod commands;

use clap::{Parser, Subcommand};
use commands::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "toolhost")]
#[command(author, version, about = "Pooled runtime for external tool servers", long_about = None)]
struct Cli {
    /// Config file loaded on top of the global and project configs
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured servers and report their status
    Servers {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List or search the discovered tools
    Tools {
        /// Search query
        #[arg(short, long)]
        query: Option<String>,
        /// Maximum number of search results
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call a tool and print the execution result
    Call {
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Call timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// Run the demo echo tool server on stdin/stdout
    ServeEcho {
        /// Report `resources: false` in the handshake
        #[arg(long)]
        no_resources: bool,
        /// Accept tool calls but never answer them
        #[arg(long)]
        silent_calls: bool,
        /// Exit after this many milliseconds
        #[arg(long)]
        exit_after_ms: Option<u64>,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Servers { json } => {
            let runtime = start_runtime(&cwd, cli.config.as_deref(), cli.verbose).await?;
            list_servers(&runtime, json).await
        }
        Commands::Tools { query, limit, json } => {
            let runtime = start_runtime(&cwd, cli.config.as_deref(), cli.verbose).await?;
            list_tools(&runtime, query.as_deref(), limit, json).await
        }
        Commands::Call {
            tool,
            args,
            timeout_ms,
        } => {
            let runtime = start_runtime(&cwd, cli.config.as_deref(), cli.verbose).await?;
            call_tool(&runtime, &tool, &args, timeout_ms).await
        }
        Commands::ServeEcho {
            no_resources,
            silent_calls,
            exit_after_ms,
        } => {
            init_logging(cli.verbose, None);
            serve_echo(EchoOptions {
                no_resources,
                silent_calls,
                exit_after_ms,
            })
            .await
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn print_version() {
    println!("toolhost {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("A pooled runtime for external tool servers.");
}
