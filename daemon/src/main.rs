//! swift-runner daemon
//!
//! Serves the runner over HTTP (`--listen`) or as an MCP server on stdio
//! (`--stdio`). Configuration comes from `--config` or `SWIFT_RUNNER_CONFIG`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swift_runner_daemon::{backend::DockerBackend, config::Config, http, mcp, runner::Runner};

#[derive(Parser, Debug)]
#[command(name = "swift-runner")]
#[command(about = "Runs Swift snippets in disposable containers")]
struct Args {
    /// Serve HTTP on this address (e.g. 0.0.0.0:8080)
    #[arg(long, conflicts_with = "stdio")]
    listen: Option<SocketAddr>,

    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sandbox template directory (overrides configuration)
    #[arg(long)]
    sandbox_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = args.sandbox_dir {
        config.sandbox_dir = dir;
    }

    anyhow::ensure!(
        config.sandbox_dir.is_dir(),
        "Sandbox template not found at {}",
        config.sandbox_dir.display()
    );

    info!(
        sandbox = %config.sandbox_dir.display(),
        workspaces = %config.workspace_root.display(),
        "Loaded configuration"
    );

    let backend = DockerBackend::from_config(&config);
    let runner = Arc::new(Runner::new(config, backend));

    if args.stdio {
        mcp::serve_stdio(runner).await?;
    } else if let Some(addr) = args.listen {
        http::serve(addr, runner).await?;
    } else {
        anyhow::bail!("Choose a surface: --listen <addr> or --stdio");
    }

    Ok(())
}
