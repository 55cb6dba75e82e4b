//! MCP server binary entry point.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use open_agents_mcp::{
    config::ServerConfig,
    protocol::McpServerBuilder,
    transport::{HttpTransport, StdioTransport, WebSocketTransport},
};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Stdio,
    Http,
    Websocket,
}

/// Serve the built-in MCP tools.
#[derive(Debug, Parser)]
#[command(name = "open-agents-mcp", version, about, disable_version_flag = true)]
struct Cli {
    /// Server name reported during initialize
    #[arg(short, long)]
    name: Option<String>,

    /// Prefix for built-in tool names
    #[arg(short, long)]
    prefix: Option<String>,

    /// Transport to serve on
    #[arg(short, long, value_enum, default_value_t = TransportKind::Stdio)]
    transport: TransportKind,

    /// Listen address for the http and websocket transports
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {:#}", e);
            eprintln!("open-agents-mcp: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let mut config = ServerConfig::builder()
        .from_env()
        .context("invalid server configuration in environment")?;
    if let Some(name) = cli.name {
        config = config.name(name);
    }
    if let Some(prefix) = cli.prefix {
        config = config.tool_prefix(prefix);
    }

    let server = Arc::new(
        McpServerBuilder::new()
            .config(config.build()?)
            .with_builtins()
            .build()?,
    );
    info!(
        "Server state initialized with {} tools",
        server.state().tools.len()
    );

    match cli.transport {
        TransportKind::Stdio => {
            let transport = Arc::new(StdioTransport::new());
            server.serve(transport.clone()).await?;
            info!("MCP server ready on stdio");

            tokio::select! {
                _ = transport.wait() => info!("Input closed"),
                _ = shutdown_signal() => {}
            }
        }
        TransportKind::Http => {
            let transport = Arc::new(HttpTransport::new(cli.bind));
            server
                .serve(transport.clone())
                .await
                .with_context(|| format!("failed to listen on {}", cli.bind))?;
            info!(addr = ?transport.local_addr(), "MCP server ready on HTTP");
            shutdown_signal().await;
        }
        TransportKind::Websocket => {
            let transport = Arc::new(WebSocketTransport::new(cli.bind));
            server
                .serve(transport.clone())
                .await
                .with_context(|| format!("failed to listen on {}", cli.bind))?;
            info!(addr = ?transport.local_addr(), "MCP server ready on WebSocket");
            shutdown_signal().await;
        }
    }

    server.stop().await?;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("open_agents_mcp=info,warn"));

    // stdout carries the protocol, so logs go to stderr
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .init();
}
