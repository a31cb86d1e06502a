//! Code Index MCP server CLI
//!
//! Serves the MCP protocol engine over stdio (the default, for MCP clients
//! that launch the server as a subprocess) or as a WebSocket server.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use code_index_mcp::logging::init_logging;
use code_index_mcp::{cancel_on_signal, McpServer, ServerConfig, ServerMode, TransportKind};

/// Code Index MCP - JSON-RPC engine for code indexing over MCP
#[derive(Parser, Debug)]
#[command(name = "code-index-mcp")]
#[command(version)]
#[command(about = "Code Index MCP - MCP protocol server over stdio or WebSocket")]
struct Args {
    /// Path to a JSON config file
    #[arg(long, env = "CODE_INDEX_MCP_CONFIG")]
    config: Option<PathBuf>,

    /// Transport to serve: stdio or websocket
    #[arg(long, env = "CODE_INDEX_MCP_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Host to bind in WebSocket mode
    #[arg(long, env = "CODE_INDEX_MCP_HOST")]
    host: Option<String>,

    /// Port to bind in WebSocket mode
    #[arg(long, env = "CODE_INDEX_MCP_PORT")]
    port: Option<u16>,

    /// Maximum concurrent WebSocket connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum message size in bytes
    #[arg(long)]
    max_message_size: Option<usize>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(max) = self.max_message_size {
            config.max_message_size = max;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref()).context("Failed to load config")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    init_logging(config.transport == TransportKind::Stdio);

    let mode = ServerMode::from_config(&config)?;
    let server = Arc::new(McpServer::new(config).context("Failed to build server")?);

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone()).context("Failed to install signal handlers")?;

    server.run(mode, shutdown).await?;
    info!("Server stopped");
    Ok(())
}
