//! Main MCP server orchestration

use futures::future::join_all;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::advanced::AdvancedFeatures;
use crate::config::{ConfigError, ServerConfig, TransportKind};
use crate::protocol::{
    codec, CoreMethods, McpError, Message, MethodHandler, MethodRegistry, RequestValidator,
    Response, Router,
};
use crate::transport::{
    self, StdioConfig, StdioTransport, Transport, TransportError, WebSocketConfig, WebSocketServer,
};

/// Server mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// Newline-delimited JSON over stdin/stdout
    #[default]
    Stdio,
    /// WebSocket server on `addr`
    WebSocket { addr: SocketAddr },
}

impl ServerMode {
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        Ok(match config.transport {
            TransportKind::Stdio => Self::Stdio,
            TransportKind::WebSocket => Self::WebSocket {
                addr: config.bind_addr()?,
            },
        })
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
///
/// Signal handlers are installed before this returns, so a signal raised
/// afterwards is never lost to the default disposition.
pub fn cancel_on_signal(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => info!("Received SIGINT, shutting down"),
                _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
            }
            token.cancel();
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, shutting down");
                token.cancel();
            }
        }))
    }
}

/// MCP server: one registry, router and feature set shared by every
/// transport it serves
pub struct McpServer {
    config: ServerConfig,
    registry: Arc<MethodRegistry>,
    router: Arc<Router>,
    core: Arc<CoreMethods>,
    advanced: Arc<AdvancedFeatures>,
}

impl McpServer {
    /// Build the method table and router for `config`
    pub fn new(config: ServerConfig) -> Result<Self, McpError> {
        let registry = Arc::new(MethodRegistry::new());

        let core = Arc::new(CoreMethods::default());
        core.register(&registry);

        let validator = RequestValidator::new(Arc::clone(&registry))?
            .with_protocol_versions(config.supported_protocol_versions.clone());
        let router = Arc::new(Router::new(Arc::clone(&registry)).with_validator(Arc::new(validator)));

        let advanced = Arc::new(AdvancedFeatures::new(
            Arc::clone(&router),
            config.batch_default_concurrency,
        ));
        advanced.register(&registry);

        info!(methods = registry.len(), "MCP server ready");
        Ok(Self {
            config,
            registry,
            router,
            core,
            advanced,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn core(&self) -> &Arc<CoreMethods> {
        &self.core
    }

    pub fn advanced(&self) -> &Arc<AdvancedFeatures> {
        &self.advanced
    }

    /// Add or replace a method handler
    pub fn register(&self, entry: MethodHandler) {
        self.registry.register(entry);
    }

    /// Process one raw frame and return the serialized reply, if any.
    ///
    /// Notifications, inbound responses and all-notification batches
    /// produce no reply. Frames that fail validation are answered with an
    /// error carrying whatever id could be recovered.
    pub async fn handle_message(&self, raw: &str) -> Option<String> {
        let reply = match codec::validate_message(raw) {
            Ok(Message::Request(request)) => {
                let response = self.router.handle(request).await?;
                codec::serialize_response(&response)
            }
            Ok(Message::Batch(requests)) => {
                let responses: Vec<Response> =
                    join_all(requests.into_iter().map(|request| self.router.handle(request)))
                        .await
                        .into_iter()
                        .flatten()
                        .collect();
                if responses.is_empty() {
                    return None;
                }
                codec::serialize_responses(&responses)
            }
            Ok(Message::Response(response)) => {
                debug!(id = ?response.id, "Ignoring response from peer");
                return None;
            }
            Err(err) => {
                err.log(None);
                codec::serialize_response(&Response::error(codec::extract_id(raw), err))
            }
        };

        match reply {
            Ok(reply) => Some(reply),
            Err(err) => {
                error!(error = %err.message, "Failed to serialize reply");
                None
            }
        }
    }

    /// Answer messages from `transport` in arrival order until it ends or
    /// `shutdown` fires, then close it
    pub async fn serve_transport(
        &self,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        transport.connect().await?;
        let mut messages = Box::pin(transport::incoming(Arc::clone(&transport)));

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = messages.next() => message,
            };
            let Some(message) = message else {
                break;
            };
            if let Some(reply) = self.handle_message(&message).await {
                if let Err(e) = transport.send(&reply).await {
                    warn!(error = %e, "Failed to send reply");
                    if !transport.is_alive() {
                        break;
                    }
                }
            }
        }

        let stats = transport.statistics();
        debug!(
            received = stats.messages_received,
            sent = stats.messages_sent,
            errors = stats.errors,
            "Transport finished"
        );
        transport.close().await
    }

    /// Run the transport selected by `mode` until it ends or `shutdown` fires
    pub async fn run(
        self: &Arc<Self>,
        mode: ServerMode,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let result = match mode {
            ServerMode::Stdio => {
                info!("Starting MCP server in stdio mode");
                let transport = Arc::new(StdioTransport::stdio(StdioConfig::from(&self.config)));
                self.serve_transport(transport, shutdown).await
            }
            ServerMode::WebSocket { addr } => self.run_websocket(addr, shutdown).await,
        };

        let closed = self.advanced.shutdown();
        info!(closed_streams = closed, "MCP server stopped");
        result
    }

    async fn run_websocket(
        self: &Arc<Self>,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let server = WebSocketServer::new(WebSocketConfig::from(&self.config));
        let local = server.start(addr).await?;
        info!(addr = %local, "Starting MCP server in WebSocket mode");

        let mut sessions = JoinSet::new();
        loop {
            let connection = tokio::select! {
                _ = shutdown.cancelled() => break,
                connection = server.next_connection() => connection,
            };
            let Some(connection) = connection else {
                break;
            };

            let this = Arc::clone(self);
            let token = shutdown.child_token();
            sessions.spawn(async move {
                let id = connection.id().to_string();
                if let Err(e) = this.serve_transport(connection, token).await {
                    warn!(connection_id = %id, error = %e, "Connection ended with error");
                }
            });
        }

        server.stop().await;
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}
