//! Axum WebSocket server with a bounded connection table

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::{ConnectionInfo, Outbound, WebSocketConnection};
use crate::config::{ServerConfig, DEFAULT_MAX_MESSAGE_SIZE};
use crate::transport::{Transport, TransportError, TransportStatistics};

/// Close code sent when the server is at capacity ("try again later")
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_message_size: usize,
    pub queue_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: 1000,
        }
    }
}

impl From<&ServerConfig> for WebSocketConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            ping_interval: config.ping_interval(),
            ping_timeout: config.ping_timeout(),
            max_message_size: config.max_message_size,
            queue_capacity: config.queue_capacity,
        }
    }
}

#[derive(Default)]
struct Totals {
    accepted: u64,
    rejected: u64,
    /// Counters of connections that have already gone away
    finished: TransportStatistics,
}

/// Accepts WebSocket peers on `/mcp` and hands each one out as a
/// [`WebSocketConnection`] through [`WebSocketServer::next_connection`]
pub struct WebSocketServer {
    config: WebSocketConfig,
    connections: RwLock<HashMap<String, Arc<WebSocketConnection>>>,
    accepted_tx: mpsc::Sender<Arc<WebSocketConnection>>,
    accepted_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<WebSocketConnection>>>,
    totals: Mutex<Totals>,
    shutdown: CancellationToken,
}

impl WebSocketServer {
    pub fn new(config: WebSocketConfig) -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            config,
            connections: RwLock::new(HashMap::new()),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            totals: Mutex::new(Totals::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// `/mcp` upgrade and `/health` routes, for mounting in a larger app
    pub fn router(self: &Arc<Self>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/mcp", get(upgrade))
            .route("/health", get(health))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Bind `addr` and serve in the background until [`Self::stop`].
    /// Returns the bound address.
    pub async fn start(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "WebSocket server failed");
            }
        });
        info!(addr = %local, "WebSocket server listening");
        Ok(local)
    }

    /// Stop accepting and disconnect every peer
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for id in ids {
            self.close_connection(&id).await;
        }
        info!("WebSocket server stopped");
    }

    /// Next accepted connection; `None` after [`Self::stop`]
    pub async fn next_connection(&self) -> Option<Arc<WebSocketConnection>> {
        let mut accepted = self.accepted_rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            connection = accepted.recv() => connection,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Upgrades are refused once this turns false
    pub fn has_capacity(&self) -> bool {
        self.connection_count() < self.config.max_connections
    }

    pub fn get_connection(&self, id: &str) -> Option<Arc<WebSocketConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Snapshot of open connections, oldest first
    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> =
            self.connections.read().values().map(|c| c.info()).collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    /// Aggregate counters over live and finished connections
    pub fn statistics(&self) -> TransportStatistics {
        let mut total = self.totals.lock().finished.clone();
        for connection in self.connections.read().values() {
            total.merge(&connection.statistics());
        }
        total
    }

    /// Register a peer whose frames are written through `outbound`, and
    /// start its keepalive task
    pub fn accept(
        self: &Arc<Self>,
        outbound: mpsc::Sender<Outbound>,
        remote: Option<String>,
    ) -> Result<Arc<WebSocketConnection>, TransportError> {
        let connection = Arc::new(WebSocketConnection::new(
            uuid::Uuid::new_v4().to_string(),
            remote,
            outbound,
            self.config.max_message_size,
            self.config.queue_capacity,
        ));

        {
            let mut connections = self.connections.write();
            if connections.len() >= self.config.max_connections {
                self.totals.lock().rejected += 1;
                warn!(
                    max = self.config.max_connections,
                    "Rejecting connection, server at capacity"
                );
                return Err(TransportError::CapacityExceeded(self.config.max_connections));
            }
            connections.insert(connection.id().to_string(), Arc::clone(&connection));
        }
        self.totals.lock().accepted += 1;
        info!(connection_id = %connection.id(), remote = ?connection.info().remote, "Connection accepted");

        let server = Arc::downgrade(self);
        let pinger = Arc::clone(&connection);
        let (interval, timeout) = (self.config.ping_interval, self.config.ping_timeout);
        tokio::spawn(async move {
            pinger.keepalive(interval, timeout).await;
            if let Some(server) = server.upgrade() {
                server.remove(pinger.id());
            }
        });

        if self.accepted_tx.try_send(Arc::clone(&connection)).is_err() {
            warn!(connection_id = %connection.id(), "Accept queue full, connection has no consumer");
        }
        Ok(connection)
    }

    /// Drop a connection from the table; it is marked disconnected
    fn remove(&self, id: &str) -> Option<Arc<WebSocketConnection>> {
        let connection = self.connections.write().remove(id)?;
        connection.mark_disconnected();
        self.totals.lock().finished.merge(&connection.statistics());
        info!(connection_id = id, "Connection removed");
        Some(connection)
    }

    /// Close and remove one connection
    pub async fn close_connection(&self, id: &str) -> bool {
        let Some(connection) = self.get_connection(id) else {
            return false;
        };
        let _ = connection.close().await;
        self.remove(id).is_some()
    }

    /// Send `message` to every live connection not in `exclude`.
    /// Returns how many peers it was queued for.
    pub async fn broadcast(&self, message: &str, exclude: &[&str]) -> usize {
        let targets: Vec<Arc<WebSocketConnection>> = self
            .connections
            .read()
            .values()
            .filter(|c| !exclude.contains(&c.id()) && c.is_alive())
            .cloned()
            .collect();

        let mut delivered = 0;
        for connection in targets {
            match connection.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(connection_id = %connection.id(), error = %e, "Broadcast skipped"),
            }
        }
        delivered
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: Option<String>) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(self.config.queue_capacity.max(1));

        let connection = match self.accept(tx, remote) {
            Ok(connection) => connection,
            Err(e) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_TRY_AGAIN_LATER,
                        reason: e.to_string().into(),
                    })))
                    .await;
                return;
            }
        };

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let message = match frame {
                    Outbound::Text(text) => Message::Text(text),
                    Outbound::Ping(payload) => Message::Ping(payload),
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = connection.closed() => break,
                next = stream.next() => match next {
                    Some(Ok(Message::Text(text))) => connection.handle_text(&text).await,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => connection.handle_text(&text).await,
                        Err(_) => connection.record_error("binary frame is not UTF-8"),
                    },
                    Some(Ok(Message::Pong(_))) => connection.handle_pong(),
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(connection_id = %connection.id(), error = %e, "Socket error");
                        connection.record_error(e);
                        break;
                    }
                }
            }
        }

        let _ = connection.close().await;
        self.remove(connection.id());
        if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
            writer.abort();
        }
    }
}

async fn upgrade(
    State(server): State<Arc<WebSocketServer>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !server.has_capacity() {
        server.totals.lock().rejected += 1;
        warn!(
            max = server.config.max_connections,
            "Rejecting upgrade, server at capacity"
        );
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Connection limit reached",
                "max_connections": server.config.max_connections,
            })),
        )
            .into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let remote = connect_info.map(|ConnectInfo(addr)| addr.to_string());
    ws.max_message_size(server.config.max_message_size)
        .on_upgrade(move |socket| server.handle_socket(socket, remote))
}

async fn health(State(server): State<Arc<WebSocketServer>>) -> impl IntoResponse {
    let (accepted, rejected) = {
        let totals = server.totals.lock();
        (totals.accepted, totals.rejected)
    };
    Json(json!({
        "status": "ok",
        "connections": server.connection_count(),
        "max_connections": server.config.max_connections,
        "accepted": accepted,
        "rejected": rejected,
        "statistics": server.statistics(),
    }))
}
