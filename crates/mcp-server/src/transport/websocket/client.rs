//! Outbound WebSocket transport with automatic reconnection

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConnectionState, FrameBuffer};
use crate::config::{ServerConfig, DEFAULT_MAX_MESSAGE_SIZE};
use crate::protocol::codec;
use crate::transport::{check_outgoing, Transport, TransportError, TransportStatistics};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub max_message_size: usize,
    pub queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: 1000,
        }
    }
}

impl From<&ServerConfig> for ClientConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            max_message_size: config.max_message_size,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// How a socket session ended
enum SessionEnd {
    /// `close` was called
    Closing,
    /// Peer went away or the socket failed
    Lost,
}

struct ClientInner {
    url: String,
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    stats: Mutex<TransportStatistics>,
    buffer: Mutex<FrameBuffer>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    inbound_tx: Mutex<Option<mpsc::Sender<String>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    closing: CancellationToken,
}

pub struct WebSocketClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketClient {
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(ClientInner {
                url: url.into(),
                buffer: Mutex::new(FrameBuffer::new(config.max_message_size)),
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                stats: Mutex::new(TransportStatistics::default()),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                inbound_tx: Mutex::new(Some(inbound_tx)),
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                closing: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    async fn dial(&self) -> Result<Socket, TransportError> {
        self.set_state(ConnectionState::Connecting);
        match connect_async(self.url.as_str()).await {
            Ok((socket, _)) => {
                // A fragment left by the previous socket never completes
                self.buffer.lock().clear();
                self.set_state(ConnectionState::Connected);
                info!(url = %self.url, "Connected");
                Ok(socket)
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                self.stats.lock().record_error(&e);
                Err(TransportError::Connection(e.to_string()))
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let (messages, fault) = self.buffer.lock().push(text);
        if let Some(fault) = fault {
            warn!(url = %self.url, error = %fault, "Discarding frame buffer");
            self.stats.lock().record_error(fault);
        }

        for message in messages {
            if let Err(e) = codec::validate_message(&message) {
                warn!(url = %self.url, error = %e.message, "Dropping malformed message");
                self.stats.lock().record_error(&e.message);
                continue;
            }
            self.stats.lock().record_received(message.len());
            let tx = self.inbound_tx.lock().clone();
            let Some(tx) = tx else {
                return;
            };
            if tx.send(message).await.is_err() {
                return;
            }
        }
    }

    async fn drive(&self, socket: &mut Socket, outbound: &mut mpsc::Receiver<String>) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.closing.cancelled() => {
                    let _ = socket.close(None).await;
                    return SessionEnd::Closing;
                }
                message = outbound.recv() => {
                    let Some(text) = message else {
                        return SessionEnd::Closing;
                    };
                    if let Err(e) = socket.send(Message::Text(text)).await {
                        self.stats.lock().record_error(&e);
                        return SessionEnd::Lost;
                    }
                }
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.handle_text(&text).await,
                        Err(_) => self.stats.lock().record_error("binary frame is not UTF-8"),
                    },
                    // tungstenite answers pings on its own
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(url = %self.url, ?frame, "Server closed connection");
                        return SessionEnd::Lost;
                    }
                    Some(Err(e)) => {
                        warn!(url = %self.url, error = %e, "Socket error");
                        self.stats.lock().record_error(&e);
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                }
            }
        }
    }

    async fn reconnect(&self) -> Option<Socket> {
        for attempt in 1..=self.config.max_reconnect_attempts {
            tokio::select! {
                _ = self.closing.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
            info!(url = %self.url, attempt, "Reconnecting");
            match self.dial().await {
                Ok(socket) => return Some(socket),
                Err(e) => warn!(url = %self.url, attempt, error = %e, "Reconnect failed"),
            }
        }
        error!(
            url = %self.url,
            attempts = self.config.max_reconnect_attempts,
            "Giving up on reconnection"
        );
        None
    }

    async fn run(self: Arc<Self>, mut socket: Socket, mut outbound: mpsc::Receiver<String>) {
        loop {
            match self.drive(&mut socket, &mut outbound).await {
                SessionEnd::Closing => break,
                SessionEnd::Lost => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!(url = %self.url, "Connection lost");
                }
            }
            match self.reconnect().await {
                Some(next) => socket = next,
                None => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.inbound_tx.lock().take();
    }
}

#[async_trait]
impl Transport for WebSocketClient {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.inner.closing.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.task.lock().is_some() {
            return Ok(());
        }

        let socket = self.inner.dial().await?;
        let Some(outbound) = self.inner.outbound_rx.lock().take() else {
            return Err(TransportError::Closed);
        };
        let handle = tokio::spawn(Arc::clone(&self.inner).run(socket, outbound));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn send(&self, message: &str) -> Result<(), TransportError> {
        check_outgoing(message, self.inner.config.max_message_size, false)?;
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        self.inner
            .outbound_tx
            .send(message.to_string())
            .await
            .map_err(|_| TransportError::Closed)?;
        self.inner.stats.lock().record_sent(message.len());
        Ok(())
    }

    async fn receive(&self) -> Option<String> {
        self.inner.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.closing.cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.inbound_tx.lock().take();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn statistics(&self) -> TransportStatistics {
        self.inner.stats.lock().clone()
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        self.inner.closing.cancel();
    }
}
