//! WebSocket transport: framing, per-connection transport, server and client.
//!
//! Frames need not line up with messages, so inbound text is appended to
//! a per-connection buffer and cut at bracket-balanced boundaries.

mod client;
mod server;

pub use client::{ClientConfig, WebSocketClient};
pub use server::{WebSocketConfig, WebSocketServer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{check_outgoing, Transport, TransportError, TransportStatistics};
use crate::protocol::codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub remote: Option<String>,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub statistics: TransportStatistics,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected {0:?} outside a JSON-RPC envelope")]
    Unexpected(char),

    #[error("buffered data exceeds {0} bytes")]
    Overflow(usize),
}

/// Accumulates text frames and cuts out complete JSON objects or arrays.
///
/// Scan state survives between pushes, so each byte is examined once no
/// matter how many frames a message is split across.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: String,
    max: usize,
    /// Bytes of `buf` already walked
    scanned: usize,
    /// Offset of the envelope being assembled
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            buf: String::new(),
            max,
            scanned: 0,
            start: None,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop buffered data and any partially scanned envelope
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.start = None;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }

    /// Append `data` and return every complete envelope now buffered.
    /// On malformed or oversized contents the buffer is reset; envelopes
    /// cut before the fault are still returned.
    pub fn push(&mut self, data: &str) -> (Vec<String>, Option<FrameError>) {
        self.buf.push_str(data);

        let mut messages = Vec::new();
        let mut fault = None;
        let mut consumed = 0;
        let base = self.scanned;

        for (offset, c) in self.buf[base..].char_indices() {
            let i = base + offset;
            let Some(begin) = self.start else {
                if c.is_whitespace() {
                    consumed = i + c.len_utf8();
                } else if c == '{' || c == '[' {
                    self.start = Some(i);
                    self.depth = 1;
                } else {
                    fault = Some(FrameError::Unexpected(c));
                    break;
                }
                continue;
            };

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match c {
                '"' => self.in_string = true,
                '{' | '[' => self.depth += 1,
                '}' | ']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        messages.push(self.buf[begin..=i].to_string());
                        consumed = i + 1;
                        self.start = None;
                    }
                }
                _ => {}
            }
        }

        if fault.is_some() {
            self.clear();
            return (messages, fault);
        }

        self.buf.drain(..consumed);
        self.start = self.start.map(|begin| begin - consumed);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max {
            fault = Some(FrameError::Overflow(self.max));
            self.clear();
        }
        (messages, fault)
    }
}

/// Frames queued for a connection's socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping(Vec<u8>),
    Close,
}

/// One WebSocket peer seen as a [`Transport`].
///
/// The socket itself lives in the server's or client's I/O tasks; this
/// side only talks to them through channels.
pub struct WebSocketConnection {
    id: String,
    remote: Option<String>,
    connected_at: DateTime<Utc>,
    max_message_size: usize,
    state: RwLock<ConnectionState>,
    stats: Mutex<TransportStatistics>,
    last_activity: Mutex<DateTime<Utc>>,
    buffer: Mutex<FrameBuffer>,
    outbound: mpsc::Sender<Outbound>,
    inbound_tx: Mutex<Option<mpsc::Sender<String>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    pong: Notify,
    closed: CancellationToken,
}

impl WebSocketConnection {
    pub fn new(
        id: impl Into<String>,
        remote: Option<String>,
        outbound: mpsc::Sender<Outbound>,
        max_message_size: usize,
        queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let now = Utc::now();
        Self {
            id: id.into(),
            remote,
            connected_at: now,
            max_message_size,
            state: RwLock::new(ConnectionState::Connected),
            stats: Mutex::new(TransportStatistics::default()),
            last_activity: Mutex::new(now),
            buffer: Mutex::new(FrameBuffer::new(max_message_size)),
            outbound,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            pong: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            remote: self.remote.clone(),
            state: self.state(),
            connected_at: self.connected_at,
            last_activity: *self.last_activity.lock(),
            statistics: self.statistics(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub(crate) fn record_error(&self, error: impl ToString) {
        self.stats.lock().record_error(error);
    }

    /// Resolves once the connection is disconnected
    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Feed one inbound text frame
    pub async fn handle_text(&self, text: &str) {
        self.touch();
        let (messages, fault) = self.buffer.lock().push(text);
        if let Some(fault) = &fault {
            warn!(connection_id = %self.id, error = %fault, "Discarding frame buffer");
            self.record_error(fault);
        }

        for message in messages {
            if let Err(e) = codec::validate_message(&message) {
                warn!(connection_id = %self.id, error = %e.message, "Dropping malformed message");
                self.record_error(&e.message);
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

    /// Wakes a keepalive waiting on its ping; a pong with no ping in
    /// flight is not remembered
    pub fn handle_pong(&self) {
        self.touch();
        self.pong.notify_waiters();
    }

    /// Ping every `interval`; if no pong arrives within `timeout` the
    /// connection goes to `Error` then `Disconnected`. Returns when the
    /// connection is no longer alive.
    pub async fn keepalive(&self, interval: Duration, timeout: Duration) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if !self.is_alive() {
                return;
            }
            // Registered before the ping goes out so the reply cannot be missed
            let pong = self.pong.notified();
            if self.outbound.send(Outbound::Ping(Vec::new())).await.is_err() {
                self.mark_disconnected();
                return;
            }
            debug!(connection_id = %self.id, "Sent ping");

            let answered = tokio::select! {
                _ = self.closed.cancelled() => return,
                result = tokio::time::timeout(timeout, pong) => result.is_ok(),
            };
            if !answered {
                warn!(connection_id = %self.id, timeout = ?timeout, "Ping timeout, closing connection");
                *self.state.write() = ConnectionState::Error;
                self.record_error("ping timeout");
                let _ = self.outbound.try_send(Outbound::Close);
                self.mark_disconnected();
                return;
            }
        }
    }

    /// Move to `Disconnected`, ending `receive` once the queue drains
    pub(crate) fn mark_disconnected(&self) {
        *self.state.write() = ConnectionState::Disconnected;
        self.inbound_tx.lock().take();
        self.closed.cancel();
    }
}

#[async_trait]
impl Transport for WebSocketConnection {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn send(&self, message: &str) -> Result<(), TransportError> {
        check_outgoing(message, self.max_message_size, false)?;
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound::Text(message.to_string()))
            .await
            .map_err(|_| TransportError::Closed)?;
        self.stats.lock().record_sent(message.len());
        self.touch();
        Ok(())
    }

    async fn receive(&self) -> Option<String> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let _ = self.outbound.try_send(Outbound::Close);
        self.mark_disconnected();
        info!(connection_id = %self.id, "Connection closed");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn statistics(&self) -> TransportStatistics {
        self.stats.lock().clone()
    }
}
