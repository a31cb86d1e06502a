//! Transports carrying raw JSON-RPC frames
//!
//! A transport only moves validated message strings in and out. Decoding
//! and dispatch happen in the server, which composes a transport with
//! the router.

pub mod stdio;
pub mod websocket;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub use stdio::{ProcessInfo, ProcessState, StdioConfig, StdioTransport};
pub use websocket::{
    ClientConfig, ConnectionInfo, ConnectionState, WebSocketClient, WebSocketConfig,
    WebSocketConnection, WebSocketServer,
};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection limit reached ({0})")]
    CapacityExceeded(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),
}

/// Counters kept by every transport
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

impl TransportStatistics {
    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_error(&mut self, error: impl ToString) {
        self.errors += 1;
        self.last_error = Some(error.to_string());
    }

    /// Sum of two snapshots; `last_error` prefers `other`
    pub fn merge(&mut self, other: &TransportStatistics) {
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.errors += other.errors;
        if other.last_error.is_some() {
            self.last_error = other.last_error.clone();
        }
    }
}

/// Common contract of the stdio and WebSocket transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start moving frames. Calling it on a live transport is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send one complete message
    async fn send(&self, message: &str) -> Result<(), TransportError>;

    /// Next validated inbound message; `None` once the transport is done
    async fn receive(&self) -> Option<String>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    fn statistics(&self) -> TransportStatistics;
}

/// Inbound messages as a stream, ending when the transport does
pub fn incoming(transport: Arc<dyn Transport>) -> impl Stream<Item = String> + Send {
    async_stream::stream! {
        while let Some(message) = transport.receive().await {
            yield message;
        }
    }
}

/// Reject messages the peer could not frame or that exceed `max`
pub(crate) fn check_outgoing(message: &str, max: usize, newline_framed: bool) -> Result<(), TransportError> {
    if message.len() > max {
        return Err(TransportError::MessageTooLarge {
            size: message.len(),
            max,
        });
    }
    if newline_framed && message.contains(['\n', '\r']) {
        return Err(TransportError::InvalidMessage(
            "message contains a line break".to_string(),
        ));
    }
    Ok(())
}
