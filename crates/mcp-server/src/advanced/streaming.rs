//! Pull-based chunked streams.
//!
//! A stream is a state object advanced one chunk at a time by
//! [`StreamingManager::get_stream_chunk`]; nothing runs between pulls.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::protocol::{ErrorCode, McpError};

/// One chunk of a stream, ordered by `index`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingChunk {
    pub id: String,
    #[serde(rename = "type")]
    pub chunk_type: String,
    pub data: Value,
    pub index: u64,
    pub timestamp: f64,
    pub is_final: bool,
}

impl StreamingChunk {
    pub fn new(id: impl Into<String>, chunk_type: impl Into<String>, data: Value, index: u64) -> Self {
        Self {
            id: id.into(),
            chunk_type: chunk_type.into(),
            data,
            index,
            timestamp: now_secs(),
            is_final: false,
        }
    }

    pub fn last(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Terminal chunk reporting a failed stream
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(id, "error", Value::String(message.into()), 0).last()
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// A stream's cursor. `Ok(None)` means exhausted.
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<StreamingChunk>, McpError>;
}

pub type StreamResult = Result<Box<dyn ChunkStream>, McpError>;

/// Builds a stream of one type from its start params
pub trait StreamFactory: Send + Sync {
    fn create(&self, params: Value) -> StreamResult;
}

impl<F> StreamFactory for F
where
    F: Fn(Value) -> StreamResult + Send + Sync,
{
    fn create(&self, params: Value) -> StreamResult {
        (self)(params)
    }
}

type SharedStream = Arc<tokio::sync::Mutex<Box<dyn ChunkStream>>>;

/// Owns the table of open streams
#[derive(Default)]
pub struct StreamingManager {
    factories: RwLock<HashMap<String, Arc<dyn StreamFactory>>>,
    streams: Mutex<HashMap<String, SharedStream>>,
}

impl StreamingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the factory behind `stream_type`
    pub fn register_stream_type(&self, stream_type: &str, factory: impl StreamFactory + 'static) {
        self.factories
            .write()
            .insert(stream_type.to_string(), Arc::new(factory));
        info!(stream_type, "Registered stream type");
    }

    pub fn stream_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Open a stream under `stream_id`
    pub fn start_stream(&self, stream_id: &str, stream_type: &str, params: Value) -> Result<(), McpError> {
        if self.streams.lock().contains_key(stream_id) {
            return Err(McpError::new(
                ErrorCode::InvalidParams,
                format!("Stream already exists: {}", stream_id),
            ));
        }

        let factory = self.factories.read().get(stream_type).cloned().ok_or_else(|| {
            McpError::new(
                ErrorCode::MethodNotFound,
                format!("Unknown stream type: {}", stream_type),
            )
        })?;

        let stream = factory.create(params).map_err(|e| {
            error!(stream_id, error = %e.message, "Failed to start stream");
            McpError::new(
                ErrorCode::InternalError,
                format!("Failed to start stream: {}", e.message),
            )
        })?;

        let mut streams = self.streams.lock();
        if streams.contains_key(stream_id) {
            return Err(McpError::new(
                ErrorCode::InvalidParams,
                format!("Stream already exists: {}", stream_id),
            ));
        }
        streams.insert(stream_id.to_string(), Arc::new(tokio::sync::Mutex::new(stream)));
        info!(stream_id, stream_type, "Started stream");
        Ok(())
    }

    /// Pull the next chunk. A final chunk, exhaustion or a failure closes
    /// the stream; failures surface as a terminal error chunk.
    pub async fn get_stream_chunk(&self, stream_id: &str) -> Option<StreamingChunk> {
        let stream = self.streams.lock().get(stream_id).cloned()?;
        let next = stream.lock().await.next_chunk().await;
        match next {
            Ok(Some(chunk)) => {
                if chunk.is_final {
                    self.remove_if_same(stream_id, &stream);
                }
                Some(chunk)
            }
            Ok(None) => {
                self.remove_if_same(stream_id, &stream);
                None
            }
            Err(e) => {
                error!(stream_id, error = %e.message, "Stream failed");
                self.remove_if_same(stream_id, &stream);
                Some(StreamingChunk::error(stream_id, e.message))
            }
        }
    }

    fn remove_if_same(&self, stream_id: &str, stream: &SharedStream) {
        let mut streams = self.streams.lock();
        if streams.get(stream_id).is_some_and(|s| Arc::ptr_eq(s, stream)) {
            streams.remove(stream_id);
            info!(stream_id, "Closed stream");
        }
    }

    /// Remove a stream; unknown ids are a no-op
    pub fn close_stream(&self, stream_id: &str) -> bool {
        let closed = self.streams.lock().remove(stream_id).is_some();
        if closed {
            info!(stream_id, "Closed stream");
        }
        closed
    }

    pub fn active_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop every open stream; returns how many were closed
    pub fn close_all_streams(&self) -> usize {
        let count = {
            let mut streams = self.streams.lock();
            let count = streams.len();
            streams.clear();
            count
        };
        info!(count, "Closed all streams");
        count
    }
}

/// Ten log lines at a requested level
pub struct LogStream {
    level: String,
    count: u64,
}

impl LogStream {
    pub const LENGTH: u64 = 10;

    pub fn new(params: &Value) -> Self {
        let level = params
            .get("level")
            .and_then(Value::as_str)
            .unwrap_or("INFO")
            .to_string();
        Self { level, count: 0 }
    }
}

#[async_trait]
impl ChunkStream for LogStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamingChunk>, McpError> {
        if self.count >= Self::LENGTH {
            return Ok(None);
        }
        let index = self.count;
        self.count += 1;
        let mut chunk = StreamingChunk::new(
            uuid::Uuid::new_v4().to_string(),
            "log",
            json!(format!("[{}] Log message {}", self.level, index)),
            index,
        );
        chunk.is_final = index == Self::LENGTH - 1;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl ChunkStream for Failing {
        async fn next_chunk(&mut self) -> Result<Option<StreamingChunk>, McpError> {
            Err(McpError::internal_error("backend went away"))
        }
    }

    struct Empty;

    #[async_trait]
    impl ChunkStream for Empty {
        async fn next_chunk(&mut self) -> Result<Option<StreamingChunk>, McpError> {
            Ok(None)
        }
    }

    fn manager() -> StreamingManager {
        let manager = StreamingManager::new();
        manager.register_stream_type("logs", |params: Value| -> StreamResult {
            Ok(Box::new(LogStream::new(&params)))
        });
        manager.register_stream_type("failing", |_params: Value| -> StreamResult {
            Ok(Box::new(Failing))
        });
        manager.register_stream_type("empty", |_params: Value| -> StreamResult {
            Ok(Box::new(Empty))
        });
        manager.register_stream_type("broken", |_params: Value| -> StreamResult {
            Err(McpError::invalid_params("missing prompt"))
        });
        manager
    }

    #[tokio::test]
    async fn test_log_stream_runs_to_final() {
        let manager = manager();
        manager.start_stream("s1", "logs", json!({"level": "WARN"})).unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = manager.get_stream_chunk("s1").await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[0].data, json!("[WARN] Log message 0"));
        assert!(chunks[9].is_final);
        assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i as u64));
        assert!(manager.active_streams().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_until_final() {
        let manager = manager();
        manager.start_stream("dup", "logs", json!({})).unwrap();
        let err = manager.start_stream("dup", "logs", json!({})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams.code());

        loop {
            let chunk = manager.get_stream_chunk("dup").await.unwrap();
            if chunk.is_final {
                break;
            }
        }
        assert!(manager.start_stream("dup", "logs", json!({})).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_type_and_factory_failure() {
        let manager = manager();
        let err = manager.start_stream("a", "nope", json!({})).unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound.code());

        let err = manager.start_stream("b", "broken", json!({})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError.code());
        assert!(manager.active_streams().is_empty());
    }

    #[tokio::test]
    async fn test_failure_yields_terminal_error_chunk() {
        let manager = manager();
        manager.start_stream("f", "failing", json!({})).unwrap();
        let chunk = manager.get_stream_chunk("f").await.unwrap();
        assert_eq!(chunk.chunk_type, "error");
        assert!(chunk.is_final);
        assert_eq!(chunk.id, "f");
        assert!(manager.get_stream_chunk("f").await.is_none());
    }

    #[tokio::test]
    async fn test_exhaustion_closes_stream() {
        let manager = manager();
        manager.start_stream("e", "empty", json!({})).unwrap();
        assert!(manager.get_stream_chunk("e").await.is_none());
        assert!(!manager.close_stream("e"));
    }

    #[tokio::test]
    async fn test_close_and_close_all() {
        let manager = manager();
        manager.start_stream("x", "logs", json!({})).unwrap();
        manager.start_stream("y", "logs", json!({})).unwrap();
        assert_eq!(manager.active_streams(), vec!["x".to_string(), "y".to_string()]);

        assert!(manager.close_stream("x"));
        assert!(!manager.close_stream("x"));
        assert!(!manager.close_stream("never"));
        assert_eq!(manager.close_all_streams(), 1);
        assert!(manager.get_stream_chunk("y").await.is_none());
    }
}
