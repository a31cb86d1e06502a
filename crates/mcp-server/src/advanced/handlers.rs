//! Extended methods for completion, streaming and batches

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::debug;

use super::batch::{BatchProcessor, BatchRequest};
use super::completion::{CompletionEngine, CompletionRequest, CompletionStream};
use super::streaming::{LogStream, StreamResult, StreamingManager};
use crate::protocol::{
    method, typed, HandlerError, McpError, MethodHandler, MethodRegistry, Params, Router,
};

pub const COMPLETION_STREAM: &str = "completion";
pub const LOG_STREAM: &str = "logs";

#[derive(Debug, Deserialize)]
struct StreamStartParams {
    #[serde(rename = "type")]
    stream_type: String,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct StreamIdParams {
    stream_id: String,
}

#[derive(Debug, Deserialize)]
struct BatchIdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SamplingMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelPreferences {
    model: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMessageParams {
    messages: Vec<SamplingMessage>,
    #[serde(default)]
    model_preferences: Option<ModelPreferences>,
}

impl CreateMessageParams {
    fn into_completion(self) -> CompletionRequest {
        let prompt = self
            .messages
            .into_iter()
            .last()
            .map(|m| m.content)
            .unwrap_or_default();
        let prefs = self.model_preferences.unwrap_or_default();
        let mut request =
            CompletionRequest::new(prompt, prefs.model.unwrap_or_else(|| "default".to_string()));
        if let Some(temperature) = prefs.temperature {
            request.sampling.temperature = temperature;
        }
        if let Some(max_tokens) = prefs.max_tokens {
            request.sampling.max_tokens = max_tokens;
        }
        if let Some(stop) = prefs.stop_sequences {
            request.sampling.stop_sequences = stop;
        }
        request
    }
}

/// Completion engine, stream table and batch processor behind the
/// extended methods
pub struct AdvancedFeatures {
    completion: Arc<CompletionEngine>,
    streaming: StreamingManager,
    batches: BatchProcessor,
}

impl AdvancedFeatures {
    pub fn new(router: Arc<Router>, batch_concurrency: usize) -> Self {
        let completion = Arc::new(CompletionEngine::new());
        let streaming = StreamingManager::new();

        let engine = Arc::clone(&completion);
        streaming.register_stream_type(COMPLETION_STREAM, move |params: Value| -> StreamResult {
            let request: CompletionRequest = serde_json::from_value(params)
                .map_err(|e| McpError::invalid_params(e.to_string()))?;
            Ok(Box::new(CompletionStream::new(Arc::clone(&engine), request)))
        });
        streaming.register_stream_type(LOG_STREAM, |params: Value| -> StreamResult {
            Ok(Box::new(LogStream::new(&params)))
        });

        Self {
            completion,
            streaming,
            batches: BatchProcessor::with_concurrency(router, batch_concurrency),
        }
    }

    pub fn completion(&self) -> &Arc<CompletionEngine> {
        &self.completion
    }

    pub fn streaming(&self) -> &StreamingManager {
        &self.streaming
    }

    pub fn batches(&self) -> &BatchProcessor {
        &self.batches
    }

    /// Close every open stream; returns how many were open
    pub fn shutdown(&self) -> usize {
        self.streaming.close_all_streams()
    }

    fn start_stream(&self, params: StreamStartParams) -> Result<Value, McpError> {
        let stream_id = params
            .stream_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.streaming
            .start_stream(&stream_id, &params.stream_type, params.params)?;
        Ok(json!({
            "stream_id": stream_id,
            "type": params.stream_type,
            "status": "started",
        }))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Value, HandlerError> {
        if request.stream {
            let params = serde_json::to_value(&request).map_err(|e| HandlerError::Internal(e.into()))?;
            return Ok(self.start_stream(StreamStartParams {
                stream_type: COMPLETION_STREAM.to_string(),
                stream_id: None,
                params,
            })?);
        }
        let response = self.completion.complete(&request).await?;
        serde_json::to_value(response).map_err(|e| HandlerError::Internal(e.into()))
    }

    /// Register the extended methods plus `sampling/createMessage`.
    /// Handlers hold a weak reference, so the registry never keeps the
    /// features (and through them the router) alive.
    pub fn register(self: &Arc<Self>, registry: &MethodRegistry) {
        let this = Arc::downgrade(self);
        registry.register(
            MethodHandler::new(
                method::COMPLETION_COMPLETE,
                typed(move |request: CompletionRequest| {
                    let this = this.clone();
                    async move { upgrade(&this)?.complete(request).await }
                }),
            )
            .with_description("Complete a prompt with a named model"),
        );

        let this = Arc::downgrade(self);
        registry.register(
            MethodHandler::new(
                method::SAMPLING_CREATE_MESSAGE,
                typed(move |params: CreateMessageParams| {
                    let this = this.clone();
                    async move {
                        let features = upgrade(&this)?;
                        let response = features.completion.complete(&params.into_completion()).await?;
                        Ok::<_, HandlerError>(json!({
                            "role": "assistant",
                            "content": {
                                "type": "text",
                                "text": response.text().unwrap_or_default(),
                            },
                            "model": response.model,
                            "stopReason": "endTurn",
                        }))
                    }
                }),
            )
            .with_description("Sample a message from the completion engine"),
        );

        let this = Arc::downgrade(self);
        registry.register(
            MethodHandler::new(
                method::STREAM_START,
                typed(move |params: StreamStartParams| {
                    let result = upgrade(&this).and_then(|f| f.start_stream(params).map_err(HandlerError::from));
                    async move { result }
                }),
            )
            .with_description("Open a chunked stream"),
        );

        let this = Arc::downgrade(self);
        registry.register(
            MethodHandler::new(
                method::STREAM_READ,
                typed(move |params: StreamIdParams| {
                    let this = this.clone();
                    async move {
                        let features = upgrade(&this)?;
                        let chunk = features.streaming.get_stream_chunk(&params.stream_id).await;
                        Ok::<_, HandlerError>(match chunk {
                            Some(chunk) => json!({"stream_id": params.stream_id, "chunk": chunk}),
                            None => json!({
                                "stream_id": params.stream_id,
                                "chunk": null,
                                "status": "ended",
                            }),
                        })
                    }
                }),
            )
            .with_description("Pull the next chunk of a stream"),
        );

        let this = Arc::downgrade(self);
        registry.register(
            MethodHandler::new(
                method::STREAM_CLOSE,
                typed(move |params: StreamIdParams| {
                    let result = upgrade(&this).map(|f| {
                        let closed = f.streaming.close_stream(&params.stream_id);
                        json!({"stream_id": params.stream_id, "closed": closed})
                    });
                    async move { result }
                }),
            )
            .with_description("Close a stream"),
        );

        let this = Arc::downgrade(self);
        registry.register(
            MethodHandler::new(method::BATCH_SUBMIT, move |params: Option<Params>| {
                let this = this.clone();
                async move {
                    let batch =
                        BatchRequest::from_value(params.map(Params::into_value).unwrap_or(Value::Null))?;
                    debug!(batch_id = %batch.id, "Batch submitted");
                    let response = upgrade(&this)?.batches.process_batch(batch).await?;
                    serde_json::to_value(response).map_err(|e| HandlerError::Internal(e.into()))
                }
            })
            .with_description("Run a batch of requests"),
        );

        let this = Arc::downgrade(self);
        registry.register(
            MethodHandler::new(
                method::BATCH_CANCEL,
                typed(move |params: BatchIdParams| {
                    let this = this.clone();
                    async move {
                        let cancelled = upgrade(&this)?.batches.cancel_batch(&params.id).await;
                        Ok::<_, HandlerError>(json!({"id": params.id, "cancelled": cancelled}))
                    }
                }),
            )
            .with_description("Cancel a running batch"),
        );
    }
}

fn upgrade(this: &Weak<AdvancedFeatures>) -> Result<Arc<AdvancedFeatures>, HandlerError> {
    this.upgrade()
        .ok_or_else(|| HandlerError::Rpc(McpError::internal_error("server is shutting down")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CoreMethods, ErrorCode, Request};

    async fn setup() -> (Arc<Router>, Arc<AdvancedFeatures>) {
        let registry = Arc::new(MethodRegistry::new());
        Arc::new(CoreMethods::default()).register(&registry);
        let router = Arc::new(Router::new(Arc::clone(&registry)));
        let features = Arc::new(AdvancedFeatures::new(Arc::clone(&router), 4));
        features.register(&registry);

        router
            .route(&Request::new(
                0,
                method::INITIALIZE,
                Some(named(json!({"protocolVersion": "1.0", "capabilities": {}}))),
            ))
            .await
            .unwrap();
        (router, features)
    }

    fn named(value: Value) -> Params {
        Params::Named(value.as_object().cloned().unwrap())
    }

    async fn call(router: &Router, name: &str, params: Value) -> Result<Value, McpError> {
        router.route(&Request::new(1, name, Some(named(params)))).await
    }

    #[tokio::test]
    async fn test_completion_complete() {
        let (router, _features) = setup().await;
        let result = call(&router, method::COMPLETION_COMPLETE, json!({"prompt": "hi", "model": "echo"}))
            .await
            .unwrap();
        assert_eq!(result["choices"][0]["text"], "Echo: hi");
        assert_eq!(result["model"], "echo");
    }

    #[tokio::test]
    async fn test_streamed_completion_reads_to_end() {
        let (router, _features) = setup().await;
        let started = call(
            &router,
            method::COMPLETION_COMPLETE,
            json!({"prompt": "hello there", "stream": true}),
        )
        .await
        .unwrap();
        let stream_id = started["stream_id"].as_str().unwrap().to_string();

        let mut text = String::new();
        loop {
            let read = call(&router, method::STREAM_READ, json!({"stream_id": stream_id}))
                .await
                .unwrap();
            if read["status"] == "ended" {
                break;
            }
            text.push_str(read["chunk"]["data"].as_str().unwrap());
            if read["chunk"]["is_final"] == true {
                break;
            }
        }
        assert_eq!(text, "Echo: hello there");
    }

    #[tokio::test]
    async fn test_stream_id_reusable_after_final() {
        let (router, features) = setup().await;
        let params = json!({"type": "logs", "stream_id": "tail", "params": {"level": "DEBUG"}});

        let started = call(&router, method::STREAM_START, params.clone()).await.unwrap();
        assert_eq!(started, json!({"stream_id": "tail", "type": "logs", "status": "started"}));

        let err = call(&router, method::STREAM_START, params.clone()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams.code());

        let mut reads = 0;
        loop {
            let read = call(&router, method::STREAM_READ, json!({"stream_id": "tail"}))
                .await
                .unwrap();
            reads += 1;
            if read["chunk"]["is_final"] == true {
                break;
            }
        }
        assert_eq!(reads, LogStream::LENGTH);
        assert!(features.streaming().active_streams().is_empty());
        assert!(call(&router, method::STREAM_START, params).await.is_ok());
    }

    #[tokio::test]
    async fn test_stream_start_errors() {
        let (router, _features) = setup().await;
        let err = call(&router, method::STREAM_START, json!({"stream_id": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams.code());

        let err = call(&router, method::STREAM_START, json!({"type": "video"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound.code());
    }

    #[tokio::test]
    async fn test_stream_close_and_read_unknown() {
        let (router, _features) = setup().await;
        call(&router, method::STREAM_START, json!({"type": "logs", "stream_id": "s"}))
            .await
            .unwrap();
        let closed = call(&router, method::STREAM_CLOSE, json!({"stream_id": "s"})).await.unwrap();
        assert_eq!(closed, json!({"stream_id": "s", "closed": true}));

        let read = call(&router, method::STREAM_READ, json!({"stream_id": "s"})).await.unwrap();
        assert_eq!(read, json!({"stream_id": "s", "chunk": null, "status": "ended"}));

        let closed = call(&router, method::STREAM_CLOSE, json!({"stream_id": "s"})).await.unwrap();
        assert_eq!(closed["closed"], false);
    }

    #[tokio::test]
    async fn test_batch_submit_sequential_ordering() {
        let (router, features) = setup().await;
        let result = call(
            &router,
            method::BATCH_SUBMIT,
            json!({
                "id": "b1",
                "parallel": false,
                "requests": [
                    {"jsonrpc": "2.0", "method": "ping", "id": "a"},
                    {"jsonrpc": "2.0", "method": "tools/call", "params": {"name": "grep"}, "id": "b"},
                    {"jsonrpc": "2.0", "method": "ping", "id": "c"}
                ]
            }),
        )
        .await
        .unwrap();

        let responses = result["responses"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["result"], json!({"pong": true}));
        assert_eq!(responses[1]["error"]["code"], ErrorCode::ToolNotFound.code());
        assert_eq!(result["completed"], 1);
        assert_eq!(result["failed"], 1);
        assert!(features.batches().active_batches().is_empty());
    }

    #[tokio::test]
    async fn test_batch_cancel_unknown() {
        let (router, _features) = setup().await;
        let result = call(&router, method::BATCH_CANCEL, json!({"id": "nope"})).await.unwrap();
        assert_eq!(result, json!({"id": "nope", "cancelled": false}));
    }

    #[tokio::test]
    async fn test_sampling_create_message() {
        let (router, _features) = setup().await;
        let result = call(
            &router,
            method::SAMPLING_CREATE_MESSAGE,
            json!({
                "messages": [{"role": "user", "content": "summarize"}],
                "modelPreferences": {"temperature": 0.2}
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["role"], "assistant");
        assert_eq!(result["content"]["text"], "Echo: summarize");
        assert_eq!(result["stopReason"], "endTurn");
    }

    #[tokio::test]
    async fn test_dropped_features_fail_cleanly() {
        let (router, features) = setup().await;
        drop(features);
        let err = call(&router, method::STREAM_CLOSE, json!({"stream_id": "s"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError.code());
    }
}
