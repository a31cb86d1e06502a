//! Completion engine with pluggable named models

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::streaming::{ChunkStream, StreamingChunk};
use crate::protocol::{ErrorCode, McpError};

/// Sampling strategy hint passed through to models
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    #[default]
    Deterministic,
    Random,
    Temperature,
    TopK,
    TopP,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub mode: SamplingMode,
    pub temperature: f64,
    pub top_k: Option<u32>,
    pub top_p: Option<f64>,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            mode: SamplingMode::Deterministic,
            temperature: 0.7,
            top_k: None,
            top_p: None,
            max_tokens: 100,
            stop_sequences: Vec::new(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

fn default_model_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default = "default_model_name")]
    pub model: String,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub context: Option<Value>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            sampling: SamplingConfig::default(),
            stream: false,
            context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    pub finish_reason: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub choices: Vec<CompletionChoice>,
    pub model: String,
    pub created: i64,
    pub usage: Option<Value>,
}

impl CompletionResponse {
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.text.as_str())
    }
}

/// A text generator. Engines wrap the output into a [`CompletionResponse`].
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn generate(&self, prompt: &str, config: &SamplingConfig) -> anyhow::Result<String>;
}

/// Returns the prompt prefixed with `Echo: `
pub struct EchoModel;

#[async_trait]
impl CompletionModel for EchoModel {
    async fn generate(&self, prompt: &str, _config: &SamplingConfig) -> anyhow::Result<String> {
        Ok(format!("Echo: {}", prompt))
    }
}

/// Canned code snippets keyed on prompt keywords
pub struct TemplateModel;

#[async_trait]
impl CompletionModel for TemplateModel {
    async fn generate(&self, prompt: &str, _config: &SamplingConfig) -> anyhow::Result<String> {
        let lower = prompt.to_lowercase();
        let text = if lower.contains("function") {
            "fn example_function() {\n    todo!()\n}".to_string()
        } else if lower.contains("struct") || lower.contains("class") {
            "pub struct Example {\n    pub name: String,\n}".to_string()
        } else if lower.contains("import") || lower.contains("use") {
            "use std::collections::HashMap;\nuse std::sync::Arc;".to_string()
        } else {
            format!("// Completion for: {}", prompt)
        };
        Ok(text)
    }
}

pub const DEFAULT_MODEL: &str = "echo";

/// Model table plus the fallback model used for unknown names
pub struct CompletionEngine {
    models: RwLock<HashMap<String, Arc<dyn CompletionModel>>>,
    default_model: String,
}

impl Default for CompletionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionEngine {
    /// Engine with the built-in `echo` and `template` models, falling back
    /// to `echo` for unknown names
    pub fn new() -> Self {
        let engine = Self {
            models: RwLock::new(HashMap::new()),
            default_model: DEFAULT_MODEL.to_string(),
        };
        engine.register_model("echo", EchoModel);
        engine.register_model("template", TemplateModel);
        engine
    }

    /// Add or replace the model served under `name`
    pub fn register_model(&self, name: &str, model: impl CompletionModel + 'static) {
        self.models.write().insert(name.to_string(), Arc::new(model));
        info!(model = name, "Registered completion model");
    }

    /// Registered model names, sorted
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn resolve(&self, name: &str) -> Option<(String, Arc<dyn CompletionModel>)> {
        let models = self.models.read();
        models
            .get(name)
            .map(|m| (name.to_string(), Arc::clone(m)))
            .or_else(|| {
                models
                    .get(&self.default_model)
                    .map(|m| (self.default_model.clone(), Arc::clone(m)))
            })
    }

    /// Run a completion; unknown model names fall back to the default model
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, McpError> {
        let (model_name, model) = self.resolve(&request.model).ok_or_else(|| {
            McpError::new(ErrorCode::InternalError, "Completion failed: no models registered")
        })?;

        let text = model
            .generate(&request.prompt, &request.sampling)
            .await
            .map_err(|e| {
                error!(model = %model_name, error = %e, "Completion error");
                McpError::new(ErrorCode::InternalError, format!("Completion failed: {}", e))
            })?;

        debug!(model = %model_name, "Generated completion");
        Ok(CompletionResponse {
            id: uuid::Uuid::new_v4().to_string(),
            choices: vec![CompletionChoice {
                text,
                index: 0,
                finish_reason: "complete".to_string(),
                score: None,
            }],
            model: model_name,
            created: Utc::now().timestamp(),
            usage: None,
        })
    }
}

enum CompletionState {
    Pending(CompletionRequest),
    Emitting {
        id: String,
        chars: Vec<char>,
        chunk_size: usize,
        offset: usize,
        index: u64,
    },
    Done,
}

/// Streams an already computed completion in roughly ten text chunks
pub struct CompletionStream {
    engine: Arc<CompletionEngine>,
    state: CompletionState,
}

impl CompletionStream {
    pub fn new(engine: Arc<CompletionEngine>, request: CompletionRequest) -> Self {
        Self {
            engine,
            state: CompletionState::Pending(request),
        }
    }
}

#[async_trait]
impl ChunkStream for CompletionStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamingChunk>, McpError> {
        if let CompletionState::Pending(request) = &self.state {
            let response = self.engine.complete(request).await;
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    self.state = CompletionState::Done;
                    return Err(e);
                }
            };
            let chars: Vec<char> = response.text().unwrap_or_default().chars().collect();
            self.state = CompletionState::Emitting {
                id: response.id,
                chunk_size: (chars.len() / 10).max(1),
                chars,
                offset: 0,
                index: 0,
            };
        }

        let CompletionState::Emitting {
            id,
            chars,
            chunk_size,
            offset,
            index,
        } = &mut self.state
        else {
            return Ok(None);
        };

        // Empty text still yields one final chunk
        if *offset >= chars.len() && *index > 0 {
            self.state = CompletionState::Done;
            return Ok(None);
        }

        let end = (*offset + *chunk_size).min(chars.len());
        let text: String = chars[*offset..end].iter().collect();
        let mut chunk = StreamingChunk::new(id.clone(), "text", json!(text), *index);
        chunk.is_final = end >= chars.len();
        *offset = end;
        *index += 1;

        if chunk.is_final {
            self.state = CompletionState::Done;
        }
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    struct Silent;

    #[async_trait]
    impl CompletionModel for Silent {
        async fn generate(&self, _prompt: &str, _config: &SamplingConfig) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    #[async_trait]
    impl CompletionModel for Broken {
        async fn generate(&self, _prompt: &str, _config: &SamplingConfig) -> anyhow::Result<String> {
            anyhow::bail!("model offline")
        }
    }

    #[tokio::test]
    async fn test_echo_and_fallback() {
        let engine = CompletionEngine::new();
        let response = engine
            .complete(&CompletionRequest::new("hello", "echo"))
            .await
            .unwrap();
        assert_eq!(response.text(), Some("Echo: hello"));
        assert_eq!(response.model, "echo");

        let fallback = engine
            .complete(&CompletionRequest::new("hi", "missing-model"))
            .await
            .unwrap();
        assert_eq!(fallback.model, "echo");
    }

    #[tokio::test]
    async fn test_template_model() {
        let engine = CompletionEngine::new();
        let response = engine
            .complete(&CompletionRequest::new("write a function", "template"))
            .await
            .unwrap();
        assert!(response.text().unwrap().starts_with("fn example_function"));

        let response = engine
            .complete(&CompletionRequest::new("anything", "template"))
            .await
            .unwrap();
        assert_eq!(response.text(), Some("// Completion for: anything"));
    }

    #[tokio::test]
    async fn test_model_failure_is_internal_error() {
        let engine = CompletionEngine::new();
        engine.register_model("broken", Broken);
        let err = engine
            .complete(&CompletionRequest::new("x", "broken"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError.code());
        assert!(err.message.contains("model offline"));
    }

    #[tokio::test]
    async fn test_stream_reassembles_text() {
        let engine = Arc::new(CompletionEngine::new());
        let request = CompletionRequest::new("stream me please", "echo");
        let mut stream = CompletionStream::new(engine, request);

        let mut text = String::new();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            text.push_str(chunk.data.as_str().unwrap());
            chunks.push(chunk);
        }
        assert_eq!(text, "Echo: stream me please");
        assert!(chunks.last().unwrap().is_final);
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
        assert!(chunks.iter().all(|c| c.id == chunks[0].id));
    }

    #[tokio::test]
    async fn test_stream_empty_text_has_final_chunk() {
        let engine = Arc::new(CompletionEngine::new());
        engine.register_model("silent", Silent);
        let mut stream = CompletionStream::new(engine, CompletionRequest::new("x", "silent"));

        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert!(chunk.is_final);
        assert_eq!(chunk.data, json!(""));
        assert_eq!(chunk.index, 0);
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_surfaces_model_error() {
        let engine = Arc::new(CompletionEngine::new());
        engine.register_model("broken", Broken);
        let mut stream = CompletionStream::new(engine, CompletionRequest::new("x", "broken"));
        assert!(stream.next_chunk().await.is_err());
        assert!(stream.next_chunk().await.unwrap().is_none());
    }
}
