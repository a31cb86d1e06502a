//! Batch execution, chunked streaming and completion

mod batch;
mod completion;
mod handlers;
mod streaming;

pub use batch::{BatchProcessor, BatchRequest, BatchResponse, DEFAULT_BATCH_CONCURRENCY};
pub use completion::{
    CompletionChoice, CompletionEngine, CompletionModel, CompletionRequest, CompletionResponse,
    CompletionStream, EchoModel, SamplingConfig, SamplingMode, TemplateModel, DEFAULT_MODEL,
};
pub use handlers::{AdvancedFeatures, COMPLETION_STREAM, LOG_STREAM};
pub use streaming::{
    ChunkStream, LogStream, StreamFactory, StreamResult, StreamingChunk, StreamingManager,
};
