//! # code-index-mcp
//!
//! MCP (Model Context Protocol) engine for Code Index MCP: JSON-RPC 2.0
//! codec, method registry and router, request validation, batch execution,
//! chunked streaming, and stdio and WebSocket transports.

pub mod advanced;
pub mod config;
pub mod logging;
pub mod protocol;
mod server;
pub mod transport;

pub use config::{ConfigError, ServerConfig, TransportKind};
pub use protocol::{HandlerError, McpError, MethodHandler, MethodRegistry, Router, ServerCapabilities};
pub use server::{cancel_on_signal, McpServer, ServerMode};
pub use transport::{StdioTransport, Transport, TransportError, WebSocketClient, WebSocketServer};
