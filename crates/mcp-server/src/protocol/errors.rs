//! Wire error taxonomy: standard JSON-RPC codes, MCP extended ranges,
//! handler error conversion and severity-based logging.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Every error code this server emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    // JSON-RPC 2.0
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,

    // Implementation-defined server errors
    RequestCancelled = -32000,
    UnknownError = -32001,
    ServerNotInitialized = -32002,

    // Resources
    ResourceNotFound = -32800,
    ResourceAccessDenied = -32801,
    ResourceUnavailable = -32802,
    InvalidResourceUri = -32803,

    // Tools
    ToolNotFound = -32810,
    ToolExecutionFailed = -32811,
    InvalidToolArguments = -32812,
    ToolTimeout = -32813,

    // Transport
    TransportError = -32820,
    ConnectionClosed = -32821,
    MessageTooLarge = -32822,

    // Sessions
    SessionNotFound = -32830,
    SessionExpired = -32831,
    SessionAlreadyInitialized = -32832,

    // Subscriptions
    SubscriptionNotFound = -32840,
    SubscriptionFailed = -32841,
    AlreadySubscribed = -32842,

    // Auth
    Unauthorized = -32850,
    Forbidden = -32851,
    InvalidToken = -32852,

    // Rate limiting
    RateLimitExceeded = -32860,
    QuotaExceeded = -32861,

    // General MCP
    CapabilityNotSupported = -32890,
    ProtocolVersionMismatch = -32891,
    McpInternalError = -32899,
}

impl ErrorCode {
    const ALL: [ErrorCode; 33] = [
        Self::ParseError,
        Self::InvalidRequest,
        Self::MethodNotFound,
        Self::InvalidParams,
        Self::InternalError,
        Self::RequestCancelled,
        Self::UnknownError,
        Self::ServerNotInitialized,
        Self::ResourceNotFound,
        Self::ResourceAccessDenied,
        Self::ResourceUnavailable,
        Self::InvalidResourceUri,
        Self::ToolNotFound,
        Self::ToolExecutionFailed,
        Self::InvalidToolArguments,
        Self::ToolTimeout,
        Self::TransportError,
        Self::ConnectionClosed,
        Self::MessageTooLarge,
        Self::SessionNotFound,
        Self::SessionExpired,
        Self::SessionAlreadyInitialized,
        Self::SubscriptionNotFound,
        Self::SubscriptionFailed,
        Self::AlreadySubscribed,
        Self::Unauthorized,
        Self::Forbidden,
        Self::InvalidToken,
        Self::RateLimitExceeded,
        Self::QuotaExceeded,
        Self::CapabilityNotSupported,
        Self::ProtocolVersionMismatch,
        Self::McpInternalError,
    ];

    /// Numeric wire code
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Reverse lookup from a wire code
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Default human readable message
    pub fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::RequestCancelled => "Request cancelled",
            Self::UnknownError => "Unknown error",
            Self::ServerNotInitialized => "Server not initialized",
            Self::ResourceNotFound => "Resource not found",
            Self::ResourceAccessDenied => "Resource access denied",
            Self::ResourceUnavailable => "Resource unavailable",
            Self::InvalidResourceUri => "Invalid resource URI",
            Self::ToolNotFound => "Tool not found",
            Self::ToolExecutionFailed => "Tool execution failed",
            Self::InvalidToolArguments => "Invalid tool arguments",
            Self::ToolTimeout => "Tool timeout",
            Self::TransportError => "Transport error",
            Self::ConnectionClosed => "Connection closed",
            Self::MessageTooLarge => "Message too large",
            Self::SessionNotFound => "Session not found",
            Self::SessionExpired => "Session expired",
            Self::SessionAlreadyInitialized => "Session already initialized",
            Self::SubscriptionNotFound => "Subscription not found",
            Self::SubscriptionFailed => "Subscription failed",
            Self::AlreadySubscribed => "Already subscribed",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::InvalidToken => "Invalid token",
            Self::RateLimitExceeded => "Rate limit exceeded",
            Self::QuotaExceeded => "Quota exceeded",
            Self::CapabilityNotSupported => "Capability not supported",
            Self::ProtocolVersionMismatch => "Protocol version mismatch",
            Self::McpInternalError => "MCP internal error",
        }
    }
}

/// Log level chosen for an error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Internal failures map to `Error` and missing targets to `Warning`;
    /// everything else is `Info`
    pub fn for_code(code: i32) -> Self {
        match ErrorCode::from_code(code) {
            Some(
                ErrorCode::InternalError
                | ErrorCode::McpInternalError
                | ErrorCode::ToolExecutionFailed,
            ) => Self::Error,
            Some(
                ErrorCode::MethodNotFound
                | ErrorCode::ResourceNotFound
                | ErrorCode::ToolNotFound
                | ErrorCode::SessionNotFound
                | ErrorCode::SubscriptionNotFound,
            ) => Self::Warning,
            _ => Self::Info,
        }
    }
}

fn default_should_log() -> bool {
    true
}

/// JSON-RPC error object.
///
/// `context` is merged into `data` on serialization; `should_log` never
/// reaches the wire.
#[derive(Debug, Clone, PartialEq, Error, Deserialize)]
#[error("JSON-RPC error {code}: {message}")]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(skip)]
    pub context: Map<String, Value>,
    #[serde(skip, default = "default_should_log")]
    pub should_log: bool,
}

impl McpError {
    /// Create an error with a custom message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::with_code(code.code(), message)
    }

    /// Create an error from a raw numeric code
    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            context: Map::new(),
            should_log: true,
        }
    }

    /// Attach data
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a context entry, merged into `data` on the wire
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Mark as an expected error that should not be logged
    pub fn quiet(mut self) -> Self {
        self.should_log = false;
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    pub fn severity(&self) -> Severity {
        Severity::for_code(self.code)
    }

    /// `data` with `context` merged in. Existing data keys win; scalar data
    /// is kept under `value`.
    pub fn effective_data(&self) -> Option<Value> {
        if self.context.is_empty() {
            return self.data.clone();
        }
        let mut merged = match &self.data {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        for (key, value) in &self.context {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Some(Value::Object(merged))
    }

    /// Emit a log line for this error at the severity its code maps to
    pub fn log(&self, method: Option<&str>) {
        if !self.should_log {
            return;
        }
        let method = method.unwrap_or("-");
        match self.severity() {
            Severity::Error => {
                tracing::error!(code = self.code, method = %method, data = ?self.data, "{}", self.message)
            }
            Severity::Warning => {
                tracing::warn!(code = self.code, method = %method, "{}", self.message)
            }
            Severity::Info => {
                tracing::info!(code = self.code, method = %method, "{}", self.message)
            }
        }
    }

    /// Parse error
    pub fn parse_error(detail: impl AsRef<str>) -> Self {
        Self::new(
            ErrorCode::ParseError,
            format!("Parse error: {}", detail.as_ref()),
        )
    }

    /// Invalid request error
    pub fn invalid_request(detail: impl AsRef<str>) -> Self {
        Self::new(
            ErrorCode::InvalidRequest,
            format!("Invalid Request: {}", detail.as_ref()),
        )
    }

    /// Method not found error. Expected in normal operation, so not logged.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
        .with_data(json!({ "method": method }))
        .quiet()
    }

    /// Invalid params error
    pub fn invalid_params(detail: impl AsRef<str>) -> Self {
        Self::new(
            ErrorCode::InvalidParams,
            format!("Invalid params: {}", detail.as_ref()),
        )
    }

    /// Internal error
    pub fn internal_error(detail: impl AsRef<str>) -> Self {
        Self::new(
            ErrorCode::InternalError,
            format!("Internal error: {}", detail.as_ref()),
        )
    }

    pub fn server_not_initialized(method: &str) -> Self {
        Self::new(
            ErrorCode::ServerNotInitialized,
            "Server not initialized. Call 'initialize' first.",
        )
        .with_data(json!({ "method": method }))
    }

    pub fn capability_not_supported(capability: &str) -> Self {
        Self::new(
            ErrorCode::CapabilityNotSupported,
            format!("Capability not supported: {}", capability),
        )
        .with_data(json!({ "capability": capability }))
    }

    pub fn request_cancelled(detail: impl AsRef<str>) -> Self {
        Self::new(
            ErrorCode::RequestCancelled,
            format!("Request cancelled: {}", detail.as_ref()),
        )
    }

    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("Resource not found: {}", uri),
        )
        .with_context("uri", json!(uri))
    }

    pub fn tool_not_found(name: &str) -> Self {
        Self::new(ErrorCode::ToolNotFound, format!("Tool not found: {}", name))
            .with_context("tool", json!(name))
    }

    /// Convert any error into an internal error carrying `{type, message, stack}`
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let type_name = short_type_name(std::any::type_name::<E>());
        let mut stack = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(Value::String(cause.to_string()));
            source = cause.source();
        }
        Self::internal_payload(type_name, err.to_string(), stack)
    }

    /// Convert a handler's `anyhow` error into an internal error.
    ///
    /// The chain's outermost message becomes `data.message`; the causes
    /// below it form `data.stack`.
    pub fn from_internal(err: &anyhow::Error) -> Self {
        let stack = err
            .chain()
            .skip(1)
            .map(|cause| Value::String(cause.to_string()))
            .collect();
        Self::internal_payload("InternalError", err.to_string(), stack)
    }

    fn internal_payload(type_name: &str, message: String, stack: Vec<Value>) -> Self {
        Self::new(ErrorCode::InternalError, "Internal error").with_data(json!({
            "type": type_name,
            "message": message,
            "stack": stack,
        }))
    }
}

fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

impl Serialize for McpError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.effective_data();
        let len = if data.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("McpError", len)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(data) = &data {
            state.serialize_field("data", data)?;
        }
        state.end()
    }
}

impl From<ErrorCode> for McpError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.message())
    }
}

/// Error type returned by method handlers
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Typed wire error, passed through unchanged
    #[error(transparent)]
    Rpc(#[from] McpError),

    /// Arguments did not bind to the handler's parameter shape
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Anything else; converted to an internal error at the router
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    /// The single conversion point from handler failures to wire errors
    pub fn into_mcp_error(self) -> McpError {
        match self {
            Self::Rpc(err) => err,
            Self::InvalidParams(msg) => McpError::invalid_params(msg),
            Self::Internal(err) => McpError::from_internal(&err),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::ServerNotInitialized.code(), -32002);
        assert_eq!(ErrorCode::InvalidResourceUri.code(), -32803);
        assert_eq!(ErrorCode::McpInternalError.code(), -32899);
        assert_eq!(ErrorCode::from_code(-32840), Some(ErrorCode::SubscriptionNotFound));
        assert_eq!(ErrorCode::from_code(-1), None);
    }

    #[test]
    fn test_serialization_is_compact_and_deterministic() {
        let err = McpError::new(ErrorCode::InvalidParams, "bad");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"code":-32602,"message":"bad"}"#
        );
    }

    #[test]
    fn test_context_merged_into_data() {
        let err = McpError::new(ErrorCode::ResourceNotFound, "missing")
            .with_data(json!({"uri": "file:///a"}))
            .with_context("attempt", json!(2));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["data"]["uri"], "file:///a");
        assert_eq!(json["data"]["attempt"], 2);
        assert!(json.get("context").is_none());
        assert!(json.get("should_log").is_none());
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(Severity::for_code(-32603), Severity::Error);
        assert_eq!(Severity::for_code(-32811), Severity::Error);
        assert_eq!(Severity::for_code(-32601), Severity::Warning);
        assert_eq!(Severity::for_code(-32800), Severity::Warning);
        assert_eq!(Severity::for_code(-32602), Severity::Info);
    }

    #[test]
    fn test_method_not_found_is_quiet() {
        assert!(!McpError::method_not_found("x").should_log);
        assert!(McpError::internal_error("x").should_log);
    }

    #[test]
    fn test_from_internal_keeps_chain() {
        let err = anyhow::anyhow!("disk full").context("writing index");
        let mcp = McpError::from_internal(&err);
        assert_eq!(mcp.code, -32603);
        let data = mcp.data.unwrap();
        assert_eq!(data["message"], "writing index");
        assert_eq!(data["stack"][0], "disk full");
        assert_eq!(data["type"], "InternalError");
    }

    #[test]
    fn test_from_error_uses_type_name() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let mcp = McpError::from_error(&io);
        assert_eq!(mcp.data.unwrap()["type"], "Error");
    }

    #[test]
    fn test_handler_error_conversion() {
        let bind: HandlerError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert_eq!(bind.into_mcp_error().code, -32602);

        let rpc = HandlerError::Rpc(McpError::tool_not_found("grep"));
        assert_eq!(rpc.into_mcp_error().code, -32810);
    }
}
