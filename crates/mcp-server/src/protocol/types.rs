//! JSON-RPC 2.0 envelope types and MCP payload types

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::errors::McpError;

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version advertised by this server
pub const MCP_VERSION: &str = "1.0";

/// Method names served by the default method table
pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const SHUTDOWN: &str = "shutdown";
    pub const PING: &str = "ping";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";

    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    pub const STREAM_START: &str = "stream/start";
    pub const STREAM_READ: &str = "stream/read";
    pub const STREAM_CLOSE: &str = "stream/close";
    pub const BATCH_SUBMIT: &str = "batch/submit";
    pub const BATCH_CANCEL: &str = "batch/cancel";

    /// Methods that take no parameters
    pub const ZERO_PARAM: [&str; 2] = [SHUTDOWN, PING];
}

/// Request identifier. Only strings and integers are accepted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Convert a raw JSON value into an id, rejecting floats, booleans and containers
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for RequestId {
    fn from(value: i32) -> Self {
        Self::Number(i64::from(value))
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Request parameters: either positional or named
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    /// Bind the parameters to a typed argument struct.
    ///
    /// Named params bind by field name; positional params bind in declaration
    /// order, the same way serde reads a struct from a JSON array.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Positional(values) => serde_json::from_value(Value::Array(values.clone())),
            Self::Named(map) => serde_json::from_value(Value::Object(map.clone())),
        }
    }

    /// Look up a named parameter
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Named(map) => map.get(key),
            Self::Positional(_) => None,
        }
    }

    /// Look up a positional parameter
    pub fn at(&self, index: usize) -> Option<&Value> {
        match self {
            Self::Positional(values) => values.get(index),
            Self::Named(_) => None,
        }
    }

    /// The named parameter map, or `None` for positional params
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Named(map) => Some(map),
            Self::Positional(_) => None,
        }
    }

    /// Whether params arrived as a JSON object
    pub fn is_named(&self) -> bool {
        matches!(self, Self::Named(_))
    }

    /// Back to the raw JSON object or array
    pub fn into_value(self) -> Value {
        match self {
            Self::Positional(values) => Value::Array(values),
            Self::Named(map) => Value::Object(map),
        }
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self::Named(map)
    }
}

/// JSON-RPC request or notification (no id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    /// Create a request expecting a response
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    /// Create a notification (no id, no response)
    pub fn notification(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// No id, so no response may be sent
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Outcome of a call. Exactly one of `result` or `error` is present on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(McpError),
}

/// JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    /// Build a response from optional parts, enforcing the exactly-one-of rule
    pub fn new(
        id: Option<RequestId>,
        result: Option<Value>,
        error: Option<McpError>,
    ) -> Result<Self, McpError> {
        let outcome = match (result, error) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(error)) => Outcome::Error(error),
            (Some(_), Some(_)) => {
                return Err(McpError::invalid_request(
                    "Response cannot have both result and error",
                ))
            }
            (None, None) => {
                return Err(McpError::invalid_request(
                    "Response must have either result or error",
                ))
            }
        };
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome,
        })
    }

    /// Create a success response
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: Outcome::Result(result),
        }
    }

    /// Create an error response
    pub fn error(id: Option<RequestId>, error: McpError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: Outcome::Error(error),
        }
    }

    /// Whether this response carries an error object
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// The success payload, if any
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    pub fn error_object(&self) -> Option<&McpError> {
        match &self.outcome {
            Outcome::Error(error) => Some(error),
            Outcome::Result(_) => None,
        }
    }
}

/// A decoded inbound payload: one request or a batch array
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Single(Request),
    Batch(Vec<Request>),
}

/// Any well-formed JSON-RPC envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Batch(Vec<Request>),
    Response(Response),
}

/// Client info sent with `initialize`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Initialize request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// Server info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Initialize result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: super::capabilities::ServerCapabilities,
    pub server_info: ServerInfo,
    pub session_data: Value,
}

/// Params of the paginated list methods
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginatedParams {
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Tool call params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Prompt get params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptGetParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Params shared by the resource methods that take a single URI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUriParams {
    pub uri: String,
}

/// Params for `logging/setLevel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLevelParams {
    pub level: String,
}
