//! Layered request validation: initialization gate, params shape, type
//! coercion, JSON schema, custom constraints and capability gating.

use regex::Regex;
use serde_json::{json, Map, Number, Value};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use super::capabilities::CapabilityMap;
use super::errors::McpError;
use super::registry::{schema_error, MethodHandler, MethodRegistry};
use super::router::SessionState;
use super::types::{method, Params};

static URI_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*:").expect("valid regex"));

static URI_PARTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z][a-zA-Z0-9+.-]*):(.+)$").expect("valid regex"));

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").expect("valid regex"));

/// Common URI schemes
pub const STANDARD_SCHEMES: [&str; 10] = [
    "file", "http", "https", "ftp", "sftp", "git", "ssh", "ws", "wss", "data",
];

/// MCP-specific URI schemes
pub const MCP_SCHEMES: [&str; 8] = [
    "mcp", "resource", "index", "code", "symbol", "ast", "graph", "cache",
];

/// Default protocol versions accepted by `initialize`
pub const DEFAULT_PROTOCOL_VERSIONS: [&str; 3] = ["1.0", "1.1", "2024-11-05"];

/// Methods gated on a negotiated client capability
const CAPABILITY_GATES: [(&str, &str); 4] = [
    (method::RESOURCES_SUBSCRIBE, "resources.subscribe"),
    (method::RESOURCES_UNSUBSCRIBE, "resources.subscribe"),
    (method::SAMPLING_CREATE_MESSAGE, "sampling.createMessage"),
    (method::LOGGING_SET_LEVEL, "logging.setLevel"),
];

#[derive(Debug, Clone, Copy)]
enum Coercion {
    Float,
    Integer,
}

/// Dotted paths that may be coerced, per method
const COERCIONS: [(&str, &str, Coercion); 3] = [
    (method::SAMPLING_CREATE_MESSAGE, "modelPreferences.temperature", Coercion::Float),
    (method::SAMPLING_CREATE_MESSAGE, "modelPreferences.maxTokens", Coercion::Integer),
    (method::SAMPLING_CREATE_MESSAGE, "modelPreferences.seed", Coercion::Integer),
];

/// Reject gated methods before the session is initialized
pub fn check_initialized(entry: &MethodHandler, session: &SessionState) -> Result<(), McpError> {
    if entry.requires_initialization && !session.initialized && entry.name != method::INITIALIZE {
        return Err(McpError::server_not_initialized(&entry.name));
    }
    Ok(())
}

/// Validates requests for the methods in a registry
pub struct RequestValidator {
    registry: Arc<MethodRegistry>,
    schemas: HashMap<&'static str, (Value, jsonschema::Validator)>,
    supported_versions: Vec<String>,
}

impl RequestValidator {
    /// Compile the built-in method schemas
    pub fn new(registry: Arc<MethodRegistry>) -> Result<Self, McpError> {
        let mut schemas = HashMap::new();
        for (name, schema) in builtin_schemas() {
            let compiled = jsonschema::Validator::new(&schema).map_err(|e| {
                McpError::internal_error(format!("invalid schema for {}: {}", name, e))
            })?;
            schemas.insert(name, (schema, compiled));
        }
        Ok(Self {
            registry,
            schemas,
            supported_versions: DEFAULT_PROTOCOL_VERSIONS.iter().map(|v| v.to_string()).collect(),
        })
    }

    /// Replace the versions `initialize` accepts
    pub fn with_protocol_versions(mut self, versions: Vec<String>) -> Self {
        self.supported_versions = versions;
        self
    }

    pub fn supported_versions(&self) -> &[String] {
        &self.supported_versions
    }

    /// Validate a request by method name, looking the entry up in the registry
    pub fn validate_request(
        &self,
        method_name: &str,
        params: Option<Params>,
        session: &SessionState,
    ) -> Result<Option<Params>, McpError> {
        let entry = self
            .registry
            .get(method_name)
            .ok_or_else(|| McpError::method_not_found(method_name))?;
        self.validate(&entry, params, session)
    }

    /// Run every layer and return the (possibly coerced) params
    pub fn validate(
        &self,
        entry: &MethodHandler,
        params: Option<Params>,
        session: &SessionState,
    ) -> Result<Option<Params>, McpError> {
        let name = entry.name.as_str();

        check_initialized(entry, session)?;

        if method::ZERO_PARAM.contains(&name) {
            if normalize(params).is_some() {
                return Err(invalid(name, "This method does not accept parameters"));
            }
            return Ok(None);
        }
        let Some(mut params) = params else {
            return Err(invalid(name, "Parameters are required for this method"));
        };

        if let Params::Named(map) = &mut params {
            coerce(name, map);
        }

        let value = params.clone().into_value();
        if let Some((_, compiled)) = self.schemas.get(name) {
            if let Some(err) = compiled.iter_errors(&value).next() {
                return Err(schema_error(&err.instance_path.to_string(), &err.to_string())
                    .with_context("method", json!(name)));
            }
        }
        entry.check_schema(&value)?;

        self.check_constraints(name, &params)?;
        check_capability(name, &session.capabilities)?;

        Ok(Some(params))
    }

    fn check_constraints(&self, name: &str, params: &Params) -> Result<(), McpError> {
        match name {
            method::INITIALIZE => {
                let version = text(params, "protocolVersion");
                if !self.supported_versions.iter().any(|v| v == version) {
                    return Err(invalid(
                        name,
                        &format!(
                            "Unsupported protocol version. Supported versions: {}",
                            self.supported_versions.join(", ")
                        ),
                    ));
                }
            }
            method::RESOURCES_READ | method::RESOURCES_SUBSCRIBE | method::RESOURCES_UNSUBSCRIBE => {
                if !URI_SCHEME.is_match(text(params, "uri")) {
                    return Err(invalid(
                        name,
                        "Invalid URI format. URI must start with a scheme (e.g., 'file:', 'http:')",
                    ));
                }
            }
            method::TOOLS_CALL => {
                if !NAME_PATTERN.is_match(text(params, "name")) {
                    return Err(invalid(
                        name,
                        "Invalid tool name. Must start with a letter and contain only alphanumeric characters, underscores, and hyphens",
                    ));
                }
            }
            method::PROMPTS_GET => {
                if !NAME_PATTERN.is_match(text(params, "name")) {
                    return Err(invalid(
                        name,
                        "Invalid prompt name. Must start with a letter and contain only alphanumeric characters, underscores, and hyphens",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Check a dotted capability path against a capability map
    pub fn validate_capability(&self, capabilities: &CapabilityMap, path: &str) -> bool {
        capabilities.is_enabled(path)
    }

    /// Built-in schema for a method, if any
    pub fn method_schema(&self, name: &str) -> Option<&Value> {
        self.schemas.get(name).map(|(schema, _)| schema)
    }
}

fn text<'a>(params: &'a Params, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or("")
}

fn invalid(method_name: &str, detail: &str) -> McpError {
    McpError::invalid_params(detail).with_context("method", json!(method_name))
}

/// Treat `{}` and `[]` as absent params for methods that take none
fn normalize(params: Option<Params>) -> Option<Params> {
    match params {
        Some(Params::Named(map)) if map.is_empty() => None,
        Some(Params::Positional(items)) if items.is_empty() => None,
        other => other,
    }
}

fn check_capability(name: &str, capabilities: &CapabilityMap) -> Result<(), McpError> {
    for (gated, path) in CAPABILITY_GATES {
        if gated == name && !capabilities.is_enabled(path) {
            return Err(McpError::capability_not_supported(path));
        }
    }
    Ok(())
}

fn coerce(name: &str, params: &mut Map<String, Value>) {
    for (gated, path, kind) in COERCIONS {
        if gated != name {
            continue;
        }
        if let Some(value) = lookup_mut(params, path) {
            if let Some(coerced) = coerce_value(value, kind) {
                *value = coerced;
            }
        }
    }
}

/// Follow a dotted path through nested objects
fn lookup_mut<'a>(map: &'a mut Map<String, Value>, path: &str) -> Option<&'a mut Value> {
    let mut keys = path.split('.');
    let mut current = map.get_mut(keys.next()?)?;
    for key in keys {
        current = current.as_object_mut()?.get_mut(key)?;
    }
    Some(current)
}

fn coerce_value(value: &Value, kind: Coercion) -> Option<Value> {
    match kind {
        Coercion::Float => {
            let f = match value {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse::<f64>().ok()?,
                Value::Bool(b) => f64::from(u8::from(*b)),
                _ => return None,
            };
            Number::from_f64(f).map(Value::Number)
        }
        Coercion::Integer => {
            let i = match value {
                Value::Number(n) => match n.as_i64() {
                    Some(i) => i,
                    None => n.as_f64().filter(|f| f.is_finite())?.trunc() as i64,
                },
                Value::String(s) => s.trim().parse::<i64>().ok()?,
                Value::Bool(b) => i64::from(*b),
                _ => return None,
            };
            Some(Value::from(i))
        }
    }
}

/// Check a resource URI against a scheme allow-list. Without a list, the
/// standard and MCP scheme sets apply.
pub fn validate_resource_uri(uri: &str, allowed_schemes: Option<&[&str]>) -> bool {
    let Some(parts) = URI_PARTS.captures(uri) else {
        return false;
    };
    let scheme = parts[1].to_lowercase();
    match allowed_schemes {
        Some(allowed) => allowed.contains(&scheme.as_str()),
        None => {
            STANDARD_SCHEMES.contains(&scheme.as_str()) || MCP_SCHEMES.contains(&scheme.as_str())
        }
    }
}

/// Components of a resource URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUri {
    pub scheme: String,
    pub path: String,
    pub full: String,
}

/// Split `scheme:path`, lowercasing the scheme; anything else is
/// `InvalidResourceUri`
pub fn parse_resource_uri(uri: &str) -> Result<ResourceUri, McpError> {
    let parts = URI_PARTS.captures(uri).ok_or_else(|| {
        McpError::new(
            super::errors::ErrorCode::InvalidResourceUri,
            format!("Invalid URI format: {}", uri),
        )
    })?;
    Ok(ResourceUri {
        scheme: parts[1].to_lowercase(),
        path: parts[2].to_string(),
        full: uri.to_string(),
    })
}

/// Coerce tool arguments to the primitive types their schema declares
pub fn coerce_tool_arguments(arguments: &Map<String, Value>, schema: &Value) -> Map<String, Value> {
    let mut result = arguments.clone();
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return result;
    };
    for (key, prop) in properties {
        let Some(value) = result.get_mut(key) else {
            continue;
        };
        let coerced = match (prop.get("type").and_then(Value::as_str), &*value) {
            (Some("string"), Value::String(_) | Value::Null) => None,
            (Some("string"), other) => Some(Value::String(other.to_string())),
            (Some("number"), v @ (Value::Number(_) | Value::String(_))) => {
                coerce_value(v, Coercion::Float)
            }
            (Some("integer"), Value::Number(n)) if n.is_f64() => {
                coerce_value(&Value::Number(n.clone()), Coercion::Integer)
            }
            (Some("integer"), v @ Value::String(_)) => coerce_value(v, Coercion::Integer),
            (Some("boolean"), Value::String(s)) => Some(Value::Bool(matches!(
                s.to_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ))),
            _ => None,
        };
        if let Some(coerced) = coerced {
            *value = coerced;
        }
    }
    result
}

/// Validate tool arguments against a tool's schema, optionally coercing first
pub fn validate_tool_arguments(
    arguments: &Map<String, Value>,
    schema: &Value,
    coerce: bool,
) -> Result<Map<String, Value>, McpError> {
    let arguments = if coerce {
        coerce_tool_arguments(arguments, schema)
    } else {
        arguments.clone()
    };
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| McpError::internal_error(format!("invalid tool schema: {}", e)))?;
    let instance = Value::Object(arguments);
    if let Some(err) = validator.iter_errors(&instance).next() {
        return Err(McpError::new(
            super::errors::ErrorCode::InvalidToolArguments,
            format!("Invalid tool arguments at {}: {}", err.instance_path, err),
        ));
    }
    match instance {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

fn uri_params() -> Value {
    json!({
        "type": "object",
        "properties": {"uri": {"type": "string", "minLength": 1}},
        "required": ["uri"]
    })
}

fn cursor_params() -> Value {
    json!({
        "type": "object",
        "properties": {"cursor": {"type": "string"}}
    })
}

fn builtin_schemas() -> Vec<(&'static str, Value)> {
    vec![
        (
            method::INITIALIZE,
            json!({
                "type": "object",
                "properties": {
                    "protocolVersion": {
                        "type": "string",
                        "pattern": r"^(\d+\.\d+|\d{4}-\d{2}-\d{2})$"
                    },
                    "capabilities": {
                        "type": "object",
                        "properties": {
                            "resources": {
                                "type": "object",
                                "properties": {
                                    "subscribe": {"type": "boolean"},
                                    "listSupported": {"type": "boolean"}
                                }
                            },
                            "tools": {
                                "type": "object",
                                "properties": {"listSupported": {"type": "boolean"}}
                            },
                            "prompts": {
                                "type": "object",
                                "properties": {"listSupported": {"type": "boolean"}}
                            },
                            "logging": {
                                "type": "object",
                                "properties": {"setLevel": {"type": "boolean"}}
                            },
                            "sampling": {
                                "type": "object",
                                "properties": {"createMessage": {"type": "boolean"}}
                            }
                        }
                    },
                    "clientInfo": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "version": {"type": "string"}
                        },
                        "required": ["name", "version"]
                    }
                },
                "required": ["protocolVersion", "capabilities"]
            }),
        ),
        (method::RESOURCES_LIST, cursor_params()),
        (method::RESOURCES_READ, uri_params()),
        (method::RESOURCES_SUBSCRIBE, uri_params()),
        (method::RESOURCES_UNSUBSCRIBE, uri_params()),
        (method::TOOLS_LIST, cursor_params()),
        (
            method::TOOLS_CALL,
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "minLength": 1},
                    "arguments": {"type": "object"}
                },
                "required": ["name"]
            }),
        ),
        (method::PROMPTS_LIST, cursor_params()),
        (
            method::PROMPTS_GET,
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "minLength": 1},
                    "arguments": {"type": "object"}
                },
                "required": ["name"]
            }),
        ),
        (
            method::SAMPLING_CREATE_MESSAGE,
            json!({
                "type": "object",
                "properties": {
                    "messages": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "role": {"type": "string", "enum": ["user", "assistant", "system"]},
                                "content": {"type": "string"}
                            },
                            "required": ["role", "content"]
                        },
                        "minItems": 1
                    },
                    "modelPreferences": {
                        "type": "object",
                        "properties": {
                            "temperature": {"type": "number", "minimum": 0, "maximum": 2},
                            "maxTokens": {"type": "integer", "minimum": 1},
                            "stopSequences": {"type": "array", "items": {"type": "string"}},
                            "seed": {"type": "integer"}
                        }
                    },
                    "includeContext": {
                        "type": "string",
                        "enum": ["none", "thisServer", "allServers"]
                    },
                    "systemPrompt": {"type": "string"}
                },
                "required": ["messages"]
            }),
        ),
        (
            method::LOGGING_SET_LEVEL,
            json!({
                "type": "object",
                "properties": {
                    "level": {
                        "type": "string",
                        "enum": ["debug", "info", "notice", "warning", "error", "critical", "alert", "emergency"]
                    }
                },
                "required": ["level"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::errors::{ErrorCode, HandlerError};

    fn validator() -> RequestValidator {
        let registry = MethodRegistry::new();
        for name in [
            method::INITIALIZE,
            method::TOOLS_CALL,
            method::RESOURCES_READ,
            method::RESOURCES_SUBSCRIBE,
            method::SAMPLING_CREATE_MESSAGE,
            method::PROMPTS_GET,
            "custom/positional",
        ] {
            registry.register_fn(name, |_p: Option<Params>| async {
                Ok::<_, HandlerError>(Value::Null)
            });
        }
        registry.register(
            MethodHandler::new(method::PING, |_p: Option<Params>| async {
                Ok::<_, HandlerError>(Value::Null)
            })
            .without_initialization(),
        );
        RequestValidator::new(Arc::new(registry)).unwrap()
    }

    fn ready() -> SessionState {
        SessionState {
            initialized: true,
            capabilities: CapabilityMap::from_value(&json!({"resources": {"subscribe": true}})),
            ..Default::default()
        }
    }

    fn named(value: Value) -> Option<Params> {
        Some(Params::Named(value.as_object().cloned().unwrap()))
    }

    fn code(result: Result<Option<Params>, McpError>) -> i32 {
        result.unwrap_err().code
    }

    #[test]
    fn test_gate_runs_first() {
        let v = validator();
        let session = SessionState::default();
        assert_eq!(
            code(v.validate_request(method::TOOLS_CALL, None, &session)),
            ErrorCode::ServerNotInitialized.code()
        );
        assert!(v.validate_request(method::PING, None, &session).is_ok());
    }

    #[test]
    fn test_shape_rules() {
        let v = validator();
        let session = ready();
        assert_eq!(
            code(v.validate_request(method::PING, named(json!({"x": 1})), &session)),
            ErrorCode::InvalidParams.code()
        );
        assert!(v.validate_request(method::PING, named(json!({})), &session).is_ok());
        assert_eq!(
            code(v.validate_request(method::TOOLS_CALL, None, &session)),
            ErrorCode::InvalidParams.code()
        );
    }

    #[test]
    fn test_schema_violation_reports_path() {
        let v = validator();
        let err = v
            .validate_request(method::TOOLS_CALL, named(json!({"name": 3})), &ready())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams.code());
        assert!(err.message.contains("/name"), "{}", err.message);
    }

    #[test]
    fn test_custom_constraints() {
        let v = validator();
        let session = ready();
        assert!(v
            .validate_request(method::TOOLS_CALL, named(json!({"name": "search_code"})), &session)
            .is_ok());
        assert!(v
            .validate_request(method::TOOLS_CALL, named(json!({"name": "1bad"})), &session)
            .is_err());
        assert!(v
            .validate_request(method::RESOURCES_READ, named(json!({"uri": "no-scheme"})), &session)
            .is_err());
        assert!(v
            .validate_request(method::PROMPTS_GET, named(json!({"name": "bad name"})), &session)
            .is_err());
        assert!(v
            .validate_request(
                method::INITIALIZE,
                named(json!({"protocolVersion": "9.9", "capabilities": {}})),
                &session
            )
            .is_err());
        assert!(v
            .validate_request(
                method::INITIALIZE,
                named(json!({"protocolVersion": "1.1", "capabilities": {}})),
                &SessionState::default()
            )
            .is_ok());
    }

    #[test]
    fn test_capability_gating() {
        let v = validator();
        let uri = named(json!({"uri": "file:///src/main.rs"}));
        assert!(v
            .validate_request(method::RESOURCES_SUBSCRIBE, uri.clone(), &ready())
            .is_ok());

        let bare = SessionState {
            initialized: true,
            ..Default::default()
        };
        assert_eq!(
            code(v.validate_request(method::RESOURCES_SUBSCRIBE, uri, &bare)),
            ErrorCode::CapabilityNotSupported.code()
        );
    }

    #[test]
    fn test_coercion_before_schema() {
        let v = validator();
        let session = SessionState {
            initialized: true,
            capabilities: CapabilityMap::from_value(&json!({"sampling": {"createMessage": true}})),
            ..Default::default()
        };
        let params = named(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "modelPreferences": {"temperature": "0.7", "maxTokens": "64", "seed": 3.9}
        }));
        let out = v
            .validate_request(method::SAMPLING_CREATE_MESSAGE, params, &session)
            .unwrap()
            .unwrap();
        let prefs = out.get("modelPreferences").unwrap();
        assert_eq!(prefs["temperature"], json!(0.7));
        assert_eq!(prefs["maxTokens"], json!(64));
        assert_eq!(prefs["seed"], json!(3));

        let bad = named(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "modelPreferences": {"maxTokens": "lots"}
        }));
        assert_eq!(
            code(v.validate_request(method::SAMPLING_CREATE_MESSAGE, bad, &session)),
            ErrorCode::InvalidParams.code()
        );
    }

    #[test]
    fn test_positional_params_allowed_without_schema() {
        let v = validator();
        let params = Some(Params::Positional(vec![json!(1)]));
        assert!(v.validate_request("custom/positional", params, &ready()).is_ok());
    }

    #[test]
    fn test_resource_uri_helpers() {
        assert!(validate_resource_uri("file:///a.rs", None));
        assert!(validate_resource_uri("symbol:main", None));
        assert!(!validate_resource_uri("gopher://x", None));
        assert!(validate_resource_uri("gopher://x", Some(&["gopher"])));
        assert!(!validate_resource_uri("nocolon", None));

        let parsed = parse_resource_uri("CODE:src/lib.rs").unwrap();
        assert_eq!(parsed.scheme, "code");
        assert_eq!(parsed.path, "src/lib.rs");
        assert!(parse_resource_uri("plain").is_err());
    }

    #[test]
    fn test_tool_argument_coercion() {
        let schema = json!({
            "type": "object",
            "properties": {
                "limit": {"type": "integer"},
                "score": {"type": "number"},
                "exact": {"type": "boolean"},
                "query": {"type": "string"}
            }
        });
        let args = json!({"limit": "10", "score": "0.5", "exact": "yes", "query": 42})
            .as_object()
            .cloned()
            .unwrap();
        let out = validate_tool_arguments(&args, &schema, true).unwrap();
        assert_eq!(out["limit"], json!(10));
        assert_eq!(out["score"], json!(0.5));
        assert_eq!(out["exact"], json!(true));
        assert_eq!(out["query"], json!("42"));

        let err = validate_tool_arguments(&args, &schema, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToolArguments.code());
    }

    #[test]
    fn test_method_schema_lookup() {
        let v = validator();
        assert!(v.method_schema(method::TOOLS_CALL).is_some());
        assert!(v.method_schema("custom/positional").is_none());
        assert!(v.validate_capability(&ready().capabilities, "resources.subscribe"));
    }
}
