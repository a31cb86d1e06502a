//! Parsing and serialization of JSON-RPC envelopes

use serde::Serialize;
use serde_json::{Map, Value};

use super::errors::McpError;
use super::types::{Incoming, Message, Params, Request, RequestId, Response, JSONRPC_VERSION};

/// Parse a raw payload into a request or a batch of requests
pub fn parse_request(input: &str) -> Result<Incoming, McpError> {
    if input.trim().is_empty() {
        return Err(McpError::parse_error("Empty request"));
    }
    let value: Value =
        serde_json::from_str(input).map_err(|e| McpError::parse_error(e.to_string()))?;
    parse_request_value(value)
}

/// Parse a raw byte buffer. Invalid UTF-8 is a parse error.
pub fn parse_request_bytes(input: &[u8]) -> Result<Incoming, McpError> {
    let text = std::str::from_utf8(input).map_err(|e| McpError::parse_error(e.to_string()))?;
    parse_request(text)
}

/// Parse an already decoded JSON value
pub fn parse_request_value(value: Value) -> Result<Incoming, McpError> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(McpError::invalid_request("Empty batch"));
            }
            let requests = items
                .into_iter()
                .map(request_from_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Incoming::Batch(requests))
        }
        other => request_from_value(other).map(Incoming::Single),
    }
}

fn envelope(value: Value) -> Result<Map<String, Value>, McpError> {
    let Value::Object(map) = value else {
        return Err(McpError::invalid_request("Request must be an object"));
    };
    match map.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => Ok(map),
        _ => Err(McpError::invalid_request("jsonrpc must be exactly \"2.0\"")),
    }
}

fn parse_id(map: &Map<String, Value>) -> Result<Option<RequestId>, McpError> {
    match map.get("id") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => RequestId::from_value(raw)
            .map(Some)
            .ok_or_else(|| McpError::invalid_request("id must be a string or integer")),
    }
}

/// Validate one request envelope, in order: object, version, method, params, id
pub fn request_from_value(value: Value) -> Result<Request, McpError> {
    let mut map = envelope(value)?;

    let method = match map.remove("method") {
        Some(Value::String(m)) if !m.is_empty() => m,
        Some(Value::String(_)) => {
            return Err(McpError::invalid_request("method must not be empty"))
        }
        Some(_) => return Err(McpError::invalid_request("method must be a string")),
        None => return Err(McpError::invalid_request("Missing method")),
    };

    let params = match map.remove("params") {
        None => None,
        Some(Value::Object(named)) => Some(Params::Named(named)),
        Some(Value::Array(positional)) => Some(Params::Positional(positional)),
        Some(_) => {
            return Err(McpError::invalid_request(
                "params must be an array or object",
            ))
        }
    };

    let id = parse_id(&map)?;

    Ok(Request {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method,
        params,
        id,
    })
}

/// Parse a response envelope
pub fn parse_response(input: &str) -> Result<Response, McpError> {
    if input.trim().is_empty() {
        return Err(McpError::parse_error("Empty response"));
    }
    let value: Value =
        serde_json::from_str(input).map_err(|e| McpError::parse_error(e.to_string()))?;
    response_from_value(value)
}

/// Validate a decoded response envelope: version, id, exactly one of
/// `result` or `error`
pub fn response_from_value(value: Value) -> Result<Response, McpError> {
    let mut map = envelope(value)?;
    let id = parse_id(&map)?;
    let result = map.remove("result");
    let error = match map.remove("error") {
        Some(raw) => Some(
            serde_json::from_value::<McpError>(raw)
                .map_err(|e| McpError::invalid_request(format!("malformed error object: {}", e)))?,
        ),
        None => None,
    };
    Response::new(id, result, error)
}

/// Check that a line is a well-formed request, batch or response
pub fn validate_message(input: &str) -> Result<Message, McpError> {
    if input.trim().is_empty() {
        return Err(McpError::parse_error("Empty message"));
    }
    let value: Value =
        serde_json::from_str(input).map_err(|e| McpError::parse_error(e.to_string()))?;
    let is_request = match &value {
        Value::Object(map) => map.contains_key("method"),
        Value::Array(_) => true,
        _ => false,
    };
    if is_request {
        match parse_request_value(value)? {
            Incoming::Single(request) => Ok(Message::Request(request)),
            Incoming::Batch(requests) => Ok(Message::Batch(requests)),
        }
    } else {
        response_from_value(value).map(Message::Response)
    }
}

/// Best-effort id recovery from a payload that failed validation
pub fn extract_id(input: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(input).ok()?;
    value.get("id").and_then(RequestId::from_value)
}

fn to_compact<T: Serialize + ?Sized>(value: &T) -> Result<String, McpError> {
    serde_json::to_string(value).map_err(|e| McpError::internal_error(e.to_string()))
}

/// Compact JSON for one request; notifications carry no `id` key
pub fn serialize_request(request: &Request) -> Result<String, McpError> {
    to_compact(request)
}

/// Compact JSON array for a client-side batch
pub fn serialize_requests(requests: &[Request]) -> Result<String, McpError> {
    to_compact(requests)
}

/// Compact JSON for one response, as written to the wire
pub fn serialize_response(response: &Response) -> Result<String, McpError> {
    to_compact(response)
}

/// Compact JSON array answering a batch. Callers skip the write when
/// every entry was a notification and the slice is empty.
pub fn serialize_responses(responses: &[Response]) -> Result<String, McpError> {
    to_compact(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::errors::ErrorCode;
    use serde_json::json;

    fn code_of(result: Result<Incoming, McpError>) -> i32 {
        result.unwrap_err().code
    }

    #[test]
    fn test_parse_single_request() {
        let parsed = parse_request(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap();
        let Incoming::Single(request) = parsed else {
            panic!("expected single request");
        };
        assert_eq!(request.method, "ping");
        assert_eq!(request.id, Some(RequestId::Number(1)));
        assert!(request.params.is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(code_of(parse_request("")), ErrorCode::ParseError.code());
        assert_eq!(code_of(parse_request("   ")), ErrorCode::ParseError.code());
        assert_eq!(code_of(parse_request("{not json")), ErrorCode::ParseError.code());
        assert_eq!(code_of(parse_request_bytes(&[0xff, 0xfe])), ErrorCode::ParseError.code());
    }

    #[test]
    fn test_invalid_request_order() {
        let invalid = ErrorCode::InvalidRequest.code();
        assert_eq!(code_of(parse_request("[]")), invalid);
        assert_eq!(code_of(parse_request("42")), invalid);
        assert_eq!(code_of(parse_request(r#"{"jsonrpc":"1.0","method":"a"}"#)), invalid);
        assert_eq!(code_of(parse_request(r#"{"jsonrpc":"2.0"}"#)), invalid);
        assert_eq!(code_of(parse_request(r#"{"jsonrpc":"2.0","method":""}"#)), invalid);
        assert_eq!(code_of(parse_request(r#"{"jsonrpc":"2.0","method":7}"#)), invalid);
        assert_eq!(
            code_of(parse_request(r#"{"jsonrpc":"2.0","method":"a","params":"x"}"#)),
            invalid
        );
        assert_eq!(
            code_of(parse_request(r#"{"jsonrpc":"2.0","method":"a","id":1.5}"#)),
            invalid
        );
        assert_eq!(
            code_of(parse_request(r#"{"jsonrpc":"2.0","method":"a","id":{}}"#)),
            invalid
        );
    }

    #[test]
    fn test_parse_batch() {
        let parsed = parse_request(
            r#"[{"jsonrpc":"2.0","method":"a","id":1},{"jsonrpc":"2.0","method":"b","params":[1,2]}]"#,
        )
        .unwrap();
        let Incoming::Batch(requests) = parsed else {
            panic!("expected batch");
        };
        assert_eq!(requests.len(), 2);
        assert!(requests[1].is_notification());
        assert_eq!(requests[1].params, Some(Params::Positional(vec![json!(1), json!(2)])));
    }

    #[test]
    fn test_round_trip() {
        let requests = vec![
            Request::new(1, "tools/call", Some(Params::Named(
                json!({"name": "search", "arguments": {"q": "fn main"}})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ))),
            Request::new("abc", "ping", None),
            Request::notification("log", Some(Params::Positional(vec![json!("x")]))),
        ];
        for request in requests {
            let first = serialize_request(&request).unwrap();
            let Incoming::Single(parsed) = parse_request(&first).unwrap() else {
                panic!("expected single request");
            };
            assert_eq!(serialize_request(&parsed).unwrap(), first);
        }
    }

    #[test]
    fn test_serialization_is_compact() {
        let response = Response::success(Some(1.into()), json!({"pong": true}));
        assert_eq!(
            serialize_response(&response).unwrap(),
            r#"{"jsonrpc":"2.0","id":1,"result":{"pong":true}}"#
        );
    }

    #[test]
    fn test_parse_response() {
        let ok = parse_response(r#"{"jsonrpc":"2.0","id":3,"result":[1]}"#).unwrap();
        assert_eq!(ok.result(), Some(&json!([1])));

        let err = parse_response(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        assert_eq!(err.error_object().unwrap().code, -32700);

        let both = parse_response(
            r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#,
        );
        assert_eq!(both.unwrap_err().code, ErrorCode::InvalidRequest.code());

        let neither = parse_response(r#"{"jsonrpc":"2.0","id":1}"#);
        assert_eq!(neither.unwrap_err().code, ErrorCode::InvalidRequest.code());
    }

    #[test]
    fn test_validate_message_accepts_requests_and_responses() {
        assert!(matches!(
            validate_message(r#"{"jsonrpc":"2.0","method":"ping"}"#),
            Ok(Message::Request(_))
        ));
        assert!(matches!(
            validate_message(r#"{"jsonrpc":"2.0","id":1,"result":true}"#),
            Ok(Message::Response(_))
        ));
        assert!(validate_message(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
        assert!(validate_message("nonsense").is_err());
    }

    #[test]
    fn test_extract_id() {
        assert_eq!(
            extract_id(r#"{"jsonrpc":"1.0","method":"a","id":"x"}"#),
            Some(RequestId::String("x".into()))
        );
        assert_eq!(extract_id("garbage"), None);
    }
}
