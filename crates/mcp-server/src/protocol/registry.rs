//! Method registry: name → handler entries with schemas and gating flags

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::errors::{HandlerError, HandlerResult, McpError};
use super::types::Params;

/// Async method handler. Receives the request params as sent.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: Option<Params>) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Option<Params>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, params: Option<Params>) -> HandlerResult {
        (self)(params).await
    }
}

/// Wrap a handler that takes a typed argument struct.
///
/// Params bind by name or by position; a mismatch becomes
/// `HandlerError::InvalidParams`. Missing params bind from `{}`.
pub fn typed<A, R, F, Fut>(f: F) -> impl Handler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    move |params: Option<Params>| {
        let bound = match params {
            Some(params) => params.parse::<A>(),
            None => serde_json::from_value::<A>(Value::Object(Default::default())),
        };
        let fut = bound.map(&f);
        async move {
            let result = fut
                .map_err(|e| HandlerError::InvalidParams(e.to_string()))?
                .await?;
            serde_json::to_value(result).map_err(|e| HandlerError::Internal(e.into()))
        }
    }
}

/// Registry entry
#[derive(Clone)]
pub struct MethodHandler {
    pub name: String,
    pub handler: Arc<dyn Handler>,
    pub params_schema: Option<Value>,
    pub(crate) compiled_schema: Option<Arc<jsonschema::Validator>>,
    pub requires_initialization: bool,
    pub description: String,
}

impl MethodHandler {
    pub fn new(name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            params_schema: None,
            compiled_schema: None,
            requires_initialization: true,
            description: String::new(),
        }
    }

    /// Attach a JSON schema for the params, compiled once here
    pub fn with_schema(mut self, schema: Value) -> Result<Self, McpError> {
        let compiled = jsonschema::Validator::new(&schema).map_err(|e| {
            McpError::internal_error(format!("invalid schema for {}: {}", self.name, e))
        })?;
        self.params_schema = Some(schema);
        self.compiled_schema = Some(Arc::new(compiled));
        Ok(self)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Allow calls before `initialize`
    pub fn without_initialization(mut self) -> Self {
        self.requires_initialization = false;
        self
    }

    /// Validate params against the attached schema, if any
    pub fn check_schema(&self, params: &Value) -> Result<(), McpError> {
        let Some(validator) = &self.compiled_schema else {
            return Ok(());
        };
        match validator.iter_errors(params).next() {
            Some(err) => Err(schema_error(&err.instance_path.to_string(), &err.to_string())),
            None => Ok(()),
        }
    }
}

pub(crate) fn schema_error(path: &str, message: &str) -> McpError {
    let path = if path.is_empty() { "/" } else { path };
    McpError::invalid_params(format!("Schema validation failed at {}: {}", path, message))
        .with_context("path", Value::String(path.to_string()))
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodHandler")
            .field("name", &self.name)
            .field("requires_initialization", &self.requires_initialization)
            .field("description", &self.description)
            .finish()
    }
}

/// Introspection record returned by [`MethodRegistry::describe`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescription {
    pub name: String,
    pub description: String,
    pub requires_initialization: bool,
    pub has_schema: bool,
}

/// Name-keyed handler table, built at startup and shared by reference
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a method
    pub fn register(&self, entry: MethodHandler) {
        let replaced = self.methods.write().insert(entry.name.clone(), entry);
        if let Some(old) = replaced {
            tracing::debug!(method = %old.name, "Replaced method handler");
        }
    }

    /// Register a plain handler with default options
    pub fn register_fn(&self, name: &str, handler: impl Handler + 'static) {
        self.register(MethodHandler::new(name, handler));
    }

    /// Returns whether a handler was removed
    pub fn unregister(&self, name: &str) -> bool {
        self.methods.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<MethodHandler> {
        self.methods.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Sorted method names
    pub fn list_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata for every method, sorted by name
    pub fn describe(&self) -> Vec<MethodDescription> {
        let methods = self.methods.read();
        let mut out: Vec<MethodDescription> = methods
            .values()
            .map(|m| MethodDescription {
                name: m.name.clone(),
                description: m.description.clone(),
                requires_initialization: m.requires_initialization,
                has_schema: m.params_schema.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    async fn add(args: AddArgs) -> Result<i64, HandlerError> {
        Ok(args.a + args.b)
    }

    #[tokio::test]
    async fn test_typed_handler_binds_named_and_positional() {
        let handler = typed(add);
        let named = Params::Named(json!({"a": 2, "b": 3}).as_object().cloned().unwrap());
        assert_eq!(handler.call(Some(named)).await.unwrap(), json!(5));

        let positional = Params::Positional(vec![json!(4), json!(5)]);
        assert_eq!(handler.call(Some(positional)).await.unwrap(), json!(9));
    }

    #[tokio::test]
    async fn test_typed_handler_mismatch_is_invalid_params() {
        let handler = typed(add);
        let bad = Params::Named(json!({"a": "two"}).as_object().cloned().unwrap());
        let err = handler.call(Some(bad)).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = MethodRegistry::new();
        registry.register(
            MethodHandler::new("echo", |params: Option<Params>| async move {
                Ok::<_, HandlerError>(params.map(Params::into_value).unwrap_or(Value::Null))
            })
            .with_description("Echo params")
            .without_initialization(),
        );
        assert!(registry.contains("echo"));
        assert_eq!(registry.list_methods(), vec!["echo".to_string()]);

        let entry = registry.get("echo").unwrap();
        assert!(!entry.requires_initialization);
        let out = entry.handler.call(Some(Params::Positional(vec![json!(1)]))).await.unwrap();
        assert_eq!(out, json!([1]));

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_schema_check_reports_path() {
        let entry = MethodHandler::new("x", |_p: Option<Params>| async { Ok::<_, HandlerError>(Value::Null) })
            .with_schema(json!({
                "type": "object",
                "properties": {"uri": {"type": "string"}},
                "required": ["uri"]
            }))
            .unwrap();
        assert!(entry.check_schema(&json!({"uri": "file:///a"})).is_ok());

        let err = entry.check_schema(&json!({"uri": 5})).unwrap_err();
        assert_eq!(err.code, -32602);
        assert!(err.message.contains("/uri"), "{}", err.message);
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let result = MethodHandler::new("x", |_p: Option<Params>| async { Ok::<_, HandlerError>(Value::Null) })
            .with_schema(json!({"type": 12}));
        assert!(result.is_err());
    }
}
