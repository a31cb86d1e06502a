//! Request routing over the method registry, with session state

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info};

use super::capabilities::CapabilityMap;
use super::errors::McpError;
use super::registry::{MethodHandler, MethodRegistry};
use super::types::{method, Params, Request, Response};
use super::validator::{check_initialized, RequestValidator};

/// Per-connection session state, written only by the router
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub initialized: bool,
    pub capabilities: CapabilityMap,
    pub session_data: Value,
    pub protocol_version: Option<String>,
    pub client_info: Option<Value>,
    pub initialized_at: Option<DateTime<Utc>>,
}

/// Dispatches requests to registered handlers
pub struct Router {
    registry: Arc<MethodRegistry>,
    validator: Option<Arc<RequestValidator>>,
    session: RwLock<SessionState>,
}

impl Router {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            validator: None,
            session: RwLock::new(SessionState::default()),
        }
    }

    /// Run the layered validator before every handler
    pub fn with_validator(mut self, validator: Arc<RequestValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    pub fn validator(&self) -> Option<&Arc<RequestValidator>> {
        self.validator.as_ref()
    }

    /// Whether `initialize` has succeeded since the last reset
    pub fn is_initialized(&self) -> bool {
        self.session.read().initialized
    }

    /// Snapshot of the session
    pub fn session(&self) -> SessionState {
        self.session.read().clone()
    }

    /// `sessionData` captured from the last successful `initialize`
    pub fn session_data(&self) -> Value {
        self.session.read().session_data.clone()
    }

    /// Capabilities the client declared in `initialize`
    pub fn capabilities(&self) -> CapabilityMap {
        self.session.read().capabilities.clone()
    }

    /// Forget the session, e.g. after `shutdown`
    pub fn reset_session(&self) {
        *self.session.write() = SessionState::default();
    }

    /// Route a request and return the handler result or a wire error
    pub async fn route(&self, request: &Request) -> Result<Value, McpError> {
        let entry = self
            .registry
            .get(&request.method)
            .ok_or_else(|| McpError::method_not_found(&request.method))?;

        let session = self.session();
        let params = self.prepare_params(&entry, request.params.clone(), &session)?;

        debug!(method = %request.method, id = ?request.id, "Dispatching request");

        let result = match AssertUnwindSafe(entry.handler.call(params)).catch_unwind().await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(err.into_mcp_error()),
            Err(panic) => return Err(panic_to_error(panic)),
        };

        if request.method == method::INITIALIZE {
            self.complete_initialize(request.params.as_ref(), &result);
        }

        Ok(result)
    }

    /// Route a request and build its response. Notifications never get one;
    /// their failures are only logged.
    pub async fn handle(&self, request: Request) -> Option<Response> {
        let result = self.route(&request).await;
        let Request { method, id, .. } = request;
        match (id, result) {
            (None, Ok(_)) => None,
            (None, Err(err)) => {
                err.log(Some(&method));
                None
            }
            (Some(id), Ok(value)) => Some(Response::success(Some(id), value)),
            (Some(id), Err(err)) => {
                err.log(Some(&method));
                Some(Response::error(Some(id), err))
            }
        }
    }

    fn prepare_params(
        &self,
        entry: &MethodHandler,
        params: Option<Params>,
        session: &SessionState,
    ) -> Result<Option<Params>, McpError> {
        if let Some(validator) = &self.validator {
            return validator.validate(entry, params, session);
        }
        check_initialized(entry, session)?;
        if let Some(params) = &params {
            entry.check_schema(&params.clone().into_value())?;
        }
        Ok(params)
    }

    fn complete_initialize(&self, params: Option<&Params>, result: &Value) {
        let mut session = self.session.write();
        let first = !session.initialized;
        session.initialized = true;
        session.capabilities = params
            .and_then(|p| p.get("capabilities"))
            .map(CapabilityMap::from_value)
            .unwrap_or_default();
        session.protocol_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .map(str::to_string);
        session.client_info = params.and_then(|p| p.get("clientInfo")).cloned();
        session.session_data = result.get("sessionData").cloned().unwrap_or(Value::Null);
        if first {
            session.initialized_at = Some(Utc::now());
            info!(
                protocol_version = ?session.protocol_version,
                "Session initialized"
            );
        } else {
            debug!("Session re-initialized");
        }
    }
}

fn panic_to_error(panic: Box<dyn Any + Send>) -> McpError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    McpError::new(super::errors::ErrorCode::InternalError, "Internal error").with_data(
        serde_json::json!({
            "type": "panic",
            "message": message,
            "stack": [],
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::errors::{ErrorCode, HandlerError};
    use serde_json::json;

    fn registry() -> Arc<MethodRegistry> {
        let registry = MethodRegistry::new();
        registry.register(
            MethodHandler::new(method::INITIALIZE, |_p: Option<Params>| async {
                Ok::<_, HandlerError>(json!({"protocolVersion": "1.0", "sessionData": {"token": "t"}}))
            })
            .without_initialization(),
        );
        registry.register(
            MethodHandler::new(method::PING, |_p: Option<Params>| async {
                Ok::<_, HandlerError>(json!({"pong": true}))
            })
            .without_initialization(),
        );
        registry.register_fn("gated", |_p: Option<Params>| async {
            Ok::<_, HandlerError>(json!("ok"))
        });
        registry.register_fn("fails", |_p: Option<Params>| async {
            Err::<Value, _>(HandlerError::Internal(anyhow::anyhow!("exploded")))
        });
        registry.register_fn("panics", |_p: Option<Params>| async {
            if true {
                panic!("boom");
            }
            Ok::<_, HandlerError>(Value::Null)
        });
        Arc::new(registry)
    }

    async fn initialized_router() -> Router {
        let router = Router::new(registry());
        let params = Params::Named(
            json!({"protocolVersion": "1.0", "capabilities": {"resources": {"subscribe": true}}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        router
            .route(&Request::new(1, method::INITIALIZE, Some(params)))
            .await
            .unwrap();
        router
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let router = Router::new(registry());
        let err = router.route(&Request::new(1, "nope", None)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound.code());
    }

    #[tokio::test]
    async fn test_gate_before_initialize() {
        let router = Router::new(registry());
        let err = router.route(&Request::new(1, "gated", None)).await.unwrap_err();
        assert_eq!(err.code, -32002);

        let pong = router.route(&Request::new(2, method::PING, None)).await.unwrap();
        assert_eq!(pong, json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_initialize_flips_session() {
        let router = initialized_router().await;
        assert!(router.is_initialized());
        assert_eq!(router.session_data(), json!({"token": "t"}));
        assert!(router.capabilities().is_enabled("resources.subscribe"));
        assert_eq!(
            router.route(&Request::new(2, "gated", None)).await.unwrap(),
            json!("ok")
        );
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_internal_error() {
        let router = initialized_router().await;
        let err = router.route(&Request::new(3, "fails", None)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError.code());
        assert_eq!(err.data.unwrap()["message"], "exploded");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let router = initialized_router().await;
        let err = router.route(&Request::new(4, "panics", None)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError.code());
        assert_eq!(err.data.unwrap()["type"], "panic");
    }

    #[tokio::test]
    async fn test_notification_silence() {
        let router = initialized_router().await;
        assert!(router.handle(Request::notification("fails", None)).await.is_none());
        assert!(router.handle(Request::notification("nope", None)).await.is_none());
        assert!(router.handle(Request::notification(method::PING, None)).await.is_none());

        let response = router.handle(Request::new(9, "fails", None)).await.unwrap();
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_reset_session() {
        let router = initialized_router().await;
        router.reset_session();
        assert!(!router.is_initialized());
        assert_eq!(router.session_data(), Value::Null);
    }
}
