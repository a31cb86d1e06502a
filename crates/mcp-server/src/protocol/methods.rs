//! Default MCP method handlers.
//!
//! These answer the protocol surface until the indexing and search
//! collaborators register their own handlers over them.

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::capabilities::ServerCapabilities;
use super::errors::{ErrorCode, HandlerError, McpError};
use super::registry::{typed, MethodHandler, MethodRegistry};
use super::types::{
    method, InitializeParams, InitializeResult, PaginatedParams, Params, PromptGetParams,
    ResourceUriParams, ServerInfo, SetLevelParams, ToolCallParams,
};

/// Server name reported by `initialize`
pub const SERVER_NAME: &str = "code-index-mcp";

/// State behind the default handlers
pub struct CoreMethods {
    server_info: ServerInfo,
    capabilities: ServerCapabilities,
    subscriptions: Mutex<BTreeSet<String>>,
    log_level: RwLock<String>,
}

impl Default for CoreMethods {
    fn default() -> Self {
        Self::new(ServerInfo {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

impl CoreMethods {
    pub fn new(server_info: ServerInfo) -> Self {
        Self {
            server_info,
            capabilities: ServerCapabilities::full(),
            subscriptions: Mutex::new(BTreeSet::new()),
            log_level: RwLock::new("info".to_string()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// URIs with an active subscription, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Level last set through `logging/setLevel`
    pub fn log_level(&self) -> String {
        self.log_level.read().clone()
    }

    fn initialize(&self, params: InitializeParams) -> InitializeResult {
        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = %client.version, "Client initializing");
        }
        InitializeResult {
            protocol_version: params.protocol_version,
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            session_data: json!({}),
        }
    }

    fn subscribe(&self, uri: String) -> Result<Value, McpError> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains(&uri) {
            return Err(McpError::new(
                ErrorCode::AlreadySubscribed,
                format!("Already subscribed: {}", uri),
            )
            .with_context("uri", json!(uri)));
        }
        debug!(uri = %uri, "Subscribed to resource");
        subscriptions.insert(uri);
        Ok(json!({}))
    }

    fn unsubscribe(&self, uri: String) -> Result<Value, McpError> {
        if !self.subscriptions.lock().remove(&uri) {
            return Err(McpError::new(
                ErrorCode::SubscriptionNotFound,
                format!("Subscription not found: {}", uri),
            )
            .with_context("uri", json!(uri)));
        }
        debug!(uri = %uri, "Unsubscribed from resource");
        Ok(json!({}))
    }

    fn set_level(&self, level: String) -> Value {
        info!(level = %level, "Client log level set");
        *self.log_level.write() = level;
        json!({})
    }

    /// Register every default handler into `registry`
    pub fn register(self: &Arc<Self>, registry: &MethodRegistry) {
        let this = Arc::clone(self);
        registry.register(
            MethodHandler::new(
                method::INITIALIZE,
                typed(move |params: InitializeParams| {
                    let result = this.initialize(params);
                    async move { Ok::<_, HandlerError>(result) }
                }),
            )
            .with_description("Negotiate protocol version and capabilities")
            .without_initialization(),
        );

        registry.register(
            MethodHandler::new(method::SHUTDOWN, |_params: Option<Params>| async {
                Ok::<_, HandlerError>(json!({"status": "ok"}))
            })
            .with_description("Prepare the server to exit")
            .without_initialization(),
        );

        registry.register(
            MethodHandler::new(method::PING, |_params: Option<Params>| async {
                Ok::<_, HandlerError>(json!({"pong": true}))
            })
            .with_description("Liveness check")
            .without_initialization(),
        );

        registry.register(
            MethodHandler::new(
                method::RESOURCES_LIST,
                typed(|_: PaginatedParams| async { Ok::<_, HandlerError>(json!({"resources": []})) }),
            )
            .with_description("List available resources"),
        );

        registry.register(
            MethodHandler::new(
                method::RESOURCES_READ,
                typed(|params: ResourceUriParams| async move {
                    Err::<Value, _>(HandlerError::Rpc(McpError::resource_not_found(&params.uri)))
                }),
            )
            .with_description("Read a resource by URI"),
        );

        let this = Arc::clone(self);
        registry.register(
            MethodHandler::new(
                method::RESOURCES_SUBSCRIBE,
                typed(move |params: ResourceUriParams| {
                    let result = this.subscribe(params.uri).map_err(HandlerError::from);
                    async move { result }
                }),
            )
            .with_description("Subscribe to resource updates"),
        );

        let this = Arc::clone(self);
        registry.register(
            MethodHandler::new(
                method::RESOURCES_UNSUBSCRIBE,
                typed(move |params: ResourceUriParams| {
                    let result = this.unsubscribe(params.uri).map_err(HandlerError::from);
                    async move { result }
                }),
            )
            .with_description("Cancel a resource subscription"),
        );

        registry.register(
            MethodHandler::new(
                method::TOOLS_LIST,
                typed(|_: PaginatedParams| async { Ok::<_, HandlerError>(json!({"tools": []})) }),
            )
            .with_description("List available tools"),
        );

        registry.register(
            MethodHandler::new(
                method::TOOLS_CALL,
                typed(|params: ToolCallParams| async move {
                    Err::<Value, _>(HandlerError::Rpc(McpError::tool_not_found(&params.name)))
                }),
            )
            .with_description("Invoke a tool"),
        );

        registry.register(
            MethodHandler::new(
                method::PROMPTS_LIST,
                typed(|_: PaginatedParams| async { Ok::<_, HandlerError>(json!({"prompts": []})) }),
            )
            .with_description("List available prompts"),
        );

        registry.register(
            MethodHandler::new(
                method::PROMPTS_GET,
                typed(|params: PromptGetParams| async move {
                    Err::<Value, _>(HandlerError::Rpc(
                        McpError::new(
                            ErrorCode::ResourceNotFound,
                            format!("Prompt not found: {}", params.name),
                        )
                        .with_context("prompt", json!(params.name)),
                    ))
                }),
            )
            .with_description("Render a prompt"),
        );

        let this = Arc::clone(self);
        registry.register(
            MethodHandler::new(
                method::LOGGING_SET_LEVEL,
                typed(move |params: SetLevelParams| {
                    let result = this.set_level(params.level);
                    async move { Ok::<_, HandlerError>(result) }
                }),
            )
            .with_description("Set the client-requested log level"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<CoreMethods>, MethodRegistry) {
        let methods = Arc::new(CoreMethods::default());
        let registry = MethodRegistry::new();
        methods.register(&registry);
        (methods, registry)
    }

    fn named(value: Value) -> Option<Params> {
        Some(Params::Named(value.as_object().cloned().unwrap()))
    }

    async fn call(registry: &MethodRegistry, name: &str, params: Option<Params>) -> Result<Value, McpError> {
        registry
            .get(name)
            .unwrap()
            .handler
            .call(params)
            .await
            .map_err(HandlerError::into_mcp_error)
    }

    #[tokio::test]
    async fn test_registers_full_surface() {
        let (_, registry) = setup();
        for name in [
            method::INITIALIZE,
            method::SHUTDOWN,
            method::PING,
            method::RESOURCES_LIST,
            method::RESOURCES_READ,
            method::RESOURCES_SUBSCRIBE,
            method::RESOURCES_UNSUBSCRIBE,
            method::TOOLS_LIST,
            method::TOOLS_CALL,
            method::PROMPTS_LIST,
            method::PROMPTS_GET,
            method::LOGGING_SET_LEVEL,
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
        assert!(!registry.get(method::PING).unwrap().requires_initialization);
        assert!(registry.get(method::TOOLS_CALL).unwrap().requires_initialization);
    }

    #[tokio::test]
    async fn test_initialize_result() {
        let (_, registry) = setup();
        let result = call(
            &registry,
            method::INITIALIZE,
            named(json!({"protocolVersion": "1.0", "capabilities": {}})),
        )
        .await
        .unwrap();
        assert_eq!(result["protocolVersion"], "1.0");
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(result["capabilities"]["resources"]["subscribe"], true);
        assert_eq!(result["sessionData"], json!({}));
    }

    #[tokio::test]
    async fn test_placeholders() {
        let (_, registry) = setup();
        assert_eq!(
            call(&registry, method::PING, None).await.unwrap(),
            json!({"pong": true})
        );
        assert_eq!(
            call(&registry, method::SHUTDOWN, None).await.unwrap(),
            json!({"status": "ok"})
        );
        assert_eq!(
            call(&registry, method::TOOLS_LIST, None).await.unwrap(),
            json!({"tools": []})
        );
        let err = call(&registry, method::TOOLS_CALL, named(json!({"name": "grep"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ToolNotFound.code());

        let err = call(&registry, method::TOOLS_CALL, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams.code());

        let err = call(&registry, method::RESOURCES_READ, named(json!({"uri": "file:///x"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceNotFound.code());
    }

    #[tokio::test]
    async fn test_subscription_tracking() {
        let (methods, registry) = setup();
        let uri = named(json!({"uri": "file:///src/lib.rs"}));

        call(&registry, method::RESOURCES_SUBSCRIBE, uri.clone()).await.unwrap();
        assert_eq!(methods.subscriptions(), vec!["file:///src/lib.rs".to_string()]);

        let dup = call(&registry, method::RESOURCES_SUBSCRIBE, uri.clone()).await.unwrap_err();
        assert_eq!(dup.code, ErrorCode::AlreadySubscribed.code());

        call(&registry, method::RESOURCES_UNSUBSCRIBE, uri.clone()).await.unwrap();
        let missing = call(&registry, method::RESOURCES_UNSUBSCRIBE, uri).await.unwrap_err();
        assert_eq!(missing.code, ErrorCode::SubscriptionNotFound.code());
    }

    #[tokio::test]
    async fn test_set_level_recorded() {
        let (methods, registry) = setup();
        call(&registry, method::LOGGING_SET_LEVEL, named(json!({"level": "debug"})))
            .await
            .unwrap();
        assert_eq!(methods.log_level(), "debug");
    }
}
