//! MCP protocol types and handling

mod capabilities;
pub mod codec;
mod errors;
mod methods;
mod registry;
mod router;
mod types;
pub mod validator;

pub use capabilities::{
    CapabilityMap, LoggingCapability, PromptsCapability, ResourcesCapability, SamplingCapability,
    ServerCapabilities, ToolsCapability,
};
pub use errors::{ErrorCode, HandlerError, HandlerResult, McpError, Severity};
pub use methods::{CoreMethods, SERVER_NAME};
pub use registry::{typed, Handler, MethodDescription, MethodHandler, MethodRegistry};
pub use router::{Router, SessionState};
pub use types::*;
pub use validator::RequestValidator;
