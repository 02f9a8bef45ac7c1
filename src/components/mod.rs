//! Proxy components module
//!
//! Contains the main components of the proxy server:
//! - Credential provider for inbound and outbound TLS
//! - Stream director for per-call routing to the target
//! - Transparent handler relaying unknown methods
//! - Call interceptors
//! - Service router dispatching local and proxied methods
//! - Local health and reflection services

pub mod credentials;
pub mod director;
pub mod health;
pub mod interceptor;
pub mod reflection;
pub mod router;
pub mod transparent;

pub use credentials::{ClientCredentials, CredentialProvider, ServerCredentials};
pub use director::{CallContext, OutboundConnection, OutboundContext, StreamDirector};
pub use health::HealthService;
pub use interceptor::{
    Call, CallFuture, CallKind, CallResult, Handler, Interceptor, InterceptorChain,
    LoggingInterceptor, Next, Pipeline,
};
pub use reflection::ReflectionService;
pub use router::{MethodPath, ServiceHandler, ServiceRouter};
pub use transparent::TransparentHandler;
