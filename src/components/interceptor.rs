//! Call Interceptor Component
//!
//! Interceptors decorate every call. Each one receives the call together with
//! a [`Next`] handle and decides what to do before and after delegating to it.
//! Unary calls and streams use separate hooks; a stream hook must treat the
//! response body as part of the call.

use futures::future::BoxFuture;
use http::{HeaderMap, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tonic::{Code, Status};
use tracing::{info, warn};

use crate::body::{self, ObservedBody, ProxyBody, StreamEnd, StreamSummary};
use crate::components::director::application_metadata;

/// Shape of a call as seen by the interceptor chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// One request message, one response message
    Unary,
    /// Any streaming shape, including calls whose shape is unknown
    Streaming,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Unary => f.write_str("unary"),
            CallKind::Streaming => f.write_str("streaming"),
        }
    }
}

/// An inbound call on its way through the chain
pub struct Call {
    pub kind: CallKind,
    pub peer_addr: Option<SocketAddr>,
    pub request: Request<ProxyBody>,
}

impl Call {
    pub fn new(kind: CallKind, peer_addr: Option<SocketAddr>, request: Request<ProxyBody>) -> Self {
        Self {
            kind,
            peer_addr,
            request,
        }
    }

    /// Full method name, `/package.Service/Method`
    pub fn method(&self) -> &str {
        self.request.uri().path()
    }
}

/// A call either produces a response (whose trailers carry the final status)
/// or fails early with a status rendered as a trailers-only response.
pub type CallResult = Result<Response<ProxyBody>, Status>;

pub type CallFuture = BoxFuture<'static, CallResult>;

/// Terminal call handler
pub trait Handler: Send + Sync {
    fn call(&self, call: Call) -> CallFuture;
}

/// Call decorator. Both hooks default to plain delegation.
pub trait Interceptor: Send + Sync {
    fn intercept_unary(&self, call: Call, next: Next) -> CallFuture {
        next.run(call)
    }

    fn intercept_stream(&self, call: Call, next: Next) -> CallFuture {
        next.run(call)
    }
}

/// The rest of the chain after the current interceptor
#[derive(Clone)]
pub struct Next {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    handler: Arc<dyn Handler>,
}

impl Next {
    /// Proceed with the call
    pub fn run(self, call: Call) -> CallFuture {
        match self.interceptors.get(self.index).cloned() {
            Some(interceptor) => {
                let next = Next {
                    interceptors: Arc::clone(&self.interceptors),
                    index: self.index + 1,
                    handler: Arc::clone(&self.handler),
                };
                match call.kind {
                    CallKind::Unary => interceptor.intercept_unary(call, next),
                    CallKind::Streaming => interceptor.intercept_stream(call, next),
                }
            }
            None => self.handler.call(call),
        }
    }
}

/// Ordered list of interceptors in front of a handler
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; the first one added runs outermost
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_shared(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Bind the chain to its terminal handler
    pub fn wrap(self, handler: Arc<dyn Handler>) -> Pipeline {
        Pipeline {
            head: Next {
                interceptors: self.interceptors.into(),
                index: 0,
                handler,
            },
        }
    }
}

/// A handler with its interceptor chain applied
#[derive(Clone)]
pub struct Pipeline {
    head: Next,
}

impl Pipeline {
    pub fn call(&self, call: Call) -> CallFuture {
        self.head.clone().run(call)
    }
}

impl Handler for Pipeline {
    fn call(&self, call: Call) -> CallFuture {
        Pipeline::call(self, call)
    }
}

/// Logs every call: start, method and metadata, then duration and error once
/// the call is over.
#[derive(Debug, Default, Clone)]
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self
    }

    /// Metadata as logged: application entries only, no transport headers
    fn logged_metadata(call: &Call) -> HeaderMap {
        application_metadata(call.request.headers())
    }

    fn log_start(call: &Call) {
        info!(
            event = "call_started",
            kind = %call.kind,
            method = %call.method(),
            peer_addr = ?call.peer_addr,
            metadata = ?Self::logged_metadata(call),
            "Call started"
        );
    }

    fn log_finish(kind: CallKind, method: &str, started_at: Instant, error: Option<&Status>) {
        let duration_ms = started_at.elapsed().as_millis() as u64;
        match error {
            None => info!(
                event = "call_completed",
                kind = %kind,
                method = %method,
                duration_ms = duration_ms,
                "Call completed"
            ),
            Some(status) => warn!(
                event = "call_failed",
                kind = %kind,
                method = %method,
                duration_ms = duration_ms,
                grpc_status = ?status.code(),
                error = %status.message(),
                "Call failed"
            ),
        }
    }
}

/// The failure a response already carries in its headers (trailers-only)
fn header_error(response: &Response<ProxyBody>) -> Option<Status> {
    Status::from_header_map(response.headers()).filter(|status| status.code() != Code::Ok)
}

impl Interceptor for LoggingInterceptor {
    fn intercept_unary(&self, call: Call, next: Next) -> CallFuture {
        Self::log_start(&call);
        let method = call.method().to_string();
        let started_at = Instant::now();

        Box::pin(async move {
            let result = next.run(call).await;
            let error = match &result {
                Ok(response) => header_error(response),
                Err(status) => Some(status.clone()),
            };
            Self::log_finish(CallKind::Unary, &method, started_at, error.as_ref());
            result
        })
    }

    fn intercept_stream(&self, call: Call, next: Next) -> CallFuture {
        Self::log_start(&call);
        let method = call.method().to_string();
        let started_at = Instant::now();

        Box::pin(async move {
            let response = match next.run(call).await {
                Ok(response) => response,
                Err(status) => {
                    Self::log_finish(CallKind::Streaming, &method, started_at, Some(&status));
                    return Err(status);
                }
            };

            if let Some(status) = Status::from_header_map(response.headers()) {
                // Trailers-only: the stream is already over
                let error = Some(status).filter(|s| s.code() != Code::Ok);
                Self::log_finish(CallKind::Streaming, &method, started_at, error.as_ref());
                return Ok(response);
            }

            let (parts, inner) = response.into_parts();
            let observed = ObservedBody::starting_at(inner, started_at, move |summary: StreamSummary| {
                let error = match summary.end {
                    StreamEnd::Completed(Some(status)) if status.code() != Code::Ok => {
                        Some(status)
                    }
                    StreamEnd::Completed(_) => None,
                    StreamEnd::Failed(message) => Some(Status::internal(message)),
                    StreamEnd::Cancelled => Some(Status::cancelled("stream dropped before completion")),
                };
                Self::log_finish(CallKind::Streaming, &method, started_at, error.as_ref());
            });

            Ok(Response::from_parts(parts, body::boxed(observed)))
        })
    }
}
