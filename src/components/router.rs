//! Service Router Component
//!
//! Single entry point for every call, keyed by method path. Methods the proxy
//! registered locally are served in-process; everything else falls through to
//! the transparent handler. Method names are never validated: a path that
//! means nothing to the target still reaches it, and the target answers.

use bytes::Bytes;
use futures::FutureExt;
use http::{Request, Response};
use http_body::Body;
use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use tower::{Service, ServiceExt};

use crate::body::{self, BoxError, ProxyBody};
use crate::components::interceptor::{Call, CallFuture, CallKind, Handler};

/// A method path split into its service and method parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPath {
    /// Fully qualified service name, e.g. `grpc.health.v1.Health`
    pub service: String,
    /// Method name, e.g. `Check`
    pub method: String,
}

impl MethodPath {
    /// Split `/{service}/{method}`. Returns `None` for anything else.
    pub fn parse(path: &str) -> Option<Self> {
        let (service, method) = path.strip_prefix('/')?.split_once('/')?;
        if service.is_empty() || method.is_empty() || method.contains('/') {
            return None;
        }
        Some(Self {
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Serves calls with a tower service, such as a tonic-generated server
#[derive(Clone)]
pub struct ServiceHandler<S> {
    service: S,
}

impl<S> ServiceHandler<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S, B> Handler for ServiceHandler<S>
where
    S: Service<Request<ProxyBody>, Response = Response<B>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    fn call(&self, call: Call) -> CallFuture {
        let service = self.service.clone();
        Box::pin(service.oneshot(call.request).map(|result| match result {
            Ok(response) => Ok(response.map(body::boxed)),
            Err(never) => match never {},
        }))
    }
}

struct Route {
    kind: CallKind,
    handler: Arc<dyn Handler>,
}

/// Dispatches calls to local services or the unknown-method fallback
pub struct ServiceRouter {
    routes: HashMap<String, Route>,
    fallback: Arc<dyn Handler>,
}

impl ServiceRouter {
    pub fn new(fallback: Arc<dyn Handler>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    /// Serve `path` locally
    pub fn register(&mut self, path: &MethodPath, kind: CallKind, handler: Arc<dyn Handler>) {
        tracing::debug!("Registered local method {} ({})", path.full_name(), kind);
        self.routes.insert(path.full_name(), Route { kind, handler });
    }

    /// Shape of the call at `path`. Unknown methods are relayed as streams.
    pub fn call_kind(&self, path: &str) -> CallKind {
        self.routes
            .get(path)
            .map(|route| route.kind)
            .unwrap_or(CallKind::Streaming)
    }

    /// Names of the services registered locally, sorted
    pub fn service_names(&self) -> Vec<String> {
        self.routes
            .keys()
            .filter_map(|path| MethodPath::parse(path))
            .map(|path| path.service)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl Handler for ServiceRouter {
    fn call(&self, call: Call) -> CallFuture {
        match self.routes.get(call.method()) {
            Some(route) => route.handler.call(call),
            None => self.fallback.call(call),
        }
    }
}
