//! Transparent gRPC Proxy
//!
//! A schema-agnostic gRPC reverse proxy. Every call arriving on the listen
//! address is relayed, frame by frame, to a single target server over a fresh
//! HTTP/2 connection. Metadata and deadlines are propagated; payloads are never
//! decoded. Built on hyper with HTTP/2, optional TLS with ALPN, and trailer
//! streaming.

pub mod body;
pub mod components;
pub mod config;
pub mod error;

pub use config::ProxyConfig;
pub use error::ProxyError;

use components::credentials::{self, CredentialProvider, ServerCredentials};
use components::health::{HealthService, HEALTH_SERVICE};
use components::{
    Call, CallKind, Interceptor, InterceptorChain, LoggingInterceptor, Pipeline,
    ReflectionService, ServiceRouter, StreamDirector, TransparentHandler,
};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::body::{ProxyBody, GRPC_CONTENT_TYPE};

/// Lifecycle of a [`GrpcProxy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running { local_addr: SocketAddr },
    Draining,
    Terminated,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Stopped => f.write_str("stopped"),
            ServerState::Starting => f.write_str("starting"),
            ServerState::Running { local_addr } => write!(f, "running on {}", local_addr),
            ServerState::Draining => f.write_str("draining"),
            ServerState::Terminated => f.write_str("terminated"),
        }
    }
}

/// What every connection of a running proxy needs
struct Shared {
    pipeline: Pipeline,
    router: Arc<ServiceRouter>,
    inbound: ServerCredentials,
    max_concurrent_streams: u32,
}

/// Counts live connections; the last one out wakes the drain loop
struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl ConnectionGuard {
    fn new(active: &Arc<AtomicUsize>, drained: &Arc<Notify>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active: Arc::clone(active),
            drained: Arc::clone(drained),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_one();
        }
    }
}

/// The proxy server
pub struct GrpcProxy {
    config: Arc<ProxyConfig>,
    state: watch::Sender<ServerState>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl GrpcProxy {
    /// Create a proxy in the `Stopped` state
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        let (state, _) = watch::channel(ServerState::Stopped);
        Ok(Self {
            config: Arc::new(config),
            state,
            interceptors: Vec::new(),
        })
    }

    /// Add an interceptor behind the built-in logging interceptor
    pub fn with_interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.borrow() {
            ServerState::Running { local_addr } => Some(local_addr),
            _ => None,
        }
    }

    /// Wait until the listener is bound. `None` if the proxy terminated first.
    pub async fn wait_until_running(&self) -> Option<SocketAddr> {
        let mut state_rx = self.state.subscribe();
        let state = state_rx
            .wait_for(|state| {
                matches!(
                    state,
                    ServerState::Running { .. } | ServerState::Draining | ServerState::Terminated
                )
            })
            .await
            .ok()
            .map(|state| *state);

        match state {
            Some(ServerState::Running { local_addr }) => Some(local_addr),
            _ => None,
        }
    }

    /// Serve until stopped. Returns once every connection has drained.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let mut admitted = Ok(());
        self.state.send_if_modified(|state| match state {
            ServerState::Stopped => {
                *state = ServerState::Starting;
                true
            }
            ServerState::Terminated => {
                admitted = Err(ProxyError::AlreadyStopped);
                false
            }
            _ => {
                admitted = Err(ProxyError::AlreadyRunning);
                false
            }
        });
        admitted?;

        let result = self.run().await;
        if let Err(ref e) = result {
            error!(
                event = "server_failed",
                category = %e.category(),
                error = %e,
                "Proxy server failed"
            );
        }

        self.state.send_replace(ServerState::Terminated);
        info!("Server shutdown complete");
        result
    }

    /// Stop accepting, let in-flight calls finish, then return. No-op unless
    /// the proxy is running.
    pub async fn stop(&self) {
        let mut state_rx = self.state.subscribe();

        let requested = self.state.send_if_modified(|state| match state {
            ServerState::Starting | ServerState::Running { .. } => {
                *state = ServerState::Draining;
                true
            }
            _ => false,
        });

        if !requested && *state_rx.borrow() != ServerState::Draining {
            debug!("Stop requested while {}, nothing to do", *state_rx.borrow());
            return;
        }

        if requested {
            info!("Graceful shutdown requested");
        }
        let _ = state_rx
            .wait_for(|state| *state == ServerState::Terminated)
            .await;
    }

    /// Assemble director, router and interceptors. Also returns the health
    /// service, if enabled, for the lifecycle to report through.
    async fn build_pipeline(
        &self,
        credentials: CredentialProvider,
    ) -> Result<(Pipeline, Arc<ServiceRouter>, Option<HealthService>), ProxyError> {
        let director = Arc::new(StreamDirector::new(Arc::clone(&self.config), credentials)?);
        let mut router = ServiceRouter::new(Arc::new(TransparentHandler::new(director)));

        let with_health = self.config.enable_health_service;
        let health = if with_health {
            let mut services = ReflectionService::service_names();
            services.push(HEALTH_SERVICE.to_string());
            services.sort();

            let health = HealthService::new(services).await;
            router.register(&HealthService::check_path(), CallKind::Unary, health.handler());
            Some(health)
        } else {
            None
        };

        let reflection = ReflectionService::new(with_health)?;
        for (path, handler) in reflection.routes() {
            router.register(&path, CallKind::Streaming, handler);
        }

        let router = Arc::new(router);

        let mut chain = InterceptorChain::new();
        if self.config.enable_logging {
            chain = chain.with(LoggingInterceptor::new());
        }
        for interceptor in &self.interceptors {
            chain = chain.with_shared(Arc::clone(interceptor));
        }
        debug!("Interceptor chain has {} interceptor(s)", chain.len());

        let pipeline = chain.wrap(router.clone());
        Ok((pipeline, router, health))
    }

    async fn run(&self) -> Result<(), ProxyError> {
        info!("Starting server startup sequence...");

        // Credential problems must surface before anything is bound
        let credentials = CredentialProvider::from_config(&self.config)?;
        let inbound = credentials.inbound().clone();
        let (pipeline, router, health) = self.build_pipeline(credentials).await?;

        info!(
            services = ?router.service_names(),
            target = %self.config.target_addr,
            "Local services registered, unknown methods are proxied"
        );

        let listen = self.config.listen_address()?;
        let bind_addr = listen.to_listen_string();
        info!("Binding to address: {}", bind_addr);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                address: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let running = self.state.send_if_modified(|state| {
            if *state == ServerState::Starting {
                *state = ServerState::Running { local_addr };
                true
            } else {
                false
            }
        });
        if !running {
            info!("Stop requested during startup, not serving");
            return Ok(());
        }

        if let Some(health) = &health {
            health.set_serving(true).await;
        }

        info!(
            event = "server_started",
            local_addr = %local_addr,
            tls = inbound.is_tls(),
            max_concurrent_streams = self.config.max_concurrent_streams,
            "gRPC proxy is ready and accepting connections"
        );

        let shared = Arc::new(Shared {
            pipeline,
            router,
            inbound,
            max_concurrent_streams: self.config.max_concurrent_streams,
        });
        let active = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let mut shutdown_rx = self.state.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let guard = ConnectionGuard::new(&active, &drained);
                            debug!(
                                "Accepted connection from {} (total connections: {})",
                                peer_addr,
                                active.load(Ordering::SeqCst)
                            );

                            let shared = Arc::clone(&shared);
                            let state_rx = self.state.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, peer_addr, shared, state_rx).await
                                {
                                    debug!("Connection error from {}: {}", peer_addr, e);
                                }
                                drop(guard);
                                debug!("Connection from {} closed", peer_addr);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                _ = shutdown_rx.wait_for(|state| !matches!(state, ServerState::Running { .. })) => {
                    info!("Shutting down server, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        if let Some(health) = &health {
            health.set_serving(false).await;
        }
        self.drain(&active, &drained).await;
        Ok(())
    }

    /// Wait for every connection to finish, logging progress periodically
    async fn drain(&self, active: &AtomicUsize, drained: &Notify) {
        let mut ticker = tokio::time::interval(self.config.drain_log_interval);
        ticker.tick().await;

        while active.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                _ = drained.notified() => {}
                _ = ticker.tick() => {
                    info!(
                        event = "drain_progress",
                        active_connections = active.load(Ordering::SeqCst),
                        "Waiting for in-flight calls to finish"
                    );
                }
            }
        }

        info!("All connections drained");
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        shared: Arc<Shared>,
        mut state_rx: watch::Receiver<ServerState>,
    ) -> Result<(), ProxyError> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        match shared.inbound.clone() {
            ServerCredentials::Tls(acceptor) => {
                let tls_stream = tokio::select! {
                    result = credentials::accept_tls(&acceptor, stream) => result?,
                    _ = state_rx.wait_for(|state| !matches!(state, ServerState::Running { .. })) => {
                        debug!("Connection from {} interrupted by shutdown during TLS handshake", peer_addr);
                        return Ok(());
                    }
                };
                debug!("HTTP/2 over TLS established with {}", peer_addr);
                Self::serve_http2_connection(TokioIo::new(tls_stream), peer_addr, shared, state_rx).await
            }
            ServerCredentials::Insecure => {
                debug!("Plaintext HTTP/2 connection established with {}", peer_addr);
                Self::serve_http2_connection(TokioIo::new(stream), peer_addr, shared, state_rx).await
            }
        }
    }

    /// Serve HTTP/2 connection (common for both TLS and plain connections)
    async fn serve_http2_connection<T>(
        io: TokioIo<T>,
        peer_addr: SocketAddr,
        shared: Arc<Shared>,
        mut state_rx: watch::Receiver<ServerState>,
    ) -> Result<(), ProxyError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let max_concurrent_streams = shared.max_concurrent_streams;
        let service = hyper::service::service_fn(move |request| {
            let shared = Arc::clone(&shared);
            async move {
                Ok::<_, Infallible>(Self::handle_request(request, &shared, peer_addr).await)
            }
        });

        let conn = http2::Builder::new(TokioExecutor::new())
            .max_concurrent_streams(max_concurrent_streams)
            .initial_stream_window_size(Some(1024 * 1024))
            .initial_connection_window_size(Some(1024 * 1024))
            .serve_connection(io, service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                return Self::connection_finished(result, peer_addr);
            }
            _ = state_rx.wait_for(|state| !matches!(state, ServerState::Running { .. })) => {
                debug!("Sending GOAWAY to {}", peer_addr);
                conn.as_mut().graceful_shutdown();
            }
        }

        Self::connection_finished(conn.await, peer_addr)
    }

    fn connection_finished(result: Result<(), hyper::Error>, peer_addr: SocketAddr) -> Result<(), ProxyError> {
        match result {
            Ok(()) => {
                debug!("HTTP/2 connection from {} completed normally", peer_addr);
                Ok(())
            }
            Err(e) if e.is_closed() || e.is_canceled() => {
                debug!("HTTP/2 connection closed by client {}: {}", peer_addr, e);
                Ok(())
            }
            Err(e) => {
                warn!("HTTP/2 connection error from {}: {}", peer_addr, e);
                Err(ProxyError::Http(e))
            }
        }
    }

    /// Plain HTTP error for requests that are not gRPC at all
    fn http_error(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
        let mut response = Response::new(body::full(message));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    }

    /// Handle a single HTTP/2 stream
    async fn handle_request(
        request: Request<Incoming>,
        shared: &Shared,
        peer_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        debug!(
            event = "request_received",
            peer_addr = %peer_addr,
            method = %request.method(),
            uri = %request.uri(),
            "Processing request"
        );

        if request.method() != Method::POST {
            warn!(
                event = "invalid_method",
                peer_addr = %peer_addr,
                method = %request.method(),
                uri = %request.uri(),
                "Non-POST request received"
            );
            return Self::http_error(StatusCode::METHOD_NOT_ALLOWED, "gRPC requires POST");
        }

        let is_grpc = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .map(|ct| ct.starts_with(GRPC_CONTENT_TYPE))
            .unwrap_or(false);
        if !is_grpc {
            warn!(
                event = "invalid_content_type",
                peer_addr = %peer_addr,
                uri = %request.uri(),
                content_type = ?request.headers().get(CONTENT_TYPE),
                "Non-gRPC request received"
            );
            return Self::http_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "content-type must be application/grpc",
            );
        }

        let kind = shared.router.call_kind(request.uri().path());
        let call = Call::new(kind, Some(peer_addr), request.map(body::boxed));

        match shared.pipeline.call(call).await {
            Ok(response) => response,
            Err(status) => body::status_response(status),
        }
    }
}
