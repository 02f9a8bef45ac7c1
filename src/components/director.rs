//! Stream Director Component
//!
//! Per-call routing: copies the inbound metadata into an independent outbound
//! context and opens a fresh HTTP/2 connection to the target. Connections are
//! never pooled; the driver task of each one exits when its call completes.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{request, Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use pin_project::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::body::ProxyBody;
use crate::components::credentials::{ClientCredentials, CredentialProvider};
use crate::config::{Address, ProxyConfig};
use crate::error::ProxyError;

pub const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Headers that describe the payload rather than the call. They are copied
/// onto the outbound request verbatim but are not application metadata.
pub const PAYLOAD_HEADERS: [&str; 4] = [
    "content-type",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-message-type",
];

/// Connection-specific headers that must never cross the proxy
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "upgrade",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "keep-alive",
    "transfer-encoding",
];

/// Transport headers regenerated for every hop
const TRANSPORT_HEADERS: [&str; 3] = ["content-length", "host", GRPC_TIMEOUT];

fn is_metadata(name: &HeaderName) -> bool {
    let name = name.as_str();
    !HOP_BY_HOP_HEADERS.contains(&name)
        && !TRANSPORT_HEADERS.contains(&name)
        && !PAYLOAD_HEADERS.contains(&name)
}

/// The application metadata carried by a set of request headers, in arrival
/// order with repeated keys kept
pub fn application_metadata(headers: &HeaderMap) -> HeaderMap {
    let mut metadata = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if is_metadata(name) {
            metadata.append(name.clone(), value.clone());
        }
    }
    metadata
}

/// Per-call information the director routes on
#[derive(Debug, Clone)]
pub struct CallContext {
    method: String,
    metadata: HeaderMap,
    deadline: Option<Instant>,
    peer_addr: Option<SocketAddr>,
}

impl CallContext {
    /// Build a call context from inbound request parts
    pub fn from_parts(parts: &request::Parts, peer_addr: Option<SocketAddr>) -> Self {
        let received_at = Instant::now();
        let metadata = application_metadata(&parts.headers);

        let deadline = parts
            .headers
            .get(GRPC_TIMEOUT)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| match parse_grpc_timeout(v) {
                Some(timeout) => Some(timeout),
                None => {
                    debug!("Ignoring malformed grpc-timeout: {:?}", v);
                    None
                }
            })
            .map(|timeout| received_at + timeout);

        Self {
            method: parts.uri.path().to_string(),
            metadata,
            deadline,
            peer_addr,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Application metadata, in arrival order with repeated keys kept
    pub fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Time left before the call deadline, `None` when the call has no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Outgoing side of a call. Owns its own copy of the metadata.
#[derive(Debug, Clone)]
pub struct OutboundContext {
    metadata: HeaderMap,
    deadline: Option<Instant>,
}

impl OutboundContext {
    fn from_call(ctx: &CallContext) -> Self {
        Self {
            metadata: ctx.metadata.clone(),
            deadline: ctx.deadline,
        }
    }

    pub fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut HeaderMap {
        &mut self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The `grpc-timeout` value to send, recomputed from what is left
    pub fn grpc_timeout(&self) -> Option<HeaderValue> {
        self.deadline.map(|deadline| {
            encode_grpc_timeout(deadline.saturating_duration_since(Instant::now()))
        })
    }
}

/// A fresh HTTP/2 client connection to the target
pub struct OutboundConnection {
    sender: http2::SendRequest<ProxyBody>,
    authority: String,
    scheme: http::uri::Scheme,
}

impl std::fmt::Debug for OutboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnection")
            .field("authority", &self.authority)
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl OutboundConnection {
    /// `host:port` of the target
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn scheme(&self) -> &http::uri::Scheme {
        &self.scheme
    }

    /// Send one request. Consumes the connection: one call, one connection.
    pub async fn send_request(
        mut self,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        self.sender.send_request(request).await
    }
}

/// Routes each call to the configured target
pub struct StreamDirector {
    config: Arc<ProxyConfig>,
    target: Address,
    credentials: CredentialProvider,
}

impl StreamDirector {
    pub fn new(config: Arc<ProxyConfig>, credentials: CredentialProvider) -> Result<Self, ProxyError> {
        let target = config.target_address()?;
        Ok(Self {
            config,
            target,
            credentials,
        })
    }

    /// Resolve the outbound side of a call
    pub async fn route(
        &self,
        ctx: &CallContext,
        full_method: &str,
    ) -> Result<(OutboundContext, OutboundConnection), ProxyError> {
        if self.config.enable_logging {
            info!(
                event = "route",
                method = %full_method,
                peer = ?ctx.peer_addr(),
                "Director routing call"
            );
        }

        let outbound_ctx = OutboundContext::from_call(ctx);
        let credentials = self.credentials.outbound();

        let mut bound = self.config.connection_timeout;
        if let Some(remaining) = ctx.remaining() {
            bound = bound.min(remaining);
        }

        let addr = self.target.to_dial_string();
        let connection = match timeout(bound, self.connect(credentials)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                warn!(
                    event = "route_failed",
                    method = %full_method,
                    target = %addr,
                    category = %e.category(),
                    error = %e,
                    "Failed to reach target"
                );
                return Err(e);
            }
            Err(_) => {
                warn!(
                    event = "route_timeout",
                    method = %full_method,
                    target = %addr,
                    timeout_ms = bound.as_millis() as u64,
                    "Timed out connecting to target"
                );
                return Err(ProxyError::connection_timeout(addr, bound.as_millis() as u64));
            }
        };

        Ok((outbound_ctx, connection))
    }

    async fn connect(&self, credentials: ClientCredentials) -> Result<OutboundConnection, ProxyError> {
        let addr = self.target.to_dial_string();
        debug!("Creating new connection to {}", addr);

        let tcp_stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ProxyError::upstream_unavailable(addr.as_str(), e))?;
        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let scheme = credentials.scheme();
        let sender = match credentials {
            ClientCredentials::Insecure => handshake(tcp_stream, &addr).await?,
            ClientCredentials::Tls {
                connector,
                server_name,
            } => {
                let tls_stream =
                    ClientCredentials::handshake(&connector, &server_name, tcp_stream).await?;
                handshake(tls_stream, &addr).await?
            }
        };

        debug!("Connection to {} ready", addr);
        Ok(OutboundConnection {
            sender,
            authority: addr,
            scheme,
        })
    }
}

/// Client IO that fires a signal the first time the target sends any bytes.
///
/// For an HTTP/2 target those bytes are the server connection preface, so a
/// peer that accepts TCP and then stays silent never fires it.
#[pin_project]
struct PrefaceSignal<T> {
    #[pin]
    inner: T,
    received: Option<oneshot::Sender<()>>,
}

impl<T> PrefaceSignal<T> {
    fn new(inner: T) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner,
                received: Some(tx),
            },
            rx,
        )
    }
}

impl<T: AsyncRead> AsyncRead for PrefaceSignal<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);

        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            if let Some(received) = this.received.take() {
                let _ = received.send(());
            }
        }
        result
    }
}

impl<T: AsyncWrite> AsyncWrite for PrefaceSignal<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// HTTP/2 handshake plus readiness wait. The connection driver is spawned and
/// lives until the sender is dropped and its streams finish.
///
/// The connection counts as ready only once the target has sent its preface.
/// Callers bound this with the connection timeout.
async fn handshake<T>(io: T, addr: &str) -> Result<http2::SendRequest<ProxyBody>, ProxyError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (io, preface) = PrefaceSignal::new(io);
    let (mut sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io))
        .await
        .map_err(|e| ProxyError::upstream_unavailable(addr, format!("HTTP/2 handshake failed: {}", e)))?;

    let target = addr.to_string();
    tokio::spawn(async move {
        match conn.await {
            Ok(()) => debug!("Outbound connection to {} closed", target),
            Err(e) => debug!("Outbound connection to {} ended with error: {}", target, e),
        }
    });

    preface
        .await
        .map_err(|_| ProxyError::upstream_unavailable(addr, "connection closed before the HTTP/2 server preface"))?;

    sender
        .ready()
        .await
        .map_err(|e| ProxyError::upstream_unavailable(addr, format!("connection not ready: {}", e)))?;

    Ok(sender)
}

/// Parse a `grpc-timeout` header value: up to 8 digits followed by a unit
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let duration = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Encode a duration as a `grpc-timeout` value, picking the finest unit that
/// fits in 8 digits
pub fn encode_grpc_timeout(duration: Duration) -> HeaderValue {
    const MAX: u128 = 99_999_999;

    let nanos = duration.as_nanos();
    let (amount, unit) = if nanos <= MAX {
        (nanos, "n")
    } else if nanos / 1_000 <= MAX {
        (nanos / 1_000, "u")
    } else if nanos / 1_000_000 <= MAX {
        (nanos / 1_000_000, "m")
    } else if nanos / 1_000_000_000 <= MAX {
        (nanos / 1_000_000_000, "S")
    } else if nanos / 60_000_000_000 <= MAX {
        (nanos / 60_000_000_000, "M")
    } else {
        ((nanos / 3_600_000_000_000).min(MAX), "H")
    };

    HeaderValue::from_str(&format!("{}{}", amount, unit))
        .unwrap_or_else(|_| HeaderValue::from_static("99999999H"))
}
