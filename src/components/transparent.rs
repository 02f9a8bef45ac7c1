//! Transparent Handler Component
//!
//! Fallback for every method the proxy does not serve itself. Asks the
//! director for an outbound connection, then relays the call as raw HTTP/2:
//! request frames stream to the target as they arrive, and the target's
//! headers, data frames and trailers stream back untouched.

use http::header::{HeaderValue, CONTENT_TYPE, TE};
use http::{Method, Request, Uri};
use std::sync::Arc;
use tokio::time::timeout_at;
use tonic::Status;
use tracing::{debug, warn};

use crate::body::{self, ProxyBody, GRPC_CONTENT_TYPE};
use crate::components::director::{CallContext, StreamDirector, GRPC_TIMEOUT, PAYLOAD_HEADERS};
use crate::components::interceptor::{Call, CallFuture, Handler};
use crate::error::ProxyError;

/// Relays unknown methods to the target
#[derive(Clone)]
pub struct TransparentHandler {
    director: Arc<StreamDirector>,
}

impl TransparentHandler {
    pub fn new(director: Arc<StreamDirector>) -> Self {
        Self { director }
    }

    async fn relay(director: Arc<StreamDirector>, call: Call) -> Result<http::Response<ProxyBody>, Status> {
        let (parts, inbound_body) = call.request.into_parts();
        let ctx = CallContext::from_parts(&parts, call.peer_addr);
        let method = ctx.method().to_string();

        if ctx.remaining().is_some_and(|left| left.is_zero()) {
            return Err(Status::deadline_exceeded("deadline expired before the call was routed"));
        }

        let (outbound_ctx, connection) = director
            .route(&ctx, &method)
            .await
            .map_err(|e| e.to_grpc_status())?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = Uri::builder()
            .scheme(connection.scheme().clone())
            .authority(connection.authority())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| Status::internal(format!("invalid outbound URI: {}", e)))?;

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .version(http::Version::HTTP_2)
            .body(inbound_body)
            .map_err(|e| Status::internal(format!("invalid outbound request: {}", e)))?;

        let headers = request.headers_mut();
        for (name, value) in outbound_ctx.metadata().iter() {
            headers.append(name.clone(), value.clone());
        }
        for name in PAYLOAD_HEADERS {
            for value in parts.headers.get_all(name).iter() {
                headers.append(name, value.clone());
            }
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
        }
        headers.insert(TE, HeaderValue::from_static("trailers"));
        if let Some(grpc_timeout) = outbound_ctx.grpc_timeout() {
            headers.insert(GRPC_TIMEOUT, grpc_timeout);
        }

        debug!("Relaying {} to {}", method, connection.authority());
        let authority = connection.authority().to_string();
        let send = connection.send_request(request);

        let response = match outbound_ctx.deadline() {
            Some(deadline) => match timeout_at(deadline, send).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        event = "deadline_exceeded",
                        method = %method,
                        target = %authority,
                        "Call deadline expired before the target responded"
                    );
                    return Err(ProxyError::DeadlineExceeded { address: authority }.to_grpc_status());
                }
            },
            None => send.await,
        };

        let response = response.map_err(|e| {
            warn!(
                event = "relay_failed",
                method = %method,
                target = %authority,
                error = %e,
                "Outbound stream failed before response headers"
            );
            ProxyError::upstream_unavailable(authority.as_str(), e).to_grpc_status()
        })?;

        let (parts, body) = response.into_parts();
        Ok(http::Response::from_parts(parts, body::boxed(body)))
    }
}

impl Handler for TransparentHandler {
    fn call(&self, call: Call) -> CallFuture {
        Box::pin(Self::relay(Arc::clone(&self.director), call))
    }
}
