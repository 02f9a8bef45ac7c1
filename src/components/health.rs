//! gRPC health service
//!
//! `grpc.health.v1.Health/Check` served in-process by tonic-health. The proxy
//! lifecycle drives the reported status: `SERVING` while accepting calls,
//! `NOT_SERVING` before that and once draining starts. `Watch` is not routed
//! here and falls through to the target like any other method.

use std::sync::Arc;
use tonic_health::server::{health_reporter, HealthReporter};
use tonic_health::ServingStatus;
use tracing::debug;

use crate::components::interceptor::Handler;
use crate::components::router::{MethodPath, ServiceHandler};

pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// Local implementation of the standard health service
pub struct HealthService {
    reporter: HealthReporter,
    services: Vec<String>,
    handler: Arc<dyn Handler>,
}

impl HealthService {
    /// `services` are the names reported on besides the overall server (`""`).
    /// Everything starts out `NOT_SERVING`; any other name is `NOT_FOUND`.
    pub async fn new(services: Vec<String>) -> Self {
        let (reporter, server) = health_reporter();
        let health = Self {
            reporter,
            services,
            handler: Arc::new(ServiceHandler::new(server)),
        };
        health.set_serving(false).await;
        health
    }

    pub fn check_path() -> MethodPath {
        MethodPath {
            service: HEALTH_SERVICE.to_string(),
            method: "Check".to_string(),
        }
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    /// Report every known service as serving or not
    pub async fn set_serving(&self, serving: bool) {
        let status = if serving {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        };

        let mut reporter = self.reporter.clone();
        for service in std::iter::once("").chain(self.services.iter().map(String::as_str)) {
            reporter.set_service_status(service, status).await;
        }
        debug!("Health status of {} service(s) set to {:?}", self.services.len() + 1, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{self, ProxyBody};
    use crate::components::interceptor::{Call, CallKind};
    use tonic::{Code, Status};
    use tonic_health::pb::health_check_response::ServingStatus as WireStatus;
    use tonic_health::pb::health_client::HealthClient;
    use tonic_health::pb::HealthCheckRequest;
    use tower::util::BoxCloneService;

    type LocalChannel =
        BoxCloneService<http::Request<tonic::body::BoxBody>, http::Response<ProxyBody>, Status>;

    /// A tonic client transport that hands requests straight to a handler
    fn local_channel(handler: Arc<dyn Handler>) -> LocalChannel {
        BoxCloneService::new(tower::service_fn(move |request: http::Request<tonic::body::BoxBody>| {
            handler.call(Call::new(CallKind::Unary, None, request.map(body::boxed)))
        }))
    }

    async fn check(client: &mut HealthClient<LocalChannel>, service: &str) -> Result<i32, Status> {
        let response = client
            .check(HealthCheckRequest {
                service: service.to_string(),
            })
            .await?;
        Ok(response.into_inner().status)
    }

    #[tokio::test]
    async fn test_check_follows_serving_state() {
        let health = HealthService::new(vec![HEALTH_SERVICE.to_string()]).await;
        let mut client = HealthClient::new(local_channel(health.handler()));

        assert_eq!(check(&mut client, "").await.unwrap(), WireStatus::NotServing as i32);

        health.set_serving(true).await;
        assert_eq!(check(&mut client, "").await.unwrap(), WireStatus::Serving as i32);
        assert_eq!(
            check(&mut client, HEALTH_SERVICE).await.unwrap(),
            WireStatus::Serving as i32
        );

        health.set_serving(false).await;
        assert_eq!(
            check(&mut client, HEALTH_SERVICE).await.unwrap(),
            WireStatus::NotServing as i32
        );
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let health = HealthService::new(Vec::new()).await;
        health.set_serving(true).await;
        let mut client = HealthClient::new(local_channel(health.handler()));

        let err = check(&mut client, "echo.Echo").await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_check_path() {
        assert_eq!(HealthService::check_path().full_name(), "/grpc.health.v1.Health/Check");
    }
}
