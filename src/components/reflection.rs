//! Server reflection
//!
//! `ServerReflectionInfo` for both `grpc.reflection.v1` and
//! `grpc.reflection.v1alpha`, served in-process by tonic-reflection from the
//! descriptors of the services the proxy answers itself. Proxied services
//! carry no schema here, so lookups of their symbols are answered with a
//! `NOT_FOUND` error response.

use std::sync::Arc;
use tonic_reflection::pb::{v1, v1alpha};
use tonic_reflection::server::Builder;
use tracing::debug;

use crate::components::interceptor::Handler;
use crate::components::router::{MethodPath, ServiceHandler};
use crate::error::ProxyError;

pub const REFLECTION_V1: &str = "grpc.reflection.v1.ServerReflection";
pub const REFLECTION_V1ALPHA: &str = "grpc.reflection.v1alpha.ServerReflection";

const REFLECTION_METHOD: &str = "ServerReflectionInfo";

/// Local reflection service, one handler per protocol version
pub struct ReflectionService {
    v1: Arc<dyn Handler>,
    v1alpha: Arc<dyn Handler>,
}

impl ReflectionService {
    /// `with_health` adds the health service descriptors to what is reflected
    pub fn new(with_health: bool) -> Result<Self, ProxyError> {
        let v1 = Self::builder(with_health)
            .build_v1()
            .map_err(|e| ProxyError::internal(format!("failed to build reflection v1: {}", e)))?;
        let v1alpha = Self::builder(with_health)
            .build_v1alpha()
            .map_err(|e| ProxyError::internal(format!("failed to build reflection v1alpha: {}", e)))?;
        debug!("Reflection descriptors loaded (health: {})", with_health);

        Ok(Self {
            v1: Arc::new(ServiceHandler::new(v1)),
            v1alpha: Arc::new(ServiceHandler::new(v1alpha)),
        })
    }

    fn builder(with_health: bool) -> Builder<'static> {
        let builder = Builder::configure()
            .include_reflection_service(false)
            .register_encoded_file_descriptor_set(v1::FILE_DESCRIPTOR_SET)
            .register_encoded_file_descriptor_set(v1alpha::FILE_DESCRIPTOR_SET);
        if with_health {
            builder.register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
        } else {
            builder
        }
    }

    fn method_path(service: &str) -> MethodPath {
        MethodPath {
            service: service.to_string(),
            method: REFLECTION_METHOD.to_string(),
        }
    }

    /// Every path this service answers on, with its handler
    pub fn routes(&self) -> Vec<(MethodPath, Arc<dyn Handler>)> {
        vec![
            (Self::method_path(REFLECTION_V1), Arc::clone(&self.v1)),
            (Self::method_path(REFLECTION_V1ALPHA), Arc::clone(&self.v1alpha)),
        ]
    }

    pub fn service_names() -> Vec<String> {
        vec![REFLECTION_V1.to_string(), REFLECTION_V1ALPHA.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{self, ProxyBody};
    use crate::components::health::HEALTH_SERVICE;
    use crate::components::interceptor::{Call, CallKind};
    use tonic::Status;
    use tower::util::BoxCloneService;
    use v1::server_reflection_client::ServerReflectionClient;
    use v1::server_reflection_request::MessageRequest;
    use v1::server_reflection_response::MessageResponse;
    use v1::{ServerReflectionRequest, ServerReflectionResponse};

    type LocalChannel =
        BoxCloneService<http::Request<tonic::body::BoxBody>, http::Response<ProxyBody>, Status>;

    fn local_channel(handler: Arc<dyn Handler>) -> LocalChannel {
        BoxCloneService::new(tower::service_fn(move |request: http::Request<tonic::body::BoxBody>| {
            handler.call(Call::new(CallKind::Streaming, None, request.map(body::boxed)))
        }))
    }

    fn v1_handler(reflection: &ReflectionService) -> Arc<dyn Handler> {
        reflection
            .routes()
            .into_iter()
            .find(|(path, _)| path.service == REFLECTION_V1)
            .map(|(_, handler)| handler)
            .unwrap()
    }

    async fn ask(handler: Arc<dyn Handler>, requests: Vec<MessageRequest>) -> Vec<ServerReflectionResponse> {
        let mut client = ServerReflectionClient::new(local_channel(handler));
        let requests: Vec<_> = requests
            .into_iter()
            .map(|message| ServerReflectionRequest {
                host: String::new(),
                message_request: Some(message),
            })
            .collect();

        let mut stream = client
            .server_reflection_info(futures::stream::iter(requests))
            .await
            .unwrap()
            .into_inner();
        let mut responses = Vec::new();
        while let Some(response) = stream.message().await.unwrap() {
            responses.push(response);
        }
        responses
    }

    fn listed(response: &ServerReflectionResponse) -> Vec<String> {
        match &response.message_response {
            Some(MessageResponse::ListServicesResponse(list)) => {
                let mut names: Vec<_> = list.service.iter().map(|s| s.name.clone()).collect();
                names.sort();
                names
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_routes_cover_both_versions() {
        let reflection = ReflectionService::new(false).unwrap();
        let paths: Vec<_> = reflection
            .routes()
            .into_iter()
            .map(|(path, _)| path.full_name())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo",
                "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo",
            ]
        );
    }

    #[tokio::test]
    async fn test_list_services_reports_local_services() {
        let reflection = ReflectionService::new(true).unwrap();
        let responses = ask(
            v1_handler(&reflection),
            vec![MessageRequest::ListServices(String::new())],
        )
        .await;

        assert_eq!(responses.len(), 1);
        assert_eq!(
            listed(&responses[0]),
            vec![
                "grpc.health.v1.Health",
                "grpc.reflection.v1.ServerReflection",
                "grpc.reflection.v1alpha.ServerReflection",
            ]
        );

        let reflection = ReflectionService::new(false).unwrap();
        let responses = ask(
            v1_handler(&reflection),
            vec![MessageRequest::ListServices(String::new())],
        )
        .await;
        assert_eq!(
            listed(&responses[0]),
            vec![REFLECTION_V1, REFLECTION_V1ALPHA]
        );
    }

    #[tokio::test]
    async fn test_symbol_lookups() {
        let reflection = ReflectionService::new(true).unwrap();
        let responses = ask(
            v1_handler(&reflection),
            vec![
                MessageRequest::FileContainingSymbol(HEALTH_SERVICE.to_string()),
                MessageRequest::FileContainingSymbol("echo.Echo".to_string()),
            ],
        )
        .await;

        assert_eq!(responses.len(), 2);
        match &responses[0].message_response {
            Some(MessageResponse::FileDescriptorResponse(files)) => {
                assert!(!files.file_descriptor_proto.is_empty())
            }
            other => panic!("unexpected response: {:?}", other),
        }
        match &responses[1].message_response {
            Some(MessageResponse::ErrorResponse(error)) => {
                assert_eq!(error.error_code, tonic::Code::NotFound as i32)
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
