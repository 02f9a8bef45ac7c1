//! Error handling module
//!
//! Process-level errors of the proxy and their mapping onto gRPC statuses for
//! the failures that end up in front of a caller.

use thiserror::Error;
use tonic::{Code, Status};

/// Main error type for the proxy server
#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("YAML parsing error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    // TLS errors
    #[error("TLS configuration error: {message}")]
    TlsConfig { message: String },

    #[error("TLS handshake failed: {message}")]
    TlsHandshake { message: String },

    // Network and connection errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    // Outbound (target) errors
    #[error("Connection timeout to {address} after {timeout_ms}ms")]
    ConnectionTimeout { address: String, timeout_ms: u64 },

    #[error("Target server unavailable: {address}: {reason}")]
    UpstreamUnavailable { address: String, reason: String },

    #[error("Deadline exceeded while calling {address}")]
    DeadlineExceeded { address: String },

    // Lifecycle errors
    #[error("Proxy is already running")]
    AlreadyRunning,

    #[error("Proxy has been stopped and cannot be restarted")]
    AlreadyStopped,

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

/// Error categories for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Tls,
    Network,
    Protocol,
    Upstream,
    Lifecycle,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Tls => "tls",
            ErrorCategory::Network => "network",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Upstream => "upstream",
            ErrorCategory::Lifecycle => "lifecycle",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl ProxyError {
    /// Map the error onto the gRPC status a caller sees.
    ///
    /// Anything that prevented a route to the target is `UNAVAILABLE`.
    pub fn to_grpc_status(&self) -> Status {
        let code = match self {
            ProxyError::ConnectionTimeout { .. }
            | ProxyError::UpstreamUnavailable { .. }
            | ProxyError::TlsHandshake { .. }
            | ProxyError::Io(_)
            | ProxyError::Http(_) => Code::Unavailable,

            ProxyError::DeadlineExceeded { .. } => Code::DeadlineExceeded,

            ProxyError::ProtocolError(_) => Code::Internal,

            ProxyError::AlreadyRunning | ProxyError::AlreadyStopped => Code::Unavailable,

            ProxyError::ConfigError(_)
            | ProxyError::Serialization(_)
            | ProxyError::TlsConfig { .. }
            | ProxyError::Bind { .. }
            | ProxyError::Internal { .. } => Code::Internal,
        };

        Status::new(code, self.to_string())
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProxyError::ConfigError(_) | ProxyError::Serialization(_) => ErrorCategory::Config,

            ProxyError::TlsConfig { .. } | ProxyError::TlsHandshake { .. } => ErrorCategory::Tls,

            ProxyError::Io(_) | ProxyError::Bind { .. } => ErrorCategory::Network,

            ProxyError::Http(_) | ProxyError::ProtocolError(_) => ErrorCategory::Protocol,

            ProxyError::ConnectionTimeout { .. }
            | ProxyError::UpstreamUnavailable { .. }
            | ProxyError::DeadlineExceeded { .. } => ErrorCategory::Upstream,

            ProxyError::AlreadyRunning | ProxyError::AlreadyStopped => ErrorCategory::Lifecycle,

            ProxyError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Errors that must stop the process rather than fail a single call
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Config | ErrorCategory::Lifecycle
        ) || matches!(self, ProxyError::TlsConfig { .. } | ProxyError::Bind { .. })
    }

    pub fn config(message: impl Into<String>) -> Self {
        ProxyError::ConfigError(message.into())
    }

    pub fn tls_config(message: impl Into<String>) -> Self {
        ProxyError::TlsConfig {
            message: message.into(),
        }
    }

    pub fn upstream_unavailable(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ProxyError::UpstreamUnavailable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn connection_timeout(address: impl Into<String>, timeout_ms: u64) -> Self {
        ProxyError::ConnectionTimeout {
            address: address.into(),
            timeout_ms,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProxyError::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_failures_map_to_unavailable() {
        let errors = vec![
            ProxyError::connection_timeout("127.0.0.1:50052", 2000),
            ProxyError::upstream_unavailable("127.0.0.1:50052", "connection refused"),
            ProxyError::TlsHandshake {
                message: "bad certificate".to_string(),
            },
            ProxyError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];

        for error in errors {
            let status = error.to_grpc_status();
            assert_eq!(status.code(), Code::Unavailable, "{}", error);
            assert_eq!(status.message(), error.to_string());
        }
    }

    #[test]
    fn test_deadline_maps_to_deadline_exceeded() {
        let error = ProxyError::DeadlineExceeded {
            address: "127.0.0.1:1".to_string(),
        };
        assert_eq!(error.to_grpc_status().code(), Code::DeadlineExceeded);
        assert_eq!(error.category(), ErrorCategory::Upstream);
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_error_categorization() {
        assert_eq!(ProxyError::config("bad").category(), ErrorCategory::Config);
        assert_eq!(ProxyError::tls_config("bad").category(), ErrorCategory::Tls);
        assert_eq!(ProxyError::AlreadyStopped.category(), ErrorCategory::Lifecycle);
        assert_eq!(
            ProxyError::upstream_unavailable("x:1", "down").category(),
            ErrorCategory::Upstream
        );
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ProxyError::config("missing cert").is_fatal());
        assert!(ProxyError::tls_config("unreadable key").is_fatal());
        assert!(ProxyError::Bind {
            address: ":50051".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        }
        .is_fatal());
        assert!(!ProxyError::upstream_unavailable("x:1", "down").is_fatal());
    }

    #[test]
    fn test_internal_errors_map_to_internal() {
        let error = ProxyError::internal("descriptor pool");
        assert_eq!(error.category(), ErrorCategory::Internal);
        assert_eq!(error.to_grpc_status().code(), Code::Internal);
        assert!(!error.is_fatal());

        let yaml = serde_yaml::from_str::<std::collections::HashMap<String, u64>>("[")
            .map(|_| ())
            .map_err(ProxyError::from)
            .unwrap_err();
        assert!(matches!(yaml, ProxyError::Serialization(_)));
        assert_eq!(yaml.category(), ErrorCategory::Config);
        assert!(yaml.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let error = ProxyError::connection_timeout("10.0.0.1:443", 1500);
        assert_eq!(error.to_string(), "Connection timeout to 10.0.0.1:443 after 1500ms");

        let error = ProxyError::upstream_unavailable("10.0.0.1:443", "refused");
        assert_eq!(error.to_string(), "Target server unavailable: 10.0.0.1:443: refused");
    }
}
