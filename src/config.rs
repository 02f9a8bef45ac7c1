//! Configuration module
//!
//! Static proxy settings. Values come from built-in defaults, optionally
//! overlaid by a YAML file, then by command-line flags.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ProxyError;

/// Main proxy configuration
///
/// Read-only once the proxy is constructed; shared across calls behind an `Arc`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the proxy listens on. An empty host means all interfaces.
    pub listen_addr: String,
    /// Address every call is forwarded to
    pub target_addr: String,
    /// Serve and dial over TLS
    pub enable_tls: bool,
    /// Server certificate (PEM). Also the trust root for the outbound connection.
    pub cert_file: PathBuf,
    /// Server private key (PEM)
    pub key_file: PathBuf,
    /// Log every call through the logging interceptor
    pub enable_logging: bool,
    /// Answer grpc.health.v1.Health/Check locally instead of forwarding it
    pub enable_health_service: bool,
    /// HTTP/2 SETTINGS_MAX_CONCURRENT_STREAMS advertised to each client connection
    pub max_concurrent_streams: u32,
    /// Bound on establishing the outbound connection of a call
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,
    /// How often drain progress is logged during shutdown
    #[serde(with = "duration_serde")]
    pub drain_log_interval: Duration,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":50051".to_string(),
            target_addr: ":50052".to_string(),
            enable_tls: false,
            cert_file: PathBuf::new(),
            key_file: PathBuf::new(),
            enable_logging: true,
            enable_health_service: false,
            max_concurrent_streams: 100,
            connection_timeout: Duration::from_secs(10),
            drain_log_interval: Duration::from_secs(10),
            logging: LoggingConfig::default(),
        }
    }
}

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "grpc-transparent-proxy")]
#[command(about = "A transparent gRPC reverse proxy that forwards every call to a single target")]
#[command(version)]
pub struct Args {
    /// Optional YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Proxy listen address
    #[arg(long)]
    pub listen: Option<String>,

    /// Target server address
    #[arg(long)]
    pub target: Option<String>,

    /// Enable TLS (requires --cert and --key)
    #[arg(long)]
    pub tls: bool,

    /// TLS certificate file
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// TLS key file
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Enable call logging (--log=false to disable)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub log: Option<bool>,

    /// Maximum concurrent streams per client connection
    #[arg(long)]
    pub max_streams: Option<u32>,

    /// Outbound connection timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Serve grpc.health.v1.Health/Check locally
    #[arg(long)]
    pub health: bool,

    /// Override log level
    #[arg(long)]
    pub log_level: Option<String>,
}

// Durations are configured in whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// A `host:port` network address.
///
/// Accepts `:port` (empty host), `host:port` and `[v6]:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn parse(addr: &str) -> Result<Self, ProxyError> {
        let addr = addr.trim();
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
            ProxyError::config(format!("Invalid address '{}': missing port", addr))
        })?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(|| {
                ProxyError::config(format!("Invalid address '{}': unterminated '['", addr))
            })?,
            None if host.contains(':') => {
                return Err(ProxyError::config(format!(
                    "Invalid address '{}': IPv6 hosts must be enclosed in brackets",
                    addr
                )))
            }
            None => host,
        };

        let port = port
            .parse::<u16>()
            .map_err(|e| ProxyError::config(format!("Invalid port in address '{}': {}", addr, e)))?;

        Ok(Address {
            host: host.to_string(),
            port,
        })
    }

    /// Host to bind when listening; empty means every interface
    pub fn listen_host(&self) -> &str {
        if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        }
    }

    /// Host to dial; empty means the local machine
    pub fn dial_host(&self) -> &str {
        if self.host.is_empty() {
            "127.0.0.1"
        } else {
            &self.host
        }
    }

    pub fn to_listen_string(&self) -> String {
        join_host_port(self.listen_host(), self.port)
    }

    pub fn to_dial_string(&self) -> String {
        join_host_port(self.dial_host(), self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host, self.port))
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ProxyError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    // Parse without validating; command-line flags may still complete it
    fn read_file(path: &std::path::Path) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: ProxyConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Build configuration from command-line arguments
    pub fn from_args(args: Args) -> Result<Self, ProxyError> {
        // Defaults, or the file when one is given
        let mut config = match args.config {
            Some(ref path) => Self::read_file(path)?,
            None => Self::default(),
        };

        if let Some(listen) = args.listen {
            config.listen_addr = listen;
        }

        if let Some(target) = args.target {
            config.target_addr = target;
        }

        if args.tls {
            config.enable_tls = true;
        }

        if let Some(cert) = args.cert {
            config.cert_file = cert;
        }

        if let Some(key) = args.key {
            config.key_file = key;
        }

        if let Some(log) = args.log {
            config.enable_logging = log;
        }

        if let Some(max_streams) = args.max_streams {
            config.max_concurrent_streams = max_streams;
        }

        if let Some(timeout) = args.timeout {
            config.connection_timeout = Duration::from_secs(timeout);
        }

        if args.health {
            config.enable_health_service = true;
        }

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        config.validate()?;

        Ok(config)
    }

    pub fn listen_address(&self) -> Result<Address, ProxyError> {
        Address::parse(&self.listen_addr)
    }

    pub fn target_address(&self) -> Result<Address, ProxyError> {
        Address::parse(&self.target_addr)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ProxyError> {
        self.validate_addresses()?;
        self.validate_limits()?;
        self.validate_tls_config()?;
        self.validate_logging_config()?;
        Ok(())
    }

    fn validate_addresses(&self) -> Result<(), ProxyError> {
        self.listen_address()
            .map_err(|e| ProxyError::config(format!("Invalid listen address: {}", e)))?;

        let target = self
            .target_address()
            .map_err(|e| ProxyError::config(format!("Invalid target address: {}", e)))?;
        if target.port == 0 {
            return Err(ProxyError::config("Target port cannot be 0"));
        }

        Ok(())
    }

    fn validate_limits(&self) -> Result<(), ProxyError> {
        if self.max_concurrent_streams == 0 {
            return Err(ProxyError::config("max_concurrent_streams must be at least 1"));
        }

        if self.connection_timeout.is_zero() {
            return Err(ProxyError::config("connection_timeout cannot be 0"));
        }

        if self.drain_log_interval.is_zero() {
            return Err(ProxyError::config("drain_log_interval cannot be 0"));
        }

        Ok(())
    }

    fn validate_tls_config(&self) -> Result<(), ProxyError> {
        if !self.enable_tls {
            return Ok(());
        }

        let cert_provided = !self.cert_file.as_os_str().is_empty();
        let key_provided = !self.key_file.as_os_str().is_empty();

        if !cert_provided || !key_provided {
            return Err(ProxyError::config(
                "TLS is enabled but cert_file and key_file were not both provided",
            ));
        }

        if !self.cert_file.exists() {
            return Err(ProxyError::config(format!(
                "TLS certificate file not found: {}",
                self.cert_file.display()
            )));
        }

        if !self.key_file.exists() {
            return Err(ProxyError::config(format!(
                "TLS key file not found: {}",
                self.key_file.display()
            )));
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<(), ProxyError> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            _ => Err(ProxyError::config(format!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ProxyConfig::default();

        assert_eq!(config.listen_addr, ":50051");
        assert_eq!(config.target_addr, ":50052");
        assert!(!config.enable_tls);
        assert!(config.enable_logging);
        assert!(!config.enable_health_service);
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_address_parsing() {
        let addr = Address::parse(":50051").unwrap();
        assert_eq!(addr.host, "");
        assert_eq!(addr.port, 50051);
        assert_eq!(addr.to_listen_string(), "0.0.0.0:50051");
        assert_eq!(addr.to_dial_string(), "127.0.0.1:50051");

        let addr = Address::parse("backend.internal:9000").unwrap();
        assert_eq!(addr.dial_host(), "backend.internal");
        assert_eq!(addr.to_string(), "backend.internal:9000");

        let addr = Address::parse("[::1]:8443").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.to_dial_string(), "[::1]:8443");
    }

    #[test]
    fn test_address_parsing_errors() {
        assert!(Address::parse("localhost").is_err());
        assert!(Address::parse("localhost:http").is_err());
        assert!(Address::parse("::1:80").is_err());
        assert!(Address::parse("[::1:80").is_err());
        assert!(Address::parse("host:70000").is_err());
    }

    #[test]
    fn test_valid_yaml_config() {
        let cert_file = NamedTempFile::new().unwrap();
        let key_file = NamedTempFile::new().unwrap();
        fs::write(cert_file.path(), "dummy cert").unwrap();
        fs::write(key_file.path(), "dummy key").unwrap();

        let yaml_content = format!(
            r#"
listen_addr: "127.0.0.1:9000"
target_addr: "127.0.0.1:9001"
enable_tls: true
cert_file: "{}"
key_file: "{}"
enable_logging: false
max_concurrent_streams: 1
connection_timeout: 2
logging:
  level: "debug"
"#,
            cert_file.path().display(),
            key_file.path().display()
        );

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ProxyConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.target_addr, "127.0.0.1:9001");
        assert!(config.enable_tls);
        assert!(!config.enable_logging);
        assert_eq!(config.max_concurrent_streams, 1);
        assert_eq!(config.connection_timeout, Duration::from_secs(2));
        assert_eq!(config.logging.level, "debug");
        // Unset keys keep their defaults
        assert_eq!(config.drain_log_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"target_addr: \"10.1.2.3:7000\"\n").unwrap();

        let config = ProxyConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.listen_addr, ":50051");
        assert_eq!(config.target_addr, "10.1.2.3:7000");
        assert_eq!(config.max_concurrent_streams, 100);
    }

    #[test]
    fn test_invalid_yaml_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"max_concurrent_streams: lots\n")
            .unwrap();

        let err = ProxyConfig::from_file(temp_file.path()).unwrap_err();
        assert!(matches!(err, ProxyError::Serialization(_)), "{}", err);
        assert!(err.to_string().starts_with("YAML parsing error"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_config_file() {
        let result = ProxyConfig::from_file(std::path::Path::new("/nonexistent/config.yaml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_validation_limits() {
        let mut config = ProxyConfig::default();
        config.max_concurrent_streams = 0;
        assert!(config.validate().unwrap_err().to_string().contains("max_concurrent_streams"));

        let mut config = ProxyConfig::default();
        config.connection_timeout = Duration::ZERO;
        assert!(config.validate().unwrap_err().to_string().contains("connection_timeout"));

        let mut config = ProxyConfig::default();
        config.target_addr = "127.0.0.1:0".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("Target port cannot be 0"));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = ProxyConfig::default();
        config.logging.level = "loud".to_string();

        let error_msg = config.validate().unwrap_err().to_string();
        assert!(error_msg.contains("Invalid log level"));
    }

    #[test]
    fn test_tls_requires_both_files() {
        let cert_file = NamedTempFile::new().unwrap();

        let mut config = ProxyConfig::default();
        config.enable_tls = true;
        config.cert_file = cert_file.path().to_path_buf();

        let error_msg = config.validate().unwrap_err().to_string();
        assert!(error_msg.contains("cert_file and key_file"));
    }

    #[test]
    fn test_tls_missing_files() {
        let mut config = ProxyConfig::default();
        config.enable_tls = true;
        config.cert_file = PathBuf::from("/nonexistent/cert.pem");
        config.key_file = PathBuf::from("/nonexistent/key.pem");

        let error_msg = config.validate().unwrap_err().to_string();
        assert!(error_msg.contains("TLS certificate file not found"));
    }

    #[test]
    fn test_tls_files_ignored_when_disabled() {
        let mut config = ProxyConfig::default();
        config.cert_file = PathBuf::from("/nonexistent/cert.pem");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_args_override() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"listen_addr: \":7000\"\ntarget_addr: \":7001\"\nmax_concurrent_streams: 5\n")
            .unwrap();

        let args = Args {
            config: Some(temp_file.path().to_path_buf()),
            listen: Some("127.0.0.1:9000".to_string()),
            target: None,
            log: Some(false),
            timeout: Some(3),
            health: true,
            log_level: Some("debug".to_string()),
            ..Args::default()
        };

        let config = ProxyConfig::from_args(args).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.target_addr, ":7001");
        assert_eq!(config.max_concurrent_streams, 5);
        assert!(!config.enable_logging);
        assert!(config.enable_health_service);
        assert_eq!(config.connection_timeout, Duration::from_secs(3));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_args_tls_without_files_is_rejected() {
        let args = Args {
            tls: true,
            ..Args::default()
        };

        let result = ProxyConfig::from_args(args);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let args = Args::try_parse_from([
            "grpc-transparent-proxy",
            "--listen",
            ":9000",
            "--target",
            ":9001",
            "--max-streams",
            "1",
            "--timeout",
            "2",
            "--log",
            "false",
        ])
        .unwrap();

        assert_eq!(args.listen.as_deref(), Some(":9000"));
        assert_eq!(args.max_streams, Some(1));
        assert_eq!(args.log, Some(false));

        let config = ProxyConfig::from_args(args).unwrap();
        assert_eq!(config.target_addr, ":9001");
        assert_eq!(config.connection_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_cli_bare_log_flag() {
        let args = Args::try_parse_from(["grpc-transparent-proxy", "--log", "--target", ":9001"]).unwrap();
        assert_eq!(args.log, Some(true));
        assert_eq!(args.target.as_deref(), Some(":9001"));

        let args = Args::try_parse_from(["grpc-transparent-proxy", "--log"]).unwrap();
        assert_eq!(args.log, Some(true));

        let args = Args::try_parse_from(["grpc-transparent-proxy", "--log=false"]).unwrap();
        assert_eq!(args.log, Some(false));
        assert!(!ProxyConfig::from_args(args).unwrap().enable_logging);

        let args = Args::try_parse_from(["grpc-transparent-proxy"]).unwrap();
        assert_eq!(args.log, None);
    }
}
