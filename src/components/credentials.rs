//! Credential Provider Component
//!
//! Resolves transport credentials for the inbound listener and the outbound
//! dial. With TLS disabled both directions are explicitly insecure. With TLS
//! enabled the listener presents `cert_file`/`key_file`, and the outbound
//! connection trusts `cert_file` as its only root: proxy and target are assumed
//! to share one deployment certificate.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::config::{Address, ProxyConfig};
use crate::error::ProxyError;

const ALPN_H2: &[u8] = b"h2";

/// Credentials used by the listener
#[derive(Clone)]
pub enum ServerCredentials {
    Insecure,
    Tls(TlsAcceptor),
}

/// Credentials used for each outbound connection
#[derive(Clone)]
pub enum ClientCredentials {
    Insecure,
    Tls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

impl std::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerCredentials::Insecure => f.write_str("ServerCredentials::Insecure"),
            ServerCredentials::Tls(_) => f.write_str("ServerCredentials::Tls"),
        }
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientCredentials::Insecure => f.write_str("ClientCredentials::Insecure"),
            ClientCredentials::Tls { server_name, .. } => f
                .debug_struct("ClientCredentials::Tls")
                .field("server_name", server_name)
                .finish(),
        }
    }
}

impl ServerCredentials {
    pub fn is_tls(&self) -> bool {
        matches!(self, ServerCredentials::Tls(_))
    }
}

impl ClientCredentials {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientCredentials::Tls { .. })
    }

    /// URI scheme matching these credentials
    pub fn scheme(&self) -> http::uri::Scheme {
        match self {
            ClientCredentials::Insecure => http::uri::Scheme::HTTP,
            ClientCredentials::Tls { .. } => http::uri::Scheme::HTTPS,
        }
    }

    /// Perform the client TLS handshake over an established TCP stream
    pub async fn handshake(
        connector: &TlsConnector,
        server_name: &ServerName<'static>,
        stream: TcpStream,
    ) -> Result<client::TlsStream<TcpStream>, ProxyError> {
        let tls_stream = connector
            .connect(server_name.clone(), stream)
            .await
            .map_err(|e| ProxyError::TlsHandshake {
                message: format!("outbound handshake with {:?} failed: {}", server_name, e),
            })?;

        let negotiated = tls_stream.get_ref().1.alpn_protocol();
        if negotiated != Some(ALPN_H2) {
            return Err(ProxyError::TlsHandshake {
                message: "target did not negotiate HTTP/2 (ALPN h2)".to_string(),
            });
        }

        Ok(tls_stream)
    }
}

/// Resolves inbound and outbound credentials from configuration
#[derive(Debug, Clone)]
pub struct CredentialProvider {
    inbound: ServerCredentials,
    outbound: ClientCredentials,
}

impl CredentialProvider {
    /// Load all credential material. Any failure here is fatal to startup.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        if !config.enable_tls {
            tracing::info!("TLS disabled - inbound and outbound connections are plaintext");
            return Ok(Self {
                inbound: ServerCredentials::Insecure,
                outbound: ClientCredentials::Insecure,
            });
        }

        let cert_file = &config.cert_file;
        let key_file = &config.key_file;

        let server_config = Self::build_server_config(cert_file, key_file)?;
        let client_config = Self::build_client_config(cert_file)?;
        let server_name = Self::target_server_name(&config.target_address()?)?;

        tracing::info!(
            cert_file = %cert_file.display(),
            server_name = ?server_name,
            "TLS enabled - proxy certificate is also the outbound trust root"
        );

        Ok(Self {
            inbound: ServerCredentials::Tls(TlsAcceptor::from(Arc::new(server_config))),
            outbound: ClientCredentials::Tls {
                connector: TlsConnector::from(Arc::new(client_config)),
                server_name,
            },
        })
    }

    pub fn inbound(&self) -> &ServerCredentials {
        &self.inbound
    }

    /// Credentials for one outbound connection
    pub fn outbound(&self) -> ClientCredentials {
        self.outbound.clone()
    }

    /// Load certificates from PEM file
    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
        let cert_file = File::open(path).map_err(|e| {
            ProxyError::tls_config(format!(
                "Failed to open certificate file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut reader = BufReader::new(cert_file);

        let certs = certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::tls_config(format!("Failed to parse certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(ProxyError::tls_config(format!(
                "No certificates found in {}",
                path.display()
            )));
        }

        Ok(certs)
    }

    /// Load private key from PEM file
    fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
        let key_file = File::open(path).map_err(|e| {
            ProxyError::tls_config(format!(
                "Failed to open private key file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut reader = BufReader::new(key_file);

        private_key(&mut reader)
            .map_err(|e| ProxyError::tls_config(format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| {
                ProxyError::tls_config(format!("No private key found in {}", path.display()))
            })
    }

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    /// Server identity advertising only HTTP/2
    fn build_server_config(cert_file: &Path, key_file: &Path) -> Result<ServerConfig, ProxyError> {
        let certs = Self::load_certs(cert_file)?;
        let key = Self::load_private_key(key_file)?;

        let mut server_config = ServerConfig::builder_with_provider(Self::provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::tls_config(format!("Unsupported TLS versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::tls_config(format!("Failed to build TLS config: {}", e)))?;

        server_config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(server_config)
    }

    /// Client config trusting exactly the certificates in `cert_file`
    fn build_client_config(cert_file: &Path) -> Result<ClientConfig, ProxyError> {
        let mut roots = RootCertStore::empty();
        for cert in Self::load_certs(cert_file)? {
            roots.add(cert).map_err(|e| {
                ProxyError::tls_config(format!("Failed to add trust root certificate: {}", e))
            })?;
        }

        let mut client_config = ClientConfig::builder_with_provider(Self::provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::tls_config(format!("Unsupported TLS versions: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        client_config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(client_config)
    }

    fn target_server_name(target: &Address) -> Result<ServerName<'static>, ProxyError> {
        ServerName::try_from(target.dial_host().to_string()).map_err(|e| {
            ProxyError::tls_config(format!(
                "Invalid TLS server name '{}': {}",
                target.dial_host(),
                e
            ))
        })
    }
}

/// Inbound TLS accept with ALPN enforcement
pub async fn accept_tls(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<server::TlsStream<TcpStream>, ProxyError> {
    let peer_addr = stream.peer_addr().ok();

    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            tracing::warn!(
                event = "tls_handshake_failed",
                peer_addr = ?peer_addr,
                error = %e,
                "TLS handshake failed"
            );
            return Err(ProxyError::TlsHandshake {
                message: e.to_string(),
            });
        }
    };

    let (_, session) = tls_stream.get_ref();
    let negotiated = session
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).to_string());

    tracing::debug!(
        event = "tls_connection_established",
        peer_addr = ?peer_addr,
        protocol = ?negotiated,
        cipher_suite = ?session.negotiated_cipher_suite().map(|cs| cs.suite()),
        tls_version = ?session.protocol_version(),
        "TLS connection established"
    );

    if negotiated.as_deref() != Some("h2") {
        return Err(ProxyError::ProtocolError(
            "HTTP/2 (ALPN h2) is required for gRPC".to_string(),
        ));
    }

    Ok(tls_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn self_signed() -> (NamedTempFile, NamedTempFile) {
        let certified = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        (
            write_temp(&certified.cert.pem()),
            write_temp(&certified.key_pair.serialize_pem()),
        )
    }

    #[test]
    fn test_insecure_when_tls_disabled() {
        let provider = CredentialProvider::from_config(&ProxyConfig::default()).unwrap();

        assert!(!provider.inbound().is_tls());
        assert!(!provider.outbound().is_tls());
        assert_eq!(provider.outbound().scheme(), http::uri::Scheme::HTTP);
    }

    #[test]
    fn test_tls_credentials_load() {
        let (cert_file, key_file) = self_signed();
        let config = ProxyConfig {
            enable_tls: true,
            cert_file: cert_file.path().to_path_buf(),
            key_file: key_file.path().to_path_buf(),
            target_addr: "127.0.0.1:9443".to_string(),
            ..ProxyConfig::default()
        };

        let provider = CredentialProvider::from_config(&config).unwrap();

        assert!(provider.inbound().is_tls());
        match provider.outbound() {
            ClientCredentials::Tls { server_name, .. } => {
                assert_eq!(server_name.to_str(), "127.0.0.1");
            }
            other => panic!("expected TLS client credentials, got {:?}", other),
        }
        assert_eq!(provider.outbound().scheme(), http::uri::Scheme::HTTPS);
    }

    #[test]
    fn test_garbage_certificate_is_fatal() {
        let cert_file = write_temp("not a certificate");
        let key_file = write_temp("not a key");
        let config = ProxyConfig {
            enable_tls: true,
            cert_file: cert_file.path().to_path_buf(),
            key_file: key_file.path().to_path_buf(),
            ..ProxyConfig::default()
        };

        let err = CredentialProvider::from_config(&config).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("No certificates found"));
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let (cert_file, _) = self_signed();
        let config = ProxyConfig {
            enable_tls: true,
            cert_file: cert_file.path().to_path_buf(),
            key_file: "/nonexistent/key.pem".into(),
            ..ProxyConfig::default()
        };

        let err = CredentialProvider::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("Failed to open private key file"));
    }
}
