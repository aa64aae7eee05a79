//! TLS Configuration for the intercepting proxy
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) with certificates picked by SNI
//! - Upstream TLS (proxy → upstream), verifying or trusting upstream certificates
//!
//! Only TLS 1.2 and 1.3 are offered and ALPN is pinned to http/1.1.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ResolvesServerCert;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Client-facing TLS config (proxy acts as server)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build server config that asks `resolver` for a certificate per handshake
    pub fn new(resolver: Arc<dyn ResolvesServerCert>) -> Self {
        let mut config = ServerConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Self {
            config: Arc::new(config),
        }
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client)
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Verify upstream certificates against the webpki roots plus `extra_roots`
    pub fn verifying(extra_roots: &[CertificateDer<'static>]) -> Result<Self, TlsConfigError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
        for root in extra_roots {
            root_store
                .add(root.clone())
                .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
        }

        let mut config = ClientConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        info!(
            roots_count = TLS_SERVER_ROOTS.len() + extra_roots.len(),
            "Upstream TLS config created"
        );

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Accept any upstream certificate
    ///
    /// Systems under test typically present self-signed or test-PKI
    /// certificates, so this is the default for the proxy.
    pub fn trusting_all() -> Self {
        let mut config = ClientConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        warn!("Upstream certificate verification disabled");

        Self {
            config: Arc::new(config),
        }
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// No-op certificate verifier for upstreams under test
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}", e)))
    }

    /// Validate hostname format
    pub fn validate_hostname(hostname: &str) -> bool {
        !hostname.is_empty()
            && !hostname.starts_with('.')
            && !hostname.ends_with('.')
            && hostname.len() <= 253
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni_validate_hostname() {
        assert!(SniUtils::validate_hostname("example.com"));
        assert!(!SniUtils::validate_hostname(""));
        assert!(!SniUtils::validate_hostname(".example.com"));
        assert!(!SniUtils::validate_hostname(&"a".repeat(254)));
    }

    #[test]
    fn test_sni_parse_server_name() {
        assert!(SniUtils::parse_server_name("example.com").is_ok());
        assert!(SniUtils::parse_server_name("10.0.0.1").is_ok());
        assert!(SniUtils::parse_server_name("bad host").is_err());
    }

    #[test]
    fn test_upstream_configs_pin_http11() {
        let trusting = UpstreamTlsConfig::trusting_all();
        assert_eq!(trusting.client_config().alpn_protocols, vec![b"http/1.1".to_vec()]);

        let verifying = UpstreamTlsConfig::verifying(&[]).unwrap();
        assert_eq!(verifying.client_config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
