//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides the key/certificate factory used for TLS termination:
//! - CA key material (generated or loaded) with validation
//! - Per-hostname leaf certificates, cached and generated at most once per host
//! - OCSP response construction for stapling
//! - PKCS#12 identities loaded from a directory
//! - TLS configurations for both sides of an intercepted connection

pub mod ca_key_manager;
pub mod certificate_authority;
pub mod error;
pub mod identity_store;
pub mod ocsp;
pub mod tls_config;

// Re-export main types
pub use ca_key_manager::{CaKeyManager, KeyAlgorithm};
pub use certificate_authority::{
    CaSettings, CertificateAuthority, CertificatePair, HostIdentifier, SniCertResolver,
};
pub use error::MitmError;
pub use identity_store::{Identity, IdentityStore};
pub use ocsp::OcspResponder;
pub use tls_config::{ClientTlsConfig, SniUtils, TlsConfigError, UpstreamTlsConfig};
