//! MITM error types

use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// MITM-specific errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// CA certificate generation failed
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// CA certificate loading failed
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Loaded CA is not usable for signing
    #[error("Invalid CA certificate: {0}")]
    CaInvalid(String),

    /// Key algorithm name not recognised
    #[error("Unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Certificate generation failed
    #[error("Failed to generate certificate for domain {domain}: {reason}")]
    CertGenerationFailed { domain: String, reason: String },

    /// Certificate parsing failed
    #[error("Failed to parse certificate: {0}")]
    CertParseFailed(String),

    /// OCSP response construction failed
    #[error("Failed to build OCSP response: {0}")]
    OcspFailed(String),

    /// PKCS#12 identity could not be opened
    #[error("Failed to load identity {id}: {reason}")]
    IdentityLoadFailed { id: String, reason: String },

    /// Identity id not present in the store
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    /// Create a CA generation error
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    /// Create a CA load error
    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(domain: impl Into<String>, msg: impl ToString) -> Self {
        Self::CertGenerationFailed {
            domain: domain.into(),
            reason: msg.to_string(),
        }
    }

    /// Create an identity load error
    pub fn identity(id: impl Into<String>, msg: impl ToString) -> Self {
        Self::IdentityLoadFailed {
            id: id.into(),
            reason: msg.to_string(),
        }
    }

    pub fn ocsp(msg: impl ToString) -> Self {
        Self::OcspFailed(msg.to_string())
    }
}
