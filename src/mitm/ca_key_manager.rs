//! CA Key Manager - CA key material generation, loading and validation
//!
//! The CA is either generated once at startup or loaded from PEM files, and
//! kept for the lifetime of the proxy. Loaded certificates are validated
//! before use: basicConstraints CA, keyCertSign usage, validity window and a
//! public key that matches the supplied private key.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, RsaKeySize, SignatureAlgorithm,
};
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{MitmError, Result};

/// Key algorithm for generated key pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyAlgorithm {
    Rsa2048,
    Rsa3072,
    Rsa4096,
    #[default]
    Ec256,
    Ec384,
    Ec521,
}

impl KeyAlgorithm {
    pub fn signature_algorithm(&self) -> &'static SignatureAlgorithm {
        match self {
            Self::Rsa2048 | Self::Rsa3072 | Self::Rsa4096 => &rcgen::PKCS_RSA_SHA256,
            Self::Ec256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::Ec384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ec521 => &rcgen::PKCS_ECDSA_P521_SHA512,
        }
    }

    pub fn generate_key_pair(&self) -> std::result::Result<KeyPair, rcgen::Error> {
        let alg = self.signature_algorithm();
        match self {
            Self::Rsa2048 => KeyPair::generate_rsa_for(alg, RsaKeySize::_2048),
            Self::Rsa3072 => KeyPair::generate_rsa_for(alg, RsaKeySize::_3072),
            Self::Rsa4096 => KeyPair::generate_rsa_for(alg, RsaKeySize::_4096),
            Self::Ec256 | Self::Ec384 | Self::Ec521 => KeyPair::generate_for(alg),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa2048 => "rsa-2048",
            Self::Rsa3072 => "rsa-3072",
            Self::Rsa4096 => "rsa-4096",
            Self::Ec256 => "ec-256",
            Self::Ec384 => "ec-384",
            Self::Ec521 => "ec-521",
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = MitmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "rsa-2048" | "rsa2048" => Ok(Self::Rsa2048),
            "rsa-3072" | "rsa3072" => Ok(Self::Rsa3072),
            "rsa-4096" | "rsa4096" => Ok(Self::Rsa4096),
            "ec-256" | "ec256" | "p-256" => Ok(Self::Ec256),
            "ec-384" | "ec384" | "p-384" => Ok(Self::Ec384),
            "ec-521" | "ec521" | "p-521" => Ok(Self::Ec521),
            other => Err(MitmError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CA Key Manager - holds the CA key pair and certificate
pub struct CaKeyManager {
    /// CA private key (never logged)
    key_pair: Arc<KeyPair>,

    /// Issuer handle used by rcgen when signing leaves
    issuer: Arc<Certificate>,

    /// CA certificate as presented in chains
    certificate_der: CertificateDer<'static>,

    certificate_pem: String,
}

impl CaKeyManager {
    /// Generate a fresh self-signed CA
    pub fn generate(algorithm: KeyAlgorithm, common_name: &str) -> Result<Self> {
        let key_pair = algorithm
            .generate_key_pair()
            .map_err(|e| MitmError::ca_generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "Wiretap Test CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| MitmError::ca_generation(e.to_string()))?;

        info!(algorithm = %algorithm, common_name, "Generated CA certificate");

        Ok(Self {
            certificate_der: certificate.der().clone(),
            certificate_pem: certificate.pem(),
            issuer: Arc::new(certificate),
            key_pair: Arc::new(key_pair),
        })
    }

    /// Load CA from PEM strings or fail fast
    pub fn load_from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let certificate_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| MitmError::ca_load("no certificate found in PEM"))?
            .map_err(|e| MitmError::ca_load(format!("PEM parse failed: {}", e)))?;

        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| MitmError::ca_load(format!("key: {}", e)))?;

        Self::validate_ca_certificate(&certificate_der, &key_pair)?;

        // rcgen needs an issuer object; re-signing the parsed params keeps the
        // subject and key, which is all a signature chain depends on
        let issuer = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| MitmError::CaInvalid(e.to_string()))?
            .self_signed(&key_pair)
            .map_err(|e| MitmError::CaInvalid(e.to_string()))?;

        info!("CA key loaded and validated successfully");

        Ok(Self {
            key_pair: Arc::new(key_pair),
            issuer: Arc::new(issuer),
            certificate_der,
            certificate_pem: cert_pem.to_string(),
        })
    }

    pub fn load_from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref())
            .map_err(|e| MitmError::ca_load(format!("{}: {}", cert_path.as_ref().display(), e)))?;
        let key_pem = std::fs::read_to_string(key_path.as_ref())
            .map_err(|e| MitmError::ca_load(format!("{}: {}", key_path.as_ref().display(), e)))?;
        Self::load_from_pem(&cert_pem, &key_pem)
    }

    /// CA certificate as presented to clients
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }

    /// Export CA certificate in PEM format (for trust distribution)
    pub fn export_ca_certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Write the CA certificate to `path` in PEM format
    pub fn export_ca_certificate_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), &self.certificate_pem)?;
        info!(path = ?path.as_ref(), "CA certificate exported");
        Ok(())
    }

    pub(crate) fn issuer(&self) -> &Certificate {
        &self.issuer
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Validate CA certificate properties against its private key
    fn validate_ca_certificate(der: &CertificateDer<'_>, key_pair: &KeyPair) -> Result<()> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(der.as_ref())
            .map_err(|e| MitmError::CaInvalid(format!("X.509 parse failed: {}", e)))?;

        match cert
            .basic_constraints()
            .map_err(|e| MitmError::CaInvalid(format!("Failed to read basicConstraints: {}", e)))?
        {
            Some(bc) if !bc.value.ca => {
                return Err(MitmError::CaInvalid(
                    "Certificate is not a CA (basicConstraints.ca = false)".to_string(),
                ));
            }
            Some(_) => {}
            None => warn!("CA certificate missing basicConstraints extension"),
        }

        if let Some(key_usage) = cert
            .key_usage()
            .map_err(|e| MitmError::CaInvalid(format!("Failed to read keyUsage: {}", e)))?
        {
            if !key_usage.value.key_cert_sign() {
                return Err(MitmError::CaInvalid(
                    "Certificate missing keyCertSign usage".to_string(),
                ));
            }
        }

        let now = chrono::Utc::now().timestamp();
        if now < cert.validity().not_before.timestamp() {
            return Err(MitmError::CaInvalid(format!(
                "Certificate not yet valid (notBefore: {})",
                cert.validity().not_before
            )));
        }
        if now > cert.validity().not_after.timestamp() {
            return Err(MitmError::CaInvalid(format!(
                "Certificate expired (notAfter: {})",
                cert.validity().not_after
            )));
        }

        if cert.public_key().raw != key_pair.public_key_der().as_slice() {
            return Err(MitmError::CaInvalid(
                "CA private key does not match certificate public key".to_string(),
            ));
        }

        Ok(())
    }
}

// Ensure KeyPair doesn't leak in Debug output
impl fmt::Debug for CaKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaKeyManager")
            .field("key_pair", &"<REDACTED>")
            .field("certificate", &"<present>")
            .finish()
    }
}
