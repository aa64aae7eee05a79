//! Certificate Authority - Dynamic leaf certificate generation for MITM
//!
//! Leaf certificates are minted per intercepted hostname, signed by the
//! proxy CA and cached by hostname so repeated connections reuse the same key
//! material. At most one generation per hostname is in flight at a time.

use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyUsagePurpose, SanType};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::ca_key_manager::{CaKeyManager, KeyAlgorithm};
use super::error::{MitmError, Result};
use super::identity_store::IdentityStore;
use super::ocsp::OcspResponder;
use crate::cache::BoundedCache;

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// Wildcard domain (e.g., *.example.com)
    Wildcard(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from hostname string
    pub fn from_hostname(hostname: &str) -> Result<Self> {
        let hostname = hostname
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.');
        if hostname.is_empty() {
            return Err(MitmError::InvalidDomain("empty hostname".to_string()));
        }

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(Self::IpAddress(ip));
        }

        if hostname.contains(char::is_whitespace) || hostname.contains('/') {
            return Err(MitmError::InvalidDomain(hostname.to_string()));
        }

        let hostname = hostname.to_ascii_lowercase();
        if hostname.starts_with("*.") {
            return Ok(Self::Wildcard(hostname));
        }
        Ok(Self::Domain(hostname))
    }

    /// Cache key
    pub fn as_key(&self) -> String {
        match self {
            Self::Domain(d) | Self::Wildcard(d) => d.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }
}

/// Leaf certificate, its key and the CA certificate that signed it
pub struct CertificatePair {
    pub hostname: String,
    pub leaf: CertificateDer<'static>,
    pub ca: CertificateDer<'static>,
    pub serial: u64,
    key: PrivatePkcs8KeyDer<'static>,
    certified_key: Arc<CertifiedKey>,
}

impl CertificatePair {
    /// Chain of length 2: [leaf, CA]
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.leaf.clone(), self.ca.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }

    /// rustls signing key plus chain, with a stapled OCSP response if enabled
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

impl fmt::Debug for CertificatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificatePair")
            .field("hostname", &self.hostname)
            .field("serial", &format_args!("{:016x}", self.serial))
            .field("key", &"<REDACTED>")
            .finish()
    }
}

/// Settings for leaf issuance
#[derive(Debug, Clone)]
pub struct CaSettings {
    pub leaf_algorithm: KeyAlgorithm,
    pub cache_ttl: Duration,
    pub ocsp_stapling: bool,
    /// Hostname used when a client sends no SNI
    pub default_hostname: String,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            leaf_algorithm: KeyAlgorithm::Ec256,
            cache_ttl: Duration::from_secs(86400),
            ocsp_stapling: false,
            default_hostname: "localhost".to_string(),
        }
    }
}

/// Certificate Authority - generates and caches certificates
pub struct CertificateAuthority {
    /// CA key manager
    ca_manager: Arc<CaKeyManager>,

    /// Issued leaves by hostname
    cache: Arc<BoundedCache<String, Arc<CertificatePair>>>,

    /// Per-hostname generation slots
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    ocsp: Option<OcspResponder>,

    /// Fixed identities that replace generated leaves for some hostnames
    identities: Option<Arc<IdentityStore>>,
    identity_overrides: HashMap<String, String>,

    settings: CaSettings,
}

impl CertificateAuthority {
    /// Create a CA front-end and issue the default certificate
    ///
    /// Issuing once up front surfaces key/algorithm mismatches at startup
    /// instead of on the first handshake.
    pub fn new(
        ca_manager: Arc<CaKeyManager>,
        cache: Arc<BoundedCache<String, Arc<CertificatePair>>>,
        settings: CaSettings,
    ) -> Result<Self> {
        let ocsp = if settings.ocsp_stapling {
            Some(OcspResponder::new(&ca_manager)?)
        } else {
            None
        };

        let ca = Self {
            ca_manager,
            cache,
            in_flight: Mutex::new(HashMap::new()),
            ocsp,
            identities: None,
            identity_overrides: HashMap::new(),
            settings,
        };
        ca.certificate_for_host(&ca.settings.default_hostname.clone())?;
        Ok(ca)
    }

    /// Serve `hostname` with a fixed identity from `store` instead of a minted leaf
    pub fn with_identity_override(
        mut self,
        store: Arc<IdentityStore>,
        hostname: &str,
        identity_id: &str,
    ) -> Result<Self> {
        if store.get(identity_id).is_none() {
            return Err(MitmError::UnknownIdentity(identity_id.to_string()));
        }
        self.identity_overrides
            .insert(hostname.to_ascii_lowercase(), identity_id.to_string());
        self.identities = Some(store);
        Ok(self)
    }

    pub fn ca_manager(&self) -> &Arc<CaKeyManager> {
        &self.ca_manager
    }

    /// Get or generate the leaf certificate for `hostname`
    pub fn certificate_for_host(&self, hostname: &str) -> Result<Arc<CertificatePair>> {
        let host = HostIdentifier::from_hostname(hostname)?;
        let key = host.as_key();

        if let Some(cached) = self.cache.get(&key) {
            debug!(host = %key, "Certificate cache hit");
            return Ok(cached);
        }

        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(in_flight.entry(key.clone()).or_default())
        };

        let result = {
            let _generating = slot.lock().unwrap_or_else(PoisonError::into_inner);
            // Another connection may have finished while we waited on the slot
            match self.cache.get(&key) {
                Some(cached) => Ok(cached),
                None => {
                    debug!(host = %key, algorithm = %self.settings.leaf_algorithm, "Generating new certificate");
                    self.generate_certificate(&host).map(|pair| {
                        let pair = Arc::new(pair);
                        self.cache
                            .put(key.clone(), Arc::clone(&pair), self.settings.cache_ttl);
                        pair
                    })
                }
            }
        };

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            // map + our clone: nobody else is waiting on this slot
            if Arc::strong_count(&slot) <= 2 {
                in_flight.remove(&key);
            }
        }

        result
    }

    /// Signing material for a handshake naming `hostname`
    pub fn certified_key_for_host(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(identity_id) = self.identity_overrides.get(&hostname.to_ascii_lowercase()) {
            if let Some(store) = &self.identities {
                return store.certified_key(identity_id);
            }
        }
        Ok(self.certificate_for_host(hostname)?.certified_key())
    }

    fn generate_certificate(&self, host: &HostIdentifier) -> Result<CertificatePair> {
        let hostname = host.as_key();
        let mut params = CertificateParams::default();

        // Set common name and SAN based on host type
        match host {
            HostIdentifier::Domain(domain) | HostIdentifier::Wildcard(domain) => {
                params
                    .distinguished_name
                    .push(DnType::CommonName, domain.clone());
                let san = domain
                    .clone()
                    .try_into()
                    .map_err(|e: rcgen::Error| MitmError::cert_generation(domain, e))?;
                params.subject_alt_names = vec![SanType::DnsName(san)];
            }
            HostIdentifier::IpAddress(ip) => {
                params
                    .distinguished_name
                    .push(DnType::CommonName, ip.to_string());
                params.subject_alt_names = vec![SanType::IpAddress(*ip)];
            }
        }

        // Validity: one day back-dated for clock skew, 90 days forward
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);

        let serial = generate_serial_number();
        params.serial_number = Some(serial.into());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let key_pair = self
            .settings
            .leaf_algorithm
            .generate_key_pair()
            .map_err(|e| MitmError::cert_generation(&hostname, e))?;

        let cert = params
            .signed_by(
                &key_pair,
                self.ca_manager.issuer(),
                self.ca_manager.key_pair(),
            )
            .map_err(|e| MitmError::cert_generation(&hostname, e))?;

        let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let leaf = cert.der().clone();
        let ca = self.ca_manager.certificate_der().clone();

        let signing_key = any_supported_type(&PrivateKeyDer::Pkcs8(key.clone_key()))
            .map_err(|e| MitmError::cert_generation(&hostname, e))?;
        let mut certified_key = CertifiedKey::new(vec![leaf.clone(), ca.clone()], signing_key);

        if let Some(ocsp) = &self.ocsp {
            match ocsp.build_good_response(leaf.as_ref(), ca.as_ref()) {
                Ok(response) => certified_key.ocsp = Some(response),
                Err(e) => warn!(host = %hostname, error = %e, "OCSP response not stapled"),
            }
        }

        Ok(CertificatePair {
            hostname,
            leaf,
            ca,
            serial,
            key,
            certified_key: Arc::new(certified_key),
        })
    }

    /// (entries, hits, misses)
    pub fn cache_stats(&self) -> (usize, u64, u64) {
        (self.cache.len(), self.cache.hits(), self.cache.misses())
    }

    /// Clear cache (for testing or rotation)
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("settings", &self.settings)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Generate unique serial number using crypto RNG + timestamp
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;

    // High bit cleared so the DER INTEGER stays positive without padding
    (((timestamp_part as u64) << 32) | (random_part as u64)) & 0x7fff_ffff_ffff_ffff
}

/// Picks the leaf certificate by SNI during the TLS handshake
#[derive(Debug)]
pub struct SniCertResolver {
    ca: Arc<CertificateAuthority>,
    /// Used when the client sends no SNI (e.g. the CONNECT authority)
    fallback: String,
}

impl SniCertResolver {
    pub fn new(ca: Arc<CertificateAuthority>, fallback: impl Into<String>) -> Self {
        Self {
            ca,
            fallback: fallback.into(),
        }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let requested = client_hello
            .server_name()
            .map(str::to_owned)
            .unwrap_or_else(|| self.fallback.clone());

        match self.ca.certified_key_for_host(&requested) {
            Ok(key) => Some(key),
            Err(e) => {
                error!(hostname = %requested, error = %e, "Failed to mint certificate");
                None
            }
        }
    }
}
