//! PKCS#12 identity directory
//!
//! Scans a directory for `.p12`/`.pfx` files at startup. Each file's stem
//! becomes the identity id. Passwords are guessed from the configured list
//! followed by a few common defaults and the file stem itself.

use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{MitmError, Result};

const DEFAULT_PASSWORDS: &[&str] = &["00", "123456", "changeit"];

/// Key and certificate chain loaded from one PKCS#12 file
pub struct Identity {
    pub id: String,
    pub source: PathBuf,
    /// Leaf first
    pub chain: Vec<CertificateDer<'static>>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl Identity {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }

    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let signing_key = any_supported_type(&self.private_key())
            .map_err(|e| MitmError::identity(&self.id, e))?;
        Ok(Arc::new(CertifiedKey::new(self.chain.clone(), signing_key)))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("chain_len", &self.chain.len())
            .field("key", &"<REDACTED>")
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct IdentityStore {
    identities: BTreeMap<String, Arc<Identity>>,
}

impl IdentityStore {
    /// Load every PKCS#12 file in `dir`; unreadable files are logged and skipped
    pub fn load_dir(dir: impl AsRef<Path>, passwords: &[SecretString]) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| MitmError::identity(dir.display().to_string(), e))?;

        let mut identities = BTreeMap::new();
        for entry in entries {
            let path = entry?.path();
            let is_pkcs12 = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("p12") || e.eq_ignore_ascii_case("pfx"));
            if !is_pkcs12 {
                continue;
            }

            match Self::load_file(&path, passwords) {
                Ok(identity) => {
                    debug!(id = %identity.id, path = %path.display(), "Loaded identity");
                    identities.insert(identity.id.clone(), Arc::new(identity));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping identity file"),
            }
        }

        info!(dir = %dir.display(), count = identities.len(), "Identity directory scanned");
        Ok(Self { identities })
    }

    /// Open one file, trying each candidate password
    pub fn load_file(path: &Path, passwords: &[SecretString]) -> Result<Identity> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MitmError::identity(path.display().to_string(), "no file stem"))?
            .to_string();

        let bytes = std::fs::read(path)?;
        let pfx = p12::PFX::parse(&bytes).map_err(|e| MitmError::identity(&id, format!("{:?}", e)))?;

        let password = candidate_passwords(passwords, &id)
            .into_iter()
            .find(|candidate| pfx.verify_mac(candidate))
            .ok_or_else(|| MitmError::identity(&id, "no candidate password matched"))?;

        let key = pfx
            .key_bags(&password)
            .map_err(|e| MitmError::identity(&id, format!("{:?}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| MitmError::identity(&id, "no private key in file"))?;

        let chain: Vec<CertificateDer<'static>> = pfx
            .cert_x509_bags(&password)
            .map_err(|e| MitmError::identity(&id, format!("{:?}", e)))?
            .into_iter()
            .map(CertificateDer::from)
            .collect();
        if chain.is_empty() {
            return Err(MitmError::identity(&id, "no certificate in file"));
        }

        Ok(Identity {
            id,
            source: path.to_path_buf(),
            chain,
            key: PrivatePkcs8KeyDer::from(key),
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Identity>> {
        self.identities.get(id).cloned()
    }

    pub fn certified_key(&self, id: &str) -> Result<Arc<CertifiedKey>> {
        self.get(id)
            .ok_or_else(|| MitmError::UnknownIdentity(id.to_string()))?
            .certified_key()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

fn candidate_passwords(configured: &[SecretString], stem: &str) -> Vec<String> {
    let mut candidates: Vec<String> = configured
        .iter()
        .map(|p| p.expose_secret().clone())
        .collect();
    candidates.extend(DEFAULT_PASSWORDS.iter().map(|p| p.to_string()));
    candidates.push(stem.to_string());
    candidates.push(String::new());
    candidates.dedup();
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn write_p12(dir: &Path, name: &str, password: &str) {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = CertificateParams::new(vec![format!("{}.example", name)])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let pfx = p12::PFX::new(
            cert.der().as_ref(),
            &key.serialize_der(),
            None,
            password,
            name,
        )
        .unwrap();
        std::fs::write(dir.join(format!("{}.p12", name)), pfx.to_der()).unwrap();
    }

    #[test]
    fn test_candidate_password_order() {
        let configured = vec![SecretString::new("s3cret".to_string())];
        let candidates = candidate_passwords(&configured, "server");
        assert_eq!(candidates.first().map(String::as_str), Some("s3cret"));
        assert!(candidates.contains(&"changeit".to_string()));
        assert_eq!(candidates[candidates.len() - 2], "server");
        assert_eq!(candidates.last().map(String::as_str), Some(""));
    }

    #[test]
    fn test_load_dir_guesses_passwords() {
        let dir = tempfile::tempdir().unwrap();
        write_p12(dir.path(), "default-pw", "00");
        write_p12(dir.path(), "stem-pw", "stem-pw");
        write_p12(dir.path(), "configured-pw", "hunter2");
        write_p12(dir.path(), "unknown-pw", "never-guessed");
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store =
            IdentityStore::load_dir(dir.path(), &[SecretString::new("hunter2".to_string())]).unwrap();

        let ids: Vec<&str> = store.ids().collect();
        assert_eq!(ids, vec!["configured-pw", "default-pw", "stem-pw"]);
        assert!(store.get("unknown-pw").is_none());

        let identity = store.get("stem-pw").unwrap();
        assert_eq!(identity.chain.len(), 1);
        assert!(store.certified_key("stem-pw").is_ok());
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        assert!(IdentityStore::load_dir("/nonexistent/wiretap/identities", &[]).is_err());
    }

    #[test]
    fn test_unknown_identity() {
        let store = IdentityStore::default();
        assert!(matches!(
            store.certified_key("nope"),
            Err(MitmError::UnknownIdentity(_))
        ));
    }
}
