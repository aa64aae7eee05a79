//! Certificate authority flows through the proxy builder
//!
//! - CA loaded from PEM files on disk
//! - Leaf contents: SAN, issuer, validity
//! - Cache expiry, size bound and the global disable switch

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use std::sync::Arc;
use std::time::Duration;
use x509_parser::prelude::*;

use wiretap::{CacheSettings, Config, ManualClock, WiretapProxy};

fn config() -> Config {
    Config {
        port: 0,
        ..Config::default()
    }
}

fn external_ca() -> (String, String, Vec<u8>) {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, "Corporate Test CA");
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem(), cert.der().to_vec())
}

#[test]
fn test_ca_loaded_from_files_signs_leaves() {
    let (cert_pem, key_pem, ca_der) = external_ca();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.pem");
    let key_path = dir.path().join("ca-key.pem");
    std::fs::write(&cert_path, &cert_pem).unwrap();
    std::fs::write(&key_path, &key_pem).unwrap();

    let proxy = WiretapProxy::builder(Config {
        ca_cert_path: Some(cert_path),
        ca_key_path: Some(key_path),
        ..config()
    })
    .build()
    .unwrap();

    assert_eq!(proxy.ca_certificate_pem(), cert_pem);

    let pair = proxy
        .certificate_authority()
        .certificate_for_host("intranet.corp.test")
        .unwrap();
    assert_eq!(pair.ca.as_ref(), ca_der.as_slice());

    let (_, ca) = X509Certificate::from_der(&ca_der).unwrap();
    let (_, leaf) = X509Certificate::from_der(pair.leaf.as_ref()).unwrap();
    assert_eq!(leaf.issuer().to_string(), ca.subject().to_string());
    assert!(leaf.validity().is_valid());
    assert!(!leaf.is_ca());

    let san = leaf.subject_alternative_name().unwrap().unwrap();
    assert!(san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::DNSName("intranet.corp.test"))));
}

#[test]
fn test_missing_ca_key_file_fails_build() {
    let (cert_pem, _, _) = external_ca();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.pem");
    std::fs::write(&cert_path, cert_pem).unwrap();

    let result = WiretapProxy::builder(Config {
        ca_cert_path: Some(cert_path),
        ca_key_path: Some(dir.path().join("absent.pem")),
        ..config()
    })
    .build();
    assert!(result.is_err());
}

#[test]
fn test_cached_leaf_expires_after_ttl() {
    let clock = Arc::new(ManualClock::new(0));
    let proxy = WiretapProxy::builder(Config {
        cert_ttl_seconds: 60,
        ..config()
    })
    .with_clock(clock.clone())
    .build()
    .unwrap();
    let ca = proxy.certificate_authority();

    let first = ca.certificate_for_host("ttl.test").unwrap();
    clock.advance(Duration::from_secs(30));
    // A hit refreshes the expiry
    let second = ca.certificate_for_host("ttl.test").unwrap();
    assert_eq!(first.serial, second.serial);

    clock.advance(Duration::from_secs(45));
    let third = ca.certificate_for_host("ttl.test").unwrap();
    assert_eq!(first.serial, third.serial);

    clock.advance(Duration::from_secs(61));
    let fourth = ca.certificate_for_host("ttl.test").unwrap();
    assert_ne!(first.serial, fourth.serial);
}

#[test]
fn test_cache_size_bounds_leaves() {
    let proxy = WiretapProxy::builder(Config {
        cert_cache_size: 2,
        ..config()
    })
    .build()
    .unwrap();
    let ca = proxy.certificate_authority();

    // The startup leaf for "localhost" already holds one slot
    let a = ca.certificate_for_host("a.test").unwrap();
    ca.certificate_for_host("b.test").unwrap();
    ca.certificate_for_host("c.test").unwrap();

    let (entries, _, _) = ca.cache_stats();
    assert_eq!(entries, 2);
    let a_again = ca.certificate_for_host("a.test").unwrap();
    assert_ne!(a.serial, a_again.serial);
}

#[test]
fn test_disabled_cache_mints_every_time() {
    let settings = CacheSettings::new();
    let proxy = WiretapProxy::builder(config())
        .with_cache_settings(Arc::clone(&settings))
        .build()
        .unwrap();
    let ca = proxy.certificate_authority();

    let cached = ca.certificate_for_host("switch.test").unwrap();
    assert_eq!(cached.serial, ca.certificate_for_host("switch.test").unwrap().serial);

    settings.disable_all();
    let first = ca.certificate_for_host("switch.test").unwrap();
    let second = ca.certificate_for_host("switch.test").unwrap();
    assert_ne!(first.serial, second.serial);
    assert_ne!(first.serial, cached.serial);

    settings.enable_all();
    let after = ca.certificate_for_host("switch.test").unwrap();
    assert_eq!(after.serial, cached.serial);
}

#[test]
fn test_invalid_hostnames_rejected() {
    let proxy = WiretapProxy::builder(config()).build().unwrap();
    let ca = proxy.certificate_authority();
    assert!(ca.certificate_for_host("").is_err());
    assert!(ca.certificate_for_host("bad host").is_err());
    assert!(ca.certificate_for_host("Mixed.Case.Test").is_ok());
    assert!(ca.certificate_for_host("[::1]").is_ok());
}
