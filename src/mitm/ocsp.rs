//! OCSP response builder
//!
//! Produces DER `OCSPResponse` structures (RFC 6960) reporting status
//! "good" for certificates issued by the proxy CA. Responses are signed by a
//! dedicated ECDSA P-256 responder whose certificate is issued by the CA and
//! embedded in the response.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_ASN1_SIGNING};
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::time::Duration;
use ::time::OffsetDateTime;
use tracing::debug;
use x509_parser::prelude::*;
use yasna::models::{GeneralizedTime, ObjectIdentifier};
use yasna::Tag;

use super::ca_key_manager::CaKeyManager;
use super::error::{MitmError, Result};

const OID_OCSP_BASIC: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1, 1];
const OID_SHA1: &[u64] = &[1, 3, 14, 3, 2, 26];
const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];

pub struct OcspResponder {
    signer: EcdsaKeyPair,
    signer_cert: CertificateDer<'static>,
    responder_key_hash: Vec<u8>,
    rng: SystemRandom,
    validity: Duration,
}

impl OcspResponder {
    /// Create a responder identity signed by `ca`
    pub fn new(ca: &CaKeyManager) -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|_| MitmError::ocsp("signer key generation failed"))?;
        let signer = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|e| MitmError::ocsp(format!("signer key rejected: {}", e)))?;

        let rcgen_key = KeyPair::try_from(pkcs8.as_ref()).map_err(MitmError::ocsp)?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Wiretap OCSP Signer");
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::OcspSigning];
        params.use_authority_key_identifier_extension = true;
        params.not_before = OffsetDateTime::now_utc() - ::time::Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + ::time::Duration::days(365);
        let signer_cert = params
            .signed_by(&rcgen_key, ca.issuer(), ca.key_pair())
            .map_err(MitmError::ocsp)?;

        let responder_key_hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, signer.public_key().as_ref())
            .as_ref()
            .to_vec();

        Ok(Self {
            signer,
            signer_cert: signer_cert.der().clone(),
            responder_key_hash,
            rng,
            validity: Duration::from_secs(86400),
        })
    }

    pub fn signer_certificate(&self) -> &CertificateDer<'static> {
        &self.signer_cert
    }

    /// Build a signed "good" response for `cert_der`, issued by `issuer_der`
    pub fn build_good_response(&self, cert_der: &[u8], issuer_der: &[u8]) -> Result<Vec<u8>> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| MitmError::CertParseFailed(e.to_string()))?;
        let (_, issuer) = X509Certificate::from_der(issuer_der)
            .map_err(|e| MitmError::CertParseFailed(e.to_string()))?;

        let issuer_name_hash = sha1(cert.issuer().as_raw());
        let issuer_key_bits: &[u8] = &issuer.public_key().subject_public_key.data;
        let issuer_key_hash = sha1(issuer_key_bits);
        let serial = cert.raw_serial().to_vec();

        let now = whole_seconds(OffsetDateTime::now_utc())?;
        let next_update = now + ::time::Duration::seconds(self.validity.as_secs() as i64);

        let tbs = yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next()
                    .write_tagged(Tag::context(2), |w| w.write_bytes(&self.responder_key_hash));
                w.next()
                    .write_generalized_time(&GeneralizedTime::from_datetime(now));
                w.next().write_sequence(|w| {
                    w.next().write_sequence(|w| {
                        w.next().write_sequence(|w| {
                            w.next().write_sequence(|w| {
                                w.next().write_oid(&ObjectIdentifier::from_slice(OID_SHA1));
                                w.next().write_null();
                            });
                            w.next().write_bytes(&issuer_name_hash);
                            w.next().write_bytes(&issuer_key_hash);
                            w.next().write_bigint_bytes(&serial, true);
                        });
                        // good [0] IMPLICIT NULL
                        w.next()
                            .write_tagged_implicit(Tag::context(0), |w| w.write_null());
                        w.next()
                            .write_generalized_time(&GeneralizedTime::from_datetime(now));
                        w.next().write_tagged(Tag::context(0), |w| {
                            w.write_generalized_time(&GeneralizedTime::from_datetime(next_update))
                        });
                    });
                });
            });
        });

        let signature = self
            .signer
            .sign(&self.rng, &tbs)
            .map_err(|_| MitmError::ocsp("signing failed"))?;

        let basic = yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_der(&tbs);
                w.next().write_sequence(|w| {
                    w.next()
                        .write_oid(&ObjectIdentifier::from_slice(OID_ECDSA_WITH_SHA256));
                });
                w.next()
                    .write_bitvec_bytes(signature.as_ref(), signature.as_ref().len() * 8);
                w.next().write_tagged(Tag::context(0), |w| {
                    w.write_sequence(|w| w.next().write_der(self.signer_cert.as_ref()))
                });
            });
        });

        debug!(serial = %hex_serial(&serial), "Built OCSP response");

        Ok(yasna::construct_der(|w| {
            w.write_sequence(|w| {
                // successful
                w.next().write_enum(0);
                w.next().write_tagged(Tag::context(0), |w| {
                    w.write_sequence(|w| {
                        w.next().write_oid(&ObjectIdentifier::from_slice(OID_OCSP_BASIC));
                        w.next().write_bytes(&basic);
                    })
                });
            })
        }))
    }
}

impl fmt::Debug for OcspResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcspResponder")
            .field("signer", &"<REDACTED>")
            .field("validity", &self.validity)
            .finish()
    }
}

fn sha1(data: &[u8]) -> Vec<u8> {
    digest(&SHA1_FOR_LEGACY_USE_ONLY, data).as_ref().to_vec()
}

fn whole_seconds(t: OffsetDateTime) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(t.unix_timestamp()).map_err(MitmError::ocsp)
}

fn hex_serial(serial: &[u8]) -> String {
    serial.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::ca_key_manager::KeyAlgorithm;

    #[test]
    fn test_good_response_structure() {
        let ca = CaKeyManager::generate(KeyAlgorithm::Ec256, "OCSP Test CA").unwrap();
        let responder = OcspResponder::new(&ca).unwrap();

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let leaf = CertificateParams::new(vec!["ocsp.example".to_string()])
            .unwrap()
            .signed_by(&leaf_key, ca.issuer(), ca.key_pair())
            .unwrap();

        let der = responder
            .build_good_response(leaf.der().as_ref(), ca.certificate_der().as_ref())
            .unwrap();

        let (status, oid) = yasna::parse_der(&der, |r| {
            r.read_sequence(|r| {
                let status = r.next().read_enum()?;
                let oid = r.next().read_tagged(Tag::context(0), |r| {
                    r.read_sequence(|r| {
                        let oid = r.next().read_oid()?;
                        let _basic = r.next().read_bytes()?;
                        Ok(oid)
                    })
                })?;
                Ok((status, oid))
            })
        })
        .unwrap();

        assert_eq!(status, 0);
        assert_eq!(oid, ObjectIdentifier::from_slice(OID_OCSP_BASIC));
    }

    #[test]
    fn test_signer_certificate_chains_to_ca() {
        let ca = CaKeyManager::generate(KeyAlgorithm::Ec256, "OCSP Test CA").unwrap();
        let responder = OcspResponder::new(&ca).unwrap();

        let (_, signer) = X509Certificate::from_der(responder.signer_certificate().as_ref()).unwrap();
        let (_, ca_cert) = X509Certificate::from_der(ca.certificate_der().as_ref()).unwrap();
        assert_eq!(signer.issuer(), ca_cert.subject());
    }
}
