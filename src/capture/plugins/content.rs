//! Content-phase plugins run over claimed payloads

use bytes::Bytes;
use x509_parser::prelude::*;

use crate::capture::element::{JsonFacet, X509Facet};
use crate::capture::pipeline::{Claim, DecodeContext, DecodePlugin, Phase};

const PEM_CERT_MARKER: &[u8] = b"-----BEGIN CERTIFICATE-----";

fn trim_start(buf: &[u8]) -> &[u8] {
    let skip = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
    &buf[skip..]
}

#[derive(Debug, Default)]
pub struct JsonPlugin;

impl DecodePlugin for JsonPlugin {
    fn name(&self) -> &'static str {
        "json"
    }

    fn phase(&self) -> Phase {
        Phase::Content
    }

    fn inspect(&self, buf: &Bytes, _ctx: &DecodeContext<'_>) -> Claim {
        if !matches!(trim_start(buf).first(), Some(b'{') | Some(b'[')) {
            return Claim::Decline;
        }
        match serde_json::from_slice::<serde_json::Value>(buf) {
            Ok(value) => Claim::claimed(buf.len(), JsonFacet { value }),
            Err(_) => Claim::Decline,
        }
    }
}

/// DER or PEM encoded X.509 certificate
#[derive(Debug, Default)]
pub struct X509Plugin;

impl DecodePlugin for X509Plugin {
    fn name(&self) -> &'static str {
        "x509"
    }

    fn phase(&self) -> Phase {
        Phase::Content
    }

    fn inspect(&self, buf: &Bytes, _ctx: &DecodeContext<'_>) -> Claim {
        let facet = if buf.first() == Some(&0x30) {
            describe_der(buf, true)
        } else if trim_start(buf).starts_with(PEM_CERT_MARKER) {
            let mut reader: &[u8] = buf;
            let first = rustls_pemfile::certs(&mut reader).next().and_then(|der| der.ok());
            first.and_then(|der| describe_der(der.as_ref(), false))
        } else {
            None
        };

        match facet {
            Some(facet) => Claim::claimed(buf.len(), facet),
            None => Claim::Decline,
        }
    }
}

fn describe_der(der: &[u8], exact: bool) -> Option<X509Facet> {
    let (rest, cert) = parse_x509_certificate(der).ok()?;
    if exact && !rest.is_empty() {
        return None;
    }
    Some(X509Facet {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}
