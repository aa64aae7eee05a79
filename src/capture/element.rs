//! Decoded message tree
//!
//! A [`CapturedElement`] covers a byte range of captured traffic. It carries
//! any number of protocol facets and owns the elements decoded from its
//! payload.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use super::DecodeError;
use crate::message::{HttpRequest, HttpResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFacet {
    Request(HttpRequest),
    Response(HttpResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpFacet {
    Command { verb: String, argument: Option<String> },
    /// Multi-line replies keep one entry per line, code stripped
    Response { code: u16, lines: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Facet {
    Command { keyword: String, arguments: Vec<String> },
    Response {
        ok: bool,
        status: String,
        /// Dot-unstuffed lines of a multi-line response
        body: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SicctMessageType {
    Command,
    Response,
    Event,
}

impl SicctMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x6B => Some(Self::Command),
            0x83 => Some(Self::Response),
            0x50 => Some(Self::Event),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Command => 0x6B,
            Self::Response => 0x83,
            Self::Event => 0x50,
        }
    }
}

/// SICCT transport envelope header; the APDU is the element's child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SicctEnvelope {
    pub message_type: SicctMessageType,
    pub address: u16,
    pub sequence: u16,
    pub length: u32,
}

/// CETP frame header; the body is the element's child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CetpFrame {
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonFacet {
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Facet {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: i64,
    pub not_after: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsFacet {
    /// DER certificates presented to the client, leaf first
    CertificateChain(Vec<Bytes>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryReason {
    /// Larger than the parse threshold
    Oversized { limit: usize },
    Malformed { plugin: &'static str, reason: String },
    Unrecognized,
    /// Bytes left over when the capture ended mid-frame
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFacet {
    pub reason: BinaryReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Facet {
    Http(HttpFacet),
    Smtp(SmtpFacet),
    Pop3(Pop3Facet),
    Sicct(SicctEnvelope),
    Cetp(CetpFrame),
    Json(JsonFacet),
    X509Certificate(X509Facet),
    Tls(TlsFacet),
    Binary(BinaryFacet),
}

impl Facet {
    pub fn name(&self) -> &'static str {
        match self {
            Facet::Http(_) => HttpFacet::NAME,
            Facet::Smtp(_) => SmtpFacet::NAME,
            Facet::Pop3(_) => Pop3Facet::NAME,
            Facet::Sicct(_) => SicctEnvelope::NAME,
            Facet::Cetp(_) => CetpFrame::NAME,
            Facet::Json(_) => JsonFacet::NAME,
            Facet::X509Certificate(_) => X509Facet::NAME,
            Facet::Tls(_) => TlsFacet::NAME,
            Facet::Binary(_) => BinaryFacet::NAME,
        }
    }
}

/// Typed lookup of one facet variant
pub trait FacetKind: Sized {
    const NAME: &'static str;

    fn extract(facet: &Facet) -> Option<&Self>;
}

macro_rules! facet_kind {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FacetKind for $ty {
            const NAME: &'static str = $name;

            fn extract(facet: &Facet) -> Option<&Self> {
                match facet {
                    Facet::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Facet {
            fn from(inner: $ty) -> Self {
                Facet::$variant(inner)
            }
        }
    };
}

facet_kind!(HttpFacet, Http, "http");
facet_kind!(SmtpFacet, Smtp, "smtp");
facet_kind!(Pop3Facet, Pop3, "pop3");
facet_kind!(SicctEnvelope, Sicct, "sicct");
facet_kind!(CetpFrame, Cetp, "cetp");
facet_kind!(JsonFacet, Json, "json");
facet_kind!(X509Facet, X509Certificate, "x509");
facet_kind!(TlsFacet, Tls, "tls");
facet_kind!(BinaryFacet, Binary, "binary");

#[derive(Clone, PartialEq)]
pub struct CapturedElement {
    /// Offset of `raw` within the enclosing buffer
    pub offset: usize,
    pub raw: Bytes,
    pub facets: Vec<Facet>,
    pub children: Vec<CapturedElement>,
}

impl CapturedElement {
    pub fn new(offset: usize, raw: Bytes) -> Self {
        Self {
            offset,
            raw,
            facets: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn opaque(offset: usize, raw: Bytes, reason: BinaryReason) -> Self {
        Self::new(offset, raw).with_facet(BinaryFacet { reason })
    }

    pub fn with_facet(mut self, facet: impl Into<Facet>) -> Self {
        self.facets.push(facet.into());
        self
    }

    pub fn add_facet(&mut self, facet: impl Into<Facet>) {
        self.facets.push(facet.into());
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Facet of type `T` on this node
    pub fn facet<T: FacetKind>(&self) -> Result<&T, DecodeError> {
        self.facets
            .iter()
            .find_map(T::extract)
            .ok_or(DecodeError::FacetAbsent(T::NAME))
    }

    pub fn has_facet<T: FacetKind>(&self) -> bool {
        self.facets.iter().any(|f| T::extract(f).is_some())
    }

    /// First facet of type `T` on this node or any descendant, depth-first
    pub fn find<T: FacetKind>(&self) -> Option<&T> {
        if let Some(found) = self.facets.iter().find_map(T::extract) {
            return Some(found);
        }
        self.children.iter().find_map(|c| c.find::<T>())
    }

    pub fn is_opaque(&self) -> bool {
        self.has_facet::<BinaryFacet>()
    }

    /// Total nodes in this subtree
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(CapturedElement::node_count).sum::<usize>()
    }
}

impl fmt::Debug for CapturedElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedElement")
            .field("offset", &self.offset)
            .field("len", &self.raw.len())
            .field("facets", &self.facets.iter().map(Facet::name).collect::<Vec<_>>())
            .field("children", &self.children)
            .finish()
    }
}

/// Who sent a captured message to whom
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub sender: String,
    pub receiver: String,
}

/// A decoded message as retained by the capture store
#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub sequence_number: u64,
    pub uuid: Uuid,
    pub endpoints: Endpoints,
    pub timestamp: DateTime<Utc>,
    pub element: CapturedElement,
}

impl CapturedMessage {
    pub fn size(&self) -> usize {
        self.element.raw.len()
    }

    pub fn http_request(&self) -> Option<&HttpRequest> {
        match self.element.find::<HttpFacet>()? {
            HttpFacet::Request(req) => Some(req),
            HttpFacet::Response(_) => None,
        }
    }

    pub fn http_response(&self) -> Option<&HttpResponse> {
        match self.element.find::<HttpFacet>()? {
            HttpFacet::Response(resp) => Some(resp),
            HttpFacet::Request(_) => None,
        }
    }
}
