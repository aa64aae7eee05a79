//! Phased decode pipeline
//!
//! Framing plugins run first over raw traffic: each one either declines the
//! buffer, asks for more bytes, or claims a prefix and describes it with
//! facets. Claimed payloads (HTTP bodies, CETP bodies, SICCT APDUs) then go
//! through the content plugins, which attach facets to the payload element.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use super::element::{BinaryReason, CapturedElement, Endpoints, Facet, TlsFacet};
use super::plugins;

/// Payload nesting depth the content phase descends into
const MAX_CONTENT_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Framing,
    Content,
}

/// What a plugin knows about the traffic it is looking at
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeContext<'a> {
    pub endpoints: Option<&'a Endpoints>,
    /// Method of the request a response answers, for bodiless HEAD replies
    pub request_method: Option<&'a str>,
    /// Certificates presented on an intercepted TLS leg
    pub tls_chain: Option<&'a [Bytes]>,
}

impl<'a> DecodeContext<'a> {
    pub fn new(endpoints: &'a Endpoints) -> Self {
        Self {
            endpoints: Some(endpoints),
            ..Default::default()
        }
    }

    pub fn with_request_method(mut self, method: &'a str) -> Self {
        self.request_method = Some(method);
        self
    }

    pub fn with_tls_chain(mut self, chain: &'a [Bytes]) -> Self {
        self.tls_chain = Some(chain);
        self
    }

    /// Whether either side of the connection uses one of `ports`
    pub fn involves_port(&self, ports: &[u16]) -> bool {
        let Some(endpoints) = self.endpoints else {
            return false;
        };
        [&endpoints.sender, &endpoints.receiver].iter().any(|addr| {
            addr.rsplit_once(':')
                .and_then(|(_, port)| port.parse::<u16>().ok())
                .is_some_and(|port| ports.contains(&port))
        })
    }
}

/// Bytes a claim hands to the content phase
#[derive(Debug, Clone)]
pub struct Payload {
    /// Offset relative to the start of the claimed prefix
    pub offset: usize,
    pub bytes: Bytes,
}

#[derive(Debug)]
pub enum Claim {
    /// Not this plugin's protocol
    Decline,
    /// This plugin's protocol, but the declared length is not available yet
    NeedMore,
    Claimed {
        len: usize,
        facets: Vec<Facet>,
        payload: Option<Payload>,
    },
    /// Recognized marker, broken framing; `len` bytes become opaque
    Malformed { len: usize, reason: String },
}

impl Claim {
    pub fn claimed(len: usize, facet: impl Into<Facet>) -> Self {
        Claim::Claimed {
            len,
            facets: vec![facet.into()],
            payload: None,
        }
    }

    pub fn with_payload(self, offset: usize, bytes: Bytes) -> Self {
        match self {
            Claim::Claimed { len, facets, .. } if !bytes.is_empty() => Claim::Claimed {
                len,
                facets,
                payload: Some(Payload { offset, bytes }),
            },
            other => other,
        }
    }
}

pub trait DecodePlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn phase(&self) -> Phase;

    fn inspect(&self, buf: &Bytes, ctx: &DecodeContext<'_>) -> Claim;
}

/// Result of one pass over a buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Consumed {
    pub elements: Vec<CapturedElement>,
    /// Unclaimed tail; feed it again with more bytes appended
    pub remainder: Bytes,
}

#[derive(Clone)]
pub struct Pipeline {
    framing: Vec<Arc<dyn DecodePlugin>>,
    content: Vec<Arc<dyn DecodePlugin>>,
    max_parse_size: usize,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("framing", &self.framing.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("content", &self.content.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("max_parse_size", &self.max_parse_size)
            .finish()
    }
}

impl Pipeline {
    /// Pipeline with no plugins
    pub fn new(max_parse_size: usize) -> Self {
        Self {
            framing: Vec::new(),
            content: Vec::new(),
            max_parse_size,
        }
    }

    /// HTTP, SICCT, CETP, SMTP and POP3 framing; X.509 and JSON content
    pub fn with_default_plugins(max_parse_size: usize) -> Self {
        let mut pipeline = Self::new(max_parse_size);
        pipeline.register(Arc::new(plugins::HttpPlugin));
        pipeline.register(Arc::new(plugins::SicctPlugin));
        pipeline.register(Arc::new(plugins::CetpPlugin));
        pipeline.register(Arc::new(plugins::SmtpPlugin));
        pipeline.register(Arc::new(plugins::Pop3Plugin));
        pipeline.register(Arc::new(plugins::X509Plugin));
        pipeline.register(Arc::new(plugins::JsonPlugin));
        pipeline
    }

    /// Append a plugin to its phase; plugins run in registration order
    pub fn register(&mut self, plugin: Arc<dyn DecodePlugin>) {
        match plugin.phase() {
            Phase::Framing => self.framing.push(plugin),
            Phase::Content => self.content.push(plugin),
        }
    }

    pub fn max_parse_size(&self) -> usize {
        self.max_parse_size
    }

    /// Decode as many complete frames as `bytes` holds
    pub fn consume(&self, bytes: Bytes, ctx: &DecodeContext<'_>) -> Consumed {
        if bytes.len() > self.max_parse_size {
            debug!(size = bytes.len(), limit = self.max_parse_size, "Capture above parse threshold kept opaque");
            return Consumed {
                elements: vec![CapturedElement::opaque(
                    0,
                    bytes,
                    BinaryReason::Oversized {
                        limit: self.max_parse_size,
                    },
                )],
                remainder: Bytes::new(),
            };
        }

        let mut elements = Vec::new();
        let mut pos = 0;

        'frames: while pos < bytes.len() {
            let rest = bytes.slice(pos..);

            for plugin in &self.framing {
                match plugin.inspect(&rest, ctx) {
                    Claim::Decline => continue,
                    Claim::NeedMore => {
                        trace!(plugin = plugin.name(), buffered = rest.len(), "Waiting for more bytes");
                        break 'frames;
                    }
                    Claim::Claimed { len, facets, payload } => {
                        if len == 0 || len > rest.len() {
                            elements.push(CapturedElement::opaque(
                                pos,
                                rest.clone(),
                                BinaryReason::Malformed {
                                    plugin: plugin.name(),
                                    reason: format!("claimed {} of {} bytes", len, rest.len()),
                                },
                            ));
                            pos = bytes.len();
                            continue 'frames;
                        }

                        let mut element = CapturedElement::new(pos, rest.slice(..len));
                        element.facets = facets;
                        if let Some(chain) = ctx.tls_chain {
                            element.add_facet(TlsFacet::CertificateChain(chain.to_vec()));
                        }
                        if let Some(payload) = payload {
                            element
                                .children
                                .push(self.decode_payload(payload.offset, payload.bytes, ctx, 0));
                        }
                        elements.push(element);
                        pos += len;
                        continue 'frames;
                    }
                    Claim::Malformed { len, reason } => {
                        let len = len.clamp(1, rest.len());
                        debug!(plugin = plugin.name(), %reason, len, "Malformed frame kept opaque");
                        elements.push(CapturedElement::opaque(
                            pos,
                            rest.slice(..len),
                            BinaryReason::Malformed {
                                plugin: plugin.name(),
                                reason,
                            },
                        ));
                        pos += len;
                        continue 'frames;
                    }
                }
            }

            // No plugin recognized the bytes
            elements.push(CapturedElement::opaque(pos, rest, BinaryReason::Unrecognized));
            pos = bytes.len();
        }

        Consumed {
            elements,
            remainder: bytes.slice(pos..),
        }
    }

    /// Decode one complete message into a single tree
    ///
    /// Several frames become children of a root covering all of `bytes`; an
    /// unfinished tail is kept as a truncated opaque element.
    pub fn decode_message(&self, bytes: Bytes, ctx: &DecodeContext<'_>) -> CapturedElement {
        let total = bytes.clone();
        let Consumed {
            mut elements,
            remainder,
        } = self.consume(bytes, ctx);

        if !remainder.is_empty() {
            let offset = total.len() - remainder.len();
            elements.push(CapturedElement::opaque(offset, remainder, BinaryReason::Truncated));
        }

        match elements.len() {
            1 => elements.remove(0),
            _ => {
                let mut root = CapturedElement::new(0, total);
                root.children = elements;
                root
            }
        }
    }

    fn decode_payload(&self, offset: usize, bytes: Bytes, ctx: &DecodeContext<'_>, depth: usize) -> CapturedElement {
        let mut element = CapturedElement::new(offset, bytes.clone());
        if depth >= MAX_CONTENT_DEPTH {
            return element;
        }

        for plugin in &self.content {
            if let Claim::Claimed { len, facets, payload } = plugin.inspect(&bytes, ctx) {
                if len != bytes.len() {
                    continue;
                }
                element.facets.extend(facets);
                if let Some(payload) = payload {
                    element
                        .children
                        .push(self.decode_payload(payload.offset, payload.bytes, ctx, depth + 1));
                }
                break;
            }
        }
        element
    }
}

/// Incremental decoder for one direction of a byte stream
///
/// Holds back incomplete frames until more bytes arrive. The held-back
/// buffer never grows past the parse threshold.
#[derive(Debug)]
pub struct StreamDecoder {
    pipeline: Arc<Pipeline>,
    pending: bytes::BytesMut,
}

impl StreamDecoder {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            pending: bytes::BytesMut::new(),
        }
    }

    /// Append `chunk` and return every frame completed by it
    pub fn feed(&mut self, chunk: &[u8], ctx: &DecodeContext<'_>) -> Vec<CapturedElement> {
        self.pending.extend_from_slice(chunk);
        let buffered = self.pending.split().freeze();

        if buffered.len() > self.pipeline.max_parse_size() {
            return self.pipeline.consume(buffered, ctx).elements;
        }

        let Consumed { elements, remainder } = self.pipeline.consume(buffered, ctx);
        self.pending.extend_from_slice(&remainder);
        elements
    }

    /// Flush whatever is still buffered as a truncated element
    pub fn finish(&mut self) -> Option<CapturedElement> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split().freeze();
        Some(CapturedElement::opaque(0, rest, BinaryReason::Truncated))
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
