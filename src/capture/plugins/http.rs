use bytes::Bytes;

use super::{could_become_keyword, leading_keyword};
use crate::capture::element::HttpFacet;
use crate::capture::pipeline::{Claim, DecodeContext, DecodePlugin, Phase};
use crate::message::codec::{parse_request, parse_response};

const METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];
const RESPONSE_MARKER: &[u8] = b"HTTP/";

/// HTTP/1.x requests and responses; the de-framed body becomes the payload
#[derive(Debug, Default)]
pub struct HttpPlugin;

impl DecodePlugin for HttpPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn phase(&self) -> Phase {
        Phase::Framing
    }

    fn inspect(&self, buf: &Bytes, ctx: &DecodeContext<'_>) -> Claim {
        if buf.starts_with(RESPONSE_MARKER) {
            return self.response(buf, ctx);
        }
        if buf.len() < RESPONSE_MARKER.len() && RESPONSE_MARKER.starts_with(buf) {
            return Claim::NeedMore;
        }

        let (_, token_len) = leading_keyword(buf);
        if token_len == buf.len() {
            // Still inside the method token
            return if could_become_keyword(buf, METHODS) && buf.iter().all(u8::is_ascii_uppercase) {
                Claim::NeedMore
            } else {
                Claim::Decline
            };
        }
        let method = &buf[..token_len];
        let is_method = METHODS.iter().any(|m| m.as_bytes() == method);
        if !is_method || buf[token_len] != b' ' {
            return Claim::Decline;
        }

        match parse_request(buf) {
            Ok(Some((request, used))) => {
                let body = request.body.clone();
                Claim::claimed(used, HttpFacet::Request(request)).with_payload(head_len(buf), body)
            }
            Ok(None) => Claim::NeedMore,
            Err(e) => Claim::Malformed {
                len: buf.len(),
                reason: e.to_string(),
            },
        }
    }
}

impl HttpPlugin {
    fn response(&self, buf: &Bytes, ctx: &DecodeContext<'_>) -> Claim {
        // End of the captured bytes ends a read-until-close body
        match parse_response(buf, ctx.request_method, true) {
            Ok(Some((response, used))) => {
                let body = response.body.clone();
                Claim::claimed(used, HttpFacet::Response(response)).with_payload(head_len(buf), body)
            }
            Ok(None) => Claim::NeedMore,
            Err(e) => Claim::Malformed {
                len: buf.len(),
                reason: e.to_string(),
            },
        }
    }
}

fn head_len(buf: &[u8]) -> usize {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .unwrap_or(buf.len())
}
