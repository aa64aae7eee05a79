//! HTTP/1.1 wire codec
//!
//! Parsing is incremental: every parser returns `Ok(None)` until the buffer
//! holds a complete message (headers plus a body framed by Content-Length,
//! chunked encoding, or connection close), then the message and the number of
//! bytes it occupied.

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use super::headers::Headers;
use super::request::{HttpRequest, HttpResponse};

const MAX_HEADERS: usize = 128;
pub const MAX_HEADER_SIZE: usize = 64 * 1024;
const READ_BUFFER_SIZE: usize = 8192;

/// HTTP parsing errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid HTTP format: {0}")]
    InvalidFormat(String),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("Invalid chunked encoding: {0}")]
    InvalidChunk(String),

    #[error("Headers too large (> {MAX_HEADER_SIZE} bytes)")]
    HeadersTooLarge,

    #[error("Message body too large: {size} bytes (limit: {limit})")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("Connection closed mid-message after {0} bytes")]
    UnexpectedEof(usize),

    #[error("Read timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        ParseError::InvalidFormat(e.to_string())
    }
}

enum BodyFraming {
    None,
    Length(usize),
    Chunked,
    UntilClose,
}

/// Parse one request from the front of `buf`
pub fn parse_request(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>, ParseError> {
    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_slots);
    let head_len = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(ParseError::HeadersTooLarge);
            }
            return Ok(None);
        }
    };

    let method = req
        .method
        .ok_or_else(|| ParseError::InvalidFormat("missing method".into()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| ParseError::InvalidFormat("missing request target".into()))?
        .to_string();
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
    let headers = convert_headers(req.headers);

    // Requests without explicit framing have no body
    let framing = match body_framing(&headers)? {
        BodyFraming::UntilClose => BodyFraming::None,
        other => other,
    };
    let framing = if method.eq_ignore_ascii_case("CONNECT") {
        BodyFraming::None
    } else {
        framing
    };

    let Some((body, body_len)) = read_body(&buf[head_len..], framing, false)? else {
        return Ok(None);
    };

    Ok(Some((
        HttpRequest {
            method,
            target,
            version,
            headers,
            body,
        },
        head_len + body_len,
    )))
}

/// Parse one response from the front of `buf`
///
/// `request_method` lets `HEAD` responses skip their body. `eof` signals
/// that the peer closed, completing a read-until-close body.
pub fn parse_response(
    buf: &[u8],
    request_method: Option<&str>,
    eof: bool,
) -> Result<Option<(HttpResponse, usize)>, ParseError> {
    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_slots);
    let head_len = match resp.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(ParseError::HeadersTooLarge);
            }
            return Ok(None);
        }
    };

    let status = resp
        .code
        .ok_or_else(|| ParseError::InvalidFormat("missing status code".into()))?;
    let reason = resp.reason.unwrap_or("").to_string();
    let version = format!("HTTP/1.{}", resp.version.unwrap_or(1));
    let headers = convert_headers(resp.headers);

    let is_head = request_method.is_some_and(|m| m.eq_ignore_ascii_case("HEAD"));
    // A successful CONNECT turns the connection into a tunnel
    let is_tunnel = request_method.is_some_and(|m| m.eq_ignore_ascii_case("CONNECT"))
        && (200..300).contains(&status);
    let framing = if is_head || is_tunnel || HttpResponse::is_bodiless_status(status) {
        BodyFraming::None
    } else {
        body_framing(&headers)?
    };

    let Some((body, body_len)) = read_body(&buf[head_len..], framing, eof)? else {
        return Ok(None);
    };

    Ok(Some((
        HttpResponse {
            version,
            status,
            reason,
            headers,
            body,
        },
        head_len + body_len,
    )))
}

fn convert_headers(raw: &[httparse::Header<'_>]) -> Headers {
    raw.iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

fn body_framing(headers: &Headers) -> Result<BodyFraming, ParseError> {
    if headers.has_token("transfer-encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match headers.get("content-length") {
        Some(value) => {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
            Ok(if len == 0 {
                BodyFraming::None
            } else {
                BodyFraming::Length(len)
            })
        }
        None => Ok(BodyFraming::UntilClose),
    }
}

fn read_body(
    buf: &[u8],
    framing: BodyFraming,
    eof: bool,
) -> Result<Option<(Bytes, usize)>, ParseError> {
    match framing {
        BodyFraming::None => Ok(Some((Bytes::new(), 0))),
        BodyFraming::Length(len) => {
            if buf.len() < len {
                return Ok(None);
            }
            Ok(Some((Bytes::copy_from_slice(&buf[..len]), len)))
        }
        BodyFraming::Chunked => decode_chunked(buf),
        BodyFraming::UntilClose => {
            if !eof {
                return Ok(None);
            }
            Ok(Some((Bytes::copy_from_slice(buf), buf.len())))
        }
    }
}

/// Decode a chunked body (RFC 7230 4.1), skipping trailers
pub fn decode_chunked(buf: &[u8]) -> Result<Option<(Bytes, usize)>, ParseError> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let (size_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(v)) => v,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(ParseError::InvalidChunk("bad chunk size line".into())),
        };
        pos += size_len;

        if size == 0 {
            // Trailer section ends with an empty line
            loop {
                let rest = &buf[pos..];
                let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
                    return Ok(None);
                };
                pos += line_end + 2;
                if line_end == 0 {
                    return Ok(Some((body.freeze(), pos)));
                }
            }
        }

        let size = usize::try_from(size)
            .map_err(|_| ParseError::InvalidChunk("chunk size overflow".into()))?;
        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size;
        if &buf[pos..pos + 2] != b"\r\n" {
            return Err(ParseError::InvalidChunk("missing CRLF after chunk data".into()));
        }
        pos += 2;
    }
}

/// Read one request from `stream`, buffering leftovers in `buf`
///
/// Returns `Ok(None)` on a clean close before any byte of a new request. The
/// second tuple element holds the raw bytes the request occupied.
pub async fn read_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_body: usize,
    read_timeout: Duration,
) -> Result<Option<(HttpRequest, Bytes)>, ParseError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((request, used)) = parse_request(buf)? {
            let raw = buf.split_to(used).freeze();
            return Ok(Some((request, raw)));
        }
        check_body_limit(buf.len(), max_body)?;

        if fill(stream, buf, read_timeout).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ParseError::UnexpectedEof(buf.len()));
        }
    }
}

/// Read one response from `stream`, buffering leftovers in `buf`
pub async fn read_response<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    request_method: Option<&str>,
    max_body: usize,
    read_timeout: Duration,
) -> Result<(HttpResponse, Bytes), ParseError>
where
    S: AsyncRead + Unpin,
{
    let mut eof = false;
    loop {
        if let Some((response, used)) = parse_response(buf, request_method, eof)? {
            let raw = buf.split_to(used).freeze();
            return Ok((response, raw));
        }
        if eof {
            return Err(ParseError::UnexpectedEof(buf.len()));
        }
        check_body_limit(buf.len(), max_body)?;

        if fill(stream, buf, read_timeout).await? == 0 {
            eof = true;
        }
    }
}

fn check_body_limit(buffered: usize, max_body: usize) -> Result<(), ParseError> {
    let limit = max_body.saturating_add(MAX_HEADER_SIZE);
    if buffered > limit {
        return Err(ParseError::BodyTooLarge {
            size: buffered,
            limit: max_body,
        });
    }
    Ok(())
}

async fn fill<S>(stream: &mut S, buf: &mut BytesMut, read_timeout: Duration) -> Result<usize, ParseError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_BUFFER_SIZE];
    let n = timeout(read_timeout, stream.read(&mut chunk))
        .await
        .map_err(|_| ParseError::Timeout)??;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}
