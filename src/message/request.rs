//! HTTP/1.1 request and response model

use bytes::{BufMut, Bytes, BytesMut};

use super::headers::Headers;
use super::url::{parse_absolute, Target};

pub const HTTP_11: &str = "HTTP/1.1";

/// Parsed HTTP request with a fully de-framed body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Request target as received (origin-form, absolute-form or authority)
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: HTTP_11.to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Absolute-form target, if the request carries one
    pub fn absolute_target(&self) -> Option<Target> {
        if self.target.starts_with('/') {
            return None;
        }
        parse_absolute(&self.target).ok()
    }

    /// Path and query, whatever form the target was sent in
    pub fn path(&self) -> String {
        match self.absolute_target() {
            Some(target) => target.path,
            None => self.target.clone(),
        }
    }

    /// Host without port, taken from the absolute target or the `Host` header
    pub fn host(&self) -> Option<String> {
        if let Some(target) = self.absolute_target() {
            return Some(target.host);
        }
        let host = self.headers.get("host")?;
        let host = match host.rsplit_once(':') {
            Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
            _ => host,
        };
        Some(host.trim_start_matches('[').trim_end_matches(']').to_string())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(&self.version, &self.headers)
    }

    /// Deep copy with hop-by-hop headers removed
    pub fn filtered(&self) -> Self {
        Self {
            headers: self.headers.without_hop_by_hop(false),
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.body.len());
        buf.put_slice(format!("{} {} {}\r\n", self.method, self.target, self.version).as_bytes());
        let has_length = write_headers(&mut buf, &self.headers);
        if !self.body.is_empty() || has_length {
            buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Parsed HTTP response with a fully de-framed body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            version: HTTP_11.to_string(),
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Synthetic failure answer for forwarding and handshake errors
    pub fn bad_gateway(message: &str) -> Self {
        Self::new(502)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_header("Connection", "close")
            .with_body(message.to_string())
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(&self.version, &self.headers)
    }

    pub fn filtered(&self) -> Self {
        Self {
            headers: self.headers.without_hop_by_hop(true),
            ..self.clone()
        }
    }

    /// Status codes that never carry a body
    pub fn is_bodiless_status(status: u16) -> bool {
        (100..200).contains(&status) || status == 204 || status == 304
    }

    pub fn to_bytes(&self) -> Bytes {
        self.to_bytes_for(None)
    }

    /// Serialize as the answer to a `request_method` request
    ///
    /// A `HEAD` answer keeps the length the origin declared and sends no body.
    pub fn to_bytes_for(&self, request_method: Option<&str>) -> Bytes {
        let is_head = request_method.is_some_and(|m| m.eq_ignore_ascii_case("HEAD"));
        let mut buf = BytesMut::with_capacity(256 + self.body.len());
        buf.put_slice(format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes());
        write_headers(&mut buf, &self.headers);
        if Self::is_bodiless_status(self.status) {
            buf.put_slice(b"\r\n");
            return buf.freeze();
        }
        if is_head {
            if let Some(declared) = self.headers.get("content-length") {
                buf.put_slice(format!("Content-Length: {}\r\n", declared).as_bytes());
            }
            buf.put_slice(b"\r\n");
            return buf.freeze();
        }
        buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Write headers except framing ones; returns whether a length header was present
fn write_headers(buf: &mut BytesMut, headers: &Headers) -> bool {
    let mut had_length = false;
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("content-length") {
            had_length = true;
            continue;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    had_length
}

fn keep_alive(version: &str, headers: &Headers) -> bool {
    if headers.has_token("connection", "close") {
        return false;
    }
    if version.eq_ignore_ascii_case("HTTP/1.0") {
        return headers.has_token("connection", "keep-alive");
    }
    true
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
