//! Outbound HTTP/1.1 client used by the relay to reach upstream targets
//!
//! Each forwarded request gets its own upstream connection (`Connection:
//! close`). Plain-HTTP targets behind an HTTP(S) upstream proxy are sent in
//! absolute form with `Proxy-Authorization`; everything else is tunnelled.

use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::message::codec::{read_response, ParseError};
use crate::message::url::Target;
use crate::message::{HttpRequest, HttpResponse};
use crate::mitm::tls_config::UpstreamTlsConfig;
use crate::upstream::{open_stream, tls_handshake, BoxedStream, UpstreamError, UpstreamProxy};

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Response body too large: {size} bytes (limit: {limit})")]
    ResponseTooLarge { size: usize, limit: usize },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Upstream connection failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<ParseError> for HttpClientError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Timeout => HttpClientError::ReadTimeout,
            ParseError::BodyTooLarge { size, limit } => HttpClientError::ResponseTooLarge { size, limit },
            ParseError::Io(e) => HttpClientError::IoError(e),
            other => HttpClientError::InvalidResponse(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

/// One upstream round trip as it went over the wire
#[derive(Debug, Clone)]
pub struct Exchange {
    pub response: HttpResponse,
    pub raw_request: Bytes,
    pub raw_response: Bytes,
}

#[derive(Clone)]
pub struct HttpClient {
    proxy: Option<Arc<UpstreamProxy>>,
    tls: UpstreamTlsConfig,
    timeouts: ClientTimeouts,
    max_body: usize,
}

impl HttpClient {
    pub fn new(
        proxy: Option<Arc<UpstreamProxy>>,
        tls: UpstreamTlsConfig,
        timeouts: ClientTimeouts,
        max_body: usize,
    ) -> Self {
        Self {
            proxy,
            tls,
            timeouts,
            max_body,
        }
    }

    pub fn proxy(&self) -> Option<&Arc<UpstreamProxy>> {
        self.proxy.as_ref()
    }

    pub fn tls(&self) -> &UpstreamTlsConfig {
        &self.tls
    }

    pub fn timeouts(&self) -> ClientTimeouts {
        self.timeouts
    }

    /// Send `request` (origin-form) to `target` and read the full response
    pub async fn forward(&self, request: &HttpRequest, target: &Target) -> Result<Exchange, HttpClientError> {
        let absolute_via_proxy = self
            .proxy
            .as_ref()
            .filter(|p| p.forwards_plain_http() && !target.is_tls());

        let (mut stream, wire_request) = match absolute_via_proxy {
            Some(proxy) => {
                debug!(proxy = %proxy.address(), target = %target.origin(), "Forwarding through HTTP proxy");
                let stream = proxy.connect_to_proxy(&self.tls, self.timeouts.connect).await?;
                (stream, format_http_request(request, target, Some(proxy.proxy_authorization())))
            }
            None => {
                let stream = self.open(target).await?;
                (stream, format_http_request(request, target, None))
            }
        };

        send_and_receive(&mut stream, &request.method, wire_request, self.timeouts, self.max_body).await
    }

    /// Byte stream to `target`, TLS-wrapped for https
    pub async fn open(&self, target: &Target) -> Result<BoxedStream, HttpClientError> {
        let stream = open_stream(
            &target.host,
            target.port,
            self.proxy.as_ref(),
            &self.tls,
            self.timeouts.connect,
        )
        .await
        .map_err(|e| match e {
            UpstreamError::ConnectTimeout(_) => HttpClientError::ConnectionTimeout,
            other => HttpClientError::Upstream(other),
        })?;

        if target.is_tls() {
            let tls_stream = tls_handshake(stream, &target.host, &self.tls).await?;
            return Ok(Box::new(tls_stream));
        }
        Ok(stream)
    }
}

/// Send request and receive response (generic over TLS and plain TCP)
async fn send_and_receive<S>(
    stream: &mut S,
    method: &str,
    wire_request: Bytes,
    timeouts: ClientTimeouts,
    max_body: usize,
) -> Result<Exchange, HttpClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(timeouts.write, async {
        stream.write_all(&wire_request).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| HttpClientError::WriteTimeout)??;

    let mut buf = BytesMut::new();
    let (response, raw_response) = read_response(stream, &mut buf, Some(method), max_body, timeouts.read).await?;
    if !buf.is_empty() {
        warn!(extra = buf.len(), "Upstream sent bytes past the end of the response");
    }

    Ok(Exchange {
        response,
        raw_request: wire_request,
        raw_response,
    })
}

/// Serialize the outbound request
///
/// `via_proxy` selects absolute form for an HTTP proxy, carrying the proxy
/// credentials when there are any; otherwise origin-form.
fn format_http_request(request: &HttpRequest, target: &Target, via_proxy: Option<Option<String>>) -> Bytes {
    let mut outbound = request.filtered();
    let proxy_auth = match via_proxy {
        Some(auth) => {
            outbound.target = format!("{}{}", target.origin(), target.path);
            auth
        }
        None => {
            outbound.target = target.path.clone();
            None
        }
    };
    outbound.version = crate::message::request::HTTP_11.to_string();
    if !outbound.headers.contains("host") {
        outbound.headers.set("Host", target.host_header());
    }
    outbound.headers.set("Connection", "close");
    if let Some(auth) = proxy_auth {
        outbound.headers.set("Proxy-Authorization", auth);
    }
    outbound.to_bytes()
}
