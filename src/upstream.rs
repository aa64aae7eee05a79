//! Upstream proxy chaining
//!
//! Outbound connections either go straight to the target or through a
//! configured HTTP, HTTPS or SOCKS5 proxy. HTTP(S) proxies are asked to open a
//! tunnel with `CONNECT`; SOCKS5 proxies get a CONNECT command after method
//! negotiation (RFC 1928) and optional username/password auth (RFC 1929).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::message::url::parse_absolute;
use crate::mitm::tls_config::{SniUtils, UpstreamTlsConfig};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_USER_PASS: u8 = 0x02;
const SOCKS5_AUTH_UNACCEPTABLE: u8 = 0xFF;
const SOCKS5_USER_PASS_VERSION: u8 = 0x01;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS5_REP_SUCCESS: u8 = 0x00;

/// Largest CONNECT response we accept from an HTTP proxy
const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Invalid upstream proxy URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Upstream proxy refused CONNECT to {target}: {status}")]
    ConnectRefused { target: String, status: u16 },

    #[error("SOCKS5 error: {0}")]
    Socks(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Bidirectional byte stream, plain or TLS
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl ProxyScheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "socks5" | "socks5h" => Some(Self::Socks5),
            _ => None,
        }
    }
}

/// An upstream proxy all outbound connections are chained through
#[derive(Clone)]
pub struct UpstreamProxy {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    username: Option<String>,
    password: Option<SecretString>,
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl UpstreamProxy {
    /// Parse `scheme://[user:pass@]host[:port]`
    ///
    /// Explicit `username`/`password` take precedence over URL userinfo.
    pub fn parse(
        url: &str,
        username: Option<String>,
        password: Option<SecretString>,
    ) -> Result<Self, UpstreamError> {
        let invalid = |reason: &str| UpstreamError::InvalidUrl(url.to_string(), reason.to_string());

        let (scheme_str, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let scheme_str = scheme_str.to_ascii_lowercase();
        let scheme = ProxyScheme::parse(&scheme_str).ok_or_else(|| invalid("unsupported scheme"))?;

        let (userinfo, hostpart) = match rest.rsplit_once('@') {
            Some((userinfo, hostpart)) => (Some(userinfo), hostpart),
            None => (None, rest),
        };
        let (url_user, url_pass) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
                None => (Some(info.to_string()), None),
            },
            None => (None, None),
        };

        let normalized_scheme = if scheme == ProxyScheme::Socks5 { "socks5" } else { scheme_str.as_str() };
        let target = parse_absolute(&format!("{}://{}", normalized_scheme, hostpart))
            .map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            scheme,
            host: target.host,
            port: target.port,
            username: username.or(url_user),
            password: password.or_else(|| url_pass.map(SecretString::new)),
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Credentials, only when both parts are non-blank
    fn credentials(&self) -> Option<(&str, &str)> {
        let user = self.username.as_deref()?;
        let pass = self.password.as_ref()?.expose_secret().as_str();
        if user.trim().is_empty() || pass.trim().is_empty() {
            return None;
        }
        Some((user, pass))
    }

    /// `Proxy-Authorization` value, or `None` without usable credentials
    pub fn proxy_authorization(&self) -> Option<String> {
        self.credentials()
            .map(|(user, pass)| format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass))))
    }

    /// Whether plain-HTTP requests are sent to this proxy in absolute form
    pub fn forwards_plain_http(&self) -> bool {
        matches!(self.scheme, ProxyScheme::Http | ProxyScheme::Https)
    }

    /// Open a connection to the proxy itself (TLS for `https://` proxies)
    pub async fn connect_to_proxy(
        &self,
        tls: &UpstreamTlsConfig,
        connect_timeout: Duration,
    ) -> Result<BoxedStream, UpstreamError> {
        let tcp = connect_tcp(&self.host, self.port, connect_timeout).await?;
        if self.scheme == ProxyScheme::Https {
            let tls_stream = tls_handshake(tcp, &self.host, tls).await?;
            return Ok(Box::new(tls_stream));
        }
        Ok(Box::new(tcp))
    }

    /// Open a tunnel to `host:port` through the proxy
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        tls: &UpstreamTlsConfig,
        connect_timeout: Duration,
    ) -> Result<BoxedStream, UpstreamError> {
        let mut stream = self.connect_to_proxy(tls, connect_timeout).await?;
        debug!(proxy = %self.address(), target = %format!("{}:{}", host, port), scheme = ?self.scheme, "Opening upstream tunnel");

        let handshake = async {
            match self.scheme {
                ProxyScheme::Http | ProxyScheme::Https => {
                    self.http_connect(&mut stream, host, port, connect_timeout).await
                }
                ProxyScheme::Socks5 => self.socks5_connect(&mut stream, host, port).await,
            }
        };
        timeout(connect_timeout, handshake)
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(self.address()))??;

        Ok(stream)
    }

    async fn http_connect(
        &self,
        stream: &mut BoxedStream,
        host: &str,
        port: u16,
        read_timeout: Duration,
    ) -> Result<(), UpstreamError> {
        let authority = authority(host, port);
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(auth) = self.proxy_authorization() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        // Byte at a time so nothing past the response head is consumed
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_CONNECT_RESPONSE {
                return Err(UpstreamError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "CONNECT response head too large",
                )));
            }
            let n = timeout(read_timeout, stream.read(&mut byte))
                .await
                .map_err(|_| UpstreamError::ConnectTimeout(self.address()))??;
            if n == 0 {
                return Err(UpstreamError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            head.push(byte[0]);
        }

        let mut header_slots = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut header_slots);
        response
            .parse(&head)
            .map_err(|e| UpstreamError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string())))?;
        let status = response.code.unwrap_or(0);

        if !(200..300).contains(&status) {
            warn!(proxy = %self.address(), target = %authority, status, "Upstream proxy refused tunnel");
            return Err(UpstreamError::ConnectRefused {
                target: authority,
                status,
            });
        }
        Ok(())
    }

    async fn socks5_connect(&self, stream: &mut BoxedStream, host: &str, port: u16) -> Result<(), UpstreamError> {
        let credentials = self.credentials();

        // Method negotiation
        let greeting: &[u8] = if credentials.is_some() {
            &[SOCKS5_VERSION, 2, SOCKS5_AUTH_NONE, SOCKS5_AUTH_USER_PASS]
        } else {
            &[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE]
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS5_VERSION {
            return Err(UpstreamError::Socks(format!("unexpected version {:#04x}", choice[0])));
        }

        match (choice[1], credentials) {
            (SOCKS5_AUTH_NONE, _) => {}
            (SOCKS5_AUTH_USER_PASS, Some((user, pass))) => {
                stream.write_all(&encode_user_pass(user, pass)?).await?;
                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(UpstreamError::Socks("username/password rejected".into()));
                }
            }
            (SOCKS5_AUTH_UNACCEPTABLE, _) => {
                return Err(UpstreamError::Socks("no acceptable authentication method".into()));
            }
            (method, _) => {
                return Err(UpstreamError::Socks(format!("unsupported method {:#04x}", method)));
            }
        }

        stream.write_all(&encode_connect(host, port)?).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != SOCKS5_REP_SUCCESS {
            return Err(UpstreamError::Socks(format!("CONNECT failed with reply {:#04x}", head[1])));
        }
        // Drain the bound address
        let addr_len = match head[3] {
            SOCKS5_ATYP_IPV4 => 4,
            SOCKS5_ATYP_IPV6 => 16,
            SOCKS5_ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            other => return Err(UpstreamError::Socks(format!("bad address type {:#04x}", other))),
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn encode_user_pass(user: &str, pass: &str) -> Result<Vec<u8>, UpstreamError> {
    let (user, pass) = (user.as_bytes(), pass.as_bytes());
    if user.len() > 255 || pass.len() > 255 {
        return Err(UpstreamError::Socks("credentials longer than 255 bytes".into()));
    }
    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(SOCKS5_USER_PASS_VERSION);
    msg.push(user.len() as u8);
    msg.extend_from_slice(user);
    msg.push(pass.len() as u8);
    msg.extend_from_slice(pass);
    Ok(msg)
}

fn encode_connect(host: &str, port: u16) -> Result<Vec<u8>, UpstreamError> {
    let mut msg = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            msg.push(SOCKS5_ATYP_IPV4);
            msg.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            msg.push(SOCKS5_ATYP_IPV6);
            msg.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(UpstreamError::Socks("hostname longer than 255 bytes".into()));
            }
            msg.push(SOCKS5_ATYP_DOMAIN);
            msg.push(host.len() as u8);
            msg.extend_from_slice(host.as_bytes());
        }
    }
    msg.extend_from_slice(&port.to_be_bytes());
    Ok(msg)
}

/// TCP connect with a deadline
pub async fn connect_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream, UpstreamError> {
    let address = authority(host, port);
    let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| UpstreamError::ConnectTimeout(address))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Client-side TLS handshake using the upstream TLS config
pub async fn tls_handshake<S>(
    stream: S,
    server_name: &str,
    tls: &UpstreamTlsConfig,
) -> Result<tokio_rustls::client::TlsStream<S>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = SniUtils::parse_server_name(server_name).map_err(|e| UpstreamError::Tls(e.to_string()))?;
    TlsConnector::from(tls.client_config())
        .connect(name, stream)
        .await
        .map_err(|e| UpstreamError::Tls(e.to_string()))
}

/// Open a byte stream to `host:port`, directly or through `proxy`
pub async fn open_stream(
    host: &str,
    port: u16,
    proxy: Option<&Arc<UpstreamProxy>>,
    tls: &UpstreamTlsConfig,
    connect_timeout: Duration,
) -> Result<BoxedStream, UpstreamError> {
    match proxy {
        Some(proxy) => proxy.connect(host, port, tls, connect_timeout).await,
        None => Ok(Box::new(connect_tcp(host, port, connect_timeout).await?)),
    }
}
