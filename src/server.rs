//! Connection relay
//!
//! One task per client connection. Plain requests are routed and answered on
//! the same connection while keep-alive holds. `CONNECT` either opens an
//! opaque tunnel to the target or, with interception on, terminates TLS with
//! a minted leaf certificate and keeps serving HTTP inside the tunnel.

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureStore, CapturedElement, DecodeContext, Endpoints, Pipeline, StreamDecoder};
use crate::http_client::HttpClient;
use crate::message::codec::{read_request, ParseError};
use crate::message::url::{parse_authority, Target};
use crate::message::{HttpRequest, HttpResponse};
use crate::mitm::CertificateAuthority;
use crate::notify::NotificationScheduler;
use crate::routing::{Decision, Router};
use crate::upstream::open_stream;

const TUNNEL_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    /// Time allowed between requests on a persistent connection
    pub idle: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(120),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

/// TLS termination for intercepted tunnels
#[derive(Clone)]
pub struct Interception {
    pub ca: Arc<CertificateAuthority>,
    pub acceptor: TlsAcceptor,
}

/// Everything a connection task needs, shared by all of them
pub struct RelayContext {
    pub router: Arc<Router>,
    pub client: HttpClient,
    pub interception: Option<Interception>,
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<CaptureStore>,
    pub scheduler: Arc<NotificationScheduler>,
    pub timeouts: RelayTimeouts,
    pub max_body: usize,
}

impl RelayContext {
    /// Decode `raw`, retain it and fan it out to listeners
    fn record(&self, raw: Bytes, endpoints: &Endpoints, request_method: Option<&str>, tls_chain: Option<&[Bytes]>) {
        let mut ctx = DecodeContext::new(endpoints);
        if let Some(method) = request_method {
            ctx = ctx.with_request_method(method);
        }
        if let Some(chain) = tls_chain {
            ctx = ctx.with_tls_chain(chain);
        }
        let element = self.pipeline.decode_message(raw, &ctx);
        self.publish(element, endpoints.clone());
    }

    fn publish(&self, element: CapturedElement, endpoints: Endpoints) {
        let message = self.store.push(element, endpoints);
        debug!(seq = message.sequence_number, size = message.size(), "Captured message");
        self.scheduler.notify(message);
    }
}

/// Per-connection facts that stay fixed across requests
struct Session {
    peer: SocketAddr,
    /// Destination of an intercepted tunnel
    origin: Option<Target>,
    tls_chain: Option<Vec<Bytes>>,
}

/// Accept connections until `shutdown` fires
pub async fn serve(listener: TcpListener, ctx: Arc<RelayContext>, mut shutdown: broadcast::Receiver<()>) {
    let local = listener.local_addr().ok();
    info!(addr = ?local, "Relay accepting connections");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        let ctx = Arc::clone(&ctx);
                        let mut conn_shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            tokio::select! {
                                result = handle_connection(stream, peer, ctx) => {
                                    if let Err(e) = result {
                                        debug!(%peer, error = %e, "Connection ended with error");
                                    }
                                }
                                _ = conn_shutdown.recv() => {
                                    debug!(%peer, "Connection dropped on shutdown");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Relay shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: Arc<RelayContext>) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let session = Session {
        peer,
        origin: None,
        tls_chain: None,
    };
    let mut buf = BytesMut::new();

    let connect = serve_requests(&mut stream, &mut buf, &session, &ctx).await;
    match connect {
        Ok(Some((request, raw))) => handle_connect(stream, buf, request, raw, peer, ctx).await,
        Ok(None) => {
            close_gracefully(&mut stream, peer).await;
            Ok(())
        }
        Err(e) => {
            close_gracefully(&mut stream, peer).await;
            Err(e)
        }
    }
}

/// Serve HTTP requests until the connection ends
///
/// Returns a `CONNECT` request when one arrives on a connection that can be
/// upgraded, leaving any bytes after it in `buf`.
async fn serve_requests<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    session: &Session,
    ctx: &RelayContext,
) -> Result<Option<(HttpRequest, Bytes)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = match timeout(
            ctx.timeouts.idle,
            read_request(stream, buf, ctx.max_body, ctx.timeouts.read),
        )
        .await
        {
            Ok(next) => next,
            Err(_) => {
                debug!(peer = %session.peer, "Idle timeout");
                return Ok(None);
            }
        };

        let (request, raw) = match next {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(None),
            Err(ParseError::Timeout) | Err(ParseError::UnexpectedEof(_)) | Err(ParseError::Io(_)) => {
                return Ok(None);
            }
            Err(e) => {
                warn!(peer = %session.peer, error = %e, "Malformed request");
                let status = match e {
                    ParseError::BodyTooLarge { .. } => 413,
                    ParseError::HeadersTooLarge => 431,
                    _ => 400,
                };
                let response = HttpResponse::new(status)
                    .with_header("Connection", "close")
                    .with_body(e.to_string());
                write_response(stream, &response, ctx.timeouts.write).await?;
                return Ok(None);
            }
        };

        if request.is_connect() {
            if session.origin.is_none() {
                return Ok(Some((request, raw)));
            }
            warn!(peer = %session.peer, "CONNECT inside an intercepted tunnel");
            let response = HttpResponse::new(405).with_header("Connection", "close");
            write_response(stream, &response, ctx.timeouts.write).await?;
            return Ok(None);
        }

        if !handle_request(stream, request, raw, session, ctx).await? {
            return Ok(None);
        }
    }
}

/// Route and answer one request; returns whether the connection stays open
async fn handle_request<S>(
    stream: &mut S,
    request: HttpRequest,
    raw: Bytes,
    session: &Session,
    ctx: &RelayContext,
) -> Result<bool>
where
    S: AsyncWrite + Unpin,
{
    let origin = match &session.origin {
        Some(origin) => Some(Target {
            path: request.path(),
            ..origin.clone()
        }),
        None => request.absolute_target(),
    };

    let client = Endpoints {
        sender: session.peer.to_string(),
        receiver: receiver_label(&request, origin.as_ref()),
    };
    let tls_chain = session.tls_chain.as_deref();
    ctx.record(raw, &client, None, tls_chain);

    let mut response = match ctx.router.decide(&request, origin.as_ref()) {
        Decision::Respond(response) => response,
        Decision::Forward { target, request: outbound } => {
            debug!(method = %outbound.method, target = %target.origin(), path = %target.path, "Forwarding");
            match ctx.client.forward(&outbound, &target).await {
                Ok(exchange) => exchange.response.filtered(),
                Err(e) => {
                    warn!(target = %target.origin(), error = %e, "Forwarding failed");
                    HttpResponse::bad_gateway(&format!("Failed to reach {}: {}", target.origin(), e))
                }
            }
        }
        Decision::NoRoute => {
            debug!(path = %request.target, "No route");
            HttpResponse::new(404)
                .with_header("Content-Type", "text/plain; charset=utf-8")
                .with_body(format!("No route for {}", request.target))
        }
    };
    ctx.router.cors().add_headers(&request, &mut response);

    let keep_alive = request.keep_alive() && response.keep_alive();
    if !keep_alive {
        response.headers.set("Connection", "close");
    }

    let wire = response.to_bytes_for(Some(&request.method));
    write_bytes(stream, &wire, ctx.timeouts.write).await?;

    let server = Endpoints {
        sender: client.receiver,
        receiver: client.sender,
    };
    ctx.record(wire, &server, Some(&request.method), tls_chain);
    Ok(keep_alive)
}

async fn handle_connect(
    mut stream: TcpStream,
    leftover: BytesMut,
    request: HttpRequest,
    raw: Bytes,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
) -> Result<()> {
    let (host, port) = match parse_authority(&request.target) {
        Ok(authority) => authority,
        Err(e) => {
            warn!(%peer, target = %request.target, error = %e, "Invalid CONNECT authority");
            let response = HttpResponse::new(400)
                .with_header("Connection", "close")
                .with_body(format!("Bad Request: {}", e));
            write_response(&mut stream, &response, ctx.timeouts.write).await?;
            close_gracefully(&mut stream, peer).await;
            return Ok(());
        }
    };
    info!(%peer, target_host = %host, port, "CONNECT");

    let endpoints = Endpoints {
        sender: peer.to_string(),
        receiver: format!("{}:{}", host, port),
    };
    ctx.record(raw, &endpoints, None, None);

    match ctx.interception.clone() {
        Some(interception) => intercept(stream, leftover, host, port, peer, interception, ctx).await,
        None => tunnel(stream, leftover, host, port, peer, endpoints, ctx).await,
    }
}

/// Terminate TLS inside the tunnel and serve the decrypted HTTP
async fn intercept(
    mut stream: TcpStream,
    leftover: BytesMut,
    host: String,
    port: u16,
    peer: SocketAddr,
    interception: Interception,
    ctx: Arc<RelayContext>,
) -> Result<()> {
    // Mint (or fetch) the leaf off the I/O threads before the handshake asks for it
    let ca = Arc::clone(&interception.ca);
    let warm_host = host.clone();
    let warmed = tokio::task::spawn_blocking(move || ca.certified_key_for_host(&warm_host))
        .await
        .context("certificate task failed")?;
    if let Err(e) = warmed {
        error!(%peer, target_host = %host, error = %e, "Cannot issue certificate");
        let response = HttpResponse::bad_gateway(&format!("Cannot issue certificate for {}: {}", host, e));
        write_response(&mut stream, &response, ctx.timeouts.write).await?;
        close_gracefully(&mut stream, peer).await;
        return Ok(());
    }

    write_bytes(&mut stream, CONNECTION_ESTABLISHED, ctx.timeouts.write).await?;
    if !leftover.is_empty() {
        debug!(%peer, bytes = leftover.len(), "Replaying bytes sent before the CONNECT reply");
    }
    let stream = PrefixedStream::new(leftover.freeze(), stream);

    let mut tls = match timeout(ctx.timeouts.read, interception.acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            warn!(%peer, target_host = %host, error = %e, "TLS handshake with client failed");
            return Ok(());
        }
        Err(_) => {
            warn!(%peer, target_host = %host, "TLS handshake with client timed out");
            return Ok(());
        }
    };

    let sni = tls.get_ref().1.server_name().map(str::to_owned).unwrap_or_else(|| host.clone());
    let tls_chain = match interception.ca.certified_key_for_host(&sni) {
        Ok(key) => Some(key.cert.iter().map(|der| Bytes::copy_from_slice(der.as_ref())).collect()),
        Err(_) => None,
    };
    debug!(%peer, sni = %sni, "TLS terminated");

    let session = Session {
        peer,
        origin: Some(Target {
            scheme: "https".to_string(),
            host: sni,
            port,
            path: "/".to_string(),
        }),
        tls_chain,
    };
    let mut buf = BytesMut::new();
    let result = serve_requests(&mut tls, &mut buf, &session, &ctx).await;
    close_gracefully(&mut tls, peer).await;
    result.map(|_| ())
}

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// A stream that yields `prefix` before reading from `inner`
///
/// Clients may pipeline the start of the TLS handshake behind `CONNECT`; those
/// bytes are already buffered and must reach the acceptor first.
struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Relay opaque bytes to the target, decoding each direction as it flows
async fn tunnel(
    mut stream: TcpStream,
    leftover: BytesMut,
    host: String,
    port: u16,
    peer: SocketAddr,
    endpoints: Endpoints,
    ctx: Arc<RelayContext>,
) -> Result<()> {
    let client = &ctx.client;
    let upstream = match open_stream(&host, port, client.proxy(), client.tls(), client.timeouts().connect).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(target_host = %host, port, error = %e, "Failed to connect to tunnel target");
            let response = HttpResponse::bad_gateway(&format!("Failed to connect to {}:{}: {}", host, port, e));
            write_response(&mut stream, &response, ctx.timeouts.write).await?;
            close_gracefully(&mut stream, peer).await;
            return Ok(());
        }
    };
    write_bytes(&mut stream, CONNECTION_ESTABLISHED, ctx.timeouts.write).await?;

    let reverse = Endpoints {
        sender: endpoints.receiver.clone(),
        receiver: endpoints.sender.clone(),
    };
    let (client_read, client_write) = tokio::io::split(stream);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let (sent, received) = tokio::join!(
        pump(client_read, upstream_write, leftover.freeze(), &endpoints, &ctx),
        pump(upstream_read, client_write, Bytes::new(), &reverse, &ctx),
    );
    info!(
        target_host = %host,
        port,
        client_to_upstream = sent,
        upstream_to_client = received,
        "Tunnel closed"
    );
    Ok(())
}

/// Copy one direction until EOF, then half-close the writer
async fn pump<R, W>(mut reader: R, mut writer: W, initial: Bytes, endpoints: &Endpoints, ctx: &RelayContext) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = StreamDecoder::new(Arc::clone(&ctx.pipeline));
    let decode_ctx = DecodeContext::new(endpoints);
    let mut total = 0u64;
    let mut chunk = vec![0u8; TUNNEL_BUFFER_SIZE];

    if !initial.is_empty() {
        if let Err(e) = writer.write_all(&initial).await {
            debug!(error = %e, "Tunnel write failed");
            return total;
        }
        total += initial.len() as u64;
        for element in decoder.feed(&initial, &decode_ctx) {
            ctx.publish(element, endpoints.clone());
        }
    }

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(from = %endpoints.sender, error = %e, "Tunnel read ended");
                break;
            }
        };
        if let Err(e) = writer.write_all(&chunk[..n]).await {
            debug!(to = %endpoints.receiver, error = %e, "Tunnel write failed");
            break;
        }
        total += n as u64;
        for element in decoder.feed(&chunk[..n], &decode_ctx) {
            ctx.publish(element, endpoints.clone());
        }
    }

    if let Some(rest) = decoder.finish() {
        ctx.publish(rest, endpoints.clone());
    }
    if let Err(e) = writer.shutdown().await {
        debug!(to = %endpoints.receiver, error = %e, "Half-close raced with peer close");
    }
    total
}

fn receiver_label(request: &HttpRequest, origin: Option<&Target>) -> String {
    match origin {
        Some(target) => format!("{}:{}", target.host, target.port),
        None => request
            .headers
            .get("host")
            .map(str::to_owned)
            .unwrap_or_else(|| "wiretap".to_string()),
    }
}

async fn write_response<S>(stream: &mut S, response: &HttpResponse, write_timeout: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_bytes(stream, &response.to_bytes(), write_timeout).await
}

async fn write_bytes<S>(stream: &mut S, bytes: &[u8], write_timeout: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout(write_timeout, async {
        stream.write_all(bytes).await?;
        stream.flush().await
    })
    .await
    .context("write timed out")?
    .context("write failed")
}

/// Shut down the write side; a peer that already left is only logged
async fn close_gracefully<S>(stream: &mut S, peer: SocketAddr)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.shutdown().await {
        debug!(%peer, error = %e, "Close raced with peer disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::HttpFacet;
    use crate::message::CorsPolicy;
    use crate::mitm::UpstreamTlsConfig;
    use crate::routing::{Cause, ChangeFeed, Expectation, ExpectationStore, RequestMatcher, Route, RouteTable};
    use crate::http_client::ClientTimeouts;

    fn context(routes: &[(&str, &str)]) -> Arc<RelayContext> {
        let feed = ChangeFeed::default();
        let expectations = Arc::new(ExpectationStore::new(feed.clone()));
        let table = Arc::new(RouteTable::new(feed));
        for (from, to) in routes {
            table.add(Route::new(from, to).unwrap(), Cause::Api);
        }
        expectations.add(
            Expectation::respond(
                RequestMatcher::any().path("^/mock$").unwrap(),
                HttpResponse::new(200).with_body("mocked"),
            ),
            Cause::Api,
        );
        Arc::new(RelayContext {
            router: Arc::new(Router::new(expectations, table, CorsPolicy::with_credentials(true))),
            client: HttpClient::new(None, UpstreamTlsConfig::trusting_all(), ClientTimeouts::default(), 1 << 20),
            interception: None,
            pipeline: Arc::new(Pipeline::with_default_plugins(1 << 20)),
            store: Arc::new(CaptureStore::new(1 << 20)),
            scheduler: NotificationScheduler::start(1),
            timeouts: RelayTimeouts::default(),
            max_body: 1 << 20,
        })
    }

    async fn start(ctx: Arc<RelayContext>) -> (SocketAddr, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(serve(listener, ctx, rx));
        (addr, tx)
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).to_string()
    }

    async fn upstream_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    if let Ok(Some((request, _))) =
                        read_request(&mut socket, &mut buf, 1 << 20, Duration::from_secs(5)).await
                    {
                        let body = format!("upstream saw {}", request.target);
                        let reply = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(reply.as_bytes()).await;
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_expectation_answered_and_captured() {
        let ctx = context(&[]);
        let (addr, _shutdown) = start(Arc::clone(&ctx)).await;

        let reply = exchange(addr, b"GET /mock HTTP/1.1\r\nHost: svc\r\nConnection: close\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.ends_with("mocked"));

        let messages = ctx.store.messages();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].element.facet::<HttpFacet>(), Ok(HttpFacet::Request(_))));
        assert_eq!(messages[1].http_response().map(|r| r.status), Some(200));
        assert_eq!(messages[0].endpoints.receiver, "svc");
    }

    #[tokio::test]
    async fn test_origin_form_without_route_is_404() {
        let ctx = context(&[]);
        let (addr, _shutdown) = start(ctx).await;
        let reply = exchange(addr, b"GET /nothing HTTP/1.1\r\nHost: svc\r\nConnection: close\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_route_forwards_with_patched_path() {
        let upstream = upstream_echo().await;
        let to = format!("http://127.0.0.1:{}/deep", upstream.port());
        let ctx = context(&[("/api", to.as_str())]);
        let (addr, _shutdown) = start(ctx).await;

        let reply = exchange(addr, b"GET /api/users HTTP/1.1\r\nHost: svc\r\nConnection: close\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.ends_with("upstream saw /deep/users"), "{}", reply);
    }

    #[tokio::test]
    async fn test_absolute_form_forwarded_to_origin() {
        let upstream = upstream_echo().await;
        let ctx = context(&[]);
        let (addr, _shutdown) = start(ctx).await;

        let request = format!(
            "GET http://127.0.0.1:{}/plain?q=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
            upstream.port()
        );
        let reply = exchange(addr, request.as_bytes()).await;
        assert!(reply.ends_with("upstream saw /plain?q=1"), "{}", reply);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let ctx = context(&[]);
        let (addr, _shutdown) = start(ctx).await;

        let request = format!(
            "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            closed.port()
        );
        let reply = exchange(addr, request.as_bytes()).await;
        assert!(reply.starts_with("HTTP/1.1 502"), "{}", reply);
    }

    #[tokio::test]
    async fn test_keep_alive_serves_several_requests() {
        let ctx = context(&[]);
        let (addr, _shutdown) = start(ctx).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /mock HTTP/1.1\r\nHost: a\r\n\r\nGET /mock HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[tokio::test]
    async fn test_cors_preflight_answered_locally() {
        let ctx = context(&[]);
        let (addr, _shutdown) = start(Arc::clone(&ctx)).await;
        let reply = exchange(
            addr,
            b"OPTIONS /x HTTP/1.1\r\nHost: a\r\nOrigin: http://x\r\nAccess-Control-Request-Method: GET\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(reply.contains("Access-Control-Allow-Origin: http://x"));
        assert!(reply.contains("Access-Control-Allow-Credentials: true"));
    }

    #[tokio::test]
    async fn test_plain_tunnel_relays_and_decodes() {
        // Minimal SMTP-like server: greet, then answer one command
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = server.accept().await.unwrap();
            socket.write_all(b"220 mail.test ESMTP\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"EHLO"));
            socket.write_all(b"250 mail.test\r\n").await.unwrap();
        });

        let ctx = context(&[]);
        let (addr, _shutdown) = start(Arc::clone(&ctx)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", server_addr.port());
        stream.write_all(connect.as_bytes()).await.unwrap();

        let mut head = vec![0u8; CONNECTION_ESTABLISHED.len()];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head, CONNECTION_ESTABLISHED);

        let mut greeting = vec![0u8; 21];
        stream.read_exact(&mut greeting).await.unwrap();
        stream.write_all(b"EHLO client\r\n").await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"250 mail.test\r\n");
        drop(stream);

        let decoded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let count = ctx
                    .store
                    .messages()
                    .iter()
                    .filter(|m| m.element.has_facet::<crate::capture::SmtpFacet>())
                    .count();
                if count >= 3 {
                    return count;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(decoded >= 3);
    }

    #[tokio::test]
    async fn test_head_reply_keeps_upstream_length() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let _ = read_request(&mut socket, &mut buf, 1 << 20, Duration::from_secs(5)).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 1234\r\n\r\n")
                .await
                .unwrap();
        });

        let ctx = context(&[]);
        let (addr, _shutdown) = start(ctx).await;
        let request = format!(
            "HEAD http://127.0.0.1:{}/big HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
            port
        );
        let reply = exchange(addr, request.as_bytes()).await;
        assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);
        assert!(reply.contains("Content-Length: 1234\r\n"), "{}", reply);
        assert!(reply.ends_with("\r\n\r\n"), "{}", reply);
    }

    #[tokio::test]
    async fn test_prefixed_stream_yields_prefix_first() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b" world").await.unwrap();
        drop(near);

        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), far);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
