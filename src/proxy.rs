//! Proxy facade: builds every component from a [`Config`] and exposes the
//! control API used by test code and admin front-ends.

use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::cache::{BoundedCache, CacheSettings, Clock, SystemClock};
use crate::capture::{file, CaptureFileReader, CaptureStore, CapturedMessage, Pipeline};
use crate::config::Config;
use crate::http_client::{ClientTimeouts, HttpClient};
use crate::message::CorsPolicy;
use crate::mitm::{
    CaKeyManager, CaSettings, CertificateAuthority, ClientTlsConfig, IdentityStore, SniCertResolver,
    UpstreamTlsConfig,
};
use crate::notify::{MessageListener, NotificationScheduler};
use crate::routing::{Cause, ChangeFeed, ChangeSubscription, Expectation, ExpectationStore, Route, RouteTable, Router};
use crate::server::{self, Interception, RelayContext, RelayTimeouts};

const CA_COMMON_NAME: &str = "Wiretap Interception CA";

pub struct WiretapProxyBuilder {
    config: Config,
    ca: Option<Arc<CaKeyManager>>,
    server_identities: Vec<(String, String)>,
    upstream_roots: Vec<CertificateDer<'static>>,
    cache_settings: Option<Arc<CacheSettings>>,
    clock: Option<Arc<dyn Clock>>,
}

impl WiretapProxyBuilder {
    /// Use existing CA material instead of generating or loading one
    pub fn with_ca(mut self, ca: Arc<CaKeyManager>) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Present PKCS#12 identity `identity_id` for `hostname` instead of a minted leaf
    pub fn with_server_identity(mut self, hostname: impl Into<String>, identity_id: impl Into<String>) -> Self {
        self.server_identities.push((hostname.into(), identity_id.into()));
        self
    }

    /// Extra trust anchors for verifying upstreams (only used when upstream
    /// certificates are verified)
    pub fn with_upstream_roots(mut self, roots: Vec<CertificateDer<'static>>) -> Self {
        self.upstream_roots = roots;
        self
    }

    /// Shared cache switches, e.g. to disable certificate reuse in a test
    pub fn with_cache_settings(mut self, settings: Arc<CacheSettings>) -> Self {
        self.cache_settings = Some(settings);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build all components; must run inside a tokio runtime
    pub fn build(self) -> Result<WiretapProxy> {
        let config = self.config;
        config.validate()?;

        let ca_manager = match (self.ca, &config.ca_cert_path, &config.ca_key_path) {
            (Some(ca), _, _) => ca,
            (None, Some(cert), Some(key)) => Arc::new(
                CaKeyManager::load_from_files(cert, key)
                    .with_context(|| format!("Failed to load CA from {}", cert.display()))?,
            ),
            _ => Arc::new(
                CaKeyManager::generate(config.leaf_key_algorithm, CA_COMMON_NAME).context("Failed to generate CA")?,
            ),
        };

        let cache_settings = self.cache_settings.unwrap_or_else(CacheSettings::new);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cert_cache = Arc::new(BoundedCache::with_settings(
            config.cert_cache_size,
            cache_settings,
            clock,
        ));
        let ca_settings = CaSettings {
            leaf_algorithm: config.leaf_key_algorithm,
            cache_ttl: config.cert_ttl(),
            ocsp_stapling: config.ocsp_stapling,
            ..CaSettings::default()
        };
        let mut authority = CertificateAuthority::new(Arc::clone(&ca_manager), cert_cache, ca_settings)
            .context("Failed to initialize certificate authority")?;

        let identities = match &config.identities_dir {
            Some(dir) => Some(Arc::new(
                IdentityStore::load_dir(dir, &config.identity_passwords)
                    .with_context(|| format!("Failed to scan identities in {}", dir.display()))?,
            )),
            None => None,
        };
        for (hostname, identity_id) in &self.server_identities {
            let store = identities
                .as_ref()
                .context("Server identities need WIRETAP_IDENTITIES_DIR")?;
            authority = authority
                .with_identity_override(Arc::clone(store), hostname, identity_id)
                .with_context(|| format!("Cannot use identity '{}' for {}", identity_id, hostname))?;
        }
        let authority = Arc::new(authority);

        let interception = if config.tls_interception {
            let resolver = Arc::new(SniCertResolver::new(Arc::clone(&authority), "localhost"));
            Some(Interception {
                ca: Arc::clone(&authority),
                acceptor: TlsAcceptor::from(ClientTlsConfig::new(resolver).server_config()),
            })
        } else {
            None
        };

        let upstream_tls = if config.trust_upstream_certs {
            UpstreamTlsConfig::trusting_all()
        } else {
            UpstreamTlsConfig::verifying(&self.upstream_roots).context("Invalid upstream trust roots")?
        };
        let client = HttpClient::new(
            config.upstream_proxy.clone().map(Arc::new),
            upstream_tls,
            ClientTimeouts {
                connect: config.connect_timeout(),
                read: config.read_timeout(),
                write: config.write_timeout(),
            },
            config.max_body_size,
        );

        let feed = ChangeFeed::default();
        let expectations = Arc::new(ExpectationStore::new(feed.clone()));
        let routes = Arc::new(RouteTable::new(feed.clone()));
        for route in &config.routes {
            routes.add(route.clone(), Cause::FileLoad);
        }
        let router = Arc::new(Router::new(
            Arc::clone(&expectations),
            Arc::clone(&routes),
            CorsPolicy::with_credentials(config.cors_allow_credentials),
        ));

        let pipeline = Arc::new(Pipeline::with_default_plugins(config.max_parse_size));
        let store = Arc::new(CaptureStore::new(config.capture_buffer_bytes));
        let scheduler = NotificationScheduler::start(config.notification_workers);

        let context = Arc::new(RelayContext {
            router,
            client,
            interception,
            pipeline: Arc::clone(&pipeline),
            store: Arc::clone(&store),
            scheduler: Arc::clone(&scheduler),
            timeouts: RelayTimeouts {
                idle: config.idle_timeout(),
                read: config.read_timeout(),
                write: config.write_timeout(),
            },
            max_body: config.max_body_size,
        });

        Ok(WiretapProxy {
            config,
            ca_manager,
            authority,
            feed,
            expectations,
            routes,
            pipeline,
            store,
            scheduler,
            context,
        })
    }
}

/// An intercepting proxy instance and its control API
pub struct WiretapProxy {
    config: Config,
    ca_manager: Arc<CaKeyManager>,
    authority: Arc<CertificateAuthority>,
    feed: ChangeFeed,
    expectations: Arc<ExpectationStore>,
    routes: Arc<RouteTable>,
    pipeline: Arc<Pipeline>,
    store: Arc<CaptureStore>,
    scheduler: Arc<NotificationScheduler>,
    context: Arc<RelayContext>,
}

impl WiretapProxy {
    pub fn builder(config: Config) -> WiretapProxyBuilder {
        WiretapProxyBuilder {
            config,
            ca: None,
            server_identities: Vec::new(),
            upstream_roots: Vec::new(),
            cache_settings: None,
            clock: None,
        }
    }

    /// Bind the configured address and start accepting connections
    pub async fn start(&self) -> Result<ProxyHandle> {
        let listen = self.config.listen_address();
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("Failed to bind {}", listen))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(server::serve(listener, Arc::clone(&self.context), shutdown_rx));
        info!(%addr, interception = self.config.tls_interception, "Wiretap proxy listening");

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }

    /// Drain pending listener notifications; call after stopping all handles
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    pub fn add_route(&self, from: &str, to: &str) -> Result<String> {
        let route = Route::new(from, to)?;
        Ok(self.routes.add(route, Cause::Api))
    }

    pub fn remove_route(&self, id: &str) -> bool {
        self.routes.remove(id, Cause::Api)
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.snapshot().iter().cloned().collect()
    }

    pub fn add_expectation(&self, expectation: Expectation) -> String {
        self.expectations.add(expectation, Cause::Api)
    }

    pub fn remove_expectation(&self, id: &str) -> bool {
        self.expectations.remove(id, Cause::Api)
    }

    pub fn clear_expectations(&self) {
        self.expectations.clear(Cause::Api);
    }

    /// Route/expectation changes, optionally filtered by cause
    pub fn subscribe_changes(&self, causes: Option<Vec<Cause>>) -> ChangeSubscription {
        self.feed.subscribe(causes)
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.scheduler.add_listener(listener);
    }

    pub fn captured_messages(&self) -> Vec<Arc<CapturedMessage>> {
        self.store.messages()
    }

    pub fn clear_captured_messages(&self) {
        self.store.clear();
    }

    pub async fn wait_for_next_message(&self, timeout: Duration) -> Option<Arc<CapturedMessage>> {
        self.store.wait_for_next(timeout).await
    }

    /// CA certificate in PEM, for installing into client trust stores
    pub fn ca_certificate_pem(&self) -> &str {
        self.ca_manager.export_ca_certificate_pem()
    }

    pub fn export_ca_certificate(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ca_manager
            .export_ca_certificate_to_file(path.as_ref())
            .with_context(|| format!("Failed to write CA certificate to {}", path.as_ref().display()))
    }

    /// Write every retained message to a capture file
    pub async fn save_capture(&self, path: impl Into<PathBuf>) -> Result<usize> {
        let path = path.into();
        let messages = self.store.messages();
        tokio::task::spawn_blocking(move || file::save(&path, &messages))
            .await
            .context("capture save task failed")?
            .context("Failed to save capture")
    }

    /// Read a capture file and append its messages to the store
    ///
    /// Loaded messages are renumbered into this proxy's sequence and
    /// delivered to listeners like live traffic.
    pub async fn load_capture(&self, path: impl Into<PathBuf>) -> Result<usize> {
        let path = path.into();
        let pipeline = Arc::clone(&self.pipeline);
        let messages = tokio::task::spawn_blocking(move || {
            CaptureFileReader::open(&path).and_then(|reader| reader.read_all(&pipeline))
        })
        .await
        .context("capture load task failed")?
        .context("Failed to load capture")?;

        let count = messages.len();
        for message in messages {
            let message = self.store.push_message(message);
            self.scheduler.notify(message);
        }
        if count == 0 {
            warn!("Capture file contained no messages");
        }
        Ok(count)
    }
}

/// A running accept loop
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HttpResponse;
    use crate::routing::{ChangeKind, RequestMatcher};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> Config {
        Config {
            port: 0, // Random port
            tls_interception: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let proxy = WiretapProxy::builder(test_config()).build().unwrap();
        let handle = proxy.start().await.unwrap();
        assert_ne!(handle.addr().port(), 0);
        handle.stop().await;
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_control_api_publishes_changes() {
        let proxy = WiretapProxy::builder(test_config()).build().unwrap();
        let mut changes = proxy.subscribe_changes(Some(vec![Cause::Api]));

        let id = proxy.add_route("/api", "http://backend:9000").unwrap();
        assert_eq!(proxy.routes().len(), 1);
        assert!(proxy.remove_route(&id));
        assert!(!proxy.remove_route(&id));

        let added = changes.try_recv().unwrap();
        assert_eq!(added.kind, ChangeKind::RouteAdded);
        assert_eq!(added.id, id);
        assert!(proxy.add_route("", "not a url").is_err());
    }

    #[tokio::test]
    async fn test_listener_sees_mocked_exchange() {
        let proxy = WiretapProxy::builder(test_config()).build().unwrap();
        proxy.add_expectation(Expectation::respond(
            RequestMatcher::any().method("GET"),
            HttpResponse::new(204),
        ));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        proxy.add_message_listener(Arc::new(move |message: &CapturedMessage| {
            let _ = tx.send(message.sequence_number);
        }));

        let handle = proxy.start().await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        stream
            .write_all(b"GET /anything HTTP/1.1\r\nHost: sut\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 204"));

        // Workers may deliver out of order
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_unstable();
        assert_eq!(seen[1], seen[0] + 1);
        assert_eq!(proxy.captured_messages().len(), 2);

        handle.stop().await;
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_ca_pem_exported() {
        let proxy = WiretapProxy::builder(test_config()).build().unwrap();
        assert!(proxy.ca_certificate_pem().starts_with("-----BEGIN CERTIFICATE-----"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        proxy.export_ca_certificate(&path).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("BEGIN CERTIFICATE"));
    }
}
