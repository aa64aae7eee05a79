//! Wiretap - TLS-capable intercepting proxy for testing
//!
//! Wiretap sits between test clients and systems under test. It tunnels or
//! terminates TCP/TLS connections, mints leaf certificates per intercepted
//! hostname, matches requests against expectations and routes, and decodes the
//! traffic it relays into an inspectable message tree.
//!
//! ## Features
//!
//! - **Forward and reverse proxying**: absolute-form requests, `CONNECT`
//!   tunnels, and origin-form requests resolved through routes
//! - **TLS interception**: SNI-driven leaf certificates signed by a local CA,
//!   cached per hostname, optional OCSP stapling, PKCS#12 identities
//! - **Expectations**: prioritized mock responses and forward callbacks,
//!   CORS preflight answered locally
//! - **Upstream chaining**: HTTP, HTTPS and SOCKS5 proxies with Basic auth
//! - **Capture**: HTTP, SMTP, POP3, SICCT and CETP decoding with JSON and
//!   X.509 payload facets, byte-budgeted retention and capture files
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wiretap::{CapturedMessage, Config, WiretapProxy};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let proxy = WiretapProxy::builder(Config::default()).build()?;
//!     proxy.add_route("/api", "http://localhost:9000")?;
//!     proxy.add_message_listener(Arc::new(|message: &CapturedMessage| {
//!         println!("#{} {} bytes", message.sequence_number, message.size());
//!     }));
//!
//!     let handle = proxy.start().await?;
//!     println!("listening on {}", handle.addr());
//!     handle.stop().await;
//!     proxy.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `cache` - TTL/FIFO-bounded cache
//! - `mitm` - CA, leaf certificates, OCSP, identities, TLS configs
//! - `message` - HTTP/1.1 model, codec, CORS, URL helpers
//! - `routing` - expectations, routes and the router
//! - `upstream` / `http_client` - outbound connections
//! - `server` - connection relay
//! - `capture` - decode pipeline, store and capture files
//! - `notify` - listener worker pool
//! - `proxy` - facade tying everything together

pub mod cache;
pub mod capture;
pub mod config;
pub mod http_client;
pub mod message;
pub mod mitm;
pub mod notify;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod upstream;

// Re-export commonly used types

/// Configuration types
pub use config::Config;

/// Proxy facade
pub use proxy::{ProxyHandle, WiretapProxy, WiretapProxyBuilder};

/// Caching
pub use cache::{BoundedCache, CacheSettings, Clock, ManualClock, SystemClock};

/// Capture types
pub use capture::{
    CaptureFileReader, CaptureFileWriter, CaptureStore, CapturedElement, CapturedMessage, DecodeError, Endpoints,
    Facet, HttpFacet, Pipeline,
};

/// Matching and routing
pub use routing::{Cause, Expectation, ForwardDecision, RequestMatcher, Route};

/// HTTP model
pub use message::{Headers, HttpRequest, HttpResponse};

/// MITM types
pub use mitm::{CaKeyManager, CertificateAuthority, KeyAlgorithm, MitmError, UpstreamTlsConfig};

/// Listeners
pub use notify::{MessageListener, NotificationScheduler};

/// Upstream proxies
pub use upstream::{ProxyScheme, UpstreamProxy};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "wiretap");
    }
}
