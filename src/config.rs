use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::mitm::KeyAlgorithm;
use crate::routing::{parse_route_list, Route};
use crate::upstream::UpstreamProxy;

#[derive(Debug, Clone)]
pub struct Config {
    // Listener
    pub host: String,
    pub port: u16,

    // TLS interception
    pub tls_interception: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub leaf_key_algorithm: KeyAlgorithm,
    pub cert_cache_size: usize,
    pub cert_ttl_seconds: u64,
    pub ocsp_stapling: bool,

    // PKCS#12 identities
    pub identities_dir: Option<PathBuf>,
    pub identity_passwords: Vec<SecretString>,

    // Upstream
    pub upstream_proxy: Option<UpstreamProxy>,
    pub trust_upstream_certs: bool,

    // Capture
    pub max_parse_size: usize,
    pub capture_buffer_bytes: usize,
    pub notification_workers: usize,

    // Limits and timeouts
    pub max_body_size: usize,
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,

    pub cors_allow_credentials: bool,
    pub routes: Vec<Route>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tls_interception: true,
            ca_cert_path: None,
            ca_key_path: None,
            leaf_key_algorithm: KeyAlgorithm::Ec256,
            cert_cache_size: 1000,
            cert_ttl_seconds: 86400,
            ocsp_stapling: false,
            identities_dir: None,
            identity_passwords: Vec::new(),
            upstream_proxy: None,
            trust_upstream_certs: true,
            max_parse_size: 8 * 1024 * 1024,
            capture_buffer_bytes: 64 * 1024 * 1024,
            notification_workers: 2,
            max_body_size: 100 * 1024 * 1024,
            connect_timeout_seconds: 10,
            read_timeout_seconds: 30,
            write_timeout_seconds: 30,
            idle_timeout_seconds: 120,
            cors_allow_credentials: true,
            routes: Vec::new(),
        }
    }
}

/// Parse `name` if set, otherwise keep `default`
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow!("{}", e))
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

/// Set and non-blank
fn var_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let host = env::var("WIRETAP_HOST").unwrap_or(defaults.host);
        let port = var_or("WIRETAP_PORT", defaults.port)?;

        let tls_interception = var_or("WIRETAP_TLS_INTERCEPTION", defaults.tls_interception)?;
        let ca_cert_path = var_opt("WIRETAP_CA_CERT_PATH").map(PathBuf::from);
        let ca_key_path = var_opt("WIRETAP_CA_KEY_PATH").map(PathBuf::from);
        let leaf_key_algorithm = var_or("WIRETAP_LEAF_KEY_ALGORITHM", defaults.leaf_key_algorithm)?;
        let cert_cache_size = var_or("WIRETAP_CERT_CACHE_SIZE", defaults.cert_cache_size)?;
        let cert_ttl_seconds = var_or("WIRETAP_CERT_TTL_SECONDS", defaults.cert_ttl_seconds)?;
        let ocsp_stapling = var_or("WIRETAP_OCSP_STAPLING", defaults.ocsp_stapling)?;

        let identities_dir = var_opt("WIRETAP_IDENTITIES_DIR").map(PathBuf::from);
        let identity_passwords = env::var("WIRETAP_IDENTITY_PASSWORDS")
            .map(|raw| {
                raw.split(',')
                    .map(|p| SecretString::new(p.trim().to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let upstream_proxy = match var_opt("WIRETAP_UPSTREAM_PROXY") {
            Some(url) => Some(
                UpstreamProxy::parse(
                    &url,
                    var_opt("WIRETAP_UPSTREAM_PROXY_USER"),
                    var_opt("WIRETAP_UPSTREAM_PROXY_PASSWORD").map(SecretString::new),
                )
                .context("Invalid WIRETAP_UPSTREAM_PROXY")?,
            ),
            None => None,
        };
        let trust_upstream_certs = var_or("WIRETAP_TRUST_UPSTREAM_CERTS", defaults.trust_upstream_certs)?;

        let max_parse_size = var_or("WIRETAP_MAX_PARSE_SIZE", defaults.max_parse_size)?;
        let capture_buffer_bytes = var_or("WIRETAP_CAPTURE_BUFFER_BYTES", defaults.capture_buffer_bytes)?;
        let notification_workers = var_or("WIRETAP_NOTIFICATION_WORKERS", defaults.notification_workers)?;

        let max_body_size = var_or("WIRETAP_MAX_BODY_SIZE", defaults.max_body_size)?;
        let connect_timeout_seconds = var_or("WIRETAP_CONNECT_TIMEOUT_SECONDS", defaults.connect_timeout_seconds)?;
        let read_timeout_seconds = var_or("WIRETAP_READ_TIMEOUT_SECONDS", defaults.read_timeout_seconds)?;
        let write_timeout_seconds = var_or("WIRETAP_WRITE_TIMEOUT_SECONDS", defaults.write_timeout_seconds)?;
        let idle_timeout_seconds = var_or("WIRETAP_IDLE_TIMEOUT_SECONDS", defaults.idle_timeout_seconds)?;

        let cors_allow_credentials = var_or("WIRETAP_CORS_ALLOW_CREDENTIALS", defaults.cors_allow_credentials)?;
        let routes = match var_opt("WIRETAP_ROUTES") {
            Some(raw) => parse_route_list(&raw).context("Invalid WIRETAP_ROUTES")?,
            None => Vec::new(),
        };

        let config = Config {
            host,
            port,
            tls_interception,
            ca_cert_path,
            ca_key_path,
            leaf_key_algorithm,
            cert_cache_size,
            cert_ttl_seconds,
            ocsp_stapling,
            identities_dir,
            identity_passwords,
            upstream_proxy,
            trust_upstream_certs,
            max_parse_size,
            capture_buffer_bytes,
            notification_workers,
            max_body_size,
            connect_timeout_seconds,
            read_timeout_seconds,
            write_timeout_seconds,
            idle_timeout_seconds,
            cors_allow_credentials,
            routes,
        };
        config.validate()?;

        tracing::info!(
            listen = %config.listen_address(),
            tls_interception = config.tls_interception,
            leaf_key_algorithm = %config.leaf_key_algorithm,
            upstream_proxy = ?config.upstream_proxy.as_ref().map(|p| p.address()),
            routes = config.routes.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Reject combinations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("WIRETAP_HOST cannot be empty"));
        }
        if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
            return Err(anyhow!(
                "WIRETAP_CA_CERT_PATH and WIRETAP_CA_KEY_PATH must be set together"
            ));
        }
        if self.notification_workers == 0 {
            return Err(anyhow!("WIRETAP_NOTIFICATION_WORKERS must be at least 1"));
        }
        if self.connect_timeout_seconds == 0 || self.read_timeout_seconds == 0 || self.write_timeout_seconds == 0 {
            return Err(anyhow!("Timeouts must be at least one second"));
        }
        if self.idle_timeout_seconds < self.read_timeout_seconds {
            return Err(anyhow!(
                "WIRETAP_IDLE_TIMEOUT_SECONDS ({}) must not be shorter than WIRETAP_READ_TIMEOUT_SECONDS ({})",
                self.idle_timeout_seconds,
                self.read_timeout_seconds
            ));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn cert_ttl(&self) -> Duration {
        Duration::from_secs(self.cert_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Global mutex to serialize config tests (env vars are process-global)
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "WIRETAP_HOST",
        "WIRETAP_PORT",
        "WIRETAP_TLS_INTERCEPTION",
        "WIRETAP_CA_CERT_PATH",
        "WIRETAP_CA_KEY_PATH",
        "WIRETAP_LEAF_KEY_ALGORITHM",
        "WIRETAP_UPSTREAM_PROXY",
        "WIRETAP_UPSTREAM_PROXY_USER",
        "WIRETAP_UPSTREAM_PROXY_PASSWORD",
        "WIRETAP_NOTIFICATION_WORKERS",
        "WIRETAP_IDLE_TIMEOUT_SECONDS",
        "WIRETAP_IDENTITY_PASSWORDS",
        "WIRETAP_ROUTES",
    ];

    fn clear_test_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_without_environment() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.tls_interception);
        assert_eq!(config.leaf_key_algorithm, KeyAlgorithm::Ec256);
        assert!(config.upstream_proxy.is_none());
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_reads_overrides() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("WIRETAP_PORT", "9999");
        env::set_var("WIRETAP_TLS_INTERCEPTION", "false");
        env::set_var("WIRETAP_LEAF_KEY_ALGORITHM", "rsa-2048");
        env::set_var("WIRETAP_UPSTREAM_PROXY", "socks5://proxy.test:1080");
        env::set_var("WIRETAP_UPSTREAM_PROXY_USER", "alice");
        env::set_var("WIRETAP_UPSTREAM_PROXY_PASSWORD", "secret");
        env::set_var("WIRETAP_IDENTITY_PASSWORDS", "one, two");
        env::set_var("WIRETAP_ROUTES", "/api=>http://backend:8081;http://svc=>https://real");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 9999);
        assert!(!config.tls_interception);
        assert_eq!(config.leaf_key_algorithm, KeyAlgorithm::Rsa2048);
        let proxy = config.upstream_proxy.as_ref().unwrap();
        assert_eq!(proxy.address(), "proxy.test:1080");
        assert!(proxy.proxy_authorization().is_some());
        assert_eq!(config.identity_passwords.len(), 2);
        assert_eq!(config.routes.len(), 2);

        clear_test_env();
    }

    #[test]
    fn test_rejects_invalid_values() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();

        env::set_var("WIRETAP_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(format!("{:#}", err).contains("WIRETAP_PORT"));
        clear_test_env();

        env::set_var("WIRETAP_LEAF_KEY_ALGORITHM", "dsa-1024");
        assert!(Config::from_env().is_err());
        clear_test_env();

        env::set_var("WIRETAP_UPSTREAM_PROXY", "ftp://proxy:21");
        assert!(Config::from_env().is_err());
        clear_test_env();

        env::set_var("WIRETAP_ROUTES", "/api->nowhere");
        assert!(Config::from_env().is_err());
        clear_test_env();
    }

    #[test]
    fn test_ca_paths_must_come_together() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("WIRETAP_CA_CERT_PATH", "/tmp/ca.pem");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("must be set together"));

        clear_test_env();
    }

    #[test]
    fn test_idle_shorter_than_read_rejected() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("WIRETAP_IDLE_TIMEOUT_SECONDS", "5");

        assert!(Config::from_env().is_err());

        clear_test_env();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = Config {
            notification_workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
