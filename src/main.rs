use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wiretap::{Config, WiretapProxy};

const CA_EXPORT_PATH: &str = "wiretap-ca.pem";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!(version = wiretap::VERSION, "Starting Wiretap...");

    let config = Config::from_env().context("Failed to load configuration")?;
    let proxy = WiretapProxy::builder(config).build()?;

    match proxy.export_ca_certificate(CA_EXPORT_PATH) {
        Ok(()) => info!(path = CA_EXPORT_PATH, "CA certificate written; trust it in test clients"),
        Err(e) => warn!(error = %e, "Could not write CA certificate"),
    }

    let handle = proxy.start().await?;
    info!(addr = %handle.addr(), "Proxy ready");

    shutdown_signal().await;
    info!("Shutting down...");
    handle.stop().await;
    proxy.shutdown().await;
    info!(captured = proxy.captured_messages().len(), "Shutdown complete");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("WIRETAP_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    // Handle SIGINT (Ctrl+C)
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
