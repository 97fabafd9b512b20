//! vigil daemon: starts the error-monitoring API server and the digest,
//! retention, and report-schedule loops.

use anyhow::{Context, Result};
use tracing::info;

use vg_core::config::Config;
use vg_daemon::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config (path from VIGIL_CONFIG, default ./vigil.toml), with
    // environment overrides applied on top.
    let config_path =
        std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| "./vigil.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    if std::env::var("VIGIL_LOG_JSON").is_ok() {
        vg_telemetry::logging::init_logging_json("vg-daemon", "info");
    } else {
        vg_telemetry::logging::init_logging("vg-daemon", "info");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.database.path,
        "vigil daemon starting"
    );

    if config.auth.jwt_secret.is_empty() {
        tracing::warn!("JWT_SECRET is not set; dashboard API authentication is disabled");
    }
    if config.smtp.url.is_none() {
        tracing::warn!("SMTP_URL is not set; email alerts will not leave this process");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "API listener bound");

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run_with_listener(listener).await
}
