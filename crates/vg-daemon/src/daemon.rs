use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use vg_bridge::{api_router, ApiState};
use vg_core::config::Config;
use vg_dispatch::{DigestFlusher, EmailChannel};
use vg_harness::shutdown::ShutdownSignal;
use vg_store::Store;

use crate::report_scheduler::ReportScheduler;
use crate::retention::RetentionSweeper;

/// Configuration for the daemon's background loop intervals.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// How often the digest flusher runs (default: 15 min).
    pub digest_secs: u64,
    /// How often the retention sweeper runs (default: hourly).
    pub retention_secs: u64,
    /// How often due report schedules are checked (default: 60s).
    pub reports_secs: u64,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self {
            digest_secs: 15 * 60,
            retention_secs: 60 * 60,
            reports_secs: 60,
        }
    }
}

/// The vigil server process: the HTTP API plus the three wall-clock loops
/// (digest flush, retention sweep, report schedules), all running on worker
/// pools decoupled from request handling and all stopping cleanly on the
/// shutdown signal.
pub struct Daemon {
    config: Config,
    store: Arc<Store>,
    api_state: Arc<ApiState>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(
            Store::open(&config.database.path)
                .await
                .context("failed to open database")?,
        );
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<Store>) -> Self {
        let intervals = DaemonIntervals {
            digest_secs: config.digest.flush_interval_minutes * 60,
            retention_secs: config.retention.sweep_interval_minutes * 60,
            reports_secs: config.reports.tick_interval_secs,
        };
        let api_state = ApiState::new(store.clone(), config.clone());
        Self {
            config,
            store,
            api_state,
            intervals,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    /// Serve the API on the given listener and run the background loops
    /// until shutdown is triggered.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        self.spawn_background_loops();

        let router = api_router(self.api_state.clone());
        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown.subscribe();
                let _ = rx.recv().await;
            })
            .await
            .context("API server error")?;

        info!("daemon stopped");
        Ok(())
    }

    fn spawn_background_loops(&self) {
        let email = Arc::new(EmailChannel::from_smtp_url(
            self.config.smtp.url.as_deref(),
            &self.config.smtp.from_address,
        ));

        // --- Digest flusher ---
        let flusher = DigestFlusher::new(self.store.clone(), email.clone());
        let shutdown = self.shutdown.clone();
        let interval_secs = self.intervals.digest_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            let mut rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match flusher.flush(Utc::now()).await {
                            Ok(report) if report.sent > 0 || report.failed > 0 => {
                                info!(sent = report.sent, failed = report.failed, "digest flush");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "digest flush failed"),
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
        });

        // --- Retention sweeper ---
        let sweeper = RetentionSweeper::new(self.store.clone(), self.config.retention.batch_size);
        let shutdown = self.shutdown.clone();
        let interval_secs = self.intervals.retention_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            let mut rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = sweeper.run_sweep(Utc::now(), &shutdown).await {
                            error!(error = %err, "retention sweep failed");
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
        });

        // --- Report scheduler ---
        let scheduler = ReportScheduler::new(
            self.store.clone(),
            email,
            self.config.reports.claim_stale_minutes,
            self.config.reports.api_base_url.clone(),
        );
        let shutdown = self.shutdown.clone();
        let interval_secs = self.intervals.reports_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            let mut rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = scheduler.tick(Utc::now()).await {
                            error!(error = %err, "report scheduler tick failed");
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
        });

        info!(
            digest_secs = self.intervals.digest_secs,
            retention_secs = self.intervals.retention_secs,
            reports_secs = self.intervals.reports_secs,
            "background loops started"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn daemon_serves_health_and_shuts_down() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let daemon = Daemon::with_store(Config::default(), store);
        let shutdown = daemon.shutdown_handle();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move { daemon.run_with_listener(listener).await });

        // Raw TCP health probe keeps this test free of an HTTP client dep.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(
            &mut stream,
            b"GET /health HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
        )
        .await
        .unwrap();
        let mut response = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response)
            .await
            .unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));

        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
