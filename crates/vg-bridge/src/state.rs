use std::sync::Arc;
use std::time::{Duration, Instant};

use vg_core::config::Config;
use vg_dispatch::{Dispatcher, EmailChannel, HttpChannelSet};
use vg_harness::backoff::RetryPolicy;
use vg_harness::quota::{QuotaController, QuotaLimits};
use vg_pipeline::IngestPipeline;
use vg_store::Store;

use crate::auth::ProjectCache;

/// Shared application state for all HTTP handlers.
///
/// The project cache and the quota counters are the only process-wide
/// mutable state; both live here, scoped to the server process, and are
/// handed to handlers explicitly through `State`.
pub struct ApiState {
    pub store: Arc<Store>,
    pub config: Config,
    pub quota: Arc<QuotaController>,
    pub pipeline: IngestPipeline,
    pub dispatcher: Arc<Dispatcher>,
    pub project_cache: ProjectCache,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(store: Arc<Store>, config: Config) -> Arc<Self> {
        let quota = Arc::new(QuotaController::new(QuotaLimits {
            per_minute: config.quota.per_minute,
            per_hour: config.quota.per_hour,
        }));

        let retry = RetryPolicy {
            attempt_timeout: Duration::from_secs(config.dispatch.attempt_timeout_secs),
            total_budget: Duration::from_secs(config.dispatch.retry_budget_secs),
            max_attempts: config.dispatch.max_attempts,
            ..RetryPolicy::default()
        };

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.dispatch.attempt_timeout_secs))
            .build()
            .unwrap_or_default();

        let email =
            EmailChannel::from_smtp_url(config.smtp.url.as_deref(), &config.smtp.from_address);

        let dispatcher = Arc::new(
            Dispatcher::new(store.clone(), HttpChannelSet::new(http_client), email, retry)
                .with_max_digest_backlog(config.dispatch.max_queue_depth as u64),
        );

        Arc::new(Self {
            pipeline: IngestPipeline::new(store.clone(), config.ingest.clone()),
            quota,
            dispatcher,
            project_cache: ProjectCache::new(Duration::from_secs(
                config.auth.project_cache_ttl_secs,
            )),
            start_time: Instant::now(),
            store,
            config,
        })
    }

    /// Same state wired to an explicit dispatcher (tests inject a memory
    /// SMTP sender this way).
    pub fn with_dispatcher(
        store: Arc<Store>,
        config: Config,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let quota = Arc::new(QuotaController::new(QuotaLimits {
            per_minute: config.quota.per_minute,
            per_hour: config.quota.per_hour,
        }));
        Arc::new(Self {
            pipeline: IngestPipeline::new(store.clone(), config.ingest.clone()),
            quota,
            dispatcher,
            project_cache: ProjectCache::new(Duration::from_secs(
                config.auth.project_cache_ttl_secs,
            )),
            start_time: Instant::now(),
            store,
            config,
        })
    }
}
