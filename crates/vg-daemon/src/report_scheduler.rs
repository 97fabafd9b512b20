use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use vg_core::types::RunStatus;
use vg_dispatch::EmailChannel;
use vg_store::Store;

/// Drives report schedules on the wall clock.
///
/// Each tick claims due schedules one at a time (CAS on `last_claim_at`, so
/// concurrent processes cannot double-run one), produces the run, mails the
/// recipients, and advances `next_run_at` by one cadence step. A failed run
/// stays recorded as `failed` and the schedule still advances; the next
/// cadence tick retries.
pub struct ReportScheduler {
    store: Arc<Store>,
    email: Arc<EmailChannel>,
    claim_stale: Duration,
    api_base_url: String,
}

impl ReportScheduler {
    pub fn new(
        store: Arc<Store>,
        email: Arc<EmailChannel>,
        claim_stale_minutes: i64,
        api_base_url: String,
    ) -> Self {
        Self {
            store,
            email,
            claim_stale: Duration::minutes(claim_stale_minutes),
            api_base_url,
        }
    }

    /// Run every due schedule once. Returns how many runs were produced.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut produced = 0;

        while let Some(mut schedule) = self
            .store
            .claim_due_schedule(now, self.claim_stale)
            .await?
        {
            let run = self
                .store
                .produce_report_run(schedule.project_id, Some(schedule.id), schedule.window_days)
                .await?;

            match run.status {
                RunStatus::Success => {
                    info!(schedule = %schedule.id, run = %run.id, "scheduled report produced");
                    let link = format!(
                        "{}/api/reports/runs/{}",
                        self.api_base_url.trim_end_matches('/'),
                        run.id
                    );
                    let subject = format!("Scheduled report: {}", schedule.name);
                    let body = format!(
                        "Your {} report is ready.\n\nDownload: {link}\n",
                        schedule.name
                    );
                    for recipient in &schedule.recipients {
                        if let Err(err) = self.email.send_digest(recipient, &subject, &body).await
                        {
                            warn!(
                                recipient,
                                error = err.message(),
                                "report notification failed"
                            );
                        }
                    }
                }
                _ => {
                    warn!(
                        schedule = %schedule.id,
                        run = %run.id,
                        error = run.error.as_deref().unwrap_or("unknown"),
                        "scheduled report failed"
                    );
                }
            }

            schedule.last_run_at = Some(now);
            schedule.next_run_at = Some(schedule.next_run_after(now));
            self.store.upsert_schedule(&schedule).await?;
            produced += 1;
        }

        Ok(produced)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
