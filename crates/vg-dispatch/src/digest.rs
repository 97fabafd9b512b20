use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use vg_core::types::DigestEntry;
use vg_store::{Store, StoreError};

use crate::alert::AlertSnapshot;
use crate::channels::EmailChannel;
use crate::quiet::in_quiet_hours;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Members who received a digest email this cycle.
    pub sent: usize,
    /// Members skipped for cadence or quiet hours.
    pub skipped: usize,
    /// Send failures left pending for the next cycle.
    pub failed: usize,
}

/// Drains pending digest entries on a cadence.
///
/// A member is due when their cadence has elapsed since `lastSentAt` and
/// they are outside quiet hours right now. All of a member's pending
/// entries go into one email; they are marked processed only after the
/// send succeeds, so a failure retries next cycle.
pub struct DigestFlusher {
    store: Arc<Store>,
    email: Arc<EmailChannel>,
}

impl DigestFlusher {
    pub fn new(store: Arc<Store>, email: Arc<EmailChannel>) -> Self {
        Self { store, email }
    }

    pub async fn flush(&self, now: DateTime<Utc>) -> Result<FlushReport, StoreError> {
        let mut report = FlushReport::default();

        for (_project_id, member_id) in self.store.members_with_pending_digests().await? {
            let Some(member) = self.store.get_member_by_id(member_id).await? else {
                continue;
            };
            let prefs = &member.alert_preferences.email;

            if in_quiet_hours(&prefs.quiet_hours, now) {
                report.skipped += 1;
                continue;
            }
            if let Some(last_sent) = prefs.digest.last_sent_at {
                if now < last_sent + prefs.digest.cadence.as_duration() {
                    report.skipped += 1;
                    continue;
                }
            }

            let entries = self.store.pending_digest_entries(member_id).await?;
            if entries.is_empty() {
                continue;
            }

            let subject = format!(
                "Error digest: {} alert{}",
                entries.len(),
                if entries.len() == 1 { "" } else { "s" }
            );
            let body = compose_digest_body(&entries);

            match self.email.send_digest(&member.email, &subject, &body).await {
                Ok(()) => {
                    let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
                    self.store.mark_digest_entries_processed(&ids, now).await?;
                    self.store.set_member_digest_sent(member_id, now).await?;
                    info!(member = %member.email, entries = ids.len(), "digest sent");
                    report.sent += 1;
                }
                Err(err) => {
                    warn!(member = %member.email, error = err.message(), "digest send failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// One section per rule, oldest alerts first, enrichment preserved from
/// dispatch time.
fn compose_digest_body(entries: &[DigestEntry]) -> String {
    let mut by_rule: BTreeMap<String, Vec<&DigestEntry>> = BTreeMap::new();
    for entry in entries {
        let rule_name = entry
            .alert
            .get("ruleName")
            .and_then(|v| v.as_str())
            .unwrap_or("(deleted rule)")
            .to_string();
        by_rule.entry(rule_name).or_default().push(entry);
    }

    let mut body = String::from("Alerts accumulated since your last digest:\n");
    for (rule_name, rule_entries) in by_rule {
        body.push_str(&format!("\n== {rule_name} ==\n"));
        for entry in rule_entries {
            match serde_json::from_value::<AlertSnapshot>(entry.alert.clone()) {
                Ok(alert) => {
                    body.push_str(&format!(
                        "  - {} ({} occurrences, {})\n    {}\n",
                        alert.message, alert.count, alert.environment,
                        alert.enrichment.why_it_matters
                    ));
                }
                Err(_) => {
                    body.push_str(&format!("  - alert recorded at {}\n", entry.created_at));
                }
            }
        }
    }
    body
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
