use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use vg_alerts::Evaluation;
use vg_core::types::{
    AlertRule, ChannelKind, ChannelSpec, DeliveryMode, DigestEntry, Project, TeamMember,
};
use vg_harness::backoff::{AttemptError, RetryPolicy};
use vg_pipeline::IngestedEvent;
use vg_store::{Store, StoreError};

use crate::alert::AlertSnapshot;
use crate::channels::{ChannelPreview, EmailChannel, HttpChannelSet};
use crate::enrich::build_snapshot;
use crate::quiet::in_quiet_hours;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOutcome {
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub target: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct DispatchResult {
    pub suppressed_by_cooldown: bool,
    /// Member emails that received an immediate delivery.
    pub immediate: Vec<String>,
    /// Member emails deferred into digest entries.
    pub queued_for_digest: Vec<String>,
    pub channels: Vec<ChannelOutcome>,
}

struct ChannelTaskResult {
    outcome: ChannelOutcome,
    immediate: Vec<String>,
    queued: Vec<String>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Fans a triggered rule out to its channels.
///
/// Cooldown state is authoritative in the store and re-read here, inside
/// the dispatch critical section. Channels run as independent tasks; one
/// failing channel never blocks the others, and delivery is at-least-once
/// per channel per cooldown period.
pub struct Dispatcher {
    store: Arc<Store>,
    http: Arc<HttpChannelSet>,
    email: Arc<EmailChannel>,
    retry: RetryPolicy,
    /// Per-member digest backlog bound; beyond it new entries are dropped.
    max_digest_backlog: u64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        http: HttpChannelSet,
        email: EmailChannel,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            http: Arc::new(http),
            email: Arc::new(email),
            retry,
            max_digest_backlog: 1000,
        }
    }

    pub fn with_max_digest_backlog(mut self, bound: u64) -> Self {
        self.max_digest_backlog = bound.max(1);
        self
    }

    fn cooldown_key(rule_id: Uuid, fingerprint: &str, environment: &str) -> String {
        format!("{rule_id}:{fingerprint}:{environment}")
    }

    /// Render what each channel of a rule would send, without sending.
    pub fn preview_channel(&self, snapshot: &AlertSnapshot, spec: &ChannelSpec) -> ChannelPreview {
        match spec.kind {
            ChannelKind::Email => self.email.preview(snapshot),
            kind => self
                .http
                .adapter(kind)
                .map(|adapter| adapter.preview(snapshot, spec))
                .unwrap_or_default(),
        }
    }

    /// Build the enriched snapshot for a triggered evaluation. Shared by
    /// dispatch and the rule-test endpoint.
    pub async fn snapshot(
        &self,
        project: &Project,
        rule: &AlertRule,
        event: &IngestedEvent,
        evaluation: &Evaluation,
    ) -> Result<AlertSnapshot, StoreError> {
        build_snapshot(&self.store, project, rule, event, evaluation).await
    }

    pub async fn dispatch(
        &self,
        project: &Project,
        rule: &AlertRule,
        event: &IngestedEvent,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<DispatchResult, StoreError> {
        if !evaluation.triggered {
            return Ok(DispatchResult::default());
        }

        // Cooldown gate, re-read from the store on every dispatch.
        let key = Self::cooldown_key(rule.id, &event.fingerprint, &event.environment);
        if let Some(last_fire) = self.store.cooldown_last_fire(&key).await? {
            if last_fire + Duration::minutes(evaluation.cooldown_minutes) > now {
                info!(rule = %rule.id, fingerprint = %event.fingerprint, "suppressed by cooldown");
                return Ok(DispatchResult {
                    suppressed_by_cooldown: true,
                    ..DispatchResult::default()
                });
            }
        }

        let snapshot = self.snapshot(project, rule, event, evaluation).await?;

        let mut tasks: JoinSet<ChannelTaskResult> = JoinSet::new();
        for spec in rule.channels.clone() {
            let snapshot = snapshot.clone();
            let store = self.store.clone();
            let http = self.http.clone();
            let email = self.email.clone();
            let retry = self.retry.clone();
            let max_backlog = self.max_digest_backlog;
            tasks.spawn(async move {
                match spec.kind {
                    ChannelKind::Email => {
                        deliver_email_channel(store, email, retry, spec, snapshot, now, max_backlog)
                            .await
                    }
                    kind => {
                        let result = retry
                            .run(kind.as_str(), || {
                                let snapshot = snapshot.clone();
                                let spec = spec.clone();
                                let http = http.clone();
                                async move {
                                    match http.adapter(kind) {
                                        Some(adapter) => adapter.send(&snapshot, &spec).await,
                                        None => Err(AttemptError::Permanent(format!(
                                            "unsupported channel {}",
                                            kind.as_str()
                                        ))),
                                    }
                                }
                            })
                            .await;
                        ChannelTaskResult {
                            outcome: ChannelOutcome {
                                kind,
                                target: spec.target,
                                delivered: result.is_ok(),
                                error: result.err().map(|e| e.message().to_string()),
                            },
                            immediate: Vec::new(),
                            queued: Vec::new(),
                        }
                    }
                }
            });
        }

        let mut result = DispatchResult::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(task) => {
                    result.immediate.extend(task.immediate);
                    result.queued_for_digest.extend(task.queued);
                    result.channels.push(task.outcome);
                }
                Err(err) => warn!(error = %err, "channel task panicked"),
            }
        }

        let first_error = result
            .channels
            .iter()
            .find_map(|c| c.error.as_ref())
            .cloned();
        match &first_error {
            Some(message) => {
                self.store
                    .set_rule_last_error(rule.id, Some(message.clone()))
                    .await?
            }
            None => self.store.set_rule_last_error(rule.id, None).await?,
        }

        // The fire time is recorded only once something was actually
        // handed off, so a fully failed dispatch retries on the next event.
        let delivered_any = result.channels.iter().any(|c| c.delivered);
        if delivered_any {
            self.store.record_cooldown_fire(&key, now).await?;
        }

        Ok(result)
    }
}

/// Expand an email channel to team members and apply per-member preference
/// logic: quiet hours and digest mode defer to a digest entry, everyone
/// else gets an immediate send. Immediate sends that exhaust their retry
/// budget are shed to the member's digest rather than dropped.
async fn deliver_email_channel(
    store: Arc<Store>,
    email: Arc<EmailChannel>,
    retry: RetryPolicy,
    spec: ChannelSpec,
    snapshot: AlertSnapshot,
    now: DateTime<Utc>,
    max_backlog: u64,
) -> ChannelTaskResult {
    let targets: Vec<String> = spec
        .target
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let members = match store.members_by_emails(snapshot.project_id, &targets).await {
        Ok(members) => members,
        Err(err) => {
            return ChannelTaskResult {
                outcome: ChannelOutcome {
                    kind: ChannelKind::Email,
                    target: spec.target,
                    delivered: false,
                    error: Some(err.to_string()),
                },
                immediate: Vec::new(),
                queued: Vec::new(),
            };
        }
    };

    if members.is_empty() {
        return ChannelTaskResult {
            outcome: ChannelOutcome {
                kind: ChannelKind::Email,
                target: spec.target,
                delivered: false,
                error: Some("no matching active team members".to_string()),
            },
            immediate: Vec::new(),
            queued: Vec::new(),
        };
    }

    let mut immediate = Vec::new();
    let mut queued = Vec::new();
    let mut error = None;

    for member in members {
        let prefs = &member.alert_preferences.email;
        let deferred =
            in_quiet_hours(&prefs.quiet_hours, now) || prefs.mode == DeliveryMode::Digest;

        if deferred {
            match enqueue_digest(&store, &member, &snapshot, now, max_backlog).await {
                Ok(true) => queued.push(member.email.clone()),
                Ok(false) => {}
                Err(err) => error = Some(err.to_string()),
            }
            continue;
        }

        match retry
            .run("email", || {
                let email = email.clone();
                let snapshot = snapshot.clone();
                let to = member.email.clone();
                async move { email.send_alert(&to, &snapshot).await }
            })
            .await
        {
            Ok(()) => immediate.push(member.email.clone()),
            Err(AttemptError::Transient(message)) => {
                warn!(member = %member.email, error = %message, "shedding failed email to digest");
                match enqueue_digest(&store, &member, &snapshot, now, max_backlog).await {
                    Ok(true) => queued.push(member.email.clone()),
                    Ok(false) => {}
                    Err(err) => error = Some(err.to_string()),
                }
            }
            Err(AttemptError::Permanent(message)) => error = Some(message),
        }
    }

    ChannelTaskResult {
        outcome: ChannelOutcome {
            kind: ChannelKind::Email,
            target: spec.target,
            delivered: !immediate.is_empty() || !queued.is_empty(),
            error,
        },
        immediate,
        queued,
    }
}

/// Returns `false` when the member's backlog is at its bound and the entry
/// was dropped instead of queued.
async fn enqueue_digest(
    store: &Store,
    member: &TeamMember,
    snapshot: &AlertSnapshot,
    now: DateTime<Utc>,
    max_backlog: u64,
) -> Result<bool, StoreError> {
    let pending = store.count_pending_digest_entries(member.id).await?;
    if pending >= max_backlog {
        warn!(
            member = %member.email,
            pending,
            "digest backlog at bound, dropping alert entry"
        );
        return Ok(false);
    }
    store
        .insert_digest_entry(&DigestEntry {
            id: Uuid::new_v4(),
            project_id: snapshot.project_id,
            member_id: member.id,
            rule_id: snapshot.rule_id,
            alert: serde_json::to_value(snapshot)
                .unwrap_or(serde_json::Value::Null),
            created_at: now,
            processed: false,
            processed_at: None,
        })
        .await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use vg_alerts::TriggerReason;
    use vg_core::config::IngestConfig;
    use vg_core::types::{QuietHours, RuleConditions, Severity};
    use vg_pipeline::{IngestPipeline, IngestReply, RawEvent};

    use crate::channels::MemorySmtp;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: StdDuration::from_secs(1),
            total_budget: StdDuration::from_secs(2),
            max_attempts: 1,
            base_delay: StdDuration::from_millis(1),
        }
    }

    struct Fixture {
        store: Arc<Store>,
        smtp: Arc<MemorySmtp>,
        dispatcher: Dispatcher,
        project: Project,
        event: IngestedEvent,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let project = Project::new("api", "hash".into(), "preview1".into());
        store.upsert_project(&project).await.unwrap();

        let pipeline = IngestPipeline::new(store.clone(), IngestConfig::default());
        let reply = pipeline
            .ingest(
                &project,
                RawEvent {
                    message: Some("boom".into()),
                    environment: Some("production".into()),
                    ..RawEvent::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let IngestReply::Created(event) = reply else {
            panic!("expected created");
        };

        let smtp = MemorySmtp::new();
        let dispatcher = Dispatcher::new(
            store.clone(),
            HttpChannelSet::new(reqwest::Client::new()),
            EmailChannel::new(smtp.clone()),
            fast_retry(),
        );
        Fixture {
            store,
            smtp,
            dispatcher,
            project,
            event,
        }
    }

    fn email_rule(project_id: Uuid, target: &str) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            project_id,
            name: "notify".into(),
            enabled: true,
            cooldown_minutes: 30,
            conditions: RuleConditions::NewError {},
            environments: vec![],
            filter: None,
            channels: vec![ChannelSpec {
                kind: ChannelKind::Email,
                target: target.into(),
                options: serde_json::Value::Null,
            }],
            last_error_message: None,
            created_at: Utc::now(),
        }
    }

    fn triggered() -> Evaluation {
        Evaluation {
            triggered: true,
            reason: Some(TriggerReason::NewError),
            context: serde_json::Value::Null,
            cooldown_minutes: 30,
        }
    }

    #[tokio::test]
    async fn immediate_email_delivery_records_cooldown() {
        let f = fixture().await;
        let member = TeamMember::new(f.project.id, "Alice", "alice@example.com");
        f.store.upsert_member(&member).await.unwrap();
        let rule = email_rule(f.project.id, "alice@example.com");
        f.store.upsert_rule(&rule).await.unwrap();

        let now = Utc::now();
        let result = f
            .dispatcher
            .dispatch(&f.project, &rule, &f.event, &triggered(), now)
            .await
            .unwrap();

        assert_eq!(result.immediate, vec!["alice@example.com"]);
        assert!(result.queued_for_digest.is_empty());
        assert_eq!(f.smtp.sent_count().await, 1);

        let key = Dispatcher::cooldown_key(rule.id, &f.event.fingerprint, "production");
        assert!(f.store.cooldown_last_fire(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_dispatch_within_cooldown_is_suppressed() {
        let f = fixture().await;
        let member = TeamMember::new(f.project.id, "Alice", "alice@example.com");
        f.store.upsert_member(&member).await.unwrap();
        let rule = email_rule(f.project.id, "alice@example.com");
        f.store.upsert_rule(&rule).await.unwrap();

        let now = Utc::now();
        f.dispatcher
            .dispatch(&f.project, &rule, &f.event, &triggered(), now)
            .await
            .unwrap();

        let again = f
            .dispatcher
            .dispatch(
                &f.project,
                &rule,
                &f.event,
                &triggered(),
                now + Duration::seconds(30),
            )
            .await
            .unwrap();
        assert!(again.suppressed_by_cooldown);
        assert_eq!(f.smtp.sent_count().await, 1);

        // Past the cooldown the rule fires again.
        let later = f
            .dispatcher
            .dispatch(
                &f.project,
                &rule,
                &f.event,
                &triggered(),
                now + Duration::minutes(31),
            )
            .await
            .unwrap();
        assert!(!later.suppressed_by_cooldown);
        assert_eq!(f.smtp.sent_count().await, 2);
    }

    #[tokio::test]
    async fn quiet_hours_member_is_queued_for_digest() {
        let f = fixture().await;
        let mut member = TeamMember::new(f.project.id, "Alice", "alice@example.com");
        member.alert_preferences.email.quiet_hours = QuietHours {
            enabled: true,
            start: "22:00".into(),
            end: "07:00".into(),
            timezone: "UTC".into(),
        };
        f.store.upsert_member(&member).await.unwrap();
        let rule = email_rule(f.project.id, "alice@example.com");
        f.store.upsert_rule(&rule).await.unwrap();

        // 23:30 UTC, inside the window.
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 8, 1, 23, 30, 0).unwrap();
        let result = f
            .dispatcher
            .dispatch(&f.project, &rule, &f.event, &triggered(), now)
            .await
            .unwrap();

        assert!(result.immediate.is_empty());
        assert_eq!(result.queued_for_digest, vec!["alice@example.com"]);
        assert_eq!(f.smtp.sent_count().await, 0);

        let entries = f.store.pending_digest_entries(member.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].processed);
    }

    #[tokio::test]
    async fn digest_mode_member_is_always_deferred() {
        let f = fixture().await;
        let mut member = TeamMember::new(f.project.id, "Alice", "alice@example.com");
        member.alert_preferences.email.mode = DeliveryMode::Digest;
        f.store.upsert_member(&member).await.unwrap();
        let rule = email_rule(f.project.id, "alice@example.com");
        f.store.upsert_rule(&rule).await.unwrap();

        let result = f
            .dispatcher
            .dispatch(&f.project, &rule, &f.event, &triggered(), Utc::now())
            .await
            .unwrap();
        assert_eq!(result.queued_for_digest, vec!["alice@example.com"]);
        assert_eq!(f.smtp.sent_count().await, 0);
    }

    #[tokio::test]
    async fn failed_channel_records_error_without_blocking_email() {
        let f = fixture().await;
        let member = TeamMember::new(f.project.id, "Alice", "alice@example.com");
        f.store.upsert_member(&member).await.unwrap();
        let mut rule = email_rule(f.project.id, "alice@example.com");
        rule.channels.push(ChannelSpec {
            kind: ChannelKind::Webhook,
            target: "not-a-url".into(),
            options: serde_json::Value::Null,
        });
        f.store.upsert_rule(&rule).await.unwrap();

        let result = f
            .dispatcher
            .dispatch(&f.project, &rule, &f.event, &triggered(), Utc::now())
            .await
            .unwrap();

        // Email delivered despite the broken webhook.
        assert_eq!(result.immediate, vec!["alice@example.com"]);
        let webhook = result
            .channels
            .iter()
            .find(|c| c.kind == ChannelKind::Webhook)
            .unwrap();
        assert!(!webhook.delivered);
        assert!(webhook.error.is_some());

        let loaded = f.store.get_rule(f.project.id, rule.id).await.unwrap().unwrap();
        assert!(loaded.last_error_message.unwrap().contains("invalid target url"));
    }

    #[tokio::test]
    async fn transient_email_failure_sheds_to_digest() {
        let f = fixture().await;
        let member = TeamMember::new(f.project.id, "Alice", "alice@example.com");
        f.store.upsert_member(&member).await.unwrap();
        let rule = email_rule(f.project.id, "alice@example.com");
        f.store.upsert_rule(&rule).await.unwrap();

        f.smtp.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let result = f
            .dispatcher
            .dispatch(&f.project, &rule, &f.event, &triggered(), Utc::now())
            .await
            .unwrap();

        assert!(result.immediate.is_empty());
        assert_eq!(result.queued_for_digest, vec!["alice@example.com"]);
        assert_eq!(
            f.store.pending_digest_entries(member.id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn untriggered_evaluation_is_a_no_op() {
        let f = fixture().await;
        let rule = email_rule(f.project.id, "alice@example.com");
        let evaluation = Evaluation {
            triggered: false,
            reason: None,
            context: serde_json::Value::Null,
            cooldown_minutes: 30,
        };
        let result = f
            .dispatcher
            .dispatch(&f.project, &rule, &f.event, &evaluation, Utc::now())
            .await
            .unwrap();
        assert!(result.channels.is_empty());
        assert_eq!(f.event.severity, Severity::Error);
    }
}
