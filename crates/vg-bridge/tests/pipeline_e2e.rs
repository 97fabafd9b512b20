//! End-to-end pipeline tests: events enter through the HTTP surface and
//! come out the other side as channel deliveries or digest entries.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use vg_bridge::{api_router, ApiState};
use vg_core::config::Config;
use vg_core::keys;
use vg_core::types::{
    AlertRule, ChannelKind, ChannelSpec, DeliveryMode, Project, RuleConditions, TeamMember,
};
use vg_dispatch::{DigestFlusher, Dispatcher, EmailChannel, HttpChannelSet, MemorySmtp};
use vg_harness::backoff::RetryPolicy;
use vg_store::Store;

struct Pipeline {
    app: axum::Router,
    store: Arc<Store>,
    smtp: Arc<MemorySmtp>,
    project: Project,
    api_key: String,
}

async fn pipeline() -> Pipeline {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let generated = keys::generate_api_key();
    let project = Project::new("api", generated.hash.clone(), generated.preview.clone());
    store.upsert_project(&project).await.unwrap();

    let smtp = MemorySmtp::new();
    let retry = RetryPolicy {
        attempt_timeout: Duration::from_secs(1),
        total_budget: Duration::from_secs(2),
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
    };
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        HttpChannelSet::new(reqwest::Client::new()),
        EmailChannel::new(smtp.clone()),
        retry,
    ));

    let mut config = Config::default();
    config.auth.jwt_secret = "test-secret".into();
    let state = ApiState::with_dispatcher(store.clone(), config, dispatcher);

    Pipeline {
        app: api_router(state),
        store,
        smtp,
        project,
        api_key: generated.plaintext,
    }
}

fn ingest_request(api_key: &str, environment: &str) -> Request<Body> {
    let body = json!({
        "message": "TypeError: x of undefined",
        "stackTrace": [{ "file": "a.js", "line": 10, "function": "f" }],
        "environment": environment
    });
    Request::builder()
        .method("POST")
        .uri("/api/errors")
        .header("content-type", "application/json")
        .header("x-api-key", api_key)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn threshold_email_rule(project_id: Uuid, target: &str) -> AlertRule {
    AlertRule {
        id: Uuid::new_v4(),
        project_id,
        name: "prod threshold".into(),
        enabled: true,
        cooldown_minutes: 30,
        conditions: RuleConditions::Threshold {
            threshold: 3,
            window_minutes: 5,
        },
        environments: vec!["production".into()],
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

/// Alert evaluation runs on a detached task; poll for its effect.
async fn wait_for_sent(smtp: &MemorySmtp, expected: usize) -> usize {
    for _ in 0..100 {
        let sent = smtp.sent_count().await;
        if sent >= expected {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    smtp.sent_count().await
}

#[tokio::test]
async fn threshold_fires_on_third_event_and_cooldown_suppresses_the_fourth() {
    let p = pipeline().await;
    let member = TeamMember::new(p.project.id, "Alice", "alice@example.com");
    p.store.upsert_member(&member).await.unwrap();
    let rule = threshold_email_rule(p.project.id, "alice@example.com");
    p.store.upsert_rule(&rule).await.unwrap();

    // Two events: the window count stays below the threshold.
    for _ in 0..2 {
        let resp = p
            .app
            .clone()
            .oneshot(ingest_request(&p.api_key, "production"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p.smtp.sent_count().await, 0);

    // Third event reaches the threshold exactly and triggers one email.
    let resp = p
        .app
        .clone()
        .oneshot(ingest_request(&p.api_key, "production"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(wait_for_sent(&p.smtp, 1).await, 1);

    // Fourth event still exceeds the threshold but is inside the cooldown.
    let resp = p
        .app
        .clone()
        .oneshot(ingest_request(&p.api_key, "production"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(p.smtp.sent_count().await, 1);
}

#[tokio::test]
async fn staging_events_do_not_trigger_a_production_scoped_rule() {
    let p = pipeline().await;
    let member = TeamMember::new(p.project.id, "Alice", "alice@example.com");
    p.store.upsert_member(&member).await.unwrap();
    let rule = threshold_email_rule(p.project.id, "alice@example.com");
    p.store.upsert_rule(&rule).await.unwrap();

    for _ in 0..5 {
        let resp = p
            .app
            .clone()
            .oneshot(ingest_request(&p.api_key, "staging"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(p.smtp.sent_count().await, 0);
}

#[tokio::test]
async fn digest_mode_member_accumulates_then_flushes_once() {
    let p = pipeline().await;
    let mut member = TeamMember::new(p.project.id, "Alice", "alice@example.com");
    member.alert_preferences.email.mode = DeliveryMode::Digest;
    p.store.upsert_member(&member).await.unwrap();

    let mut rule = threshold_email_rule(p.project.id, "alice@example.com");
    rule.conditions = RuleConditions::NewError {};
    p.store.upsert_rule(&rule).await.unwrap();

    let resp = p
        .app
        .clone()
        .oneshot(ingest_request(&p.api_key, "production"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    // The alert lands in the digest queue, not the inbox.
    for _ in 0..100 {
        if !p
            .store
            .pending_digest_entries(member.id)
            .await
            .unwrap()
            .is_empty()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let entries = p.store.pending_digest_entries(member.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(p.smtp.sent_count().await, 0);

    // The flusher drains it exactly once.
    let flusher = DigestFlusher::new(
        p.store.clone(),
        Arc::new(EmailChannel::new(p.smtp.clone())),
    );
    let report = flusher.flush(Utc::now()).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(p.smtp.sent_count().await, 1);
    assert!(p
        .store
        .pending_digest_entries(member.id)
        .await
        .unwrap()
        .is_empty());

    let again = flusher.flush(Utc::now()).await.unwrap();
    assert_eq!(again.sent, 0);
    assert_eq!(p.smtp.sent_count().await, 1);
}

#[tokio::test]
async fn new_error_rule_fires_only_for_the_first_occurrence() {
    let p = pipeline().await;
    let member = TeamMember::new(p.project.id, "Alice", "alice@example.com");
    p.store.upsert_member(&member).await.unwrap();
    let mut rule = threshold_email_rule(p.project.id, "alice@example.com");
    rule.conditions = RuleConditions::NewError {};
    rule.cooldown_minutes = 0;
    p.store.upsert_rule(&rule).await.unwrap();

    p.app
        .clone()
        .oneshot(ingest_request(&p.api_key, "production"))
        .await
        .unwrap();
    assert_eq!(wait_for_sent(&p.smtp, 1).await, 1);

    // Repeats of the same fingerprint are not new.
    for _ in 0..3 {
        p.app
            .clone()
            .oneshot(ingest_request(&p.api_key, "production"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(p.smtp.sent_count().await, 1);
}
