use chrono::Duration;

use vg_alerts::{Evaluation, TriggerReason};
use vg_core::types::{AlertRule, Project, Severity};
use vg_pipeline::IngestedEvent;
use vg_store::{Store, StoreError};

use crate::alert::{AlertSnapshot, DeploymentRef, Enrichment, SimilarIncident};

/// Deployments within this window around the event are considered related.
const DEPLOYMENT_WINDOW_HOURS: i64 = 2;
const MAX_DEPLOYMENTS: u32 = 5;
const MAX_SIMILAR: u32 = 5;

/// Assemble the full alert snapshot for a triggered rule: the event facts
/// plus deployment context, similar incidents, and guidance text.
pub async fn build_snapshot(
    store: &Store,
    project: &Project,
    rule: &AlertRule,
    event: &IngestedEvent,
    evaluation: &Evaluation,
) -> Result<AlertSnapshot, StoreError> {
    let window = Duration::hours(DEPLOYMENT_WINDOW_HOURS);
    let deployments = store
        .deployments_in_window(
            project.id,
            event.timestamp - window,
            event.timestamp + window,
            MAX_DEPLOYMENTS,
        )
        .await?;

    let similar = store
        .recent_occurrences(event.error_id, MAX_SIMILAR)
        .await?;

    let reason = evaluation.reason.unwrap_or(TriggerReason::NewError);

    Ok(AlertSnapshot {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        rule_type: rule.conditions.type_name().to_string(),
        project_id: project.id,
        project_name: project.name.clone(),
        error_id: event.error_id,
        fingerprint: event.fingerprint.clone(),
        message: event.message.clone(),
        environment: event.environment.clone(),
        severity: event.severity,
        count: event.count,
        reason,
        context: evaluation.context.clone(),
        triggered_at: event.timestamp,
        enrichment: Enrichment {
            recent_deployments: deployments
                .into_iter()
                .map(|d| DeploymentRef {
                    label: d.label,
                    timestamp: d.timestamp,
                })
                .collect(),
            similar_incidents: similar
                .into_iter()
                .map(|o| SimilarIncident {
                    timestamp: o.timestamp,
                    message: o.message,
                    environment: o.environment,
                })
                .collect(),
            why_it_matters: why_it_matters(event),
            next_steps: next_steps(event, reason),
        },
    })
}

fn why_it_matters(event: &IngestedEvent) -> String {
    let mut parts = Vec::new();
    match event.severity {
        Severity::Critical => parts.push("Critical-severity failure".to_string()),
        Severity::Error => parts.push("Unhandled error".to_string()),
        Severity::Warning => parts.push("Recurring warning".to_string()),
        Severity::Info => parts.push("Informational signal".to_string()),
    }
    if event.environment == "production" {
        parts.push("affecting production traffic".to_string());
    } else {
        parts.push(format!("in the {} environment", event.environment));
    }
    if let Some(segment) = &event.user_segment {
        parts.push(format!("seen in the {segment} user segment"));
    }
    parts.push(format!("{} occurrences so far", event.count));
    parts.join(", ")
}

fn next_steps(event: &IngestedEvent, reason: TriggerReason) -> Vec<String> {
    let mut steps = Vec::new();
    match reason {
        TriggerReason::NewError => {
            steps.push("Triage the new group and set its status".to_string());
        }
        TriggerReason::ThresholdExceeded | TriggerReason::SpikeDetected => {
            steps.push("Check whether occurrence volume is still climbing".to_string());
        }
        TriggerReason::CriticalSeverity | TriggerReason::CriticalFingerprint => {
            steps.push("Page the on-call owner for this service".to_string());
        }
    }
    if let Some(file) = &event.source_file {
        steps.push(format!("Inspect {file} around the failing frame"));
    }
    steps.push("Compare against recent deployments for a correlated rollout".to_string());
    steps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;
    use vg_core::config::IngestConfig;
    use vg_core::types::{Deployment, RuleConditions};
    use vg_pipeline::{IngestPipeline, IngestReply, RawEvent};

    async fn seeded() -> (Arc<Store>, Project, IngestedEvent) {
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
        (store, project, event)
    }

    fn rule(project_id: Uuid) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            project_id,
            name: "new errors".into(),
            enabled: true,
            cooldown_minutes: 30,
            conditions: RuleConditions::NewError {},
            environments: vec![],
            filter: None,
            channels: vec![],
            last_error_message: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_carries_deployments_in_window() {
        let (store, project, event) = seeded().await;
        store
            .insert_deployment(&Deployment {
                id: Uuid::new_v4(),
                project_id: project.id,
                label: "v2.1.0".into(),
                timestamp: event.timestamp - Duration::minutes(30),
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap();
        store
            .insert_deployment(&Deployment {
                id: Uuid::new_v4(),
                project_id: project.id,
                label: "v1.0.0".into(),
                timestamp: event.timestamp - Duration::days(3),
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let evaluation = Evaluation {
            triggered: true,
            reason: Some(TriggerReason::NewError),
            context: serde_json::Value::Null,
            cooldown_minutes: 30,
        };
        let snapshot = build_snapshot(&store, &project, &rule(project.id), &event, &evaluation)
            .await
            .unwrap();

        let labels: Vec<&str> = snapshot
            .enrichment
            .recent_deployments
            .iter()
            .map(|d| d.label.as_str())
            .collect();
        assert_eq!(labels, vec!["v2.1.0"]);
        assert_eq!(snapshot.enrichment.similar_incidents.len(), 1);
        assert!(snapshot
            .enrichment
            .why_it_matters
            .contains("production traffic"));
        assert!(!snapshot.enrichment.next_steps.is_empty());
    }
}
