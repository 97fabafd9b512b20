use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vg_alerts::TriggerReason;
use vg_core::types::Severity;

/// A deployment reference carried inside an alert, by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRef {
    pub label: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarIncident {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub environment: String,
}

/// Context attached to an alert before rendering.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub recent_deployments: Vec<DeploymentRef>,
    pub similar_incidents: Vec<SimilarIncident>,
    pub why_it_matters: String,
    pub next_steps: Vec<String>,
}

/// Everything a channel needs to render one alert.
///
/// This is a snapshot by value: digest entries keep a serialized copy, so
/// an alert stays renderable even if its rule is edited or deleted later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSnapshot {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub rule_type: String,
    pub project_id: Uuid,
    pub project_name: String,
    pub error_id: Uuid,
    pub fingerprint: String,
    pub message: String,
    pub environment: String,
    pub severity: Severity,
    pub count: i64,
    pub reason: TriggerReason,
    pub context: serde_json::Value,
    pub triggered_at: DateTime<Utc>,
    pub enrichment: Enrichment,
}

impl AlertSnapshot {
    /// Short one-line headline shared by all channel renderings.
    pub fn headline(&self) -> String {
        format!(
            "[{}] {} in {}: {}",
            self.severity.as_str(),
            self.rule_name,
            self.environment,
            self.message
        )
    }
}
