use async_trait::async_trait;

use vg_core::types::{ChannelKind, ChannelSpec, Severity};
use vg_harness::backoff::AttemptError;

use crate::alert::AlertSnapshot;
use crate::channels::{post_json, ChannelAdapter, ChannelPreview};

/// Microsoft Teams connector adapter (MessageCard payload).
pub struct TeamsChannel {
    client: reqwest::Client,
}

impl TeamsChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn theme_color(severity: Severity) -> &'static str {
        match severity {
            Severity::Critical => "E11D48",
            Severity::Error => "F97316",
            Severity::Warning => "EAB308",
            Severity::Info => "3B82F6",
        }
    }

    fn payload(alert: &AlertSnapshot) -> serde_json::Value {
        serde_json::json!({
            "@type": "MessageCard",
            "@context": "http://schema.org/extensions",
            "summary": alert.headline(),
            "themeColor": Self::theme_color(alert.severity),
            "title": alert.rule_name,
            "sections": [{
                "activityTitle": alert.headline(),
                "facts": [
                    { "name": "Project", "value": alert.project_name },
                    { "name": "Environment", "value": alert.environment },
                    { "name": "Occurrences", "value": alert.count.to_string() }
                ],
                "text": alert.enrichment.why_it_matters
            }]
        })
    }
}

#[async_trait]
impl ChannelAdapter for TeamsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Teams
    }

    fn preview(&self, alert: &AlertSnapshot, _spec: &ChannelSpec) -> ChannelPreview {
        ChannelPreview {
            message: Some(Self::payload(alert)),
            ..ChannelPreview::default()
        }
    }

    async fn send(&self, alert: &AlertSnapshot, spec: &ChannelSpec) -> Result<(), AttemptError> {
        post_json(&self.client, &spec.target, &Self::payload(alert)).await
    }
}
