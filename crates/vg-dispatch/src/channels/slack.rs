use async_trait::async_trait;

use vg_core::types::{ChannelKind, ChannelSpec};
use vg_harness::backoff::AttemptError;

use crate::alert::AlertSnapshot;
use crate::channels::{post_json, ChannelAdapter, ChannelPreview};

/// Slack incoming-webhook adapter: plain `text` plus block kit sections.
pub struct SlackChannel {
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn payload(alert: &AlertSnapshot) -> serde_json::Value {
        let mut detail = format!(
            "*Project:* {}\n*Environment:* {}\n*Occurrences:* {}",
            alert.project_name, alert.environment, alert.count
        );
        if !alert.enrichment.recent_deployments.is_empty() {
            let labels: Vec<&str> = alert
                .enrichment
                .recent_deployments
                .iter()
                .map(|d| d.label.as_str())
                .collect();
            detail.push_str(&format!("\n*Recent deploys:* {}", labels.join(", ")));
        }
        serde_json::json!({
            "text": alert.headline(),
            "blocks": [
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": format!("*{}*", alert.headline()) }
                },
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": detail }
                },
                {
                    "type": "context",
                    "elements": [{
                        "type": "mrkdwn",
                        "text": alert.enrichment.why_it_matters.clone()
                    }]
                }
            ]
        })
    }
}

#[async_trait]
impl ChannelAdapter for SlackChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    fn preview(&self, alert: &AlertSnapshot, _spec: &ChannelSpec) -> ChannelPreview {
        let payload = Self::payload(alert);
        ChannelPreview {
            text: payload["text"].as_str().map(|s| s.to_string()),
            blocks: Some(payload["blocks"].clone()),
            ..ChannelPreview::default()
        }
    }

    async fn send(&self, alert: &AlertSnapshot, spec: &ChannelSpec) -> Result<(), AttemptError> {
        post_json(&self.client, &spec.target, &Self::payload(alert)).await
    }
}
