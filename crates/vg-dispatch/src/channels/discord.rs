use async_trait::async_trait;

use vg_core::types::{ChannelKind, ChannelSpec, Severity};
use vg_harness::backoff::AttemptError;

use crate::alert::AlertSnapshot;
use crate::channels::{post_json, ChannelAdapter, ChannelPreview};

/// Discord webhook adapter: `content` plus a single embed.
pub struct DiscordChannel {
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn color(severity: Severity) -> u32 {
        match severity {
            Severity::Critical => 0xE11D48,
            Severity::Error => 0xF97316,
            Severity::Warning => 0xEAB308,
            Severity::Info => 0x3B82F6,
        }
    }

    fn payload(alert: &AlertSnapshot) -> serde_json::Value {
        serde_json::json!({
            "content": alert.headline(),
            "embeds": [{
                "title": alert.rule_name,
                "description": alert.message,
                "color": Self::color(alert.severity),
                "fields": [
                    { "name": "Environment", "value": alert.environment, "inline": true },
                    { "name": "Occurrences", "value": alert.count.to_string(), "inline": true },
                    { "name": "Why it matters", "value": alert.enrichment.why_it_matters }
                ]
            }]
        })
    }
}

#[async_trait]
impl ChannelAdapter for DiscordChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Discord
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
