use async_trait::async_trait;
use serde::Serialize;

use vg_core::types::{ChannelKind, ChannelSpec};
use vg_harness::backoff::AttemptError;

use crate::alert::AlertSnapshot;

pub mod discord;
pub mod email;
pub mod slack;
pub mod teams;
pub mod webhook;

pub use email::{EmailChannel, MemorySmtp, SmtpSender, SmtpTransportSender};

// ---------------------------------------------------------------------------
// Adapter capability
// ---------------------------------------------------------------------------

/// What a channel would deliver, without delivering it. The rule-test
/// endpoint renders these for every configured channel.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
}

/// A URL-addressed channel: one post per triggered rule, no per-member
/// expansion. Email is handled separately because it fans out to members.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;
    fn preview(&self, alert: &AlertSnapshot, spec: &ChannelSpec) -> ChannelPreview;
    async fn send(&self, alert: &AlertSnapshot, spec: &ChannelSpec) -> Result<(), AttemptError>;
}

/// The four HTTP adapters behind one lookup.
pub struct HttpChannelSet {
    slack: slack::SlackChannel,
    discord: discord::DiscordChannel,
    teams: teams::TeamsChannel,
    webhook: webhook::WebhookChannel,
}

impl HttpChannelSet {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            slack: slack::SlackChannel::new(client.clone()),
            discord: discord::DiscordChannel::new(client.clone()),
            teams: teams::TeamsChannel::new(client.clone()),
            webhook: webhook::WebhookChannel::new(client),
        }
    }

    /// `None` for email, which does not go through this set.
    pub fn adapter(&self, kind: ChannelKind) -> Option<&dyn ChannelAdapter> {
        match kind {
            ChannelKind::Slack => Some(&self.slack),
            ChannelKind::Discord => Some(&self.discord),
            ChannelKind::Teams => Some(&self.teams),
            ChannelKind::Webhook => Some(&self.webhook),
            ChannelKind::Email => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP delivery
// ---------------------------------------------------------------------------

/// POST a JSON payload, classifying the response for the retry loop:
/// network faults and 5xx are transient, other non-2xx are permanent.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
) -> Result<(), AttemptError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(AttemptError::Permanent(format!("invalid target url: {url}")));
    }
    let response = client
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() {
        Err(AttemptError::Transient(format!("upstream returned {status}")))
    } else {
        Err(AttemptError::Permanent(format!("upstream returned {status}")))
    }
}
