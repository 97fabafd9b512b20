use async_trait::async_trait;

use vg_core::types::{ChannelKind, ChannelSpec};
use vg_harness::backoff::AttemptError;

use crate::alert::AlertSnapshot;
use crate::channels::{post_json, ChannelAdapter, ChannelPreview};

/// Generic webhook adapter: posts the full alert snapshot as JSON, so
/// downstream automation gets everything the other channels render.
pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn payload(alert: &AlertSnapshot) -> serde_json::Value {
        serde_json::json!({
            "event": "alert.triggered",
            "alert": alert,
        })
    }
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
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
