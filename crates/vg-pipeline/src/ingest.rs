use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use vg_core::config::IngestConfig;
use vg_core::types::{Project, Severity};
use vg_store::{IngestOutcome, NewOccurrence, Store, StoreError};

use crate::fingerprint::fingerprint;
use crate::scrub::Scrubber;
use crate::validate::{validate, RawEvent, ValidationFailure};

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What the rest of the system needs to know about a persisted event; the
/// alert engine and dispatcher work from this, never from the raw payload.
#[derive(Debug, Clone)]
pub struct IngestedEvent {
    pub project_id: Uuid,
    pub error_id: Uuid,
    pub fingerprint: String,
    pub environment: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub is_new: bool,
    pub count: i64,
    pub message: String,
    pub user_segment: Option<String>,
    pub source_file: Option<String>,
}

#[derive(Debug)]
pub enum IngestReply {
    /// Persisted; the event should flow on to alert evaluation.
    Created(IngestedEvent),
    /// Degraded mode: the store was transiently unavailable and the event
    /// was dropped after logging. The client still gets a 202.
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] ValidationFailure),
    /// A permanent store fault; surfaces as 500.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// IngestPipeline
// ---------------------------------------------------------------------------

/// validate -> scrub -> fingerprint -> atomic upsert.
pub struct IngestPipeline {
    store: Arc<Store>,
    cfg: IngestConfig,
}

impl IngestPipeline {
    pub fn new(store: Arc<Store>, cfg: IngestConfig) -> Self {
        Self { store, cfg }
    }

    pub async fn ingest(
        &self,
        project: &Project,
        raw: RawEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestReply, IngestError> {
        let mut event = validate(raw, &self.cfg, now)?;

        // Scrub before fingerprinting so the hash cannot leak PII.
        let scrubber = Scrubber::new(project.scrub_policy);
        event.message = scrubber.scrub_text(&event.message);
        scrubber.scrub_frames(&mut event.stack_trace);
        scrubber.scrub_user_context(&mut event.user_context);
        scrubber.scrub_metadata(&mut event.metadata);

        let severity_input = self
            .cfg
            .fingerprint_includes_severity
            .then(|| event.severity.as_str());
        let fingerprint = fingerprint(
            &event.message,
            &event.stack_trace,
            &event.environment,
            severity_input,
            self.cfg.fingerprint_frames,
        );

        let user_segment = event.user_context.segment.clone();
        let source_file = event
            .stack_trace
            .iter()
            .find(|f| f.in_app)
            .map(|f| f.file.clone());

        let occurrence = NewOccurrence {
            project_id: project.id,
            fingerprint: fingerprint.clone(),
            timestamp: event.timestamp,
            message: event.message.clone(),
            stack_trace: event.stack_trace,
            user_context: event.user_context,
            metadata: event.metadata,
            environment: event.environment.clone(),
            severity: event.severity,
            session_id: event.session_id,
        };

        match self.store.ingest_event(occurrence).await {
            Ok(IngestOutcome {
                error_id,
                count,
                is_new,
                ..
            }) => Ok(IngestReply::Created(IngestedEvent {
                project_id: project.id,
                error_id,
                fingerprint,
                environment: event.environment,
                severity: event.severity,
                timestamp: event.timestamp,
                is_new,
                count,
                message: event.message,
                user_segment,
                source_file,
            })),
            Err(err) if err.is_transient() => {
                warn!(
                    project_id = %project.id,
                    fingerprint,
                    error = %err,
                    "store unavailable, dropping event after best-effort accept"
                );
                Ok(IngestReply::Dropped)
            }
            Err(err) => Err(err.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
