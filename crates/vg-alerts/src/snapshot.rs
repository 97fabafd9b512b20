use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use vg_core::types::{AlertRule, RuleConditions};
use vg_pipeline::IngestedEvent;
use vg_store::{Store, StoreError};

use crate::engine::RuleMetrics;

/// Cache key for one count query within a single evaluation cycle.
type CountKey = (i64, i64, Option<String>);

/// Builds [`RuleMetrics`] for every enabled rule of a project against one
/// event, memoizing count queries so N rules sharing a window shape cost
/// one store hit instead of N.
pub struct SnapshotBuilder<'a> {
    store: &'a Store,
    event: &'a IngestedEvent,
    now: DateTime<Utc>,
    counts: HashMap<CountKey, u64>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(store: &'a Store, event: &'a IngestedEvent, now: DateTime<Utc>) -> Self {
        Self {
            store,
            event,
            now,
            counts: HashMap::new(),
        }
    }

    pub async fn metrics_for(&mut self, rule: &AlertRule) -> Result<RuleMetrics, StoreError> {
        // A rule restricted to environments counts within the event's
        // environment; an unrestricted rule counts across all of them.
        let env_scope = if rule.environments.is_empty() {
            None
        } else {
            Some(self.event.environment.clone())
        };

        match &rule.conditions {
            RuleConditions::Threshold { window_minutes, .. } => {
                let window_count = self
                    .count(*window_minutes, 0, env_scope)
                    .await?;
                Ok(RuleMetrics {
                    window_count,
                    window_minutes: *window_minutes,
                    is_new: self.event.is_new,
                    ..RuleMetrics::default()
                })
            }
            RuleConditions::Spike {
                window_minutes,
                baseline_minutes,
                ..
            } => {
                let window_count = self
                    .count(*window_minutes, 0, env_scope.clone())
                    .await?;
                // The baseline excludes the current window.
                let baseline_count = self
                    .count(*baseline_minutes, *window_minutes, env_scope)
                    .await?;
                Ok(RuleMetrics {
                    window_count,
                    window_minutes: *window_minutes,
                    baseline_count,
                    baseline_minutes: *baseline_minutes,
                    is_new: self.event.is_new,
                })
            }
            RuleConditions::NewError {} | RuleConditions::Critical { .. } => Ok(RuleMetrics {
                is_new: self.event.is_new,
                ..RuleMetrics::default()
            }),
        }
    }

    /// Count occurrences in `[now - offset - span, now - offset)`, where an
    /// offset of zero means "the current window" (inclusive of now).
    async fn count(
        &mut self,
        span_minutes: i64,
        offset_minutes: i64,
        environment: Option<String>,
    ) -> Result<u64, StoreError> {
        let key = (span_minutes, offset_minutes, environment.clone());
        if let Some(cached) = self.counts.get(&key) {
            return Ok(*cached);
        }

        let until = if offset_minutes == 0 {
            // Include the event that is being evaluated.
            self.now + Duration::seconds(1)
        } else {
            self.now - Duration::minutes(offset_minutes)
        };
        let since = self.now - Duration::minutes(offset_minutes + span_minutes);

        let count = self
            .store
            .count_occurrences_in_range(
                self.event.project_id,
                &self.event.fingerprint,
                environment.as_deref(),
                since,
                until,
            )
            .await?;
        self.counts.insert(key, count);
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
