use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use vg_harness::shutdown::ShutdownSignal;
use vg_store::Store;

/// Result of one full retention pass across all projects.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SweepReport {
    pub projects_swept: usize,
    pub occurrences_deleted: usize,
    pub groups_deleted: usize,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Deletes occurrences and orphaned groups past each project's retention
/// window, in bounded batches with a checkpoint after every batch so a
/// shutdown mid-sweep loses no committed work.
pub struct RetentionSweeper {
    store: Arc<Store>,
    batch_size: usize,
}

impl RetentionSweeper {
    pub fn new(store: Arc<Store>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    pub async fn run_sweep(
        &self,
        now: DateTime<Utc>,
        shutdown: &ShutdownSignal,
    ) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport {
            timestamp: Some(now),
            ..SweepReport::default()
        };

        for project in self.store.list_projects().await? {
            if shutdown.is_shutting_down() {
                break;
            }
            let cutoff = now - Duration::days(project.retention_days as i64);
            debug!(project_id = %project.id, %cutoff, "retention sweep starting");

            loop {
                let pass = self
                    .store
                    .retention_sweep(project.id, cutoff, self.batch_size)
                    .await?;
                report.occurrences_deleted += pass.occurrences_deleted;
                report.groups_deleted += pass.groups_deleted;
                if !pass.more || shutdown.is_shutting_down() {
                    break;
                }
            }
            report.projects_swept += 1;
        }

        if report.occurrences_deleted > 0 || report.groups_deleted > 0 {
            info!(
                occurrences = report.occurrences_deleted,
                groups = report.groups_deleted,
                projects = report.projects_swept,
                "retention sweep completed"
            );
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
