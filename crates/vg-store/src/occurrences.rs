use chrono::{DateTime, Utc};
use uuid::Uuid;

use vg_core::types::Occurrence;

use crate::{enum_from_sql, json_from_sql, parse_ts, ts, Store, StoreError};

const OCC_COLS: &str = "id, error_id, project_id, fingerprint, timestamp, message, stack_trace,
     user_context, metadata, environment, severity, session_id";

fn row_to_occurrence(row: &rusqlite::Row<'_>) -> Result<Occurrence, rusqlite::Error> {
    Ok(Occurrence {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        error_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        project_id: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        fingerprint: row.get(3)?,
        timestamp: parse_ts(&row.get::<_, String>(4)?),
        message: row.get(5)?,
        stack_trace: json_from_sql(&row.get::<_, String>(6)?),
        user_context: json_from_sql(&row.get::<_, String>(7)?),
        metadata: json_from_sql(&row.get::<_, String>(8)?),
        environment: row.get(9)?,
        severity: enum_from_sql(&row.get::<_, String>(10)?),
        session_id: row.get(11)?,
    })
}

/// One sweep pass over a single project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub occurrences_deleted: usize,
    pub groups_deleted: usize,
    /// True when the batch limit was hit and another pass is needed.
    pub more: bool,
}

impl Store {
    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Most recent occurrences of a group, newest first.
    pub async fn recent_occurrences(
        &self,
        error_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let error_id = error_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {OCC_COLS} FROM occurrences
                     WHERE error_id = ?1 ORDER BY timestamp DESC LIMIT ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![error_id, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_occurrence(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn count_occurrences_for_group(&self, error_id: Uuid) -> Result<i64, StoreError> {
        let error_id = error_id.to_string();
        self.conn()
            .call(move |conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM occurrences WHERE error_id = ?1",
                    rusqlite::params![error_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(Into::into)
    }

    /// Occurrence count for a fingerprint within `[since, until)`,
    /// optionally restricted to one environment. Feeds the alert metrics
    /// snapshot.
    pub async fn count_occurrences_in_range(
        &self,
        project_id: Uuid,
        fingerprint: &str,
        environment: Option<&str>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let project_id = project_id.to_string();
        let fingerprint = fingerprint.to_string();
        let environment = environment.map(|s| s.to_string());
        let since = ts(since);
        let until = ts(until);
        self.conn()
            .call(move |conn| {
                let count: i64 = match environment {
                    Some(env) => conn.query_row(
                        "SELECT COUNT(*) FROM occurrences
                         WHERE project_id = ?1 AND fingerprint = ?2
                           AND environment = ?3 AND timestamp >= ?4 AND timestamp < ?5",
                        rusqlite::params![project_id, fingerprint, env, since, until],
                        |row| row.get(0),
                    )?,
                    None => conn.query_row(
                        "SELECT COUNT(*) FROM occurrences
                         WHERE project_id = ?1 AND fingerprint = ?2
                           AND timestamp >= ?3 AND timestamp < ?4",
                        rusqlite::params![project_id, fingerprint, since, until],
                        |row| row.get(0),
                    )?,
                };
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// One batched, idempotent sweep pass for a project.
    ///
    /// Deletes up to `batch` occurrences older than `cutoff`, then drops
    /// groups whose `last_seen` predates the cutoff and which have no
    /// surviving occurrences. Group counters are never touched.
    pub async fn retention_sweep(
        &self,
        project_id: Uuid,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> Result<RetentionOutcome, StoreError> {
        let project_id = project_id.to_string();
        let cutoff = ts(cutoff);
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let occurrences_deleted = tx.execute(
                    "DELETE FROM occurrences WHERE id IN (
                        SELECT id FROM occurrences
                        WHERE project_id = ?1 AND timestamp < ?2
                        ORDER BY timestamp LIMIT ?3
                     )",
                    rusqlite::params![project_id, cutoff, batch as i64],
                )?;

                // Only reap groups once the occurrence backlog for this
                // project is fully drained; otherwise a group could lose its
                // row while deletable occurrences still reference it.
                let more = occurrences_deleted == batch;
                let groups_deleted = if more {
                    0
                } else {
                    tx.execute(
                        "DELETE FROM error_groups
                         WHERE project_id = ?1 AND last_seen < ?2
                           AND NOT EXISTS (
                               SELECT 1 FROM occurrences
                               WHERE occurrences.error_id = error_groups.id
                           )",
                        rusqlite::params![project_id, cutoff],
                    )?
                };

                tx.commit()?;
                Ok(RetentionOutcome {
                    occurrences_deleted,
                    groups_deleted,
                    more,
                })
            })
            .await
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
