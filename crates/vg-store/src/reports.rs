use chrono::{DateTime, Utc};
use uuid::Uuid;

use vg_core::types::{ReportRun, ReportSchedule, RunStatus, ScheduleStatus};

use crate::{enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, parse_ts, ts, Store, StoreError};

const SCHEDULE_COLS: &str = "id, project_id, name, cadence, at_hour_utc, weekday, day_of_month,
     format, window_days, recipients, status, next_run_at, last_run_at, last_claim_at,
     created_at";

const RUN_COLS: &str = "id, project_id, schedule_id, status, created_at, completed_at, file_ref,
     size_bytes, summary, error, share_token, share_expires_at";

fn row_to_schedule(row: &rusqlite::Row<'_>) -> Result<ReportSchedule, rusqlite::Error> {
    Ok(ReportSchedule {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        project_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        name: row.get(2)?,
        cadence: enum_from_sql(&row.get::<_, String>(3)?),
        at_hour_utc: row.get(4)?,
        weekday: row.get(5)?,
        day_of_month: row.get(6)?,
        format: row.get(7)?,
        window_days: row.get(8)?,
        recipients: json_from_sql(&row.get::<_, String>(9)?),
        status: enum_from_sql(&row.get::<_, String>(10)?),
        next_run_at: row.get::<_, Option<String>>(11)?.map(|raw| parse_ts(&raw)),
        last_run_at: row.get::<_, Option<String>>(12)?.map(|raw| parse_ts(&raw)),
        last_claim_at: row.get::<_, Option<String>>(13)?.map(|raw| parse_ts(&raw)),
        created_at: parse_ts(&row.get::<_, String>(14)?),
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<ReportRun, rusqlite::Error> {
    Ok(ReportRun {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        project_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        schedule_id: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| s.parse().ok()),
        status: enum_from_sql(&row.get::<_, String>(3)?),
        created_at: parse_ts(&row.get::<_, String>(4)?),
        completed_at: row.get::<_, Option<String>>(5)?.map(|raw| parse_ts(&raw)),
        file_ref: row.get(6)?,
        size_bytes: row.get::<_, i64>(7)? as u64,
        summary: serde_json::from_str(&row.get::<_, String>(8)?)
            .unwrap_or(serde_json::Value::Null),
        error: row.get(9)?,
        share_token: row.get(10)?,
        share_expires_at: row.get::<_, Option<String>>(11)?.map(|raw| parse_ts(&raw)),
    })
}

impl Store {
    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    pub async fn upsert_schedule(&self, schedule: &ReportSchedule) -> Result<(), StoreError> {
        let id = schedule.id.to_string();
        let project_id = schedule.project_id.to_string();
        let name = schedule.name.clone();
        let cadence = enum_to_sql(&schedule.cadence);
        let at_hour = schedule.at_hour_utc;
        let weekday = schedule.weekday;
        let day_of_month = schedule.day_of_month;
        let format = schedule.format.clone();
        let window_days = schedule.window_days;
        let recipients = json_to_sql(&schedule.recipients);
        let status = enum_to_sql(&schedule.status);
        let next_run_at = schedule.next_run_at.map(ts);
        let last_run_at = schedule.last_run_at.map(ts);
        let last_claim_at = schedule.last_claim_at.map(ts);
        let created_at = ts(schedule.created_at);

        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO report_schedules (id, project_id, name, cadence, at_hour_utc,
                        weekday, day_of_month, format, window_days, recipients, status,
                        next_run_at, last_run_at, last_claim_at, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, cadence=excluded.cadence,
                        at_hour_utc=excluded.at_hour_utc, weekday=excluded.weekday,
                        day_of_month=excluded.day_of_month, format=excluded.format,
                        window_days=excluded.window_days, recipients=excluded.recipients,
                        status=excluded.status, next_run_at=excluded.next_run_at,
                        last_run_at=excluded.last_run_at,
                        last_claim_at=excluded.last_claim_at",
                    rusqlite::params![
                        id, project_id, name, cadence, at_hour, weekday, day_of_month, format,
                        window_days, recipients, status, next_run_at, last_run_at,
                        last_claim_at, created_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_schedule(
        &self,
        project_id: Uuid,
        schedule_id: Uuid,
    ) -> Result<Option<ReportSchedule>, StoreError> {
        let project_id = project_id.to_string();
        let schedule_id = schedule_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLS} FROM report_schedules
                     WHERE id = ?1 AND project_id = ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![schedule_id, project_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_schedule(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_schedules(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<ReportSchedule>, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLS} FROM report_schedules
                     WHERE project_id = ?1 ORDER BY created_at"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_schedule(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn delete_schedule(
        &self,
        project_id: Uuid,
        schedule_id: Uuid,
    ) -> Result<bool, StoreError> {
        let project_id = project_id.to_string();
        let schedule_id = schedule_id.to_string();
        self.conn()
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM report_schedules WHERE id = ?1 AND project_id = ?2",
                    rusqlite::params![schedule_id, project_id],
                )?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Atomically claim one due schedule for execution.
    ///
    /// The claim CASes `last_claim_at`: a schedule already claimed within
    /// `stale_after` is skipped, so two scheduler ticks cannot both run it,
    /// while a crashed claim is retried once the stale window passes.
    pub async fn claim_due_schedule(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Option<ReportSchedule>, StoreError> {
        let now_str = ts(now);
        let stale_before = ts(now - stale_after);
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let candidate: Option<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM report_schedules
                         WHERE status = 'active' AND next_run_at IS NOT NULL
                           AND next_run_at <= ?1
                           AND (last_claim_at IS NULL OR last_claim_at < ?2)
                         ORDER BY next_run_at LIMIT 1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![now_str, stale_before])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                let Some(id) = candidate else {
                    return Ok(None);
                };
                tx.execute(
                    "UPDATE report_schedules SET last_claim_at = ?2 WHERE id = ?1",
                    rusqlite::params![id, now_str],
                )?;
                let schedule = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {SCHEDULE_COLS} FROM report_schedules WHERE id = ?1"
                    ))?;
                    stmt.query_row(rusqlite::params![id], row_to_schedule)?
                };
                tx.commit()?;
                Ok(Some(schedule))
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Produce a report run end to end: a `pending` row first (so a crash
    /// leaves evidence), then the summary, then the terminal status.
    pub async fn produce_report_run(
        &self,
        project_id: Uuid,
        schedule_id: Option<Uuid>,
        window_days: u32,
    ) -> Result<ReportRun, StoreError> {
        let mut run = ReportRun {
            id: Uuid::new_v4(),
            project_id,
            schedule_id,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            file_ref: None,
            size_bytes: 0,
            summary: serde_json::Value::Null,
            error: None,
            share_token: None,
            share_expires_at: None,
        };
        self.upsert_run(&run).await?;

        match self.build_report_summary(project_id, window_days).await {
            Ok(summary) => {
                run.size_bytes = summary.to_string().len() as u64;
                run.summary = summary;
                run.status = RunStatus::Success;
                run.file_ref = Some(format!("reports/{}.json", run.id));
            }
            Err(err) => {
                run.status = RunStatus::Failed;
                run.error = Some(err.to_string());
            }
        }
        run.completed_at = Some(Utc::now());
        self.upsert_run(&run).await?;
        Ok(run)
    }

    pub async fn upsert_run(&self, run: &ReportRun) -> Result<(), StoreError> {
        let id = run.id.to_string();
        let project_id = run.project_id.to_string();
        let schedule_id = run.schedule_id.map(|s| s.to_string());
        let status = enum_to_sql(&run.status);
        let created_at = ts(run.created_at);
        let completed_at = run.completed_at.map(ts);
        let file_ref = run.file_ref.clone();
        let size_bytes = run.size_bytes as i64;
        let summary = run.summary.to_string();
        let error = run.error.clone();
        let share_token = run.share_token.clone();
        let share_expires_at = run.share_expires_at.map(ts);

        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO report_runs (id, project_id, schedule_id, status, created_at,
                        completed_at, file_ref, size_bytes, summary, error, share_token,
                        share_expires_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
                     ON CONFLICT(id) DO UPDATE SET
                        status=excluded.status, completed_at=excluded.completed_at,
                        file_ref=excluded.file_ref, size_bytes=excluded.size_bytes,
                        summary=excluded.summary, error=excluded.error,
                        share_token=excluded.share_token,
                        share_expires_at=excluded.share_expires_at",
                    rusqlite::params![
                        id, project_id, schedule_id, status, created_at, completed_at,
                        file_ref, size_bytes, summary, error, share_token, share_expires_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_run(
        &self,
        project_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<ReportRun>, StoreError> {
        let project_id = project_id.to_string();
        let run_id = run_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLS} FROM report_runs WHERE id = ?1 AND project_id = ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![run_id, project_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_run(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_runs(&self, project_id: Uuid) -> Result<Vec<ReportRun>, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLS} FROM report_runs
                     WHERE project_id = ?1 ORDER BY created_at DESC LIMIT 100"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_run(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Public share-link resolution: token must exist and be unexpired.
    pub async fn get_run_by_share_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReportRun>, StoreError> {
        let token = token.to_string();
        let now = ts(now);
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLS} FROM report_runs
                     WHERE share_token = ?1 AND share_expires_at > ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![token, now])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_run(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vg_core::types::{Project, ReportCadence};

    fn sample_schedule(project_id: Uuid, next_run_at: DateTime<Utc>) -> ReportSchedule {
        ReportSchedule {
            id: Uuid::new_v4(),
            project_id,
            name: "weekly summary".into(),
            cadence: ReportCadence::Weekly,
            at_hour_utc: 8,
            weekday: Some(1),
            day_of_month: None,
            format: "pdf".into(),
            window_days: 7,
            recipients: vec!["team@example.com".into()],
            status: ScheduleStatus::Active,
            next_run_at: Some(next_run_at),
            last_run_at: None,
            last_claim_at: None,
            created_at: Utc::now(),
        }
    }

    async fn store_with_project() -> (Store, Uuid) {
        let store = Store::open_in_memory().await.unwrap();
        let project = Project::new("api", "hash".into(), "preview1".into());
        store.upsert_project(&project).await.unwrap();
        (store, project.id)
    }

    #[tokio::test]
    async fn due_schedule_is_claimed_once() {
        let (store, project_id) = store_with_project().await;
        let now = Utc::now();
        let schedule = sample_schedule(project_id, now - chrono::Duration::minutes(1));
        store.upsert_schedule(&schedule).await.unwrap();

        let stale = chrono::Duration::minutes(10);
        let first = store.claim_due_schedule(now, stale).await.unwrap();
        assert_eq!(first.unwrap().id, schedule.id);

        // Second claim within the stale window finds nothing.
        let second = store.claim_due_schedule(now, stale).await.unwrap();
        assert!(second.is_none());

        // After the stale window the crashed claim is retried.
        let later = now + chrono::Duration::minutes(11);
        let third = store.claim_due_schedule(later, stale).await.unwrap();
        assert_eq!(third.unwrap().id, schedule.id);
    }

    #[tokio::test]
    async fn paused_and_future_schedules_are_not_claimed() {
        let (store, project_id) = store_with_project().await;
        let now = Utc::now();

        let mut paused = sample_schedule(project_id, now - chrono::Duration::minutes(1));
        paused.status = ScheduleStatus::Paused;
        store.upsert_schedule(&paused).await.unwrap();

        let future = sample_schedule(project_id, now + chrono::Duration::hours(1));
        store.upsert_schedule(&future).await.unwrap();

        let claimed = store
            .claim_due_schedule(now, chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn run_lifecycle_and_share_token() {
        let (store, project_id) = store_with_project().await;
        let now = Utc::now();
        let mut run = ReportRun {
            id: Uuid::new_v4(),
            project_id,
            schedule_id: None,
            status: RunStatus::Pending,
            created_at: now,
            completed_at: None,
            file_ref: None,
            size_bytes: 0,
            summary: serde_json::Value::Null,
            error: None,
            share_token: None,
            share_expires_at: None,
        };
        store.upsert_run(&run).await.unwrap();

        run.status = RunStatus::Success;
        run.completed_at = Some(now);
        run.file_ref = Some("reports/run.json".into());
        run.size_bytes = 2048;
        run.summary = serde_json::json!({ "totalErrors": 12 });
        run.share_token = Some("tok-abc".into());
        run.share_expires_at = Some(now + chrono::Duration::hours(72));
        store.upsert_run(&run).await.unwrap();

        let loaded = store.get_run(project_id, run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Success);
        assert_eq!(loaded.summary["totalErrors"], 12);

        let shared = store
            .get_run_by_share_token("tok-abc", now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(shared.is_some());

        let expired = store
            .get_run_by_share_token("tok-abc", now + chrono::Duration::hours(73))
            .await
            .unwrap();
        assert!(expired.is_none());
    }
}
