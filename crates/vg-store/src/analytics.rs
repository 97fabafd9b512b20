use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use vg_core::types::ErrorGroup;

use crate::{parse_ts, ts, Store, StoreError};

// ---------------------------------------------------------------------------
// Result shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OverviewStats {
    pub total_groups: i64,
    pub total_occurrences: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_severity: BTreeMap<String, i64>,
    pub by_environment: BTreeMap<String, i64>,
    pub new_last_24h: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopError {
    pub error_id: Uuid,
    pub message: String,
    pub count: i64,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserImpactRow {
    pub error_id: Uuid,
    pub message: String,
    pub affected_users: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionStats {
    pub resolved: i64,
    pub unresolved: i64,
    pub ignored: i64,
    pub resolution_rate: f64,
    /// Mean first-seen-to-last-seen lifetime of resolved groups, in hours.
    pub avg_lifetime_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamPerformanceRow {
    pub member_id: Uuid,
    pub assigned: i64,
    pub resolved: i64,
}

impl Store {
    pub async fn analytics_overview(
        &self,
        project_id: Uuid,
    ) -> Result<OverviewStats, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stats = OverviewStats::default();
                stats.total_groups = conn.query_row(
                    "SELECT COUNT(*) FROM error_groups WHERE project_id = ?1",
                    rusqlite::params![project_id],
                    |row| row.get(0),
                )?;
                stats.total_occurrences = conn.query_row(
                    "SELECT COUNT(*) FROM occurrences WHERE project_id = ?1",
                    rusqlite::params![project_id],
                    |row| row.get(0),
                )?;

                for (column, out) in [
                    ("status", &mut stats.by_status),
                    ("severity", &mut stats.by_severity),
                    ("environment", &mut stats.by_environment),
                ] {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {column}, COUNT(*) FROM error_groups
                         WHERE project_id = ?1 GROUP BY {column}"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![project_id])?;
                    while let Some(row) = rows.next()? {
                        out.insert(row.get(0)?, row.get(1)?);
                    }
                }

                let day_ago = ts(Utc::now() - chrono::Duration::hours(24));
                stats.new_last_24h = conn.query_row(
                    "SELECT COUNT(*) FROM error_groups
                     WHERE project_id = ?1 AND first_seen >= ?2",
                    rusqlite::params![project_id, day_ago],
                    |row| row.get(0),
                )?;
                Ok(stats)
            })
            .await
            .map_err(Into::into)
    }

    /// Daily occurrence counts over the trailing `days`.
    pub async fn analytics_trends(
        &self,
        project_id: Uuid,
        days: u32,
    ) -> Result<Vec<TrendPoint>, StoreError> {
        let project_id = project_id.to_string();
        let since = ts(Utc::now() - chrono::Duration::days(days as i64));
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT substr(timestamp, 1, 10) AS day, COUNT(*)
                     FROM occurrences
                     WHERE project_id = ?1 AND timestamp >= ?2
                     GROUP BY day ORDER BY day",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id, since])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(TrendPoint {
                        date: row.get(0)?,
                        count: row.get(1)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn analytics_top_errors(
        &self,
        project_id: Uuid,
        limit: u32,
    ) -> Result<Vec<TopError>, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, message, count, status, last_seen FROM error_groups
                     WHERE project_id = ?1 ORDER BY count DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(TopError {
                        error_id: row
                            .get::<_, String>(0)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        message: row.get(1)?,
                        count: row.get(2)?,
                        status: row.get(3)?,
                        last_seen: parse_ts(&row.get::<_, String>(4)?),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Hour-of-day occurrence histogram plus environment split; the
    /// "patterns" aggregation of the dashboard.
    pub async fn analytics_patterns(
        &self,
        project_id: Uuid,
    ) -> Result<serde_json::Value, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut by_hour = BTreeMap::new();
                let mut stmt = conn.prepare(
                    "SELECT substr(timestamp, 12, 2) AS hour, COUNT(*)
                     FROM occurrences WHERE project_id = ?1 GROUP BY hour",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                while let Some(row) = rows.next()? {
                    by_hour.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
                }

                let mut by_environment = BTreeMap::new();
                let mut stmt = conn.prepare(
                    "SELECT environment, COUNT(*) FROM occurrences
                     WHERE project_id = ?1 GROUP BY environment",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                while let Some(row) = rows.next()? {
                    by_environment.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
                }

                Ok(serde_json::json!({
                    "byHour": by_hour,
                    "byEnvironment": by_environment,
                }))
            })
            .await
            .map_err(Into::into)
    }

    /// Groups that share a stack-trace source file with the given group.
    pub async fn analytics_related_errors(
        &self,
        project_id: Uuid,
        group: &ErrorGroup,
        limit: u32,
    ) -> Result<Vec<TopError>, StoreError> {
        let Some(file) = group
            .stack_trace
            .first()
            .map(|frame| frame.file.clone())
            .filter(|f| !f.is_empty())
        else {
            return Ok(Vec::new());
        };
        let project_id = project_id.to_string();
        let group_id = group.id.to_string();
        let pattern = format!("%\"file\":\"{file}\"%");
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, message, count, status, last_seen FROM error_groups
                     WHERE project_id = ?1 AND id != ?2 AND stack_trace LIKE ?3
                     ORDER BY last_seen DESC LIMIT ?4",
                )?;
                let mut rows =
                    stmt.query(rusqlite::params![project_id, group_id, pattern, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(TopError {
                        error_id: row
                            .get::<_, String>(0)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        message: row.get(1)?,
                        count: row.get(2)?,
                        status: row.get(3)?,
                        last_seen: parse_ts(&row.get::<_, String>(4)?),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Distinct affected users per group, highest impact first.
    pub async fn analytics_user_impact(
        &self,
        project_id: Uuid,
        limit: u32,
    ) -> Result<Vec<UserImpactRow>, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT o.error_id, g.message,
                            COUNT(DISTINCT json_extract(o.user_context, '$.id')) AS users
                     FROM occurrences o
                     JOIN error_groups g ON g.id = o.error_id
                     WHERE o.project_id = ?1
                       AND json_extract(o.user_context, '$.id') IS NOT NULL
                     GROUP BY o.error_id ORDER BY users DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(UserImpactRow {
                        error_id: row
                            .get::<_, String>(0)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        message: row.get(1)?,
                        affected_users: row.get(2)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn analytics_resolution(
        &self,
        project_id: Uuid,
    ) -> Result<ResolutionStats, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stats = ResolutionStats::default();
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*),
                            AVG((julianday(last_seen) - julianday(first_seen)) * 24.0)
                     FROM error_groups WHERE project_id = ?1 GROUP BY status",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut total = 0i64;
                while let Some(row) = rows.next()? {
                    let status: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    total += count;
                    match status.as_str() {
                        "resolved" => {
                            stats.resolved = count;
                            stats.avg_lifetime_hours =
                                row.get::<_, Option<f64>>(2)?.unwrap_or(0.0);
                        }
                        "ignored" => stats.ignored = count,
                        _ => stats.unresolved += count,
                    }
                }
                if total > 0 {
                    stats.resolution_rate = stats.resolved as f64 / total as f64;
                }
                Ok(stats)
            })
            .await
            .map_err(Into::into)
    }

    /// The aggregate payload a report run persists. Rendering to PDF/Excel
    /// is an external concern; the run stores this summary.
    pub async fn build_report_summary(
        &self,
        project_id: Uuid,
        window_days: u32,
    ) -> Result<serde_json::Value, StoreError> {
        let overview = self.analytics_overview(project_id).await?;
        let trends = self.analytics_trends(project_id, window_days).await?;
        let top_errors = self.analytics_top_errors(project_id, 10).await?;
        let resolution = self.analytics_resolution(project_id).await?;
        Ok(serde_json::json!({
            "windowDays": window_days,
            "overview": overview,
            "trends": trends,
            "topErrors": top_errors,
            "resolution": resolution,
        }))
    }

    /// Assigned/resolved counts per member over the trailing window.
    pub async fn team_performance(
        &self,
        project_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<TeamPerformanceRow>, StoreError> {
        let project_id = project_id.to_string();
        let since = ts(since);
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT assigned_to, COUNT(*),
                            SUM(CASE WHEN status = 'resolved' THEN 1 ELSE 0 END)
                     FROM error_groups
                     WHERE project_id = ?1 AND assigned_to IS NOT NULL
                       AND last_seen >= ?2
                     GROUP BY assigned_to",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id, since])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(TeamPerformanceRow {
                        member_id: row
                            .get::<_, String>(0)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        assigned: row.get(1)?,
                        resolved: row.get(2)?,
                    });
                }
                Ok(out)
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
    use crate::NewOccurrence;
    use vg_core::metadata::MetadataMap;
    use vg_core::types::{Frame, GroupStatus, Project, Severity, UserContext};

    fn event(project_id: Uuid, fingerprint: &str, user_id: Option<&str>) -> NewOccurrence {
        NewOccurrence {
            project_id,
            fingerprint: fingerprint.to_string(),
            timestamp: Utc::now(),
            message: format!("error {fingerprint}"),
            stack_trace: vec![Frame {
                function: "handler".into(),
                file: "api/routes.js".into(),
                line: 42,
                in_app: true,
            }],
            user_context: UserContext {
                id: user_id.map(|s| s.to_string()),
                ..UserContext::default()
            },
            metadata: MetadataMap::default(),
            environment: "production".into(),
            severity: Severity::Error,
            session_id: None,
        }
    }

    async fn store_with_project() -> (Store, Uuid) {
        let store = Store::open_in_memory().await.unwrap();
        let project = Project::new("api", "hash".into(), "preview1".into());
        store.upsert_project(&project).await.unwrap();
        (store, project.id)
    }

    #[tokio::test]
    async fn overview_counts_by_dimension() {
        let (store, project_id) = store_with_project().await;
        for _ in 0..3 {
            store.ingest_event(event(project_id, "fp-a", None)).await.unwrap();
        }
        store.ingest_event(event(project_id, "fp-b", None)).await.unwrap();

        let stats = store.analytics_overview(project_id).await.unwrap();
        assert_eq!(stats.total_groups, 2);
        assert_eq!(stats.total_occurrences, 4);
        assert_eq!(stats.by_status.get("new"), Some(&2));
        assert_eq!(stats.by_environment.get("production"), Some(&2));
        assert_eq!(stats.new_last_24h, 2);
    }

    #[tokio::test]
    async fn top_errors_ranked_by_count() {
        let (store, project_id) = store_with_project().await;
        for _ in 0..5 {
            store.ingest_event(event(project_id, "fp-big", None)).await.unwrap();
        }
        store.ingest_event(event(project_id, "fp-small", None)).await.unwrap();

        let top = store.analytics_top_errors(project_id, 10).await.unwrap();
        assert_eq!(top[0].count, 5);
        assert_eq!(top[0].message, "error fp-big");
    }

    #[tokio::test]
    async fn user_impact_counts_distinct_users() {
        let (store, project_id) = store_with_project().await;
        store.ingest_event(event(project_id, "fp", Some("u1"))).await.unwrap();
        store.ingest_event(event(project_id, "fp", Some("u1"))).await.unwrap();
        store.ingest_event(event(project_id, "fp", Some("u2"))).await.unwrap();
        store.ingest_event(event(project_id, "fp", None)).await.unwrap();

        let impact = store.analytics_user_impact(project_id, 10).await.unwrap();
        assert_eq!(impact.len(), 1);
        assert_eq!(impact[0].affected_users, 2);
    }

    #[tokio::test]
    async fn related_errors_share_source_file() {
        let (store, project_id) = store_with_project().await;
        let a = store.ingest_event(event(project_id, "fp-a", None)).await.unwrap();
        store.ingest_event(event(project_id, "fp-b", None)).await.unwrap();
        let mut other = event(project_id, "fp-c", None);
        other.stack_trace[0].file = "worker/jobs.js".into();
        store.ingest_event(other).await.unwrap();

        let group = store.get_group(project_id, a.error_id).await.unwrap().unwrap();
        let related = store
            .analytics_related_errors(project_id, &group, 5)
            .await
            .unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].message, "error fp-b");
    }

    #[tokio::test]
    async fn resolution_rate_reflects_statuses() {
        let (store, project_id) = store_with_project().await;
        let a = store.ingest_event(event(project_id, "fp-a", None)).await.unwrap();
        store.ingest_event(event(project_id, "fp-b", None)).await.unwrap();

        for status in [GroupStatus::Open, GroupStatus::Investigating, GroupStatus::Resolved] {
            store
                .update_group_status(project_id, a.error_id, status)
                .await
                .unwrap();
        }

        let stats = store.analytics_resolution(project_id).await.unwrap();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.unresolved, 1);
        assert!((stats.resolution_rate - 0.5).abs() < 1e-9);
    }
}
