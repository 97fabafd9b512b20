use chrono::{DateTime, Utc};
use uuid::Uuid;

use vg_core::metadata::MetadataMap;
use vg_core::types::{
    AssignmentRecord, ErrorGroup, Frame, GroupStatus, Severity, UserContext,
};

use crate::{enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, parse_ts, ts, Store, StoreError};

// ---------------------------------------------------------------------------
// Ingest write path
// ---------------------------------------------------------------------------

/// A scrubbed, fingerprinted event ready to persist. The group id is not
/// known until the upsert runs.
#[derive(Debug, Clone)]
pub struct NewOccurrence {
    pub project_id: Uuid,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub stack_trace: Vec<Frame>,
    pub user_context: UserContext,
    pub metadata: MetadataMap,
    pub environment: String,
    pub severity: Severity,
    pub session_id: Option<String>,
}

/// What the atomic upsert produced, observed as of the completing write.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub error_id: Uuid,
    pub fingerprint: String,
    pub count: i64,
    /// True iff this event created the group.
    pub is_new: bool,
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupSort {
    #[default]
    LastSeen,
    FirstSeen,
    Count,
}

impl GroupSort {
    fn column(&self) -> &'static str {
        match self {
            GroupSort::LastSeen => "last_seen",
            GroupSort::FirstSeen => "first_seen",
            GroupSort::Count => "count",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "firstSeen" | "first_seen" => GroupSort::FirstSeen,
            "count" => GroupSort::Count,
            _ => GroupSort::LastSeen,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub environment: Option<String>,
    pub status: Option<GroupStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub source_file: Option<String>,
    pub search: Option<String>,
    pub sort_by: GroupSort,
    pub ascending: bool,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct GroupPage {
    pub items: Vec<ErrorGroup>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

/// Outcome of a status PATCH, so the handler can distinguish a missing row
/// from a transition the DAG forbids.
#[derive(Debug)]
pub enum StatusUpdate {
    NotFound,
    Invalid { from: GroupStatus },
    Updated(ErrorGroup),
}

const GROUP_COLS: &str = "id, project_id, fingerprint, message, stack_trace, environment,
     severity, first_seen, last_seen, count, status, assigned_to, assignment_history";

fn row_to_group(row: &rusqlite::Row<'_>) -> Result<ErrorGroup, rusqlite::Error> {
    Ok(ErrorGroup {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        project_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        fingerprint: row.get(2)?,
        message: row.get(3)?,
        stack_trace: json_from_sql(&row.get::<_, String>(4)?),
        environment: row.get(5)?,
        severity: enum_from_sql(&row.get::<_, String>(6)?),
        first_seen: parse_ts(&row.get::<_, String>(7)?),
        last_seen: parse_ts(&row.get::<_, String>(8)?),
        count: row.get(9)?,
        status: enum_from_sql(&row.get::<_, String>(10)?),
        assigned_to: row
            .get::<_, Option<String>>(11)?
            .and_then(|s| s.parse().ok()),
        assignment_history: json_from_sql(&row.get::<_, String>(12)?),
    })
}

impl Store {
    /// The ingest write: upsert the group row and append the occurrence in
    /// one transaction, so `count` can never drift from the number of
    /// persisted occurrences.
    pub async fn ingest_event(&self, event: NewOccurrence) -> Result<IngestOutcome, StoreError> {
        let occurrence_id = Uuid::new_v4().to_string();
        let candidate_group_id = Uuid::new_v4().to_string();

        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let project_id = event.project_id.to_string();
                let event_ts = ts(event.timestamp);
                let stack_json = json_to_sql(&event.stack_trace);

                let existing: Option<(String, i64)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, count FROM error_groups
                         WHERE project_id = ?1 AND fingerprint = ?2",
                    )?;
                    let mut rows =
                        stmt.query(rusqlite::params![project_id, event.fingerprint])?;
                    match rows.next()? {
                        Some(row) => Some((row.get(0)?, row.get(1)?)),
                        None => None,
                    }
                };

                let (group_id, count, is_new) = match existing {
                    None => {
                        tx.execute(
                            "INSERT INTO error_groups (id, project_id, fingerprint, message,
                                stack_trace, environment, severity, first_seen, last_seen,
                                count, status, assigned_to, assignment_history)
                             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?8,1,'new',NULL,'[]')",
                            rusqlite::params![
                                candidate_group_id,
                                project_id,
                                event.fingerprint,
                                event.message,
                                stack_json,
                                event.environment,
                                enum_to_sql(&event.severity),
                                event_ts,
                            ],
                        )?;
                        (candidate_group_id.clone(), 1i64, true)
                    }
                    Some((group_id, old_count)) => {
                        // last_seen only moves forward; the representative
                        // stack is filled once and then left alone.
                        tx.execute(
                            "UPDATE error_groups SET
                                count = count + 1,
                                last_seen = MAX(last_seen, ?2),
                                stack_trace = CASE WHEN stack_trace = '[]'
                                    THEN ?3 ELSE stack_trace END
                             WHERE id = ?1",
                            rusqlite::params![group_id, event_ts, stack_json],
                        )?;
                        (group_id, old_count + 1, false)
                    }
                };

                tx.execute(
                    "INSERT INTO occurrences (id, error_id, project_id, fingerprint, timestamp,
                        message, stack_trace, user_context, metadata, environment, severity,
                        session_id)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        occurrence_id,
                        group_id,
                        project_id,
                        event.fingerprint,
                        event_ts,
                        event.message,
                        stack_json,
                        json_to_sql(&event.user_context),
                        json_to_sql(&event.metadata),
                        event.environment,
                        enum_to_sql(&event.severity),
                        event.session_id,
                    ],
                )?;

                tx.commit()?;
                Ok(IngestOutcome {
                    error_id: group_id.parse().unwrap_or_else(|_| Uuid::nil()),
                    fingerprint: event.fingerprint,
                    count,
                    is_new,
                })
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Tenant-scoped read; a foreign `project_id` simply yields `None`.
    pub async fn get_group(
        &self,
        project_id: Uuid,
        group_id: Uuid,
    ) -> Result<Option<ErrorGroup>, StoreError> {
        let project_id = project_id.to_string();
        let group_id = group_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {GROUP_COLS} FROM error_groups WHERE id = ?1 AND project_id = ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![group_id, project_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_group(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_group_by_fingerprint(
        &self,
        project_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<ErrorGroup>, StoreError> {
        let project_id = project_id.to_string();
        let fingerprint = fingerprint.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {GROUP_COLS} FROM error_groups
                     WHERE project_id = ?1 AND fingerprint = ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project_id, fingerprint])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_group(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_groups(
        &self,
        project_id: Uuid,
        filter: GroupFilter,
    ) -> Result<GroupPage, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut where_sql = String::from("project_id = ?1");
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(project_id)];

                if let Some(env) = &filter.environment {
                    params.push(Box::new(env.clone()));
                    where_sql.push_str(&format!(" AND environment = ?{}", params.len()));
                }
                if let Some(status) = &filter.status {
                    params.push(Box::new(enum_to_sql(status)));
                    where_sql.push_str(&format!(" AND status = ?{}", params.len()));
                }
                if let Some(start) = &filter.start_date {
                    params.push(Box::new(ts(*start)));
                    where_sql.push_str(&format!(" AND last_seen >= ?{}", params.len()));
                }
                if let Some(end) = &filter.end_date {
                    params.push(Box::new(ts(*end)));
                    where_sql.push_str(&format!(" AND last_seen <= ?{}", params.len()));
                }
                if let Some(file) = &filter.source_file {
                    params.push(Box::new(format!("%{file}%")));
                    where_sql.push_str(&format!(" AND stack_trace LIKE ?{}", params.len()));
                }
                if let Some(search) = &filter.search {
                    params.push(Box::new(format!("%{search}%")));
                    where_sql.push_str(&format!(" AND message LIKE ?{}", params.len()));
                }

                let param_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let total: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM error_groups WHERE {where_sql}"),
                    param_refs.as_slice(),
                    |row| row.get(0),
                )?;

                let limit = filter.limit.clamp(1, 100);
                let page = filter.page.max(1);
                let offset = (page - 1) * limit;
                let direction = if filter.ascending { "ASC" } else { "DESC" };
                let sql = format!(
                    "SELECT {GROUP_COLS} FROM error_groups WHERE {where_sql}
                     ORDER BY {} {direction} LIMIT {limit} OFFSET {offset}",
                    filter.sort_by.column()
                );

                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(param_refs.as_slice())?;
                let mut items = Vec::new();
                while let Some(row) = rows.next()? {
                    items.push(row_to_group(row)?);
                }
                Ok(GroupPage {
                    items,
                    total,
                    page,
                    limit,
                })
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Transition a group's status, enforcing the DAG inside the write
    /// transaction so concurrent PATCHes cannot interleave an illegal hop.
    pub async fn update_group_status(
        &self,
        project_id: Uuid,
        group_id: Uuid,
        target: GroupStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let project_id = project_id.to_string();
        let group_id = group_id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT status FROM error_groups WHERE id = ?1 AND project_id = ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![group_id, project_id])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                let Some(current) = current else {
                    return Ok(StatusUpdate::NotFound);
                };
                let from: GroupStatus = enum_from_sql(&current);
                if !from.can_transition_to(&target) {
                    return Ok(StatusUpdate::Invalid { from });
                }
                tx.execute(
                    "UPDATE error_groups SET status = ?3 WHERE id = ?1 AND project_id = ?2",
                    rusqlite::params![group_id, project_id, enum_to_sql(&target)],
                )?;
                let group = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {GROUP_COLS} FROM error_groups WHERE id = ?1"
                    ))?;
                    stmt.query_row(rusqlite::params![group_id], row_to_group)?
                };
                tx.commit()?;
                Ok(StatusUpdate::Updated(group))
            })
            .await
            .map_err(Into::into)
    }

    /// Assign or unassign a group, closing the previous assignment-history
    /// record and appending the new one.
    pub async fn update_group_assignment(
        &self,
        project_id: Uuid,
        group_id: Uuid,
        member_id: Option<Uuid>,
    ) -> Result<Option<ErrorGroup>, StoreError> {
        let project_id = project_id.to_string();
        let group_id = group_id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let history_json: Option<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT assignment_history FROM error_groups
                         WHERE id = ?1 AND project_id = ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![group_id, project_id])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                let Some(history_json) = history_json else {
                    return Ok(None);
                };

                let now = Utc::now();
                let mut history: Vec<AssignmentRecord> = json_from_sql(&history_json);
                if let Some(open) = history.iter_mut().rev().find(|r| r.unassigned_at.is_none())
                {
                    open.unassigned_at = Some(now);
                }
                if let Some(member_id) = member_id {
                    history.push(AssignmentRecord {
                        member_id,
                        assigned_at: now,
                        unassigned_at: None,
                    });
                }

                tx.execute(
                    "UPDATE error_groups SET assigned_to = ?3, assignment_history = ?4
                     WHERE id = ?1 AND project_id = ?2",
                    rusqlite::params![
                        group_id,
                        project_id,
                        member_id.map(|m| m.to_string()),
                        json_to_sql(&history),
                    ],
                )?;
                let group = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {GROUP_COLS} FROM error_groups WHERE id = ?1"
                    ))?;
                    stmt.query_row(rusqlite::params![group_id], row_to_group)?
                };
                tx.commit()?;
                Ok(Some(group))
            })
            .await
            .map_err(Into::into)
    }

    /// Delete a group and its occurrences.
    pub async fn delete_group(
        &self,
        project_id: Uuid,
        group_id: Uuid,
    ) -> Result<bool, StoreError> {
        let project_id = project_id.to_string();
        let group_id = group_id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx.execute(
                    "DELETE FROM error_groups WHERE id = ?1 AND project_id = ?2",
                    rusqlite::params![group_id, project_id],
                )?;
                if deleted > 0 {
                    tx.execute(
                        "DELETE FROM occurrences WHERE error_id = ?1",
                        rusqlite::params![group_id],
                    )?;
                }
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
