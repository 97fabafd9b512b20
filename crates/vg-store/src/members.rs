use chrono::{DateTime, Utc};
use uuid::Uuid;

use vg_core::types::{Deployment, TeamMember};

use crate::{json_from_sql, json_to_sql, parse_ts, ts, Store, StoreError};

const MEMBER_COLS: &str =
    "id, project_id, name, email, role, active, avatar_color, alert_preferences, created_at";

fn row_to_member(row: &rusqlite::Row<'_>) -> Result<TeamMember, rusqlite::Error> {
    Ok(TeamMember {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        project_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        name: row.get(2)?,
        email: row.get(3)?,
        role: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        avatar_color: row.get(6)?,
        alert_preferences: json_from_sql(&row.get::<_, String>(7)?),
        created_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

impl Store {
    // -----------------------------------------------------------------------
    // Team members
    // -----------------------------------------------------------------------

    pub async fn upsert_member(&self, member: &TeamMember) -> Result<(), StoreError> {
        let id = member.id.to_string();
        let project_id = member.project_id.to_string();
        let name = member.name.clone();
        let email = member.email.clone();
        let role = member.role.clone();
        let active = member.active as i64;
        let avatar_color = member.avatar_color.clone();
        let prefs = json_to_sql(&member.alert_preferences);
        let created_at = ts(member.created_at);

        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO team_members (id, project_id, name, email, role, active,
                        avatar_color, alert_preferences, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, email=excluded.email, role=excluded.role,
                        active=excluded.active, avatar_color=excluded.avatar_color,
                        alert_preferences=excluded.alert_preferences",
                    rusqlite::params![
                        id, project_id, name, email, role, active, avatar_color, prefs,
                        created_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_member(
        &self,
        project_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<TeamMember>, StoreError> {
        let project_id = project_id.to_string();
        let member_id = member_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MEMBER_COLS} FROM team_members WHERE id = ?1 AND project_id = ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![member_id, project_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_member(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_member_by_id(&self, member_id: Uuid) -> Result<Option<TeamMember>, StoreError> {
        let member_id = member_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MEMBER_COLS} FROM team_members WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![member_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_member(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_members(&self, project_id: Uuid) -> Result<Vec<TeamMember>, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MEMBER_COLS} FROM team_members
                     WHERE project_id = ?1 ORDER BY created_at"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_member(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Active members whose email is one of `emails`. Used to expand an
    /// email channel target into recipients.
    pub async fn members_by_emails(
        &self,
        project_id: Uuid,
        emails: &[String],
    ) -> Result<Vec<TeamMember>, StoreError> {
        let project_id = project_id.to_string();
        let emails: Vec<String> = emails.iter().map(|e| e.to_lowercase()).collect();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MEMBER_COLS} FROM team_members
                     WHERE project_id = ?1 AND active = 1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let member = row_to_member(row)?;
                    if emails.contains(&member.email.to_lowercase()) {
                        out.push(member);
                    }
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn delete_member(
        &self,
        project_id: Uuid,
        member_id: Uuid,
    ) -> Result<bool, StoreError> {
        let project_id = project_id.to_string();
        let member_id = member_id.to_string();
        self.conn()
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM team_members WHERE id = ?1 AND project_id = ?2",
                    rusqlite::params![member_id, project_id],
                )?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Persist the digest `lastSentAt` watermark after a successful flush.
    pub async fn set_member_digest_sent(
        &self,
        member_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(mut member) = self.get_member_by_id(member_id).await? else {
            return Ok(());
        };
        member.alert_preferences.email.digest.last_sent_at = Some(sent_at);
        self.upsert_member(&member).await
    }

    // -----------------------------------------------------------------------
    // Deployments
    // -----------------------------------------------------------------------

    pub async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let id = deployment.id.to_string();
        let project_id = deployment.project_id.to_string();
        let label = deployment.label.clone();
        let timestamp = ts(deployment.timestamp);
        let metadata = deployment.metadata.to_string();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO deployments (id, project_id, label, timestamp, metadata)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![id, project_id, label, timestamp, metadata],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Deployments within `[from, to]`, newest first, capped at `limit`.
    pub async fn deployments_in_window(
        &self,
        project_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Deployment>, StoreError> {
        let project_id = project_id.to_string();
        let from = ts(from);
        let to = ts(to);
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, label, timestamp, metadata FROM deployments
                     WHERE project_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                     ORDER BY timestamp DESC LIMIT ?4",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id, from, to, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(Deployment {
                        id: row
                            .get::<_, String>(0)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        project_id: row
                            .get::<_, String>(1)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        label: row.get(2)?,
                        timestamp: parse_ts(&row.get::<_, String>(3)?),
                        metadata: serde_json::from_str(&row.get::<_, String>(4)?)
                            .unwrap_or(serde_json::Value::Null),
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
