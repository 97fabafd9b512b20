use uuid::Uuid;

use vg_core::types::{Membership, Project, Role, User};

use crate::{enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, parse_ts, ts, Store, StoreError};

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<Project, rusqlite::Error> {
    Ok(Project {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        name: row.get(1)?,
        status: enum_from_sql(&row.get::<_, String>(2)?),
        api_key_hash: row.get(3)?,
        api_key_preview: row.get(4)?,
        scrub_policy: json_from_sql(&row.get::<_, String>(5)?),
        retention_days: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

const PROJECT_COLS: &str = "id, name, status, api_key_hash, api_key_preview, scrub_policy,
     retention_days, created_at";

impl Store {
    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn upsert_project(&self, project: &Project) -> Result<(), StoreError> {
        let id = project.id.to_string();
        let name = project.name.clone();
        let status = enum_to_sql(&project.status);
        let key_hash = project.api_key_hash.clone();
        let key_preview = project.api_key_preview.clone();
        let scrub = json_to_sql(&project.scrub_policy);
        let retention = Project::clamp_retention(project.retention_days);
        let created_at = ts(project.created_at);

        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (id, name, status, api_key_hash, api_key_preview,
                        scrub_policy, retention_days, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, status=excluded.status,
                        api_key_hash=excluded.api_key_hash,
                        api_key_preview=excluded.api_key_preview,
                        scrub_policy=excluded.scrub_policy,
                        retention_days=excluded.retention_days",
                    rusqlite::params![
                        id, name, status, key_hash, key_preview, scrub, retention, created_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        let id = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PROJECT_COLS} FROM projects WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// Ingest-auth lookup. Only active projects can authenticate.
    pub async fn get_project_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<Project>, StoreError> {
        let key_hash = key_hash.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PROJECT_COLS} FROM projects
                     WHERE api_key_hash = ?1 AND status = 'active'"
                ))?;
                let mut rows = stmt.query(rusqlite::params![key_hash])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PROJECT_COLS} FROM projects ORDER BY created_at"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_project(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Atomic in-place key rotation: hash and preview swap together.
    pub async fn rotate_project_key(
        &self,
        id: Uuid,
        new_hash: &str,
        new_preview: &str,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        let new_hash = new_hash.to_string();
        let new_preview = new_preview.to_string();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE projects SET api_key_hash = ?2, api_key_preview = ?3 WHERE id = ?1",
                    rusqlite::params![id, new_hash, new_preview],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Delete a project and everything it owns.
    pub async fn delete_project(&self, id: Uuid) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx.execute("DELETE FROM projects WHERE id = ?1", [&id])?;
                for table in [
                    "error_groups",
                    "occurrences",
                    "alert_rules",
                    "digest_entries",
                    "team_members",
                    "deployments",
                    "report_schedules",
                    "report_runs",
                    "memberships",
                ] {
                    tx.execute(
                        &format!("DELETE FROM {table} WHERE project_id = ?1"),
                        [&id],
                    )?;
                }
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Users & memberships
    // -----------------------------------------------------------------------

    pub async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        let id = user.id.to_string();
        let email = user.email.clone();
        let credential_hash = user.credential_hash.clone();
        let created_at = ts(user.created_at);
        let memberships = user.memberships.clone();

        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO users (id, email, credential_hash, created_at)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(id) DO UPDATE SET
                        email=excluded.email, credential_hash=excluded.credential_hash",
                    rusqlite::params![id, email, credential_hash, created_at],
                )?;
                tx.execute("DELETE FROM memberships WHERE user_id = ?1", [&id])?;
                for m in &memberships {
                    tx.execute(
                        "INSERT INTO memberships (user_id, project_id, role) VALUES (?1,?2,?3)",
                        rusqlite::params![id, m.project_id.to_string(), enum_to_sql(&m.role)],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let id = id.to_string();
        self.conn()
            .call(move |conn| Self::load_user(conn, "id", &id))
            .await
            .map_err(Into::into)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.to_string();
        self.conn()
            .call(move |conn| Self::load_user(conn, "email", &email))
            .await
            .map_err(Into::into)
    }

    fn load_user(
        conn: &rusqlite::Connection,
        column: &str,
        value: &str,
    ) -> Result<Option<User>, tokio_rusqlite::Error> {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, email, credential_hash, created_at FROM users WHERE {column} = ?1"
        ))?;
        let mut rows = stmt.query(rusqlite::params![value])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let id: String = row.get(0)?;
        let mut user = User {
            id: id.parse().unwrap_or_else(|_| Uuid::nil()),
            email: row.get(1)?,
            credential_hash: row.get(2)?,
            memberships: Vec::new(),
            created_at: parse_ts(&row.get::<_, String>(3)?),
        };

        let mut stmt =
            conn.prepare("SELECT project_id, role FROM memberships WHERE user_id = ?1")?;
        let mut rows = stmt.query(rusqlite::params![id])?;
        while let Some(row) = rows.next()? {
            let project_id: String = row.get(0)?;
            let role: Role = enum_from_sql(&row.get::<_, String>(1)?);
            user.memberships.push(Membership {
                project_id: project_id.parse().unwrap_or_else(|_| Uuid::nil()),
                role,
            });
        }
        Ok(Some(user))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
