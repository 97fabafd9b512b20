//! Async SQLite-backed persistence for the vigil pipeline.
//!
//! Two hot tables (`error_groups`, `occurrences`) carry the write path; the
//! auxiliary tables hold the registry, alerting, digest, and reporting state.
//! All access goes through [`Store`], which wraps a `tokio_rusqlite`
//! connection so callers never block a runtime worker on SQLite I/O.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::Connection;

mod analytics;
mod groups;
mod members;
mod occurrences;
mod projects;
mod reports;
mod rules;

pub use analytics::{
    OverviewStats, ResolutionStats, TeamPerformanceRow, TopError, TrendPoint, UserImpactRow,
};
pub use groups::{GroupFilter, GroupPage, GroupSort, IngestOutcome, NewOccurrence, StatusUpdate};
pub use occurrences::RetentionOutcome;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Store failures, split so callers can honor the degraded-mode contract:
/// transient faults on the ingest path degrade to `202 accepted, dropped`,
/// on the dashboard path to `503`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Lock contention or a busy database; safe to retry.
    #[error("database busy: {0}")]
    Transient(String),
    /// Anything else: schema drift, corruption, I/O.
    #[error("database error: {0}")]
    Permanent(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match &err {
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(code, _))
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// helpers: enum / timestamp <-> SQLite string
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{raw}\"");
    serde_json::from_str(&quoted).expect("deserialize enum")
}

/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so that string
/// comparison in SQL matches chronological order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn json_to_sql<T: serde::Serialize>(val: &T) -> String {
    serde_json::to_string(val).expect("serialize json column")
}

pub(crate) fn json_from_sql<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Purely in-memory database (tests, degraded-mode drills).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Cheap liveness probe for `/health/db`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS projects (
                        id              TEXT PRIMARY KEY,
                        name            TEXT NOT NULL,
                        status          TEXT NOT NULL,
                        api_key_hash    TEXT NOT NULL,
                        api_key_preview TEXT NOT NULL,
                        scrub_policy    TEXT NOT NULL,
                        retention_days  INTEGER NOT NULL,
                        created_at      TEXT NOT NULL
                    );

                    -- Active projects may never share a key hash.
                    CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_active_key
                        ON projects(api_key_hash) WHERE status = 'active';

                    CREATE TABLE IF NOT EXISTS users (
                        id              TEXT PRIMARY KEY,
                        email           TEXT NOT NULL UNIQUE,
                        credential_hash TEXT NOT NULL,
                        created_at      TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS memberships (
                        user_id    TEXT NOT NULL,
                        project_id TEXT NOT NULL,
                        role       TEXT NOT NULL,
                        PRIMARY KEY (user_id, project_id)
                    );

                    CREATE TABLE IF NOT EXISTS error_groups (
                        id                 TEXT PRIMARY KEY,
                        project_id         TEXT NOT NULL,
                        fingerprint        TEXT NOT NULL,
                        message            TEXT NOT NULL,
                        stack_trace        TEXT NOT NULL,
                        environment        TEXT NOT NULL,
                        severity           TEXT NOT NULL,
                        first_seen         TEXT NOT NULL,
                        last_seen          TEXT NOT NULL,
                        count              INTEGER NOT NULL,
                        status             TEXT NOT NULL,
                        assigned_to        TEXT,
                        assignment_history TEXT NOT NULL,
                        UNIQUE (project_id, fingerprint)
                    );

                    CREATE INDEX IF NOT EXISTS idx_groups_last_seen
                        ON error_groups(project_id, last_seen DESC);
                    CREATE INDEX IF NOT EXISTS idx_groups_status
                        ON error_groups(project_id, status, last_seen DESC);

                    CREATE TABLE IF NOT EXISTS occurrences (
                        id           TEXT PRIMARY KEY,
                        error_id     TEXT NOT NULL,
                        project_id   TEXT NOT NULL,
                        fingerprint  TEXT NOT NULL,
                        timestamp    TEXT NOT NULL,
                        message      TEXT NOT NULL,
                        stack_trace  TEXT NOT NULL,
                        user_context TEXT NOT NULL,
                        metadata     TEXT NOT NULL,
                        environment  TEXT NOT NULL,
                        severity     TEXT NOT NULL,
                        session_id   TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_occurrences_error
                        ON occurrences(error_id, timestamp DESC);
                    CREATE INDEX IF NOT EXISTS idx_occurrences_window
                        ON occurrences(project_id, fingerprint, timestamp);
                    CREATE INDEX IF NOT EXISTS idx_occurrences_retention
                        ON occurrences(project_id, timestamp);

                    CREATE TABLE IF NOT EXISTS alert_rules (
                        id                 TEXT PRIMARY KEY,
                        project_id         TEXT NOT NULL,
                        name               TEXT NOT NULL,
                        enabled            INTEGER NOT NULL,
                        cooldown_minutes   INTEGER NOT NULL,
                        conditions         TEXT NOT NULL,
                        environments       TEXT NOT NULL,
                        filter             TEXT,
                        channels           TEXT NOT NULL,
                        last_error_message TEXT,
                        created_at         TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_rules_project
                        ON alert_rules(project_id, enabled);

                    CREATE TABLE IF NOT EXISTS notification_state (
                        kind       TEXT NOT NULL,
                        key        TEXT NOT NULL,
                        payload    TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        PRIMARY KEY (kind, key)
                    );

                    CREATE TABLE IF NOT EXISTS digest_entries (
                        id           TEXT PRIMARY KEY,
                        project_id   TEXT NOT NULL,
                        member_id    TEXT NOT NULL,
                        rule_id      TEXT NOT NULL,
                        alert        TEXT NOT NULL,
                        created_at   TEXT NOT NULL,
                        processed    INTEGER NOT NULL DEFAULT 0,
                        processed_at TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_digest_pending
                        ON digest_entries(member_id, processed, created_at);

                    CREATE TABLE IF NOT EXISTS team_members (
                        id                TEXT PRIMARY KEY,
                        project_id        TEXT NOT NULL,
                        name              TEXT NOT NULL,
                        email             TEXT NOT NULL,
                        role              TEXT,
                        active            INTEGER NOT NULL,
                        avatar_color      TEXT NOT NULL,
                        alert_preferences TEXT NOT NULL,
                        created_at        TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_members_project
                        ON team_members(project_id, active);

                    CREATE TABLE IF NOT EXISTS deployments (
                        id         TEXT PRIMARY KEY,
                        project_id TEXT NOT NULL,
                        label      TEXT NOT NULL,
                        timestamp  TEXT NOT NULL,
                        metadata   TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_deployments_project
                        ON deployments(project_id, timestamp DESC);

                    CREATE TABLE IF NOT EXISTS report_schedules (
                        id            TEXT PRIMARY KEY,
                        project_id    TEXT NOT NULL,
                        name          TEXT NOT NULL,
                        cadence       TEXT NOT NULL,
                        at_hour_utc   INTEGER NOT NULL,
                        weekday       INTEGER,
                        day_of_month  INTEGER,
                        format        TEXT NOT NULL,
                        window_days   INTEGER NOT NULL,
                        recipients    TEXT NOT NULL,
                        status        TEXT NOT NULL,
                        next_run_at   TEXT,
                        last_run_at   TEXT,
                        last_claim_at TEXT,
                        created_at    TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS report_runs (
                        id               TEXT PRIMARY KEY,
                        project_id       TEXT NOT NULL,
                        schedule_id      TEXT,
                        status           TEXT NOT NULL,
                        created_at       TEXT NOT NULL,
                        completed_at     TEXT,
                        file_ref         TEXT,
                        size_bytes       INTEGER NOT NULL DEFAULT 0,
                        summary          TEXT NOT NULL,
                        error            TEXT,
                        share_token      TEXT,
                        share_expires_at TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_runs_project
                        ON report_runs(project_id, created_at DESC);
                    CREATE INDEX IF NOT EXISTS idx_runs_share
                        ON report_runs(share_token);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
