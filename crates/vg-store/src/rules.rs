use chrono::{DateTime, Utc};
use uuid::Uuid;

use vg_core::types::{AlertRule, DigestEntry, NotificationStateKind};

use crate::{json_from_sql, json_to_sql, parse_ts, ts, Store, StoreError};

const RULE_COLS: &str = "id, project_id, name, enabled, cooldown_minutes, conditions,
     environments, filter, channels, last_error_message, created_at";

fn row_to_rule(row: &rusqlite::Row<'_>) -> Result<AlertRule, rusqlite::Error> {
    let conditions_raw: String = row.get(5)?;
    Ok(AlertRule {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        project_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        name: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        cooldown_minutes: row.get(4)?,
        conditions: serde_json::from_str(&conditions_raw).unwrap_or(
            vg_core::types::RuleConditions::NewError {},
        ),
        environments: json_from_sql(&row.get::<_, String>(6)?),
        filter: row
            .get::<_, Option<String>>(7)?
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        channels: json_from_sql(&row.get::<_, String>(8)?),
        last_error_message: row.get(9)?,
        created_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

fn row_to_digest_entry(row: &rusqlite::Row<'_>) -> Result<DigestEntry, rusqlite::Error> {
    Ok(DigestEntry {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        project_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        member_id: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        rule_id: row
            .get::<_, String>(3)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        alert: serde_json::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&row.get::<_, String>(5)?),
        processed: row.get::<_, i64>(6)? != 0,
        processed_at: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_ts(&raw)),
    })
}

impl Store {
    // -----------------------------------------------------------------------
    // Alert rules
    // -----------------------------------------------------------------------

    pub async fn upsert_rule(&self, rule: &AlertRule) -> Result<(), StoreError> {
        let id = rule.id.to_string();
        let project_id = rule.project_id.to_string();
        let name = rule.name.clone();
        let enabled = rule.enabled as i64;
        let cooldown = rule.cooldown_minutes;
        let conditions = json_to_sql(&rule.conditions);
        let environments = json_to_sql(&rule.environments);
        let filter = rule.filter.as_ref().map(json_to_sql);
        let channels = json_to_sql(&rule.channels);
        let last_error = rule.last_error_message.clone();
        let created_at = ts(rule.created_at);

        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO alert_rules (id, project_id, name, enabled, cooldown_minutes,
                        conditions, environments, filter, channels, last_error_message,
                        created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, enabled=excluded.enabled,
                        cooldown_minutes=excluded.cooldown_minutes,
                        conditions=excluded.conditions, environments=excluded.environments,
                        filter=excluded.filter, channels=excluded.channels,
                        last_error_message=excluded.last_error_message",
                    rusqlite::params![
                        id, project_id, name, enabled, cooldown, conditions, environments,
                        filter, channels, last_error, created_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_rule(
        &self,
        project_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<AlertRule>, StoreError> {
        let project_id = project_id.to_string();
        let rule_id = rule_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RULE_COLS} FROM alert_rules WHERE id = ?1 AND project_id = ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![rule_id, project_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_rule(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_rules(&self, project_id: Uuid) -> Result<Vec<AlertRule>, StoreError> {
        self.list_rules_inner(project_id, false).await
    }

    /// Rules the evaluator runs per event. Disabled rules never reach it.
    pub async fn list_enabled_rules(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<AlertRule>, StoreError> {
        self.list_rules_inner(project_id, true).await
    }

    async fn list_rules_inner(
        &self,
        project_id: Uuid,
        enabled_only: bool,
    ) -> Result<Vec<AlertRule>, StoreError> {
        let project_id = project_id.to_string();
        self.conn()
            .call(move |conn| {
                let sql = if enabled_only {
                    format!(
                        "SELECT {RULE_COLS} FROM alert_rules
                         WHERE project_id = ?1 AND enabled = 1 ORDER BY created_at"
                    )
                } else {
                    format!(
                        "SELECT {RULE_COLS} FROM alert_rules
                         WHERE project_id = ?1 ORDER BY created_at"
                    )
                };
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_rule(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn delete_rule(&self, project_id: Uuid, rule_id: Uuid) -> Result<bool, StoreError> {
        let project_id = project_id.to_string();
        let rule_id = rule_id.to_string();
        self.conn()
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM alert_rules WHERE id = ?1 AND project_id = ?2",
                    rusqlite::params![rule_id, project_id],
                )?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Record (or clear) the most recent channel delivery failure on a rule.
    pub async fn set_rule_last_error(
        &self,
        rule_id: Uuid,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        let rule_id = rule_id.to_string();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE alert_rules SET last_error_message = ?2 WHERE id = ?1",
                    rusqlite::params![rule_id, message],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Notification state (cooldowns, escalations)
    // -----------------------------------------------------------------------

    /// Last fire time for a cooldown key, re-read from the store on every
    /// dispatch so the state stays authoritative across processes.
    pub async fn cooldown_last_fire(
        &self,
        key: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = key.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT payload FROM notification_state WHERE kind = ?1 AND key = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![
                    NotificationStateKind::Cooldown.as_str(),
                    key
                ])?;
                match rows.next()? {
                    Some(row) => {
                        let payload: String = row.get(0)?;
                        let value: serde_json::Value =
                            serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
                        Ok(value
                            .get("lastFire")
                            .and_then(|v| v.as_str())
                            .map(parse_ts))
                    }
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn record_cooldown_fire(
        &self,
        key: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let payload = serde_json::json!({ "lastFire": ts(fired_at) }).to_string();
        let updated_at = ts(fired_at);
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO notification_state (kind, key, payload, updated_at)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(kind, key) DO UPDATE SET
                        payload=excluded.payload, updated_at=excluded.updated_at",
                    rusqlite::params![
                        NotificationStateKind::Cooldown.as_str(),
                        key,
                        payload,
                        updated_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Digest entries
    // -----------------------------------------------------------------------

    pub async fn insert_digest_entry(&self, entry: &DigestEntry) -> Result<(), StoreError> {
        let id = entry.id.to_string();
        let project_id = entry.project_id.to_string();
        let member_id = entry.member_id.to_string();
        let rule_id = entry.rule_id.to_string();
        let alert = entry.alert.to_string();
        let created_at = ts(entry.created_at);
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO digest_entries (id, project_id, member_id, rule_id, alert,
                        created_at, processed, processed_at)
                     VALUES (?1,?2,?3,?4,?5,?6,0,NULL)",
                    rusqlite::params![id, project_id, member_id, rule_id, alert, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Distinct `(project_id, member_id)` pairs with unprocessed entries.
    pub async fn members_with_pending_digests(
        &self,
    ) -> Result<Vec<(Uuid, Uuid)>, StoreError> {
        self.conn()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT project_id, member_id FROM digest_entries
                     WHERE processed = 0",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let project: String = row.get(0)?;
                    let member: String = row.get(1)?;
                    if let (Ok(project), Ok(member)) = (project.parse(), member.parse()) {
                        out.push((project, member));
                    }
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Backlog size for one member; the dispatcher bounds this.
    pub async fn count_pending_digest_entries(&self, member_id: Uuid) -> Result<u64, StoreError> {
        let member_id = member_id.to_string();
        self.conn()
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM digest_entries WHERE member_id = ?1 AND processed = 0",
                    rusqlite::params![member_id],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }

    /// Unprocessed entries for one member, oldest first.
    pub async fn pending_digest_entries(
        &self,
        member_id: Uuid,
    ) -> Result<Vec<DigestEntry>, StoreError> {
        let member_id = member_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, member_id, rule_id, alert, created_at, processed,
                            processed_at
                     FROM digest_entries
                     WHERE member_id = ?1 AND processed = 0
                     ORDER BY created_at ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![member_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_digest_entry(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn mark_digest_entries_processed(
        &self,
        entry_ids: &[Uuid],
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ids: Vec<String> = entry_ids.iter().map(|id| id.to_string()).collect();
        let processed_at = ts(processed_at);
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        "UPDATE digest_entries SET processed = 1, processed_at = ?2
                         WHERE id = ?1",
                        rusqlite::params![id, processed_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
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
    use vg_core::types::{ChannelKind, ChannelSpec, Project, RuleConditions};

    fn sample_rule(project_id: Uuid) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            project_id,
            name: "prod threshold".into(),
            enabled: true,
            cooldown_minutes: 30,
            conditions: RuleConditions::Threshold {
                threshold: 3,
                window_minutes: 5,
            },
            environments: vec!["production".into()],
            filter: None,
            channels: vec![ChannelSpec {
                kind: ChannelKind::Slack,
                target: "https://hooks.slack.example/T000".into(),
                options: serde_json::Value::Null,
            }],
            last_error_message: None,
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
    async fn rule_round_trip() {
        let (store, project_id) = store_with_project().await;
        let rule = sample_rule(project_id);
        store.upsert_rule(&rule).await.unwrap();

        let loaded = store.get_rule(project_id, rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "prod threshold");
        assert_eq!(
            loaded.conditions,
            RuleConditions::Threshold {
                threshold: 3,
                window_minutes: 5
            }
        );
        assert_eq!(loaded.channels[0].kind, ChannelKind::Slack);
    }

    #[tokio::test]
    async fn enabled_listing_excludes_disabled() {
        let (store, project_id) = store_with_project().await;
        let mut enabled = sample_rule(project_id);
        enabled.name = "on".into();
        let mut disabled = sample_rule(project_id);
        disabled.name = "off".into();
        disabled.enabled = false;
        store.upsert_rule(&enabled).await.unwrap();
        store.upsert_rule(&disabled).await.unwrap();

        let all = store.list_rules(project_id).await.unwrap();
        let active = store.list_enabled_rules(project_id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "on");
    }

    #[tokio::test]
    async fn last_error_is_recorded_and_cleared() {
        let (store, project_id) = store_with_project().await;
        let rule = sample_rule(project_id);
        store.upsert_rule(&rule).await.unwrap();

        store
            .set_rule_last_error(rule.id, Some("slack: 404 channel_not_found".into()))
            .await
            .unwrap();
        let loaded = store.get_rule(project_id, rule.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.last_error_message.as_deref(),
            Some("slack: 404 channel_not_found")
        );

        store.set_rule_last_error(rule.id, None).await.unwrap();
        let loaded = store.get_rule(project_id, rule.id).await.unwrap().unwrap();
        assert!(loaded.last_error_message.is_none());
    }

    #[tokio::test]
    async fn cooldown_state_round_trip() {
        let (store, _) = store_with_project().await;
        let key = "rule-1:fp-1:production";
        assert!(store.cooldown_last_fire(key).await.unwrap().is_none());

        let fired = Utc::now();
        store.record_cooldown_fire(key, fired).await.unwrap();
        let loaded = store.cooldown_last_fire(key).await.unwrap().unwrap();
        assert_eq!(loaded.timestamp_micros(), fired.timestamp_micros());

        // Overwrite moves the fire time forward.
        let later = fired + chrono::Duration::minutes(31);
        store.record_cooldown_fire(key, later).await.unwrap();
        let loaded = store.cooldown_last_fire(key).await.unwrap().unwrap();
        assert_eq!(loaded.timestamp_micros(), later.timestamp_micros());
    }

    #[tokio::test]
    async fn digest_entries_drain_oldest_first() {
        let (store, project_id) = store_with_project().await;
        let member_id = Uuid::new_v4();
        let rule_id = Uuid::new_v4();
        let base = Utc::now();

        for i in 0..3 {
            store
                .insert_digest_entry(&DigestEntry {
                    id: Uuid::new_v4(),
                    project_id,
                    member_id,
                    rule_id,
                    alert: serde_json::json!({ "seq": i }),
                    created_at: base + chrono::Duration::seconds(i),
                    processed: false,
                    processed_at: None,
                })
                .await
                .unwrap();
        }

        let pending_members = store.members_with_pending_digests().await.unwrap();
        assert_eq!(pending_members, vec![(project_id, member_id)]);

        let entries = store.pending_digest_entries(member_id).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].alert["seq"], 0);
        assert_eq!(entries[2].alert["seq"], 2);

        let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
        store
            .mark_digest_entries_processed(&ids, Utc::now())
            .await
            .unwrap();
        assert!(store
            .pending_digest_entries(member_id)
            .await
            .unwrap()
            .is_empty());
        assert!(store.members_with_pending_digests().await.unwrap().is_empty());
    }
}
