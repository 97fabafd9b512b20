use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::MetadataMap;

// ---------------------------------------------------------------------------
// Roles & projects
// ---------------------------------------------------------------------------

/// Per-project membership role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer = 0,
    Developer = 1,
    Admin = 2,
}

impl Role {
    /// Returns `true` when this role grants at least `required`.
    pub fn allows(&self, required: Role) -> bool {
        *self >= required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Disabled,
}

/// Which categories of PII the scrubber removes for a project.
///
/// Credit-card runs, bearer/API tokens, and HTML tags are always removed
/// regardless of these flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScrubPolicy {
    #[serde(default)]
    pub remove_emails: bool,
    #[serde(default)]
    pub remove_phones: bool,
    #[serde(default)]
    pub remove_ips: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    /// SHA-256 of the ingest API key. The plaintext key is never stored.
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    /// Last 6-8 characters of the key, for display.
    pub api_key_preview: String,
    pub scrub_policy: ScrubPolicy,
    /// Occurrence retention window, clamped to [1, 365].
    pub retention_days: u32,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub const DEFAULT_RETENTION_DAYS: u32 = 90;

    pub fn new(name: impl Into<String>, api_key_hash: String, api_key_preview: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ProjectStatus::Active,
            api_key_hash,
            api_key_preview,
            scrub_policy: ScrubPolicy::default(),
            retention_days: Self::DEFAULT_RETENTION_DAYS,
            created_at: Utc::now(),
        }
    }

    pub fn clamp_retention(days: u32) -> u32 {
        days.clamp(1, 365)
    }
}

// ---------------------------------------------------------------------------
// Users & memberships
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub project_id: Uuid,
    pub role: Role,
}

/// A dashboard user. Credentials are issued by the external identity
/// service; we only keep the hash and the project memberships.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub memberships: Vec<Membership>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Role of this user in `project_id`, if any.
    pub fn role_in(&self, project_id: Uuid) -> Option<Role> {
        self.memberships
            .iter()
            .find(|m| m.project_id == project_id)
            .map(|m| m.role)
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info = 0,
    Warning = 1,
    #[default]
    Error = 2,
    Critical = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// Lenient parse used on ingest; unknown values map to `Error`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" | "debug" => Severity::Info,
            "warning" | "warn" => Severity::Warning,
            "critical" | "fatal" => Severity::Critical,
            _ => Severity::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Error groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    New,
    Open,
    Investigating,
    Resolved,
    Ignored,
}

impl GroupStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Forward chain is `new -> open -> investigating -> resolved`;
    /// `ignored` is reachable from any non-terminal state; `resolved` and
    /// `ignored` may reopen to `open`.
    pub fn can_transition_to(&self, target: &GroupStatus) -> bool {
        matches!(
            (self, target),
            (GroupStatus::New, GroupStatus::Open)
                | (GroupStatus::Open, GroupStatus::Investigating)
                | (GroupStatus::Investigating, GroupStatus::Resolved)
                | (GroupStatus::New, GroupStatus::Ignored)
                | (GroupStatus::Open, GroupStatus::Ignored)
                | (GroupStatus::Investigating, GroupStatus::Ignored)
                | (GroupStatus::Resolved, GroupStatus::Open)
                | (GroupStatus::Ignored, GroupStatus::Open)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupStatus::Resolved | GroupStatus::Ignored)
    }
}

/// One stack frame of an ingested error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    /// Frames from the application itself (as opposed to vendored or
    /// runtime code) participate in fingerprinting.
    #[serde(default = "default_in_app")]
    pub in_app: bool,
}

fn default_in_app() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRecord {
    pub member_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unassigned_at: Option<DateTime<Utc>>,
}

/// Aggregated row per `(project, fingerprint)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorGroup {
    pub id: Uuid,
    pub project_id: Uuid,
    pub fingerprint: String,
    pub message: String,
    pub stack_trace: Vec<Frame>,
    pub environment: String,
    pub severity: Severity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: i64,
    pub status: GroupStatus,
    pub assigned_to: Option<Uuid>,
    pub assignment_history: Vec<AssignmentRecord>,
}

// ---------------------------------------------------------------------------
// Occurrences
// ---------------------------------------------------------------------------

/// `userContext` of an ingested event, post-scrub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
}

impl UserContext {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.email.is_none() && self.ip.is_none() && self.segment.is_none()
    }
}

/// One ingested event, immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub id: Uuid,
    pub error_id: Uuid,
    pub project_id: Uuid,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub stack_trace: Vec<Frame>,
    pub user_context: UserContext,
    pub metadata: MetadataMap,
    pub environment: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Alert rules
// ---------------------------------------------------------------------------

/// Per-type trigger conditions. Adding a variant is a compile-time
/// obligation on the evaluation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RuleConditions {
    Threshold {
        threshold: u64,
        window_minutes: i64,
    },
    Spike {
        increase_percent: f64,
        window_minutes: i64,
        /// Typically 6x the window.
        baseline_minutes: i64,
    },
    NewError {},
    Critical {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        severity: Option<Severity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
    },
}

impl RuleConditions {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleConditions::Threshold { .. } => "threshold",
            RuleConditions::Spike { .. } => "spike",
            RuleConditions::NewError {} => "new_error",
            RuleConditions::Critical { .. } => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    Environment,
    Severity,
    UserSegment,
    File,
    Fingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    Contains,
    StartsWith,
    In,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCombinator {
    And,
    Or,
}

/// Nested boolean scope filter. Leaves compare one event field; internal
/// nodes combine children with and/or.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Group {
        op: FilterCombinator,
        conditions: Vec<FilterNode>,
    },
    Leaf {
        field: FilterField,
        operator: FilterOperator,
        value: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Slack,
    Discord,
    Teams,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Slack => "slack",
            ChannelKind::Discord => "discord",
            ChannelKind::Teams => "teams",
            ChannelKind::Webhook => "webhook",
        }
    }
}

/// One delivery target of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSpec {
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    /// Email address list (comma separated) or webhook URL.
    pub target: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub cooldown_minutes: i64,
    #[serde(flatten)]
    pub conditions: RuleConditions,
    /// Empty list means "all environments".
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterNode>,
    pub channels: Vec<ChannelSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Team members & alert preferences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Immediate,
    Digest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DigestCadence {
    #[default]
    Daily,
    Weekly,
}

impl DigestCadence {
    pub fn as_duration(&self) -> chrono::Duration {
        match self {
            DigestCadence::Daily => chrono::Duration::hours(24),
            DigestCadence::Weekly => chrono::Duration::days(7),
        }
    }
}

/// A do-not-disturb window in the member's local time.
///
/// `start`/`end` are `"HH:MM"`; a window that ends before it starts wraps
/// past midnight. `timezone` accepts `"UTC"` or a fixed `"+HH:MM"` offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_quiet_start")]
    pub start: String,
    #[serde(default = "default_quiet_end")]
    pub end: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_quiet_start() -> String {
    "22:00".to_string()
}
fn default_quiet_end() -> String {
    "07:00".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: default_quiet_start(),
            end: default_quiet_end(),
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DigestSettings {
    #[serde(default)]
    pub cadence: DigestCadence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmailPreference {
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default)]
    pub quiet_hours: QuietHours,
    #[serde(default)]
    pub digest: DigestSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AlertPreferences {
    #[serde(default)]
    pub email: EmailPreference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub active: bool,
    pub avatar_color: String,
    #[serde(default)]
    pub alert_preferences: AlertPreferences,
    pub created_at: DateTime<Utc>,
}

impl TeamMember {
    pub fn new(project_id: Uuid, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            email: email.into(),
            role: None,
            active: true,
            avatar_color: "#6366f1".to_string(),
            alert_preferences: AlertPreferences::default(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Digest entries & notification state
// ---------------------------------------------------------------------------

/// A deferred alert waiting for the member's next digest. The alert payload
/// is a snapshot by value so the entry stays renderable even if the rule is
/// later deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestEntry {
    pub id: Uuid,
    pub project_id: Uuid,
    pub member_id: Uuid,
    pub rule_id: Uuid,
    pub alert: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStateKind {
    Cooldown,
    Escalation,
}

impl NotificationStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStateKind::Cooldown => "cooldown",
            NotificationStateKind::Escalation => "escalation",
        }
    }
}

/// Persistent dispatcher state keyed by `(kind, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationState {
    pub kind: NotificationStateKind,
    pub key: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub label: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Report schedules & runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportCadence {
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSchedule {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub cadence: ReportCadence,
    /// UTC hour [0, 23] at which the run fires.
    pub at_hour_utc: u32,
    /// Weekly cadence: ISO weekday 1 (Mon) - 7 (Sun).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<u32>,
    /// Monthly cadence: day of month, clamped to the month's length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    pub format: String,
    /// How many days of data the report covers.
    pub window_days: u32,
    pub recipients: Vec<String>,
    pub status: ScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_claim_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ReportSchedule {
    /// The next instant this schedule should fire, strictly after `after`.
    ///
    /// All times are UTC (no DST). Weekly schedules use the ISO weekday
    /// (default Monday); monthly schedules clamp the configured day to the
    /// target month's length, so "the 31st" fires on Feb 28/29.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        use chrono::{Datelike, NaiveDate};

        let hour = self.at_hour_utc.min(23);
        match self.cadence {
            ReportCadence::Weekly => {
                let weekday = self.weekday.unwrap_or(1).clamp(1, 7);
                let mut day = after.date_naive();
                for _ in 0..8 {
                    if let Some(candidate) = day.and_hms_opt(hour, 0, 0).map(|dt| dt.and_utc()) {
                        if candidate > after
                            && candidate.weekday().number_from_monday() == weekday
                        {
                            return candidate;
                        }
                    }
                    day = day.succ_opt().unwrap_or(day);
                }
                after + chrono::Duration::days(7)
            }
            ReportCadence::Monthly => {
                let target_day = self.day_of_month.unwrap_or(1).clamp(1, 31);
                let mut year = after.year();
                let mut month = after.month();
                for _ in 0..24 {
                    let clamped = target_day.min(days_in_month(year, month));
                    let candidate = NaiveDate::from_ymd_opt(year, month, clamped)
                        .and_then(|d| d.and_hms_opt(hour, 0, 0))
                        .map(|dt| dt.and_utc());
                    if let Some(candidate) = candidate {
                        if candidate > after {
                            return candidate;
                        }
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
                after + chrono::Duration::days(30)
            }
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    use chrono::{Datelike, NaiveDate};
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRun {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<String>,
    pub size_bytes: u64,
    pub summary: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_forward_chain() {
        assert!(GroupStatus::New.can_transition_to(&GroupStatus::Open));
        assert!(GroupStatus::Open.can_transition_to(&GroupStatus::Investigating));
        assert!(GroupStatus::Investigating.can_transition_to(&GroupStatus::Resolved));
    }

    #[test]
    fn status_dag_rejects_skips_and_backwards() {
        assert!(!GroupStatus::New.can_transition_to(&GroupStatus::Resolved));
        assert!(!GroupStatus::Resolved.can_transition_to(&GroupStatus::Investigating));
        assert!(!GroupStatus::Open.can_transition_to(&GroupStatus::New));
    }

    #[test]
    fn ignored_reachable_from_non_terminal_only() {
        assert!(GroupStatus::New.can_transition_to(&GroupStatus::Ignored));
        assert!(GroupStatus::Open.can_transition_to(&GroupStatus::Ignored));
        assert!(GroupStatus::Investigating.can_transition_to(&GroupStatus::Ignored));
        assert!(!GroupStatus::Resolved.can_transition_to(&GroupStatus::Ignored));
    }

    #[test]
    fn terminal_states_reopen_to_open() {
        assert!(GroupStatus::Resolved.can_transition_to(&GroupStatus::Open));
        assert!(GroupStatus::Ignored.can_transition_to(&GroupStatus::Open));
    }

    #[test]
    fn role_ordering() {
        assert!(Role::Admin.allows(Role::Viewer));
        assert!(Role::Developer.allows(Role::Viewer));
        assert!(!Role::Viewer.allows(Role::Developer));
        assert!(!Role::Developer.allows(Role::Admin));
    }

    #[test]
    fn rule_conditions_tagged_serde() {
        let rule: RuleConditions = serde_json::from_value(serde_json::json!({
            "type": "threshold",
            "threshold": 3,
            "windowMinutes": 5
        }))
        .unwrap();
        assert_eq!(
            rule,
            RuleConditions::Threshold {
                threshold: 3,
                window_minutes: 5
            }
        );
        assert_eq!(rule.type_name(), "threshold");
    }

    #[test]
    fn filter_node_untagged_serde() {
        let node: FilterNode = serde_json::from_value(serde_json::json!({
            "op": "and",
            "conditions": [
                {"field": "environment", "operator": "equals", "value": "production"},
                {"field": "severity", "operator": "in", "value": ["error", "critical"]}
            ]
        }))
        .unwrap();
        match node {
            FilterNode::Group { op, conditions } => {
                assert_eq!(op, FilterCombinator::And);
                assert_eq!(conditions.len(), 2);
            }
            FilterNode::Leaf { .. } => panic!("expected group"),
        }
    }

    #[test]
    fn severity_lenient_parse() {
        assert_eq!(Severity::parse_lenient("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::parse_lenient("warn"), Severity::Warning);
        assert_eq!(Severity::parse_lenient("whatever"), Severity::Error);
    }

    fn schedule(cadence: ReportCadence) -> ReportSchedule {
        ReportSchedule {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "s".into(),
            cadence,
            at_hour_utc: 8,
            weekday: None,
            day_of_month: None,
            format: "pdf".into(),
            window_days: 7,
            recipients: vec![],
            status: ScheduleStatus::Active,
            next_run_at: None,
            last_run_at: None,
            last_claim_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn weekly_next_run_lands_on_requested_weekday() {
        use chrono::{Datelike, TimeZone};
        let mut s = schedule(ReportCadence::Weekly);
        s.weekday = Some(3); // Wednesday
        // 2026-08-01 is a Saturday.
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let next = s.next_run_after(after);
        assert_eq!(next.weekday().number_from_monday(), 3);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 5, 8, 0, 0).unwrap());
    }

    #[test]
    fn weekly_same_day_before_hour_fires_today() {
        use chrono::TimeZone;
        let mut s = schedule(ReportCadence::Weekly);
        s.weekday = Some(6); // Saturday
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 6, 0, 0).unwrap();
        assert_eq!(
            s.next_run_after(after),
            Utc.with_ymd_and_hms(2026, 8, 1, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn monthly_end_of_month_clamps() {
        use chrono::TimeZone;
        let mut s = schedule(ReportCadence::Monthly);
        s.day_of_month = Some(31);
        // After Jan 31st 2026 the next candidate is Feb, which has 28 days.
        let after = Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap();
        assert_eq!(
            s.next_run_after(after),
            Utc.with_ymd_and_hms(2026, 2, 28, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_run_is_strictly_in_the_future() {
        use chrono::TimeZone;
        let s = schedule(ReportCadence::Monthly);
        let exactly = Utc.with_ymd_and_hms(2026, 8, 1, 8, 0, 0).unwrap();
        assert!(s.next_run_after(exactly) > exactly);
    }

    #[test]
    fn retention_clamped() {
        assert_eq!(Project::clamp_retention(0), 1);
        assert_eq!(Project::clamp_retention(90), 90);
        assert_eq!(Project::clamp_retention(10_000), 365);
    }
}
