//! Persisted data model for the fleet warden.
//!
//! Everything in this module is serialized to the state tree. All documents
//! carry `schema_version` and `updated_at`, and every field has a serde
//! default so documents written by an older warden still deserialize after
//! a schema upgrade.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version stamped into `state.json`.
pub const STATE_SCHEMA_VERSION: u32 = 2;

/// Schema version stamped into `issues.json`.
pub const ISSUES_SCHEMA_VERSION: u32 = 2;

/// Most-recent evidence entries retained per issue.
pub const EVIDENCE_LIMIT: usize = 10;

/// Issue severity. Ordered so `P1` outranks `P2` outranks `P3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    P1,
    P2,
    P3,
}

impl Severity {
    /// Numeric rank - higher is more severe.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::P1 => 3,
            Self::P2 => 2,
            Self::P3 => 1,
        }
    }

    /// Display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }

    /// Parse a severity label, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            "P3" => Some(Self::P3),
            _ => None,
        }
    }

    /// The more severe of two severities.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::P3
    }
}

/// Issue lifecycle status. Issues are never deleted, only flipped here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    Resolved,
}

/// Bounded evidence lists attached to an issue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub run_ids: Vec<String>,
    #[serde(default)]
    pub log_paths: Vec<String>,
}

impl Evidence {
    /// Record a run id, keeping only the most recent entries.
    pub fn push_run(&mut self, run_id: &str) {
        push_bounded(&mut self.run_ids, run_id);
    }

    /// Record a log path, keeping only the most recent entries.
    pub fn push_log(&mut self, log_path: &str) {
        push_bounded(&mut self.log_paths, log_path);
    }
}

fn push_bounded(list: &mut Vec<String>, value: &str) {
    if list.last().is_some_and(|v| v == value) {
        return;
    }
    list.push(value.to_string());
    if list.len() > EVIDENCE_LIMIT {
        let drop = list.len() - EVIDENCE_LIMIT;
        list.drain(..drop);
    }
}

/// A deduplicated, persistent failure record for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Deterministic key `<bot_id>:<fingerprint>`.
    pub issue_id: String,
    pub bot_id: String,
    pub fingerprint: String,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub severity: Severity,
    /// Short human summary of the failure condition.
    #[serde(default)]
    pub summary: String,
    pub first_seen_ts: DateTime<Utc>,
    pub last_seen_ts: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Re-detections while open. Reset to 0 on resolution.
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub evidence: Evidence,
    #[serde(default)]
    pub last_alert_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quiet_hours_suppressed_count: u32,
}

impl Issue {
    /// Create a freshly-detected issue.
    #[must_use]
    pub fn new(
        bot_id: &str,
        fingerprint: &str,
        severity: Severity,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            issue_id: format!("{bot_id}:{fingerprint}"),
            bot_id: bot_id.to_string(),
            fingerprint: fingerprint.to_string(),
            status: IssueStatus::Open,
            severity,
            summary: summary.to_string(),
            first_seen_ts: now,
            last_seen_ts: now,
            resolved_at: None,
            consecutive_failures: 1,
            evidence: Evidence::default(),
            last_alert_ts: None,
            quiet_hours_suppressed_count: 0,
        }
    }

    /// Re-detection of the same condition. Reopens a resolved issue,
    /// bumps the counter on an open one. Severity only ever escalates.
    pub fn touch(&mut self, severity: Severity, summary: &str, now: DateTime<Utc>) {
        match self.status {
            IssueStatus::Open => {
                self.consecutive_failures += 1;
            }
            IssueStatus::Resolved => {
                self.status = IssueStatus::Open;
                self.resolved_at = None;
                self.consecutive_failures = 1;
            }
        }
        self.severity = self.severity.max(severity);
        if !summary.is_empty() {
            self.summary = summary.to_string();
        }
        self.last_seen_ts = now;
    }

    /// The condition was observed absent.
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        if self.status == IssueStatus::Resolved {
            return;
        }
        self.status = IssueStatus::Resolved;
        self.resolved_at = Some(now);
        self.consecutive_failures = 0;
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }
}

/// Composite health classification for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Warn,
    Error,
    Down,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Down => "DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Degradation rank - higher is worse. `Unknown` ranks below `Warn`
    /// so a definite problem always wins over an absence of data.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Unknown => 1,
            Self::Warn => 2,
            Self::Error => 3,
            Self::Down => 4,
        }
    }

    /// The worse of two statuses.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Which telemetry combination produced a bot's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    #[serde(rename = "latest+heartbeat")]
    LatestAndHeartbeat,
    Latest,
    Heartbeat,
    TelegramFallback,
    #[default]
    None,
}

impl SignalSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LatestAndHeartbeat => "latest+heartbeat",
            Self::Latest => "latest",
            Self::Heartbeat => "heartbeat",
            Self::TelegramFallback => "telegram_fallback",
            Self::None => "none",
        }
    }
}

/// Container runtime introspection result for one worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerState {
    /// False when the runtime query failed or the runtime is unavailable.
    #[serde(default)]
    pub supported: bool,
    #[serde(default)]
    pub running: Option<bool>,
    /// Raw state string as reported by the runtime.
    #[serde(default)]
    pub state: Option<String>,
}

impl ContainerState {
    /// Confirmed not running (the runtime answered and said stopped).
    #[must_use]
    pub fn confirmed_stopped(&self) -> bool {
        self.supported && self.running == Some(false)
    }
}

/// Telegram channel introspection result for one worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramChannelState {
    /// Whether the channel log was inspected this scan.
    #[serde(default)]
    pub checked: bool,
    /// Auth-invalid failures since the last provider start.
    #[serde(default)]
    pub auth_failures: u32,
    /// Generic channel exits since the last provider start.
    #[serde(default)]
    pub channel_exits: u32,
}

impl TelegramChannelState {
    /// Channel-health check reports failure.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.checked && (self.auth_failures > 0 || self.channel_exits > 0)
    }

    /// Channel was inspected and looked clean.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.checked && self.auth_failures == 0 && self.channel_exits == 0
    }
}

/// Rolling per-worker health snapshot, fully overwritten each scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotHealth {
    #[serde(default)]
    pub bot_id: String,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub signal_source: SignalSource,
    #[serde(default)]
    pub container: ContainerState,
    #[serde(default)]
    pub telegram: TelegramChannelState,
    /// Minutes since the freshest telemetry timestamp, if any.
    #[serde(default)]
    pub staleness_minutes: Option<i64>,
    /// Completed runs observed in this scan.
    #[serde(default)]
    pub runs_observed: u32,
    /// Retry events observed in this scan.
    #[serde(default)]
    pub retries_recovered: u32,
    #[serde(default)]
    pub last_success_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-bot event log watermark. Lines at or before this timestamp have
/// already been evaluated for failure counting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanCursor {
    #[serde(default)]
    pub max_event_ts: Option<DateTime<Utc>>,
}

/// Per-issue remediation rate-limit ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationHistoryEntry {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_request_ids: Vec<String>,
    #[serde(default)]
    pub last_status: RemediationStatus,
}

/// Outcome of the most recent remediation evaluation for an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Queued,
    Cooldown,
    MaxAttemptsReached,
    RearmedAfterRecovery,
    #[default]
    Noop,
}

impl RemediationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Cooldown => "cooldown",
            Self::MaxAttemptsReached => "max_attempts_reached",
            Self::RearmedAfterRecovery => "rearmed_after_recovery",
            Self::Noop => "noop",
        }
    }
}

/// Immutable artifact written per dispatched or suppressed alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_id: String,
    pub issue_id: String,
    pub severity: Severity,
    /// Rendered alert message.
    pub message: String,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default)]
    pub suppressed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Marker recording that a briefing was generated for a calendar day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BriefingMarker {
    pub date: NaiveDate,
    pub sent_at: DateTime<Utc>,
}

/// Accumulated per-day counters, rolled when the local date changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayStats {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub runs_observed: u32,
    #[serde(default)]
    pub retries_recovered: u32,
}

impl DayStats {
    /// Reset the counters when the local calendar day has moved on.
    pub fn roll(&mut self, today: NaiveDate) {
        if self.date != Some(today) {
            self.date = Some(today);
            self.runs_observed = 0;
            self.retries_recovered = 0;
        }
    }
}

/// Rolling fleet state: health snapshots, scan cursors, briefing markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetState {
    #[serde(default = "default_state_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bots: BTreeMap<String, BotHealth>,
    #[serde(default)]
    pub cursors: BTreeMap<String, ScanCursor>,
    /// Keyed by briefing kind (`morning` / `evening`).
    #[serde(default)]
    pub last_briefings: BTreeMap<String, BriefingMarker>,
    #[serde(default)]
    pub day: DayStats,
}

fn default_state_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl Default for FleetState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            updated_at: None,
            bots: BTreeMap::new(),
            cursors: BTreeMap::new(),
            last_briefings: BTreeMap::new(),
            day: DayStats::default(),
        }
    }
}

/// The issue registry plus the per-issue remediation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRegistry {
    #[serde(default = "default_issues_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Keyed by `issue_id`.
    #[serde(default)]
    pub issues: BTreeMap<String, Issue>,
    /// Remediation ledger, keyed by `issue_id`.
    #[serde(default)]
    pub remediation: BTreeMap<String, RemediationHistoryEntry>,
}

fn default_issues_schema_version() -> u32 {
    ISSUES_SCHEMA_VERSION
}

impl Default for IssueRegistry {
    fn default() -> Self {
        Self {
            schema_version: ISSUES_SCHEMA_VERSION,
            updated_at: None,
            issues: BTreeMap::new(),
            remediation: BTreeMap::new(),
        }
    }
}

impl IssueRegistry {
    /// Touch-open the issue for `(bot_id, fingerprint)`, creating it on
    /// first detection. Returns the issue id.
    pub fn touch(
        &mut self,
        bot_id: &str,
        fingerprint: &str,
        severity: Severity,
        summary: &str,
        now: DateTime<Utc>,
    ) -> String {
        let issue_id = format!("{bot_id}:{fingerprint}");
        self.issues
            .entry(issue_id.clone())
            .and_modify(|issue| issue.touch(severity, summary, now))
            .or_insert_with(|| Issue::new(bot_id, fingerprint, severity, summary, now));
        issue_id
    }

    /// Resolve the issue for `(bot_id, fingerprint)` if it is open.
    /// Returns true when a transition happened.
    pub fn resolve(&mut self, bot_id: &str, fingerprint: &str, now: DateTime<Utc>) -> bool {
        let issue_id = format!("{bot_id}:{fingerprint}");
        match self.issues.get_mut(&issue_id) {
            Some(issue) if issue.is_open() => {
                issue.resolve(now);
                true
            }
            _ => false,
        }
    }

    /// Resolve every open issue belonging to a bot. Returns the ids that
    /// transitioned.
    pub fn resolve_all_for_bot(&mut self, bot_id: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut resolved = Vec::new();
        for issue in self.issues.values_mut() {
            if issue.bot_id == bot_id && issue.is_open() {
                issue.resolve(now);
                resolved.push(issue.issue_id.clone());
            }
        }
        resolved
    }

    /// Open issues, in stable (id) order.
    #[must_use]
    pub fn open_issues(&self) -> Vec<&Issue> {
        self.issues.values().filter(|i| i.is_open()).collect()
    }

    /// Open issue count per severity: (p1, p2, p3).
    #[must_use]
    pub fn open_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for issue in self.issues.values().filter(|i| i.is_open()) {
            match issue.severity {
                Severity::P1 => counts.0 += 1,
                Severity::P2 => counts.1 += 1,
                Severity::P3 => counts.2 += 1,
            }
        }
        counts
    }
}
