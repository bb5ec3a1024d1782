//! Configuration documents: the main warden config and the remediation
//! policy. Both are JSON files merged over hard-coded defaults via
//! per-field serde defaults, so partial overrides are safe.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Main warden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// IANA time zone for quiet hours, briefing schedules and day rollover.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub briefings: BriefingsConfig,
    #[serde(default)]
    pub health_policy: HealthPolicy,
    /// Per-bot worker metadata, keyed by bot id.
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Directories receiving read-only state snapshots after each scan.
    #[serde(default)]
    pub sandbox_mirrors: Vec<PathBuf>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            alerting: AlertingConfig::default(),
            briefings: BriefingsConfig::default(),
            health_policy: HealthPolicy::default(),
            workers: BTreeMap::new(),
            paths: PathsConfig::default(),
            sandbox_mirrors: Vec::new(),
        }
    }
}

/// Alert policy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive failures before a P2 issue may page.
    #[serde(default = "default_p2_threshold")]
    pub p2_consecutive_failures: u32,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u32,
    #[serde(default)]
    pub quiet_hours: QuietHoursConfig,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            p2_consecutive_failures: default_p2_threshold(),
            cooldown_hours: default_cooldown_hours(),
            quiet_hours: QuietHoursConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_p2_threshold() -> u32 {
    3
}

fn default_cooldown_hours() -> u32 {
    2
}

/// Quiet-hours window bounds, local wall clock, `HH:MM`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursConfig {
    #[serde(default = "default_quiet_start")]
    pub start: String,
    #[serde(default = "default_quiet_end")]
    pub end: String,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            start: default_quiet_start(),
            end: default_quiet_end(),
        }
    }
}

fn default_quiet_start() -> String {
    "23:00".to_string()
}

fn default_quiet_end() -> String {
    "07:00".to_string()
}

/// Briefing schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefingsConfig {
    /// Local `HH:MM` at which the morning briefing renders.
    #[serde(default = "default_morning_time")]
    pub morning_time: String,
    /// Local `HH:MM` at which the evening briefing renders.
    #[serde(default = "default_evening_time")]
    pub evening_time: String,
    /// Hand rendered briefings to the notification transport.
    #[serde(default = "default_true")]
    pub send: bool,
}

impl Default for BriefingsConfig {
    fn default() -> Self {
        Self {
            morning_time: default_morning_time(),
            evening_time: default_evening_time(),
            send: true,
        }
    }
}

fn default_morning_time() -> String {
    "08:30".to_string()
}

fn default_evening_time() -> String {
    "21:30".to_string()
}

/// Staleness thresholds for composite health classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Heartbeat older than this opens a stall issue.
    #[serde(default = "default_heartbeat_stall")]
    pub heartbeat_stall_minutes: i64,
    /// Telemetry older than this degrades status to WARN.
    #[serde(default = "default_stale_warn")]
    pub stale_warn_minutes: i64,
    /// Telemetry older than this counts as a down signal.
    #[serde(default = "default_down_heartbeat")]
    pub down_heartbeat_minutes: i64,
    /// Window of channel log tailed for classification, in minutes.
    #[serde(default = "default_channel_log_window")]
    pub channel_log_window_minutes: i64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            heartbeat_stall_minutes: default_heartbeat_stall(),
            stale_warn_minutes: default_stale_warn(),
            down_heartbeat_minutes: default_down_heartbeat(),
            channel_log_window_minutes: default_channel_log_window(),
        }
    }
}

fn default_heartbeat_stall() -> i64 {
    30
}

fn default_stale_warn() -> i64 {
    45
}

fn default_down_heartbeat() -> i64 {
    90
}

fn default_channel_log_window() -> i64 {
    60
}

/// Per-bot worker metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_true")]
    pub active: bool,
    /// Container name for runtime introspection and `{container}` targets.
    #[serde(default)]
    pub container: Option<String>,
    /// A healthy Telegram channel may substitute for missing telemetry.
    #[serde(default)]
    pub telegram_fallback: bool,
    /// Telegram channel label, when the worker bridges one.
    #[serde(default)]
    pub telegram_channel: Option<String>,
}

impl WorkerConfig {
    /// Whether this worker has a Telegram channel worth inspecting.
    #[must_use]
    pub fn has_telegram(&self) -> bool {
        self.telegram_fallback || self.telegram_channel.is_some()
    }
}

/// Filesystem layout. All paths may be overridden per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the warden-owned state tree.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Root of the worker-owned telemetry tree (read-only to the warden).
    #[serde(default = "default_telemetry_dir")]
    pub telemetry_dir: PathBuf,
    /// Outbound notification bridge queue directory.
    #[serde(default = "default_bridge_outbox")]
    pub bridge_outbox: PathBuf,
    /// External command queue directory for remediation requests.
    #[serde(default = "default_command_queue")]
    pub command_queue: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            telemetry_dir: default_telemetry_dir(),
            bridge_outbox: default_bridge_outbox(),
            command_queue: default_command_queue(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("warden-state")
}

fn default_telemetry_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_bridge_outbox() -> PathBuf {
    PathBuf::from("bridge/outbox")
}

fn default_command_queue() -> PathBuf {
    PathBuf::from("commands/queue")
}

impl WardenConfig {
    /// Load the config from a JSON file, merging over defaults. A missing
    /// file yields the full default config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file missing, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Bot ids of active workers, in stable order.
    #[must_use]
    pub fn active_bots(&self) -> Vec<&str> {
        self.workers
            .iter()
            .filter(|(_, w)| w.active)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Remediation execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationMode {
    /// Match and log, never act.
    #[default]
    Shadow,
    /// Enqueue low-risk actions automatically.
    LowRiskAuto,
}

/// Global defaults applied to rules that omit their own limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationDefaults {
    #[serde(default = "default_rule_cooldown")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_rule_max_attempts")]
    pub max_attempts: u32,
    /// Reset the attempt ledger after the issue resolves.
    #[serde(default = "default_true")]
    pub rearm_after_recovery: bool,
}

impl Default for RemediationDefaults {
    fn default() -> Self {
        Self {
            cooldown_minutes: default_rule_cooldown(),
            max_attempts: default_rule_max_attempts(),
            rearm_after_recovery: true,
        }
    }
}

fn default_rule_cooldown() -> i64 {
    60
}

fn default_rule_max_attempts() -> u32 {
    2
}

/// One capability/action/target triple a rule may enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAction {
    pub capability: String,
    pub action: String,
    /// Symbolic target; `{container}` resolves to the worker's container.
    #[serde(default)]
    pub target: Option<String>,
}

/// A declarative remediation rule, matched in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Regex over issue ids (`<bot_id>:<fingerprint>`).
    pub issue_pattern: String,
    #[serde(default)]
    pub auto_actions: Vec<AutoAction>,
    #[serde(default)]
    pub cooldown_minutes: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Named escalation path once attempts are exhausted.
    #[serde(default)]
    pub escalation_rule: Option<String>,
}

/// The remediation policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationPolicy {
    #[serde(default)]
    pub mode: RemediationMode,
    #[serde(default)]
    pub defaults: RemediationDefaults,
    #[serde(default)]
    pub rules: Vec<RemediationRule>,
}

impl RemediationPolicy {
    /// Load the policy from a JSON file, merging over defaults. A missing
    /// file yields the default (shadow, no rules) policy.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "policy file missing, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse policy {}", path.display()))
    }

    /// Effective cooldown for a rule.
    #[must_use]
    pub fn cooldown_minutes(&self, rule: &RemediationRule) -> i64 {
        rule.cooldown_minutes.unwrap_or(self.defaults.cooldown_minutes)
    }

    /// Effective attempt cap for a rule.
    #[must_use]
    pub fn max_attempts(&self, rule: &RemediationRule) -> u32 {
        rule.max_attempts.unwrap_or(self.defaults.max_attempts)
    }
}
