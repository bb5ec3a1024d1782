//! Pure decision rules: fingerprinting, severity classification, event
//! schema validation, quiet hours, cooldown, and the alert-decision policy.
//!
//! Nothing in this module touches the filesystem or the clock; callers pass
//! `now` in so every rule is deterministic and directly testable.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::types::{Issue, Severity};

/// Fields every event line must carry to count toward failure detection.
pub const REQUIRED_EVENT_FIELDS: &[&str] = &[
    "schema_version",
    "ts",
    "bot_id",
    "run_id",
    "event_type",
    "status",
    "severity",
    "message",
    "component",
];

/// Hex chars of the derived fingerprint hash retained in issue ids.
const FINGERPRINT_LEN: usize = 12;

/// Validate an event against the required-field schema.
///
/// Returns the list of missing fields; empty means valid. A field counts as
/// missing when absent or null. Violations are reported by the caller, never
/// fatal.
#[must_use]
pub fn validate_event_schema(event: &Value) -> Vec<&'static str> {
    REQUIRED_EVENT_FIELDS
        .iter()
        .filter(|field| event.get(**field).is_none_or(Value::is_null))
        .copied()
        .collect()
}

/// Stable failure fingerprint for an event.
///
/// An explicit `fingerprint` field wins. Otherwise the fingerprint is a
/// truncated sha-256 over `(bot_id, component, error.type, error.code,
/// message)`, case- and whitespace-normalized, so identical failures always
/// dedupe to the same issue.
#[must_use]
pub fn fingerprint(event: &Value) -> String {
    if let Some(explicit) = event.get("fingerprint").and_then(Value::as_str) {
        let explicit = explicit.trim();
        if !explicit.is_empty() {
            return explicit.to_string();
        }
    }

    let parts = [
        str_field(event, "bot_id"),
        str_field(event, "component"),
        nested_str(event, "error", "type"),
        nested_str(event, "error", "code"),
        str_field(event, "message"),
    ];
    let normalized: Vec<String> = parts.iter().map(|p| normalize(p)).collect();

    let mut hasher = Sha256::new();
    hasher.update(normalized.join("|").as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

/// Classify event severity.
///
/// An explicit, well-formed `severity` field wins. Otherwise: permission or
/// secret-related failure text maps to P1, a generic error status to P2, a
/// warn status to P3, and everything else defaults to P3.
#[must_use]
pub fn classify_severity(event: &Value) -> Severity {
    if let Some(explicit) = event
        .get("severity")
        .and_then(Value::as_str)
        .and_then(Severity::parse)
    {
        return explicit;
    }

    let haystack = format!(
        "{} {} {}",
        str_field(event, "message"),
        nested_str(event, "error", "type"),
        nested_str(event, "error", "code"),
    )
    .to_lowercase();

    const CRITICAL_MARKERS: &[&str] = &[
        "permission",
        "unauthorized",
        "forbidden",
        "secret",
        "credential",
        "token expired",
        "invalid token",
    ];
    if CRITICAL_MARKERS.iter().any(|m| haystack.contains(m)) {
        return Severity::P1;
    }

    match str_field(event, "status").to_lowercase().as_str() {
        "error" => Severity::P2,
        "warn" => Severity::P3,
        _ => Severity::P3,
    }
}

fn str_field<'a>(event: &'a Value, field: &str) -> &'a str {
    event.get(field).and_then(Value::as_str).unwrap_or("")
}

fn nested_str<'a>(event: &'a Value, outer: &str, inner: &str) -> &'a str {
    event
        .get(outer)
        .and_then(|v| v.get(inner))
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A local time-of-day window, possibly wrapping midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl QuietWindow {
    /// Parse a window from `HH:MM` bounds. Malformed bounds yield a
    /// zero-width window (never quiet) with a warning.
    #[must_use]
    pub fn parse(start: &str, end: &str) -> Self {
        match (parse_hhmm(start), parse_hhmm(end)) {
            (Some(start_minute), Some(end_minute)) => Self {
                start_minute,
                end_minute,
            },
            _ => {
                warn!(start, end, "malformed quiet-hours window, disabling");
                Self {
                    start_minute: 0,
                    end_minute: 0,
                }
            }
        }
    }

    /// Zero-width window means "never quiet".
    #[must_use]
    pub const fn is_zero_width(&self) -> bool {
        self.start_minute == self.end_minute
    }
}

/// Parse `HH:MM` into a minute-of-day.
#[must_use]
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Resolve an IANA time-zone name, degrading to UTC on failure.
#[must_use]
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!(timezone = name, "unknown IANA time zone, falling back to UTC");
        Tz::UTC
    })
}

/// Whether `now` falls inside the quiet-hours window in the given zone.
///
/// Membership is `[start, end)` on the local wall-clock minute-of-day; a
/// window that wraps midnight (start > end) covers both sides.
#[must_use]
pub fn is_quiet_hours(now: DateTime<Utc>, tz: Tz, window: &QuietWindow) -> bool {
    if window.is_zero_width() {
        return false;
    }
    let local = now.with_timezone(&tz);
    let minute = local.hour() * 60 + local.minute();
    if window.start_minute < window.end_minute {
        minute >= window.start_minute && minute < window.end_minute
    } else {
        minute >= window.start_minute || minute < window.end_minute
    }
}

/// True iff the last alert is younger than the cooldown duration.
#[must_use]
pub fn is_cooldown_active(
    last_alert_ts: Option<DateTime<Utc>>,
    cooldown_hours: u32,
    now: DateTime<Utc>,
) -> bool {
    let Some(last) = last_alert_ts else {
        return false;
    };
    let age_minutes = (now - last).num_minutes();
    age_minutes < i64::from(cooldown_hours) * 60
}

/// Inputs to the alert-decision policy.
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    pub tz: Tz,
    pub quiet: QuietWindow,
    pub cooldown_hours: u32,
    /// Consecutive failures a P2 issue needs before it may page.
    pub p2_threshold: u32,
}

/// The alert decision and the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertDecision {
    pub send: bool,
    pub rule: &'static str,
}

impl AlertDecision {
    const fn hold(rule: &'static str) -> Self {
        Self { send: false, rule }
    }

    const fn fire(rule: &'static str) -> Self {
        Self { send: true, rule }
    }
}

/// Deterministic alert-decision state machine.
///
/// Evaluation order: P3 issues only ever appear in briefings; P2 issues must
/// reach the consecutive-failure threshold; non-P1 alerts hold during quiet
/// hours (the caller increments the suppression counter); anything inside
/// the cooldown window holds; otherwise fire, recording whether this was an
/// immediate P1 or a threshold-crossing P2.
#[must_use]
pub fn should_alert_now(issue: &Issue, policy: &AlertPolicy, now: DateTime<Utc>) -> AlertDecision {
    if issue.severity == Severity::P3 {
        return AlertDecision::hold("briefing_only");
    }

    if issue.severity == Severity::P2 && issue.consecutive_failures < policy.p2_threshold {
        return AlertDecision::hold("threshold_not_reached");
    }

    if issue.severity != Severity::P1 && is_quiet_hours(now, policy.tz, &policy.quiet) {
        return AlertDecision::hold("quiet_hours");
    }

    if is_cooldown_active(issue.last_alert_ts, policy.cooldown_hours, now) {
        return AlertDecision::hold("cooldown");
    }

    if issue.severity == Severity::P1 {
        AlertDecision::fire("p1_immediate")
    } else {
        AlertDecision::fire("p2_threshold")
    }
}
