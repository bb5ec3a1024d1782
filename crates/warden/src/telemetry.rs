//! Worker telemetry inputs.
//!
//! Each worker owns `<telemetry_root>/<bot_id>/` containing `latest.json`,
//! `heartbeat.json` and an append-only `events/*.jsonl` tree. Absence of a
//! file is itself a health signal, not an error; malformed documents degrade
//! with a warning. Nothing here ever writes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Rolling status document a worker rewrites after every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatestStatus {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub last_event_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_success_ts: Option<DateTime<Utc>>,
}

/// Liveness document a worker rewrites while running.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: Option<String>,
}

/// One raw event line drained from the append-only log.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub value: Value,
    /// Telemetry-relative path of the file the line came from.
    pub log_path: String,
    /// Parsed event timestamp, when the line carried one.
    pub ts: Option<DateTime<Utc>>,
}

/// Result of draining unseen event lines for one bot.
#[derive(Debug, Default)]
pub struct EventBatch {
    pub events: Vec<RawEvent>,
    /// Highest event timestamp seen; the new cursor position.
    pub max_ts: Option<DateTime<Utc>>,
    /// Lines that were not parseable JSON at all.
    pub unparseable_lines: u32,
}

/// Read-only access to the worker telemetry tree.
pub struct TelemetryReader {
    root: PathBuf,
}

impl TelemetryReader {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn bot_dir(&self, bot_id: &str) -> PathBuf {
        self.root.join(bot_id)
    }

    /// Load `latest.json`. `None` when absent or unreadable.
    #[must_use]
    pub fn latest(&self, bot_id: &str) -> Option<LatestStatus> {
        self.read_json(bot_id, "latest.json")
    }

    /// Load `heartbeat.json`. `None` when absent or unreadable.
    #[must_use]
    pub fn heartbeat(&self, bot_id: &str) -> Option<Heartbeat> {
        self.read_json(bot_id, "heartbeat.json")
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, bot_id: &str, name: &str) -> Option<T> {
        let path = self.bot_dir(bot_id).join(name);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(bot_id, file = name, "malformed telemetry document: {e}");
                None
            }
        }
    }

    /// Drain event lines newer than `cursor` from `events/*.jsonl`.
    ///
    /// Lines at or before the cursor have already been evaluated and are
    /// skipped; lines without a parseable timestamp cannot be watermarked
    /// and are always included (the registry dedupes the resulting
    /// schema-violation reports).
    pub fn drain_events(
        &self,
        bot_id: &str,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<EventBatch> {
        let events_dir = self.bot_dir(bot_id).join("events");
        let mut batch = EventBatch::default();
        if !events_dir.is_dir() {
            return Ok(batch);
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&events_dir)
            .with_context(|| format!("Failed to list {}", events_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();

        for file in files {
            let raw = match fs::read_to_string(&file) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(bot_id, file = %file.display(), "unreadable event log: {e}");
                    continue;
                }
            };
            let log_path = file
                .strip_prefix(&self.root)
                .unwrap_or(&file)
                .display()
                .to_string();

            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(_) => {
                        batch.unparseable_lines += 1;
                        continue;
                    }
                };
                let ts = event_ts(&value);
                if let Some(ts) = ts {
                    if cursor.is_some_and(|c| ts <= c) {
                        continue;
                    }
                    if batch.max_ts.is_none_or(|m| ts > m) {
                        batch.max_ts = Some(ts);
                    }
                }
                batch.events.push(RawEvent {
                    value,
                    log_path: log_path.clone(),
                    ts,
                });
            }
        }

        debug!(
            bot_id,
            drained = batch.events.len(),
            unparseable = batch.unparseable_lines,
            "drained event log"
        );
        Ok(batch)
    }
}

/// Parse the `ts` field of an event line.
#[must_use]
pub fn event_ts(event: &Value) -> Option<DateTime<Utc>> {
    event
        .get("ts")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Channel-failure classification of a worker's log tail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelLogReport {
    /// Auth-invalid failures after the most recent provider start.
    pub auth_invalid: u32,
    /// Generic channel exits after the most recent provider start.
    pub channel_exits: u32,
    /// Provider start markers seen in the window.
    pub provider_starts: u32,
}

fn provider_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)telegram provider start(?:ed|ing)").unwrap())
}

fn auth_invalid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:401 unauthorized|auth(?:orization)? (?:failed|invalid)|invalid (?:bot )?token)")
            .unwrap()
    })
}

fn channel_exit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)telegram provider (?:exited|stopped|crashed|disconnected)").unwrap()
    })
}

/// Classify channel failures in a raw log tail.
///
/// Only occurrences after the most recent provider-start marker count, so
/// failures from before a restart cannot re-trigger an issue.
#[must_use]
pub fn classify_channel_log(text: &str) -> ChannelLogReport {
    let mut report = ChannelLogReport::default();

    let mut active_slice = text;
    for m in provider_start_re().find_iter(text) {
        report.provider_starts += 1;
        active_slice = &text[m.end()..];
    }

    report.auth_invalid = u32::try_from(auth_invalid_re().find_iter(active_slice).count())
        .unwrap_or(u32::MAX);
    report.channel_exits = u32::try_from(channel_exit_re().find_iter(active_slice).count())
        .unwrap_or(u32::MAX);

    report
}
