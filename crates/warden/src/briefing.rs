//! Scheduled briefing generation.
//!
//! Briefings render at most once per calendar day per type, gated by the
//! configured local time-of-day and the sent marker persisted in
//! `state.json`. Rendering is plain markdown string building.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::WardenConfig;
use crate::queue::{BridgeEnvelope, FileQueue};
use crate::rules::{parse_hhmm, resolve_timezone};
use crate::store::StateStore;
use crate::types::{BriefingMarker, FleetState, HealthStatus, IssueRegistry};

/// The two daily briefing types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BriefingKind {
    Morning,
    Evening,
}

impl BriefingKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Evening => "evening",
        }
    }

    /// Configured local `HH:MM` for this kind.
    #[must_use]
    pub fn scheduled_time(self, config: &WardenConfig) -> String {
        match self {
            Self::Morning => config.briefings.morning_time.clone(),
            Self::Evening => config.briefings.evening_time.clone(),
        }
    }
}

/// Whether this briefing was already generated for the local calendar day.
#[must_use]
pub fn already_sent_today(kind: BriefingKind, state: &FleetState, today: NaiveDate) -> bool {
    state
        .last_briefings
        .get(kind.as_str())
        .is_some_and(|marker| marker.date == today)
}

/// Schedule gate: the local wall clock is at the configured minute and the
/// briefing has not been generated today.
#[must_use]
pub fn is_due(
    kind: BriefingKind,
    config: &WardenConfig,
    state: &FleetState,
    now: DateTime<Utc>,
) -> bool {
    let tz = resolve_timezone(&config.timezone);
    let local = now.with_timezone(&tz);
    let Some(scheduled) = parse_hhmm(&kind.scheduled_time(config)) else {
        return false;
    };
    let minute_of_day = local.hour() * 60 + local.minute();
    minute_of_day == scheduled && !already_sent_today(kind, state, local.date_naive())
}

/// Render, persist, optionally deliver, and mark a briefing.
///
/// Returns the report path. The caller is responsible for gating (either
/// [`is_due`] during a scan, or the CLI's explicit invocation).
pub fn generate(
    kind: BriefingKind,
    store: &StateStore,
    bridge: &FileQueue,
    state: &mut FleetState,
    registry: &IssueRegistry,
    config: &WardenConfig,
    send: bool,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let tz = resolve_timezone(&config.timezone);
    let local = now.with_timezone(&tz);
    let today = local.date_naive();

    let text = match kind {
        BriefingKind::Morning => render_morning(state, registry, config, now),
        BriefingKind::Evening => render_evening(state, registry, config, now),
    };

    let name = format!("briefing-{}-{}.md", kind.as_str(), today);
    let path = store.write_report(&name, &text)?;

    if send && config.briefings.send {
        let task_id = format!("briefing-{}-{}", kind.as_str(), today);
        let envelope = BridgeEnvelope::new(&task_id, &text, "briefing", now);
        bridge.enqueue(&task_id, &envelope)?;
        debug!(kind = kind.as_str(), "briefing handed to transport");
    }

    state.last_briefings.insert(
        kind.as_str().to_string(),
        BriefingMarker {
            date: today,
            sent_at: now,
        },
    );
    info!(kind = kind.as_str(), path = %path.display(), "briefing generated");
    Ok(path)
}

/// Morning briefing: fleet table, open issues with evidence, overnight
/// resolutions, staleness notes.
#[must_use]
pub fn render_morning(
    state: &FleetState,
    registry: &IssueRegistry,
    config: &WardenConfig,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    writeln!(out, "# ☀️ Morning Briefing - {}", now.format("%Y-%m-%d")).unwrap();
    writeln!(out).unwrap();

    render_fleet_table(&mut out, state);

    let open = registry.open_issues();
    writeln!(out, "## Open Issues ({})", open.len()).unwrap();
    if open.is_empty() {
        writeln!(out, "No open issues. 🎉").unwrap();
    } else {
        for issue in &open {
            writeln!(
                out,
                "- **{}** `{}` - {} ({} consecutive failures, first seen {})",
                issue.severity.as_str(),
                issue.issue_id,
                issue.summary,
                issue.consecutive_failures,
                issue.first_seen_ts.format("%Y-%m-%d %H:%M")
            )
            .unwrap();
            if let Some(run) = issue.evidence.run_ids.last() {
                writeln!(out, "    - last run: {run}").unwrap();
            }
            if let Some(log) = issue.evidence.log_paths.last() {
                writeln!(out, "    - log: `{log}`").unwrap();
            }
        }
    }
    writeln!(out).unwrap();

    // Resolved since the previous morning briefing.
    let since = state
        .last_briefings
        .get(BriefingKind::Morning.as_str())
        .map(|marker| marker.sent_at);
    let resolved: Vec<_> = registry
        .issues
        .values()
        .filter(|i| !i.is_open())
        .filter(|i| match (i.resolved_at, since) {
            (Some(at), Some(since)) => at > since,
            (Some(_), None) => true,
            _ => false,
        })
        .collect();
    if !resolved.is_empty() {
        writeln!(out, "## Resolved Since Last Briefing").unwrap();
        for issue in resolved {
            writeln!(
                out,
                "- `{}` - {} (resolved {})",
                issue.issue_id,
                issue.summary,
                issue
                    .resolved_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default()
            )
            .unwrap();
        }
        writeln!(out).unwrap();
    }

    render_staleness_notes(&mut out, state, config);
    out
}

/// Evening briefing: day totals, current health, carried-over issues, next
/// scheduled checks.
#[must_use]
pub fn render_evening(
    state: &FleetState,
    registry: &IssueRegistry,
    config: &WardenConfig,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    writeln!(out, "# 🌙 Evening Briefing - {}", now.format("%Y-%m-%d")).unwrap();
    writeln!(out).unwrap();

    let (p1, p2, p3) = registry.open_counts();
    writeln!(out, "## Day Totals").unwrap();
    writeln!(out, "- Runs observed: {}", state.day.runs_observed).unwrap();
    writeln!(out, "- Retries recovered: {}", state.day.retries_recovered).unwrap();
    writeln!(out, "- Open issues: {p1} P1 / {p2} P2 / {p3} P3").unwrap();
    writeln!(out).unwrap();

    render_fleet_table(&mut out, state);

    let open = registry.open_issues();
    if !open.is_empty() {
        writeln!(out, "## Carried-Over Issues").unwrap();
        for issue in &open {
            writeln!(
                out,
                "- **{}** `{}` - {}",
                issue.severity.as_str(),
                issue.issue_id,
                issue.summary
            )
            .unwrap();
        }
        writeln!(out).unwrap();
    }

    writeln!(out, "## Next Checks").unwrap();
    writeln!(
        out,
        "- Morning briefing at {} ({})",
        config.briefings.morning_time, config.timezone
    )
    .unwrap();
    writeln!(
        out,
        "- Evening briefing at {} ({})",
        config.briefings.evening_time, config.timezone
    )
    .unwrap();
    out
}

fn render_fleet_table(out: &mut String, state: &FleetState) {
    writeln!(out, "## Fleet Status").unwrap();
    if state.bots.is_empty() {
        writeln!(out, "No bots scanned yet.").unwrap();
        writeln!(out).unwrap();
        return;
    }
    writeln!(out, "| Bot | Status | Signal | Staleness | Last success |").unwrap();
    writeln!(out, "|-----|--------|--------|-----------|--------------|").unwrap();
    for (bot_id, health) in &state.bots {
        writeln!(
            out,
            "| {} | {} | {} | {} | {} |",
            bot_id,
            health.status.as_str(),
            health.signal_source.as_str(),
            health
                .staleness_minutes
                .map_or_else(|| "n/a".to_string(), |m| format!("{m}m")),
            health
                .last_success_ts
                .map_or_else(|| "never".to_string(), |t| t
                    .format("%Y-%m-%d %H:%M")
                    .to_string()),
        )
        .unwrap();
    }
    writeln!(out).unwrap();
}

fn render_staleness_notes(out: &mut String, state: &FleetState, config: &WardenConfig) {
    let stale: Vec<_> = state
        .bots
        .iter()
        .filter(|(_, h)| {
            h.staleness_minutes
                .is_none_or(|m| m > config.health_policy.stale_warn_minutes)
        })
        .collect();
    if stale.is_empty() {
        return;
    }
    writeln!(out, "## Staleness Notes").unwrap();
    for (bot_id, health) in stale {
        match health.staleness_minutes {
            Some(minutes) => {
                writeln!(out, "- {bot_id}: telemetry is {minutes} minutes old").unwrap();
            }
            None => writeln!(out, "- {bot_id}: no telemetry signal observed").unwrap(),
        }
    }
    writeln!(out).unwrap();
}
