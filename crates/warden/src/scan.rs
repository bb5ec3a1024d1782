//! The supervisor scan loop.
//!
//! One invocation reconciles every active worker's telemetry into a
//! composite health snapshot, updates the issue registry, evaluates the
//! remediation and alert policies, renders scheduled briefings and mirrors
//! read-only snapshots. Execution is single-threaded and synchronous; the
//! only waiting is on the runtime introspection calls.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alerts::{evaluate_alerts, AlertOutcome};
use crate::briefing::{self, BriefingKind};
use crate::config::{RemediationPolicy, WardenConfig, WorkerConfig};
use crate::queue::{CommandQueue, FileQueue};
use crate::remediation::{rearm_recovered, RemediationEngine, RemediationOutcome};
use crate::rules::{
    classify_severity, fingerprint, resolve_timezone, validate_event_schema, AlertPolicy,
    QuietWindow,
};
use crate::runtime::ContainerRuntime;
use crate::store::StateStore;
use crate::telemetry::{classify_channel_log, TelemetryReader};
use crate::types::{
    BotHealth, FleetState, HealthStatus, IssueRegistry, ScanCursor, Severity, SignalSource,
    TelegramChannelState,
};

/// Synthetic issue fingerprints owned by the scan itself.
pub const FP_BOT_DOWN: &str = "bot_down";
pub const FP_NO_SIGNAL: &str = "no_signal";
pub const FP_HEARTBEAT_STALL: &str = "heartbeat_stall";
pub const FP_TELEGRAM_AUTH: &str = "telegram_auth";
pub const FP_TELEGRAM_EXIT: &str = "telegram_exit";
pub const FP_SCHEMA_VIOLATION: &str = "schema_violation";

/// Per-bot outcome of one scan pass.
#[derive(Debug, Clone, Serialize)]
pub struct BotScanSummary {
    pub bot_id: String,
    pub status: HealthStatus,
    pub signal_source: SignalSource,
    pub events_drained: usize,
    pub schema_violations: u32,
    pub issues_touched: Vec<String>,
    pub issues_resolved: Vec<String>,
}

/// Report emitted by a full scan invocation.
#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub scan_time: DateTime<Utc>,
    pub bots: Vec<BotScanSummary>,
    pub open_issues: usize,
    pub alerts: Vec<AlertOutcome>,
    pub remediations: Vec<RemediationOutcome>,
    /// Paths of briefings rendered during this scan.
    pub briefings: Vec<String>,
}

/// Build the alert policy inputs from the main config.
#[must_use]
pub fn alert_policy(config: &WardenConfig) -> AlertPolicy {
    AlertPolicy {
        tz: resolve_timezone(&config.timezone),
        quiet: QuietWindow::parse(
            &config.alerting.quiet_hours.start,
            &config.alerting.quiet_hours.end,
        ),
        cooldown_hours: config.alerting.cooldown_hours,
        p2_threshold: config.alerting.p2_consecutive_failures,
    }
}

/// The orchestrator composing rules, store, telemetry, runtime and queues.
pub struct Supervisor<'a> {
    config: &'a WardenConfig,
    policy: &'a RemediationPolicy,
    store: &'a StateStore,
    telemetry: &'a TelemetryReader,
    runtime: &'a dyn ContainerRuntime,
    bridge: &'a FileQueue,
    commands: &'a CommandQueue,
}

impl<'a> Supervisor<'a> {
    #[must_use]
    pub fn new(
        config: &'a WardenConfig,
        policy: &'a RemediationPolicy,
        store: &'a StateStore,
        telemetry: &'a TelemetryReader,
        runtime: &'a dyn ContainerRuntime,
        bridge: &'a FileQueue,
        commands: &'a CommandQueue,
    ) -> Self {
        Self {
            config,
            policy,
            store,
            telemetry,
            runtime,
            bridge,
            commands,
        }
    }

    /// Run one full scan to completion.
    ///
    /// `deliver_alerts` is the CLI-level send gate; alerting must also be
    /// enabled in config for anything to reach the transport.
    pub fn run_scan(&self, deliver_alerts: bool, now: DateTime<Utc>) -> Result<ScanReport> {
        let _lock = self.store.acquire_scan_lock(now)?;

        let mut state = self.store.read_state()?;
        let mut registry = self.store.read_issues()?;

        let tz = resolve_timezone(&self.config.timezone);
        state.day.roll(now.with_timezone(&tz).date_naive());

        let mut summaries = Vec::new();
        for bot_id in self.config.active_bots() {
            let worker = &self.config.workers[bot_id];
            let summary = self.scan_bot(bot_id, worker, &mut state, &mut registry, now);
            info!(
                bot_id,
                status = summary.status.as_str(),
                signal = summary.signal_source.as_str(),
                "bot scanned"
            );
            summaries.push(summary);
        }

        let rearmed = rearm_recovered(&mut registry, self.policy);
        if rearmed > 0 {
            debug!(rearmed, "remediation ledgers re-armed");
        }

        let engine = RemediationEngine::new(self.policy, self.config, self.commands);
        let remediations = engine.evaluate(&mut registry, now)?;

        let deliver = deliver_alerts && self.config.alerting.enabled;
        let alerts = evaluate_alerts(
            self.store,
            self.bridge,
            &mut registry,
            &alert_policy(self.config),
            deliver,
            now,
        )?;

        let mut briefings = Vec::new();
        for kind in [BriefingKind::Morning, BriefingKind::Evening] {
            if briefing::is_due(kind, self.config, &state, now) {
                let path = briefing::generate(
                    kind,
                    self.store,
                    self.bridge,
                    &mut state,
                    &registry,
                    self.config,
                    deliver_alerts,
                    now,
                )?;
                briefings.push(path.display().to_string());
            }
        }

        state.updated_at = Some(now);
        registry.updated_at = Some(now);
        self.store.write_issues(&registry)?;
        self.store.write_state(&state)?;

        for mirror in &self.config.sandbox_mirrors {
            self.store.mirror_snapshot(mirror)?;
        }

        Ok(ScanReport {
            scan_time: now,
            bots: summaries,
            open_issues: registry.open_issues().len(),
            alerts,
            remediations,
            briefings,
        })
    }

    /// Scan one worker: gather telemetry, drain events, classify composite
    /// health, update the registry, overwrite the health snapshot.
    fn scan_bot(
        &self,
        bot_id: &str,
        worker: &WorkerConfig,
        state: &mut FleetState,
        registry: &mut IssueRegistry,
        now: DateTime<Utc>,
    ) -> BotScanSummary {
        let mut touched: Vec<String> = Vec::new();
        let mut resolved: Vec<String> = Vec::new();

        // 1. Status documents. Absence is a signal, not an error.
        let latest = self.telemetry.latest(bot_id);
        let heartbeat = self.telemetry.heartbeat(bot_id);

        // 2. Container state, degraded to unsupported on any failure.
        let container = worker
            .container
            .as_deref()
            .map(|name| self.runtime.inspect(name))
            .unwrap_or_default();

        // 3. Channel log classification.
        let mut telegram = TelegramChannelState::default();
        if worker.has_telegram() {
            if let Some(name) = worker.container.as_deref() {
                let since =
                    now - Duration::minutes(self.config.health_policy.channel_log_window_minutes);
                if let Some(text) = self.runtime.tail_logs(name, since) {
                    let report = classify_channel_log(&text);
                    telegram.checked = true;
                    telegram.auth_failures = report.auth_invalid;
                    telegram.channel_exits = report.channel_exits;
                }
            }
        }

        // 4. Staleness against the freshest telemetry timestamp.
        let heartbeat_ts = heartbeat.as_ref().and_then(|h| h.ts);
        let latest_ts = latest.as_ref().and_then(|l| l.last_event_ts);
        let freshest = heartbeat_ts.into_iter().chain(latest_ts).max();
        let staleness_minutes = freshest.map(|ts| (now - ts).num_minutes());

        let mut signal_source = match (latest.is_some(), heartbeat.is_some()) {
            (true, true) => SignalSource::LatestAndHeartbeat,
            (true, false) => SignalSource::Latest,
            (false, true) => SignalSource::Heartbeat,
            (false, false) => SignalSource::None,
        };

        // 5. Drain unseen event lines.
        let cursor = state.cursors.get(bot_id).copied().unwrap_or_default();
        let batch = match self.telemetry.drain_events(bot_id, cursor.max_event_ts) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(bot_id, "event drain failed: {e:#}");
                crate::telemetry::EventBatch::default()
            }
        };

        let mut runs_observed = 0u32;
        let mut retries_recovered = 0u32;
        let mut last_run_ts = latest_ts;
        let mut last_success_ts = latest.as_ref().and_then(|l| l.last_success_ts);
        let mut event_status: Option<HealthStatus> = None;
        let mut schema_violations = batch.unparseable_lines;
        let mut violation_log: Option<String> = None;

        for raw in &batch.events {
            let missing = validate_event_schema(&raw.value);
            if !missing.is_empty() {
                schema_violations += 1;
                violation_log.get_or_insert_with(|| raw.log_path.clone());
                warn!(bot_id, missing = ?missing, "event failed schema validation");
                continue;
            }

            let event_type = raw.value["event_type"].as_str().unwrap_or("");
            let status = raw.value["status"].as_str().unwrap_or("");
            match event_type {
                "retry" => retries_recovered += 1,
                "end" => {
                    runs_observed += 1;
                    if raw.ts.is_some() {
                        last_run_ts = raw.ts;
                    }
                    match status {
                        "ok" | "warn" => {
                            resolved.extend(registry.resolve_all_for_bot(bot_id, now));
                            event_status = Some(if status == "ok" {
                                last_success_ts = raw.ts.or(last_success_ts);
                                HealthStatus::Ok
                            } else {
                                HealthStatus::Warn
                            });
                        }
                        "error" => {
                            let fp = fingerprint(&raw.value);
                            let severity = classify_severity(&raw.value);
                            let summary = raw.value["message"].as_str().unwrap_or("run failed");
                            let id = registry.touch(bot_id, &fp, severity, summary, now);
                            if let Some(issue) = registry.issues.get_mut(&id) {
                                if let Some(run_id) = raw.value["run_id"].as_str() {
                                    issue.evidence.push_run(run_id);
                                }
                                issue.evidence.push_log(&raw.log_path);
                            }
                            touched.push(id);
                            event_status = Some(HealthStatus::Error);
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        // Schema violations surface as their own deduplicated issue.
        if schema_violations > 0 {
            let id = registry.touch(
                bot_id,
                FP_SCHEMA_VIOLATION,
                Severity::P3,
                &format!("{schema_violations} event lines failed schema validation"),
                now,
            );
            if let (Some(issue), Some(log)) = (registry.issues.get_mut(&id), &violation_log) {
                issue.evidence.push_log(log);
            }
            touched.push(id);
        } else if registry.resolve(bot_id, FP_SCHEMA_VIOLATION, now) {
            resolved.push(format!("{bot_id}:{FP_SCHEMA_VIOLATION}"));
        }

        // Advance the cursor past everything evaluated this scan.
        if let Some(max_ts) = batch.max_ts {
            let advanced = match cursor.max_event_ts {
                Some(existing) if existing >= max_ts => existing,
                _ => max_ts,
            };
            state.cursors.insert(
                bot_id.to_string(),
                ScanCursor {
                    max_event_ts: Some(advanced),
                },
            );
        }

        // 6. Composite DOWN requires corroboration: stale-or-missing
        // telemetry alone never establishes DOWN for a running container.
        let no_signal = latest.is_none() && heartbeat.is_none();
        let telemetry_down = no_signal
            || staleness_minutes
                .is_some_and(|m| m > self.config.health_policy.down_heartbeat_minutes);
        let corroborated = container.confirmed_stopped() || telegram.is_failing();
        let is_down = telemetry_down && corroborated;

        let mut status;
        if is_down {
            status = HealthStatus::Down;
            let id = registry.touch(
                bot_id,
                FP_BOT_DOWN,
                Severity::P1,
                &down_summary(&container, &telegram),
                now,
            );
            touched.push(id);
        } else {
            if registry.resolve(bot_id, FP_BOT_DOWN, now) {
                resolved.push(format!("{bot_id}:{FP_BOT_DOWN}"));
            }

            if no_signal {
                if worker.telegram_fallback && telegram.is_healthy() {
                    // A healthy channel substitutes for telemetry.
                    signal_source = SignalSource::TelegramFallback;
                    status = HealthStatus::Ok;
                    if registry.resolve(bot_id, FP_NO_SIGNAL, now) {
                        resolved.push(format!("{bot_id}:{FP_NO_SIGNAL}"));
                    }
                } else {
                    status = HealthStatus::Unknown;
                    let id = registry.touch(
                        bot_id,
                        FP_NO_SIGNAL,
                        Severity::P2,
                        "no telemetry signal (latest and heartbeat both missing)",
                        now,
                    );
                    touched.push(id);
                }
            } else {
                if registry.resolve(bot_id, FP_NO_SIGNAL, now) {
                    resolved.push(format!("{bot_id}:{FP_NO_SIGNAL}"));
                }
                status = event_status.unwrap_or_else(|| {
                    status_from_latest(latest.as_ref().and_then(|l| l.status.as_deref()))
                });
                if staleness_minutes
                    .is_some_and(|m| m > self.config.health_policy.stale_warn_minutes)
                {
                    status = status.worst(HealthStatus::Warn);
                }
            }
        }

        // 7a. Heartbeat stall, tracked only while the bot is not DOWN.
        let hb_stalled = heartbeat.is_some()
            && heartbeat_ts.map_or(true, |ts| {
                (now - ts).num_minutes() > self.config.health_policy.heartbeat_stall_minutes
            });
        if hb_stalled && !is_down {
            let id = registry.touch(
                bot_id,
                FP_HEARTBEAT_STALL,
                Severity::P2,
                "heartbeat has stalled",
                now,
            );
            touched.push(id);
            status = status.worst(HealthStatus::Warn);
        } else if !hb_stalled && registry.resolve(bot_id, FP_HEARTBEAT_STALL, now) {
            resolved.push(format!("{bot_id}:{FP_HEARTBEAT_STALL}"));
        }

        // 7b. Channel failures, resolved as soon as the log looks clean.
        if telegram.checked {
            if telegram.auth_failures > 0 {
                let id = registry.touch(
                    bot_id,
                    FP_TELEGRAM_AUTH,
                    Severity::P1,
                    "telegram auth invalid (token rejected)",
                    now,
                );
                touched.push(id);
            } else if registry.resolve(bot_id, FP_TELEGRAM_AUTH, now) {
                resolved.push(format!("{bot_id}:{FP_TELEGRAM_AUTH}"));
            }

            if telegram.channel_exits > 0 {
                let id = registry.touch(
                    bot_id,
                    FP_TELEGRAM_EXIT,
                    Severity::P2,
                    "telegram provider exited since last start",
                    now,
                );
                touched.push(id);
            } else if registry.resolve(bot_id, FP_TELEGRAM_EXIT, now) {
                resolved.push(format!("{bot_id}:{FP_TELEGRAM_EXIT}"));
            }
        }

        // 8. Overwrite the rolling snapshot and bump day totals.
        state.day.runs_observed += runs_observed;
        state.day.retries_recovered += retries_recovered;
        state.bots.insert(
            bot_id.to_string(),
            BotHealth {
                bot_id: bot_id.to_string(),
                status,
                signal_source,
                container,
                telegram,
                staleness_minutes,
                runs_observed,
                retries_recovered,
                last_success_ts,
                last_run_ts,
                updated_at: Some(now),
            },
        );

        BotScanSummary {
            bot_id: bot_id.to_string(),
            status,
            signal_source,
            events_drained: batch.events.len(),
            schema_violations,
            issues_touched: touched,
            issues_resolved: resolved,
        }
    }
}

fn status_from_latest(status: Option<&str>) -> HealthStatus {
    match status {
        Some("ok") => HealthStatus::Ok,
        Some("warn") => HealthStatus::Warn,
        Some("error") => HealthStatus::Error,
        _ => HealthStatus::Unknown,
    }
}

fn down_summary(
    container: &crate::types::ContainerState,
    telegram: &TelegramChannelState,
) -> String {
    if container.confirmed_stopped() {
        format!(
            "worker is down (telemetry stale, container {})",
            container.state.as_deref().unwrap_or("stopped")
        )
    } else if telegram.is_failing() {
        "worker is down (telemetry stale, channel failing)".to_string()
    } else {
        "worker is down".to_string()
    }
}

/// Render a scan report for human eyes.
#[must_use]
pub fn format_report_text(report: &ScanReport) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    writeln!(out, "=== Fleet Scan Report ===").unwrap();
    writeln!(out, "Time: {}", report.scan_time).unwrap();
    writeln!(out).unwrap();

    for bot in &report.bots {
        writeln!(
            out,
            "  {} [{}] signal={} events={} violations={}",
            bot.bot_id,
            bot.status.as_str(),
            bot.signal_source.as_str(),
            bot.events_drained,
            bot.schema_violations
        )
        .unwrap();
        for id in &bot.issues_touched {
            writeln!(out, "    + {id}").unwrap();
        }
        for id in &bot.issues_resolved {
            writeln!(out, "    - {id} (resolved)").unwrap();
        }
    }

    writeln!(out).unwrap();
    writeln!(out, "Open issues: {}", report.open_issues).unwrap();

    let sent = report.alerts.iter().filter(|a| a.sent).count();
    writeln!(
        out,
        "Alerts: {} sent, {} held",
        sent,
        report.alerts.len() - sent
    )
    .unwrap();
    writeln!(out, "Remediations: {}", report.remediations.len()).unwrap();
    for briefing in &report.briefings {
        writeln!(out, "Briefing rendered: {briefing}").unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::StaticRuntime;
    use chrono::TimeZone;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn config() -> WardenConfig {
        serde_json::from_str(
            r#"{
                "timezone": "UTC",
                "workers": {
                    "ledger": {"container": "ledger-bot"},
                    "courier": {"container": "courier-bot", "telegram_fallback": true}
                }
            }"#,
        )
        .unwrap()
    }

    struct Fixture {
        temp: tempfile::TempDir,
        config: WardenConfig,
        policy: RemediationPolicy,
    }

    impl Fixture {
        fn new(config: WardenConfig) -> Self {
            Self {
                temp: tempdir().unwrap(),
                config,
                policy: RemediationPolicy::default(),
            }
        }

        fn telemetry_root(&self) -> std::path::PathBuf {
            self.temp.path().join("logs")
        }

        fn write_telemetry(&self, bot: &str, name: &str, content: &str) {
            let dir = self.telemetry_root().join(bot);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(name), content).unwrap();
        }

        fn write_event_lines(&self, bot: &str, lines: &[&str]) {
            let dir = self.telemetry_root().join(bot).join("events");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("2026-03.jsonl"), lines.join("\n")).unwrap();
        }

        fn run(&self, runtime: &dyn ContainerRuntime, at: DateTime<Utc>) -> ScanReport {
            let store =
                StateStore::open(&self.temp.path().join("state"), &self.telemetry_root()).unwrap();
            let telemetry = TelemetryReader::new(self.telemetry_root());
            let bridge = FileQueue::open(&self.temp.path().join("bridge")).unwrap();
            let commands = CommandQueue::open(&self.temp.path().join("commands")).unwrap();
            let supervisor = Supervisor::new(
                &self.config,
                &self.policy,
                &store,
                &telemetry,
                runtime,
                &bridge,
                &commands,
            );
            supervisor.run_scan(true, at).unwrap()
        }

        fn read_issues(&self) -> IssueRegistry {
            let store =
                StateStore::open(&self.temp.path().join("state"), &self.telemetry_root()).unwrap();
            store.read_issues().unwrap()
        }

        fn read_state(&self) -> FleetState {
            let store =
                StateStore::open(&self.temp.path().join("state"), &self.telemetry_root()).unwrap();
            store.read_state().unwrap()
        }
    }

    fn fresh_heartbeat(at: DateTime<Utc>) -> String {
        format!(r#"{{"run_id": "run-1", "ts": "{}", "state": "idle"}}"#, at.to_rfc3339())
    }

    fn fresh_latest(at: DateTime<Utc>, status: &str) -> String {
        format!(
            r#"{{"run_id": "run-1", "last_event_ts": "{}", "status": "{status}", "last_success_ts": "{}"}}"#,
            at.to_rfc3339(),
            at.to_rfc3339()
        )
    }

    fn event_line(ts: DateTime<Utc>, event_type: &str, status: &str, message: &str) -> String {
        format!(
            r#"{{"schema_version": 1, "ts": "{}", "bot_id": "ledger", "run_id": "run-9", "event_type": "{event_type}", "status": "{status}", "severity": "P2", "message": "{message}", "component": "runner"}}"#,
            ts.to_rfc3339()
        )
    }

    fn only_bot(config_json: &str) -> WardenConfig {
        serde_json::from_str(config_json).unwrap()
    }

    #[test]
    fn test_healthy_bot_scans_ok() {
        let fixture = Fixture::new(config());
        fixture.write_telemetry("ledger", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("ledger", "latest.json", &fresh_latest(now(), "ok"));
        fixture.write_telemetry("courier", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("courier", "latest.json", &fresh_latest(now(), "ok"));

        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");
        runtime.running("courier-bot");
        runtime.set_logs("courier-bot", "telegram provider started\n");

        let report = fixture.run(&runtime, now());
        assert_eq!(report.open_issues, 0);
        let ledger = report.bots.iter().find(|b| b.bot_id == "ledger").unwrap();
        assert_eq!(ledger.status, HealthStatus::Ok);
        assert_eq!(ledger.signal_source, SignalSource::LatestAndHeartbeat);
    }

    #[test]
    fn test_composite_down_requires_corroboration() {
        let config = only_bot(r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#);
        let fixture = Fixture::new(config);
        // Telemetry is ancient.
        let old = now() - Duration::minutes(300);
        fixture.write_telemetry("ledger", "heartbeat.json", &fresh_heartbeat(old));
        fixture.write_telemetry("ledger", "latest.json", &fresh_latest(old, "ok"));

        // Running container, no channel signal: NOT down, just stale.
        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");
        let report = fixture.run(&runtime, now());
        let ledger = &report.bots[0];
        assert_ne!(ledger.status, HealthStatus::Down);
        assert!(!fixture
            .read_issues()
            .issues
            .contains_key("ledger:bot_down"));

        // Stopped container corroborates: DOWN.
        let mut runtime = StaticRuntime::new();
        runtime.stopped("ledger-bot");
        let report = fixture.run(&runtime, now() + Duration::minutes(1));
        assert_eq!(report.bots[0].status, HealthStatus::Down);
        let registry = fixture.read_issues();
        let issue = &registry.issues["ledger:bot_down"];
        assert!(issue.is_open());
        assert_eq!(issue.severity, Severity::P1);
    }

    #[test]
    fn test_fallback_excuses_missing_telemetry() {
        let config = only_bot(
            r#"{"workers": {"courier": {"container": "courier-bot", "telegram_fallback": true}}}"#,
        );
        let fixture = Fixture::new(config);
        // No telemetry files at all; container running; channel healthy.
        let mut runtime = StaticRuntime::new();
        runtime.running("courier-bot");
        runtime.set_logs("courier-bot", "telegram provider started\npolling ok\n");

        let report = fixture.run(&runtime, now());
        let courier = &report.bots[0];
        assert_eq!(courier.signal_source, SignalSource::TelegramFallback);
        assert_ne!(courier.status, HealthStatus::Down);
        assert!(!fixture
            .read_issues()
            .issues
            .contains_key("courier:no_signal"));
    }

    #[test]
    fn test_no_signal_without_fallback_opens_issue() {
        let config = only_bot(r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#);
        let fixture = Fixture::new(config);
        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");

        let report = fixture.run(&runtime, now());
        assert_eq!(report.bots[0].status, HealthStatus::Unknown);
        let registry = fixture.read_issues();
        let issue = &registry.issues["ledger:no_signal"];
        assert!(issue.is_open());
        assert_eq!(issue.severity, Severity::P2);
    }

    #[test]
    fn test_error_event_opens_issue_and_ok_run_resolves() {
        let config = only_bot(r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#);
        let fixture = Fixture::new(config);
        fixture.write_telemetry("ledger", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("ledger", "latest.json", &fresh_latest(now(), "ok"));
        fixture.write_event_lines(
            "ledger",
            &[&event_line(
                now() - Duration::minutes(5),
                "end",
                "error",
                "sheet append failed",
            )],
        );
        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");

        let report = fixture.run(&runtime, now());
        assert_eq!(report.bots[0].status, HealthStatus::Error);
        let registry = fixture.read_issues();
        let open = registry.open_issues();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].bot_id, "ledger");
        assert_eq!(open[0].consecutive_failures, 1);
        assert_eq!(open[0].evidence.run_ids, vec!["run-9"]);

        // A later ok run resolves everything for the bot.
        fixture.write_event_lines(
            "ledger",
            &[
                &event_line(now() - Duration::minutes(5), "end", "error", "sheet append failed"),
                &event_line(now() + Duration::minutes(10), "end", "ok", "run complete"),
            ],
        );
        let report = fixture.run(&runtime, now() + Duration::minutes(15));
        assert_eq!(report.bots[0].status, HealthStatus::Ok);
        assert_eq!(fixture.read_issues().open_issues().len(), 0);
    }

    #[test]
    fn test_rescan_is_dedup_idempotent() {
        let config = only_bot(r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#);
        let fixture = Fixture::new(config);
        fixture.write_telemetry("ledger", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("ledger", "latest.json", &fresh_latest(now(), "ok"));
        fixture.write_event_lines(
            "ledger",
            &[&event_line(now() - Duration::minutes(5), "end", "error", "sheet append failed")],
        );
        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");

        fixture.run(&runtime, now());
        fixture.run(&runtime, now() + Duration::minutes(10));
        fixture.run(&runtime, now() + Duration::minutes(20));

        let registry = fixture.read_issues();
        // Exactly one issue; the cursor kept the event from re-counting.
        assert_eq!(registry.issues.len(), 1);
        let issue = registry.issues.values().next().unwrap();
        assert_eq!(issue.consecutive_failures, 1);

        // Cursor sits at the event timestamp.
        let state = fixture.read_state();
        assert_eq!(
            state.cursors["ledger"].max_event_ts,
            Some(now() - Duration::minutes(5))
        );
    }

    #[test]
    fn test_schema_violation_is_counted_not_fatal() {
        let config = only_bot(r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#);
        let fixture = Fixture::new(config);
        fixture.write_telemetry("ledger", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("ledger", "latest.json", &fresh_latest(now(), "ok"));
        // Missing run_id, plus a valid error event.
        let bad = format!(
            r#"{{"schema_version": 1, "ts": "{}", "bot_id": "ledger", "event_type": "end", "status": "error", "severity": "P2", "message": "x", "component": "runner"}}"#,
            (now() - Duration::minutes(4)).to_rfc3339()
        );
        fixture.write_event_lines(
            "ledger",
            &[
                &bad,
                &event_line(now() - Duration::minutes(3), "end", "error", "real failure"),
            ],
        );
        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");

        let report = fixture.run(&runtime, now());
        assert_eq!(report.bots[0].schema_violations, 1);

        let registry = fixture.read_issues();
        let violation = &registry.issues["ledger:schema_violation"];
        assert!(violation.is_open());
        assert_eq!(violation.severity, Severity::P3);
        // The malformed line did not count as a failure, the valid one did.
        let event_issues: Vec<_> = registry
            .open_issues()
            .into_iter()
            .filter(|i| i.fingerprint != FP_SCHEMA_VIOLATION)
            .collect();
        assert_eq!(event_issues.len(), 1);
        assert_eq!(event_issues[0].summary, "real failure");
    }

    #[test]
    fn test_heartbeat_stall_opens_and_clears() {
        let config = only_bot(r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#);
        let fixture = Fixture::new(config);
        let stalled = now() - Duration::minutes(40);
        fixture.write_telemetry("ledger", "heartbeat.json", &fresh_heartbeat(stalled));
        fixture.write_telemetry("ledger", "latest.json", &fresh_latest(now(), "ok"));
        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");

        let report = fixture.run(&runtime, now());
        assert_eq!(report.bots[0].status, HealthStatus::Warn);
        assert!(fixture.read_issues().issues["ledger:heartbeat_stall"].is_open());

        // Heartbeat recovers; the stall issue resolves.
        fixture.write_telemetry(
            "ledger",
            "heartbeat.json",
            &fresh_heartbeat(now() + Duration::minutes(5)),
        );
        let report = fixture.run(&runtime, now() + Duration::minutes(6));
        assert_eq!(report.bots[0].status, HealthStatus::Ok);
        assert!(!fixture.read_issues().issues["ledger:heartbeat_stall"].is_open());
    }

    #[test]
    fn test_telegram_auth_failure_is_p1() {
        let config = only_bot(
            r#"{"workers": {"courier": {"container": "courier-bot", "telegram_fallback": true}}}"#,
        );
        let fixture = Fixture::new(config);
        fixture.write_telemetry("courier", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("courier", "latest.json", &fresh_latest(now(), "ok"));
        let mut runtime = StaticRuntime::new();
        runtime.running("courier-bot");
        runtime.set_logs(
            "courier-bot",
            "telegram provider started\n401 unauthorized from api\n",
        );

        fixture.run(&runtime, now());
        let registry = fixture.read_issues();
        let issue = &registry.issues["courier:telegram_auth"];
        assert!(issue.is_open());
        assert_eq!(issue.severity, Severity::P1);
    }

    #[test]
    fn test_failures_before_provider_restart_do_not_trigger() {
        let config = only_bot(
            r#"{"workers": {"courier": {"container": "courier-bot", "telegram_fallback": true}}}"#,
        );
        let fixture = Fixture::new(config);
        fixture.write_telemetry("courier", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("courier", "latest.json", &fresh_latest(now(), "ok"));
        let mut runtime = StaticRuntime::new();
        runtime.running("courier-bot");
        // Failures predate the restart marker.
        runtime.set_logs(
            "courier-bot",
            "401 unauthorized\ntelegram provider exited\ntelegram provider started\n",
        );

        fixture.run(&runtime, now());
        let registry = fixture.read_issues();
        assert!(!registry.issues.contains_key("courier:telegram_auth"));
        assert!(!registry.issues.contains_key("courier:telegram_exit"));
    }

    #[test]
    fn test_day_counters_accumulate_and_roll(){
        let config = only_bot(r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#);
        let fixture = Fixture::new(config);
        fixture.write_telemetry("ledger", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("ledger", "latest.json", &fresh_latest(now(), "ok"));
        fixture.write_event_lines(
            "ledger",
            &[
                &event_line(now() - Duration::minutes(8), "retry", "warn", "retrying"),
                &event_line(now() - Duration::minutes(5), "end", "ok", "done"),
            ],
        );
        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");

        fixture.run(&runtime, now());
        let state = fixture.read_state();
        assert_eq!(state.day.runs_observed, 1);
        assert_eq!(state.day.retries_recovered, 1);

        // Next day the counters reset.
        fixture.run(&runtime, now() + Duration::days(1));
        let state = fixture.read_state();
        assert_eq!(state.day.runs_observed, 0);
    }

    #[test]
    fn test_scan_writes_state_and_mirrors() {
        let mut config = only_bot(r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#);
        let fixture_dir = tempdir().unwrap();
        config.sandbox_mirrors = vec![fixture_dir.path().join("sandbox")];
        let fixture = Fixture::new(config);
        fixture.write_telemetry("ledger", "heartbeat.json", &fresh_heartbeat(now()));
        fixture.write_telemetry("ledger", "latest.json", &fresh_latest(now(), "ok"));
        let mut runtime = StaticRuntime::new();
        runtime.running("ledger-bot");

        fixture.run(&runtime, now());
        assert!(fixture.temp.path().join("state").join("state.json").exists());
        assert!(Path::new(&fixture_dir.path().join("sandbox").join("state.json")).exists());
    }
}
