//! Alert evaluation and dispatch.
//!
//! Runs after every scan: each open issue goes through the alert-decision
//! policy; fired alerts are written to the outbox, handed to the
//! notification bridge, and moved to the sent ledger. Quiet-hours
//! suppressions are counted on the issue and recorded as suppressed
//! artifacts; threshold/cooldown holds leave no artifact.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::queue::{BridgeEnvelope, FileQueue};
use crate::rules::{should_alert_now, AlertPolicy};
use crate::store::StateStore;
use crate::types::{AlertRecord, Issue, IssueRegistry, Severity};

/// Decision record for one open issue.
#[derive(Debug, Clone, Serialize)]
pub struct AlertOutcome {
    pub issue_id: String,
    pub severity: Severity,
    pub sent: bool,
    pub rule: &'static str,
}

/// Evaluate the alert policy for every open issue.
///
/// `deliver` gates the transport handoff (`--no-send` and disabled alerting
/// both evaluate nothing). Sent alerts stamp `last_alert_ts` on the issue.
pub fn evaluate_alerts(
    store: &StateStore,
    bridge: &FileQueue,
    registry: &mut IssueRegistry,
    policy: &AlertPolicy,
    deliver: bool,
    now: DateTime<Utc>,
) -> Result<Vec<AlertOutcome>> {
    if !deliver {
        debug!("alert delivery disabled, skipping evaluation");
        return Ok(vec![]);
    }

    let open_ids: Vec<String> = registry
        .open_issues()
        .iter()
        .map(|i| i.issue_id.clone())
        .collect();

    let mut outcomes = Vec::new();
    for issue_id in open_ids {
        let Some(issue) = registry.issues.get_mut(&issue_id) else {
            continue;
        };
        let decision = should_alert_now(issue, policy, now);
        let severity = issue.severity;

        if decision.send {
            let record = AlertRecord {
                alert_id: format!("alert-{}", Uuid::new_v4()),
                issue_id: issue_id.clone(),
                severity: issue.severity,
                message: render_alert_message(issue),
                suppressed: false,
                suppressed_reason: None,
                created_at: now,
            };
            let outbox_path = store.write_alert_outbox(&record)?;
            let envelope =
                BridgeEnvelope::new(&record.alert_id, &record.message, "alerts", now);
            bridge.enqueue(&record.alert_id, &envelope)?;
            store.mark_alert_sent(&outbox_path)?;
            issue.last_alert_ts = Some(now);
            info!(issue_id = %issue_id, rule = decision.rule, "alert dispatched");
        } else if decision.rule == "quiet_hours" {
            issue.quiet_hours_suppressed_count += 1;
            let record = AlertRecord {
                alert_id: format!("alert-{}", Uuid::new_v4()),
                issue_id: issue_id.clone(),
                severity: issue.severity,
                message: render_alert_message(issue),
                suppressed: true,
                suppressed_reason: Some("quiet_hours".to_string()),
                created_at: now,
            };
            store.write_alert_outbox(&record)?;
            debug!(issue_id = %issue_id, "alert suppressed by quiet hours");
        }

        outcomes.push(AlertOutcome {
            issue_id,
            severity,
            sent: decision.send,
            rule: decision.rule,
        });
    }
    Ok(outcomes)
}

/// Render the alert message body for an issue.
#[must_use]
pub fn render_alert_message(issue: &Issue) -> String {
    let mut msg = String::new();

    msg.push_str(&format!(
        "## {} {} Alert: {}\n\n",
        severity_marker(issue.severity),
        issue.severity.as_str(),
        issue.issue_id
    ));
    msg.push_str(&format!("- **Bot**: {}\n", issue.bot_id));
    msg.push_str(&format!("- **Condition**: {}\n", issue.summary));
    msg.push_str(&format!(
        "- **Consecutive failures**: {}\n",
        issue.consecutive_failures
    ));
    msg.push_str(&format!(
        "- **First seen**: {}\n",
        issue.first_seen_ts.format("%Y-%m-%d %H:%M UTC")
    ));

    if !issue.evidence.run_ids.is_empty() {
        let recent: Vec<&str> = issue
            .evidence
            .run_ids
            .iter()
            .rev()
            .take(3)
            .map(String::as_str)
            .collect();
        msg.push_str(&format!("- **Recent runs**: {}\n", recent.join(", ")));
    }
    if let Some(log) = issue.evidence.log_paths.last() {
        msg.push_str(&format!("- **Log**: `{log}`\n"));
    }

    msg
}

const fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::P1 => "🚨",
        Severity::P2 => "⚠️",
        Severity::P3 => "ℹ️",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::QuietWindow;
    use chrono::TimeZone;
    use chrono_tz::Tz;
    use tempfile::tempdir;

    fn policy() -> AlertPolicy {
        AlertPolicy {
            tz: Tz::UTC,
            quiet: QuietWindow::parse("23:00", "07:00"),
            cooldown_hours: 2,
            p2_threshold: 3,
        }
    }

    fn fixtures(temp: &tempfile::TempDir) -> (StateStore, FileQueue) {
        let store = StateStore::open(&temp.path().join("state"), &temp.path().join("logs")).unwrap();
        let bridge = FileQueue::open(&temp.path().join("bridge")).unwrap();
        (store, bridge)
    }

    #[test]
    fn test_p1_dispatches_and_stamps_issue() {
        let temp = tempdir().unwrap();
        let (store, bridge) = fixtures(&temp);
        let noon = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        let mut registry = IssueRegistry::default();
        registry.touch("ledger", "bot_down", Severity::P1, "ledger is down", noon);

        let outcomes =
            evaluate_alerts(&store, &bridge, &mut registry, &policy(), true, noon).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].sent);
        assert_eq!(outcomes[0].rule, "p1_immediate");

        // Record moved to sent, envelope queued, issue stamped.
        assert_eq!(
            std::fs::read_dir(store.alerts_sent_dir()).unwrap().count(),
            1
        );
        assert_eq!(
            std::fs::read_dir(store.alerts_outbox_dir()).unwrap().count(),
            0
        );
        assert_eq!(bridge.pending().unwrap(), 1);
        assert_eq!(
            registry.issues["ledger:bot_down"].last_alert_ts,
            Some(noon)
        );
    }

    #[test]
    fn test_quiet_hours_counts_suppression() {
        let temp = tempdir().unwrap();
        let (store, bridge) = fixtures(&temp);
        let night = Utc.with_ymd_and_hms(2026, 3, 10, 23, 30, 0).unwrap();

        let mut registry = IssueRegistry::default();
        let id = registry.touch("ledger", "abc123", Severity::P2, "run failed", night);
        registry.issues.get_mut(&id).unwrap().consecutive_failures = 5;

        let outcomes =
            evaluate_alerts(&store, &bridge, &mut registry, &policy(), true, night).unwrap();
        assert!(!outcomes[0].sent);
        assert_eq!(outcomes[0].rule, "quiet_hours");
        assert_eq!(registry.issues[&id].quiet_hours_suppressed_count, 1);
        // Suppressed artifact stays in the outbox; nothing reaches the bridge.
        assert_eq!(
            std::fs::read_dir(store.alerts_outbox_dir()).unwrap().count(),
            1
        );
        assert_eq!(bridge.pending().unwrap(), 0);
    }

    #[test]
    fn test_holds_leave_no_artifact() {
        let temp = tempdir().unwrap();
        let (store, bridge) = fixtures(&temp);
        let noon = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        let mut registry = IssueRegistry::default();
        // P3: briefing only. P2 below threshold.
        registry.touch("ledger", "minor", Severity::P3, "warn", noon);
        registry.touch("workout", "abc123", Severity::P2, "run failed", noon);

        let outcomes =
            evaluate_alerts(&store, &bridge, &mut registry, &policy(), true, noon).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.sent));
        assert_eq!(
            std::fs::read_dir(store.alerts_outbox_dir()).unwrap().count(),
            0
        );
    }

    #[test]
    fn test_deliver_false_skips_everything() {
        let temp = tempdir().unwrap();
        let (store, bridge) = fixtures(&temp);
        let noon = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        let mut registry = IssueRegistry::default();
        registry.touch("ledger", "bot_down", Severity::P1, "down", noon);

        let outcomes =
            evaluate_alerts(&store, &bridge, &mut registry, &policy(), false, noon).unwrap();
        assert!(outcomes.is_empty());
        assert!(registry.issues["ledger:bot_down"].last_alert_ts.is_none());
    }

    #[test]
    fn test_render_alert_message_includes_evidence() {
        let noon = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let mut issue = Issue::new("ledger", "abc123", Severity::P2, "sheet append failed", noon);
        issue.evidence.push_run("run-41");
        issue.evidence.push_run("run-42");
        issue.evidence.push_log("ledger/events/2026-03.jsonl");

        let msg = render_alert_message(&issue);
        assert!(msg.contains("P2 Alert: ledger:abc123"));
        assert!(msg.contains("sheet append failed"));
        assert!(msg.contains("run-42"));
        assert!(msg.contains("ledger/events/2026-03.jsonl"));
    }
}
