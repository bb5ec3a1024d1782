//! Auto-remediation policy engine.
//!
//! Open issues are matched against declarative pattern rules in priority
//! order. Matches enqueue idempotent, rate-limited remediation requests to
//! the external command queue; a per-issue ledger enforces cooldown and an
//! attempt cap, and is re-armed once the issue recovers so a later
//! regression is eligible again.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{RemediationMode, RemediationPolicy, RemediationRule, WardenConfig};
use crate::queue::CommandQueue;
use crate::types::{IssueRegistry, RemediationStatus};

/// Result of evaluating one open issue against the policy.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationOutcome {
    pub issue_id: String,
    /// Name of the matched rule, when one matched.
    pub rule: Option<String>,
    pub status: RemediationStatus,
    pub request_ids: Vec<String>,
}

/// Re-arm ledger entries whose issue is no longer open.
///
/// Returns the number of entries reset. Runs before rule evaluation so a
/// recovered-then-regressed issue is handled in one pass order.
pub fn rearm_recovered(registry: &mut IssueRegistry, policy: &RemediationPolicy) -> u32 {
    if !policy.defaults.rearm_after_recovery {
        return 0;
    }
    let mut rearmed = 0;
    for (issue_id, entry) in &mut registry.remediation {
        let open = registry
            .issues
            .get(issue_id)
            .is_some_and(crate::types::Issue::is_open);
        if open || entry.attempts == 0 {
            continue;
        }
        entry.attempts = 0;
        entry.last_attempt_ts = None;
        entry.last_request_ids.clear();
        entry.last_status = RemediationStatus::RearmedAfterRecovery;
        rearmed += 1;
        debug!(issue_id = %issue_id, "re-armed remediation ledger after recovery");
    }
    rearmed
}

/// The policy engine. Holds no state of its own; the ledger lives in the
/// issue registry.
pub struct RemediationEngine<'a> {
    policy: &'a RemediationPolicy,
    config: &'a WardenConfig,
    commands: &'a CommandQueue,
}

impl<'a> RemediationEngine<'a> {
    #[must_use]
    pub fn new(
        policy: &'a RemediationPolicy,
        config: &'a WardenConfig,
        commands: &'a CommandQueue,
    ) -> Self {
        Self {
            policy,
            config,
            commands,
        }
    }

    /// Evaluate every open issue against the rule list.
    pub fn evaluate(
        &self,
        registry: &mut IssueRegistry,
        now: DateTime<Utc>,
    ) -> Result<Vec<RemediationOutcome>> {
        let open: Vec<(String, String, String)> = registry
            .open_issues()
            .iter()
            .map(|i| (i.issue_id.clone(), i.bot_id.clone(), i.summary.clone()))
            .collect();

        let mut outcomes = Vec::new();
        for (issue_id, bot_id, summary) in open {
            let Some(rule) = self.match_rule(&issue_id) else {
                continue;
            };

            if self.policy.mode == RemediationMode::Shadow {
                info!(issue_id = %issue_id, rule = %rule.name, "shadow mode: would remediate");
                continue;
            }

            let cooldown = Duration::minutes(self.policy.cooldown_minutes(rule));
            let max_attempts = self.policy.max_attempts(rule);
            let entry = registry.remediation.entry(issue_id.clone()).or_default();

            if entry
                .last_attempt_ts
                .is_some_and(|last| now - last < cooldown)
            {
                entry.last_status = RemediationStatus::Cooldown;
                outcomes.push(RemediationOutcome {
                    issue_id,
                    rule: Some(rule.name.clone()),
                    status: RemediationStatus::Cooldown,
                    request_ids: vec![],
                });
                continue;
            }

            if entry.attempts >= max_attempts {
                if entry.last_status != RemediationStatus::MaxAttemptsReached {
                    warn!(
                        issue_id = %issue_id,
                        rule = %rule.name,
                        escalation = rule.escalation_rule.as_deref().unwrap_or("none"),
                        "remediation attempts exhausted"
                    );
                }
                entry.last_status = RemediationStatus::MaxAttemptsReached;
                outcomes.push(RemediationOutcome {
                    issue_id,
                    rule: Some(rule.name.clone()),
                    status: RemediationStatus::MaxAttemptsReached,
                    request_ids: vec![],
                });
                continue;
            }

            // One request per configured action that resolves a target.
            let mut request_ids = Vec::new();
            for action in &rule.auto_actions {
                let target = match self.resolve_target(&bot_id, action.target.as_deref()) {
                    Ok(target) => target,
                    Err(reason) => {
                        warn!(issue_id = %issue_id, action = %action.action, "skipping action: {reason}");
                        continue;
                    }
                };
                let request_id = self.commands.submit(
                    &action.capability,
                    &action.action,
                    target.as_deref(),
                    &format!("{issue_id}: {summary}"),
                    now,
                )?;
                request_ids.push(request_id);
            }

            entry.attempts += 1;
            entry.last_attempt_ts = Some(now);
            entry.last_request_ids.clone_from(&request_ids);
            entry.last_status = if request_ids.is_empty() {
                RemediationStatus::Noop
            } else {
                RemediationStatus::Queued
            };

            info!(
                issue_id = %issue_id,
                rule = %rule.name,
                requests = request_ids.len(),
                attempt = entry.attempts,
                "remediation evaluated"
            );
            outcomes.push(RemediationOutcome {
                issue_id,
                rule: Some(rule.name.clone()),
                status: entry.last_status,
                request_ids,
            });
        }
        Ok(outcomes)
    }

    /// First enabled rule whose pattern matches the issue id.
    fn match_rule(&self, issue_id: &str) -> Option<&RemediationRule> {
        for rule in self.policy.rules.iter().filter(|r| r.enabled) {
            match Regex::new(&rule.issue_pattern) {
                Ok(re) => {
                    if re.is_match(issue_id) {
                        return Some(rule);
                    }
                }
                Err(e) => {
                    warn!(rule = %rule.name, "invalid issue pattern: {e}");
                }
            }
        }
        None
    }

    /// Resolve a symbolic action target against the worker's metadata.
    fn resolve_target(&self, bot_id: &str, target: Option<&str>) -> Result<Option<String>, String> {
        let Some(target) = target else {
            return Ok(None);
        };
        if !target.contains("{container}") {
            return Ok(Some(target.to_string()));
        }
        let container = self
            .config
            .workers
            .get(bot_id)
            .and_then(|w| w.container.as_deref())
            .ok_or_else(|| format!("worker '{bot_id}' has no container configured"))?;
        Ok(Some(target.replace("{container}", container)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn config() -> WardenConfig {
        serde_json::from_str(
            r#"{"workers": {"ledger": {"container": "ledger-bot"}}}"#,
        )
        .unwrap()
    }

    fn policy(mode: &str) -> RemediationPolicy {
        serde_json::from_str(&format!(
            r#"{{
                "mode": "{mode}",
                "defaults": {{"cooldown_minutes": 60, "max_attempts": 2}},
                "rules": [
                    {{"name": "restart-on-down", "issue_pattern": ":bot_down$",
                      "auto_actions": [{{"capability": "container", "action": "restart", "target": "{{container}}"}}],
                      "escalation_rule": "page-human"}}
                ]
            }}"#
        ))
        .unwrap()
    }

    fn registry_with_down_issue() -> IssueRegistry {
        let mut registry = IssueRegistry::default();
        registry.touch("ledger", "bot_down", Severity::P1, "ledger is down", now());
        registry
    }

    #[test]
    fn test_first_match_enqueues_one_batch() {
        let temp = tempdir().unwrap();
        let commands = CommandQueue::open(&temp.path().join("q")).unwrap();
        let config = config();
        let policy = policy("low_risk_auto");
        let engine = RemediationEngine::new(&policy, &config, &commands);
        let mut registry = registry_with_down_issue();

        let outcomes = engine.evaluate(&mut registry, now()).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, RemediationStatus::Queued);
        assert_eq!(outcomes[0].request_ids.len(), 1);

        let entry = &registry.remediation["ledger:bot_down"];
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_status, RemediationStatus::Queued);
        assert_eq!(entry.last_attempt_ts, Some(now()));
    }

    #[test]
    fn test_cooldown_then_max_attempts() {
        let temp = tempdir().unwrap();
        let commands = CommandQueue::open(&temp.path().join("q")).unwrap();
        let config = config();
        let policy = policy("low_risk_auto");
        let engine = RemediationEngine::new(&policy, &config, &commands);
        let mut registry = registry_with_down_issue();

        engine.evaluate(&mut registry, now()).unwrap();

        // Within cooldown: nothing enqueued.
        let soon = now() + Duration::minutes(10);
        let outcomes = engine.evaluate(&mut registry, soon).unwrap();
        assert_eq!(outcomes[0].status, RemediationStatus::Cooldown);
        assert_eq!(registry.remediation["ledger:bot_down"].attempts, 1);

        // Past cooldown: second (final) attempt.
        let later = now() + Duration::minutes(61);
        let outcomes = engine.evaluate(&mut registry, later).unwrap();
        assert_eq!(outcomes[0].status, RemediationStatus::Queued);
        assert_eq!(registry.remediation["ledger:bot_down"].attempts, 2);

        // Attempts exhausted.
        let much_later = now() + Duration::minutes(200);
        let outcomes = engine.evaluate(&mut registry, much_later).unwrap();
        assert_eq!(outcomes[0].status, RemediationStatus::MaxAttemptsReached);
        assert_eq!(registry.remediation["ledger:bot_down"].attempts, 2);
    }

    #[test]
    fn test_rearm_after_recovery_allows_regression() {
        let temp = tempdir().unwrap();
        let commands = CommandQueue::open(&temp.path().join("q")).unwrap();
        let config = config();
        let policy = policy("low_risk_auto");
        let engine = RemediationEngine::new(&policy, &config, &commands);
        let mut registry = registry_with_down_issue();

        // Exhaust the ledger.
        engine.evaluate(&mut registry, now()).unwrap();
        engine
            .evaluate(&mut registry, now() + Duration::minutes(61))
            .unwrap();
        engine
            .evaluate(&mut registry, now() + Duration::minutes(200))
            .unwrap();

        // Recovery re-arms.
        registry.resolve("ledger", "bot_down", now() + Duration::minutes(201));
        let rearmed = rearm_recovered(&mut registry, &policy);
        assert_eq!(rearmed, 1);
        let entry = &registry.remediation["ledger:bot_down"];
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.last_status, RemediationStatus::RearmedAfterRecovery);

        // A regression is eligible again.
        let regression = now() + Duration::minutes(300);
        registry.touch("ledger", "bot_down", Severity::P1, "down again", regression);
        let outcomes = engine.evaluate(&mut registry, regression).unwrap();
        assert_eq!(outcomes[0].status, RemediationStatus::Queued);
    }

    #[test]
    fn test_shadow_mode_never_acts() {
        let temp = tempdir().unwrap();
        let commands = CommandQueue::open(&temp.path().join("q")).unwrap();
        let config = config();
        let policy = policy("shadow");
        let engine = RemediationEngine::new(&policy, &config, &commands);
        let mut registry = registry_with_down_issue();

        let outcomes = engine.evaluate(&mut registry, now()).unwrap();
        assert!(outcomes.is_empty());
        assert!(registry.remediation.is_empty());
        assert_eq!(std::fs::read_dir(temp.path().join("q")).unwrap().count(), 0);
    }

    #[test]
    fn test_unmatched_issue_is_skipped() {
        let temp = tempdir().unwrap();
        let commands = CommandQueue::open(&temp.path().join("q")).unwrap();
        let config = config();
        let policy = policy("low_risk_auto");
        let engine = RemediationEngine::new(&policy, &config, &commands);

        let mut registry = IssueRegistry::default();
        registry.touch("ledger", "abc123", Severity::P2, "run failed", now());
        let outcomes = engine.evaluate(&mut registry, now()).unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_missing_container_yields_noop() {
        let temp = tempdir().unwrap();
        let commands = CommandQueue::open(&temp.path().join("q")).unwrap();
        // Worker known but no container configured.
        let config: WardenConfig =
            serde_json::from_str(r#"{"workers": {"news": {}}}"#).unwrap();
        let policy = policy("low_risk_auto");
        let engine = RemediationEngine::new(&policy, &config, &commands);

        let mut registry = IssueRegistry::default();
        registry.touch("news", "bot_down", Severity::P1, "down", now());
        let outcomes = engine.evaluate(&mut registry, now()).unwrap();
        assert_eq!(outcomes[0].status, RemediationStatus::Noop);
        assert!(outcomes[0].request_ids.is_empty());
        // The attempt still counts toward the cap.
        assert_eq!(registry.remediation["news:bot_down"].attempts, 1);
    }
}
