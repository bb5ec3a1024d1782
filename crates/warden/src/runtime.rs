//! Container runtime introspection.
//!
//! The warden only ever reads from the runtime: a synchronous inspect query
//! and a bounded log tail. Both are behind the [`ContainerRuntime`] trait so
//! the scan can be driven against a fake in tests. Failures never propagate;
//! they degrade the signal to "unsupported".

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Command;
use tracing::{debug, warn};

use crate::types::ContainerState;

/// Read-only runtime introspection used by the scan.
pub trait ContainerRuntime {
    /// Query container state. Never fails; a broken runtime reports
    /// `supported: false`.
    fn inspect(&self, name: &str) -> ContainerState;

    /// Tail raw log text since `since`. `None` when the query failed or the
    /// runtime is unavailable.
    fn tail_logs(&self, name: &str, since: DateTime<Utc>) -> Option<String>;
}

/// Docker CLI-backed runtime.
pub struct DockerRuntime {
    /// Log lines fetched per tail query.
    tail_lines: u32,
}

impl DockerRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self { tail_lines: 400 }
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerRuntime {
    fn inspect(&self, name: &str) -> ContainerState {
        let output = Command::new("docker")
            .args([
                "inspect",
                "--format",
                "{{.State.Running}}|{{.State.Status}}",
                name,
            ])
            .output();

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                warn!(container = name, "docker inspect unavailable: {e}");
                return ContainerState::default();
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A missing container is an answer, not a failure.
            if stderr.contains("No such object") || stderr.contains("No such container") {
                return ContainerState {
                    supported: true,
                    running: Some(false),
                    state: Some("not-found".to_string()),
                };
            }
            warn!(container = name, "docker inspect failed: {}", stderr.trim());
            return ContainerState::default();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parts = stdout.trim().splitn(2, '|');
        let running = parts.next().map(|s| s.trim() == "true");
        let state = parts
            .next()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        ContainerState {
            supported: true,
            running,
            state,
        }
    }

    fn tail_logs(&self, name: &str, since: DateTime<Utc>) -> Option<String> {
        let output = Command::new("docker")
            .args([
                "logs",
                "--since",
                &since.to_rfc3339(),
                "--tail",
                &self.tail_lines.to_string(),
                name,
            ])
            .output();

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                debug!(container = name, "docker logs unavailable: {e}");
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                container = name,
                "docker logs failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        // Workers log to both streams; classification wants everything.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Some(text)
    }
}

/// Fixed-response runtime for tests and dry runs.
#[derive(Debug, Default)]
pub struct StaticRuntime {
    states: HashMap<String, ContainerState>,
    logs: HashMap<String, String>,
}

impl StaticRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset the inspect answer for a container.
    pub fn set_state(&mut self, name: &str, state: ContainerState) {
        self.states.insert(name.to_string(), state);
    }

    /// Preset the log tail for a container.
    pub fn set_logs(&mut self, name: &str, logs: &str) {
        self.logs.insert(name.to_string(), logs.to_string());
    }

    /// Convenience: a container confirmed running.
    pub fn running(&mut self, name: &str) {
        self.set_state(
            name,
            ContainerState {
                supported: true,
                running: Some(true),
                state: Some("running".to_string()),
            },
        );
    }

    /// Convenience: a container confirmed stopped.
    pub fn stopped(&mut self, name: &str) {
        self.set_state(
            name,
            ContainerState {
                supported: true,
                running: Some(false),
                state: Some("exited".to_string()),
            },
        );
    }
}

impl ContainerRuntime for StaticRuntime {
    fn inspect(&self, name: &str) -> ContainerState {
        self.states.get(name).cloned().unwrap_or_default()
    }

    fn tail_logs(&self, name: &str, _since: DateTime<Utc>) -> Option<String> {
        self.logs.get(name).cloned()
    }
}
