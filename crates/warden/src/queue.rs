//! Outbound file queues.
//!
//! Both external collaborators are directory-as-queue handoffs: the
//! notification bridge consumes envelope files, the command executor
//! consumes remediation request files. This module makes the queue explicit
//! (`enqueue` / `mark_delivered`) so the on-disk representation stays an
//! implementation detail. Both handoffs are fire-and-forget; nothing here
//! polls for delivery.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Envelope accepted by the outbound notification bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEnvelope {
    pub task_id: String,
    /// Rendered message body.
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    /// Routing hint for the bridge (`alerts`, `briefing`).
    pub route: String,
    pub source: String,
}

impl BridgeEnvelope {
    /// Build an envelope originating from the warden.
    #[must_use]
    pub fn new(task_id: &str, command: &str, route: &str, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.to_string(),
            command: command.to_string(),
            timestamp: now,
            status: "pending".to_string(),
            route: route.to_string(),
            source: "warden".to_string(),
        }
    }
}

/// Normalized remediation request accepted by the command queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub request_id: String,
    /// Always `capability`.
    pub command_kind: String,
    pub capability: String,
    pub action: String,
    pub risk_tier: String,
    pub requires_approval: bool,
    #[serde(default)]
    pub payload: Value,
    pub requested_by: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// A directory-backed message queue with an optional delivered ledger.
pub struct FileQueue {
    dir: PathBuf,
    delivered_dir: Option<PathBuf>,
}

impl FileQueue {
    /// Open a queue at `dir`, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create queue dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            delivered_dir: None,
        })
    }

    /// Open a queue with a sibling `delivered/` ledger.
    pub fn open_with_delivered(dir: &Path, delivered: &Path) -> Result<Self> {
        let mut queue = Self::open(dir)?;
        fs::create_dir_all(delivered)
            .with_context(|| format!("Failed to create delivered dir {}", delivered.display()))?;
        queue.delivered_dir = Some(delivered.to_path_buf());
        Ok(queue)
    }

    /// Atomically enqueue a payload under `id`. Returns the queued path.
    pub fn enqueue<T: Serialize>(&self, id: &str, payload: &T) -> Result<PathBuf> {
        let path = self.dir.join(format!("{id}.json"));
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(payload).context("Failed to serialize payload")?;
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write queue temp {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to rename into queue {}", path.display()))?;
        debug!(path = %path.display(), "enqueued");
        Ok(path)
    }

    /// Move a queued file into the delivered ledger (or delete it when the
    /// queue has none).
    pub fn mark_delivered(&self, path: &Path) -> Result<()> {
        match &self.delivered_dir {
            Some(delivered) => {
                let file_name = path.file_name().with_context(|| {
                    format!("Queue path has no file name: {}", path.display())
                })?;
                fs::rename(path, delivered.join(file_name))
                    .with_context(|| format!("Failed to deliver {}", path.display()))?;
            }
            None => {
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Number of entries currently waiting.
    pub fn pending(&self) -> Result<usize> {
        let count = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list queue {}", self.dir.display()))?
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .count();
        Ok(count)
    }
}

/// The external command queue for remediation requests.
pub struct CommandQueue {
    queue: FileQueue,
}

impl CommandQueue {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            queue: FileQueue::open(dir)?,
        })
    }

    /// Submit a remediation request. Returns the request id.
    pub fn submit(
        &self,
        capability: &str,
        action: &str,
        target: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let request_id = format!("req-{}", Uuid::new_v4());
        let request = RemediationRequest {
            request_id: request_id.clone(),
            command_kind: "capability".to_string(),
            capability: capability.to_string(),
            action: action.to_string(),
            risk_tier: "low".to_string(),
            requires_approval: false,
            payload: match target {
                Some(target) => serde_json::json!({ "target": target }),
                None => Value::Null,
            },
            requested_by: "warden".to_string(),
            reason: reason.to_string(),
            created_at: now,
        };
        self.queue.enqueue(&request_id, &request)?;
        Ok(request_id)
    }
}
