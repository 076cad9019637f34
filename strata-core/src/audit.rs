//! Append-only JSON-lines audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{CoreError, CoreResult};

pub const AUDIT_FILE: &str = "audit.log";

/// Audited event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEvent {
    #[serde(rename = "backend.configured")]
    BackendConfigured,
    #[serde(rename = "workspace.created")]
    WorkspaceCreated,
    #[serde(rename = "workspace.switched")]
    WorkspaceSwitched,
    #[serde(rename = "workspace.deleted")]
    WorkspaceDeleted,
    #[serde(rename = "state.migrated")]
    StateMigrated,
    #[serde(rename = "state.pushed")]
    StatePushed,
    #[serde(rename = "state.restored")]
    StateRestored,
    #[serde(rename = "state.backed_up")]
    StateBackedUp,
    #[serde(rename = "state.pruned")]
    StatePruned,
    #[serde(rename = "state.unlocked")]
    StateUnlocked,
    #[serde(rename = "drift.detected")]
    DriftDetected,
}

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    /// `user@host` of the operator
    pub actor: String,
    /// Workspace or backend the event concerns
    pub target: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Audit log writer; a disabled log accepts and drops every event
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(root: &Path, enabled: bool) -> Self {
        Self {
            path: enabled.then(|| root.join(AUDIT_FILE)),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an event
    ///
    /// The event has already happened when this is called, so a failure
    /// to record it is logged rather than returned.
    pub fn record(&self, event: AuditEvent, target: &str, details: serde_json::Value) {
        let Some(path) = &self.path else {
            return;
        };
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: strata_state::lock_owner(),
            target: target.to_string(),
            details,
        };
        if let Err(e) = append(path, &entry) {
            warn!(path = %path.display(), ?event, "failed to write audit entry: {}", e);
        }
    }

    /// All recorded entries, oldest first
    pub fn entries(&self) -> CoreResult<Vec<AuditEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::io(path, e)),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| CoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

fn append(path: &Path, entry: &AuditEntry) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
    }
    let mut line =
        serde_json::to_vec(entry).map_err(|e| CoreError::Serialization(e.to_string()))?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::io(path, e))?;
    file.write_all(&line).map_err(|e| CoreError::io(path, e))
}
