//! State operations on the current workspace
//!
//! Each operation resolves the current workspace through the
//! [`WorkspaceManager`], holds the workspace lock for any read-modify-write,
//! and records an audit event once it has taken effect.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use strata_state::{
    BackendError, BackupInfo, LockGuard, LockInfo, MigrationMarker, PruneOutcome, RetentionPolicy,
    StateDocument, StateStore,
};

use crate::artifact::{ArtifactKind, load_artifact};
use crate::audit::AuditEvent;
use crate::drift::{DriftOptions, DriftReport, detect_at};
use crate::error::{CoreError, CoreResult};
use crate::workspace::WorkspaceManager;

/// Directory under the root holding saved drift reports
pub const REPORTS_DIR: &str = "reports";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftOutcome {
    pub workspace: String,
    pub report: DriftReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<PathBuf>,
}

/// Compare the current workspace's state with the snapshot in `path`
///
/// Reads the baseline without locking. A snapshot without its own lineage
/// is taken to be of the baseline's lineage.
pub async fn detect_drift(
    manager: &WorkspaceManager,
    path: &Path,
    options: &DriftOptions,
    save_report: bool,
) -> CoreResult<DriftOutcome> {
    let workspace = manager.current()?.to_string();
    let store = manager.store_for(&workspace).await?;
    let baseline = store.read(&workspace).await?;
    let live = load_artifact(path)?.bind_lineage(&baseline.lineage);

    let report = detect_at(&baseline, &live, options, Utc::now())?;
    let saved_to = if save_report {
        Some(save(manager.root(), &workspace, &report)?)
    } else {
        None
    };

    info!(
        workspace = %workspace,
        added = report.summary.added,
        removed = report.summary.removed,
        modified = report.summary.modified,
        "drift detection finished"
    );
    manager.audit().record(
        AuditEvent::DriftDetected,
        &workspace,
        json!({
            "snapshot": path.display().to_string(),
            "summary": report.summary,
            "outputs_changed": report.output_changes.len(),
            "report": saved_to,
        }),
    );
    Ok(DriftOutcome {
        workspace,
        report,
        saved_to,
    })
}

fn save(root: &Path, workspace: &str, report: &DriftReport) -> CoreResult<PathBuf> {
    let dir = root.join(REPORTS_DIR);
    std::fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;
    let path = dir.join(format!(
        "{}-{}.json",
        workspace,
        report.timestamp.format("%Y%m%dT%H%M%S%3fZ")
    ));

    let mut bytes =
        serde_json::to_vec_pretty(report).map_err(|e| CoreError::Serialization(e.to_string()))?;
    bytes.push(b'\n');
    let mut file = std::fs::File::create(&path).map_err(|e| CoreError::io(&path, e))?;
    file.write_all(&bytes).map_err(|e| CoreError::io(&path, e))?;
    Ok(path)
}

/// Prune backups under `policy`
///
/// Without a `path`, prunes the current workspace on its backend. With a
/// `path`, treats it as a local state directory and prunes every workspace
/// found there.
pub async fn cleanup(
    manager: &WorkspaceManager,
    path: Option<&Path>,
    policy: &RetentionPolicy,
    dry_run: bool,
) -> CoreResult<Vec<PruneOutcome>> {
    let (store, workspaces) = match path {
        Some(path) => {
            let config = strata_state::BackendConfig::local(path.to_string_lossy());
            let store = manager.settings().open_store(&config).await?;
            let workspaces = store.list_workspaces().await?;
            if workspaces.is_empty() {
                warn!(path = %path.display(), "no workspaces found");
            }
            (store, workspaces)
        }
        None => {
            let workspace = manager.current()?.to_string();
            (manager.store_for(&workspace).await?, vec![workspace])
        }
    };

    let mut outcomes = Vec::with_capacity(workspaces.len());
    for workspace in &workspaces {
        let current = store.read_optional(workspace).await?;
        if let Some(marker) = marker_in_force(&store, workspace, current.as_ref()).await? {
            warn!(workspace = %workspace, target = %marker.target, "pruning backups of a migrated workspace");
        }
        let outcome = strata_state::prune(&store, workspace, policy, dry_run).await?;
        if !dry_run && !outcome.removed.is_empty() {
            manager.audit().record(
                AuditEvent::StatePruned,
                workspace,
                json!({ "removed": outcome.removed, "kept": outcome.kept }),
            );
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Result of a state replacement (`push` or `restore`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateReplaced {
    pub workspace: String,
    pub lineage: String,
    pub version: u64,
    pub serial: u64,
    pub resources: usize,
    /// Whether the previous document had another lineage
    pub lineage_changed: bool,
}

/// The migration marker of a workspace, if the document it describes is still in place
///
/// A marker stops applying once the document has been written again, as
/// after migrating the state back or a forced write.
async fn marker_in_force(
    store: &StateStore,
    workspace: &str,
    current: Option<&StateDocument>,
) -> CoreResult<Option<MigrationMarker>> {
    let Some(marker) = store.migration_marker(workspace).await? else {
        return Ok(None);
    };
    if current.map(|c| c.version) == Some(marker.source_version) {
        Ok(Some(marker))
    } else {
        debug!(workspace, target = %marker.target, "migration marker predates the current document");
        Ok(None)
    }
}

/// Refuse to write a workspace whose state was migrated elsewhere unless `force`
async fn check_not_migrated(
    store: &StateStore,
    workspace: &str,
    current: Option<&StateDocument>,
    force: bool,
) -> CoreResult<()> {
    let Some(marker) = marker_in_force(store, workspace, current).await? else {
        return Ok(());
    };
    if !force {
        return Err(CoreError::MigratedSource {
            workspace: workspace.to_string(),
            target: marker.target,
        });
    }
    warn!(
        workspace,
        target = %marker.target,
        migrated_at = %marker.migrated_at,
        "writing state that was migrated to another backend"
    );
    Ok(())
}

/// Write `replacement` over the workspace's current document
///
/// The serial continues from the current document. A different lineage is
/// refused unless `force`; a forced replacement moves the old document
/// into a backup and starts the new one from scratch.
async fn replace_state(
    store: &StateStore,
    guard: &LockGuard,
    current: Option<&StateDocument>,
    mut replacement: StateDocument,
    force: bool,
) -> CoreResult<StateReplaced> {
    let workspace = guard.workspace().to_string();
    let (expected, lineage_changed) = match current {
        None => (0, false),
        Some(current) if current.lineage == replacement.lineage => {
            replacement.serial = current.serial;
            replacement.increment_serial();
            (current.version, false)
        }
        Some(current) => {
            if !force {
                return Err(BackendError::LineageMismatch {
                    expected: current.lineage.clone(),
                    actual: replacement.lineage.clone(),
                }
                .into());
            }
            warn!(
                workspace = %workspace,
                previous = %current.lineage,
                lineage = %replacement.lineage,
                "replacing state of another lineage"
            );
            replacement.serial = current.serial;
            replacement.increment_serial();
            store.delete(guard).await?;
            (0, true)
        }
    };

    let version = store.write(guard, &replacement, expected).await?;
    Ok(StateReplaced {
        workspace,
        lineage: replacement.lineage.clone(),
        version,
        serial: replacement.serial,
        resources: replacement.resource_count(),
        lineage_changed,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    pub artifact: ArtifactKind,
    #[serde(flatten)]
    pub state: StateReplaced,
}

/// Replace the current workspace's state with the document in `path`
pub async fn push(manager: &WorkspaceManager, path: &Path, force: bool) -> CoreResult<PushOutcome> {
    let workspace = manager.current()?.to_string();
    let artifact = load_artifact(path)?;
    let kind = artifact.kind;
    let store = manager.store_for(&workspace).await?;

    let state = store
        .with_lock(&workspace, "push", async |guard| {
            let current = store.read_optional(&workspace).await?;
            check_not_migrated(&store, &workspace, current.as_ref(), force).await?;
            let replacement = match &current {
                Some(current) => artifact.bind_lineage(&current.lineage),
                None => artifact.into_document(),
            };
            replace_state(&store, &guard, current.as_ref(), replacement, force).await
        })
        .await?;

    info!(workspace = %workspace, version = state.version, serial = state.serial, "state pushed");
    manager.audit().record(
        AuditEvent::StatePushed,
        &workspace,
        json!({
            "artifact": path.display().to_string(),
            "kind": kind,
            "version": state.version,
            "serial": state.serial,
            "lineage_changed": state.lineage_changed,
        }),
    );
    Ok(PushOutcome {
        artifact: kind,
        state,
    })
}

/// The current workspace's state document
pub async fn show(manager: &WorkspaceManager) -> CoreResult<StateDocument> {
    let workspace = manager.current()?;
    let store = manager.store_for(workspace).await?;
    Ok(store.read(workspace).await?)
}

/// Where the current workspace's state was migrated to, if it was
pub async fn migration_status(manager: &WorkspaceManager) -> CoreResult<Option<MigrationMarker>> {
    let workspace = manager.current()?;
    let store = manager.store_for(workspace).await?;
    let current = store.read_optional(workspace).await?;
    marker_in_force(&store, workspace, current.as_ref()).await
}

/// The lock currently held on the current workspace, if any
pub async fn lock_status(manager: &WorkspaceManager) -> CoreResult<Option<LockInfo>> {
    let workspace = manager.current()?;
    let store = manager.store_for(workspace).await?;
    Ok(store.current_lock(workspace).await?)
}

/// Backups of the current workspace, newest first
pub async fn backups(manager: &WorkspaceManager) -> CoreResult<Vec<BackupInfo>> {
    let workspace = manager.current()?;
    let store = manager.store_for(workspace).await?;
    Ok(store.backups(workspace).await?)
}

/// An on-demand snapshot of the current workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupCreated {
    pub workspace: String,
    pub backup: BackupInfo,
    pub serial: u64,
    pub resources: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exported_to: Option<PathBuf>,
}

/// Snapshot the current workspace's state into a backup
///
/// The document is read under the lock, so the snapshot is never torn by a
/// concurrent write. With `output`, the same document is also written to
/// that file.
pub async fn backup(manager: &WorkspaceManager, output: Option<&Path>) -> CoreResult<BackupCreated> {
    let workspace = manager.current()?.to_string();
    let store = manager.store_for(&workspace).await?;

    let (backup, state) = store
        .with_lock(&workspace, "backup", async |_guard| {
            let state = store.read(&workspace).await?;
            let backup = BackupInfo::for_document(&state);
            store.put_backup(&workspace, &backup, &state).await?;
            Ok::<_, CoreError>((backup, state))
        })
        .await?;

    let exported_to = match output {
        Some(path) => {
            let bytes = state.serialize()?;
            std::fs::write(path, bytes).map_err(|e| CoreError::io(path, e))?;
            Some(path.to_path_buf())
        }
        None => None,
    };

    info!(workspace = %workspace, backup = %backup.id, version = state.version, "state backed up");
    manager.audit().record(
        AuditEvent::StateBackedUp,
        &workspace,
        json!({
            "backup": backup.id,
            "version": state.version,
            "serial": state.serial,
            "output": exported_to.as_ref().map(|p| p.display().to_string()),
        }),
    );
    Ok(BackupCreated {
        workspace,
        backup,
        serial: state.serial,
        resources: state.resource_count(),
        exported_to,
    })
}

/// Roll the current workspace back to a backup
///
/// The restored document keeps its resources and outputs and takes the
/// next serial, so the rollback is itself a new edit. `force` allows a
/// backup of another lineage, as left behind by deleting and re-creating
/// the workspace.
pub async fn restore(
    manager: &WorkspaceManager,
    backup_id: &str,
    force: bool,
) -> CoreResult<StateReplaced> {
    let workspace = manager.current()?.to_string();
    let store = manager.store_for(&workspace).await?;

    let state = store
        .with_lock(&workspace, "restore", async |guard| {
            let current = store.read_optional(&workspace).await?;
            check_not_migrated(&store, &workspace, current.as_ref(), force).await?;
            let backup = store.read_backup(&workspace, backup_id).await?;
            replace_state(&store, &guard, current.as_ref(), backup, force).await
        })
        .await?;

    info!(workspace = %workspace, backup = backup_id, version = state.version, "state restored");
    manager.audit().record(
        AuditEvent::StateRestored,
        &workspace,
        json!({ "backup": backup_id, "version": state.version, "serial": state.serial }),
    );
    Ok(state)
}

/// Remove the current workspace's lock if its id is `lock_id`
pub async fn force_unlock(manager: &WorkspaceManager, lock_id: &str) -> CoreResult<String> {
    let workspace = manager.current()?.to_string();
    let store = manager.store_for(&workspace).await?;
    let holder = store.current_lock(&workspace).await?;

    store.force_unlock(&workspace, lock_id).await?;
    manager.audit().record(
        AuditEvent::StateUnlocked,
        &workspace,
        json!({
            "lock_id": lock_id,
            "holder": holder.as_ref().map(|l| l.who.clone()),
            "operation": holder.as_ref().map(|l| l.operation.clone()),
        }),
    );
    Ok(workspace)
}
