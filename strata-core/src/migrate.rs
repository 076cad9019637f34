//! Moving a workspace's state to another backend
//!
//! The source stays authoritative until the copy is confirmed on the
//! target. Only then is the source marked as migrated and the workspace
//! rebound; the source document itself is left in place so that the move
//! can be undone by switching back. A failed write to the target is not
//! retried: the target may or may not hold the copy, and the error says so.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use strata_state::{BackendConfig, BackendError, MigrationMarker, StateDocument, StateStore};

use crate::audit::AuditEvent;
use crate::error::{CoreError, CoreResult};
use crate::workspace::WorkspaceManager;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Replace a target document that belongs to another lineage
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub workspace: String,
    pub source: String,
    pub target: String,
    pub lineage: String,
    pub resources: usize,
    pub target_version: u64,
    /// Backups copied alongside the state
    pub backups_copied: usize,
    /// Whether a document of another lineage on the target was replaced
    pub overwritten: bool,
}

/// Migrate the current workspace to `target`
pub async fn migrate(
    manager: &mut WorkspaceManager,
    target: BackendConfig,
    options: &MigrateOptions,
) -> CoreResult<MigrationOutcome> {
    let workspace = manager.current()?.to_string();
    migrate_workspace(manager, &workspace, target, options).await
}

/// Migrate `workspace` to `target` and bind it there
pub async fn migrate_workspace(
    manager: &mut WorkspaceManager,
    workspace: &str,
    target: BackendConfig,
    options: &MigrateOptions,
) -> CoreResult<MigrationOutcome> {
    let source_id = manager.backend_config(workspace)?.id();
    let target_id = target.id();
    if source_id == target_id {
        return Err(BackendError::configuration(format!(
            "workspace '{}' already lives on {}",
            workspace, target_id
        ))
        .into());
    }

    let source = manager.store_for(workspace).await?;
    let destination = manager.settings().open_store(&target).await?;
    destination.init().await?;

    info!(workspace, source = %source_id, target = %target_id, "migrating state");
    let outcome = source
        .with_lock(workspace, "migrate", async |source_guard| {
            let state = source.read(workspace).await?;
            state.validate()?;

            let (target_version, overwritten) = destination
                .with_lock(workspace, "migrate", async |target_guard| {
                    let existing = destination.read_optional(workspace).await?;
                    let replace = match &existing {
                        Some(current) if current.lineage != state.lineage => {
                            if !current.is_empty() && !options.overwrite {
                                return Err(CoreError::TargetNotEmpty {
                                    target: target_id.clone(),
                                    lineage: current.lineage.clone(),
                                });
                            }
                            true
                        }
                        _ => false,
                    };
                    let expected = match &existing {
                        Some(current) if !replace => current.version,
                        _ => 0,
                    };

                    let indeterminate = |cause: BackendError| CoreError::MigrationIndeterminate {
                        workspace: workspace.to_string(),
                        target: target_id.clone(),
                        cause,
                    };
                    if replace {
                        destination
                            .delete(&target_guard)
                            .await
                            .map_err(indeterminate)?;
                    }
                    let version = destination
                        .write(&target_guard, &state, expected)
                        .await
                        .map_err(indeterminate)?;
                    Ok::<_, CoreError>((version, replace))
                })
                .await?;

            let backups_copied = copy_backups(&source, &destination, workspace).await;

            let marker = MigrationMarker {
                target: target_id.clone(),
                migrated_at: Utc::now(),
                lineage: state.lineage.clone(),
                serial: state.serial,
                source_version: state.version,
                target_version,
                who: strata_state::lock_owner(),
            };
            source.mark_migrated(&source_guard, &marker).await?;

            Ok::<_, CoreError>(MigrationOutcome {
                workspace: workspace.to_string(),
                source: source_id.clone(),
                target: target_id.clone(),
                lineage: state.lineage.clone(),
                resources: state.resource_count(),
                target_version,
                backups_copied,
                overwritten,
            })
        })
        .await?;

    manager.rebind(workspace, target)?;

    info!(
        workspace,
        target = %outcome.target,
        version = outcome.target_version,
        "migration complete"
    );
    manager.audit().record(
        AuditEvent::StateMigrated,
        workspace,
        json!({
            "source": outcome.source,
            "target": outcome.target,
            "lineage": outcome.lineage,
            "target_version": outcome.target_version,
            "backups_copied": outcome.backups_copied,
            "overwritten": outcome.overwritten,
        }),
    );
    Ok(outcome)
}

/// Copy the source's backups; the state itself is already on the target, so failures only warn
async fn copy_backups(source: &StateStore, destination: &StateStore, workspace: &str) -> usize {
    let backups = match source.backups(workspace).await {
        Ok(backups) => backups,
        Err(e) => {
            warn!(workspace, "could not list backups to copy: {}", e);
            return 0;
        }
    };

    let mut copied = 0;
    for backup in backups {
        let result: Result<(), BackendError> = async {
            let state: StateDocument = source.read_backup(workspace, &backup.id).await?;
            destination.put_backup(workspace, &backup, &state).await
        }
        .await;
        match result {
            Ok(()) => copied += 1,
            Err(e) => warn!(workspace, backup = %backup.id, "could not copy backup: {}", e),
        }
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_state::{ResourceAddress, ResourceRecord};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        manager: WorkspaceManager,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut manager = WorkspaceManager::open(dir.path().join(".strata")).unwrap();
            manager
                .configure_backend(BackendConfig::local(path(&dir, "source")))
                .await
                .unwrap();
            Self { dir, manager }
        }

        fn target(&self, name: &str) -> BackendConfig {
            BackendConfig::local(path(&self.dir, name))
        }
    }

    fn path(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    async fn populate(store: &StateStore, workspace: &str) -> StateDocument {
        store
            .with_lock(workspace, "test", async |guard| {
                let mut state = store.read(workspace).await?;
                let expected = state.version;
                state.upsert_resource(
                    ResourceRecord::new(ResourceAddress::new("aws_s3_bucket", "logs"))
                        .with_attribute("acl", json!("private")),
                );
                state.increment_serial();
                store.write(&guard, &state, expected).await?;
                store.read(workspace).await
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrate_copies_state_and_marks_source() {
        let mut fx = Fixture::new().await;
        let source = fx.manager.store_for("default").await.unwrap();
        let before = populate(&source, "default").await;

        let target = fx.target("target");
        let outcome = migrate(&mut fx.manager, target.clone(), &MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.lineage, before.lineage);
        assert_eq!(outcome.resources, 1);
        assert_eq!(outcome.target_version, 1);
        assert!(outcome.backups_copied >= 1);
        assert!(!outcome.overwritten);

        let destination = StateStore::open(&target).await.unwrap();
        let after = destination.read("default").await.unwrap();
        assert_eq!(after.lineage, before.lineage);
        assert_eq!(after.resources, before.resources);
        assert_eq!(after.serial, before.serial);

        // Source stays in place, marked
        assert!(source.read_optional("default").await.unwrap().is_some());
        let marker = source.migration_marker("default").await.unwrap().unwrap();
        assert_eq!(marker.target, target.id());
        assert_eq!(marker.target_version, 1);

        // The workspace now resolves to the target backend
        assert_eq!(fx.manager.backend_config("default").unwrap(), &target);
    }

    #[tokio::test]
    async fn test_migrate_to_same_backend_is_rejected() {
        let mut fx = Fixture::new().await;
        let same = fx.target("source");
        let err = migrate(&mut fx.manager, same, &MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::State(BackendError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_target_with_other_lineage() {
        let mut fx = Fixture::new().await;
        let source = fx.manager.store_for("default").await.unwrap();
        let ours = populate(&source, "default").await;

        // Unrelated, non-empty history already on the target
        let target = fx.target("target");
        let destination = StateStore::open(&target).await.unwrap();
        destination
            .with_lock("default", "seed", async |guard| {
                let mut other = StateDocument::new();
                other.upsert_resource(ResourceRecord::new(ResourceAddress::new("aws_vpc", "main")));
                destination.write(&guard, &other, 0).await
            })
            .await
            .unwrap();

        let err = migrate(&mut fx.manager, target.clone(), &MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TargetNotEmpty { .. }));
        assert_eq!(err.exit_code(), 7);
        // Nothing changed on either side
        assert!(source.migration_marker("default").await.unwrap().is_none());
        assert_ne!(destination.read("default").await.unwrap().lineage, ours.lineage);

        let outcome = migrate(&mut fx.manager, target, &MigrateOptions { overwrite: true })
            .await
            .unwrap();
        assert!(outcome.overwritten);
        assert_eq!(destination.read("default").await.unwrap().lineage, ours.lineage);
        // The replaced document was kept as a backup
        assert!(!destination.backups("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrate_records_audit_event() {
        let mut fx = Fixture::new().await;
        let target = fx.target("target");
        migrate(&mut fx.manager, target, &MigrateOptions::default())
            .await
            .unwrap();

        let last = fx.manager.audit().entries().unwrap().pop().unwrap();
        assert_eq!(last.event, AuditEvent::StateMigrated);
        assert_eq!(last.target, "default");
    }
}
