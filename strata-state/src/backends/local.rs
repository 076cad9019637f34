//! Local file backend for state storage
//!
//! Layout under the configured directory:
//!
//! ```text
//! <dir>/<workspace>/strata.state.json
//! <dir>/<workspace>/strata.state.lock
//! <dir>/<workspace>/migrated.json
//! <dir>/<workspace>/backups/<backup-id>.json
//! ```
//!
//! Locks are lock files created with `create_new`, so two processes can
//! never both believe they created it. Writes copy the current document
//! into `backups/` and fsync it before the new document replaces the old
//! one through a temp file and an atomic rename.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{BackendConfig, BackendError, BackendKind, BackendResult, StateBackend};
use crate::backup::{BackupInfo, MigrationMarker};
use crate::lock::LockInfo;
use crate::state::StateDocument;

/// Local directory backend for development and single-machine use
pub struct LocalBackend {
    /// Directory holding one subdirectory per workspace
    root: PathBuf,
    /// Serializes read-compare-write within this process
    write_lock: Mutex<()>,
}

impl LocalBackend {
    /// Default state directory
    pub const DEFAULT_DIR: &'static str = ".strata/state";
    pub const STATE_FILE: &'static str = "strata.state.json";
    pub const LOCK_FILE: &'static str = "strata.state.lock";
    pub const MARKER_FILE: &'static str = "migrated.json";
    pub const BACKUP_DIR: &'static str = "backups";

    /// Create a new LocalBackend rooted at a specific directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a LocalBackend from configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let path = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_DIR));

        Ok(Self::with_root(path))
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.root.join(workspace)
    }

    fn state_path(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join(Self::STATE_FILE)
    }

    fn lock_path(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join(Self::LOCK_FILE)
    }

    fn marker_path(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join(Self::MARKER_FILE)
    }

    fn backup_dir(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join(Self::BACKUP_DIR)
    }

    fn backup_path(&self, workspace: &str, backup_id: &str) -> PathBuf {
        self.backup_dir(workspace).join(format!("{}.json", backup_id))
    }

    fn read_lock_file(&self, workspace: &str) -> BackendResult<Option<LockInfo>> {
        read_lock_at(&self.lock_path(workspace))
    }

    /// Remove an expired lock, unless another process already replaced it
    ///
    /// The lock file is first renamed to a name only this call knows, so
    /// of several processes retiring the same lock exactly one gets hold
    /// of it. A fresh lock moved aside by mistake is linked back into
    /// place. Returns whether the expired lock was the one removed.
    fn retire_expired_lock(&self, expired: &LockInfo) -> BackendResult<bool> {
        let path = self.lock_path(&expired.workspace);
        let tombstone = path.with_extension(format!("lock.{}.stale", uuid::Uuid::new_v4()));
        match std::fs::rename(&path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BackendError::Io(format!("Failed to move expired lock aside: {}", e))),
        }

        let moved = read_lock_at(&tombstone);
        let retired = matches!(&moved, Ok(Some(lock)) if lock.id == expired.id);
        if !retired {
            match std::fs::hard_link(&tombstone, &path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => warn!(
                    workspace = %expired.workspace,
                    "a newer lock replaced the one being restored; its holder will see the lock as lost"
                ),
                Err(e) => return Err(BackendError::Io(format!("Failed to restore lock file: {}", e))),
            }
        }
        std::fs::remove_file(&tombstone)
            .map_err(|e| BackendError::Io(format!("Failed to remove expired lock: {}", e)))?;
        Ok(retired)
    }

    /// Create the lock file; `Ok(false)` if it already exists
    fn create_lock_file(&self, lock: &LockInfo) -> BackendResult<bool> {
        let path = self.lock_path(&lock.workspace);
        ensure_parent(&path)?;

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(BackendError::Io(format!("Failed to create lock file: {}", e))),
        };

        let content = serde_json::to_vec_pretty(lock)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;
        file.write_all(&content)
            .and_then(|_| file.sync_all())
            .map_err(|e| BackendError::Io(format!("Failed to write lock file: {}", e)))?;
        Ok(true)
    }

    fn remove_lock_file(&self, workspace: &str) -> BackendResult<()> {
        std::fs::remove_file(self.lock_path(workspace))
            .map_err(|e| BackendError::Io(format!("Failed to remove lock file: {}", e)))
    }

    fn write_backup(&self, workspace: &str, state: &StateDocument) -> BackendResult<BackupInfo> {
        let backup = BackupInfo::for_document(state);
        let bytes = state.serialize()?;
        write_atomic(&self.backup_path(workspace, &backup.id), &bytes)?;
        debug!(workspace, backup = %backup.id, "wrote state backup");
        Ok(backup)
    }
}

fn read_lock_at(path: &Path) -> BackendResult<Option<LockInfo>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BackendError::Io(format!("Failed to read lock file: {}", e))),
    };
    let lock = serde_json::from_str(&content)
        .map_err(|e| BackendError::CorruptState(format!("Failed to parse lock file: {}", e)))?;
    Ok(Some(lock))
}

#[async_trait]
impl StateBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn location(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn read_state(&self, workspace: &str) -> BackendResult<Option<StateDocument>> {
        let path = self.state_path(workspace);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::Io(format!("Failed to read state file: {}", e))),
        };

        StateDocument::load(&bytes).map(Some)
    }

    async fn write_state(
        &self,
        workspace: &str,
        state: &StateDocument,
        expected_version: u64,
    ) -> BackendResult<u64> {
        let _serialized = self.write_lock.lock().await;

        let current = self.read_state(workspace).await?;
        let actual = current.as_ref().map_or(0, |c| c.version);
        if actual != expected_version {
            return Err(BackendError::VersionConflict {
                workspace: workspace.to_string(),
                expected: expected_version,
                actual,
            });
        }

        if let Some(current) = &current {
            if current.lineage != state.lineage {
                return Err(BackendError::LineageMismatch {
                    expected: current.lineage.clone(),
                    actual: state.lineage.clone(),
                });
            }
            self.write_backup(workspace, current)?;
        }

        let mut next = state.clone();
        next.version = expected_version + 1;
        write_atomic(&self.state_path(workspace), &next.serialize()?)?;
        debug!(workspace, version = next.version, "wrote state");

        Ok(next.version)
    }

    async fn delete_state(&self, workspace: &str) -> BackendResult<()> {
        let _serialized = self.write_lock.lock().await;

        let Some(current) = self.read_state(workspace).await? else {
            return Err(BackendError::not_found(format!(
                "state for workspace '{}'",
                workspace
            )));
        };
        self.write_backup(workspace, &current)?;
        std::fs::remove_file(self.state_path(workspace))
            .map_err(|e| BackendError::Io(format!("Failed to remove state file: {}", e)))?;
        sync_dir(&self.workspace_dir(workspace))?;
        Ok(())
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::Io(format!("Failed to list workspaces: {}", e))),
        };

        let mut workspaces = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackendError::Io(e.to_string()))?;
            if entry.path().join(Self::STATE_FILE).is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                workspaces.push(name.to_string());
            }
        }
        workspaces.sort();
        Ok(workspaces)
    }

    async fn try_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        if self.create_lock_file(lock)? {
            return Ok(());
        }

        match self.read_lock_file(&lock.workspace) {
            Ok(Some(existing)) if existing.is_expired() => {
                warn!(
                    workspace = %lock.workspace,
                    lock_id = %existing.id,
                    who = %existing.who,
                    "taking over expired lock"
                );
                self.retire_expired_lock(&existing)?;
                if self.create_lock_file(lock)? {
                    return Ok(());
                }
                match self.read_lock_file(&lock.workspace)? {
                    Some(winner) => Err(BackendError::locked(&winner)),
                    None => Err(BackendError::Io("lock file vanished during takeover".to_string())),
                }
            }
            Ok(Some(existing)) => Err(BackendError::locked(&existing)),
            // Released between our create attempt and the read
            Ok(None) => {
                if self.create_lock_file(lock)? {
                    Ok(())
                } else {
                    Err(BackendError::LockConflict {
                        workspace: lock.workspace.clone(),
                        lock_id: "unknown".to_string(),
                        who: "unknown".to_string(),
                        operation: "unknown".to_string(),
                    })
                }
            }
            // A half-written lock file still means someone holds the lock
            Err(BackendError::CorruptState(_)) => Err(BackendError::LockConflict {
                workspace: lock.workspace.clone(),
                lock_id: "unreadable".to_string(),
                who: "unknown".to_string(),
                operation: "unknown".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let Some(existing) = self.read_lock_file(&lock.workspace)? else {
            return Err(BackendError::LockNotFound(lock.id.clone()));
        };

        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }

        self.remove_lock_file(&lock.workspace)
    }

    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()> {
        let path = self.lock_path(workspace);
        if !path.exists() {
            return Err(BackendError::LockNotFound(lock_id.to_string()));
        }

        // An unreadable lock file can only be removed by force
        if let Ok(Some(existing)) = self.read_lock_file(workspace)
            && existing.id != lock_id
        {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        self.remove_lock_file(workspace)
    }

    async fn current_lock(&self, workspace: &str) -> BackendResult<Option<LockInfo>> {
        self.read_lock_file(workspace)
    }

    async fn list_backups(&self, workspace: &str) -> BackendResult<Vec<BackupInfo>> {
        let entries = match std::fs::read_dir(self.backup_dir(workspace)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::Io(format!("Failed to list backups: {}", e))),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackendError::Io(e.to_string()))?;
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            match BackupInfo::parse_id(stem) {
                Some(info) => backups.push(info),
                None => debug!(path = %path.display(), "ignoring unrecognized file in backup directory"),
            }
        }
        Ok(backups)
    }

    async fn read_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<StateDocument> {
        let bytes = match std::fs::read(self.backup_path(workspace, backup_id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::not_found(format!(
                    "backup '{}' of workspace '{}'",
                    backup_id, workspace
                )));
            }
            Err(e) => return Err(BackendError::Io(format!("Failed to read backup: {}", e))),
        };
        StateDocument::load(&bytes)
    }

    async fn put_backup(
        &self,
        workspace: &str,
        backup: &BackupInfo,
        state: &StateDocument,
    ) -> BackendResult<()> {
        write_atomic(&self.backup_path(workspace, &backup.id), &state.serialize()?)
    }

    async fn delete_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<()> {
        match std::fs::remove_file(self.backup_path(workspace, backup_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackendError::not_found(
                format!("backup '{}' of workspace '{}'", backup_id, workspace),
            )),
            Err(e) => Err(BackendError::Io(format!("Failed to remove backup: {}", e))),
        }
    }

    async fn mark_migrated(&self, workspace: &str, marker: &MigrationMarker) -> BackendResult<()> {
        let bytes = serde_json::to_vec_pretty(marker)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        write_atomic(&self.marker_path(workspace), &bytes)
    }

    async fn migration_marker(&self, workspace: &str) -> BackendResult<Option<MigrationMarker>> {
        match std::fs::read(self.marker_path(workspace)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| BackendError::CorruptState(format!("Failed to parse migration marker: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::Io(format!("Failed to read migration marker: {}", e))),
        }
    }

    async fn init(&self) -> BackendResult<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| BackendError::Io(format!("Failed to create {}: {}", self.root.display(), e)))
    }
}

fn ensure_parent(path: &Path) -> BackendResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BackendError::Io(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    Ok(())
}

/// Write through a synced temp file in the same directory, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> BackendResult<()> {
    ensure_parent(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| BackendError::Io(format!("Failed to create temp file: {}", e)))?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| BackendError::Io(format!("Failed to write {}: {}", path.display(), e)))?;
    file.persist(path)
        .map_err(|e| BackendError::Io(format!("Failed to replace {}: {}", path.display(), e)))?;

    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> BackendResult<()> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| BackendError::Io(format!("Failed to sync {}: {}", dir.display(), e)))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> BackendResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ResourceAddress, ResourceRecord};
    use tempfile::tempdir;

    fn sample_state() -> StateDocument {
        let mut state = StateDocument::with_lineage("lineage-a");
        state.upsert_resource(ResourceRecord::new(ResourceAddress::new("aws_s3_bucket", "logs")));
        state
    }

    #[tokio::test]
    async fn test_local_backend_read_write() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        // Initially no state
        assert!(backend.read_state("default").await.unwrap().is_none());

        let version = backend.write_state("default", &sample_state(), 0).await.unwrap();
        assert_eq!(version, 1);

        let read = backend.read_state("default").await.unwrap().unwrap();
        assert_eq!(read.version, 1);
        assert_eq!(read.resource_count(), 1);
        assert_eq!(backend.list_workspaces().await.unwrap(), vec!["default"]);
    }

    #[tokio::test]
    async fn test_local_backend_version_conflict() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        backend.write_state("default", &sample_state(), 0).await.unwrap();
        let result = backend.write_state("default", &sample_state(), 0).await;
        assert!(matches!(
            result,
            Err(BackendError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_local_backend_rejects_foreign_lineage() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        backend.write_state("default", &sample_state(), 0).await.unwrap();
        let foreign = StateDocument::with_lineage("lineage-b");
        let result = backend.write_state("default", &foreign, 1).await;
        assert!(matches!(result, Err(BackendError::LineageMismatch { .. })));
    }

    #[tokio::test]
    async fn test_local_backend_backs_up_before_overwrite() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        let mut state = sample_state();
        backend.write_state("default", &state, 0).await.unwrap();
        assert!(backend.list_backups("default").await.unwrap().is_empty());

        state.increment_serial();
        backend.write_state("default", &state, 1).await.unwrap();

        let backups = backend.list_backups("default").await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].version, 1);

        let backup = backend.read_backup("default", &backups[0].id).await.unwrap();
        assert_eq!(backup.serial, 0);
        assert_eq!(backup.version, 1);
    }

    #[tokio::test]
    async fn test_local_backend_locking() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        let lock = LockInfo::new("default", "write");
        backend.try_lock(&lock).await.unwrap();

        // Try to acquire again - should fail
        let other = LockInfo::new("default", "prune");
        assert!(backend.try_lock(&other).await.unwrap_err().is_lock_conflict());

        // Releasing someone else's lock is refused
        assert!(matches!(
            backend.release_lock(&other).await,
            Err(BackendError::LockMismatch { .. })
        ));

        backend.release_lock(&lock).await.unwrap();
        backend.try_lock(&other).await.unwrap();
        backend.release_lock(&other).await.unwrap();
        assert!(backend.current_lock("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_backend_locks_are_per_workspace() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        backend.try_lock(&LockInfo::new("default", "write")).await.unwrap();
        backend.try_lock(&LockInfo::new("staging", "write")).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_backend_takes_over_expired_lock() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        let stale = LockInfo::with_ttl("default", "write", std::time::Duration::ZERO);
        backend.try_lock(&stale).await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let fresh = LockInfo::new("default", "write");
        backend.try_lock(&fresh).await.unwrap();
        assert_eq!(backend.current_lock("default").await.unwrap().unwrap().id, fresh.id);
    }

    #[tokio::test]
    async fn test_local_backend_takeover_keeps_a_lock_taken_meanwhile() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        let stale = LockInfo::with_ttl("default", "write", std::time::Duration::ZERO);
        backend.try_lock(&stale).await.unwrap();

        // Another process retires the stale lock and takes its own
        assert!(backend.retire_expired_lock(&stale).unwrap());
        let winner = LockInfo::new("default", "apply");
        backend.try_lock(&winner).await.unwrap();

        // A late retirement of the same stale lock leaves the winner in place
        assert!(!backend.retire_expired_lock(&stale).unwrap());
        assert_eq!(backend.current_lock("default").await.unwrap().unwrap().id, winner.id);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("default"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".stale"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_backend_force_unlock() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        let lock = LockInfo::new("default", "write");
        backend.try_lock(&lock).await.unwrap();

        assert!(matches!(
            backend.force_unlock("default", "other-id").await,
            Err(BackendError::LockMismatch { .. })
        ));
        backend.force_unlock("default", &lock.id).await.unwrap();
        assert!(matches!(
            backend.force_unlock("default", &lock.id).await,
            Err(BackendError::LockNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_backend_delete_keeps_backup() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        backend.write_state("default", &sample_state(), 0).await.unwrap();
        backend.delete_state("default").await.unwrap();

        assert!(backend.read_state("default").await.unwrap().is_none());
        assert_eq!(backend.list_backups("default").await.unwrap().len(), 1);
        assert!(backend.list_workspaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_backend_corrupt_state_is_surfaced() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());

        std::fs::create_dir_all(dir.path().join("default")).unwrap();
        std::fs::write(dir.path().join("default").join(LocalBackend::STATE_FILE), b"{oops").unwrap();

        assert!(matches!(
            backend.read_state("default").await,
            Err(BackendError::CorruptState(_))
        ));
        assert!(matches!(
            backend.write_state("default", &sample_state(), 0).await,
            Err(BackendError::CorruptState(_))
        ));
    }

    #[tokio::test]
    async fn test_local_backend_migration_marker() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_root(dir.path());
        assert!(backend.migration_marker("default").await.unwrap().is_none());

        let marker = MigrationMarker {
            target: "s3://bucket".to_string(),
            migrated_at: chrono::Utc::now(),
            lineage: "lineage-a".to_string(),
            serial: 4,
            source_version: 2,
            target_version: 1,
            who: "me@host".to_string(),
        };
        backend.mark_migrated("default", &marker).await.unwrap();
        assert_eq!(backend.migration_marker("default").await.unwrap(), Some(marker));
    }

    #[test]
    fn test_local_backend_from_config() {
        let config = BackendConfig::local("custom/state");
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.root(), Path::new("custom/state"));
        assert_eq!(backend.location(), "local:custom/state");

        let config = BackendConfig::new(BackendKind::Local);
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.root(), Path::new(LocalBackend::DEFAULT_DIR));
    }
}
