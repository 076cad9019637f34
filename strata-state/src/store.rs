//! Lock-aware access to a state backend
//!
//! [`StateStore`] wraps a [`StateBackend`] with the rules every caller
//! must follow: lock acquisition retries with bounded backoff, every
//! backend call is bounded by a timeout, writes require a [`LockGuard`]
//! that is still held, and scoped operations release their lock on every
//! exit path, including Ctrl-C.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendConfig, BackendError, BackendKind, BackendResult, StateBackend};
use crate::backends::create_backend;
use crate::backup::{BackupInfo, MigrationMarker, sort_newest_first};
use crate::lock::{LockInfo, LockPolicy};
use crate::state::StateDocument;

/// Default bound on a single backend call
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

tokio::task_local! {
    /// Locks taken by scopes nested in the outermost `with_lock` of a task
    static HELD_LOCKS: HeldLocks;
}

#[derive(Clone, Default)]
struct HeldLocks(Arc<Mutex<Vec<(StateStore, LockGuard)>>>);

impl HeldLocks {
    fn entries(&self) -> MutexGuard<'_, Vec<(StateStore, LockGuard)>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, store: &StateStore, guard: &LockGuard) {
        self.entries().push((store.clone(), guard.clone()));
    }

    fn remove(&self, lock_id: &str) {
        self.entries().retain(|(_, guard)| guard.lock.id != lock_id);
    }

    fn drain(&self) -> Vec<(StateStore, LockGuard)> {
        std::mem::take(&mut *self.entries())
    }
}

/// Resolves on Ctrl-C; never, if the signal cannot be watched
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot watch for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Proof that the holder acquired a workspace lock through a [`StateStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    lock: LockInfo,
}

impl LockGuard {
    pub(crate) fn new(lock: LockInfo) -> Self {
        Self { lock }
    }

    pub fn workspace(&self) -> &str {
        &self.lock.workspace
    }

    pub fn info(&self) -> &LockInfo {
        &self.lock
    }
}

/// A state backend plus the locking and timeout rules around it
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    policy: LockPolicy,
    io_timeout: Duration,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            policy: LockPolicy::default(),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Build the backend described by `config`
    pub async fn open(config: &BackendConfig) -> BackendResult<Self> {
        let backend = create_backend(config).await?;
        Ok(Self::new(Arc::from(backend)))
    }

    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Run one backend call under the I/O timeout
    async fn io<T>(
        &self,
        operation: &str,
        call: impl Future<Output = BackendResult<T>>,
    ) -> BackendResult<T> {
        match tokio::time::timeout(self.io_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                operation: operation.to_string(),
                after: self.io_timeout,
            }),
        }
    }

    pub async fn init(&self) -> BackendResult<()> {
        self.io("init", self.backend.init()).await
    }

    /// Acquire the workspace lock, retrying with backoff until the policy timeout
    pub async fn acquire_lock(&self, workspace: &str, operation: &str) -> BackendResult<LockGuard> {
        let deadline = Instant::now() + self.policy.timeout;
        let mut backoff = self.policy.initial_backoff;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let lock = LockInfo::with_ttl(workspace, operation, self.policy.ttl);
            match self.io("lock", self.backend.try_lock(&lock)).await {
                Ok(()) => {
                    debug!(workspace, operation, lock_id = %lock.id, attempts, "acquired lock");
                    return Ok(LockGuard::new(lock));
                }
                Err(e) if e.is_lock_conflict() => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(e);
                    }
                    debug!(workspace, attempts, ?backoff, "lock held, retrying: {}", e);
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff = self.policy.next_backoff(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn release_lock(&self, guard: LockGuard) -> BackendResult<()> {
        self.io("unlock", self.backend.release_lock(&guard.lock)).await?;
        debug!(workspace = guard.workspace(), lock_id = %guard.lock.id, "released lock");
        Ok(())
    }

    /// Run `operation` while holding the workspace lock
    ///
    /// The lock is released whether `operation` succeeds, fails or is
    /// interrupted by Ctrl-C. A failed release after a successful
    /// operation is logged and does not turn the result into an error.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        workspace: &str,
        operation: &str,
        f: F,
    ) -> Result<T, E>
    where
        E: From<BackendError>,
        F: FnOnce(LockGuard) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.with_lock_until(workspace, operation, ctrl_c(), f).await
    }

    /// [`with_lock`](Self::with_lock) with an explicit interrupt signal
    ///
    /// Only the outermost scope of a task watches `interrupt`. Scopes
    /// opened inside it, on this store or any other, register their locks
    /// with the outermost scope; when an interrupt cuts them short, the
    /// outermost scope releases those locks before its own.
    pub async fn with_lock_until<T, E, F, Fut, I>(
        &self,
        workspace: &str,
        operation: &str,
        interrupt: I,
        f: F,
    ) -> Result<T, E>
    where
        E: From<BackendError>,
        F: FnOnce(LockGuard) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        I: Future<Output = ()>,
    {
        if let Ok(held) = HELD_LOCKS.try_with(HeldLocks::clone) {
            let guard = self.acquire_lock(workspace, operation).await?;
            held.push(self, &guard);
            let result = f(guard.clone()).await;
            let lock_id = guard.lock.id.clone();
            self.release_or_warn(guard).await;
            held.remove(&lock_id);
            return result;
        }

        tokio::pin!(interrupt);
        let guard = tokio::select! {
            guard = self.acquire_lock(workspace, operation) => guard?,
            _ = &mut interrupt => return Err(BackendError::Interrupted.into()),
        };

        let held = HeldLocks::default();
        let result = tokio::select! {
            result = HELD_LOCKS.scope(held.clone(), f(guard.clone())) => result,
            _ = &mut interrupt => {
                warn!(workspace, operation, "interrupted, releasing lock");
                Err(BackendError::Interrupted.into())
            }
        };

        for (store, inner) in held.drain().into_iter().rev() {
            warn!(workspace = inner.workspace(), lock_id = %inner.lock.id, "releasing lock of interrupted inner operation");
            store.release_or_warn(inner).await;
        }
        self.release_or_warn(guard).await;
        result
    }

    async fn release_or_warn(&self, guard: LockGuard) {
        let workspace = guard.workspace().to_string();
        let lock_id = guard.lock.id.clone();
        if let Err(e) = self.release_lock(guard).await {
            warn!(
                workspace = %workspace,
                lock_id = %lock_id,
                "failed to release lock: {}; run `strata force-unlock {}` once no other operation is running",
                e,
                lock_id
            );
        }
    }

    /// Read the state of a workspace; `NotFound` if it has none
    pub async fn read(&self, workspace: &str) -> BackendResult<StateDocument> {
        self.read_optional(workspace).await?.ok_or_else(|| {
            BackendError::not_found(format!("state for workspace '{}'", workspace))
        })
    }

    pub async fn read_optional(&self, workspace: &str) -> BackendResult<Option<StateDocument>> {
        self.io("read", self.backend.read_state(workspace)).await
    }

    /// Stored version, 0 when the workspace holds no document
    pub async fn current_version(&self, workspace: &str) -> BackendResult<u64> {
        Ok(self
            .read_optional(workspace)
            .await?
            .map_or(0, |state| state.version))
    }

    /// Write a document under a held lock, compare-and-swap on `expected_version`
    ///
    /// Returns the new version.
    pub async fn write(
        &self,
        guard: &LockGuard,
        state: &StateDocument,
        expected_version: u64,
    ) -> BackendResult<u64> {
        state.validate()?;
        let workspace = guard.workspace();
        self.ensure_held(guard).await?;

        let version = self
            .io("write", self.backend.write_state(workspace, state, expected_version))
            .await?;
        info!(workspace, version, serial = state.serial, "state written");
        Ok(version)
    }

    /// Remove the state of a workspace under a held lock, keeping a backup
    pub async fn delete(&self, guard: &LockGuard) -> BackendResult<()> {
        self.ensure_held(guard).await?;
        self.io("delete", self.backend.delete_state(guard.workspace()))
            .await?;
        info!(workspace = guard.workspace(), "state deleted");
        Ok(())
    }

    async fn ensure_held(&self, guard: &LockGuard) -> BackendResult<()> {
        let workspace = guard.workspace();
        match self.current_lock(workspace).await? {
            Some(held) if held.id == guard.lock.id => Ok(()),
            _ => Err(BackendError::LockLost {
                workspace: workspace.to_string(),
                lock_id: guard.lock.id.clone(),
            }),
        }
    }

    pub async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        self.io("list", self.backend.list_workspaces()).await
    }

    pub async fn current_lock(&self, workspace: &str) -> BackendResult<Option<LockInfo>> {
        self.io("lock-status", self.backend.current_lock(workspace))
            .await
    }

    /// Administrative removal of a lock left behind by a dead process
    pub async fn force_unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()> {
        self.io("force-unlock", self.backend.force_unlock(workspace, lock_id))
            .await?;
        warn!(workspace, lock_id, "lock forcibly released");
        Ok(())
    }

    /// Backups of a workspace, newest first
    pub async fn backups(&self, workspace: &str) -> BackendResult<Vec<BackupInfo>> {
        let mut backups = self
            .io("list-backups", self.backend.list_backups(workspace))
            .await?;
        sort_newest_first(&mut backups);
        Ok(backups)
    }

    pub async fn read_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<StateDocument> {
        if BackupInfo::parse_id(backup_id).is_none() {
            return Err(BackendError::not_found(format!(
                "backup '{}' of workspace '{}'",
                backup_id, workspace
            )));
        }
        self.io("read-backup", self.backend.read_backup(workspace, backup_id))
            .await
    }

    pub async fn put_backup(
        &self,
        workspace: &str,
        backup: &BackupInfo,
        state: &StateDocument,
    ) -> BackendResult<()> {
        self.io("put-backup", self.backend.put_backup(workspace, backup, state))
            .await
    }

    pub async fn delete_backup(&self, guard: &LockGuard, backup_id: &str) -> BackendResult<()> {
        self.io(
            "delete-backup",
            self.backend.delete_backup(guard.workspace(), backup_id),
        )
        .await
    }

    pub async fn mark_migrated(&self, guard: &LockGuard, marker: &MigrationMarker) -> BackendResult<()> {
        self.io("mark-migrated", self.backend.mark_migrated(guard.workspace(), marker))
            .await
    }

    pub async fn migration_marker(&self, workspace: &str) -> BackendResult<Option<MigrationMarker>> {
        self.io("migration-marker", self.backend.migration_marker(workspace))
            .await
    }
}
