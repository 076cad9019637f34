//! Workspace registry and lifecycle
//!
//! The registry (`<root>/registry.json`) records the configured backends,
//! which backend each workspace lives on, and the current workspace. It is
//! created by the first `configure-backend`, which also creates and selects
//! the `default` workspace, and is never torn down afterwards. From then on
//! exactly one workspace is current.
//!
//! A [`WorkspaceManager`] is the explicit context object that owns the
//! loaded registry, the settings and the audit log for one invocation.
//! Every change to the registry is made under `<root>/registry.lock` on a
//! freshly reloaded copy, so concurrent invocations never drop each
//! other's updates.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use strata_state::{BackendConfig, StateDocument, StateStore};

use crate::audit::{AuditEvent, AuditLog};
use crate::config::Settings;
use crate::error::{CoreError, CoreResult};

pub const REGISTRY_FILE: &str = "registry.json";
pub const REGISTRY_LOCK_FILE: &str = "registry.lock";
pub const DEFAULT_WORKSPACE: &str = "default";
pub const MAX_WORKSPACE_NAME: usize = 64;

/// How long a registry update waits for another process to finish its own
const REGISTRY_LOCK_WAIT: Duration = Duration::from_secs(10);

static WORKSPACE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("workspace name pattern is valid")
});

/// Check a workspace name: letters, digits, `-` and `_`, not leading with a separator
pub fn validate_workspace_name(name: &str) -> CoreResult<()> {
    let invalid = |reason: &str| CoreError::InvalidWorkspaceName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.len() > MAX_WORKSPACE_NAME {
        return Err(invalid("longer than 64 characters"));
    }
    if !WORKSPACE_NAME.is_match(name) {
        return Err(invalid(
            "must start with a letter or digit and contain only letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    /// Id of the backend the workspace's state lives on
    pub backend: String,
    pub created_at: DateTime<Utc>,
}

impl WorkspaceEntry {
    fn on(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Persisted registry of backends and workspaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registry {
    /// Configured backends keyed by [`BackendConfig::id`]
    pub backends: BTreeMap<String, BackendConfig>,
    /// Backend new workspaces are created on
    pub default_backend: Option<String>,
    pub workspaces: BTreeMap<String, WorkspaceEntry>,
    pub current: Option<String>,
}

impl Registry {
    pub fn path(root: &Path) -> PathBuf {
        root.join(REGISTRY_FILE)
    }

    /// Load the registry; an absent file is an uninitialized registry
    pub fn load(root: &Path) -> CoreResult<Self> {
        let path = Self::path(root);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(CoreError::io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| CoreError::Config {
            path,
            reason: e.to_string(),
        })
    }

    /// Save through a temp file and rename so readers never see a partial registry
    pub fn save(&self, root: &Path) -> CoreResult<()> {
        std::fs::create_dir_all(root).map_err(|e| CoreError::io(root, e))?;
        let path = Self::path(root);

        let mut bytes =
            serde_json::to_vec_pretty(self).map_err(|e| CoreError::Serialization(e.to_string()))?;
        bytes.push(b'\n');

        let mut file = tempfile::NamedTempFile::new_in(root).map_err(|e| CoreError::io(root, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| CoreError::io(&path, e))?;
        file.persist(&path)
            .map_err(|e| CoreError::io(&path, e.error))?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.default_backend.is_some()
    }

    /// `default` if it exists, else the first other workspace by name
    fn fallback_for(&self, name: &str) -> Option<String> {
        let others = || self.workspaces.keys().filter(|w| *w != name);
        others()
            .find(|w| *w == DEFAULT_WORKSPACE)
            .or_else(|| others().next())
            .cloned()
    }
}

/// Exclusive hold on the registry of one root, released on drop
///
/// The lock file is created with `create_new`, so only one process holds
/// it at a time. It is never held across an `.await`.
struct RegistryLock {
    path: PathBuf,
}

impl RegistryLock {
    fn acquire(root: &Path, wait: Duration) -> CoreResult<Self> {
        std::fs::create_dir_all(root).map_err(|e| CoreError::io(root, e))?;
        let path = root.join(REGISTRY_LOCK_FILE);
        let deadline = Instant::now() + wait;
        let mut backoff = Duration::from_millis(5);

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let lock = Self { path };
                    writeln!(file, "{}", strata_state::lock_owner())
                        .map_err(|e| CoreError::io(&lock.path, e))?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(CoreError::RegistryLocked(path));
                    }
                    debug!(path = %path.display(), "registry is locked, waiting {:?}", backoff);
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(200));
                }
                Err(e) => return Err(CoreError::io(path, e)),
            }
        }
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to release registry lock: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Current,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceSummary {
    pub name: String,
    pub status: WorkspaceStatus,
    pub backend: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendConfigured {
    pub backend: String,
    /// Workspace created because the registry had none
    pub created_workspace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceDeleted {
    pub name: String,
    /// Resources the workspace held when it was deleted
    pub resources: usize,
    /// Workspace that became current, when the deleted one was current
    pub switched_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSelected {
    pub name: String,
    pub created: bool,
}

/// Workspace lifecycle over the persisted registry
pub struct WorkspaceManager {
    root: PathBuf,
    settings: Settings,
    registry: Registry,
    audit: AuditLog,
}

impl WorkspaceManager {
    /// Load settings and registry from `root`
    pub fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        let settings = Settings::load(&root)?;
        Self::with_settings(root, settings)
    }

    pub fn with_settings(root: impl Into<PathBuf>, settings: Settings) -> CoreResult<Self> {
        let root = root.into();
        let registry = Registry::load(&root)?;
        let audit = AuditLog::new(&root, settings.audit.enabled);
        debug!(root = %root.display(), workspaces = registry.workspaces.len(), "loaded registry");
        Ok(Self {
            root,
            settings,
            registry,
            audit,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Pick up registry changes made by other invocations
    pub fn reload(&mut self) -> CoreResult<()> {
        self.registry = Registry::load(&self.root)?;
        Ok(())
    }

    /// Apply `change` to the latest registry on disk and save it, under the registry lock
    ///
    /// `change` sees what other invocations have saved since this manager
    /// was opened and must re-check anything it depends on. On error,
    /// nothing is saved.
    fn update<T>(&mut self, change: impl FnOnce(&mut Registry) -> CoreResult<T>) -> CoreResult<T> {
        let _lock = RegistryLock::acquire(&self.root, REGISTRY_LOCK_WAIT)?;
        let mut registry = Registry::load(&self.root)?;
        let value = change(&mut registry)?;
        registry.save(&self.root)?;
        self.registry = registry;
        Ok(value)
    }

    /// Register a backend and make it the default for new workspaces
    ///
    /// The first configuration initializes the registry with a `default`
    /// workspace on this backend, selected as current.
    pub async fn configure_backend(&mut self, config: BackendConfig) -> CoreResult<BackendConfigured> {
        let store = self.settings.open_store(&config).await?;
        store.init().await?;

        let id = config.id();
        self.reload()?;
        let fresh = self.registry.workspaces.is_empty();
        if fresh {
            prepare_state(&store, DEFAULT_WORKSPACE).await?;
        }

        let created_workspace = self.update(|registry| {
            registry.backends.insert(id.clone(), config);
            registry.default_backend = Some(id.clone());
            if !fresh || !registry.workspaces.is_empty() {
                return Ok(None);
            }
            registry
                .workspaces
                .insert(DEFAULT_WORKSPACE.to_string(), WorkspaceEntry::on(&id));
            registry.current = Some(DEFAULT_WORKSPACE.to_string());
            Ok(Some(DEFAULT_WORKSPACE.to_string()))
        })?;

        info!(backend = %id, "backend configured");
        self.audit.record(
            AuditEvent::BackendConfigured,
            &id,
            json!({ "kind": store.kind(), "created_workspace": created_workspace }),
        );
        Ok(BackendConfigured {
            backend: id,
            created_workspace,
        })
    }

    /// Create a workspace on the default backend
    ///
    /// State already present on the backend under that name is adopted;
    /// otherwise an empty document with a fresh lineage is written.
    pub async fn create(&mut self, name: &str) -> CoreResult<WorkspaceSummary> {
        validate_workspace_name(name)?;
        self.reload()?;
        if self.registry.workspaces.contains_key(name) {
            return Err(CoreError::WorkspaceExists(name.to_string()));
        }
        let backend_id = self
            .registry
            .default_backend
            .clone()
            .ok_or(CoreError::NoBackend)?;
        let config = self.backend(&backend_id)?;
        let store = self.settings.open_store(config).await?;

        prepare_state(&store, name).await?;
        self.update(|registry| {
            if registry.workspaces.contains_key(name) {
                return Err(CoreError::WorkspaceExists(name.to_string()));
            }
            registry
                .workspaces
                .insert(name.to_string(), WorkspaceEntry::on(&backend_id));
            if registry.current.is_none() {
                registry.current = Some(name.to_string());
            }
            Ok(())
        })?;

        info!(workspace = name, backend = %backend_id, "workspace created");
        self.audit.record(
            AuditEvent::WorkspaceCreated,
            name,
            json!({ "backend": backend_id }),
        );
        self.summary(name)
    }

    /// Make `name` the current workspace
    pub fn switch_to(&mut self, name: &str) -> CoreResult<()> {
        let previous = self.update(|registry| {
            if !registry.workspaces.contains_key(name) {
                return Err(CoreError::WorkspaceNotFound(name.to_string()));
            }
            Ok(registry.current.replace(name.to_string()))
        })?;

        info!(workspace = name, previous = ?previous, "switched workspace");
        self.audit.record(
            AuditEvent::WorkspaceSwitched,
            name,
            json!({ "previous": previous }),
        );
        Ok(())
    }

    /// Select an environment workspace, creating it first if needed
    pub async fn use_environment(&mut self, name: &str) -> CoreResult<EnvironmentSelected> {
        self.reload()?;
        let created = if self.registry.workspaces.contains_key(name) {
            false
        } else {
            self.create(name).await?;
            true
        };
        if self.registry.current.as_deref() != Some(name) {
            self.switch_to(name)?;
        }
        Ok(EnvironmentSelected {
            name: name.to_string(),
            created,
        })
    }

    /// Delete a workspace, moving its state document into a backup first
    ///
    /// Without `force`, the workspace must not be current and must manage
    /// no resources. With `force`, a non-current workspace is deleted
    /// regardless of its resources; the current workspace still has to be
    /// empty, and another workspace becomes current.
    pub async fn delete(&mut self, name: &str, force: bool) -> CoreResult<WorkspaceDeleted> {
        self.reload()?;
        if !self.registry.workspaces.contains_key(name) {
            return Err(CoreError::WorkspaceNotFound(name.to_string()));
        }
        let is_current = self.registry.current.as_deref() == Some(name);
        if is_current && !force {
            return Err(CoreError::CurrentWorkspace(name.to_string()));
        }
        if is_current && self.registry.fallback_for(name).is_none() {
            return Err(CoreError::LastWorkspace(name.to_string()));
        }

        let store = self.store_for(name).await?;
        let resources = store
            .with_lock(name, "delete-workspace", async |guard| {
                let state = store.read_optional(name).await?;
                let resources = state.as_ref().map_or(0, StateDocument::resource_count);
                if resources > 0 && (!force || is_current) {
                    return Err(CoreError::WorkspaceNotEmpty {
                        name: name.to_string(),
                        resources,
                    });
                }
                if state.is_some() {
                    store.delete(&guard).await?;
                }
                Ok::<_, CoreError>(resources)
            })
            .await?;

        let fallback = self.update(|registry| {
            registry.workspaces.remove(name);
            if registry.current.as_deref() != Some(name) {
                return Ok(None);
            }
            registry.current = registry.fallback_for(name);
            Ok(registry.current.clone())
        })?;

        info!(workspace = name, resources, switched_to = ?fallback, "workspace deleted");
        self.audit.record(
            AuditEvent::WorkspaceDeleted,
            name,
            json!({ "resources": resources, "forced": force, "switched_to": fallback }),
        );
        Ok(WorkspaceDeleted {
            name: name.to_string(),
            resources,
            switched_to: fallback,
        })
    }

    /// Name of the current workspace
    pub fn current(&self) -> CoreResult<&str> {
        self.registry
            .current
            .as_deref()
            .ok_or(CoreError::NoCurrentWorkspace)
    }

    /// All workspaces ordered by name
    pub fn list(&self) -> Vec<WorkspaceSummary> {
        self.registry
            .workspaces
            .keys()
            .filter_map(|name| self.summary(name).ok())
            .collect()
    }

    fn summary(&self, name: &str) -> CoreResult<WorkspaceSummary> {
        let entry = self.entry(name)?;
        let status = if self.registry.current.as_deref() == Some(name) {
            WorkspaceStatus::Current
        } else {
            WorkspaceStatus::Active
        };
        Ok(WorkspaceSummary {
            name: name.to_string(),
            status,
            backend: entry.backend.clone(),
            created_at: entry.created_at,
        })
    }

    fn entry(&self, name: &str) -> CoreResult<&WorkspaceEntry> {
        self.registry
            .workspaces
            .get(name)
            .ok_or_else(|| CoreError::WorkspaceNotFound(name.to_string()))
    }

    fn backend(&self, id: &str) -> CoreResult<&BackendConfig> {
        self.registry.backends.get(id).ok_or_else(|| {
            CoreError::Config {
                path: Registry::path(&self.root),
                reason: format!("backend '{}' is referenced but not configured", id),
            }
        })
    }

    /// The backend configuration a workspace is bound to
    pub fn backend_config(&self, name: &str) -> CoreResult<&BackendConfig> {
        let entry = self.entry(name)?;
        self.backend(&entry.backend)
    }

    /// Open the store holding a workspace's state
    pub async fn store_for(&self, name: &str) -> CoreResult<StateStore> {
        let config = self.backend_config(name)?;
        self.settings.open_store(config).await
    }

    /// Bind a workspace to another backend, registering the backend if new
    pub fn rebind(&mut self, name: &str, config: BackendConfig) -> CoreResult<()> {
        let id = config.id();
        self.update(|registry| {
            let entry = registry
                .workspaces
                .get_mut(name)
                .ok_or_else(|| CoreError::WorkspaceNotFound(name.to_string()))?;
            entry.backend = id.clone();
            registry.backends.entry(id).or_insert(config);
            Ok(())
        })
    }
}

/// Give a new workspace an empty document, or adopt state already on the backend
async fn prepare_state(store: &StateStore, name: &str) -> CoreResult<()> {
    store
        .with_lock(name, "create-workspace", async |guard| {
            if store.read_optional(name).await?.is_none() {
                store.write(&guard, &StateDocument::new(), 0).await?;
            } else {
                info!(workspace = name, "adopting existing state");
            }
            Ok::<_, CoreError>(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_state::{ResourceAddress, ResourceRecord};
    use tempfile::TempDir;

    async fn manager() -> (TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = WorkspaceManager::open(dir.path().join(".strata")).unwrap();
        let state_dir = dir.path().join("state");
        manager
            .configure_backend(BackendConfig::local(state_dir.to_string_lossy()))
            .await
            .unwrap();
        (dir, manager)
    }

    async fn add_resource(manager: &WorkspaceManager, name: &str) {
        let store = manager.store_for(name).await.unwrap();
        store
            .with_lock(name, "test", async |guard| {
                let mut state = store.read(name).await?;
                let expected = state.version;
                state.upsert_resource(ResourceRecord::new(ResourceAddress::new("aws_vpc", "main")));
                state.increment_serial();
                store.write(&guard, &state, expected).await
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_workspace_names() {
        assert!(validate_workspace_name("prod").is_ok());
        assert!(validate_workspace_name("team-a_2").is_ok());
        assert!(validate_workspace_name("-x").is_err());
        assert!(validate_workspace_name("a b").is_err());
        assert!(validate_workspace_name("../etc").is_err());
        assert!(validate_workspace_name("").is_err());
        assert!(validate_workspace_name(&"a".repeat(65)).is_err());
        assert!(validate_workspace_name(&"a".repeat(64)).is_ok());
    }

    #[tokio::test]
    async fn test_configure_initializes_default_workspace() {
        let (_dir, manager) = manager().await;
        assert_eq!(manager.current().unwrap(), DEFAULT_WORKSPACE);

        let store = manager.store_for(DEFAULT_WORKSPACE).await.unwrap();
        let state = store.read(DEFAULT_WORKSPACE).await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.version, 1);

        // The registry survives a reload
        let reloaded = WorkspaceManager::open(manager.root()).unwrap();
        assert_eq!(reloaded.registry(), manager.registry());
    }

    #[tokio::test]
    async fn test_create_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = WorkspaceManager::open(dir.path()).unwrap();
        assert!(matches!(manager.create("w").await, Err(CoreError::NoBackend)));
        assert!(matches!(manager.current(), Err(CoreError::NoCurrentWorkspace)));
    }

    #[tokio::test]
    async fn test_create_and_switch() {
        let (_dir, mut manager) = manager().await;

        let created = manager.create("staging").await.unwrap();
        assert_eq!(created.status, WorkspaceStatus::Active);
        assert!(matches!(
            manager.create("staging").await,
            Err(CoreError::WorkspaceExists(_))
        ));

        manager.switch_to("staging").unwrap();
        assert_eq!(manager.current().unwrap(), "staging");

        let statuses: Vec<(String, WorkspaceStatus)> = manager
            .list()
            .into_iter()
            .map(|w| (w.name, w.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("default".to_string(), WorkspaceStatus::Active),
                ("staging".to_string(), WorkspaceStatus::Current),
            ]
        );

        assert!(matches!(
            manager.switch_to("nope"),
            Err(CoreError::WorkspaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_workspaces_have_distinct_lineages() {
        let (_dir, mut manager) = manager().await;
        manager.create("staging").await.unwrap();

        let store = manager.store_for("staging").await.unwrap();
        let staging = store.read("staging").await.unwrap();
        let default = store.read(DEFAULT_WORKSPACE).await.unwrap();
        assert_ne!(staging.lineage, default.lineage);
    }

    #[tokio::test]
    async fn test_delete_current_requires_switch() {
        let (_dir, mut manager) = manager().await;

        let err = manager.delete(DEFAULT_WORKSPACE, false).await.unwrap_err();
        assert!(matches!(err, CoreError::CurrentWorkspace(_)));
        assert!(err.remedy().unwrap().contains("switch"));

        manager.create("w2").await.unwrap();
        manager.switch_to("w2").unwrap();
        manager.delete(DEFAULT_WORKSPACE, false).await.unwrap();
        assert_eq!(manager.list().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_non_empty() {
        let (_dir, mut manager) = manager().await;
        manager.create("scratch").await.unwrap();
        add_resource(&manager, "scratch").await;

        assert!(matches!(
            manager.delete("scratch", false).await,
            Err(CoreError::WorkspaceNotEmpty { resources: 1, .. })
        ));

        let deleted = manager.delete("scratch", true).await.unwrap();
        assert_eq!(deleted.resources, 1);

        // The state was moved into a backup, not destroyed
        let store = manager.store_for(DEFAULT_WORKSPACE).await.unwrap();
        assert!(store.read_optional("scratch").await.unwrap().is_none());
        assert!(!store.backups("scratch").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_delete_current() {
        let (_dir, mut manager) = manager().await;

        // Nothing to fall back to
        assert!(matches!(
            manager.delete(DEFAULT_WORKSPACE, true).await,
            Err(CoreError::LastWorkspace(_))
        ));

        manager.create("alpha").await.unwrap();
        manager.create("beta").await.unwrap();
        manager.switch_to("beta").unwrap();
        add_resource(&manager, "beta").await;

        // Forced deletion of the current workspace still requires it to be empty
        assert!(matches!(
            manager.delete("beta", true).await,
            Err(CoreError::WorkspaceNotEmpty { .. })
        ));

        manager.switch_to("alpha").unwrap();
        let deleted = manager.delete("alpha", true).await.unwrap();
        assert_eq!(deleted.switched_to.as_deref(), Some(DEFAULT_WORKSPACE));
        assert_eq!(manager.current().unwrap(), DEFAULT_WORKSPACE);
    }

    #[tokio::test]
    async fn test_use_environment_creates_then_selects() {
        let (_dir, mut manager) = manager().await;

        let selected = manager.use_environment("prod").await.unwrap();
        assert!(selected.created);
        assert_eq!(manager.current().unwrap(), "prod");

        manager.switch_to(DEFAULT_WORKSPACE).unwrap();
        let selected = manager.use_environment("prod").await.unwrap();
        assert!(!selected.created);
        assert_eq!(manager.current().unwrap(), "prod");
    }

    #[tokio::test]
    async fn test_concurrent_managers_keep_each_others_workspaces() {
        let (_dir, mut first) = manager().await;
        let mut second = WorkspaceManager::open(first.root()).unwrap();

        // Both opened before either created anything
        first.create("alpha").await.unwrap();
        second.create("beta").await.unwrap();
        second.switch_to("beta").unwrap();

        let reloaded = WorkspaceManager::open(first.root()).unwrap();
        let names: Vec<String> = reloaded.list().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["alpha", "beta", "default"]);
        assert_eq!(reloaded.current().unwrap(), "beta");

        // A stale manager sees the other's workspace before acting on it
        assert!(matches!(
            first.create("beta").await,
            Err(CoreError::WorkspaceExists(_))
        ));
        assert!(!first.root().join(REGISTRY_LOCK_FILE).exists());
    }

    #[test]
    fn test_registry_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let held = RegistryLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();

        let err = RegistryLock::acquire(dir.path(), Duration::from_millis(50))
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::RegistryLocked(_)));
        assert_eq!(err.exit_code(), 3);

        drop(held);
        assert!(!dir.path().join(REGISTRY_LOCK_FILE).exists());
        RegistryLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();
    }

    #[tokio::test]
    async fn test_audit_trail() {
        let (_dir, mut manager) = manager().await;
        manager.create("staging").await.unwrap();
        manager.switch_to("staging").unwrap();

        let events: Vec<AuditEvent> = manager
            .audit()
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![
                AuditEvent::BackendConfigured,
                AuditEvent::WorkspaceCreated,
                AuditEvent::WorkspaceSwitched,
            ]
        );
    }
}
