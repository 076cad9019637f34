//! State backend trait, configuration and error types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::backup::{BackupInfo, MigrationMarker};
use crate::lock::LockInfo;
use crate::state::StateDocument;

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The state is locked by another process and the wait budget ran out
    #[error(
        "State for workspace '{workspace}' is locked by {who} (lock ID: {lock_id}, operation: {operation})"
    )]
    LockConflict {
        workspace: String,
        lock_id: String,
        who: String,
        operation: String,
    },

    /// The lock was not found (for release/force-unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    /// The lock a write was issued under is no longer held
    #[error("Lock {lock_id} on workspace '{workspace}' is no longer held")]
    LockLost { workspace: String, lock_id: String },

    /// The stored version moved since the document was read
    #[error(
        "Version conflict on workspace '{workspace}': expected version {expected}, stored version is {actual}"
    )]
    VersionConflict {
        workspace: String,
        expected: u64,
        actual: u64,
    },

    /// State lineage mismatch (prevents accidental state overwrites)
    #[error("State lineage mismatch: expected {expected}, got {actual}")]
    LineageMismatch { expected: String, actual: String },

    /// State document is corrupted or invalid
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    /// State document was written with a newer schema
    #[error("Unsupported state schema version {found} (this release reads up to {supported})")]
    UnsupportedSchema { found: u64, supported: u32 },

    /// A state document, backup or workspace does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The bucket/container does not exist
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Failed to create bucket
    #[error("Failed to create bucket: {0}")]
    BucketCreationFailed(String),

    /// A backend call did not finish within the configured timeout
    #[error("Backend operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The operator interrupted the operation
    #[error("Interrupted")]
    Interrupted,

    /// Network or I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// AWS SDK error
    #[error("AWS error: {0}")]
    Aws(String),

    /// Remote state service error
    #[error("Remote service error: {0}")]
    Http(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Create a LockConflict error from the lock currently held
    pub fn locked(lock: &LockInfo) -> Self {
        Self::LockConflict {
            workspace: lock.workspace.clone(),
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for state storage backends
///
/// Every operation is scoped to a workspace. Implementations own the
/// durable bytes; callers go through [`crate::StateStore`], which adds
/// lock retry, timeouts and the lock-held check in front of writes.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Backend kind, for diagnostics
    fn kind(&self) -> BackendKind;

    /// Human readable location (e.g., "s3://bucket/prefix")
    fn location(&self) -> String;

    /// Read the current state of a workspace
    ///
    /// Returns `None` if no state exists (first-time use)
    async fn read_state(&self, workspace: &str) -> BackendResult<Option<StateDocument>>;

    /// Write the state of a workspace if the stored version equals `expected_version`
    ///
    /// `expected_version` 0 means no document may exist yet. Before
    /// replacing an existing document, a backup copy of it must be
    /// durable. The written document carries `expected_version + 1`,
    /// which is returned.
    async fn write_state(
        &self,
        workspace: &str,
        state: &StateDocument,
        expected_version: u64,
    ) -> BackendResult<u64>;

    /// Remove the state of a workspace, keeping a backup of it
    async fn delete_state(&self, workspace: &str) -> BackendResult<()>;

    /// Workspaces that currently hold a state document
    async fn list_workspaces(&self) -> BackendResult<Vec<String>>;

    /// Try once to take the lock; fails with `LockConflict` if a live lock exists
    ///
    /// Expired locks may be taken over.
    async fn try_lock(&self, lock: &LockInfo) -> BackendResult<()>;

    /// Release a previously acquired lock
    ///
    /// This should verify that the lock being released matches the provided lock info
    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()>;

    /// Force release a lock by its ID
    ///
    /// This is an administrative operation that should be used with caution
    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()>;

    /// The lock currently stored for a workspace, expired or not
    async fn current_lock(&self, workspace: &str) -> BackendResult<Option<LockInfo>>;

    /// Backups of a workspace, in no particular order
    async fn list_backups(&self, workspace: &str) -> BackendResult<Vec<BackupInfo>>;

    async fn read_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<StateDocument>;

    /// Store a backup snapshot verbatim (used when copying history between backends)
    async fn put_backup(
        &self,
        workspace: &str,
        backup: &BackupInfo,
        state: &StateDocument,
    ) -> BackendResult<()>;

    async fn delete_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<()>;

    /// Record that the workspace's state has been migrated elsewhere
    async fn mark_migrated(&self, workspace: &str, marker: &MigrationMarker) -> BackendResult<()>;

    async fn migration_marker(&self, workspace: &str) -> BackendResult<Option<MigrationMarker>>;

    /// Initialize the backend (create bucket or directory if needed)
    ///
    /// This is called when the backend is configured for the first time
    async fn init(&self) -> BackendResult<()>;
}

/// Storage medium kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Directory on the local filesystem
    Local,
    /// S3-compatible object storage
    ObjectStore,
    /// HTTP state service
    RemoteService,
}

impl BackendKind {
    /// Resolve a provider name as typed by an operator
    pub fn from_provider(provider: &str) -> BackendResult<Self> {
        match provider {
            "local" | "file" => Ok(Self::Local),
            "s3" | "object-store" => Ok(Self::ObjectStore),
            "remote" | "http" | "https" | "remote-service" => Ok(Self::RemoteService),
            other => Err(BackendError::unsupported_backend(other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::ObjectStore => write!(f, "object-store"),
            BackendKind::RemoteService => write!(f, "remote-service"),
        }
    }
}

/// Configuration for a state backend
///
/// `location_params` hold connection parameters only. Credentials are
/// referenced (an AWS profile name, the name of an environment variable
/// holding a token), never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    #[serde(default)]
    pub location_params: BTreeMap<String, String>,
}

impl BackendConfig {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            location_params: BTreeMap::new(),
        }
    }

    /// Local directory backend
    pub fn local(path: impl Into<String>) -> Self {
        Self::new(BackendKind::Local).with_param("path", path)
    }

    /// S3 backend rooted at `bucket/prefix`
    pub fn s3(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(BackendKind::ObjectStore)
            .with_param("bucket", bucket)
            .with_param("prefix", prefix)
    }

    /// HTTP state service at `address`
    pub fn remote(address: impl Into<String>) -> Self {
        Self::new(BackendKind::RemoteService).with_param("address", address)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.location_params.insert(key.into(), value.into());
        self
    }

    /// Build a configuration from an operator-supplied provider and location
    ///
    /// For `local` the location is a directory, for `s3` a bucket name
    /// optionally followed by `/prefix`, for `remote` a base URL.
    pub fn from_provider(provider: &str, location: &str, region: Option<&str>) -> BackendResult<Self> {
        let kind = BackendKind::from_provider(provider)?;
        if location.trim().is_empty() {
            return Err(BackendError::configuration("location must not be empty"));
        }

        let mut config = match kind {
            BackendKind::Local => Self::local(location),
            BackendKind::ObjectStore => {
                let location = location.trim_start_matches("s3://");
                let (bucket, prefix) = location.split_once('/').unwrap_or((location, ""));
                Self::s3(bucket, prefix.trim_matches('/'))
            }
            BackendKind::RemoteService => Self::remote(location.trim_end_matches('/')),
        };
        if let Some(region) = region {
            config = config.with_param("region", region);
        }
        Ok(config)
    }

    /// Parse a backend spec string
    ///
    /// Accepted forms: `local:<dir>`, `s3://bucket/prefix?region=<r>`,
    /// `remote+https://host/path`, `http(s)://host/path`.
    pub fn from_spec(spec: &str) -> BackendResult<Self> {
        let (base, query) = spec.split_once('?').unwrap_or((spec, ""));
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').ok_or_else(|| {
                BackendError::configuration(format!("malformed parameter '{}' in '{}'", pair, spec))
            })?;
            params.insert(k.to_string(), v.to_string());
        }

        let mut config = if let Some(path) = base.strip_prefix("local:") {
            Self::from_provider("local", path, None)?
        } else if base.starts_with("s3://") {
            Self::from_provider("s3", base, None)?
        } else if let Some(url) = base.strip_prefix("remote+") {
            Self::from_provider("remote", url, None)?
        } else if base.starts_with("http://") || base.starts_with("https://") {
            Self::from_provider("remote", base, None)?
        } else {
            return Err(BackendError::configuration(format!(
                "unrecognized backend spec '{}' (expected local:<dir>, s3://bucket/prefix or https://host/path)",
                spec
            )));
        };

        config.location_params.extend(params);
        Ok(config)
    }

    /// Stable identifier of the storage location
    pub fn id(&self) -> String {
        match self.kind {
            BackendKind::Local => format!("local:{}", self.get_string("path").unwrap_or(".")),
            BackendKind::ObjectStore => {
                let bucket = self.get_string("bucket").unwrap_or_default();
                match self.get_string("prefix").filter(|p| !p.is_empty()) {
                    Some(prefix) => format!("s3://{}/{}", bucket, prefix),
                    None => format!("s3://{}", bucket),
                }
            }
            BackendKind::RemoteService => self.get_string("address").unwrap_or_default().to_string(),
        }
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.location_params.get(key).map(String::as_str)
    }

    /// Get a boolean attribute value
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_string(key) {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Get a required string attribute
    pub fn require(&self, key: &str) -> BackendResult<&str> {
        self.get_string(key).ok_or_else(|| {
            BackendError::configuration(format!("Missing required attribute: {}", key))
        })
    }
}

impl fmt::Display for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.kind)
    }
}
