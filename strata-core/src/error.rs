//! Error taxonomy and its mapping onto process exit codes

use std::path::PathBuf;

use strata_state::BackendError;
use thiserror::Error;

/// Errors surfaced by strata operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    State(#[from] BackendError),

    #[error("Workspace '{0}' does not exist")]
    WorkspaceNotFound(String),

    #[error("Workspace '{0}' already exists")]
    WorkspaceExists(String),

    #[error("Invalid workspace name '{name}': {reason}")]
    InvalidWorkspaceName { name: String, reason: String },

    #[error("Workspace '{name}' still manages {resources} resource(s)")]
    WorkspaceNotEmpty { name: String, resources: usize },

    #[error("Workspace '{0}' is the current workspace")]
    CurrentWorkspace(String),

    #[error("Workspace '{0}' is the only workspace; there is nothing to switch to")]
    LastWorkspace(String),

    #[error("The workspace registry is locked by another strata process ({})", .0.display())]
    RegistryLocked(PathBuf),

    #[error("No backend is configured")]
    NoBackend,

    #[error("No current workspace is selected")]
    NoCurrentWorkspace,

    #[error("Target {target} already holds state with lineage {lineage}")]
    TargetNotEmpty { target: String, lineage: String },

    #[error(
        "Migration of workspace '{workspace}' to {target} failed while writing the target: {cause}"
    )]
    MigrationIndeterminate {
        workspace: String,
        target: String,
        cause: BackendError,
    },

    #[error("Workspace '{workspace}' was migrated to {target}; its state here is no longer authoritative")]
    MigratedSource { workspace: String, target: String },

    #[error("Unrecognized artifact {path}: {reason}")]
    Artifact { path: PathBuf, reason: String },

    #[error("Configuration error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for strata operations
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Artifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this error's category
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::State(e) => match e {
                BackendError::LockConflict { .. }
                | BackendError::LockMismatch { .. }
                | BackendError::LockLost { .. } => 3,
                BackendError::VersionConflict { .. } => 4,
                BackendError::CorruptState(_) | BackendError::UnsupportedSchema { .. } => 5,
                BackendError::LineageMismatch { .. } => 6,
                BackendError::NotFound(_)
                | BackendError::LockNotFound(_)
                | BackendError::BucketNotFound(_) => 8,
                BackendError::UnsupportedBackend(_) => 2,
                BackendError::Interrupted => 130,
                _ => 1,
            },
            CoreError::InvalidWorkspaceName { .. } => 2,
            CoreError::RegistryLocked(_) => 3,
            CoreError::Artifact { .. } => 5,
            CoreError::WorkspaceNotEmpty { .. }
            | CoreError::CurrentWorkspace(_)
            | CoreError::LastWorkspace(_)
            | CoreError::TargetNotEmpty { .. }
            | CoreError::MigratedSource { .. } => 7,
            CoreError::WorkspaceNotFound(_) | CoreError::NoBackend | CoreError::NoCurrentWorkspace => 8,
            CoreError::WorkspaceExists(_)
            | CoreError::MigrationIndeterminate { .. }
            | CoreError::Config { .. }
            | CoreError::Io { .. }
            | CoreError::Serialization(_) => 1,
        }
    }

    /// The corrective action an operator should take
    pub fn remedy(&self) -> Option<String> {
        let text = match self {
            CoreError::State(e) => match e {
                BackendError::LockConflict { lock_id, .. } => format!(
                    "retry later, or if the holder is gone run `strata force-unlock {}`",
                    lock_id
                ),
                BackendError::LockLost { .. } => {
                    "the lock expired or was forcibly released; reload and retry".to_string()
                }
                BackendError::VersionConflict { .. } => {
                    "the state changed since it was read; reload and retry".to_string()
                }
                BackendError::CorruptState(_) => {
                    "the document is not repaired automatically; restore a backup with `strata restore <backup-id>`"
                        .to_string()
                }
                BackendError::UnsupportedSchema { .. } => {
                    "upgrade strata to a release that reads this schema".to_string()
                }
                BackendError::LineageMismatch { .. } => {
                    "the documents belong to different state histories; confirm intent with --force"
                        .to_string()
                }
                BackendError::UnsupportedBackend(_) => {
                    "use one of: local, s3, remote".to_string()
                }
                BackendError::Timeout { .. } => {
                    "check connectivity to the backend or raise io_timeout in config.toml".to_string()
                }
                BackendError::BucketNotFound(_) => {
                    "create the bucket or set auto_create=true".to_string()
                }
                _ => return None,
            },
            CoreError::WorkspaceNotFound(_) => {
                "create it with `strata create-workspace <name>`".to_string()
            }
            CoreError::WorkspaceExists(_) => {
                "choose another name or `strata switch-workspace` to it".to_string()
            }
            CoreError::InvalidWorkspaceName { .. } => {
                "use letters, digits, '-' and '_' (at most 64 characters)".to_string()
            }
            CoreError::WorkspaceNotEmpty { .. } => {
                "requires --force, or remove its resources first".to_string()
            }
            CoreError::CurrentWorkspace(_) => {
                "switch to another workspace first, or pass --force".to_string()
            }
            CoreError::LastWorkspace(_) => {
                "create another workspace to switch to before deleting this one".to_string()
            }
            CoreError::RegistryLocked(path) => format!(
                "retry; if no other strata process is running, remove {}",
                path.display()
            ),
            CoreError::NoBackend => {
                "run `strata configure-backend <provider> <location>` first".to_string()
            }
            CoreError::NoCurrentWorkspace => {
                "run `strata create-workspace <name>` or `strata switch-workspace <name>`"
                    .to_string()
            }
            CoreError::TargetNotEmpty { .. } => {
                "requires --overwrite to replace the target's state".to_string()
            }
            CoreError::MigrationIndeterminate { .. } => {
                "the source is still authoritative; inspect the target and reconcile manually before retrying"
                    .to_string()
            }
            CoreError::MigratedSource { target, .. } => format!(
                "configure {} as the backend, or pass --force to write to the old backend anyway",
                target
            ),
            CoreError::Artifact { .. } => {
                "pass a strata state document, `terraform state pull` output or `terraform show -json` output"
                    .to_string()
            }
            CoreError::Config { .. } => "fix or remove the configuration file".to_string(),
            CoreError::Io { .. } | CoreError::Serialization(_) => return None,
        };
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_by_category() {
        let lock = CoreError::from(BackendError::LockConflict {
            workspace: "default".to_string(),
            lock_id: "abc".to_string(),
            who: "me@host".to_string(),
            operation: "write".to_string(),
        });
        assert_eq!(lock.exit_code(), 3);
        assert!(lock.remedy().unwrap().contains("force-unlock abc"));

        let version = CoreError::from(BackendError::VersionConflict {
            workspace: "default".to_string(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(version.exit_code(), 4);
        assert!(version.remedy().unwrap().contains("reload and retry"));

        assert_eq!(
            CoreError::from(BackendError::CorruptState("x".to_string())).exit_code(),
            5
        );
        assert_eq!(
            CoreError::from(BackendError::LineageMismatch {
                expected: "a".to_string(),
                actual: "b".to_string()
            })
            .exit_code(),
            6
        );
        assert_eq!(CoreError::CurrentWorkspace("w".to_string()).exit_code(), 7);
        assert_eq!(CoreError::WorkspaceNotFound("w".to_string()).exit_code(), 8);
        assert_eq!(CoreError::from(BackendError::Interrupted).exit_code(), 130);
    }

    #[test]
    fn test_current_workspace_remedy_names_switch() {
        let err = CoreError::CurrentWorkspace("default".to_string());
        assert!(err.remedy().unwrap().contains("switch to another workspace first"));
    }

    #[test]
    fn test_transparent_display() {
        let err = CoreError::from(BackendError::NotFound("state for workspace 'x'".to_string()));
        assert_eq!(err.to_string(), "Not found: state for workspace 'x'");
    }
}
