//! Settings loaded from `<root>/config.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use strata_state::{BackendConfig, LockPolicy, RetentionPolicy, StateStore};

use crate::error::{CoreError, CoreResult};

/// Directory holding the registry, settings, audit log and reports
pub const DEFAULT_ROOT: &str = ".strata";
pub const CONFIG_FILE: &str = "config.toml";

/// Operator-tunable settings
///
/// Every field has a default, so a missing file or a partial file is fine.
///
/// ```toml
/// io_timeout = "90s"
///
/// [lock]
/// timeout = "2m"
/// ttl = "30m"
///
/// [retention]
/// max_age = "14days"
/// keep_latest = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub lock: LockPolicy,
    /// Bound on each individual backend call
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Default policy for `cleanup`
    pub retention: RetentionPolicy,
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock: LockPolicy::default(),
            io_timeout: strata_state::DEFAULT_IO_TIMEOUT,
            retention: RetentionPolicy::default(),
            audit: AuditSettings::default(),
        }
    }
}

impl Settings {
    pub fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    /// Load settings from `root`, falling back to defaults when the file is absent
    pub fn load(root: &Path) -> CoreResult<Self> {
        let path = Self::path(root);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(CoreError::io(path, e)),
        };

        toml::from_str(&content).map_err(|e| CoreError::Config {
            path,
            reason: e.to_string(),
        })
    }

    /// Open a store for `config` with these settings' lock policy and I/O timeout
    pub async fn open_store(&self, config: &BackendConfig) -> CoreResult<StateStore> {
        Ok(StateStore::open(config)
            .await?
            .with_policy(self.lock)
            .with_io_timeout(self.io_timeout))
    }
}
