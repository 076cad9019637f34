//! Backup retention
//!
//! Selection is a pure function of the backup list, the policy and the
//! clock; [`prune`] applies it under the workspace lock. The newest
//! backup (the one immediately preceding the current document) is never
//! selected, and the current document is never touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::BackendResult;
use crate::backup::{BackupInfo, sort_newest_first};
use crate::store::StateStore;

/// Which backups to keep
///
/// A backup is removed when it is past `keep_latest` and either older
/// than `max_age` or beyond `max_count`. With neither limit set, every
/// backup past `keep_latest` is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
    /// Newest backups that are always kept; values below 1 count as 1
    pub keep_latest: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(30 * 24 * 60 * 60)),
            max_count: Some(50),
            keep_latest: 1,
        }
    }
}

impl RetentionPolicy {
    /// Number of newest backups that can never be selected
    pub fn floor(&self) -> usize {
        self.keep_latest.max(1)
    }

    fn unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_count.is_none()
    }
}

/// Backups `policy` selects for removal, newest first
pub fn select_expired(
    backups: &[BackupInfo],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<BackupInfo> {
    let mut ordered = backups.to_vec();
    sort_newest_first(&mut ordered);

    let max_age = policy
        .max_age
        .and_then(|age| chrono::Duration::from_std(age).ok());

    ordered
        .into_iter()
        .enumerate()
        .skip(policy.floor())
        .filter(|(index, backup)| {
            let too_old = max_age.is_some_and(|age| now - backup.created > age);
            let too_many = policy.max_count.is_some_and(|max| *index >= max);
            policy.unbounded() || too_old || too_many
        })
        .map(|(_, backup)| backup)
        .collect()
}

/// What a prune run did (or would do, for a dry run)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneOutcome {
    pub workspace: String,
    pub scanned: usize,
    pub removed: Vec<String>,
    pub kept: usize,
    pub dry_run: bool,
}

impl PruneOutcome {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// Remove backups of `workspace` that `policy` no longer retains
pub async fn prune(
    store: &StateStore,
    workspace: &str,
    policy: &RetentionPolicy,
    dry_run: bool,
) -> BackendResult<PruneOutcome> {
    store
        .with_lock(workspace, "prune", async |guard| {
            let backups = store.backups(workspace).await?;
            let expired = select_expired(&backups, policy, Utc::now());

            let mut outcome = PruneOutcome {
                workspace: workspace.to_string(),
                scanned: backups.len(),
                removed: Vec::with_capacity(expired.len()),
                kept: backups.len() - expired.len(),
                dry_run,
            };

            for backup in expired {
                if !dry_run {
                    store.delete_backup(&guard, &backup.id).await?;
                }
                outcome.removed.push(backup.id);
            }

            if dry_run {
                info!(workspace, would_remove = outcome.removed_count(), "prune dry run");
            } else if outcome.removed.is_empty() {
                info!(workspace, "nothing to prune");
            } else {
                info!(workspace, removed = outcome.removed_count(), kept = outcome.kept, "pruned backups");
            }
            if policy.keep_latest == 0 {
                warn!(workspace, "keep_latest 0 treated as 1, the newest backup is always kept");
            }
            Ok(outcome)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LocalBackend;
    use crate::state::StateDocument;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn backups_at_days(now: DateTime<Utc>, days: &[i64]) -> Vec<BackupInfo> {
        days.iter()
            .enumerate()
            .map(|(i, d)| BackupInfo::at(now - chrono::Duration::days(*d), i as u64 + 1))
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_newest_backup_is_never_selected() {
        let backups = backups_at_days(now(), &[400]);
        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(60)),
            max_count: Some(0),
            keep_latest: 0,
        };
        assert!(select_expired(&backups, &policy, now()).is_empty());
    }

    #[test]
    fn test_max_age() {
        let backups = backups_at_days(now(), &[1, 10, 40, 90]);
        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(30 * 24 * 3600)),
            max_count: None,
            keep_latest: 1,
        };
        let expired: Vec<u64> = select_expired(&backups, &policy, now())
            .iter()
            .map(|b| b.version)
            .collect();
        assert_eq!(expired, vec![3, 4]);
    }

    #[test]
    fn test_max_count() {
        let backups = backups_at_days(now(), &[1, 2, 3, 4, 5]);
        let policy = RetentionPolicy {
            max_age: None,
            max_count: Some(3),
            keep_latest: 1,
        };
        let expired: Vec<u64> = select_expired(&backups, &policy, now())
            .iter()
            .map(|b| b.version)
            .collect();
        assert_eq!(expired, vec![4, 5]);
    }

    #[test]
    fn test_keep_latest_overrides_limits() {
        let backups = backups_at_days(now(), &[100, 200, 300]);
        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(3600)),
            max_count: Some(1),
            keep_latest: 2,
        };
        let expired: Vec<u64> = select_expired(&backups, &policy, now())
            .iter()
            .map(|b| b.version)
            .collect();
        assert_eq!(expired, vec![3]);
    }

    #[test]
    fn test_keep_latest_only() {
        let backups = backups_at_days(now(), &[1, 2, 3, 4]);
        let policy = RetentionPolicy {
            max_age: None,
            max_count: None,
            keep_latest: 2,
        };
        assert_eq!(select_expired(&backups, &policy, now()).len(), 2);
    }

    #[test]
    fn test_policy_from_toml_like_json() {
        let policy: RetentionPolicy =
            serde_json::from_str(r#"{"max_age": "7days", "keep_latest": 3}"#).unwrap();
        assert_eq!(policy.max_age, Some(Duration::from_secs(7 * 24 * 3600)));
        assert_eq!(policy.max_count, Some(50));
        assert_eq!(policy.keep_latest, 3);
    }

    #[tokio::test]
    async fn test_prune_removes_backups_but_not_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(LocalBackend::with_root(dir.path())));

        let guard = store.acquire_lock("default", "write").await.unwrap();
        let mut state = StateDocument::with_lineage("l1");
        let mut version = 0;
        for _ in 0..4 {
            version = store.write(&guard, &state, version).await.unwrap();
            state.increment_serial();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store.release_lock(guard).await.unwrap();
        assert_eq!(store.backups("default").await.unwrap().len(), 3);

        let policy = RetentionPolicy {
            max_age: None,
            max_count: None,
            keep_latest: 1,
        };

        let preview = prune(&store, "default", &policy, true).await.unwrap();
        assert_eq!(preview.removed_count(), 2);
        assert_eq!(store.backups("default").await.unwrap().len(), 3);

        let outcome = prune(&store, "default", &policy, false).await.unwrap();
        assert_eq!(outcome.removed_count(), 2);
        assert_eq!(outcome.kept, 1);

        let remaining = store.backups("default").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version, 3);
        assert_eq!(store.read("default").await.unwrap().version, 4);
        assert!(store.current_lock("default").await.unwrap().is_none());
    }
}
