//! Backup snapshot and migration marker metadata

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::StateDocument;

const ID_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// A timestamped copy of a state document taken before it was replaced
///
/// The identifier encodes both fields (`20261018T134300123Z-v3`), so
/// backends can list backups without reading them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub created: DateTime<Utc>,
    /// Storage version of the document that was backed up
    pub version: u64,
}

impl BackupInfo {
    /// Backup metadata for a document being replaced now
    pub fn for_document(state: &StateDocument) -> Self {
        Self::at(Utc::now(), state.version)
    }

    pub fn at(created: DateTime<Utc>, version: u64) -> Self {
        Self {
            id: format!("{}-v{}", created.format(ID_TIME_FORMAT), version),
            created,
            version,
        }
    }

    /// Recover backup metadata from its identifier
    pub fn parse_id(id: &str) -> Option<Self> {
        let (timestamp, version) = id.rsplit_once("-v")?;
        let created = NaiveDateTime::parse_from_str(timestamp, ID_TIME_FORMAT)
            .ok()?
            .and_utc();
        Some(Self {
            id: id.to_string(),
            created,
            version: version.parse().ok()?,
        })
    }
}

/// Sort newest first; ties on time are broken by version
pub fn sort_newest_first(backups: &mut [BackupInfo]) {
    backups.sort_by(|a, b| {
        b.created
            .cmp(&a.created)
            .then_with(|| b.version.cmp(&a.version))
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Left on a source backend once its state has been copied elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMarker {
    /// Identifier of the backend that is now authoritative
    pub target: String,
    pub migrated_at: DateTime<Utc>,
    pub lineage: String,
    pub serial: u64,
    /// Version the source held when it was copied
    pub source_version: u64,
    /// Version the target assigned to the copy
    pub target_version: u64,
    pub who: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_id_round_trip() {
        let created = Utc.with_ymd_and_hms(2026, 10, 18, 13, 43, 0).unwrap();
        let info = BackupInfo::at(created, 12);
        assert_eq!(info.id, "20261018T134300000Z-v12");

        let parsed = BackupInfo::parse_id(&info.id).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!(BackupInfo::parse_id("state.json").is_none());
        assert!(BackupInfo::parse_id("20261018T134300000Z-vX").is_none());
        assert!(BackupInfo::parse_id("yesterday-v1").is_none());
    }

    #[test]
    fn test_sort_newest_first() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut backups = vec![
            BackupInfo::at(t, 1),
            BackupInfo::at(t + chrono::Duration::hours(2), 3),
            BackupInfo::at(t + chrono::Duration::hours(1), 2),
        ];
        sort_newest_first(&mut backups);
        let versions: Vec<u64> = backups.iter().map(|b| b.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }
}
