//! S3 backend for state storage
//!
//! Objects live under `<prefix>/<workspace>/`: `state.json`, `state.lock`,
//! `migrated.json` and `backups/<backup-id>.json`. Mutual exclusion and
//! compare-and-swap both rest on S3 conditional writes: the lock object
//! is created with `If-None-Match: *`, and the state object is replaced
//! with `If-Match: <etag>` of the copy that was version-checked.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketVersioningStatus, PublicAccessBlockConfiguration, ServerSideEncryption,
    VersioningConfiguration,
};
use tracing::{debug, warn};

use crate::backend::{BackendConfig, BackendError, BackendKind, BackendResult, StateBackend};
use crate::backup::{BackupInfo, MigrationMarker};
use crate::lock::LockInfo;
use crate::state::StateDocument;

const STATE_OBJECT: &str = "state.json";
const LOCK_OBJECT: &str = "state.lock";
const MARKER_OBJECT: &str = "migrated.json";
const BACKUP_PREFIX: &str = "backups/";

/// S3-based state backend
pub struct S3Backend {
    /// S3 client
    client: Client,
    /// Bucket name
    bucket: String,
    /// Key prefix shared by all workspaces, without surrounding slashes
    prefix: String,
    /// AWS region, if one was configured or resolved from the environment
    region: Option<String>,
    /// Whether to encrypt objects at rest (default: true)
    encrypt: bool,
    /// Whether to auto-create the bucket if it doesn't exist (default: true)
    auto_create: bool,
}

/// An object body together with the ETag it was read at
struct Fetched {
    bytes: Vec<u8>,
    etag: Option<String>,
}

impl S3Backend {
    /// Create a new S3Backend from configuration
    ///
    /// Credentials come from the standard AWS provider chain; the optional
    /// `profile` parameter selects a named profile. `endpoint` points the
    /// client at an S3-compatible service and switches to path-style URLs.
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let bucket = config.require("bucket")?.to_string();
        let prefix = config
            .get_string("prefix")
            .unwrap_or_default()
            .trim_matches('/')
            .to_string();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = config.get_string("region") {
            loader = loader.region(aws_sdk_s3::config::Region::new(convert_region_value(region)));
        }
        if let Some(profile) = config.get_string("profile") {
            loader = loader.profile_name(profile);
        }
        let aws_config = loader.load().await;
        let region = aws_config.region().map(|r| r.to_string());

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = config.get_string("endpoint") {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(s3_config.build());

        Ok(Self {
            client,
            bucket,
            prefix,
            region,
            encrypt: config.get_bool_or("encrypt", true),
            auto_create: config.get_bool_or("auto_create", true),
        })
    }

    /// Get the bucket name
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    /// Get whether auto_create is enabled
    pub fn auto_create_enabled(&self) -> bool {
        self.auto_create
    }

    fn key(&self, workspace: &str, name: &str) -> String {
        object_key(&self.prefix, workspace, name)
    }

    fn backup_key(&self, workspace: &str, backup_id: &str) -> String {
        self.key(workspace, &format!("{}{}.json", BACKUP_PREFIX, backup_id))
    }

    async fn get(&self, key: &str) -> BackendResult<Option<Fetched>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| BackendError::Io(e.to_string()))?;
                Ok(Some(Fetched {
                    bytes: body.into_bytes().to_vec(),
                    etag,
                }))
            }
            Err(err) if is_not_found_error(&err) => Ok(None),
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    /// Put an object, optionally conditioned on its current ETag or absence
    ///
    /// Returns `Ok(false)` if the precondition did not hold.
    async fn put(&self, key: &str, body: Vec<u8>, condition: Condition<'_>) -> BackendResult<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }
        request = match condition {
            Condition::None => request,
            Condition::Absent => request.if_none_match("*"),
            Condition::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) if is_precondition_failed(&err) => Ok(false),
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackendError::Aws(e.to_string()))?;
        Ok(())
    }

    /// Every key under `prefix`, following continuation tokens
    async fn list_keys(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| BackendError::Aws(e.to_string()))?;

            keys.extend(output.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn read_lock(&self, workspace: &str) -> BackendResult<Option<(LockInfo, Option<String>)>> {
        let Some(fetched) = self.get(&self.key(workspace, LOCK_OBJECT)).await? else {
            return Ok(None);
        };
        let lock = serde_json::from_slice(&fetched.bytes)
            .map_err(|e| BackendError::CorruptState(format!("Failed to parse lock object: {}", e)))?;
        Ok(Some((lock, fetched.etag)))
    }

    async fn bucket_exists(&self) -> BackendResult<bool> {
        let result = self.client.head_bucket().bucket(&self.bucket).send().await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_not_found_error(&err) => Ok(false),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    async fn create_bucket(&self) -> BackendResult<()> {
        // Create bucket with location constraint if not us-east-1
        let mut create_request = self.client.create_bucket().bucket(&self.bucket);

        if let Some(region) = self.region.as_deref().filter(|r| *r != "us-east-1") {
            use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};

            let config = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build();
            create_request = create_request.create_bucket_configuration(config);
        }

        create_request
            .send()
            .await
            .map_err(|e| BackendError::BucketCreationFailed(e.to_string()))?;

        // Object versioning keeps S3's own history in addition to ours
        let versioning_config = VersioningConfiguration::builder()
            .status(BucketVersioningStatus::Enabled)
            .build();

        self.client
            .put_bucket_versioning()
            .bucket(&self.bucket)
            .versioning_configuration(versioning_config)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to enable versioning: {}", e)))?;

        let public_access_block = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .block_public_policy(true)
            .ignore_public_acls(true)
            .restrict_public_buckets(true)
            .build();

        self.client
            .put_public_access_block()
            .bucket(&self.bucket)
            .public_access_block_configuration(public_access_block)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to block public access: {}", e)))?;

        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Condition<'a> {
    None,
    Absent,
    Matches(&'a str),
}

#[async_trait]
impl StateBackend for S3Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn location(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }

    async fn read_state(&self, workspace: &str) -> BackendResult<Option<StateDocument>> {
        match self.get(&self.key(workspace, STATE_OBJECT)).await? {
            Some(fetched) => StateDocument::load(&fetched.bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn write_state(
        &self,
        workspace: &str,
        state: &StateDocument,
        expected_version: u64,
    ) -> BackendResult<u64> {
        let key = self.key(workspace, STATE_OBJECT);
        let current = self.get(&key).await?;

        let (actual, condition) = match &current {
            Some(fetched) => {
                let stored = StateDocument::load(&fetched.bytes)?;
                if stored.version == expected_version && stored.lineage != state.lineage {
                    return Err(BackendError::LineageMismatch {
                        expected: stored.lineage,
                        actual: state.lineage.clone(),
                    });
                }
                let condition = fetched
                    .etag
                    .as_deref()
                    .map_or(Condition::None, Condition::Matches);
                (stored.version, condition)
            }
            None => (0, Condition::Absent),
        };

        if actual != expected_version {
            return Err(BackendError::VersionConflict {
                workspace: workspace.to_string(),
                expected: expected_version,
                actual,
            });
        }

        if let Some(fetched) = &current {
            let backup = BackupInfo::at(chrono::Utc::now(), actual);
            self.put(
                &self.backup_key(workspace, &backup.id),
                fetched.bytes.clone(),
                Condition::None,
            )
            .await?;
            debug!(workspace, backup = %backup.id, "wrote state backup");
        }

        let mut next = state.clone();
        next.version = expected_version + 1;
        if !self.put(&key, next.serialize()?, condition).await? {
            // Someone replaced the object between our read and our put
            let actual = self
                .read_state(workspace)
                .await?
                .map_or(0, |stored| stored.version);
            return Err(BackendError::VersionConflict {
                workspace: workspace.to_string(),
                expected: expected_version,
                actual,
            });
        }

        Ok(next.version)
    }

    async fn delete_state(&self, workspace: &str) -> BackendResult<()> {
        let key = self.key(workspace, STATE_OBJECT);
        let Some(fetched) = self.get(&key).await? else {
            return Err(BackendError::not_found(format!(
                "state for workspace '{}'",
                workspace
            )));
        };

        let stored = StateDocument::load(&fetched.bytes)?;
        let backup = BackupInfo::for_document(&stored);
        self.put(&self.backup_key(workspace, &backup.id), fetched.bytes, Condition::None)
            .await?;
        self.delete(&key).await
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        let root = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };

        let suffix = format!("/{}", STATE_OBJECT);
        let mut workspaces: Vec<String> = self
            .list_keys(&root)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&root)?.strip_suffix(&suffix))
            .filter(|name| !name.contains('/'))
            .map(str::to_string)
            .collect();
        workspaces.sort();
        workspaces.dedup();
        Ok(workspaces)
    }

    async fn try_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let key = self.key(&lock.workspace, LOCK_OBJECT);
        let body = serde_json::to_vec_pretty(lock)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        if self.put(&key, body.clone(), Condition::Absent).await? {
            return Ok(());
        }

        let Some((existing, etag)) = self.read_lock(&lock.workspace).await? else {
            // Released in between; one more attempt
            return if self.put(&key, body, Condition::Absent).await? {
                Ok(())
            } else {
                Err(BackendError::LockConflict {
                    workspace: lock.workspace.clone(),
                    lock_id: "unknown".to_string(),
                    who: "unknown".to_string(),
                    operation: "unknown".to_string(),
                })
            };
        };

        if !existing.is_expired() {
            return Err(BackendError::locked(&existing));
        }

        warn!(
            workspace = %lock.workspace,
            lock_id = %existing.id,
            who = %existing.who,
            "taking over expired lock"
        );
        let condition = etag.as_deref().map_or(Condition::None, Condition::Matches);
        if self.put(&key, body, condition).await? {
            Ok(())
        } else {
            match self.read_lock(&lock.workspace).await? {
                Some((winner, _)) => Err(BackendError::locked(&winner)),
                None => Err(BackendError::locked(&existing)),
            }
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        // Verify the lock exists and matches
        let Some((existing, _)) = self.read_lock(&lock.workspace).await? else {
            return Err(BackendError::LockNotFound(lock.id.clone()));
        };
        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }

        self.delete(&self.key(&lock.workspace, LOCK_OBJECT)).await
    }

    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()> {
        let key = self.key(workspace, LOCK_OBJECT);
        match self.read_lock(workspace).await {
            Ok(Some((existing, _))) if existing.id != lock_id => {
                return Err(BackendError::LockMismatch {
                    expected: lock_id.to_string(),
                    actual: existing.id,
                });
            }
            Ok(Some(_)) | Err(BackendError::CorruptState(_)) => {}
            Ok(None) => return Err(BackendError::LockNotFound(lock_id.to_string())),
            Err(e) => return Err(e),
        }

        self.delete(&key).await
    }

    async fn current_lock(&self, workspace: &str) -> BackendResult<Option<LockInfo>> {
        Ok(self.read_lock(workspace).await?.map(|(lock, _)| lock))
    }

    async fn list_backups(&self, workspace: &str) -> BackendResult<Vec<BackupInfo>> {
        let prefix = self.key(workspace, BACKUP_PREFIX);
        Ok(self
            .list_keys(&prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix)?.strip_suffix(".json"))
            .filter_map(BackupInfo::parse_id)
            .collect())
    }

    async fn read_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<StateDocument> {
        match self.get(&self.backup_key(workspace, backup_id)).await? {
            Some(fetched) => StateDocument::load(&fetched.bytes),
            None => Err(BackendError::not_found(format!(
                "backup '{}' of workspace '{}'",
                backup_id, workspace
            ))),
        }
    }

    async fn put_backup(
        &self,
        workspace: &str,
        backup: &BackupInfo,
        state: &StateDocument,
    ) -> BackendResult<()> {
        self.put(
            &self.backup_key(workspace, &backup.id),
            state.serialize()?,
            Condition::None,
        )
        .await
        .map(|_| ())
    }

    async fn delete_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<()> {
        self.delete(&self.backup_key(workspace, backup_id)).await
    }

    async fn mark_migrated(&self, workspace: &str, marker: &MigrationMarker) -> BackendResult<()> {
        let body = serde_json::to_vec_pretty(marker)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        self.put(&self.key(workspace, MARKER_OBJECT), body, Condition::None)
            .await
            .map(|_| ())
    }

    async fn migration_marker(&self, workspace: &str) -> BackendResult<Option<MigrationMarker>> {
        match self.get(&self.key(workspace, MARKER_OBJECT)).await? {
            Some(fetched) => serde_json::from_slice(&fetched.bytes).map(Some).map_err(|e| {
                BackendError::CorruptState(format!("Failed to parse migration marker: {}", e))
            }),
            None => Ok(None),
        }
    }

    async fn init(&self) -> BackendResult<()> {
        if self.bucket_exists().await? {
            return Ok(());
        }
        if !self.auto_create {
            return Err(BackendError::BucketNotFound(self.bucket.clone()));
        }
        debug!(bucket = %self.bucket, "creating state bucket");
        self.create_bucket().await
    }
}

/// Join prefix, workspace and object name into a key
fn object_key(prefix: &str, workspace: &str, name: &str) -> String {
    if prefix.is_empty() {
        format!("{}/{}", workspace, name)
    } else {
        format!("{}/{}/{}", prefix, workspace, name)
    }
}

/// Convert region value from DSL format to AWS format
/// e.g., "aws.Region.ap_northeast_1" -> "ap-northeast-1"
fn convert_region_value(value: &str) -> String {
    match value.strip_prefix("aws.Region.") {
        Some(region) => region.replace('_', "-"),
        None => value.to_string(),
    }
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|raw| raw.status().as_u16())
}

/// Check if an S3 error is a "not found" error
fn is_not_found_error<E>(err: &SdkError<E>) -> bool {
    status_of(err) == Some(404)
}

/// 412 for a failed If-Match/If-None-Match, 409 for a concurrent conditional write
fn is_precondition_failed<E>(err: &SdkError<E>) -> bool {
    matches!(status_of(err), Some(412) | Some(409))
}
