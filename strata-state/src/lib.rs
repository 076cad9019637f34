//! Strata State Management
//!
//! This crate holds the durable side of the strata state manager: the
//! typed state document, the backends that store it, workspace locks,
//! backups and backup retention.
//!
//! # Overview
//!
//! - **StateDocument**: resources, outputs and the `version`/`serial` counters
//! - **StateBackend**: a trait for storage backends (local directory, S3, HTTP service)
//! - **StateStore**: a backend plus lock retry, I/O timeouts and scoped locking
//! - **RetentionPolicy**: which backup snapshots to keep
//!
//! # Example
//!
//! ```ignore
//! use strata_state::{BackendConfig, StateStore};
//!
//! let store = StateStore::open(&BackendConfig::from_spec("s3://tf-state/core?region=eu-west-1")?).await?;
//!
//! store
//!     .with_lock("prod", "write", async |guard| {
//!         let mut state = store.read("prod").await?;
//!         let expected = state.version;
//!         // ... modify resources ...
//!         state.increment_serial();
//!         store.write(&guard, &state, expected).await
//!     })
//!     .await?;
//! ```

pub mod backend;
pub mod backends;
pub mod backup;
pub mod lock;
pub mod retention;
pub mod state;
pub mod store;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendKind, BackendResult, StateBackend};
pub use backends::create_backend;
pub use backup::{BackupInfo, MigrationMarker};
pub use lock::{LockInfo, LockPolicy, lock_owner};
pub use retention::{PruneOutcome, RetentionPolicy, prune};
pub use state::{
    InstanceKey, OutputValue, ResourceAddress, ResourceMode, ResourceRecord, StateDocument,
    StateMetadata,
};
pub use store::{DEFAULT_IO_TIMEOUT, LockGuard, StateStore};
