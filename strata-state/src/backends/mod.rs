//! Backend implementations for state storage

mod local;
mod remote;
mod s3;

pub use local::LocalBackend;
pub use remote::{DEFAULT_TOKEN_ENV, RemoteBackend};
pub use s3::S3Backend;

use crate::backend::{BackendConfig, BackendKind, BackendResult, StateBackend};

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the kind in the configuration.
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    match config.kind {
        BackendKind::Local => Ok(Box::new(LocalBackend::from_config(config)?)),
        BackendKind::ObjectStore => {
            let backend = S3Backend::from_config(config).await?;
            Ok(Box::new(backend))
        }
        BackendKind::RemoteService => Ok(Box::new(RemoteBackend::from_config(config)?)),
    }
}
