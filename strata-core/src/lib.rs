//! Strata Core
//!
//! Workspace lifecycle, drift detection, backend migration and the state
//! operations behind the strata CLI

pub mod artifact;
pub mod audit;
pub mod config;
pub mod drift;
pub mod error;
pub mod migrate;
pub mod ops;
pub mod workspace;

pub use config::Settings;
pub use error::{CoreError, CoreResult};
pub use workspace::WorkspaceManager;
