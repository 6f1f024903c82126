//! Error types for the mirroring layer.

use std::path::PathBuf;
use thiserror::Error;

use crate::vfs::VfsError;

/// Error type for mirroring filesystem operations.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// No destination backend was configured.
    #[error("destination filesystem needs to be specified")]
    NoDestination,

    /// A behavior setting is out of range.
    #[error("invalid behavior: {0}")]
    InvalidBehavior(String),

    /// The behavior file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The behavior file is not valid TOML for [`Behavior`](crate::Behavior).
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The temporary backend rejected an operation.
    #[error("temporary filesystem had an issue: {0}")]
    Temporary(#[source] VfsError),

    /// The destination backend rejected a mirrored operation.
    ///
    /// Only produced on the worker, where it is logged and dropped.
    #[error("destination filesystem had an issue: {0}")]
    Destination(#[source] VfsError),

    /// The filesystem was closed, or its worker is gone.
    #[error("mirror filesystem is closed")]
    Closed,
}

/// Result type for mirroring filesystem operations.
pub type MirrorResult<T> = Result<T, MirrorError>;
