use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for volume driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid volume options: {0}")]
    Validation(String),

    #[error("volume {0} not found")]
    NotFound(String),

    #[error("volume {0} is in use")]
    InUse(String),

    #[error("volume {name} already exists with bucket {existing}, refusing to remap it to {requested}")]
    AlreadyConfigured {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("{0:?} already exists and is not a directory")]
    InvalidMountPoint(PathBuf),

    #[error("mount failed at {path:?}: {reason}")]
    MountFailed { path: PathBuf, reason: String },

    #[error("unmount failed at {path:?}: {reason}")]
    UnmountFailed { path: PathBuf, reason: String },

    #[error("corrupt state file {path:?}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("failed to persist volume state: {0}")]
    Persistence(String),

    #[error("bucket provisioning failed: {0}")]
    Provisioning(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Persistence failures are reported to operators but never fail the
    /// in-memory operation that triggered them.
    pub fn is_persistence_warning(&self) -> bool {
        matches!(self, DriverError::Persistence(_))
    }

    /// Errors raised by the external mounter, in either direction
    pub fn is_mounter_error(&self) -> bool {
        matches!(
            self,
            DriverError::MountFailed { .. } | DriverError::UnmountFailed { .. }
        )
    }

    /// Copy of this error for every caller sharing one failed transition.
    ///
    /// `io::Error` is not `Clone`; its kind and message are kept.
    pub fn duplicate(&self) -> Self {
        match self {
            DriverError::Validation(msg) => DriverError::Validation(msg.clone()),
            DriverError::NotFound(name) => DriverError::NotFound(name.clone()),
            DriverError::InUse(name) => DriverError::InUse(name.clone()),
            DriverError::AlreadyConfigured {
                name,
                existing,
                requested,
            } => DriverError::AlreadyConfigured {
                name: name.clone(),
                existing: existing.clone(),
                requested: requested.clone(),
            },
            DriverError::InvalidMountPoint(path) => DriverError::InvalidMountPoint(path.clone()),
            DriverError::MountFailed { path, reason } => DriverError::MountFailed {
                path: path.clone(),
                reason: reason.clone(),
            },
            DriverError::UnmountFailed { path, reason } => DriverError::UnmountFailed {
                path: path.clone(),
                reason: reason.clone(),
            },
            DriverError::CorruptState { path, reason } => DriverError::CorruptState {
                path: path.clone(),
                reason: reason.clone(),
            },
            DriverError::Persistence(msg) => DriverError::Persistence(msg.clone()),
            DriverError::Provisioning(msg) => DriverError::Provisioning(msg.clone()),
            DriverError::Io(e) => DriverError::Io(io::Error::new(e.kind(), e.to_string())),
            DriverError::Internal(msg) => DriverError::Internal(msg.clone()),
        }
    }

    pub fn mount_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        DriverError::MountFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unmount_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        DriverError::UnmountFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for volume driver operations
pub type Result<T> = std::result::Result<T, DriverError>;
