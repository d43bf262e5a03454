//! Interface to the subsystem that performs the physical mount
//!
//! The coordinator never talks to FUSE directly. It hands a resolved
//! [`MountConfig`] to a [`Mounter`] and gets back a [`MountHandle`] once the
//! bucket is visible at the mountpoint.

pub mod command;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::options::MountConfig;

pub use command::{CommandMounter, CommandMounterConfig};

/// Token for an established mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    mount_point: PathBuf,
    pid: Option<u32>,
}

impl MountHandle {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Process serving the mount, when there is one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Performs mounts and unmounts of buckets onto local paths
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `config.bucket` at `config.mount_point`, returning once it is usable
    async fn mount(&self, config: &MountConfig) -> Result<MountHandle>;

    /// Tear down whatever is mounted at `mount_point`
    async fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Whether `mount_point` is a broken mount left by a dead process
    fn is_stale(&self, mount_point: &Path) -> bool {
        is_disconnected(mount_point)
    }
}

/// A FUSE mount whose server died answers every stat with `ENOTCONN`
pub fn is_disconnected(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(_) => false,
        Err(e) => is_enotconn(&e),
    }
}

fn is_enotconn(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTCONN)
}

/// Check whether `path` is the root of a mounted filesystem by comparing
/// its device id with its parent's
pub fn is_mountpoint(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(path_meta) = std::fs::metadata(path) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return false;
    };
    let Ok(parent_meta) = std::fs::metadata(parent) else {
        return false;
    };

    path_meta.dev() != parent_meta.dev()
}
