//! Authoritative map of volume name to volume record
//!
//! The registry itself is not synchronized: it lives inside the
//! [`MountCoordinator`](crate::mount::MountCoordinator) lock, which
//! serializes every operation on it. Each mutation rewrites the snapshot
//! through the [`StateStore`]; a failed write is logged, not returned.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};
use crate::mounter::is_mountpoint;
use crate::options::{BucketRef, MountConfig, OptionTranslator};
use crate::state::{Snapshot, StateStore, STATE_VERSION};

/// One named volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub mount_config: MountConfig,
    /// Containers currently holding the volume mounted
    #[serde(default)]
    pub connection_count: u32,
    pub created_at: DateTime<Utc>,
}

impl VolumeRecord {
    pub fn new(name: impl Into<String>, mount_config: MountConfig) -> Self {
        Self {
            name: name.into(),
            mount_config,
            connection_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn bucket(&self) -> &BucketRef {
        &self.mount_config.bucket
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_config.mount_point
    }

    pub fn is_attached(&self) -> bool {
        self.connection_count > 0
    }

    /// Best-effort removal of the mount and cache directories.
    ///
    /// Stats the mountpoint, so callers must not hold the coordinator lock.
    pub fn remove_dirs(&self) {
        remove_tree(self.mount_point());
        if let Some(cache_dir) = &self.mount_config.cache_dir {
            remove_tree(cache_dir);
        }
    }
}

/// In-memory volume registry backed by a snapshot store
pub struct VolumeRegistry {
    translator: OptionTranslator,
    store: Box<dyn StateStore>,
    volumes: BTreeMap<String, VolumeRecord>,
}

impl VolumeRegistry {
    /// Load the registry from `store`.
    ///
    /// Connection counts from a previous process cannot describe real
    /// attachments any more and are reset to zero; stale mounts left behind
    /// are detected and repaired when the volume is next mounted.
    pub fn open(translator: OptionTranslator, store: Box<dyn StateStore>) -> Result<Self> {
        let snapshot = store.load()?;
        let mut volumes = snapshot.volumes;

        for record in volumes.values_mut() {
            if record.connection_count > 0 {
                info!(
                    volume = %record.name,
                    connections = record.connection_count,
                    "resetting connection count left by previous run"
                );
                record.connection_count = 0;
            }

            let expected = translator.mount_point(&record.name);
            if record.mount_config.mount_point != expected {
                warn!(
                    volume = %record.name,
                    old = ?record.mount_config.mount_point,
                    new = ?expected,
                    "volume root changed, relocating mountpoint"
                );
                record.mount_config.mount_point = expected;
            }
        }

        info!(volumes = volumes.len(), "volume registry loaded");

        Ok(Self {
            translator,
            store,
            volumes,
        })
    }

    pub fn translator(&self) -> &OptionTranslator {
        &self.translator
    }

    /// Translate options for `name` without touching the registry
    pub fn translate(&self, name: &str, options: &HashMap<String, String>) -> Result<MountConfig> {
        self.translator.translate(name, options)
    }

    /// Check `config` against an existing record of the same name.
    ///
    /// Returns the existing record when the bucket reference matches, `None`
    /// when the name is free.
    pub fn check_existing(&self, name: &str, config: &MountConfig) -> Result<Option<&VolumeRecord>> {
        match self.volumes.get(name) {
            None => Ok(None),
            Some(existing) if existing.bucket() == &config.bucket => Ok(Some(existing)),
            Some(existing) => Err(DriverError::AlreadyConfigured {
                name: name.to_string(),
                existing: existing.bucket().to_string(),
                requested: config.bucket.to_string(),
            }),
        }
    }

    /// Create a volume from Docker options
    pub fn create(&mut self, name: &str, options: &HashMap<String, String>) -> Result<&VolumeRecord> {
        let config = self.translate(name, options)?;
        self.insert(name, config)
    }

    /// Register a translated configuration.
    ///
    /// Re-creating a volume with the same bucket reference is a no-op and
    /// keeps the original configuration.
    pub fn insert(&mut self, name: &str, config: MountConfig) -> Result<&VolumeRecord> {
        if self.check_existing(name, &config)?.is_some() {
            debug!(volume = %name, "volume already exists with the same bucket");
            return self.get(name);
        }

        info!(volume = %name, bucket = %config.bucket, mountpoint = ?config.mount_point, "volume created");
        self.volumes
            .insert(name.to_string(), VolumeRecord::new(name, config));
        self.persist();
        self.get(name)
    }

    /// Forget a detached volume; its directories are left to
    /// [`VolumeRecord::remove_dirs`]
    pub fn remove(&mut self, name: &str) -> Result<VolumeRecord> {
        match self.volumes.get(name) {
            None => return Err(DriverError::NotFound(name.to_string())),
            Some(record) if record.is_attached() => {
                return Err(DriverError::InUse(name.to_string()))
            }
            Some(_) => {}
        }

        let record = self
            .volumes
            .remove(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        info!(volume = %name, "volume removed");
        self.persist();
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Result<&VolumeRecord> {
        self.volumes
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut VolumeRecord> {
        self.volumes
            .get_mut(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<&VolumeRecord> {
        self.volumes.values().collect()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: STATE_VERSION,
            volumes: self.volumes.clone(),
        }
    }

    /// Write the snapshot, propagating failures
    pub fn save(&self) -> Result<()> {
        self.store.save(&self.snapshot())
    }

    /// Write the snapshot; failures leave disk behind memory and are only logged
    pub fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "volume state not persisted, disk snapshot is behind memory");
        }
    }
}

/// Remove a volume directory, refusing to descend into a live mount
fn remove_tree(path: &Path) {
    if is_mountpoint(path) {
        warn!(path = ?path, "directory is still a mountpoint, leaving it in place");
        return;
    }
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(path = ?path, "removed volume directory"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "failed to remove volume directory"),
    }
}
