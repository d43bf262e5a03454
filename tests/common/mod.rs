//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use s3_volume_driver::mount::MountCoordinator;
use s3_volume_driver::mounter::{MountHandle, Mounter};
use s3_volume_driver::options::{MountConfig, OptionTranslator};
use s3_volume_driver::provision::BucketProvisioner;
use s3_volume_driver::registry::VolumeRegistry;
use s3_volume_driver::state::JsonStateStore;
use s3_volume_driver::{DriverError, Result};

/// Mounter that records calls instead of mounting anything
#[derive(Default)]
pub struct RecordingMounter {
    started: AtomicUsize,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    mount_failure: Mutex<Option<String>>,
    unmount_failure: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    stale: Mutex<HashSet<PathBuf>>,
    mounted: Mutex<HashSet<PathBuf>>,
}

impl RecordingMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mount calls entered, including ones still blocked on the gate
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Mount calls that completed successfully
    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.mounted.lock().contains(path)
    }

    pub fn fail_mounts(&self, reason: Option<&str>) {
        *self.mount_failure.lock() = reason.map(str::to_string);
    }

    pub fn fail_unmounts(&self, reason: Option<&str>) {
        *self.unmount_failure.lock() = reason.map(str::to_string);
    }

    pub fn mark_stale(&self, path: impl Into<PathBuf>) {
        self.stale.lock().insert(path.into());
    }

    /// Hold every mount call until the returned semaphore gets permits
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Wait until `n` mount calls have entered the mounter
    pub async fn wait_started(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("mount call never started");
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn mount(&self, config: &MountConfig) -> Result<MountHandle> {
        self.started.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| DriverError::mount_failed(&config.mount_point, e))?;
            permit.forget();
        }

        if let Some(reason) = self.mount_failure.lock().clone() {
            return Err(DriverError::mount_failed(&config.mount_point, reason));
        }

        self.mounts.fetch_add(1, Ordering::SeqCst);
        self.mounted.lock().insert(config.mount_point.clone());
        Ok(MountHandle::new(config.mount_point.clone()))
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);

        // A mount whose unmount failed is left for the next mount to repair
        if let Some(reason) = self.unmount_failure.lock().clone() {
            self.stale.lock().insert(mount_point.to_path_buf());
            return Err(DriverError::unmount_failed(mount_point, reason));
        }

        self.stale.lock().remove(mount_point);
        self.mounted.lock().remove(mount_point);
        Ok(())
    }

    fn is_stale(&self, mount_point: &Path) -> bool {
        self.stale.lock().contains(mount_point)
    }
}

/// Provisioner that records requested buckets
#[derive(Default)]
pub struct RecordingProvisioner {
    pub buckets: Mutex<Vec<String>>,
    pub failure: Mutex<Option<String>>,
}

#[async_trait]
impl BucketProvisioner for RecordingProvisioner {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(DriverError::Provisioning(reason));
        }
        self.buckets.lock().push(bucket.to_string());
        Ok(())
    }
}

pub fn translator(dir: &Path) -> OptionTranslator {
    OptionTranslator::new(dir.join("volumes"))
}

pub fn open_registry(dir: &Path, translator: OptionTranslator) -> VolumeRegistry {
    VolumeRegistry::open(
        translator,
        Box::new(JsonStateStore::new(dir.join("state.json"))),
    )
    .unwrap()
}

pub fn coordinator(dir: &Path, mounter: Arc<RecordingMounter>) -> MountCoordinator {
    MountCoordinator::new(open_registry(dir, translator(dir)), mounter)
}

pub fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
