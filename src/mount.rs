//! Refcounted mount lifecycle
//!
//! [`MountCoordinator`] multiplexes any number of container attachments onto
//! one physical mount per volume. All registry access happens under a single
//! lock; the mounter is only ever called with that lock released, while a
//! per-volume slot marks the transition as in flight.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use scopeguard::ScopeGuard;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{DriverError, Result};
use crate::mounter::{MountHandle, Mounter};
use crate::options::{BucketRef, MountConfig};
use crate::provision::BucketProvisioner;
use crate::registry::{VolumeRecord, VolumeRegistry};

/// Observable lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Detached,
    Mounting,
    Attached,
    Unmounting,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VolumeState::Detached => "detached",
            VolumeState::Mounting => "mounting",
            VolumeState::Attached => "attached",
            VolumeState::Unmounting => "unmounting",
        })
    }
}

/// Point-in-time view of a volume, as reported by `Get` and `List`
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    pub name: String,
    pub mount_point: PathBuf,
    pub bucket: BucketRef,
    pub connections: u32,
    pub state: VolumeState,
    pub created_at: DateTime<Utc>,
}

impl VolumeInfo {
    fn new(record: &VolumeRecord, slot: Option<&Slot>) -> Self {
        let state = slot.map_or(VolumeState::Detached, Slot::state);
        Self {
            name: record.name.clone(),
            mount_point: record.mount_point().to_path_buf(),
            bucket: record.bucket().clone(),
            connections: record.connection_count,
            state,
            created_at: record.created_at,
        }
    }
}

/// Outcome of a physical transition, broadcast to waiters
#[derive(Debug, Clone)]
enum Settled {
    Pending,
    Done,
    Failed(Arc<DriverError>),
}

/// Per-volume physical state; no slot means detached
enum Slot {
    Mounting(watch::Receiver<Settled>),
    Attached(MountHandle),
    Unmounting(watch::Receiver<Settled>),
}

impl Slot {
    fn state(&self) -> VolumeState {
        match self {
            Slot::Mounting(_) => VolumeState::Mounting,
            Slot::Attached(_) => VolumeState::Attached,
            Slot::Unmounting(_) => VolumeState::Unmounting,
        }
    }
}

struct State {
    registry: VolumeRegistry,
    slots: HashMap<String, Slot>,
}

impl State {
    fn info(&self, name: &str) -> Result<VolumeInfo> {
        let record = self.registry.get(name)?;
        Ok(VolumeInfo::new(record, self.slots.get(name)))
    }
}

enum MountStep {
    /// Already attached; the count was incremented
    Ready(PathBuf),
    /// Another caller's transition must settle first
    Wait {
        rx: watch::Receiver<Settled>,
        after_mount: bool,
    },
    /// This caller performs the 0 -> 1 transition
    Start {
        config: MountConfig,
        tx: watch::Sender<Settled>,
    },
}

enum UnmountStep {
    Done,
    Start {
        mount_point: PathBuf,
        tx: watch::Sender<Settled>,
    },
}

struct Inner {
    state: Mutex<State>,
    mounter: Arc<dyn Mounter>,
    provisioner: Option<Arc<dyn BucketProvisioner>>,
}

/// Refcounting state machine over the volume registry
#[derive(Clone)]
pub struct MountCoordinator {
    inner: Arc<Inner>,
}

impl MountCoordinator {
    pub fn new(registry: VolumeRegistry, mounter: Arc<dyn Mounter>) -> Self {
        Self::with_provisioner(registry, mounter, None)
    }

    /// Coordinator that creates namespace buckets on `create`
    pub fn with_provisioner(
        registry: VolumeRegistry,
        mounter: Arc<dyn Mounter>,
        provisioner: Option<Arc<dyn BucketProvisioner>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    registry,
                    slots: HashMap::new(),
                }),
                mounter,
                provisioner,
            }),
        }
    }

    /// Register a volume, provisioning its bucket when it was derived from
    /// the namespace
    #[instrument(skip(self, options))]
    pub async fn create(&self, name: &str, options: &HashMap<String, String>) -> Result<VolumeInfo> {
        let config = {
            let state = self.inner.state.lock();
            let config = state.registry.translate(name, options)?;
            if state.registry.check_existing(name, &config)?.is_some() {
                debug!("volume already exists");
                return state.info(name);
            }
            config
        };

        if config.namespaced {
            if let Some(provisioner) = &self.inner.provisioner {
                provisioner.ensure_bucket(&config.bucket.name).await?;
            }
        }

        let mut state = self.inner.state.lock();
        state.registry.insert(name, config)?;
        state.info(name)
    }

    /// Delete a detached volume and clean up its directories
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<()> {
        let record = {
            let mut state = self.inner.state.lock();
            if state.slots.contains_key(name) {
                return Err(DriverError::InUse(name.to_string()));
            }
            state.registry.remove(name)?
        };

        if let Err(e) = tokio::task::spawn_blocking(move || record.remove_dirs()).await {
            warn!(error = %e, "volume directory cleanup did not finish");
        }
        Ok(())
    }

    /// Mountpoint of an existing volume, whether mounted or not
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let state = self.inner.state.lock();
        Ok(state.registry.get(name)?.mount_point().to_path_buf())
    }

    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        self.inner.state.lock().info(name)
    }

    pub fn list(&self) -> Vec<VolumeInfo> {
        let state = self.inner.state.lock();
        state
            .registry
            .list()
            .into_iter()
            .map(|record| VolumeInfo::new(record, state.slots.get(&record.name)))
            .collect()
    }

    pub fn connection_count(&self, name: &str) -> Result<u32> {
        let state = self.inner.state.lock();
        Ok(state.registry.get(name)?.connection_count)
    }

    /// Attach one container to the volume, mounting it on the first attachment
    #[instrument(skip(self))]
    pub async fn mount(&self, name: &str) -> Result<PathBuf> {
        loop {
            match self.inner.begin_mount(name)? {
                MountStep::Ready(path) => return Ok(path),
                MountStep::Wait { rx, after_mount } => {
                    debug!("waiting for in-flight transition");
                    let outcome = settled(rx).await;
                    if let (true, Settled::Failed(e)) = (after_mount, outcome) {
                        return Err(e.duplicate());
                    }
                }
                MountStep::Start { config, tx } => {
                    info!(bucket = %config.bucket, mountpoint = ?config.mount_point, "mounting volume");
                    let task = self.inner.spawn_mount(name.to_string(), config, tx);
                    return task
                        .await
                        .map_err(|e| DriverError::Internal(format!("mount task failed: {}", e)))?;
                }
            }
        }
    }

    /// Detach one container, unmounting after the last one leaves
    #[instrument(skip(self))]
    pub async fn unmount(&self, name: &str) -> Result<()> {
        match self.inner.begin_unmount(name)? {
            UnmountStep::Done => Ok(()),
            UnmountStep::Start { mount_point, tx } => {
                info!(mountpoint = ?mount_point, "unmounting volume");
                let task = self.inner.spawn_unmount(name.to_string(), mount_point, tx);
                task.await
                    .map_err(|e| DriverError::Internal(format!("unmount task failed: {}", e)))?
            }
        }
    }

    /// Tear down every attached volume, dropping all connections
    pub async fn unmount_all(&self) {
        let attached: Vec<(String, PathBuf, watch::Sender<Settled>)> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut attached = Vec::new();
            for (name, slot) in state.slots.iter_mut() {
                let Slot::Attached(handle) = &*slot else {
                    continue;
                };
                let mount_point = handle.mount_point().to_path_buf();
                if let Ok(record) = state.registry.get_mut(name) {
                    record.connection_count = 0;
                }
                let (tx, rx) = watch::channel(Settled::Pending);
                *slot = Slot::Unmounting(rx);
                attached.push((name.clone(), mount_point, tx));
            }
            if !attached.is_empty() {
                state.registry.persist();
            }
            attached
        };

        info!(volumes = attached.len(), "unmounting all volumes");

        let tasks = attached.into_iter().map(|(name, mount_point, tx)| {
            let task = self.inner.spawn_unmount(name.clone(), mount_point, tx);
            async move { (name, task.await) }
        });

        for (name, result) in join_all(tasks).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(volume = %name, error = %e, "failed to unmount volume on shutdown"),
                Err(e) => error!(volume = %name, error = %e, "unmount task failed on shutdown"),
            }
        }
    }
}

impl Inner {
    fn begin_mount(&self, name: &str) -> Result<MountStep> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let record = state.registry.get_mut(name)?;

        match state.slots.get(name) {
            Some(Slot::Attached(_)) => {
                record.connection_count += 1;
                let connections = record.connection_count;
                let path = record.mount_point().to_path_buf();
                debug!(volume = %name, connections, "volume already mounted");
                state.registry.persist();
                Ok(MountStep::Ready(path))
            }
            Some(Slot::Mounting(rx)) => Ok(MountStep::Wait {
                rx: rx.clone(),
                after_mount: true,
            }),
            Some(Slot::Unmounting(rx)) => Ok(MountStep::Wait {
                rx: rx.clone(),
                after_mount: false,
            }),
            None => {
                let config = record.mount_config.clone();
                let (tx, rx) = watch::channel(Settled::Pending);
                state.slots.insert(name.to_string(), Slot::Mounting(rx));
                Ok(MountStep::Start { config, tx })
            }
        }
    }

    fn begin_unmount(&self, name: &str) -> Result<UnmountStep> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let record = state.registry.get_mut(name)?;
        let mount_point = match state.slots.get(name) {
            Some(Slot::Attached(handle)) => handle.mount_point().to_path_buf(),
            Some(_) => {
                debug!(volume = %name, "volume is in transition, ignoring unmount");
                return Ok(UnmountStep::Done);
            }
            None => {
                debug!(volume = %name, "volume is not mounted, ignoring unmount");
                return Ok(UnmountStep::Done);
            }
        };

        record.connection_count = record.connection_count.saturating_sub(1);
        let connections = record.connection_count;
        if connections > 0 {
            debug!(volume = %name, connections, "volume still in use");
            state.registry.persist();
            return Ok(UnmountStep::Done);
        }

        let (tx, rx) = watch::channel(Settled::Pending);
        state.slots.insert(name.to_string(), Slot::Unmounting(rx));
        state.registry.persist();
        Ok(UnmountStep::Start { mount_point, tx })
    }

    /// Run the physical mount on its own task so an abandoned request cannot
    /// leave the volume stuck in `Mounting`
    fn spawn_mount(
        self: &Arc<Self>,
        name: String,
        config: MountConfig,
        tx: watch::Sender<Settled>,
    ) -> JoinHandle<Result<PathBuf>> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let guard = scopeguard::guard((Arc::clone(&inner), name), |(inner, name)| {
                warn!(volume = %name, "mount task aborted, volume left detached");
                inner.state.lock().slots.remove(&name);
            });

            let result = inner.attach(&config).await;
            let (_, name) = ScopeGuard::into_inner(guard);

            let outcome = match &result {
                Ok(_) => Settled::Done,
                Err(e) => Settled::Failed(Arc::new(e.duplicate())),
            };
            inner.finish_mount(&name, &result);
            tx.send_replace(outcome);

            result.map(|handle| handle.mount_point().to_path_buf())
        })
    }

    fn spawn_unmount(
        self: &Arc<Self>,
        name: String,
        mount_point: PathBuf,
        tx: watch::Sender<Settled>,
    ) -> JoinHandle<Result<()>> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let guard = scopeguard::guard((Arc::clone(&inner), name), |(inner, name)| {
                warn!(volume = %name, "unmount task aborted, volume left detached");
                inner.state.lock().slots.remove(&name);
            });

            let result = inner.mounter.unmount(&mount_point).await;
            let (_, name) = ScopeGuard::into_inner(guard);

            inner.state.lock().slots.remove(&name);
            let outcome = match &result {
                Ok(()) => {
                    info!(volume = %name, "volume unmounted");
                    Settled::Done
                }
                Err(e) => {
                    error!(volume = %name, error = %e, "unmount failed, volume marked detached");
                    Settled::Failed(Arc::new(e.duplicate()))
                }
            };
            tx.send_replace(outcome);

            result
        })
    }

    /// Prepare the mountpoint, repairing a stale mount first, then mount
    async fn attach(&self, config: &MountConfig) -> Result<MountHandle> {
        let path = &config.mount_point;

        if self.mounter.is_stale(path) {
            warn!(mountpoint = ?path, "repairing stale mount left by a previous run");
            self.mounter.unmount(path).await?;
        }

        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(DriverError::InvalidMountPoint(path.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(mountpoint = ?path, "creating mountpoint");
                tokio::fs::create_dir_all(path).await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.mounter.mount(config).await
    }

    fn finish_mount(&self, name: &str, result: &Result<MountHandle>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match (result, state.registry.get_mut(name)) {
            (Ok(handle), Ok(record)) => {
                record.connection_count = 1;
                state
                    .slots
                    .insert(name.to_string(), Slot::Attached(handle.clone()));
                state.registry.persist();
                info!(volume = %name, pid = ?handle.pid(), "volume mounted");
            }
            (Ok(_), Err(_)) => {
                warn!(volume = %name, "volume vanished while mounting");
                state.slots.remove(name);
            }
            (Err(e), _) => {
                error!(volume = %name, error = %e, "mount failed, volume stays detached");
                state.slots.remove(name);
            }
        }
    }
}

async fn settled(mut rx: watch::Receiver<Settled>) -> Settled {
    match rx.wait_for(|s| !matches!(s, Settled::Pending)).await {
        Ok(outcome) => (*outcome).clone(),
        Err(_) => Settled::Failed(Arc::new(DriverError::Internal(
            "transition abandoned".to_string(),
        ))),
    }
}
