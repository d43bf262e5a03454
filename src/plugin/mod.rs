//! Docker volume plugin front end
//!
//! [`PluginHandlers`] map each protocol call onto the [`MountCoordinator`];
//! [`server`] exposes them over HTTP on a unix socket.

pub mod protocol;
pub mod server;

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use serde_json::Value;
use tracing::info;

use crate::config::Scope;
use crate::error::Result;
use crate::mount::{MountCoordinator, VolumeInfo};
use protocol::{
    ActivateResponse, CapabilitiesResponse, Capability, CreateRequest, ErrResponse, GetResponse,
    ListResponse, MountRequest, MountResponse, NameRequest, Volume,
};

pub use server::PluginServer;

/// Protocol handlers over a shared coordinator
#[derive(Clone)]
pub struct PluginHandlers {
    coordinator: MountCoordinator,
    scope: Scope,
}

impl PluginHandlers {
    pub fn new(coordinator: MountCoordinator, scope: Scope) -> Self {
        Self { coordinator, scope }
    }

    pub fn coordinator(&self) -> &MountCoordinator {
        &self.coordinator
    }

    pub fn activate(&self) -> ActivateResponse {
        ActivateResponse {
            implements: vec!["VolumeDriver".to_string()],
        }
    }

    pub async fn create(&self, req: CreateRequest) -> Result<ErrResponse> {
        let options = req.opts.unwrap_or_default();
        self.coordinator.create(&req.name, &options).await?;
        Ok(ErrResponse::default())
    }

    pub async fn remove(&self, req: NameRequest) -> Result<ErrResponse> {
        self.coordinator.remove(&req.name).await?;
        Ok(ErrResponse::default())
    }

    pub async fn mount(&self, req: MountRequest) -> Result<MountResponse> {
        info!(volume = %req.name, id = %req.id, "mount requested");
        let path = self.coordinator.mount(&req.name).await?;
        Ok(MountResponse {
            mountpoint: path.to_string_lossy().into_owned(),
            err: String::new(),
        })
    }

    pub fn path(&self, req: NameRequest) -> Result<MountResponse> {
        let path = self.coordinator.path(&req.name)?;
        Ok(MountResponse {
            mountpoint: path.to_string_lossy().into_owned(),
            err: String::new(),
        })
    }

    pub async fn unmount(&self, req: MountRequest) -> Result<ErrResponse> {
        info!(volume = %req.name, id = %req.id, "unmount requested");
        self.coordinator.unmount(&req.name).await?;
        Ok(ErrResponse::default())
    }

    pub fn get(&self, req: NameRequest) -> Result<GetResponse> {
        let info = self.coordinator.get(&req.name)?;
        Ok(GetResponse {
            volume: Some(to_volume(info)),
            err: String::new(),
        })
    }

    pub fn list(&self) -> Result<ListResponse> {
        Ok(ListResponse {
            volumes: self.coordinator.list().into_iter().map(to_volume).collect(),
            err: String::new(),
        })
    }

    pub fn capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse {
            capabilities: Capability {
                scope: self.scope.as_str().to_string(),
            },
        }
    }
}

fn to_volume(info: VolumeInfo) -> Volume {
    let status = BTreeMap::from([
        ("bucket".to_string(), Value::from(info.bucket.to_string())),
        ("connections".to_string(), Value::from(info.connections)),
        ("state".to_string(), Value::from(info.state.to_string())),
    ]);
    Volume {
        name: info.name,
        mountpoint: info.mount_point.to_string_lossy().into_owned(),
        created_at: info.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        status,
    }
}
