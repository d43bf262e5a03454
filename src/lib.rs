//! s3-volume-driver: a Docker volume plugin exposing object-storage buckets
//! as local volumes
//!
//! # Architecture
//!
//! - **Options**: translate the untyped `-o key=value` options of a volume
//!   into a typed `MountConfig`.
//! - **Registry**: the authoritative name → volume map, persisted as a JSON
//!   snapshot after every mutation.
//! - **Mount Coordinator**: refcounts container attachments so that any
//!   number of containers share one physical mount, and repairs stale mounts
//!   left by a crashed process.
//! - **Mounter**: performs the physical mount through an external
//!   goofys-compatible FUSE program.
//! - **Plugin**: the Docker volume plugin protocol over a unix socket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use s3_volume_driver::config::Config;
//! use s3_volume_driver::mount::MountCoordinator;
//! use s3_volume_driver::mounter::CommandMounter;
//! use s3_volume_driver::registry::VolumeRegistry;
//! use s3_volume_driver::state::JsonStateStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("config.yaml".as_ref())?;
//!
//! let registry = VolumeRegistry::open(
//!     config.translator(),
//!     Box::new(JsonStateStore::new(&config.storage.state_file)),
//! )?;
//! let mounter = Arc::new(CommandMounter::new(config.mounter.clone()));
//! let coordinator = MountCoordinator::new(registry, mounter);
//!
//! let path = coordinator.mount("vol1").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod mount;
pub mod mounter;
pub mod options;
pub mod plugin;
pub mod provision;
pub mod registry;
pub mod state;

pub use error::{DriverError, Result};
