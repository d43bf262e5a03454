//! s3-volume-driver daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use s3_volume_driver::config::Config;
use s3_volume_driver::mount::MountCoordinator;
use s3_volume_driver::mounter::CommandMounter;
use s3_volume_driver::plugin::{PluginHandlers, PluginServer};
use s3_volume_driver::provision::{BucketProvisioner, S3BucketProvisioner};
use s3_volume_driver::registry::VolumeRegistry;
use s3_volume_driver::state::JsonStateStore;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: s3-volume-driver [config.yaml]");
    eprintln!();
    eprintln!("s3-volume-driver - Docker volume plugin for S3-compatible buckets");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file (default: read the environment)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  AWS_REGION, AWS_ENDPOINT, AWS_NAMESPACE, CACHE_DIR, CACHE_FREE, DEBUG,");
    eprintln!("  PLUGIN_SOCKET, VOLUME_ROOT, STATE_FILE, GOOFYS_BIN");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let config = match args.as_slice() {
        [_] => Config::from_env(),
        [_, flag] if flag == "-h" || flag == "--help" => {
            print_usage();
            return Ok(());
        }
        [_, path] => Config::from_file(&PathBuf::from(path)),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("s3-volume-driver starting");

    std::fs::create_dir_all(&config.storage.root)?;
    if let Some(parent) = config.storage.state_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let registry = match VolumeRegistry::open(
        config.translator(),
        Box::new(JsonStateStore::new(&config.storage.state_file)),
    ) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "failed to load volume state, refusing to start");
            std::process::exit(1);
        }
    };

    let provisioner: Option<Arc<dyn BucketProvisioner>> = match config.provisioner() {
        Some(provisioner_config) => Some(Arc::new(S3BucketProvisioner::new(provisioner_config).await?)),
        None => None,
    };

    let mounter = Arc::new(CommandMounter::new(config.mounter.clone()));
    let coordinator = MountCoordinator::with_provisioner(registry, mounter.clone(), provisioner);

    // Set up signal handling for graceful shutdown
    let shutdown = Arc::new(Notify::new());
    let s = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        s.notify_one();
    })?;

    let handlers = PluginHandlers::new(coordinator.clone(), config.plugin.scope);
    let server = PluginServer::bind(&config.plugin.socket, handlers)?;
    server.serve(shutdown).await?;

    info!("Shutting down");
    coordinator.unmount_all().await;
    mounter.shutdown();
    info!("All volumes unmounted, exiting");

    Ok(())
}
