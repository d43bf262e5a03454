//! Mounter that supervises an external goofys-compatible FUSE program
//!
//! The program is run in the foreground, one process per mounted bucket.
//! A mount is ready once the mountpoint reports a device id different from
//! its parent; it is torn down with `fusermount3 -u` (or `umount`).

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::{is_disconnected, is_mountpoint, MountHandle, Mounter};
use crate::error::{DriverError, Result};
use crate::options::MountConfig;

/// How often to poll for mount readiness
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a mount process gets to exit after its mount is gone
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Command mounter settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandMounterConfig {
    /// Mount program (goofys-compatible command line)
    pub program: PathBuf,
    /// Extra arguments placed before the generated ones
    pub args: Vec<String>,
    /// Program used to unmount FUSE filesystems
    pub unmount_program: PathBuf,
    /// Maximum time to wait for a mount to appear
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Fall back to a lazy unmount when a regular one fails
    pub lazy_unmount: bool,
}

impl Default for CommandMounterConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("goofys"),
            args: Vec::new(),
            unmount_program: PathBuf::from(default_unmount_program()),
            ready_timeout: Duration::from_secs(30),
            lazy_unmount: true,
        }
    }
}

/// Get the unmount command for the current platform
pub fn default_unmount_program() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "fusermount3"
    }
    #[cfg(not(target_os = "linux"))]
    {
        "umount"
    }
}

fn unmount_args(lazy: bool) -> &'static [&'static str] {
    #[cfg(target_os = "linux")]
    {
        if lazy {
            &["-uz"]
        } else {
            &["-u"]
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if lazy {
            &["-f"]
        } else {
            &[]
        }
    }
}

/// A mount process we started
struct ActiveMount {
    child: Child,
    /// Its unmount failed; the mount must be repaired before reuse
    orphaned: bool,
}

impl ActiveMount {
    fn new(child: Child) -> Self {
        Self {
            child,
            orphaned: false,
        }
    }
}

/// Mounter backed by one external process per mount
pub struct CommandMounter {
    config: CommandMounterConfig,
    mounts: Mutex<HashMap<PathBuf, ActiveMount>>,
}

impl CommandMounter {
    pub fn new(config: CommandMounterConfig) -> Self {
        Self {
            config,
            mounts: Mutex::new(HashMap::new()),
        }
    }

    /// Command line for mounting `config`
    pub fn build_args(&self, config: &MountConfig) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.config.args.iter().map(OsString::from).collect();
        let mut push = |arg: String| args.push(arg.into());

        if config.foreground {
            push("-f".to_string());
        }
        for (key, value) in &config.mount_options {
            push("-o".to_string());
            push(if value.is_empty() {
                key.clone()
            } else {
                format!("{}={}", key, value)
            });
        }

        push("--dir-mode".to_string());
        push(format!("0{:o}", config.dir_mode));
        push("--file-mode".to_string());
        push(format!("0{:o}", config.file_mode));
        push("--uid".to_string());
        push(config.uid.to_string());
        push("--gid".to_string());
        push(config.gid.to_string());
        push("--stat-cache-ttl".to_string());
        push(go_duration(config.stat_cache_ttl));
        push("--type-cache-ttl".to_string());
        push(go_duration(config.type_cache_ttl));
        push("--storage-class".to_string());
        push(config.storage_class.clone());

        if let Some(region) = &config.region {
            push("--region".to_string());
            push(region.clone());
        }
        if let Some(endpoint) = &config.endpoint {
            push("--endpoint".to_string());
            push(endpoint.clone());
        }
        if let Some(profile) = &config.profile {
            push("--profile".to_string());
            push(profile.clone());
        }
        if config.use_content_type {
            push("--use-content-type".to_string());
        }
        if config.sse {
            push("--sse".to_string());
        }
        if config.sse_kms {
            push(format!(
                "--sse-kms={}",
                config.kms_key_id.as_deref().unwrap_or_default()
            ));
        }
        if let Some(acl) = &config.acl {
            push("--acl".to_string());
            push(acl.clone());
        }
        if config.cheap {
            push("--cheap".to_string());
        }
        if config.explicit_dir {
            push("--no-implicit-dir".to_string());
        }
        if config.debug_fuse {
            push("--debug_fuse".to_string());
        }
        if config.debug_s3 {
            push("--debug_s3".to_string());
        }
        if let Some(cache_dir) = &config.cache_dir {
            let cache = match &config.cache_free {
                Some(free) => format!("--free:{}:{}", free, cache_dir.display()),
                None => cache_dir.display().to_string(),
            };
            push(format!("--cache={}", cache));
        }

        push(config.bucket.to_string());
        args.push(config.mount_point.clone().into_os_string());
        args
    }

    /// Number of mount processes currently supervised
    pub fn count(&self) -> usize {
        self.mounts.lock().len()
    }

    /// Kill every supervised mount process
    pub fn shutdown(&self) {
        let mut mounts = self.mounts.lock();
        for (path, mut active) in mounts.drain() {
            info!(mountpoint = ?path, "killing mount process");
            if let Err(e) = active.child.start_kill() {
                warn!(mountpoint = ?path, error = %e, "failed to kill mount process");
            }
        }
    }

    async fn wait_ready(&self, child: &mut Child, config: &MountConfig) -> Result<()> {
        let path = &config.mount_point;
        let deadline = Instant::now() + self.config.ready_timeout;

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(DriverError::mount_failed(
                    path,
                    format!(
                        "{:?} exited with {} before the mount was ready",
                        self.config.program, status
                    ),
                ));
            }

            if is_mountpoint(path) {
                return Ok(());
            }

            if Instant::now() >= deadline {
                if let Err(e) = child.kill().await {
                    warn!(mountpoint = ?path, error = %e, "failed to kill unready mount process");
                }
                return Err(DriverError::mount_failed(
                    path,
                    format!("mount not ready after {:?}", self.config.ready_timeout),
                ));
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    async fn run_unmount(&self, path: &Path, lazy: bool) -> Result<()> {
        let output = Command::new(&self.config.unmount_program)
            .args(unmount_args(lazy))
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                DriverError::unmount_failed(
                    path,
                    format!("run {:?}: {}", self.config.unmount_program, e),
                )
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(DriverError::unmount_failed(
            path,
            format!(
                "{:?} exited with {}: {}",
                self.config.unmount_program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }
}

#[async_trait]
impl Mounter for CommandMounter {
    async fn mount(&self, config: &MountConfig) -> Result<MountHandle> {
        let path = &config.mount_point;

        // Readiness is detected by the mountpoint appearing, so it must not
        // be one already
        if is_mountpoint(path) {
            return Err(DriverError::mount_failed(
                path,
                "mountpoint is already mounted, unmount it first",
            ));
        }
        let previous = self.mounts.lock().remove(path);
        if let Some(mut previous) = previous {
            warn!(mountpoint = ?path, pid = ?previous.child.id(), "mount gone, killing its process");
            if let Err(e) = previous.child.kill().await {
                warn!(mountpoint = ?path, error = %e, "failed to kill mount process");
            }
        }

        if let Some(cache_dir) = &config.cache_dir {
            tokio::fs::create_dir_all(cache_dir).await.map_err(|e| {
                DriverError::mount_failed(path, format!("create cache dir {:?}: {}", cache_dir, e))
            })?;
        }

        let args = self.build_args(config);
        debug!(program = ?self.config.program, ?args, "starting mount process");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DriverError::mount_failed(path, format!("spawn {:?}: {}", self.config.program, e))
            })?;

        self.wait_ready(&mut child, config).await?;

        let pid = child.id();
        info!(mountpoint = ?path, bucket = %config.bucket, ?pid, "bucket mounted");

        self.mounts.lock().insert(path.clone(), ActiveMount::new(child));

        Ok(MountHandle::new(path.clone()).with_pid(pid))
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        let tracked = self.mounts.lock().remove(mount_point);

        let mut result = self.run_unmount(mount_point, false).await;
        if let Err(e) = &result {
            if self.config.lazy_unmount {
                warn!(mountpoint = ?mount_point, error = %e, "unmount failed, retrying lazily");
                result = self.run_unmount(mount_point, true).await;
            }
        }

        let Some(mut active) = tracked else {
            return result;
        };

        if result.is_err() {
            // Keep supervising the process, but let the next mount repair it
            active.orphaned = true;
            self.mounts.lock().insert(mount_point.to_path_buf(), active);
            return result;
        }

        match timeout(EXIT_GRACE, active.child.wait()).await {
            Ok(Ok(status)) => debug!(mountpoint = ?mount_point, %status, "mount process exited"),
            Ok(Err(e)) => warn!(mountpoint = ?mount_point, error = %e, "failed to reap mount process"),
            Err(_) => {
                warn!(mountpoint = ?mount_point, "mount process did not exit, killing it");
                if let Err(e) = active.child.kill().await {
                    warn!(mountpoint = ?mount_point, error = %e, "failed to kill mount process");
                }
            }
        }

        info!(mountpoint = ?mount_point, "bucket unmounted");
        Ok(())
    }

    /// Disconnected mounts, live mounts no supervised process owns, and
    /// mounts whose unmount failed
    fn is_stale(&self, mount_point: &Path) -> bool {
        if is_disconnected(mount_point) {
            return true;
        }
        let orphaned = self
            .mounts
            .lock()
            .get(mount_point)
            .map_or(true, |active| active.orphaned);
        orphaned && is_mountpoint(mount_point)
    }
}

impl Drop for CommandMounter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Format a duration the way Go's `time.ParseDuration` accepts it
fn go_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;

    use super::*;
    use crate::options::OptionTranslator;

    fn mount_config(dir: &Path, options: &[(&str, &str)]) -> MountConfig {
        let options: Map<String, String> = options
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OptionTranslator::new(dir).translate("vol1", &options).unwrap()
    }

    fn args_of(mounter: &CommandMounter, config: &MountConfig) -> Vec<String> {
        mounter
            .build_args(config)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_build_args_defaults() {
        let mounter = CommandMounter::new(CommandMounterConfig::default());
        let config = mount_config(Path::new("/mnt"), &[("bucket", "mybucket:logs")]);
        let args = args_of(&mounter, &config);

        assert_eq!(
            args,
            vec![
                "-f",
                "-o",
                "allow_other",
                "--dir-mode",
                "0755",
                "--file-mode",
                "0644",
                "--uid",
                "0",
                "--gid",
                "0",
                "--stat-cache-ttl",
                "60s",
                "--type-cache-ttl",
                "60s",
                "--storage-class",
                "STANDARD",
                "mybucket:logs",
                "/mnt/vol1",
            ]
        );
    }

    #[test]
    fn test_build_args_options() {
        let mounter = CommandMounter::new(CommandMounterConfig {
            args: vec!["--http-timeout".to_string(), "30s".to_string()],
            ..CommandMounterConfig::default()
        });
        let mut config = mount_config(
            Path::new("/mnt"),
            &[
                ("bucket", "b"),
                ("region", "eu-west-1"),
                ("endpoint", "http://minio:9000"),
                ("kms-key-id", "alias/key"),
                ("acl", "private"),
                ("cheap", "true"),
                ("explicit-dir", "true"),
                ("debug-s3", "true"),
                ("type-cache-ttl", "1500ms"),
            ],
        );
        config.cache_dir = Some(PathBuf::from("/cache/vol1"));
        config.cache_free = Some("10G".to_string());

        let args = args_of(&mounter, &config);
        assert_eq!(&args[..2], &["--http-timeout", "30s"]);
        assert!(args.windows(2).any(|w| w == ["--region", "eu-west-1"]));
        assert!(args.windows(2).any(|w| w == ["--endpoint", "http://minio:9000"]));
        assert!(args.windows(2).any(|w| w == ["--acl", "private"]));
        assert!(args.windows(2).any(|w| w == ["--type-cache-ttl", "1500ms"]));
        assert!(args.contains(&"--sse-kms=alias/key".to_string()));
        assert!(args.contains(&"--cheap".to_string()));
        assert!(args.contains(&"--no-implicit-dir".to_string()));
        assert!(args.contains(&"--debug_s3".to_string()));
        assert!(!args.contains(&"--debug_fuse".to_string()));
        assert!(args.contains(&"--cache=--free:10G:/cache/vol1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/mnt/vol1"));
    }

    #[test]
    fn test_go_duration() {
        assert_eq!(go_duration(Duration::from_secs(60)), "60s");
        assert_eq!(go_duration(Duration::from_millis(250)), "250ms");
    }

    #[tokio::test]
    async fn test_mount_fails_when_program_exits() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = CommandMounter::new(CommandMounterConfig {
            program: PathBuf::from("false"),
            ..CommandMounterConfig::default()
        });
        let config = mount_config(dir.path(), &[("bucket", "b")]);

        let err = mounter.mount(&config).await.unwrap_err();
        assert!(matches!(err, DriverError::MountFailed { .. }), "{}", err);
        assert_eq!(mounter.count(), 0);
    }

    #[tokio::test]
    async fn test_mount_fails_when_program_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = CommandMounter::new(CommandMounterConfig {
            program: PathBuf::from("/nonexistent/goofys"),
            ..CommandMounterConfig::default()
        });
        let config = mount_config(dir.path(), &[("bucket", "b")]);

        let err = mounter.mount(&config).await.unwrap_err();
        assert!(err.to_string().contains("spawn"), "{}", err);
    }

    #[tokio::test]
    async fn test_mount_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = CommandMounter::new(CommandMounterConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "sleep 10".to_string()],
            ready_timeout: Duration::from_millis(200),
            ..CommandMounterConfig::default()
        });
        let config = mount_config(dir.path(), &[("bucket", "b")]);
        std::fs::create_dir_all(&config.mount_point).unwrap();

        let err = mounter.mount(&config).await.unwrap_err();
        assert!(err.to_string().contains("not ready"), "{}", err);
    }

    #[tokio::test]
    async fn test_unmount_reports_program_status() {
        let ok = CommandMounter::new(CommandMounterConfig {
            unmount_program: PathBuf::from("true"),
            ..CommandMounterConfig::default()
        });
        ok.unmount(Path::new("/mnt/vol1")).await.unwrap();

        let failing = CommandMounter::new(CommandMounterConfig {
            unmount_program: PathBuf::from("false"),
            ..CommandMounterConfig::default()
        });
        let err = failing.unmount(Path::new("/mnt/vol1")).await.unwrap_err();
        assert!(matches!(err, DriverError::UnmountFailed { .. }));
    }

    #[test]
    fn test_plain_directory_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = CommandMounter::new(CommandMounterConfig::default());
        assert!(!mounter.is_stale(dir.path()));
        assert!(!mounter.is_stale(&dir.path().join("missing")));
    }

    /// A directory that is already a mountpoint on this host
    fn existing_mountpoint() -> Option<PathBuf> {
        ["/dev/shm", "/proc", "/sys"]
            .iter()
            .map(PathBuf::from)
            .find(|p| is_mountpoint(p))
    }

    fn config_at(path: &Path) -> MountConfig {
        let root = path.parent().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        let options = Map::from([("bucket".to_string(), "b".to_string())]);
        OptionTranslator::new(root).translate(name, &options).unwrap()
    }

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_mount_refused_on_existing_mountpoint() {
        let Some(path) = existing_mountpoint() else {
            return;
        };
        let mounter = CommandMounter::new(CommandMounterConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            ..CommandMounterConfig::default()
        });

        let err = mounter.mount(&config_at(&path)).await.unwrap_err();
        assert!(err.to_string().contains("already mounted"), "{}", err);
        assert_eq!(mounter.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_unmount_leaves_mount_stale_and_supervised() {
        let Some(path) = existing_mountpoint() else {
            return;
        };
        let mounter = CommandMounter::new(CommandMounterConfig {
            unmount_program: PathBuf::from("false"),
            ..CommandMounterConfig::default()
        });
        mounter
            .mounts
            .lock()
            .insert(path.clone(), ActiveMount::new(sleeper()));
        assert!(!mounter.is_stale(&path));

        let err = mounter.unmount(&path).await.unwrap_err();
        assert!(matches!(err, DriverError::UnmountFailed { .. }));
        assert!(mounter.is_stale(&path));
        assert_eq!(mounter.count(), 1);

        // Remounting over it is refused and the old process keeps running
        let err = mounter.mount(&config_at(&path)).await.unwrap_err();
        assert!(matches!(err, DriverError::MountFailed { .. }));
        let mut mounts = mounter.mounts.lock();
        let active = mounts.get_mut(&path).unwrap();
        assert!(active.orphaned);
        assert!(active.child.try_wait().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vanished_mount_process_is_killed_before_remount() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = CommandMounter::new(CommandMounterConfig {
            program: PathBuf::from("false"),
            ..CommandMounterConfig::default()
        });
        let config = mount_config(dir.path(), &[("bucket", "b")]);
        mounter
            .mounts
            .lock()
            .insert(config.mount_point.clone(), ActiveMount::new(sleeper()));

        mounter.mount(&config).await.unwrap_err();
        assert_eq!(mounter.count(), 0);
    }
}
