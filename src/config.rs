//! Driver configuration
//!
//! The YAML file is deserialized into [`RawConfig`] and resolved into a
//! validated [`Config`]. Without a file, [`Config::from_env`] builds the same
//! structure from the plugin environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::substitute_env_vars;
use crate::mounter::CommandMounterConfig;
use crate::options::{
    parse_bool, parse_mode, MalformedPolicy, MountDefaults, OptionTranslator, DEFAULT_CACHE_TTL,
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, DEFAULT_STORAGE_CLASS,
};
use crate::provision::S3ProvisionerConfig;

/// Default plugin socket, discovered by Docker from its plugin directory
pub const DEFAULT_SOCKET: &str = "/run/docker/plugins/s3-volume.sock";
/// Default volume root
pub const DEFAULT_ROOT: &str = "/var/lib/s3-volume/volumes";
/// Default state file
pub const DEFAULT_STATE_FILE: &str = "/var/lib/s3-volume/state.json";

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub logging: LoggingConfig,
    pub plugin: RawPluginConfig,
    pub storage: RawStorageConfig,
    pub defaults: RawDefaultsConfig,
    pub options: OptionsConfig,
    pub mounter: CommandMounterConfig,
    pub provisioning: RawProvisioningConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawPluginConfig {
    pub socket: PathBuf,
    /// Capabilities scope reported to Docker (local or global)
    pub scope: String,
}

impl Default for RawPluginConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET),
            scope: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawStorageConfig {
    /// Directory holding one mountpoint per volume
    pub root: PathBuf,
    pub state_file: PathBuf,
    /// Enables the local caching overlay
    pub cache_dir: Option<PathBuf>,
    /// Free-space threshold kept by the cache (e.g. `10G` or `5%`)
    pub cache_free: Option<String>,
}

impl Default for RawStorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            cache_dir: None,
            cache_free: None,
        }
    }
}

/// Driver-level defaults under per-volume options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawDefaultsConfig {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub profile: Option<String>,
    pub uid: u32,
    pub gid: u32,
    /// Octal, as a string (`"0755"`)
    pub dir_mode: String,
    pub file_mode: String,
    #[serde(with = "humantime_serde")]
    pub stat_cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub type_cache_ttl: Duration,
    pub storage_class: String,
}

impl Default for RawDefaultsConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint: None,
            profile: None,
            uid: 0,
            gid: 0,
            dir_mode: format!("0{:o}", DEFAULT_DIR_MODE),
            file_mode: format!("0{:o}", DEFAULT_FILE_MODE),
            stat_cache_ttl: DEFAULT_CACHE_TTL,
            type_cache_ttl: DEFAULT_CACHE_TTL,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawProvisioningConfig {
    /// Volumes without a bucket option map to `<namespace><volume>`
    pub namespace: Option<String>,
    /// Create namespace buckets on `Create`
    pub create_buckets: bool,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub plugin: PluginConfig,
    pub storage: StorageConfig,
    pub defaults: MountDefaults,
    pub options: OptionsConfig,
    pub mounter: CommandMounterConfig,
    pub provisioning: ProvisioningConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Volume scope reported through `Capabilities`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Local,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Global => "global",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub socket: PathBuf,
    pub scope: Scope,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub state_file: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub cache_free: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    /// Handling of recognized volume options with unparsable values
    pub malformed: MalformedPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisioningConfig {
    pub namespace: Option<String>,
    pub create_buckets: bool,
}

// =============================================================================
// Resolution Logic
// =============================================================================

/// Empty strings come from `${VAR:-}` substitutions and mean "unset"
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RawConfig {
    /// Resolve raw config into final config
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            plugin,
            storage,
            defaults,
            options,
            mounter,
            provisioning,
        } = self;

        let scope = match plugin.scope.trim().to_ascii_lowercase().as_str() {
            "local" => Scope::Local,
            "global" => Scope::Global,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "plugin.scope must be local or global, got {:?}",
                    other
                )))
            }
        };

        let dir_mode = parse_mode(defaults.dir_mode.trim()).map_err(|e| {
            ConfigError::ValidationError(format!("defaults.dir_mode {:?}: {}", defaults.dir_mode, e))
        })?;
        let file_mode = parse_mode(defaults.file_mode.trim()).map_err(|e| {
            ConfigError::ValidationError(format!(
                "defaults.file_mode {:?}: {}",
                defaults.file_mode, e
            ))
        })?;

        Ok(Config {
            logging,
            plugin: PluginConfig {
                socket: plugin.socket,
                scope,
            },
            storage: StorageConfig {
                root: storage.root,
                state_file: storage.state_file,
                cache_dir: storage.cache_dir.filter(|p| !p.as_os_str().is_empty()),
                cache_free: non_empty(storage.cache_free),
            },
            defaults: MountDefaults {
                dir_mode,
                file_mode,
                uid: defaults.uid,
                gid: defaults.gid,
                stat_cache_ttl: defaults.stat_cache_ttl,
                type_cache_ttl: defaults.type_cache_ttl,
                storage_class: defaults.storage_class,
                region: non_empty(defaults.region),
                endpoint: non_empty(defaults.endpoint),
                profile: non_empty(defaults.profile),
            },
            options,
            mounter,
            provisioning: ProvisioningConfig {
                namespace: non_empty(provisioning.namespace),
                create_buckets: provisioning.create_buckets,
            },
        })
    }

    /// Overlay the plugin environment variables onto this config
    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| non_empty(lookup(name));

        if let Some(region) = var("AWS_REGION") {
            self.defaults.region = Some(region);
        }
        if let Some(endpoint) = var("AWS_ENDPOINT") {
            self.defaults.endpoint = Some(endpoint);
        }
        if let Some(namespace) = var("AWS_NAMESPACE") {
            self.provisioning.namespace = Some(namespace);
            self.provisioning.create_buckets = true;
        }
        if let Some(free) = var("CACHE_FREE") {
            self.storage.cache_free = Some(free);
        }
        if let Some(dir) = var("CACHE_DIR") {
            self.storage.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(debug) = var("DEBUG") {
            if parse_bool(&debug).unwrap_or(true) {
                self.logging.level = "debug".to_string();
            }
        }
        if let Some(socket) = var("PLUGIN_SOCKET") {
            self.plugin.socket = PathBuf::from(socket);
        }
        if let Some(root) = var("VOLUME_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(state_file) = var("STATE_FILE") {
            self.storage.state_file = PathBuf::from(state_file);
        }
        if let Some(program) = var("GOOFYS_BIN") {
            self.mounter.program = PathBuf::from(program);
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, substituting `${VAR}` references
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&substitute_env_vars(&content)?)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        // An empty document is a valid, all-defaults config
        if content.trim().is_empty() {
            return RawConfig::default().resolve();
        }
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Build configuration from the plugin environment alone
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from defaults plus variables provided by `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw = RawConfig::default();
        raw.apply_env(lookup);
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.root cannot be empty".to_string(),
            ));
        }
        if self.storage.state_file.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.state_file cannot be empty".to_string(),
            ));
        }
        if self.storage.state_file.starts_with(&self.storage.root) {
            return Err(ConfigError::ValidationError(format!(
                "storage.state_file {:?} must not be inside the volume root {:?}",
                self.storage.state_file, self.storage.root
            )));
        }
        if let Some(cache_dir) = &self.storage.cache_dir {
            if cache_dir.starts_with(&self.storage.root) {
                return Err(ConfigError::ValidationError(format!(
                    "storage.cache_dir {:?} must not be inside the volume root {:?}",
                    cache_dir, self.storage.root
                )));
            }
        }
        if self.plugin.socket.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "plugin.socket cannot be empty".to_string(),
            ));
        }
        if self.mounter.program.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "mounter.program cannot be empty".to_string(),
            ));
        }
        if self.mounter.ready_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "mounter.ready_timeout must be positive".to_string(),
            ));
        }
        if self.provisioning.create_buckets && self.provisioning.namespace.is_none() {
            return Err(ConfigError::ValidationError(
                "provisioning.create_buckets requires provisioning.namespace".to_string(),
            ));
        }

        Ok(())
    }

    /// Option translator carrying the driver-level defaults
    pub fn translator(&self) -> OptionTranslator {
        OptionTranslator::new(&self.storage.root)
            .with_defaults(self.defaults.clone())
            .with_namespace(self.provisioning.namespace.clone())
            .with_cache(
                self.storage.cache_dir.clone(),
                self.storage.cache_free.clone(),
            )
            .with_policy(self.options.malformed)
    }

    /// Bucket provisioner settings, when provisioning is enabled
    pub fn provisioner(&self) -> Option<S3ProvisionerConfig> {
        self.provisioning.create_buckets.then(|| S3ProvisionerConfig {
            region: self.defaults.region.clone(),
            endpoint: self.defaults.endpoint.clone(),
            profile: self.defaults.profile.clone(),
        })
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.plugin.socket, PathBuf::from(DEFAULT_SOCKET));
        assert_eq!(config.plugin.scope, Scope::Local);
        assert_eq!(config.storage.root, PathBuf::from(DEFAULT_ROOT));
        assert_eq!(config.storage.cache_dir, None);
        assert_eq!(config.defaults, MountDefaults::default());
        assert_eq!(config.options.malformed, MalformedPolicy::Reject);
        assert_eq!(config.mounter.program, PathBuf::from("goofys"));
        assert_eq!(config.mounter.ready_timeout, Duration::from_secs(30));
        assert!(config.mounter.lazy_unmount);
        assert!(!config.provisioning.create_buckets);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug
plugin:
  socket: /run/docker/plugins/test.sock
  scope: global
storage:
  root: /srv/volumes
  state_file: /srv/state/state.json
  cache_dir: /srv/cache
  cache_free: 10%
defaults:
  region: eu-west-1
  endpoint: ""
  uid: 1000
  gid: 1000
  dir_mode: "0700"
  file_mode: "0600"
  stat_cache_ttl: 5m
  type_cache_ttl: 30s
  storage_class: STANDARD_IA
options:
  malformed: default
mounter:
  program: /usr/local/bin/goofys
  args: ["--http-timeout", "10s"]
  unmount_program: /bin/fusermount
  ready_timeout: 1m
  lazy_unmount: false
provisioning:
  namespace: goofys_
  create_buckets: true
"#;

        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.plugin.scope, Scope::Global);
        assert_eq!(config.storage.cache_dir, Some(PathBuf::from("/srv/cache")));
        assert_eq!(config.storage.cache_free.as_deref(), Some("10%"));
        assert_eq!(config.defaults.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.defaults.endpoint, None);
        assert_eq!(config.defaults.uid, 1000);
        assert_eq!(config.defaults.dir_mode, 0o700);
        assert_eq!(config.defaults.file_mode, 0o600);
        assert_eq!(config.defaults.stat_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.defaults.storage_class, "STANDARD_IA");
        assert_eq!(config.options.malformed, MalformedPolicy::Default);
        assert_eq!(config.mounter.args, vec!["--http-timeout", "10s"]);
        assert_eq!(config.mounter.ready_timeout, Duration::from_secs(60));
        assert!(!config.mounter.lazy_unmount);
        assert_eq!(config.provisioning.namespace.as_deref(), Some("goofys_"));
        config.validate().unwrap();

        let provisioner = config.provisioner().unwrap();
        assert_eq!(provisioner.region.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn test_translator_carries_defaults() {
        let yaml = r#"
storage:
  root: /srv/volumes
  state_file: /srv/state.json
  cache_dir: /srv/cache
defaults:
  uid: 33
provisioning:
  namespace: ns_
"#;
        let config = Config::from_str(yaml).unwrap();
        let mount = config
            .translator()
            .translate("vol1", &HashMap::new())
            .unwrap();

        assert_eq!(mount.bucket.name, "ns_vol1");
        assert_eq!(mount.mount_point, PathBuf::from("/srv/volumes/vol1"));
        assert_eq!(mount.uid, 33);
        assert_eq!(mount.cache_dir, Some(PathBuf::from("/srv/cache/vol1")));
        assert!(config.provisioner().is_none());
    }

    #[test]
    fn test_invalid_scope_and_mode() {
        let err = Config::from_str("plugin:\n  scope: cluster\n").unwrap_err();
        assert!(err.to_string().contains("plugin.scope"), "{}", err);

        let err = Config::from_str("defaults:\n  dir_mode: \"rwx\"\n").unwrap_err();
        assert!(err.to_string().contains("dir_mode"), "{}", err);
    }

    #[test]
    fn test_unknown_policy_is_parse_error() {
        let result = Config::from_str("options:\n  malformed: ignore\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_state_file_inside_root() {
        let yaml = r#"
storage:
  root: /srv/volumes
  state_file: /srv/volumes/state.json
"#;
        let config = Config::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("state_file"), "{}", err);
    }

    #[test]
    fn test_validate_create_buckets_needs_namespace() {
        let config = Config::from_str("provisioning:\n  create_buckets: true\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_environment() {
        let config = Config::from_lookup(lookup(&[
            ("AWS_REGION", "us-west-2"),
            ("AWS_ENDPOINT", "http://minio:9000"),
            ("AWS_NAMESPACE", "goofys_"),
            ("CACHE_FREE", "1G"),
            ("CACHE_DIR", "/var/lib/driver/cache"),
            ("DEBUG", "1"),
            ("PLUGIN_SOCKET", "/run/docker/plugins/goofys.sock"),
            ("VOLUME_ROOT", "/var/lib/driver/volumes"),
            ("STATE_FILE", "/var/lib/driver/state.json"),
            ("GOOFYS_BIN", "/usr/bin/goofys"),
        ]))
        .unwrap();

        assert_eq!(config.defaults.region.as_deref(), Some("us-west-2"));
        assert_eq!(config.defaults.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(config.provisioning.namespace.as_deref(), Some("goofys_"));
        assert!(config.provisioning.create_buckets);
        assert_eq!(config.storage.cache_free.as_deref(), Some("1G"));
        assert_eq!(
            config.storage.cache_dir,
            Some(PathBuf::from("/var/lib/driver/cache"))
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.plugin.socket,
            PathBuf::from("/run/docker/plugins/goofys.sock")
        );
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/driver/volumes"));
        assert_eq!(config.mounter.program, PathBuf::from("/usr/bin/goofys"));
        config.validate().unwrap();
    }

    #[test]
    fn test_debug_false_keeps_level() {
        let config = Config::from_lookup(lookup(&[("DEBUG", "false")])).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_file_substitutes_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "defaults:\n  region: ${S3VD_TEST_UNSET_REGION:-ap-south-1}\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.defaults.region.as_deref(), Some("ap-south-1"));

        let err = Config::from_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(..)));
    }
}
