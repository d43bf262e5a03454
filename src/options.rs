//! Translation of per-volume driver options into a typed mount configuration
//!
//! Docker hands the driver an untyped `map[string]string` on every `Create`.
//! This module maps that vocabulary onto [`MountConfig`], layering the
//! options over driver-level [`MountDefaults`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DriverError, Result};

/// Default directory mode (rwxr-xr-x)
pub const DEFAULT_DIR_MODE: u32 = 0o755;
/// Default file mode (rw-r--r--)
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default attribute and type cache TTL
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
/// Default storage class for written objects
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Storage location a volume maps to: `bucket[:prefix]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl BucketRef {
    pub fn new(name: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            name: name.into(),
            prefix,
        }
    }

    /// Split a `bucket[:prefix]` reference into its parts
    pub fn split(spec: &str) -> (&str, Option<&str>) {
        match spec.split_once(':') {
            Some((name, prefix)) => (name, Some(prefix)),
            None => (spec, None),
        }
    }
}

impl fmt::Display for BucketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", self.name, prefix),
            None => f.write_str(&self.name),
        }
    }
}

/// Fully resolved configuration handed to the mounter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    pub bucket: BucketRef,
    /// Bucket name was derived from the driver namespace, not from options
    #[serde(default)]
    pub namespaced: bool,
    pub mount_point: PathBuf,
    pub dir_mode: u32,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(with = "humantime_serde")]
    pub stat_cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub type_cache_ttl: Duration,
    pub storage_class: String,
    pub region: Option<String>,
    #[serde(default)]
    pub region_set: bool,
    pub endpoint: Option<String>,
    pub profile: Option<String>,
    #[serde(default)]
    pub use_content_type: bool,
    #[serde(default)]
    pub sse: bool,
    #[serde(default)]
    pub sse_kms: bool,
    pub kms_key_id: Option<String>,
    pub acl: Option<String>,
    #[serde(default)]
    pub cheap: bool,
    #[serde(default)]
    pub explicit_dir: bool,
    #[serde(default)]
    pub debug_fuse: bool,
    #[serde(default)]
    pub debug_s3: bool,
    #[serde(default = "default_foreground")]
    pub foreground: bool,
    #[serde(default)]
    pub mount_options: BTreeMap<String, String>,
    pub cache_dir: Option<PathBuf>,
    pub cache_free: Option<String>,
}

fn default_foreground() -> bool {
    true
}

/// Driver-level defaults applied before per-volume options
#[derive(Debug, Clone, PartialEq)]
pub struct MountDefaults {
    pub dir_mode: u32,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub stat_cache_ttl: Duration,
    pub type_cache_ttl: Duration,
    pub storage_class: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub profile: Option<String>,
}

impl Default for MountDefaults {
    fn default() -> Self {
        Self {
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
            uid: 0,
            gid: 0,
            stat_cache_ttl: DEFAULT_CACHE_TTL,
            type_cache_ttl: DEFAULT_CACHE_TTL,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            region: None,
            endpoint: None,
            profile: None,
        }
    }
}

/// What to do with a recognized option whose value does not parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Fail the whole `Create`
    #[default]
    Reject,
    /// Keep the field's default and log a warning
    Default,
}

/// Recognized option keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKey {
    Bucket,
    BucketName,
    Prefix,
    DirMode,
    FileMode,
    Gid,
    Uid,
    Endpoint,
    Region,
    RegionSet,
    StorageClass,
    Profile,
    UseContentType,
    Sse,
    SseKms,
    KmsKeyId,
    Acl,
    Cheap,
    ExplicitDir,
    StateCacheTtl,
    TypeCacheTtl,
    DebugFuse,
    DebugS3,
}

impl OptionKey {
    pub const ALL: [OptionKey; 23] = [
        OptionKey::Bucket,
        OptionKey::BucketName,
        OptionKey::Prefix,
        OptionKey::DirMode,
        OptionKey::FileMode,
        OptionKey::Gid,
        OptionKey::Uid,
        OptionKey::Endpoint,
        OptionKey::Region,
        OptionKey::RegionSet,
        OptionKey::StorageClass,
        OptionKey::Profile,
        OptionKey::UseContentType,
        OptionKey::Sse,
        OptionKey::SseKms,
        OptionKey::KmsKeyId,
        OptionKey::Acl,
        OptionKey::Cheap,
        OptionKey::ExplicitDir,
        OptionKey::StateCacheTtl,
        OptionKey::TypeCacheTtl,
        OptionKey::DebugFuse,
        OptionKey::DebugS3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKey::Bucket => "bucket",
            OptionKey::BucketName => "bucket-name",
            OptionKey::Prefix => "prefix",
            OptionKey::DirMode => "dir-mode",
            OptionKey::FileMode => "file-mode",
            OptionKey::Gid => "gid",
            OptionKey::Uid => "uid",
            OptionKey::Endpoint => "endpoint",
            OptionKey::Region => "region",
            OptionKey::RegionSet => "region-set",
            OptionKey::StorageClass => "storage-class",
            OptionKey::Profile => "profile",
            OptionKey::UseContentType => "use-content-type",
            OptionKey::Sse => "sse",
            OptionKey::SseKms => "sse-kms",
            OptionKey::KmsKeyId => "kms-key-id",
            OptionKey::Acl => "acl",
            OptionKey::Cheap => "cheap",
            OptionKey::ExplicitDir => "explicit-dir",
            OptionKey::StateCacheTtl => "state-cache-ttl",
            OptionKey::TypeCacheTtl => "type-cache-ttl",
            OptionKey::DebugFuse => "debug-fuse",
            OptionKey::DebugS3 => "debug-s3",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == key)
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts Docker volume options into [`MountConfig`]
#[derive(Debug, Clone)]
pub struct OptionTranslator {
    root: PathBuf,
    defaults: MountDefaults,
    namespace: Option<String>,
    cache_dir: Option<PathBuf>,
    cache_free: Option<String>,
    policy: MalformedPolicy,
}

impl OptionTranslator {
    /// Create a translator placing mountpoints under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            defaults: MountDefaults::default(),
            namespace: None,
            cache_dir: None,
            cache_free: None,
            policy: MalformedPolicy::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: MountDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Volumes created without a bucket map to `<namespace><volume>`
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    /// Enable the local caching overlay with per-volume directories under `dir`
    pub fn with_cache(mut self, dir: Option<PathBuf>, free: Option<String>) -> Self {
        self.cache_dir = dir;
        self.cache_free = free;
        self
    }

    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mountpoint of a volume; a pure function of its name
    pub fn mount_point(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Reject names that would escape the volume root
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DriverError::Validation("volume name is empty".to_string()));
        }
        if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
            return Err(DriverError::Validation(format!(
                "invalid volume name {:?}",
                name
            )));
        }
        Ok(())
    }

    /// Translate the options of volume `name` into a mount configuration
    pub fn translate(&self, name: &str, options: &HashMap<String, String>) -> Result<MountConfig> {
        Self::validate_name(name)?;

        let d = &self.defaults;
        let mut config = MountConfig {
            bucket: BucketRef::new(String::new(), None),
            namespaced: false,
            mount_point: self.mount_point(name),
            dir_mode: d.dir_mode,
            file_mode: d.file_mode,
            uid: d.uid,
            gid: d.gid,
            stat_cache_ttl: d.stat_cache_ttl,
            type_cache_ttl: d.type_cache_ttl,
            storage_class: d.storage_class.clone(),
            region: d.region.clone(),
            region_set: false,
            endpoint: d.endpoint.clone(),
            profile: d.profile.clone(),
            use_content_type: false,
            sse: false,
            sse_kms: false,
            kms_key_id: None,
            acl: None,
            cheap: false,
            explicit_dir: false,
            debug_fuse: false,
            debug_s3: false,
            foreground: true,
            mount_options: BTreeMap::from([("allow_other".to_string(), String::new())]),
            cache_dir: self.cache_dir.as_ref().map(|dir| dir.join(name)),
            cache_free: self.cache_free.clone(),
        };

        let mut bucket_spec: Option<&str> = None;
        let mut bucket_name: Option<&str> = None;
        let mut prefix: Option<&str> = None;
        let mut region_given = false;
        let mut region_set = false;

        // Sorted so that warnings and errors are reported deterministically
        let mut sorted: Vec<(&String, &String)> = options.iter().collect();
        sorted.sort();

        for (key, value) in sorted {
            let Some(opt) = OptionKey::parse(key) else {
                debug!(volume = %name, option = %key, "ignoring unrecognized volume option");
                continue;
            };
            let value = value.trim();

            match opt {
                OptionKey::Bucket => bucket_spec = Some(value),
                OptionKey::BucketName => bucket_name = Some(value),
                OptionKey::Prefix => prefix = Some(value),
                OptionKey::DirMode => {
                    self.apply(name, opt, value, parse_mode, |v| config.dir_mode = v)?
                }
                OptionKey::FileMode => {
                    self.apply(name, opt, value, parse_mode, |v| config.file_mode = v)?
                }
                OptionKey::Uid => self.apply(name, opt, value, parse_id, |v| config.uid = v)?,
                OptionKey::Gid => self.apply(name, opt, value, parse_id, |v| config.gid = v)?,
                OptionKey::Endpoint => {
                    self.apply(name, opt, value, parse_text, |v| config.endpoint = Some(v))?
                }
                OptionKey::Region => self.apply(name, opt, value, parse_text, |v| {
                    config.region = Some(v);
                    region_given = true;
                })?,
                OptionKey::RegionSet => {
                    self.apply(name, opt, value, parse_bool, |v| region_set = v)?
                }
                OptionKey::StorageClass => self.apply(name, opt, value, parse_text, |v| {
                    config.storage_class = v
                })?,
                OptionKey::Profile => {
                    self.apply(name, opt, value, parse_text, |v| config.profile = Some(v))?
                }
                OptionKey::UseContentType => self.apply(name, opt, value, parse_bool, |v| {
                    config.use_content_type = v
                })?,
                OptionKey::Sse => self.apply(name, opt, value, parse_bool, |v| config.sse = v)?,
                OptionKey::SseKms => {
                    self.apply(name, opt, value, parse_bool, |v| config.sse_kms = v)?
                }
                OptionKey::KmsKeyId => self.apply(name, opt, value, parse_text, |v| {
                    config.kms_key_id = Some(v)
                })?,
                OptionKey::Acl => {
                    self.apply(name, opt, value, parse_text, |v| config.acl = Some(v))?
                }
                OptionKey::Cheap => {
                    self.apply(name, opt, value, parse_bool, |v| config.cheap = v)?
                }
                OptionKey::ExplicitDir => {
                    self.apply(name, opt, value, parse_bool, |v| config.explicit_dir = v)?
                }
                OptionKey::StateCacheTtl => self.apply(name, opt, value, parse_ttl, |v| {
                    config.stat_cache_ttl = v
                })?,
                OptionKey::TypeCacheTtl => self.apply(name, opt, value, parse_ttl, |v| {
                    config.type_cache_ttl = v
                })?,
                OptionKey::DebugFuse => {
                    self.apply(name, opt, value, parse_bool, |v| config.debug_fuse = v)?
                }
                OptionKey::DebugS3 => {
                    self.apply(name, opt, value, parse_bool, |v| config.debug_s3 = v)?
                }
            }
        }

        config.region_set = region_set || region_given;
        if config.kms_key_id.is_some() {
            config.sse_kms = true;
        }

        let (spec_name, spec_prefix) = match bucket_spec {
            Some(spec) => {
                let (n, p) = BucketRef::split(spec);
                (Some(n), p)
            }
            None => (None, None),
        };

        let explicit = bucket_name
            .filter(|n| !n.is_empty())
            .or(spec_name.filter(|n| !n.is_empty()));

        let (bucket, namespaced) = match (explicit, &self.namespace) {
            (Some(n), _) => (n.to_string(), false),
            (None, Some(ns)) => (format!("{}{}", ns, name), true),
            (None, None) => {
                return Err(DriverError::Validation(format!(
                    "volume {} has no bucket: set the `{}` or `{}` option",
                    name,
                    OptionKey::Bucket,
                    OptionKey::BucketName
                )))
            }
        };

        if bucket.contains('/') || bucket.contains(':') {
            return Err(DriverError::Validation(format!(
                "invalid bucket name {:?}",
                bucket
            )));
        }

        let prefix = prefix
            .or(spec_prefix)
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        config.bucket = BucketRef::new(bucket, prefix);
        config.namespaced = namespaced;

        Ok(config)
    }

    fn apply<T>(
        &self,
        volume: &str,
        key: OptionKey,
        raw: &str,
        parse: fn(&str) -> std::result::Result<T, String>,
        set: impl FnOnce(T),
    ) -> Result<()> {
        match parse(raw) {
            Ok(value) => {
                set(value);
                Ok(())
            }
            Err(reason) => match self.policy {
                MalformedPolicy::Reject => Err(DriverError::Validation(format!(
                    "option {}={:?}: {}",
                    key, raw, reason
                ))),
                MalformedPolicy::Default => {
                    warn!(
                        volume = %volume,
                        option = %key,
                        value = %raw,
                        %reason,
                        "malformed volume option, keeping default"
                    );
                    Ok(())
                }
            },
        }
    }
}

/// Parse an octal permission mode (`0755`, `755` or `0o755`)
pub fn parse_mode(raw: &str) -> std::result::Result<u32, String> {
    let digits = raw.strip_prefix("0o").unwrap_or(raw);
    let mode = u32::from_str_radix(digits, 8).map_err(|e| format!("not an octal mode: {}", e))?;
    if mode > 0o7777 {
        return Err(format!("mode {:o} out of range", mode));
    }
    Ok(mode)
}

fn parse_id(raw: &str) -> std::result::Result<u32, String> {
    raw.parse::<u32>()
        .map_err(|e| format!("not a numeric id: {}", e))
}

/// Parse a boolean flag; an empty value means the flag is set
pub fn parse_bool(raw: &str) -> std::result::Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "" | "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err("not a boolean".to_string()),
    }
}

fn parse_ttl(raw: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(raw).map_err(|e| format!("not a duration: {}", e))
}

fn parse_text(raw: &str) -> std::result::Result<String, String> {
    if raw.is_empty() {
        Err("value is empty".to_string())
    } else {
        Ok(raw.to_string())
    }
}
