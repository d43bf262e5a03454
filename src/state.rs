//! Durable snapshot of the volume registry
//!
//! The whole registry is rewritten after every mutation; there is no
//! incremental log. A missing file is a normal first start, a file that
//! cannot be parsed is fatal.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{DriverError, Result};
use crate::registry::VolumeRecord;

/// Snapshot format version
pub const STATE_VERSION: u32 = 1;

/// Full serialization of the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeRecord>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            volumes: BTreeMap::new(),
        }
    }
}

/// Persistence port for the registry snapshot
pub trait StateStore: Send {
    /// Load the last saved snapshot; an empty one if nothing was ever saved
    fn load(&self) -> Result<Snapshot>;

    /// Replace the stored snapshot
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// JSON file store with write-to-temp-then-rename replacement
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn corrupt(&self, reason: impl ToString) -> DriverError {
        DriverError::CorruptState {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<Snapshot> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = ?self.path, "no state file, starting with an empty registry");
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(DriverError::Io(e)),
        };

        let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| self.corrupt(e))?;

        if snapshot.version != STATE_VERSION {
            return Err(self.corrupt(format!(
                "unsupported state version {} (expected {})",
                snapshot.version, STATE_VERSION
            )));
        }

        for (key, record) in &snapshot.volumes {
            if key != &record.name {
                return Err(self.corrupt(format!(
                    "entry {:?} holds volume {:?}",
                    key, record.name
                )));
            }
        }

        trace!(path = ?self.path, volumes = snapshot.volumes.len(), "loaded state");
        Ok(snapshot)
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let persist_err =
            |what: &str, e: std::io::Error| DriverError::Persistence(format!("{} {:?}: {}", what, self.path, e));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| persist_err("create directory for", e))?;
        }

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| DriverError::Persistence(format!("serialize state: {}", e)))?;

        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).map_err(|e| persist_err("create", e))?;
        file.write_all(&json).map_err(|e| persist_err("write", e))?;
        file.sync_all().map_err(|e| persist_err("sync", e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| persist_err("replace", e))?;

        trace!(path = ?self.path, volumes = snapshot.volumes.len(), "saved state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::options::OptionTranslator;

    fn record(name: &str, bucket: &str) -> VolumeRecord {
        let options = HashMap::from([("bucket".to_string(), bucket.to_string())]);
        let config = OptionTranslator::new("/mnt/volumes")
            .translate(name, &options)
            .unwrap();
        VolumeRecord::new(name, config)
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot, Snapshot::default());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let err = JsonStateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, DriverError::CorruptState { .. }));
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"version": 99, "volumes": {}}"#).unwrap();

        let err = JsonStateStore::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("unsupported state version"));
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("nested/state.json"));

        let mut snapshot = Snapshot::default();
        let mut vol = record("vol1", "mybucket:logs");
        vol.connection_count = 2;
        snapshot.volumes.insert("vol1".to_string(), vol);
        snapshot
            .volumes
            .insert("vol2".to_string(), record("vol2", "other"));

        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, snapshot);

        // Saving what was loaded leaves the file contents unchanged
        let before = fs::read(store.path()).unwrap();
        store.save(&loaded).unwrap();
        let after = fs::read(store.path()).unwrap();
        assert_eq!(before, after);

        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_mismatched_key_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));

        let mut snapshot = Snapshot::default();
        snapshot
            .volumes
            .insert("alias".to_string(), record("vol1", "b"));
        store.save(&snapshot).unwrap();

        assert!(matches!(
            store.load(),
            Err(DriverError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_save_failure_is_persistence_warning() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        // Parent "directory" is a regular file
        let store = JsonStateStore::new(blocker.join("state.json"));
        let err = store.save(&Snapshot::default()).unwrap_err();
        assert!(err.is_persistence_warning());
    }
}
