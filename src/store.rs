//! # Persisted arbitration config
//!
//! A small durable record written when an environment is created and read by
//! every arbitration call that needs the thread split or the last-bound GPU
//! address. It is the only state this crate keeps on disk; ownership itself is
//! always inferred from the live system.
//!
//! Writes go through a temp file followed by a rename, so a concurrent poller
//! never observes a truncated record.

use std::path::PathBuf;

use tracing::debug;

use crate::address::BusAddress;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Could not read arbitration config at {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("Could not write arbitration config at {path}: {reason}")]
    Write { path: PathBuf, reason: String },
    #[error("Arbitration config at {path} is not valid JSON: {reason}")]
    Decode { path: PathBuf, reason: String },
}

/// The durable record shared by the arbiters and the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationConfig {
    pub total_threads: u32,
    pub host_threads: u32,
    pub last_env_name: String,
    pub gpu_address: Option<BusAddress>,
    pub audio_address: Option<BusAddress>,
}

impl Default for ArbitrationConfig {
    fn default() -> ArbitrationConfig {
        ArbitrationConfig {
            total_threads: 16,
            host_threads: 2,
            last_env_name: "win11".to_string(),
            gpu_address: None,
            audio_address: None,
        }
    }
}

/// File-backed accessor for [ArbitrationConfig], last-writer-wins.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> ConfigStore {
        ConfigStore { path }
    }

    /// The conventional location next to the libvirt image tree.
    pub fn default_path() -> ConfigStore {
        ConfigStore::new(PathBuf::from("/var/lib/fusionpilot/config.json"))
    }

    /// Read the record, falling back to defaults when no environment has been
    /// created yet.
    pub fn load(&self) -> Result<ArbitrationConfig, StoreError> {
        if !self.path.exists() {
            debug!("No arbitration config at {}, using defaults", self.path.display());
            return Ok(ArbitrationConfig::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| StoreError::Read {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|e| StoreError::Decode {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Atomically replace the record: write to a temp path in the same
    /// directory, then rename over the target.
    pub fn save(&self, config: &ArbitrationConfig) -> Result<(), StoreError> {
        let write_err = |e: std::io::Error| StoreError::Write {
            path: self.path.clone(),
            reason: e.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let data = serde_json::to_string_pretty(config).map_err(|e| StoreError::Write {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        debug!("Saved arbitration config to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArbitrationConfig {
        ArbitrationConfig {
            total_threads: 16,
            host_threads: 2,
            last_env_name: "win11".to_string(),
            gpu_address: Some("0a:00.0".parse().unwrap()),
            audio_address: Some("0a:00.1".parse().unwrap()),
        }
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        assert_eq!(store.load().unwrap(), ArbitrationConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn save_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested/deeper/config.json"));
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        store.save(&sample()).unwrap();
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json {").unwrap();
        let store = ConfigStore::new(path);
        assert!(matches!(store.load(), Err(StoreError::Decode { .. })));
    }

    #[test]
    fn addresses_serialize_in_canonical_text_form() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"0a:00.0\""));
        assert!(json.contains("\"0a:00.1\""));
    }
}
