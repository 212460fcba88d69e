//! Static cluster configuration shared by the supervisor and the master.
//!
//! The file is plain JSON with a `master` object and a `slaves` array. It is
//! loaded once and never mutated afterwards.

pub mod generate;

pub use generate::GenerateOptions;

use crate::core::{ClusterError, Result, ShardMask, SlaveInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const DEFAULT_SHARD_SIZE: u32 = 8;

/// Upper bound on `shard_size`; the assignment table allocates one slot per shard.
pub const MAX_SHARD_SIZE: u32 = 1 << 16;

fn default_shard_size() -> u32 {
    DEFAULT_SHARD_SIZE
}

/// Master section of the cluster config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub db_path_root: String,
    /// P2P listening port.
    pub server_port: u16,
    /// Local JSON-RPC port.
    pub json_rpc_port: u16,
    pub seed_host: String,
    pub seed_port: u16,
    /// Number of shards in the cluster; shard ids are `0..shard_size`.
    #[serde(default = "default_shard_size")]
    pub shard_size: u32,
    #[serde(default)]
    pub devp2p: bool,
    pub devp2p_port: u16,
    pub devp2p_bootstrap_host: String,
    pub devp2p_bootstrap_port: u16,
    pub devp2p_min_peers: u32,
    pub devp2p_max_peers: u32,
}

/// One entry of the `slaves` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveConfig {
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub shard_masks: Vec<ShardMask>,
    pub db_path_root: String,
}

impl SlaveConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn info(&self) -> SlaveInfo {
        SlaveInfo {
            id: self.id.clone(),
            ip: self.ip,
            port: self.port,
            shard_masks: self.shard_masks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub master: MasterConfig,
    pub slaves: Vec<SlaveConfig>,
}

impl ClusterConfig {
    /// Parse and validate a config from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the config to `path` atomically (temp file in the same
    /// directory, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(self.to_json()?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ClusterError::Io(e.error.to_string()))?;
        Ok(())
    }

    /// Dump the config into a fresh temporary file that outlives this
    /// process, returning its path. Used to hand a generated config to the
    /// master process.
    pub fn write_temp(&self) -> Result<PathBuf> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(self.to_json()?.as_bytes())?;
        tmp.as_file().sync_all()?;
        let (_, path) = tmp.keep().map_err(|e| ClusterError::Io(e.error.to_string()))?;
        Ok(path)
    }

    pub fn shard_size(&self) -> u32 {
        self.master.shard_size
    }

    /// Connection info for every slave, in config order.
    pub fn slave_infos(&self) -> Vec<SlaveInfo> {
        self.slaves.iter().map(SlaveConfig::info).collect()
    }

    pub fn slave(&self, id: &str) -> Option<&SlaveConfig> {
        self.slaves.iter().find(|slave| slave.id == id)
    }

    /// Shard ids in `0..shard_size` not covered by any slave.
    pub fn uncovered_shards(&self) -> Vec<u32> {
        (0..self.shard_size())
            .filter(|shard| {
                !self
                    .slaves
                    .iter()
                    .any(|slave| ShardMask::any_contains(&slave.shard_masks, *shard))
            })
            .collect()
    }

    /// Structural validation.
    ///
    /// Coverage is deliberately not checked here: a gap is detected by the
    /// controller during bring-up.
    pub fn validate(&self) -> Result<()> {
        check_shard_size(self.master.shard_size)?;
        if self.slaves.is_empty() {
            return Err(ClusterError::Config("at least one slave is required".to_string()));
        }

        let mut ids = HashSet::new();
        let mut addrs = HashSet::new();
        for slave in &self.slaves {
            if slave.id.trim().is_empty() {
                return Err(ClusterError::Config("slave id must not be empty".to_string()));
            }
            if !ids.insert(slave.id.as_str()) {
                return Err(ClusterError::Config(format!(
                    "slave id '{}' appears more than once",
                    slave.id
                )));
            }
            if !addrs.insert(slave.addr()) {
                return Err(ClusterError::Config(format!(
                    "slave address {} appears more than once",
                    slave.addr()
                )));
            }
            if slave.shard_masks.is_empty() {
                return Err(ClusterError::Config(format!(
                    "slave '{}' has no shard masks",
                    slave.id
                )));
            }
        }
        Ok(())
    }
}

/// Rejects shard counts outside `1..=MAX_SHARD_SIZE`.
pub fn check_shard_size(shard_size: u32) -> Result<()> {
    if shard_size == 0 || shard_size > MAX_SHARD_SIZE {
        return Err(ClusterError::Config(format!(
            "shard_size must be between 1 and {}, got {}",
            MAX_SHARD_SIZE, shard_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> ClusterConfig {
        ClusterConfig::generate(&GenerateOptions::new(2)).unwrap()
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = sample();
        config.slaves[1].id = config.slaves[0].id.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_masks() {
        let mut config = sample();
        config.slaves[0].shard_masks.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_addresses() {
        let mut config = sample();
        config.slaves[1].port = config.slaves[0].port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shard_size_is_bounded() {
        for shard_size in [0, MAX_SHARD_SIZE + 1, u32::MAX] {
            let mut value = serde_json::to_value(sample()).unwrap();
            value["master"]["shard_size"] = serde_json::json!(shard_size);
            let err = ClusterConfig::from_json(&value.to_string()).unwrap_err();
            assert!(matches!(err, ClusterError::Config(_)), "{shard_size}: {err}");
        }

        let mut config = sample();
        config.master.shard_size = MAX_SHARD_SIZE;
        config.validate().unwrap();
    }

    #[test]
    fn test_shard_size_defaults_when_missing() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["master"].as_object_mut().unwrap().remove("shard_size");
        let config = ClusterConfig::from_json(&value.to_string()).unwrap();
        assert_eq!(config.shard_size(), DEFAULT_SHARD_SIZE);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cluster_config.json");
        let config = sample();
        config.save(&path).unwrap();
        assert_eq!(ClusterConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_write_temp_keeps_file() {
        let config = sample();
        let path = config.write_temp().unwrap();
        assert_eq!(ClusterConfig::load(&path).unwrap(), config);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_uncovered_shards() {
        let mut config = sample();
        assert!(config.uncovered_shards().is_empty());
        config.slaves.pop();
        assert_eq!(config.uncovered_shards(), vec![1, 3, 5, 7]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ClusterConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
    }
}
