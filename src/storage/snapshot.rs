//! Durable store: an in-memory map persisted as one MessagePack snapshot.

use super::engine::KvStore;
use super::memory::InMemoryKv;
use crate::core::{ClusterError, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SNAPSHOT_FILE: &str = "kv.snapshot";

pub struct SnapshotKv {
    root: PathBuf,
    memory: InMemoryKv,
    dirty: bool,
}

impl SnapshotKv {
    /// Opens the store rooted at `db_path_root`, loading any existing
    /// snapshot. With `clean`, the directory is wiped first.
    pub fn open(db_path_root: impl AsRef<Path>, clean: bool) -> Result<Self> {
        let root = db_path_root.as_ref().to_path_buf();
        if clean && root.exists() {
            info!(path = %root.display(), "wiping database directory");
            fs::remove_dir_all(&root).map_err(|e| {
                ClusterError::Storage(format!("failed to wipe '{}': {}", root.display(), e))
            })?;
        }
        fs::create_dir_all(&root).map_err(|e| {
            ClusterError::Storage(format!("failed to create '{}': {}", root.display(), e))
        })?;

        let path = root.join(SNAPSHOT_FILE);
        let memory = if path.exists() {
            let data = fs::read(&path).map_err(|e| {
                ClusterError::Storage(format!("failed to read snapshot: {}", e))
            })?;
            let entries: Vec<(Vec<u8>, Vec<u8>)> = rmp_serde::from_slice(&data)
                .map_err(|e| ClusterError::Storage(format!("corrupt snapshot: {}", e)))?;
            debug!(entries = entries.len(), "snapshot loaded");
            InMemoryKv::from_entries(entries)
        } else {
            InMemoryKv::new()
        };

        Ok(Self {
            root,
            memory,
            dirty: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the snapshot through a temp file and an atomic rename.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let entries: Vec<(&Vec<u8>, &Vec<u8>)> = self.memory.iter().collect();
        let serialized = rmp_serde::to_vec(&entries)
            .map_err(|e| ClusterError::Storage(format!("failed to serialize snapshot: {}", e)))?;

        let path = self.snapshot_path();
        let temp_path = path.with_extension("tmp");
        let file = File::create(&temp_path)
            .map_err(|e| ClusterError::Storage(format!("failed to create snapshot: {}", e)))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&serialized)
            .map_err(|e| ClusterError::Storage(format!("failed to write snapshot: {}", e)))?;
        writer
            .flush()
            .map_err(|e| ClusterError::Storage(format!("failed to flush snapshot: {}", e)))?;
        writer
            .get_mut()
            .sync_all()
            .map_err(|e| ClusterError::Storage(format!("failed to sync snapshot: {}", e)))?;
        fs::rename(&temp_path, &path)
            .map_err(|e| ClusterError::Storage(format!("failed to rename snapshot: {}", e)))?;

        self.dirty = false;
        debug!(entries = entries.len(), path = %path.display(), "snapshot written");
        Ok(())
    }
}

impl KvStore for SnapshotKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.memory.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.dirty = true;
        self.memory.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.dirty = true;
        self.memory.delete(key)
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        self.memory.contains(key)
    }

    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.memory.range_scan(start, end)
    }
}
