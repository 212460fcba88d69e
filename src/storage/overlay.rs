use super::engine::KvStore;
use super::memory::key_range;
use crate::core::Result;
use std::collections::BTreeMap;

/// Buffers writes over a base store until `commit`.
///
/// A `None` entry in the overlay is a tombstone hiding the base value.
pub struct OverlayKv<B: KvStore> {
    base: B,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<B: KvStore> OverlayKv<B> {
    pub fn new(base: B) -> Self {
        Self {
            base,
            overlay: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    /// Number of buffered writes and deletes.
    pub fn pending_writes(&self) -> usize {
        self.overlay.len()
    }

    /// Applies buffered writes to the base store. On failure every write
    /// stays buffered, so `commit` can be retried.
    pub fn commit(&mut self) -> Result<()> {
        for (key, value) in &self.overlay {
            match value {
                Some(value) => self.base.put(key, value)?,
                None => self.base.delete(key)?,
            }
        }
        self.overlay.clear();
        Ok(())
    }

    pub fn discard(&mut self) {
        self.overlay.clear();
    }

    pub fn into_base(self) -> B {
        self.base
    }
}

impl<B: KvStore> KvStore for OverlayKv<B> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.overlay.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.base.get(key),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.overlay.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.overlay.insert(key.to_vec(), None);
        Ok(())
    }

    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(bounds) = key_range(start, end) else {
            return Ok(Vec::new());
        };
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.base.range_scan(start, end)?.into_iter().collect();
        for (key, value) in self.overlay.range::<[u8], _>(bounds) {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}
