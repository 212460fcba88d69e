use super::engine::KvStore;
use crate::core::Result;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Volatile store backed by a `BTreeMap`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKv {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.entries.iter()
    }

    pub(crate) fn from_entries(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

/// Inclusive-start, exclusive-end bounds; `None` when the range is empty.
pub(crate) fn key_range<'a>(start: &'a [u8], end: &'a [u8]) -> Option<(Bound<&'a [u8]>, Bound<&'a [u8]>)> {
    // BTreeMap::range panics on inverted bounds
    if start >= end {
        return None;
    }
    Some((Bound::Included(start), Bound::Excluded(end)))
}

impl KvStore for InMemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(bounds) = key_range(start, end) else {
            return Ok(Vec::new());
        };
        Ok(self
            .entries
            .range::<[u8], _>(bounds)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
