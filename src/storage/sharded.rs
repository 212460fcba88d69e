use super::engine::KvStore;
use crate::core::Result;

/// View of a shared store restricted to one shard's keyspace.
///
/// Every key is stored under the shard id as a 4-byte big-endian prefix.
pub struct ShardedKv<B: KvStore> {
    base: B,
    shard_id: u32,
    prefix: [u8; 4],
}

impl<B: KvStore> ShardedKv<B> {
    pub fn new(base: B, shard_id: u32) -> Self {
        Self {
            base,
            shard_id,
            prefix: shard_id.to_be_bytes(),
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn into_inner(self) -> B {
        self.base
    }

    fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }
}

impl<B: KvStore> KvStore for ShardedKv<B> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.base.get(&self.prefixed(key))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let full = self.prefixed(key);
        self.base.put(&full, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let full = self.prefixed(key);
        self.base.delete(&full)
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        self.base.contains(&self.prefixed(key))
    }

    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self
            .base
            .range_scan(&self.prefixed(start), &self.prefixed(end))?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| (key[self.prefix.len()..].to_vec(), value))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKv;

    #[test]
    fn test_shards_do_not_see_each_other() {
        let mut shared = InMemoryKv::new();
        {
            let mut shard0 = ShardedKv::new(&mut shared, 0);
            shard0.put(b"head", b"zero").unwrap();
        }
        {
            let mut shard1 = ShardedKv::new(&mut shared, 1);
            assert_eq!(shard1.get(b"head").unwrap(), None);
            shard1.put(b"head", b"one").unwrap();
        }

        assert_eq!(shared.get(&[0, 0, 0, 0, b'h', b'e', b'a', b'd']).unwrap(), Some(b"zero".to_vec()));
        assert_eq!(shared.get(&[0, 0, 0, 1, b'h', b'e', b'a', b'd']).unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn test_range_scan_strips_prefix() {
        let mut shared = InMemoryKv::new();
        let mut shard = ShardedKv::new(&mut shared, 7);
        shard.put(b"a", b"1").unwrap();
        shard.put(b"b", b"2").unwrap();
        assert_eq!(
            shard.range_scan(b"a", b"c").unwrap(),
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );
        assert_eq!(shard.shard_id(), 7);
    }
}
