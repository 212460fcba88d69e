use crate::config::check_shard_size;
use crate::core::{ClusterError, Result, ShardMask};

/// Maps every shard id in `0..shard_size` to the slaves that serve it.
///
/// Filled in configuration order while slaves are verified, read-only once
/// bring-up reaches the mesh phase. A shard may be served by more than one
/// slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignmentTable {
    shards: Vec<Vec<String>>,
}

impl ShardAssignmentTable {
    pub fn new(shard_size: u32) -> Result<Self> {
        check_shard_size(shard_size)?;
        Ok(Self {
            shards: vec![Vec::new(); shard_size as usize],
        })
    }

    pub fn shard_size(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Adds `slave_id` to every shard covered by `masks`. Registering the
    /// same slave twice has no further effect.
    pub fn register(&mut self, slave_id: &str, masks: &[ShardMask]) {
        for (shard, owners) in self.shards.iter_mut().enumerate() {
            if ShardMask::any_contains(masks, shard as u32)
                && !owners.iter().any(|owner| owner == slave_id)
            {
                owners.push(slave_id.to_string());
            }
        }
    }

    /// Slaves serving `shard_id`, in registration order.
    pub fn slaves_for(&self, shard_id: u32) -> &[String] {
        self.shards
            .get(shard_id as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn missing_shards(&self) -> Vec<u32> {
        self.shards
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.is_empty())
            .map(|(shard, _)| shard as u32)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.shards.iter().all(|owners| !owners.is_empty())
    }

    /// Fails with `ShardCoverageGap` when some shard has no slave.
    pub fn ensure_complete(&self) -> Result<()> {
        let missing = self.missing_shards();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::ShardCoverageGap { missing })
        }
    }

    /// One line per shard: `[shard] is run by slave [ids]`.
    pub fn summary(&self) -> Vec<String> {
        self.shards
            .iter()
            .enumerate()
            .map(|(shard, owners)| format!("[{}] is run by slave {:?}", shard, owners))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(value: u32) -> ShardMask {
        ShardMask::new(value).unwrap()
    }

    #[test]
    fn test_shard_size_out_of_range_rejected() {
        assert!(ShardAssignmentTable::new(0).is_err());
        assert!(ShardAssignmentTable::new(crate::config::MAX_SHARD_SIZE + 1).is_err());
    }

    #[test]
    fn test_partition_is_complete() {
        let mut table = ShardAssignmentTable::new(8).unwrap();
        table.register("S0", &[mask(0b10)]);
        assert_eq!(table.missing_shards(), vec![1, 3, 5, 7]);
        table.register("S1", &[mask(0b11)]);
        assert!(table.is_complete());
        assert!(table.ensure_complete().is_ok());
        assert_eq!(table.slaves_for(6), ["S0".to_string()]);
        assert_eq!(table.slaves_for(7), ["S1".to_string()]);
    }

    #[test]
    fn test_gap_reported() {
        let mut table = ShardAssignmentTable::new(4).unwrap();
        table.register("S0", &[mask(0b100), mask(0b101)]);
        let err = table.ensure_complete().unwrap_err();
        assert_eq!(err, ClusterError::ShardCoverageGap { missing: vec![2, 3] });
    }

    #[test]
    fn test_shared_shards_keep_registration_order() {
        let mut table = ShardAssignmentTable::new(2).unwrap();
        table.register("S1", &[mask(1)]);
        table.register("S0", &[mask(0b10)]);
        table.register("S1", &[mask(1)]);
        assert_eq!(table.slaves_for(0), ["S1".to_string(), "S0".to_string()]);
        assert!(table.slaves_for(99).is_empty());
    }

    #[test]
    fn test_summary_lines() {
        let mut table = ShardAssignmentTable::new(2).unwrap();
        table.register("S0", &[mask(1)]);
        assert_eq!(table.summary()[1], "[1] is run by slave [\"S0\"]");
    }
}
