use super::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

// ============================================================================
// Shard Mask
// ============================================================================

/// Compact encoding of a set of shard ids.
///
/// The highest set bit acts as a separator; the bits below it form a fixed
/// pattern. A shard belongs to the mask when its low bits equal that pattern.
/// `0b1` covers every shard, `0b100` covers shards `0, 4, 8, ...`,
/// `0b110` covers shards `2, 6, 10, ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ShardMask(u32);

impl ShardMask {
    /// Creates a mask from its raw value. Zero is not a valid mask.
    pub fn new(value: u32) -> Result<Self> {
        if value == 0 {
            return Err(ClusterError::Config("shard mask must be non-zero".to_string()));
        }
        Ok(Self(value))
    }

    /// Mask for slave `index` out of `slave_count` slaves, which together
    /// partition the shard space evenly.
    pub fn for_slave(index: u32, slave_count: u32) -> Result<Self> {
        if !slave_count.is_power_of_two() {
            return Err(ClusterError::Config(format!(
                "slave count {} is not a power of two",
                slave_count
            )));
        }
        if index >= slave_count {
            return Err(ClusterError::Config(format!(
                "slave index {} is out of range for slave count {}",
                index, slave_count
            )));
        }
        Self::new(slave_count | index)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn contains(self, shard_id: u32) -> bool {
        let low = self.low_bits();
        shard_id & low == self.0 & low
    }

    /// Returns true if any of `masks` contains `shard_id`.
    pub fn any_contains(masks: &[ShardMask], shard_id: u32) -> bool {
        masks.iter().any(|mask| mask.contains(shard_id))
    }

    fn low_bits(self) -> u32 {
        let bit_length = u32::BITS - self.0.leading_zeros();
        (1u32 << (bit_length - 1)) - 1
    }
}

impl TryFrom<u32> for ShardMask {
    type Error = ClusterError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ShardMask> for u32 {
    fn from(mask: ShardMask) -> Self {
        mask.0
    }
}

impl fmt::Display for ShardMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

// ============================================================================
// Slave Info
// ============================================================================

/// Connection info and identity of one slave, as carried in cluster config
/// and in CONNECT_TO_SLAVES requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub shard_masks: Vec<ShardMask>,
}

impl SlaveInfo {
    pub fn new(id: impl Into<String>, addr: SocketAddr, shard_masks: Vec<ShardMask>) -> Self {
        Self {
            id: id.into(),
            ip: addr.ip(),
            port: addr.port(),
            shard_masks,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// `"ip:port"` form used when ordering peers to pick the initiator.
    pub fn address_key(&self) -> String {
        address_key(&self.addr())
    }

    pub fn has_shard(&self, shard_id: u32) -> bool {
        ShardMask::any_contains(&self.shard_masks, shard_id)
    }
}

/// Formats an address as `"ip:port"`.
pub fn address_key(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

// ============================================================================
// Node Role
// ============================================================================

/// Which kind of cluster member sits at the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Master,
    Slave,
    Peer,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Slave => write!(f, "slave"),
            NodeRole::Peer => write!(f, "peer"),
        }
    }
}
