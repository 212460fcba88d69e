pub mod engine;
pub mod keys;
pub mod memory;
pub mod meta;
pub mod overlay;
pub mod sharded;
pub mod snapshot;

pub use engine::KvStore;
pub use memory::InMemoryKv;
pub use meta::NodeMeta;
pub use overlay::OverlayKv;
pub use sharded::ShardedKv;
pub use snapshot::SnapshotKv;
