// ============================================================================
// Shardmesh Library
// ============================================================================

pub mod cluster;
pub mod config;
pub mod core;
pub mod p2p;
pub mod protocol;
pub mod storage;
pub mod supervisor;

// Re-export main types for convenience
pub use core::{ClusterError, NodeRole, Result, ShardMask, SlaveInfo};
pub use config::{ClusterConfig, GenerateOptions, MasterConfig, SlaveConfig};

// Re-export the control plane
pub use cluster::{
    ClusterController, ControllerSettings, ControllerState, ShardAssignmentTable, SlaveHandle,
    SlaveServer, SlaveServerHandle,
};
pub use protocol::{ClusterHandler, Connection, ConnectionOptions, ConnectionState};
pub use supervisor::{LaunchOptions, ProgramSpec, Supervisor};
