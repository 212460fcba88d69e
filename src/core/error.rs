use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Slave '{slave_id}' does not match cluster config: {detail}")]
    ConfigMismatch { slave_id: String, detail: String },

    #[error("Shards not covered by any slave: {missing:?}")]
    ShardCoverageGap { missing: Vec<u32> },

    #[error("Slave '{slave_id}' failed to connect to '{target_id}': {error}")]
    MeshConnectFailure {
        slave_id: String,
        target_id: String,
        error: String,
    },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Process '{label}' exited: {status}")]
    ProcessExit { label: String, status: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection is not active yet")]
    NotActive,

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ClusterError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ClusterError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
