pub mod connection;
pub mod message;
pub mod wire;

pub use connection::{
    ClusterHandler, Connection, ConnectionOptions, ConnectionState, HandshakeSide, RejectRequests,
};
pub use message::{
    ClusterNotification, ClusterRequest, ClusterResponse, ConnectToSlavesRequest,
    ConnectToSlavesResponse, Goodbye, Hello, Ping, PingResponse,
};
pub use wire::{ClusterOp, MAX_FRAME_LEN, OpKind, RpcEnvelope};
