//! Typed cluster messages and their MessagePack payload encoding.

use super::wire::{ClusterOp, OpKind};
use crate::core::{ClusterError, NodeRole, Result, ShardMask, SlaveInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// Payloads
// ============================================================================

/// First frame on every connection, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub role: NodeRole,
    pub node_id: String,
}

impl Hello {
    pub fn new(role: NodeRole, node_id: impl Into<String>) -> Self {
        Self {
            role,
            node_id: node_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

/// Identity a slave reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub id: String,
    pub shard_masks: Vec<ShardMask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectToSlavesRequest {
    pub targets: Vec<SlaveInfo>,
}

/// One entry per target, in request order; empty string means success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectToSlavesResponse {
    pub results: Vec<String>,
}

// ============================================================================
// Typed message sets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterNotification {
    Hello(Hello),
    Goodbye(Goodbye),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRequest {
    Ping(Ping),
    ConnectToSlaves(ConnectToSlavesRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterResponse {
    Ping(PingResponse),
    ConnectToSlaves(ConnectToSlavesResponse),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn decode<T: DeserializeOwned>(op: ClusterOp, payload: &[u8]) -> Result<T> {
    rmp_serde::from_slice(payload)
        .map_err(|e| ClusterError::ProtocolViolation(format!("malformed {:?} payload: {}", op, e)))
}

fn wrong_kind(op: ClusterOp, kind: OpKind) -> ClusterError {
    ClusterError::ProtocolViolation(format!("{:?} is not a {:?} opcode", op, kind))
}

impl ClusterNotification {
    pub fn op(&self) -> ClusterOp {
        match self {
            ClusterNotification::Hello(_) => ClusterOp::Hello,
            ClusterNotification::Goodbye(_) => ClusterOp::Goodbye,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            ClusterNotification::Hello(msg) => encode(msg),
            ClusterNotification::Goodbye(msg) => encode(msg),
        }
    }

    pub fn decode(op: ClusterOp, payload: &[u8]) -> Result<Self> {
        match op {
            ClusterOp::Hello => Ok(ClusterNotification::Hello(decode(op, payload)?)),
            ClusterOp::Goodbye => Ok(ClusterNotification::Goodbye(decode(op, payload)?)),
            other => Err(wrong_kind(other, OpKind::Notification)),
        }
    }
}

impl ClusterRequest {
    pub fn op(&self) -> ClusterOp {
        match self {
            ClusterRequest::Ping(_) => ClusterOp::PingRequest,
            ClusterRequest::ConnectToSlaves(_) => ClusterOp::ConnectToSlavesRequest,
        }
    }

    /// Opcode the peer must answer with.
    pub fn response_op(&self) -> ClusterOp {
        match self {
            ClusterRequest::Ping(_) => ClusterOp::PingResponse,
            ClusterRequest::ConnectToSlaves(_) => ClusterOp::ConnectToSlavesResponse,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            ClusterRequest::Ping(msg) => encode(msg),
            ClusterRequest::ConnectToSlaves(msg) => encode(msg),
        }
    }

    pub fn decode(op: ClusterOp, payload: &[u8]) -> Result<Self> {
        match op {
            ClusterOp::PingRequest => Ok(ClusterRequest::Ping(decode(op, payload)?)),
            ClusterOp::ConnectToSlavesRequest => {
                Ok(ClusterRequest::ConnectToSlaves(decode(op, payload)?))
            }
            other => Err(wrong_kind(other, OpKind::Request)),
        }
    }
}

impl ClusterResponse {
    pub fn op(&self) -> ClusterOp {
        match self {
            ClusterResponse::Ping(_) => ClusterOp::PingResponse,
            ClusterResponse::ConnectToSlaves(_) => ClusterOp::ConnectToSlavesResponse,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            ClusterResponse::Ping(msg) => encode(msg),
            ClusterResponse::ConnectToSlaves(msg) => encode(msg),
        }
    }

    pub fn decode(op: ClusterOp, payload: &[u8]) -> Result<Self> {
        match op {
            ClusterOp::PingResponse => Ok(ClusterResponse::Ping(decode(op, payload)?)),
            ClusterOp::ConnectToSlavesResponse => {
                Ok(ClusterResponse::ConnectToSlaves(decode(op, payload)?))
            }
            other => Err(wrong_kind(other, OpKind::Response)),
        }
    }

    pub fn into_ping(self) -> Result<PingResponse> {
        match self {
            ClusterResponse::Ping(resp) => Ok(resp),
            other => Err(ClusterError::ProtocolViolation(format!(
                "expected PingResponse, got {:?}",
                other.op()
            ))),
        }
    }

    pub fn into_connect_to_slaves(self) -> Result<ConnectToSlavesResponse> {
        match self {
            ClusterResponse::ConnectToSlaves(resp) => Ok(resp),
            other => Err(ClusterError::ProtocolViolation(format!(
                "expected ConnectToSlavesResponse, got {:?}",
                other.op()
            ))),
        }
    }
}
