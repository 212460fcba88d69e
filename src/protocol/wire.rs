//! Binary framing for intra-cluster messages.
//!
//! Every frame is `len | op | [rpc_id] | payload`, where `len` is a big-endian
//! `u32` counting everything after itself and `rpc_id` is a big-endian `u32`
//! present only for request and response opcodes.

use crate::core::{ClusterError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// What a frame with a given opcode is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// One-way message, no rpc id.
    Notification,
    /// Peer-initiated call expecting a response with the same rpc id.
    Request,
    /// Answer to one of our requests.
    Response,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    // HANDSHAKE / LIFECYCLE
    Hello = 0,
    Goodbye = 1,

    // MASTER -> SLAVE
    PingRequest = 2,
    PingResponse = 3,
    ConnectToSlavesRequest = 4,
    ConnectToSlavesResponse = 5,
}

impl ClusterOp {
    pub const ALL: [ClusterOp; 6] = [
        ClusterOp::Hello,
        ClusterOp::Goodbye,
        ClusterOp::PingRequest,
        ClusterOp::PingResponse,
        ClusterOp::ConnectToSlavesRequest,
        ClusterOp::ConnectToSlavesResponse,
    ];

    pub fn kind(self) -> OpKind {
        match self {
            ClusterOp::Hello | ClusterOp::Goodbye => OpKind::Notification,
            ClusterOp::PingRequest | ClusterOp::ConnectToSlavesRequest => OpKind::Request,
            ClusterOp::PingResponse | ClusterOp::ConnectToSlavesResponse => OpKind::Response,
        }
    }

    pub fn has_rpc_id(self) -> bool {
        self.kind() != OpKind::Notification
    }

    /// The opcode a request must be answered with.
    pub fn response_op(self) -> Option<ClusterOp> {
        match self {
            ClusterOp::PingRequest => Some(ClusterOp::PingResponse),
            ClusterOp::ConnectToSlavesRequest => Some(ClusterOp::ConnectToSlavesResponse),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ClusterOp {
    type Error = ClusterError;

    fn try_from(value: u8) -> Result<Self> {
        ClusterOp::ALL
            .iter()
            .copied()
            .find(|op| op.byte() == value)
            .ok_or_else(|| ClusterError::ProtocolViolation(format!("unknown opcode {}", value)))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEnvelope {
    pub op: ClusterOp,
    pub rpc_id: Option<u32>,
    pub payload: Vec<u8>,
}

impl RpcEnvelope {
    pub fn notification(op: ClusterOp, payload: Vec<u8>) -> Self {
        Self {
            op,
            rpc_id: None,
            payload,
        }
    }

    pub fn rpc(op: ClusterOp, rpc_id: u32, payload: Vec<u8>) -> Self {
        Self {
            op,
            rpc_id: Some(rpc_id),
            payload,
        }
    }

    /// Encodes the envelope into a complete frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.op.has_rpc_id() != self.rpc_id.is_some() {
            return Err(ClusterError::ProtocolViolation(format!(
                "{:?} must {}carry an rpc id",
                self.op,
                if self.op.has_rpc_id() { "" } else { "not " }
            )));
        }

        let body_len = 1 + if self.rpc_id.is_some() { 4 } else { 0 } + self.payload.len();
        if body_len > MAX_FRAME_LEN {
            return Err(ClusterError::ProtocolViolation(format!(
                "frame of {} bytes exceeds limit of {}",
                body_len, MAX_FRAME_LEN
            )));
        }

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes()); // 4 bytes
        buf.push(self.op.byte()); // 1 byte
        if let Some(rpc_id) = self.rpc_id {
            buf.extend_from_slice(&rpc_id.to_be_bytes()); // 4 bytes
        }
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame body (everything after the length prefix).
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let (&op_byte, rest) = body
            .split_first()
            .ok_or_else(|| ClusterError::ProtocolViolation("empty frame".to_string()))?;
        let op = ClusterOp::try_from(op_byte)?;

        if !op.has_rpc_id() {
            return Ok(Self::notification(op, rest.to_vec()));
        }
        if rest.len() < 4 {
            return Err(ClusterError::ProtocolViolation(format!(
                "{:?} frame is missing its rpc id",
                op
            )));
        }
        let (id_bytes, payload) = rest.split_at(4);
        let rpc_id = u32::from_be_bytes([id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3]]);
        Ok(Self::rpc(op, rpc_id, payload.to_vec()))
    }
}

/// Reads one frame. Returns `Ok(None)` when the stream ends cleanly on a
/// frame boundary.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<RpcEnvelope>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(ClusterError::ProtocolViolation(format!(
            "invalid frame length {}",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    RpcEnvelope::decode_body(&body).map(Some)
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &RpcEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = envelope.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_opcode_kinds_are_consistent() {
        for op in ClusterOp::ALL {
            assert_eq!(ClusterOp::try_from(op.byte()).unwrap(), op);
            match op.kind() {
                OpKind::Request => {
                    let response = op.response_op().unwrap();
                    assert_eq!(response.kind(), OpKind::Response);
                }
                _ => assert!(op.response_op().is_none()),
            }
        }
        assert!(ClusterOp::try_from(200).is_err());
    }

    #[test]
    fn test_notification_frame_layout() {
        let env = RpcEnvelope::notification(ClusterOp::Goodbye, vec![9, 9]);
        assert_eq!(env.encode().unwrap(), vec![0, 0, 0, 3, 1, 9, 9]);
    }

    #[test]
    fn test_rpc_frame_layout() {
        let env = RpcEnvelope::rpc(ClusterOp::PingRequest, 0x01020304, vec![7]);
        assert_eq!(env.encode().unwrap(), vec![0, 0, 0, 6, 2, 1, 2, 3, 4, 7]);
    }

    #[test]
    fn test_rpc_id_must_match_kind() {
        let missing = RpcEnvelope {
            op: ClusterOp::PingRequest,
            rpc_id: None,
            payload: vec![],
        };
        assert!(missing.encode().is_err());

        let extra = RpcEnvelope {
            op: ClusterOp::Hello,
            rpc_id: Some(1),
            payload: vec![],
        };
        assert!(extra.encode().is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_rpc_id() {
        let err = RpcEnvelope::decode_body(&[ClusterOp::PingResponse.byte(), 0, 1]).unwrap_err();
        assert!(matches!(err, ClusterError::ProtocolViolation(_)));
        assert!(RpcEnvelope::decode_body(&[]).is_err());
        assert!(RpcEnvelope::decode_body(&[77]).is_err());
    }

    #[tokio::test]
    async fn test_read_frames_then_clean_eof() {
        let first = RpcEnvelope::rpc(ClusterOp::PingResponse, 5, b"abc".to_vec());
        let second = RpcEnvelope::notification(ClusterOp::Hello, vec![]);
        let mut stream = Builder::new()
            .read(&first.encode().unwrap())
            .read(&second.encode().unwrap())
            .build();

        assert_eq!(read_envelope(&mut stream).await.unwrap(), Some(first));
        assert_eq!(read_envelope(&mut stream).await.unwrap(), Some(second));
        assert_eq!(read_envelope(&mut stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let mut stream = Builder::new().read(&len).build();
        let err = read_envelope(&mut stream).await.unwrap_err();
        assert!(matches!(err, ClusterError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut stream = Builder::new().read(&[0, 0, 0, 8, 2, 0]).build();
        assert!(read_envelope(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_write_envelope() {
        let env = RpcEnvelope::rpc(ClusterOp::ConnectToSlavesResponse, 42, vec![1, 2]);
        let mut out: Vec<u8> = Vec::new();
        write_envelope(&mut out, &env).await.unwrap();
        assert_eq!(out, env.encode().unwrap());
    }
}
