//! Master-side handle to one slave process.

use super::settings::ControllerSettings;
use crate::core::{ClusterError, NodeRole, Result, ShardMask, SlaveInfo};
use crate::protocol::{
    ClusterRequest, Connection, ConnectionOptions, ConnectToSlavesRequest, HandshakeSide, Hello,
    Ping, PingResponse, RejectRequests,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Dialed, handshake or identity check still outstanding
    Connecting,
    /// Handshake done and identity matches configuration
    Active,
    Closed,
}

/// Dials `addr` until it answers, sleeping `settings.retry_delay` between
/// attempts.
pub async fn dial_with_retry(
    label: &str,
    addr: SocketAddr,
    settings: &ControllerSettings,
) -> Result<TcpStream> {
    let mut attempts: u32 = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                attempts = attempts.saturating_add(1);
                if settings.attempts_exhausted(attempts) {
                    return Err(ClusterError::ConnectionClosed(format!(
                        "gave up dialing {} at {} after {} attempts: {}",
                        label, addr, attempts, err
                    )));
                }
                info!(
                    target_node = %label,
                    %addr,
                    error = %err,
                    "failed to connect, retry in {:?}",
                    settings.retry_delay
                );
                tokio::time::sleep(settings.retry_delay).await;
            }
        }
    }
}

pub struct SlaveHandle {
    info: SlaveInfo,
    conn: Connection,
    verified: AtomicBool,
}

impl SlaveHandle {
    /// Dials the slave described by `info` (retrying per `settings`) and
    /// starts the handshake.
    pub async fn connect(info: SlaveInfo, settings: &ControllerSettings) -> Result<Arc<Self>> {
        info!(slave = %info.id, addr = %info.addr(), "connecting to slave");
        let stream = dial_with_retry(&info.id, info.addr(), settings).await?;

        let conn = Connection::from_tcp(
            stream,
            HandshakeSide::Initiator,
            Hello::new(NodeRole::Master, settings.master_id.clone()),
            Arc::new(RejectRequests),
            ConnectionOptions::new(format!("slave {}", info.id))
                .request_timeout(settings.rpc_timeout),
        );
        Ok(Arc::new(Self::new(info, conn)))
    }

    pub fn new(info: SlaveInfo, conn: Connection) -> Self {
        Self {
            info,
            conn,
            verified: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.info.addr()
    }

    pub fn shard_masks(&self) -> &[ShardMask] {
        &self.info.shard_masks
    }

    pub fn info(&self) -> &SlaveInfo {
        &self.info
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn state(&self) -> SlaveState {
        if self.conn.is_closed() {
            SlaveState::Closed
        } else if self.verified.load(Ordering::Acquire) {
            SlaveState::Active
        } else {
            SlaveState::Connecting
        }
    }

    pub fn has_shard(&self, shard_id: u32) -> bool {
        self.info.has_shard(shard_id)
    }

    /// Completes the handshake and checks that the slave reports the id and
    /// shard masks it was configured with.
    pub async fn verify(&self) -> Result<()> {
        self.conn.await_active().await?;
        let identity = self.send_ping().await?;

        if identity.id != self.info.id {
            return Err(ClusterError::ConfigMismatch {
                slave_id: self.info.id.clone(),
                detail: format!("slave reports id '{}'", identity.id),
            });
        }
        if identity.shard_masks != self.info.shard_masks {
            return Err(ClusterError::ConfigMismatch {
                slave_id: self.info.id.clone(),
                detail: format!(
                    "slave reports shard masks {:?}, expected {:?}",
                    identity.shard_masks, self.info.shard_masks
                ),
            });
        }

        self.verified.store(true, Ordering::Release);
        info!(slave = %self.info.id, addr = %self.addr(), "slave verified");
        Ok(())
    }

    pub async fn send_ping(&self) -> Result<PingResponse> {
        self.conn
            .send_request(ClusterRequest::Ping(Ping::default()))
            .await?
            .into_ping()
    }

    /// Asks the slave to connect to every slave in `targets`.
    pub async fn connect_to_slaves(&self, targets: Vec<SlaveInfo>) -> Result<()> {
        let target_ids: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
        let response = self
            .conn
            .send_request(ClusterRequest::ConnectToSlaves(ConnectToSlavesRequest {
                targets,
            }))
            .await?
            .into_connect_to_slaves()?;

        if response.results.len() != target_ids.len() {
            return Err(ClusterError::ProtocolViolation(format!(
                "slave '{}' returned {} results for {} targets",
                self.info.id,
                response.results.len(),
                target_ids.len()
            )));
        }
        for (target_id, result) in target_ids.into_iter().zip(response.results) {
            if !result.is_empty() {
                warn!(slave = %self.info.id, target = %target_id, error = %result, "mesh connect failed");
                return Err(ClusterError::MeshConnectFailure {
                    slave_id: self.info.id.clone(),
                    target_id,
                    error: result,
                });
            }
        }
        Ok(())
    }

    /// Resolves when the underlying connection closes.
    pub async fn closed(&self) -> String {
        self.conn.closed().await
    }

    pub fn close(&self, reason: &str) -> bool {
        self.conn.close(reason)
    }
}

impl Drop for SlaveHandle {
    fn drop(&mut self) {
        self.conn.close("slave handle released");
    }
}

impl std::fmt::Debug for SlaveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveHandle")
            .field("id", &self.info.id)
            .field("addr", &self.addr())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dial_gives_up_after_budget() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let settings = ControllerSettings::new()
            .retry_delay(Duration::from_millis(5))
            .max_connect_attempts(2);
        let err = dial_with_retry("S0", addr, &settings).await.unwrap_err();
        assert!(matches!(err, ClusterError::ConnectionClosed(_)));
    }
}
