//! Peer connection policy on top of an external discovery service.
//!
//! Discovery itself is a black box that periodically hands over the list of
//! reachable peers. `PeerNetwork` reconciles its active set against that
//! list through a `PeerDialer`.

use crate::core::{Result, address_key};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use tracing::info;

/// Transport side of the peer network.
#[async_trait]
pub trait PeerDialer: Send + Sync {
    async fn connect(&self, peer: SocketAddr) -> Result<()>;

    async fn disconnect(&self, peer: SocketAddr, reason: &str);
}

/// What one refresh did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub disconnected: Vec<SocketAddr>,
    pub connected: Vec<SocketAddr>,
    /// Peers left for the other side to dial.
    pub skipped: Vec<SocketAddr>,
    pub failed: Vec<(SocketAddr, String)>,
}

pub struct PeerNetwork<D: PeerDialer> {
    self_addr: SocketAddr,
    dialer: D,
    active: BTreeSet<SocketAddr>,
}

impl<D: PeerDialer> PeerNetwork<D> {
    pub fn new(self_addr: SocketAddr, dialer: D) -> Self {
        Self {
            self_addr,
            dialer,
            active: BTreeSet::new(),
        }
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    pub fn active_peers(&self) -> Vec<SocketAddr> {
        self.active.iter().copied().collect()
    }

    /// Records a peer that connected to us.
    pub fn peer_connected(&mut self, peer: SocketAddr) {
        self.active.insert(peer);
    }

    pub fn peer_disconnected(&mut self, peer: SocketAddr) {
        self.active.remove(&peer);
    }

    /// Whether this node initiates the connection to `peer`. Comparing the
    /// `"ip:port"` strings gives both ends the same answer.
    pub fn should_initiate(&self, peer: &SocketAddr) -> bool {
        address_key(&self.self_addr) < address_key(peer)
    }

    /// Drops active peers missing from `discovered` and dials listed peers
    /// that are not yet connected, where this node is the initiator.
    pub async fn refresh_connections(&mut self, discovered: &[SocketAddr]) -> RefreshOutcome {
        info!(count = discovered.len(), "refreshing peer connections");
        let listed: BTreeSet<SocketAddr> = discovered
            .iter()
            .copied()
            .filter(|peer| *peer != self.self_addr)
            .collect();
        let mut outcome = RefreshOutcome::default();

        let stale: Vec<SocketAddr> = self.active.difference(&listed).copied().collect();
        for peer in stale {
            info!(%peer, "disconnecting peer missing from discovery");
            self.dialer.disconnect(peer, "not in discovery list").await;
            self.active.remove(&peer);
            outcome.disconnected.push(peer);
        }

        let mut to_dial = Vec::new();
        for peer in listed.difference(&self.active) {
            if self.should_initiate(peer) {
                to_dial.push(*peer);
            } else {
                info!(%peer, "skipping peer to prevent concurrent initialization");
                outcome.skipped.push(*peer);
            }
        }

        let dialer = &self.dialer;
        let results = join_all(to_dial.iter().map(|peer| dialer.connect(*peer))).await;
        for (peer, result) in to_dial.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    self.active.insert(peer);
                    outcome.connected.push(peer);
                }
                Err(err) => {
                    info!(%peer, error = %err, "failed to connect peer");
                    outcome.failed.push((peer, err.to_string()));
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClusterError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDialer {
        connects: Mutex<Vec<SocketAddr>>,
        disconnects: Mutex<Vec<SocketAddr>>,
        refuse: Option<SocketAddr>,
    }

    #[async_trait]
    impl PeerDialer for RecordingDialer {
        async fn connect(&self, peer: SocketAddr) -> Result<()> {
            self.connects.lock().unwrap().push(peer);
            if self.refuse == Some(peer) {
                return Err(ClusterError::Io("connection refused".to_string()));
            }
            Ok(())
        }

        async fn disconnect(&self, peer: SocketAddr, _reason: &str) {
            self.disconnects.lock().unwrap().push(peer);
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_only_lesser_address_dials() {
        let mut net = PeerNetwork::new(addr("10.0.0.5:38291"), RecordingDialer::default());
        let outcome = net
            .refresh_connections(&[addr("10.0.0.9:38291"), addr("10.0.0.1:38291")])
            .await;

        assert_eq!(outcome.connected, vec![addr("10.0.0.9:38291")]);
        assert_eq!(outcome.skipped, vec![addr("10.0.0.1:38291")]);
        assert_eq!(net.active_peers(), vec![addr("10.0.0.9:38291")]);
    }

    #[tokio::test]
    async fn test_stale_peers_disconnected() {
        let mut net = PeerNetwork::new(addr("10.0.0.1:1000"), RecordingDialer::default());
        net.peer_connected(addr("10.0.0.2:1000"));
        net.peer_connected(addr("10.0.0.3:1000"));

        let outcome = net.refresh_connections(&[addr("10.0.0.3:1000")]).await;
        assert_eq!(outcome.disconnected, vec![addr("10.0.0.2:1000")]);
        assert!(outcome.connected.is_empty());
        assert_eq!(*net.dialer().disconnects.lock().unwrap(), vec![addr("10.0.0.2:1000")]);
        assert!(net.dialer().connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dial_not_marked_active() {
        let dialer = RecordingDialer {
            refuse: Some(addr("10.0.0.8:1")),
            ..Default::default()
        };
        let mut net = PeerNetwork::new(addr("10.0.0.1:1"), dialer);
        let outcome = net.refresh_connections(&[addr("10.0.0.8:1")]).await;
        assert_eq!(outcome.failed.len(), 1);
        assert!(net.active_peers().is_empty());
    }

    #[test]
    fn test_string_order_not_numeric() {
        // "1" sorts before "9" even though 10000 > 9999
        let net = PeerNetwork::new(addr("127.0.0.1:9999"), RecordingDialer::default());
        assert!(!net.should_initiate(&addr("127.0.0.1:10000")));
    }
}
