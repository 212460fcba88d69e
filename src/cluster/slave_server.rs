//! Slave-side endpoint: answers the master and links up with peer slaves.

use crate::core::{ClusterError, NodeRole, Result, ShardMask, SlaveInfo, address_key};
use crate::protocol::{
    ClusterHandler, ClusterRequest, ClusterResponse, Connection, ConnectionOptions,
    ConnectToSlavesRequest, ConnectToSlavesResponse, HandshakeSide, Hello, PingResponse,
};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Why a slave server stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StopReason {
    MasterLost(String),
    Requested,
}

#[derive(Debug, Default)]
struct SlaveMetrics {
    connections_accepted: AtomicU64,
    peers_dialed: AtomicU64,
}

struct SlaveShared {
    identity: SlaveInfo,
    master: Mutex<Option<Connection>>,
    peers: Mutex<HashMap<String, Connection>>,
    stop: watch::Sender<Option<StopReason>>,
    metrics: SlaveMetrics,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SlaveShared {
    fn hello(&self) -> Hello {
        Hello::new(NodeRole::Slave, self.identity.id.clone())
    }

    fn stop(&self, reason: StopReason) {
        self.stop.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    fn register_peer(self: &Arc<Self>, peer_id: String, conn: Connection) {
        if let Some(previous) = lock(&self.peers).insert(peer_id.clone(), conn.clone()) {
            if previous.id() != conn.id() {
                previous.close("replaced by a newer link");
            }
        }
        info!(slave = %self.identity.id, peer = %peer_id, "peer link registered");

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let reason = conn.closed().await;
            let mut peers = lock(&shared.peers);
            if peers.get(&peer_id).is_some_and(|current| current.id() == conn.id()) {
                peers.remove(&peer_id);
                warn!(slave = %shared.identity.id, peer = %peer_id, %reason, "peer link closed");
            }
        });
    }

    fn register_master(self: &Arc<Self>, conn: Connection) -> Result<()> {
        {
            let mut master = lock(&self.master);
            if master.as_ref().is_some_and(|current| !current.is_closed()) {
                return Err(ClusterError::ProtocolViolation(
                    "a master is already connected".to_string(),
                ));
            }
            *master = Some(conn.clone());
        }
        info!(slave = %self.identity.id, "master connected");

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let reason = conn.closed().await;
            error!(slave = %shared.identity.id, %reason, "lost connection to master");
            shared.stop(StopReason::MasterLost(reason));
        });
        Ok(())
    }

    /// Dials one mesh target. Returns an empty string on success.
    async fn link_to(self: Arc<Self>, target: SlaveInfo) -> String {
        let own_key = self.identity.address_key();
        let target_key = target.address_key();
        if target.id == self.identity.id {
            return String::new();
        }
        if own_key >= target_key {
            debug!(slave = %self.identity.id, target = %target.id, "waiting for peer to dial");
            return String::new();
        }

        self.metrics.peers_dialed.fetch_add(1, Ordering::Relaxed);
        let handler: Arc<dyn ClusterHandler> = Arc::new(SlaveService {
            shared: Arc::clone(&self),
        });
        let options = ConnectionOptions::new(format!("peer {}", target.id));
        let result = async {
            let conn = Connection::connect(target.addr(), self.hello(), handler, options).await?;
            conn.await_active().await?;
            Ok::<_, ClusterError>(conn)
        }
        .await;

        match result {
            Ok(conn) => {
                self.register_peer(target.id.clone(), conn);
                String::new()
            }
            Err(err) => {
                warn!(slave = %self.identity.id, target = %target.id, error = %err, "failed to link peer");
                err.to_string()
            }
        }
    }
}

/// Request handler shared by the master link and peer links.
struct SlaveService {
    shared: Arc<SlaveShared>,
}

#[async_trait]
impl ClusterHandler for SlaveService {
    async fn on_request(&self, _conn: &Connection, request: ClusterRequest) -> Result<ClusterResponse> {
        match request {
            ClusterRequest::Ping(_) => Ok(ClusterResponse::Ping(PingResponse {
                id: self.shared.identity.id.clone(),
                shard_masks: self.shared.identity.shard_masks.clone(),
            })),
            ClusterRequest::ConnectToSlaves(ConnectToSlavesRequest { targets }) => {
                info!(slave = %self.shared.identity.id, targets = targets.len(), "connecting to slaves");
                let links = targets
                    .into_iter()
                    .map(|target| Arc::clone(&self.shared).link_to(target));
                let results = join_all(links).await;
                Ok(ClusterResponse::ConnectToSlaves(ConnectToSlavesResponse {
                    results,
                }))
            }
        }
    }
}

/// Listening slave process endpoint.
pub struct SlaveServer {
    listener: TcpListener,
    shared: Arc<SlaveShared>,
}

/// Cloneable view of a running server, for inspection and shutdown.
#[derive(Clone)]
pub struct SlaveServerHandle {
    shared: Arc<SlaveShared>,
    local_addr: SocketAddr,
}

impl SlaveServer {
    /// Binds `listen_addr` and serves as the slave described by `identity`.
    pub async fn bind(identity: SlaveInfo, listen_addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self::with_listener(identity, listener))
    }

    /// Binds an OS-assigned port on `ip`; the identity carries the chosen
    /// port.
    pub async fn bind_ephemeral(id: &str, ip: IpAddr, shard_masks: Vec<ShardMask>) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, 0)).await?;
        let identity = SlaveInfo::new(id, listener.local_addr()?, shard_masks);
        Ok(Self::with_listener(identity, listener))
    }

    fn with_listener(identity: SlaveInfo, listener: TcpListener) -> Self {
        info!(slave = %identity.id, addr = %identity.addr(), "slave listening");
        let (stop, _) = watch::channel(None);
        Self {
            listener,
            shared: Arc::new(SlaveShared {
                identity,
                master: Mutex::new(None),
                peers: Mutex::new(HashMap::new()),
                stop,
                metrics: SlaveMetrics::default(),
            }),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> Result<SlaveServerHandle> {
        Ok(SlaveServerHandle {
            shared: Arc::clone(&self.shared),
            local_addr: self.local_addr()?,
        })
    }

    /// Accepts connections until the master link drops (error) or
    /// `SlaveServerHandle::shutdown` is called (success).
    pub async fn run(self) -> Result<()> {
        let mut stop_rx = self.shared.stop.subscribe();
        let outcome = loop {
            if let Some(reason) = stop_rx.borrow_and_update().clone() {
                break reason;
            }
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, addr) = accepted?;
                    let count = self.shared.metrics.connections_accepted.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(%addr, accepted = count, "accepted connection");
                    self.serve(socket);
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break StopReason::Requested;
                    }
                }
            }
        };

        self.close_links("slave stopping");
        match outcome {
            StopReason::Requested => Ok(()),
            StopReason::MasterLost(reason) => Err(ClusterError::ConnectionClosed(format!(
                "master connection lost: {}",
                reason
            ))),
        }
    }

    fn serve(&self, socket: tokio::net::TcpStream) {
        let shared = Arc::clone(&self.shared);
        let handler: Arc<dyn ClusterHandler> = Arc::new(SlaveService {
            shared: Arc::clone(&shared),
        });
        let label = socket
            .peer_addr()
            .map(|addr| format!("inbound {}", addr))
            .unwrap_or_else(|_| "inbound".to_string());
        let conn = Connection::from_tcp(
            socket,
            HandshakeSide::Acceptor,
            shared.hello(),
            handler,
            ConnectionOptions::new(label),
        );

        tokio::spawn(async move {
            if let Err(err) = conn.await_active().await {
                debug!(error = %err, "inbound handshake failed");
                return;
            }
            let Some(peer) = conn.peer_hello().cloned() else {
                return;
            };
            match peer.role {
                NodeRole::Master => {
                    if let Err(err) = shared.register_master(conn.clone()) {
                        conn.close(err.to_string());
                    }
                }
                NodeRole::Slave | NodeRole::Peer => shared.register_peer(peer.node_id, conn),
            }
        });
    }

    fn close_links(&self, reason: &str) {
        if let Some(master) = lock(&self.shared.master).take() {
            master.close(reason);
        }
        let peers: Vec<Connection> = lock(&self.shared.peers).drain().map(|(_, c)| c).collect();
        for peer in peers {
            peer.close(reason);
        }
    }
}

impl SlaveServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> &SlaveInfo {
        &self.shared.identity
    }

    /// Ids of peers with a live link, sorted.
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.peers)
            .iter()
            .filter(|(_, conn)| !conn.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn master_connected(&self) -> bool {
        lock(&self.shared.master)
            .as_ref()
            .is_some_and(|conn| conn.is_active())
    }

    /// Number of peers this slave dialed itself.
    pub fn peers_dialed(&self) -> u64 {
        self.shared.metrics.peers_dialed.load(Ordering::Relaxed)
    }

    /// Makes `run` return `Ok(())`.
    pub fn shutdown(&self) {
        self.shared.stop(StopReason::Requested);
    }

    /// `"ip:port"` key other slaves compare against when picking who dials.
    pub fn address_key(&self) -> String {
        address_key(&self.identity().addr())
    }
}
