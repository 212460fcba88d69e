//! A framed, bidirectional RPC connection between two cluster members.
//!
//! Each connection owns a reader task and a writer task. Outbound frames are
//! queued on an unbounded channel so notifications never wait for the peer.
//! Requests are correlated with responses through per-connection rpc ids and
//! oneshot channels.

use super::message::{ClusterNotification, ClusterRequest, ClusterResponse, Goodbye, Hello};
use super::wire::{ClusterOp, OpKind, RpcEnvelope, read_envelope};
use crate::core::{ClusterError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, debug, info, info_span, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Timed-out rpc ids remembered per connection; the lowest are forgotten first.
const MAX_ABANDONED: usize = 1024;

/// Which side of the handshake this end plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    /// Sends `Hello` immediately after the stream is up.
    Initiator,
    /// Waits for the peer's `Hello`, then answers with its own.
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Active,
    Closed,
}

/// Application callbacks for inbound traffic.
///
/// Every request variant must produce a response of the matching kind;
/// returning an error closes the connection.
#[async_trait]
pub trait ClusterHandler: Send + Sync + 'static {
    async fn on_request(&self, conn: &Connection, request: ClusterRequest) -> Result<ClusterResponse>;

    async fn on_notification(
        &self,
        _conn: &Connection,
        _notification: ClusterNotification,
    ) -> Result<()> {
        Ok(())
    }
}

/// Handler for connections that only issue requests.
pub struct RejectRequests;

#[async_trait]
impl ClusterHandler for RejectRequests {
    async fn on_request(&self, _conn: &Connection, request: ClusterRequest) -> Result<ClusterResponse> {
        Err(ClusterError::ProtocolViolation(format!(
            "unexpected request {:?}",
            request.op()
        )))
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Name used in logs.
    pub label: String,
    /// Per-request deadline; `None` waits until the connection closes.
    pub request_timeout: Option<Duration>,
}

impl ConnectionOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            request_timeout: None,
        }
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

struct PendingRequest {
    expected: ClusterOp,
    reply: oneshot::Sender<Result<ClusterResponse>>,
}

enum Outbound {
    Frame(Vec<u8>),
    /// Flush an optional final frame, then shut the stream down.
    Close(Option<Vec<u8>>),
}

struct Inner {
    id: u64,
    label: String,
    peer_addr: Option<SocketAddr>,
    local_hello: Hello,
    peer_hello: OnceLock<Hello>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    abandoned: Mutex<BTreeSet<u32>>,
    next_rpc_id: AtomicU32,
    state: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<String>>,
    request_timeout: Option<Duration>,
}

/// Cheaply cloneable handle to one connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Dials `addr` and starts the handshake as initiator.
    pub async fn connect(
        addr: SocketAddr,
        hello: Hello,
        handler: Arc<dyn ClusterHandler>,
        options: ConnectionOptions,
    ) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream, HandshakeSide::Initiator, hello, handler, options))
    }

    pub fn from_tcp(
        stream: TcpStream,
        side: HandshakeSide,
        hello: Hello,
        handler: Arc<dyn ClusterHandler>,
        options: ConnectionOptions,
    ) -> Connection {
        let _ = stream.set_nodelay(true);
        let peer_addr = stream.peer_addr().ok();
        Self::spawn_with_peer(stream, peer_addr, side, hello, handler, options)
    }

    /// Starts a connection over any byte stream. Must be called inside a
    /// tokio runtime.
    pub fn spawn<S>(
        stream: S,
        side: HandshakeSide,
        hello: Hello,
        handler: Arc<dyn ClusterHandler>,
        options: ConnectionOptions,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with_peer(stream, None, side, hello, handler, options)
    }

    fn spawn_with_peer<S>(
        stream: S,
        peer_addr: Option<SocketAddr>,
        side: HandshakeSide,
        hello: Hello,
        handler: Arc<dyn ClusterHandler>,
        options: ConnectionOptions,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Handshaking);

        let conn = Connection {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                label: options.label,
                peer_addr,
                local_hello: hello,
                peer_hello: OnceLock::new(),
                outbound,
                pending: Mutex::new(HashMap::new()),
                abandoned: Mutex::new(BTreeSet::new()),
                next_rpc_id: AtomicU32::new(1),
                state,
                close_reason: Mutex::new(None),
                request_timeout: options.request_timeout,
            }),
        };

        let span = info_span!("connection", id = conn.id(), label = %conn.label());

        if side == HandshakeSide::Initiator {
            if let Err(err) = conn.queue_hello() {
                conn.close(format!("failed to send hello: {}", err));
            }
        }

        tokio::spawn(write_loop(writer, outbound_rx).instrument(span.clone()));

        let reader_conn = conn.clone();
        tokio::spawn(
            async move {
                let mut reader = reader;
                let mut state_rx = reader_conn.inner.state.subscribe();
                let outcome = tokio::select! {
                    result = reader_conn.read_loop(&mut reader, side, handler) => result,
                    _ = wait_for_state(&mut state_rx, ConnectionState::Closed) => return,
                };
                let reason = match outcome {
                    Ok(()) => "stream closed by peer".to_string(),
                    Err(err) => err.to_string(),
                };
                reader_conn.close(reason);
            }
            .instrument(span),
        );

        conn
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// The peer's handshake message, once received.
    pub fn peer_hello(&self) -> Option<&Hello> {
        self.inner.peer_hello.get()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.inner.close_reason).clone()
    }

    fn closed_error(&self) -> ClusterError {
        ClusterError::ConnectionClosed(
            self.close_reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        )
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Waits until the handshake completes. Fails if the connection closes
    /// first.
    pub async fn await_active(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Active => return Ok(()),
                ConnectionState::Closed => return Err(self.closed_error()),
                ConnectionState::Handshaking => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    /// Resolves once the connection is closed, yielding the close reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.inner.state.subscribe();
        wait_for_state(&mut rx, ConnectionState::Closed).await;
        self.close_reason()
            .unwrap_or_else(|| "connection closed".to_string())
    }

    /// Closes the connection. Only the first call has any effect; it returns
    /// true for that call.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        {
            let mut slot = lock(&self.inner.close_reason);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.clone());
        }

        let previous = self.inner.state.send_replace(ConnectionState::Closed);

        let pending: Vec<PendingRequest> = lock(&self.inner.pending)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for request in pending {
            let _ = request
                .reply
                .send(Err(ClusterError::ConnectionClosed(reason.clone())));
        }

        let goodbye = if previous == ConnectionState::Active {
            let message = ClusterNotification::Goodbye(Goodbye {
                reason: reason.clone(),
            });
            message
                .encode_payload()
                .and_then(|payload| RpcEnvelope::notification(message.op(), payload).encode())
                .ok()
        } else {
            None
        };
        let _ = self.inner.outbound.send(Outbound::Close(goodbye));

        info!(connection = %self.label(), %reason, "connection closed");
        true
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Active => Ok(()),
            ConnectionState::Handshaking => Err(ClusterError::NotActive),
            ConnectionState::Closed => Err(self.closed_error()),
        }
    }

    fn send_frame(&self, envelope: RpcEnvelope) -> Result<()> {
        let frame = envelope.encode()?;
        self.inner
            .outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| self.closed_error())
    }

    fn queue_hello(&self) -> Result<()> {
        let hello = ClusterNotification::Hello(self.inner.local_hello.clone());
        self.send_frame(RpcEnvelope::notification(
            hello.op(),
            hello.encode_payload()?,
        ))
    }

    /// Queues a one-way message. Does not wait for the peer.
    pub fn send_notification(&self, notification: ClusterNotification) -> Result<()> {
        self.ensure_active()?;
        let payload = notification.encode_payload()?;
        self.send_frame(RpcEnvelope::notification(notification.op(), payload))
    }

    fn allocate_rpc_id(&self, pending: &HashMap<u32, PendingRequest>) -> u32 {
        loop {
            let id = self.inner.next_rpc_id.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Sends a request and waits for the matching response.
    pub async fn send_request(&self, request: ClusterRequest) -> Result<ClusterResponse> {
        self.ensure_active()?;
        let payload = request.encode_payload()?;

        let (reply, response) = oneshot::channel();
        let rpc_id = {
            let mut pending = lock(&self.inner.pending);
            let rpc_id = self.allocate_rpc_id(&pending);
            pending.insert(
                rpc_id,
                PendingRequest {
                    expected: request.response_op(),
                    reply,
                },
            );
            rpc_id
        };

        // close() may have drained the table before our insert
        if self.is_closed() {
            lock(&self.inner.pending).remove(&rpc_id);
            return Err(self.closed_error());
        }

        if let Err(err) = self.send_frame(RpcEnvelope::rpc(request.op(), rpc_id, payload)) {
            lock(&self.inner.pending).remove(&rpc_id);
            return Err(err);
        }

        let outcome = match self.inner.request_timeout {
            None => response.await,
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if lock(&self.inner.pending).remove(&rpc_id).is_some() {
                        self.abandon(rpc_id);
                    }
                    warn!(connection = %self.label(), rpc_id, "request timed out");
                    return Err(ClusterError::Timeout(limit));
                }
            },
        };
        outcome.unwrap_or_else(|_| Err(self.closed_error()))
    }

    fn abandon(&self, rpc_id: u32) {
        let mut abandoned = lock(&self.inner.abandoned);
        abandoned.insert(rpc_id);
        while abandoned.len() > MAX_ABANDONED {
            abandoned.pop_first();
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    async fn read_loop<R>(
        &self,
        reader: &mut R,
        side: HandshakeSide,
        handler: Arc<dyn ClusterHandler>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let first = read_envelope(reader).await?.ok_or_else(|| {
            ClusterError::ConnectionClosed("stream ended during handshake".to_string())
        })?;
        let peer_hello = match first.op {
            ClusterOp::Hello => match ClusterNotification::decode(first.op, &first.payload)? {
                ClusterNotification::Hello(hello) => hello,
                ClusterNotification::Goodbye(_) => {
                    return Err(ClusterError::ProtocolViolation(
                        "expected hello".to_string(),
                    ));
                }
            },
            other => {
                return Err(ClusterError::ProtocolViolation(format!(
                    "first frame must be Hello, got {:?}",
                    other
                )));
            }
        };

        if side == HandshakeSide::Acceptor {
            self.queue_hello()?;
        }
        debug!(role = %peer_hello.role, node_id = %peer_hello.node_id, "handshake complete");
        let _ = self.inner.peer_hello.set(peer_hello);
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Active;
                true
            } else {
                false
            }
        });

        while let Some(envelope) = read_envelope(reader).await? {
            self.dispatch(envelope, &handler)?;
        }
        Ok(())
    }

    fn dispatch(&self, envelope: RpcEnvelope, handler: &Arc<dyn ClusterHandler>) -> Result<()> {
        match envelope.op.kind() {
            OpKind::Notification => {
                let notification = ClusterNotification::decode(envelope.op, &envelope.payload)?;
                match &notification {
                    ClusterNotification::Hello(_) => {
                        return Err(ClusterError::ProtocolViolation(
                            "duplicate hello".to_string(),
                        ));
                    }
                    ClusterNotification::Goodbye(goodbye) => {
                        info!(connection = %self.label(), reason = %goodbye.reason, "peer said goodbye");
                    }
                }
                let conn = self.clone();
                let handler = Arc::clone(handler);
                tokio::spawn(async move {
                    if let Err(err) = handler.on_notification(&conn, notification).await {
                        conn.close(format!("notification handler failed: {}", err));
                    }
                });
            }
            OpKind::Request => {
                let rpc_id = envelope.rpc_id.ok_or_else(|| {
                    ClusterError::ProtocolViolation("request without rpc id".to_string())
                })?;
                let request = ClusterRequest::decode(envelope.op, &envelope.payload)?;
                let conn = self.clone();
                let handler = Arc::clone(handler);
                tokio::spawn(async move {
                    let expected = request.response_op();
                    let outcome = handler.on_request(&conn, request).await.and_then(|response| {
                        if response.op() != expected {
                            return Err(ClusterError::ProtocolViolation(format!(
                                "handler answered {:?} with {:?}",
                                expected,
                                response.op()
                            )));
                        }
                        let payload = response.encode_payload()?;
                        conn.send_frame(RpcEnvelope::rpc(response.op(), rpc_id, payload))
                    });
                    if let Err(err) = outcome {
                        if !conn.is_closed() {
                            warn!(connection = %conn.label(), rpc_id, error = %err, "request failed");
                            conn.close(
                                ClusterError::ProtocolViolation(format!(
                                    "request handler failed: {}",
                                    err
                                ))
                                .to_string(),
                            );
                        }
                    }
                });
            }
            OpKind::Response => {
                let rpc_id = envelope.rpc_id.ok_or_else(|| {
                    ClusterError::ProtocolViolation("response without rpc id".to_string())
                })?;
                let Some(pending) = lock(&self.inner.pending).remove(&rpc_id) else {
                    if lock(&self.inner.abandoned).remove(&rpc_id) {
                        debug!(rpc_id, "dropping late response");
                        return Ok(());
                    }
                    return Err(ClusterError::ProtocolViolation(format!(
                        "response for unknown rpc id {}",
                        rpc_id
                    )));
                };
                if pending.expected != envelope.op {
                    let err = ClusterError::ProtocolViolation(format!(
                        "expected {:?} for rpc id {}, got {:?}",
                        pending.expected, rpc_id, envelope.op
                    ));
                    let _ = pending.reply.send(Err(err.clone()));
                    return Err(err);
                }
                match ClusterResponse::decode(envelope.op, &envelope.payload) {
                    Ok(response) => {
                        let _ = pending.reply.send(Ok(response));
                    }
                    Err(err) => {
                        let _ = pending.reply.send(Err(err.clone()));
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    while *rx.borrow_and_update() != target {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(frame) => {
                if let Err(err) = writer.write_all(&frame).await {
                    debug!(error = %err, "write failed");
                    break;
                }
                if let Err(err) = writer.flush().await {
                    debug!(error = %err, "flush failed");
                    break;
                }
            }
            Outbound::Close(last) => {
                if let Some(frame) = last {
                    let _ = writer.write_all(&frame).await;
                }
                let _ = writer.flush().await;
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeRole;
    use crate::protocol::message::{Ping, PingResponse};
    use crate::protocol::wire::write_envelope;
    use tokio::io::duplex;

    struct EchoIdentity;

    #[async_trait]
    impl ClusterHandler for EchoIdentity {
        async fn on_request(&self, _conn: &Connection, request: ClusterRequest) -> Result<ClusterResponse> {
            match request {
                ClusterRequest::Ping(_) => Ok(ClusterResponse::Ping(PingResponse {
                    id: "S0".to_string(),
                    shard_masks: vec![],
                })),
                ClusterRequest::ConnectToSlaves(_) => Err(ClusterError::ProtocolViolation(
                    "not a slave".to_string(),
                )),
            }
        }
    }

    fn pair() -> (Connection, Connection) {
        let (a, b) = duplex(64 * 1024);
        let master = Connection::spawn(
            a,
            HandshakeSide::Initiator,
            Hello::new(NodeRole::Master, "master"),
            Arc::new(RejectRequests),
            ConnectionOptions::new("to-slave"),
        );
        let slave = Connection::spawn(
            b,
            HandshakeSide::Acceptor,
            Hello::new(NodeRole::Slave, "S0"),
            Arc::new(EchoIdentity),
            ConnectionOptions::new("to-master"),
        );
        (master, slave)
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let (master, slave) = pair();
        master.await_active().await.unwrap();
        slave.await_active().await.unwrap();
        assert_eq!(master.peer_hello().unwrap().node_id, "S0");
        assert_eq!(slave.peer_hello().unwrap().role, NodeRole::Master);

        let response = master
            .send_request(ClusterRequest::Ping(Ping::default()))
            .await
            .unwrap()
            .into_ping()
            .unwrap();
        assert_eq!(response.id, "S0");
    }

    #[tokio::test]
    async fn test_send_before_handshake_is_not_active() {
        let (a, _b) = duplex(1024);
        let conn = Connection::spawn(
            a,
            HandshakeSide::Initiator,
            Hello::new(NodeRole::Master, "master"),
            Arc::new(RejectRequests),
            ConnectionOptions::new("lonely"),
        );
        let err = conn
            .send_request(ClusterRequest::Ping(Ping::default()))
            .await
            .unwrap_err();
        assert_eq!(err, ClusterError::NotActive);
        let goodbye = ClusterNotification::Goodbye(Goodbye {
            reason: "x".to_string(),
        });
        assert_eq!(conn.send_notification(goodbye), Err(ClusterError::NotActive));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_propagates() {
        let (master, slave) = pair();
        master.await_active().await.unwrap();
        slave.await_active().await.unwrap();

        assert!(master.close("operator stop"));
        assert!(!master.close("second"));
        assert_eq!(master.closed().await, "operator stop");

        // peer sees the stream end
        slave.closed().await;
        assert!(slave.is_closed());
        let err = master
            .send_request(ClusterRequest::Ping(Ping::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_pending_request_fails_on_close() {
        let (a, b) = duplex(64 * 1024);
        let conn = Connection::spawn(
            a,
            HandshakeSide::Initiator,
            Hello::new(NodeRole::Master, "master"),
            Arc::new(RejectRequests),
            ConnectionOptions::new("to-silent"),
        );

        // peer completes the handshake and then never answers
        let (mut peer_read, mut peer_write) = tokio::io::split(b);
        let hello = read_envelope(&mut peer_read).await.unwrap().unwrap();
        assert_eq!(hello.op, ClusterOp::Hello);
        let reply = ClusterNotification::Hello(Hello::new(NodeRole::Slave, "S0"));
        write_envelope(
            &mut peer_write,
            &RpcEnvelope::notification(reply.op(), reply.encode_payload().unwrap()),
        )
        .await
        .unwrap();
        conn.await_active().await.unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send_request(ClusterRequest::Ping(Ping::default())).await })
        };
        let request = read_envelope(&mut peer_read).await.unwrap().unwrap();
        assert_eq!(request.op, ClusterOp::PingRequest);

        conn.close("shutting down");
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, ClusterError::ConnectionClosed("shutting down".to_string()));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (a, b) = duplex(64 * 1024);
        let conn = Connection::spawn(
            a,
            HandshakeSide::Initiator,
            Hello::new(NodeRole::Master, "master"),
            Arc::new(RejectRequests),
            ConnectionOptions::new("slow").request_timeout(Some(Duration::from_millis(50))),
        );
        let (mut peer_read, mut peer_write) = tokio::io::split(b);
        read_envelope(&mut peer_read).await.unwrap().unwrap();
        let reply = ClusterNotification::Hello(Hello::new(NodeRole::Slave, "S0"));
        write_envelope(
            &mut peer_write,
            &RpcEnvelope::notification(reply.op(), reply.encode_payload().unwrap()),
        )
        .await
        .unwrap();
        conn.await_active().await.unwrap();

        let err = conn
            .send_request(ClusterRequest::Ping(Ping::default()))
            .await
            .unwrap_err();
        assert_eq!(err, ClusterError::Timeout(Duration::from_millis(50)));

        // a late answer is tolerated
        let request = read_envelope(&mut peer_read).await.unwrap().unwrap();
        let late = ClusterResponse::Ping(PingResponse {
            id: "S0".to_string(),
            shard_masks: vec![],
        });
        write_envelope(
            &mut peer_write,
            &RpcEnvelope::rpc(
                late.op(),
                request.rpc_id.unwrap(),
                late.encode_payload().unwrap(),
            ),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.is_active());
    }

    /// Brings a connection up against a hand-driven peer stream.
    async fn raw_peer() -> (
        Connection,
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (a, b) = duplex(64 * 1024);
        let conn = Connection::spawn(
            a,
            HandshakeSide::Initiator,
            Hello::new(NodeRole::Master, "master"),
            Arc::new(RejectRequests),
            ConnectionOptions::new("to-raw"),
        );
        let (mut peer_read, mut peer_write) = tokio::io::split(b);
        read_envelope(&mut peer_read).await.unwrap().unwrap();
        let reply = ClusterNotification::Hello(Hello::new(NodeRole::Slave, "S0"));
        write_envelope(
            &mut peer_write,
            &RpcEnvelope::notification(reply.op(), reply.encode_payload().unwrap()),
        )
        .await
        .unwrap();
        conn.await_active().await.unwrap();
        (conn, peer_read, peer_write)
    }

    async fn closed_reason(conn: &Connection) -> String {
        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_response_for_unknown_rpc_id_closes() {
        let (conn, _peer_read, mut peer_write) = raw_peer().await;
        let stray = ClusterResponse::Ping(PingResponse {
            id: "S0".to_string(),
            shard_masks: vec![],
        });
        write_envelope(
            &mut peer_write,
            &RpcEnvelope::rpc(stray.op(), 999, stray.encode_payload().unwrap()),
        )
        .await
        .unwrap();

        let reason = closed_reason(&conn).await;
        assert!(reason.starts_with("Protocol violation"), "{reason}");
        assert!(reason.contains("999"));
    }

    #[tokio::test]
    async fn test_unknown_opcode_closes() {
        let (conn, _peer_read, mut peer_write) = raw_peer().await;
        peer_write.write_all(&[0, 0, 0, 1, 200]).await.unwrap();

        let reason = closed_reason(&conn).await;
        assert!(reason.contains("unknown opcode 200"), "{reason}");
    }

    #[tokio::test]
    async fn test_second_hello_closes() {
        let (conn, mut peer_read, mut peer_write) = raw_peer().await;
        let again = ClusterNotification::Hello(Hello::new(NodeRole::Slave, "S0"));
        write_envelope(
            &mut peer_write,
            &RpcEnvelope::notification(again.op(), again.encode_payload().unwrap()),
        )
        .await
        .unwrap();

        let reason = closed_reason(&conn).await;
        assert!(reason.contains("duplicate hello"), "{reason}");

        // the peer is told why
        let goodbye = read_envelope(&mut peer_read).await.unwrap().unwrap();
        assert_eq!(goodbye.op, ClusterOp::Goodbye);
    }

    #[tokio::test]
    async fn test_malformed_payload_closes() {
        let (conn, _peer_read, mut peer_write) = raw_peer().await;
        write_envelope(
            &mut peer_write,
            &RpcEnvelope::notification(ClusterOp::Goodbye, vec![0xc1, 0x00]),
        )
        .await
        .unwrap();

        let reason = closed_reason(&conn).await;
        assert!(reason.starts_with("Protocol violation"), "{reason}");
        assert!(reason.contains("malformed"));
    }

    #[tokio::test]
    async fn test_abandoned_ids_are_bounded() {
        let (conn, _peer_read, _peer_write) = raw_peer().await;
        for rpc_id in 0..(MAX_ABANDONED as u32 + 10) {
            conn.abandon(rpc_id);
        }
        let abandoned = lock(&conn.inner.abandoned);
        assert_eq!(abandoned.len(), MAX_ABANDONED);
        assert_eq!(abandoned.first(), Some(&10));
    }
}
