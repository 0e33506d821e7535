use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;
use crate::completion::{Completion, Delivery, FragmentTracker};
use crate::config::TransportConfig;
use crate::connection::{ConnectFlags, Connection, ConnectionState, InterfaceContext};
use crate::error::{DisconnectReason, TransportError};
use crate::handshake::HandshakeRequest;
use crate::identity::{Identity, PublicKey};
use crate::listener::{ListenerRegistry, MessageListener};
use crate::packet::{ConnectionId, Packet, PacketBody, Segment, SegmentId};
use crate::peer_addr::PeerAddress;
use crate::rate_limiter::RateLimiter;
use crate::segments::{split_payload, UnreliableReassembler};
use crate::send_pipeline::{OutgoingDatagram, SendPipeline};

/// The receiving half of the interface's socket, abstracted away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiveSocket: Send + Sync + 'static {
    async fn do_recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl ReceiveSocket for Arc<UdpSocket> {
    async fn do_recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Errors that concern a single datagram, e.g. an ICMP 'port unreachable' for an earlier send
///  that some platforms report on the next receive. Everything else means the socket is unusable.
fn is_transient_receive_error(e: &std::io::Error) -> bool {
    matches!(e.kind(),
        ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
    )
}

/// Stops the interface's tasks. It is triggered by [NetworkInterface::shutdown], by dropping the
///  interface, or by the receive loop when the socket fails.
struct ShutdownSignal {
    triggered: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    fn new() -> (Arc<ShutdownSignal>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let signal = ShutdownSignal {
            triggered: AtomicBool::new(false),
            tx,
        };
        (Arc::new(signal), rx)
    }

    fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// returns `false` if the signal was triggered before
    fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }
}

/// Application code's reference to a connection. Cloning it is cheap, and dropping it does not
///  close the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<Connection>,
}

impl ConnectionHandle {
    /// Sends a message reliably. Higher `priority` values go on the wire first.
    pub fn send(&self, payload: Bytes, priority: i32) -> Delivery {
        self.connection.send(payload, priority)
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn peer(&self) -> PeerAddress {
        self.connection.peer()
    }

    /// the peer's verified public key, once the handshake completed
    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.connection.remote_public_key()
    }
}

/// The result of [NetworkInterface::connect]: `connected` resolves once, when the handshake
///  succeeded or failed, and `disconnected` resolves once, when the connection terminates.
pub struct PendingConnection {
    pub handle: ConnectionHandle,
    pub connected: Completion,
    pub disconnected: oneshot::Receiver<DisconnectReason>,
}

#[derive(Default)]
struct ConnectionTable {
    by_id: FxHashMap<ConnectionId, Arc<Connection>>,
    by_peer: FxHashMap<PeerAddress, ConnectionId>,
}

impl ConnectionTable {
    fn get_by_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.by_id.get(&id).cloned()
    }

    fn get_by_peer(&self, peer: PeerAddress) -> Option<Arc<Connection>> {
        self.by_peer.get(&peer)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    /// NB: A previous connection to the same peer stays reachable by id until it is swept
    fn insert(&mut self, connection: Arc<Connection>) {
        self.by_peer.insert(connection.peer(), connection.local_id());
        self.by_id.insert(connection.local_id(), connection);
    }

    fn sweep_disconnected(&mut self) {
        self.by_id.retain(|id, connection| {
            let keep = !connection.is_disconnected();
            if !keep {
                trace!("removing connection {} from the connection table", id);
            }
            keep
        });
        let by_id = &self.by_id;
        self.by_peer.retain(|_, id| by_id.contains_key(id));
    }

    fn all(&self) -> Vec<Arc<Connection>> {
        self.by_id.values().cloned().collect()
    }
}

/// NetworkInterface is the place where all other parts of the transport come together: It owns
///  a UDP socket and the identity it presents to peers, dispatches incoming packets to their
///  connections or to the unreliable listeners, and has an API for application code to send
///  messages and open connections.
///
/// Three tasks run for each interface: the receive loop, the timer loop, and the send pipeline.
///  They stop on [NetworkInterface::shutdown] (or when the interface is dropped, or when the
///  socket fails), and the socket is released once they are done.
pub struct NetworkInterface {
    ctx: Arc<InterfaceContext>,
    connections: Arc<RwLock<ConnectionTable>>,
    local_addr: SocketAddr,
    next_unreliable_seq: AtomicU32,
    shutdown: Arc<ShutdownSignal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkInterface {
    pub async fn open(config: TransportConfig, identity: Arc<Identity>) -> Result<NetworkInterface, TransportError> {
        config.validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        let bind_addr = config.bind_addr();
        let bind_error = |e: std::io::Error| TransportError::Bind { addr: bind_addr, message: e.to_string() };

        let socket = Arc::new(UdpSocket::bind(bind_addr).await.map_err(bind_error)?);
        let local_addr = socket.local_addr().map_err(bind_error)?;
        info!("bound UDP socket to {:?} with public key {:?}", local_addr, identity.public_key());

        let config = Arc::new(config);
        let (shutdown, shutdown_rx) = ShutdownSignal::new();

        let limiter = RateLimiter::new(config.max_upstream_bytes_per_second, config.effective_datagram_size(), Instant::now());
        let (pipeline, pipeline_task) = SendPipeline::spawn(Arc::new(socket.clone()), limiter, shutdown_rx.clone());

        let ctx = Arc::new(InterfaceContext {
            config: config.clone(),
            identity,
            pipeline,
            listeners: ListenerRegistry::default(),
        });
        let connections: Arc<RwLock<ConnectionTable>> = Default::default();
        let unreliable: Arc<Mutex<UnreliableReassembler>> = Default::default();

        let recv_task = tokio::spawn(Self::recv_loop(
            ctx.clone(),
            connections.clone(),
            unreliable.clone(),
            Arc::new(socket),
            shutdown.clone(),
            shutdown_rx.clone(),
        ));
        let timer_task = tokio::spawn(Self::timer_loop(
            config,
            connections.clone(),
            unreliable,
            shutdown_rx,
        ));

        Ok(NetworkInterface {
            ctx,
            connections,
            local_addr,
            // a random start avoids clashing with a previous incarnation's messages in peers' duplicate detection
            next_unreliable_seq: AtomicU32::new(rand::random()),
            shutdown,
            tasks: Mutex::new(vec![recv_task, timer_task, pipeline_task]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_key(&self) -> PublicKey {
        self.ctx.identity.public_key()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Sends a payload without acknowledgement or retransmission, fragmenting it if it does not
    ///  fit into a single datagram. The completion resolves when all fragments were handed to the
    ///  socket - that says nothing about their arrival.
    pub fn send_to(&self, to: PeerAddress, payload: Bytes, priority: i32) -> Completion {
        if self.is_shutting_down() {
            return Completion::resolved(Err(TransportError::Shutdown));
        }

        let chunks = match split_payload(&payload, self.ctx.config.max_segment_payload()) {
            Ok(chunks) => chunks,
            Err(e) => {
                debug!("unreliable message for {:?} rejected: {}", to, e);
                return Completion::resolved(Err(e));
            }
        };

        let message_seq = self.next_unreliable_seq.fetch_add(1, Ordering::Relaxed);
        let count = chunks.len() as u16;
        trace!("sending unreliable message {} to {:?} in {} fragments", message_seq, to, count);

        let (tx, completion) = Completion::new();
        let tracker = Arc::new(FragmentTracker::new(chunks.len(), tx));
        for (index, chunk) in chunks.into_iter().enumerate() {
            let packet = Packet::new(ConnectionId::NONE, PacketBody::Unreliable(Segment {
                id: SegmentId::new(message_seq, index as u16),
                count,
                payload: chunk,
            }));

            let fragment_tracker = tracker.clone();
            let datagram = OutgoingDatagram {
                to: to.socket_addr(),
                buf: packet.ser(),
                priority,
                on_sent: Some(Box::new(move |result| fragment_tracker.on_fragment(result))),
            };
            if !self.ctx.pipeline.enqueue(datagram) {
                tracker.on_fragment(Err(TransportError::Shutdown));
                break;
            }
        }
        completion
    }

    /// Adds a listener for unreliable messages, and for reliable messages on connections that
    ///  were opened by peers and have no listener of their own
    pub fn register_listener(&self, listener: Arc<dyn MessageListener>) {
        self.ctx.listeners.register(listener);
    }

    /// Opens a reliable connection to a peer. If `expected_public_key` is given, the handshake
    ///  fails unless the peer proves to own that key.
    ///
    /// An existing connection that the peer opened is taken over rather than replaced; any other
    ///  existing connection to the peer is closed, and a fresh handshake starts.
    pub fn connect(
        &self,
        peer: PeerAddress,
        expected_public_key: Option<PublicKey>,
        listener: Option<Arc<dyn MessageListener>>,
        flags: ConnectFlags,
    ) -> PendingConnection {
        let now = Instant::now();

        let mut connections = self.connections.write();
        // NB: checked under the table lock - shutdown terminates the table's connections after
        //      setting the flag, so a connection inserted here is either seen there or not created
        if self.is_shutting_down() {
            let (connection, (connected, disconnected)) = Connection::failed(self.ctx.clone(), peer, DisconnectReason::Shutdown, now);
            return PendingConnection { handle: ConnectionHandle { connection }, connected, disconnected };
        }

        if let Some(existing) = connections.get_by_peer(peer) {
            if let Some((connected, disconnected)) = existing.adopt(expected_public_key, listener.clone(), flags, now) {
                return PendingConnection { handle: ConnectionHandle { connection: existing }, connected, disconnected };
            }
            existing.close_with(DisconnectReason::Replaced);
        }

        let (connection, (connected, disconnected)) = Connection::connect(self.ctx.clone(), peer, expected_public_key, listener, flags, now);
        connections.insert(connection.clone());
        PendingConnection { handle: ConnectionHandle { connection }, connected, disconnected }
    }

    /// Stops all activity: new work is rejected, every pending connect and send fails, and the
    ///  background tasks are joined, which releases the socket.
    ///
    /// If the socket failed before, the interface is already shut down apart from joining the
    ///  tasks.
    pub async fn shutdown(&self) {
        if self.shutdown.trigger() {
            info!("shutting down network interface on {:?}", self.local_addr);
        }
        Self::terminate_all(&self.connections);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("background task failed: {}", e);
            }
        }
        info!("network interface on {:?} shut down", self.local_addr);
    }

    fn terminate_all(connections: &RwLock<ConnectionTable>) {
        let all = connections.read().all();
        for connection in all {
            connection.terminate_with(DisconnectReason::Shutdown);
        }
        connections.write().sweep_disconnected();
    }

    async fn recv_loop(
        ctx: Arc<InterfaceContext>,
        connections: Arc<RwLock<ConnectionTable>>,
        unreliable: Arc<Mutex<UnreliableReassembler>>,
        socket: Arc<dyn ReceiveSocket>,
        shutdown: Arc<ShutdownSignal>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("starting receive loop");

        let mut buf = vec![0u8; TransportConfig::MAX_UDP_PAYLOAD];
        loop {
            let (num_read, from) = tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = socket.do_recv_from(&mut buf) => match received {
                    Ok(x) => x,
                    Err(e) if is_transient_receive_error(&e) => {
                        debug!("receive error for a single datagram: {}", e);
                        continue;
                    }
                    Err(e) => {
                        error!("socket failed: {} - shutting down", e);
                        shutdown.trigger();
                        Self::terminate_all(&connections);
                        break;
                    }
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            span.in_scope(|| {
                Self::on_datagram(&ctx, &connections, &unreliable, from, Bytes::copy_from_slice(&buf[..num_read]));
            });
        }
        info!("receive loop terminated");
    }

    fn on_datagram(
        ctx: &Arc<InterfaceContext>,
        connections: &RwLock<ConnectionTable>,
        unreliable: &Mutex<UnreliableReassembler>,
        from: SocketAddr,
        buf: Bytes,
    ) {
        let peer = PeerAddress::from(from);
        trace!("received packet from {:?}: {} bytes", peer, buf.len());

        let packet = match Packet::deser(buf) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("received unparsable packet from {:?}: {} - dropping", peer, e);
                return;
            }
        };
        let now = Instant::now();

        match packet.body {
            PacketBody::HandshakeRequest(request) => {
                Self::on_handshake_request(ctx, connections, peer, request, now);
            }
            PacketBody::Unreliable(segment) => {
                let completed = unreliable.lock().on_segment(peer, &segment, now);
                if let Some(payload) = completed {
                    ctx.listeners.dispatch(peer, payload);
                }
            }
            body => {
                let Some(connection) = connections.read().get_by_id(packet.connection_id) else {
                    debug!("packet from {:?} for unknown connection {} - dropping", peer, packet.connection_id);
                    return;
                };
                if connection.peer() != peer {
                    debug!("packet for connection {} from {:?}, but the connection is with {:?} - dropping", packet.connection_id, peer, connection.peer());
                    return;
                }

                match body {
                    PacketBody::HandshakeAccept(accept) => connection.on_handshake_accept(&accept, now),
                    PacketBody::Data { segment, lowest_pending } => connection.on_data(segment, lowest_pending, now),
                    PacketBody::Ack(segment_id) => connection.on_ack(segment_id, now),
                    PacketBody::Termination => connection.on_termination(),
                    PacketBody::Keepalive => connection.on_keepalive(now),
                    PacketBody::HandshakeRequest(_) | PacketBody::Unreliable(_) => {}
                }
            }
        }
    }

    fn on_handshake_request(
        ctx: &Arc<InterfaceContext>,
        connections: &RwLock<ConnectionTable>,
        peer: PeerAddress,
        request: HandshakeRequest,
        now: Instant,
    ) {
        if !request.is_authentic() {
            warn!("handshake request from {:?} with invalid signature - dropping", peer);
            return;
        }

        let mut connections = connections.write();
        if let Some(existing) = connections.get_by_peer(peer) {
            if existing.on_handshake_request(&request, now) {
                return;
            }
        }

        let connection = Connection::accept_passive(ctx.clone(), peer, &request, now);
        connections.insert(connection);
    }

    async fn timer_loop(
        config: Arc<TransportConfig>,
        connections: Arc<RwLock<ConnectionTable>>,
        unreliable: Arc<Mutex<UnreliableReassembler>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("starting timer loop");

        let mut interval = tokio::time::interval(config.timer_tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            let all = connections.read().all();
            for connection in all {
                connection.poll_timers(now);
            }
            connections.write().sweep_disconnected();
            unreliable.lock().expire(now, config.reassembly_timeout);
        }
        info!("timer loop terminated");
    }
}

impl Drop for NetworkInterface {
    fn drop(&mut self) {
        if self.shutdown.trigger() {
            debug!("network interface on {:?} dropped without shutdown", self.local_addr);
            Self::terminate_all(&self.connections);
        }
    }
}
