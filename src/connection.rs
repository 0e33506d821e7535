use std::sync::{Arc, Weak};
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::channel::{OutgoingSegment, ReliableChannel};
use crate::completion::{Completion, CompletionSender, Delivery};
use crate::config::TransportConfig;
use crate::error::{DisconnectReason, TransportError};
use crate::handshake::{HandshakeAccept, HandshakeRequest};
use crate::identity::{Identity, PublicKey};
use crate::listener::{dispatch_to, ListenerRegistry, MessageListener};
use crate::packet::{ConnectionId, Packet, PacketBody, Segment, SegmentId};
use crate::peer_addr::PeerAddress;
use crate::send_pipeline::{OutgoingDatagram, SendPipeline, SentCallback};

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct ConnectFlags: u8 {
        /// send a keepalive packet whenever the connection was idle for the keepalive interval
        const KEEP_ALIVE = 0b0000_0001;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// terminal
    Disconnected(DisconnectReason),
}

/// The parts of a network interface that its connections share
pub struct InterfaceContext {
    pub config: Arc<TransportConfig>,
    pub identity: Arc<Identity>,
    pub pipeline: SendPipeline,
    pub listeners: ListenerRegistry,
}

/// Completions for the application code that opened a connection
pub type OwnerNotifications = (Completion, oneshot::Receiver<DisconnectReason>);

/// One reliable session with a peer, from handshake to termination.
///
/// A connection is either *owned*, i.e. opened by a local `connect` call that is notified of
///  connect / disconnect and may have a listener of its own, or *passive*, i.e. created when a peer's
///  handshake request arrived. Messages of passive connections go to the interface's listeners;
///  a later local `connect` to the same peer adopts the passive connection.
///
/// All mutable state is behind a single mutex, so the receive loop, the timer loop and send
///  pipeline callbacks never work on a connection concurrently. The lock is never held across
///  an `.await`.
pub struct Connection {
    local_id: ConnectionId,
    peer: PeerAddress,
    ctx: Arc<InterfaceContext>,
    myself: Weak<Connection>,
    inner: Mutex<ConnectionInner>,
}

struct ConnectionInner {
    state: ConnectionState,
    /// [ConnectionId::NONE] until the handshake completes, never changes after that
    remote_id: ConnectionId,
    remote_public_key: Option<PublicKey>,
    expected_public_key: Option<PublicKey>,
    flags: ConnectFlags,
    owned: bool,
    listener: Option<Arc<dyn MessageListener>>,
    connected_tx: Option<CompletionSender>,
    disconnected_tx: Option<oneshot::Sender<DisconnectReason>>,

    channel: ReliableChannel,

    handshake_attempts: u32,
    next_handshake_at: Instant,
    last_received: Instant,
    last_sent: Instant,
}

impl ConnectionInner {
    fn new(config: &TransportConfig, state: ConnectionState, now: Instant) -> ConnectionInner {
        ConnectionInner {
            state,
            remote_id: ConnectionId::NONE,
            remote_public_key: None,
            expected_public_key: None,
            flags: ConnectFlags::empty(),
            owned: false,
            listener: None,
            connected_tx: None,
            disconnected_tx: None,
            channel: ReliableChannel::new(config),
            handshake_attempts: 0,
            next_handshake_at: now,
            last_received: now,
            last_sent: now,
        }
    }

    fn is_expected_key(&self, key: &PublicKey) -> bool {
        match &self.expected_public_key {
            Some(expected) => expected == key,
            None => true,
        }
    }

    fn attach_owner(&mut self, listener: Option<Arc<dyn MessageListener>>, flags: ConnectFlags) -> OwnerNotifications {
        let (connected_tx, connected) = Completion::new();
        let (disconnected_tx, disconnected) = oneshot::channel();
        self.owned = true;
        self.listener = listener;
        self.flags = flags;
        self.connected_tx = Some(connected_tx);
        self.disconnected_tx = Some(disconnected_tx);
        (connected, disconnected)
    }
}

impl Connection {
    /// Starts a handshake with a peer, sending the first handshake request right away
    pub fn connect(
        ctx: Arc<InterfaceContext>,
        peer: PeerAddress,
        expected_public_key: Option<PublicKey>,
        listener: Option<Arc<dyn MessageListener>>,
        flags: ConnectFlags,
        now: Instant,
    ) -> (Arc<Connection>, OwnerNotifications) {
        let mut inner = ConnectionInner::new(&ctx.config, ConnectionState::Connecting, now);
        inner.expected_public_key = expected_public_key;
        let notifications = inner.attach_owner(listener, flags);

        let connection = Self::create(ctx, peer, inner);
        debug!("connection {} to {:?}: starting handshake", connection.local_id, peer);
        {
            let mut inner = connection.inner.lock();
            connection.poll_handshake(&mut inner, now);
        }
        (connection, notifications)
    }

    /// Accepts a peer's handshake request. The request's signature must have been verified
    ///  by the caller.
    pub fn accept_passive(ctx: Arc<InterfaceContext>, peer: PeerAddress, request: &HandshakeRequest, now: Instant) -> Arc<Connection> {
        let mut inner = ConnectionInner::new(&ctx.config, ConnectionState::Connected, now);
        inner.remote_id = request.initiator_id;
        inner.remote_public_key = Some(request.public_key);

        let connection = Self::create(ctx, peer, inner);
        debug!("connection {} to {:?}: accepted handshake request {}", connection.local_id, peer, request.initiator_id);
        {
            let mut inner = connection.inner.lock();
            connection.send_accept(&mut inner, request.initiator_id, now);
        }
        connection
    }

    /// An owned connection that is terminated from the start, without any packets sent
    pub fn failed(ctx: Arc<InterfaceContext>, peer: PeerAddress, reason: DisconnectReason, now: Instant) -> (Arc<Connection>, OwnerNotifications) {
        let mut inner = ConnectionInner::new(&ctx.config, ConnectionState::Connecting, now);
        let notifications = inner.attach_owner(None, ConnectFlags::empty());

        let connection = Self::create(ctx, peer, inner);
        connection.terminate_with(reason);
        (connection, notifications)
    }

    fn create(ctx: Arc<InterfaceContext>, peer: PeerAddress, inner: ConnectionInner) -> Arc<Connection> {
        Arc::new_cyclic(|myself| Connection {
            local_id: ConnectionId::random(),
            peer,
            ctx,
            myself: myself.clone(),
            inner: Mutex::new(inner),
        })
    }

    pub fn local_id(&self) -> ConnectionId {
        self.local_id
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.state(), ConnectionState::Disconnected(_))
    }

    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.inner.lock().remote_public_key
    }

    #[cfg(test)]
    pub(crate) fn remote_id(&self) -> ConnectionId {
        self.inner.lock().remote_id
    }

    #[cfg(test)]
    pub(crate) fn skip_to_message_seq(&self, message_seq: u32) {
        self.inner.lock().channel.skip_to_message_seq(message_seq);
    }

    /// Makes a passive connection owned by a local `connect` call. Returns `None` if the connection
    ///  can not be adopted because it already has an owner or is not connected.
    pub fn adopt(
        &self,
        expected_public_key: Option<PublicKey>,
        listener: Option<Arc<dyn MessageListener>>,
        flags: ConnectFlags,
        now: Instant,
    ) -> Option<OwnerNotifications> {
        let mut inner = self.inner.lock();
        if inner.owned || inner.state != ConnectionState::Connected {
            return None;
        }

        inner.expected_public_key = expected_public_key;
        let notifications = inner.attach_owner(listener, flags);

        let key_matches = match &inner.remote_public_key {
            Some(key) => inner.is_expected_key(key),
            None => false,
        };
        if key_matches {
            debug!("connection {} to {:?}: adopted by local connect", self.local_id, self.peer);
            if let Some(tx) = inner.connected_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
        else {
            warn!("connection {} to {:?}: peer's public key {:?} is not the expected key {:?}", self.local_id, self.peer, inner.remote_public_key, expected_public_key);
            self.send_termination(&mut inner, now);
            self.terminate(&mut inner, DisconnectReason::AuthenticationFailed);
        }
        Some(notifications)
    }

    /// Handles a handshake request with a verified signature. Returns `false` if the request
    ///  does not belong to this connection, i.e. it is for a new session with the peer.
    #[must_use]
    pub fn on_handshake_request(&self, request: &HandshakeRequest, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connecting => {
                if !inner.is_expected_key(&request.public_key) {
                    warn!("connection {} to {:?}: handshake request with unexpected public key {:?}", self.local_id, self.peer, request.public_key);
                    self.send_packet(&mut inner, request.initiator_id, PacketBody::Termination, now);
                    self.terminate(&mut inner, DisconnectReason::AuthenticationFailed);
                    return true;
                }

                debug!("connection {} to {:?}: simultaneous open with {}", self.local_id, self.peer, request.initiator_id);
                inner.remote_id = request.initiator_id;
                inner.remote_public_key = Some(request.public_key);
                self.send_accept(&mut inner, request.initiator_id, now);
                self.on_connected(&mut inner, now);
                true
            }
            ConnectionState::Connected => {
                if request.initiator_id == inner.remote_id {
                    // the peer did not get our acceptance
                    trace!("connection {}: repeated handshake request - accepting again", self.local_id);
                    inner.last_received = now;
                    self.send_accept(&mut inner, request.initiator_id, now);
                    return true;
                }
                if inner.owned && !inner.is_expected_key(&request.public_key) {
                    warn!("connection {} to {:?}: ignoring handshake request with unexpected public key {:?}", self.local_id, self.peer, request.public_key);
                    return true;
                }

                debug!("connection {} to {:?}: peer started a new session {} - replacing", self.local_id, self.peer, request.initiator_id);
                self.terminate(&mut inner, DisconnectReason::Replaced);
                false
            }
            ConnectionState::Disconnected(_) => false,
        }
    }

    pub fn on_handshake_accept(&self, accept: &HandshakeAccept, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connecting => {
                if !accept.is_authentic(self.local_id) {
                    warn!("connection {} to {:?}: handshake acceptance with invalid signature - dropping", self.local_id, self.peer);
                    return;
                }
                if !inner.is_expected_key(&accept.public_key) {
                    warn!("connection {} to {:?}: peer's public key {:?} is not the expected key {:?}", self.local_id, self.peer, accept.public_key, inner.expected_public_key);
                    self.send_packet(&mut inner, accept.acceptor_id, PacketBody::Termination, now);
                    self.terminate(&mut inner, DisconnectReason::AuthenticationFailed);
                    return;
                }

                inner.remote_id = accept.acceptor_id;
                inner.remote_public_key = Some(accept.public_key);
                self.on_connected(&mut inner, now);
            }
            ConnectionState::Connected => {
                inner.last_received = now;
                if accept.acceptor_id != inner.remote_id {
                    debug!("connection {}: handshake acceptance for remote id {} although connected to {} - ignoring", self.local_id, accept.acceptor_id, inner.remote_id);
                }
            }
            ConnectionState::Disconnected(_) => {}
        }
    }

    pub fn on_data(&self, segment: Segment, lowest_pending: u32, now: Instant) {
        let (payload, listener) = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connected {
                trace!("connection {}: data segment while not connected - dropping", self.local_id);
                return;
            }
            inner.last_received = now;

            let outcome = inner.channel.on_data(&segment, lowest_pending, now);
            if outcome.ack {
                let remote_id = inner.remote_id;
                self.send_packet(&mut inner, remote_id, PacketBody::Ack(segment.id), now);
            }
            match outcome.delivered {
                Some(payload) => (payload, inner.listener.clone()),
                None => return,
            }
        };

        trace!("connection {}: delivering message of {} bytes", self.local_id, payload.len());
        match listener {
            Some(listener) => dispatch_to(&listener, self.peer, payload),
            None => self.ctx.listeners.dispatch(self.peer, payload),
        }
    }

    pub fn on_ack(&self, id: SegmentId, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Connected {
            return;
        }
        inner.last_received = now;
        inner.channel.on_ack(id);
    }

    pub fn on_keepalive(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Connected {
            return;
        }
        inner.last_received = now;

        // NB: Only one side of a connection may need keepalives. The other side answers them
        //      so that the first side sees traffic as well.
        if !inner.flags.contains(ConnectFlags::KEEP_ALIVE) {
            let remote_id = inner.remote_id;
            self.send_packet(&mut inner, remote_id, PacketBody::Keepalive, now);
        }
    }

    pub fn on_termination(&self) {
        let mut inner = self.inner.lock();
        debug!("connection {} to {:?}: terminated by peer", self.local_id, self.peer);
        self.terminate(&mut inner, DisconnectReason::ClosedByPeer);
    }

    /// Registers a message for reliable delivery. It is transmitted once the connection is
    ///  established.
    pub fn send(&self, payload: Bytes, priority: i32) -> Delivery {
        let mut inner = self.inner.lock();
        if inner.channel.is_sequence_space_exhausted() && !matches!(inner.state, ConnectionState::Disconnected(_)) {
            info!("connection {} to {:?}: message sequence numbers are used up - closing", self.local_id, self.peer);
            self.send_termination(&mut inner, Instant::now());
            self.terminate(&mut inner, DisconnectReason::SequenceSpaceExhausted);
        }
        match inner.state {
            ConnectionState::Disconnected(reason) => {
                let error = reason.to_error(self.peer, inner.handshake_attempts);
                Delivery {
                    sent: Completion::resolved(Err(error.clone())),
                    received: Completion::resolved(Err(error)),
                }
            }
            ConnectionState::Connecting => inner.channel.send(payload, priority),
            ConnectionState::Connected => {
                let delivery = inner.channel.send(payload, priority);
                self.flush_unsent(&mut inner, Instant::now());
                delivery
            }
        }
    }

    /// Closes the connection locally, notifying the peer without waiting for confirmation
    pub fn close(&self) {
        self.close_with(DisconnectReason::Closed);
    }

    pub fn close_with(&self, reason: DisconnectReason) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ConnectionState::Disconnected(_)) {
            return;
        }
        debug!("connection {} to {:?}: closing ({:?})", self.local_id, self.peer, reason);
        self.send_termination(&mut inner, Instant::now());
        self.terminate(&mut inner, reason);
    }

    pub fn terminate_with(&self, reason: DisconnectReason) {
        let mut inner = self.inner.lock();
        self.terminate(&mut inner, reason);
    }

    /// Handshake retries and timeout, inactivity timeout, retransmissions and keepalive
    pub fn poll_timers(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connecting => {
                self.poll_handshake(&mut inner, now);
            }
            ConnectionState::Connected => {
                let config = self.ctx.config.clone();

                if now.saturating_duration_since(inner.last_received) >= config.inactivity_timeout {
                    info!("connection {} to {:?}: no traffic for {:?}", self.local_id, self.peer, config.inactivity_timeout);
                    self.terminate(&mut inner, DisconnectReason::InactivityTimeout);
                    return;
                }

                for outgoing in inner.channel.poll_timers(now, config.reassembly_timeout) {
                    self.enqueue_segment(&mut inner, outgoing, now);
                }

                if inner.flags.contains(ConnectFlags::KEEP_ALIVE) && now.saturating_duration_since(inner.last_sent) >= config.keepalive_interval {
                    trace!("connection {}: sending keepalive", self.local_id);
                    let remote_id = inner.remote_id;
                    self.send_packet(&mut inner, remote_id, PacketBody::Keepalive, now);
                }
            }
            ConnectionState::Disconnected(_) => {}
        }
    }

    fn poll_handshake(&self, inner: &mut ConnectionInner, now: Instant) {
        if now < inner.next_handshake_at {
            return;
        }
        if inner.handshake_attempts >= self.ctx.config.handshake_max_attempts {
            info!("connection {} to {:?}: handshake timed out after {} attempts", self.local_id, self.peer, inner.handshake_attempts);
            self.terminate(inner, DisconnectReason::HandshakeTimeout);
            return;
        }

        inner.handshake_attempts += 1;
        inner.next_handshake_at = now + self.ctx.config.handshake_retry_interval;
        trace!("connection {}: sending handshake request #{}", self.local_id, inner.handshake_attempts);

        let request = HandshakeRequest::new(&self.ctx.identity, self.local_id);
        self.send_packet(inner, ConnectionId::NONE, PacketBody::HandshakeRequest(request), now);
    }

    fn on_connected(&self, inner: &mut ConnectionInner, now: Instant) {
        info!("connection {} to {:?}: connected (remote id {})", self.local_id, self.peer, inner.remote_id);
        inner.state = ConnectionState::Connected;
        inner.last_received = now;
        if let Some(tx) = inner.connected_tx.take() {
            let _ = tx.send(Ok(()));
        }
        self.flush_unsent(inner, now);
    }

    fn terminate(&self, inner: &mut ConnectionInner, reason: DisconnectReason) {
        if matches!(inner.state, ConnectionState::Disconnected(_)) {
            return;
        }
        debug!("connection {} to {:?}: disconnected ({:?})", self.local_id, self.peer, reason);
        inner.state = ConnectionState::Disconnected(reason);

        let error = reason.to_error(self.peer, inner.handshake_attempts);
        inner.channel.fail_all(error.clone());
        if let Some(tx) = inner.connected_tx.take() {
            let _ = tx.send(Err(error));
        }
        if let Some(tx) = inner.disconnected_tx.take() {
            let _ = tx.send(reason);
        }
    }

    fn send_accept(&self, inner: &mut ConnectionInner, initiator_id: ConnectionId, now: Instant) {
        let accept = HandshakeAccept::new(&self.ctx.identity, self.local_id, initiator_id);
        self.send_packet(inner, initiator_id, PacketBody::HandshakeAccept(accept), now);
    }

    fn send_termination(&self, inner: &mut ConnectionInner, now: Instant) {
        if inner.remote_id != ConnectionId::NONE {
            let remote_id = inner.remote_id;
            self.send_packet(inner, remote_id, PacketBody::Termination, now);
        }
    }

    fn send_packet(&self, inner: &mut ConnectionInner, connection_id: ConnectionId, body: PacketBody, now: Instant) {
        let buf = Packet::new(connection_id, body).ser();
        if self.ctx.pipeline.enqueue(OutgoingDatagram::control(self.peer.socket_addr(), buf)) {
            inner.last_sent = now;
        }
        else {
            trace!("connection {}: send pipeline is closed - dropping control packet", self.local_id);
        }
    }

    fn flush_unsent(&self, inner: &mut ConnectionInner, now: Instant) {
        for outgoing in inner.channel.take_unsent() {
            self.enqueue_segment(inner, outgoing, now);
        }
    }

    fn enqueue_segment(&self, inner: &mut ConnectionInner, outgoing: OutgoingSegment, now: Instant) {
        let id = outgoing.segment.id;
        let lowest_pending = inner.channel.lowest_pending();
        let buf = Packet::new(inner.remote_id, PacketBody::Data { segment: outgoing.segment, lowest_pending }).ser();

        let myself = self.myself.clone();
        let on_sent: SentCallback = Box::new(move |result| {
            if let Some(connection) = myself.upgrade() {
                connection.on_segment_transmitted(id, result);
            }
        });

        let datagram = OutgoingDatagram {
            to: self.peer.socket_addr(),
            buf,
            priority: outgoing.priority,
            on_sent: Some(on_sent),
        };
        if self.ctx.pipeline.enqueue(datagram) {
            inner.last_sent = now;
        }
        else {
            inner.channel.on_transmitted(id, Err(TransportError::Shutdown), now);
        }
    }

    fn on_segment_transmitted(&self, id: SegmentId, result: Result<(), TransportError>) {
        self.inner.lock()
            .channel.on_transmitted(id, result, Instant::now());
    }
}
