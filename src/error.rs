use std::net::SocketAddr;
use thiserror::Error;
use crate::peer_addr::PeerAddress;

/// Failures surfaced to application code, always through the completion that belongs to the
///  operation (connect, send) rather than across the receive loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("could not bind UDP socket to {addr}: {message}")]
    Bind { addr: SocketAddr, message: String },
    #[error("peer {peer} presented a public key different from the expected one")]
    Authentication { peer: PeerAddress },
    #[error("no handshake acceptance from {peer} after {attempts} attempts")]
    HandshakeTimeout { peer: PeerAddress, attempts: u32 },
    #[error("send failure: {0}")]
    SendFailure(String),
    #[error("segment {segment_index} of message {message_seq} was not acknowledged after {attempts} attempts")]
    RetransmissionExhausted { message_seq: u32, segment_index: u16, attempts: u32 },
    #[error("no traffic from {peer} within the inactivity timeout")]
    InactivityTimeout { peer: PeerAddress },
    #[error("connection is closed: {0:?}")]
    ConnectionClosed(DisconnectReason),
    #[error("network interface is shutting down")]
    Shutdown,
    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("identity error: {0}")]
    Identity(String),
}

/// The reason a connection reached its terminal `Disconnected` state. Reported exactly once
///  per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// closed locally through the connection handle
    Closed,
    /// the peer sent a termination notice
    ClosedByPeer,
    /// the peer's public key did not match the expected key
    AuthenticationFailed,
    HandshakeTimeout,
    InactivityTimeout,
    /// a newer handshake for the same peer address took this connection's place
    Replaced,
    /// the connection used up its message sequence numbers
    SequenceSpaceExhausted,
    Shutdown,
}

impl DisconnectReason {
    /// The error that pending callbacks of a connection are failed with when it terminates
    ///  for this reason.
    pub fn to_error(self, peer: PeerAddress, handshake_attempts: u32) -> TransportError {
        match self {
            DisconnectReason::AuthenticationFailed => TransportError::Authentication { peer },
            DisconnectReason::HandshakeTimeout => TransportError::HandshakeTimeout { peer, attempts: handshake_attempts },
            DisconnectReason::InactivityTimeout => TransportError::InactivityTimeout { peer },
            DisconnectReason::Shutdown => TransportError::Shutdown,
            other => TransportError::ConnectionClosed(other),
        }
    }
}
