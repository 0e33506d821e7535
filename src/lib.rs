//! A peer-to-peer message transport over a single UDP socket per node. Each node is identified by
//!  an Ed25519 key pair, and peers prove their identity in a handshake before exchanging messages
//!  reliably.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer without a dedicated server vs. client
//!   * each node has one listening UDP socket that handles all connections
//!   * both sides may connect at the same time, which results in a single connection
//! * The abstraction is sending / receiving *messages*, i.e. defined-length chunks of data as
//!   opposed to streams of bytes
//! * Two delivery modes:
//!   * *unreliable* messages are fire-and-forget, without a connection
//!   * *reliable* messages go through a connection, are acknowledged per segment, and are
//!     retransmitted with exponential backoff until acknowledged or out of attempts
//! * Big messages are sent without IP-level fragmentation - this transport takes care of splitting
//!   them into segments and re-assembling them
//!   * configured maximum datagram size since MTU discovery does not work reliably
//! * There is no ordering guarantee between messages, only within a message's segments
//! * Upstream bandwidth is capped per node by a token bucket, and higher-priority datagrams are
//!   sent first when the bucket runs dry
//! * There is a checksum per packet
//! * All failures are reported through the completion of the operation that caused them
//!
//! ## Packets
//!
//! Every datagram is a single packet with a fixed header (see [packet::Packet]) followed by a body
//!  depending on the packet kind:
//!
//! ```ascii
//! HANDSHAKE_REQUEST (1)  initiator id, public key, signature
//! HANDSHAKE_ACCEPT  (2)  acceptor id, public key, signature
//! DATA              (3)  sender's lowest pending message sequence number (u32), segment of a reliable message
//! ACK               (4)  id of a received DATA segment
//! TERMINATION       (5)  -
//! UNRELIABLE        (6)  segment of an unreliable message
//! KEEPALIVE         (7)  -
//! ```
//!
//! A segment is
//!
//! ```ascii
//! 0: message sequence number (u32)
//! 4: segment index (u16)
//! 6: segment count (u16)
//! 8: payload
//! ```
//!
//! ## Connections
//!
//! A connection starts with a handshake: The initiator sends HANDSHAKE_REQUEST with a freshly
//!  generated connection id until it receives a matching HANDSHAKE_ACCEPT or runs out of attempts.
//!  Both messages are signed, so after the handshake each side knows the other's verified public
//!  key. After that, every packet carries the *recipient's* connection id.
//!
//! A connection ends when either side closes it, when there was no traffic for the inactivity
//!  timeout, or when the peer starts a new session from the same address (e.g. after a restart).

pub mod backoff;
pub mod channel;
pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod listener;
pub mod network_interface;
pub mod packet;
pub mod peer_addr;
pub mod rate_limiter;
pub mod segments;
pub mod send_pipeline;

#[cfg(test)]
mod test_util;

pub use completion::{Completion, Delivery};
pub use config::TransportConfig;
pub use connection::{ConnectFlags, ConnectionState};
pub use error::{DisconnectReason, TransportError};
pub use identity::{Identity, PublicKey};
pub use listener::MessageListener;
pub use network_interface::{ConnectionHandle, NetworkInterface, PendingConnection};
pub use peer_addr::PeerAddress;
