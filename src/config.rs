use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;
use crate::packet::Packet;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub bind_ip: IpAddr,
    pub listen_port: u16,

    /// This is the upstream bandwidth ceiling for the whole interface, i.e. the refill rate of
    ///  its token bucket. The bucket holds one datagram's worth of tokens, so a burst after a
    ///  quiet period is a single datagram.
    ///
    /// NB: For rates below `max_datagram_size`, datagrams are shrunk to the per-second rate
    ///      (see [TransportConfig::effective_datagram_size]).
    pub max_upstream_bytes_per_second: u32,

    /// This is the maximum UDP payload size this transport emits. Payloads are split into
    ///  segments so that each datagram including framing stays within this size, and IP-level
    ///  fragmentation is avoided.
    ///
    /// With full Ethernet frames and no optional IP headers, the usable UDP payload is
    ///  `1500 - 20 - 8 = 1472` for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. The default leaves
    ///  some headroom below that for tunnels and the like.
    pub max_datagram_size: usize,

    pub retransmit_base_timeout: Duration,
    pub retransmit_max_timeout: Duration,
    /// number of times a segment is transmitted (including the first time) before the message
    ///  it belongs to fails
    pub max_transmit_attempts: u32,

    pub handshake_retry_interval: Duration,
    pub handshake_max_attempts: u32,

    pub inactivity_timeout: Duration,
    pub keepalive_interval: Duration,

    /// incomplete inbound messages are discarded after this time
    pub reassembly_timeout: Duration,

    pub timer_tick: Duration,
}

impl TransportConfig {
    pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1400;
    /// largest UDP payload for IPV4
    pub const MAX_UDP_PAYLOAD: usize = 65507;

    pub fn new(listen_port: u16, max_upstream_bytes_per_second: u32) -> TransportConfig {
        TransportConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port,
            max_upstream_bytes_per_second,
            max_datagram_size: Self::DEFAULT_MAX_DATAGRAM_SIZE,
            retransmit_base_timeout: Duration::from_millis(400),
            retransmit_max_timeout: Duration::from_secs(5),
            max_transmit_attempts: 8,
            handshake_retry_interval: Duration::from_secs(1),
            handshake_max_attempts: 5,
            inactivity_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(15),
            reassembly_timeout: Duration::from_secs(30),
            timer_tick: Duration::from_millis(20),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.listen_port)
    }

    /// The size limit for emitted datagrams. This is also the capacity of the rate limiter's
    ///  token bucket.
    pub fn effective_datagram_size(&self) -> usize {
        self.max_datagram_size.min(self.max_upstream_bytes_per_second as usize)
    }

    /// The number of payload bytes that fit into a single segment's datagram
    pub fn max_segment_payload(&self) -> usize {
        self.effective_datagram_size().saturating_sub(Packet::SEGMENT_OVERHEAD)
    }

    /// Upper bound for the time between sending a handshake request and giving up on it
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_retry_interval * self.handshake_max_attempts
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if (self.max_upstream_bytes_per_second as usize) < Packet::MAX_CONTROL_PACKET_LEN {
            bail!("max upstream bytes per second of {} is too small for handshake packets ({} bytes)", self.max_upstream_bytes_per_second, Packet::MAX_CONTROL_PACKET_LEN);
        }
        if self.max_datagram_size <= Packet::SEGMENT_OVERHEAD {
            bail!("max datagram size of {} leaves no room for payload after {} bytes of framing", self.max_datagram_size, Packet::SEGMENT_OVERHEAD);
        }
        if self.max_datagram_size < Packet::MAX_CONTROL_PACKET_LEN {
            bail!("max datagram size of {} is too small for handshake packets ({} bytes)", self.max_datagram_size, Packet::MAX_CONTROL_PACKET_LEN);
        }
        if self.max_datagram_size > Self::MAX_UDP_PAYLOAD {
            bail!("max datagram size of {} exceeds the UDP maximum of {}", self.max_datagram_size, Self::MAX_UDP_PAYLOAD);
        }
        if self.max_transmit_attempts == 0 {
            bail!("max transmit attempts must be at least 1");
        }
        if self.handshake_max_attempts == 0 {
            bail!("max handshake attempts must be at least 1");
        }
        if self.retransmit_base_timeout.is_zero() || self.retransmit_max_timeout < self.retransmit_base_timeout {
            bail!("retransmit timeouts must be positive, and the maximum must not be below the base timeout");
        }
        if self.timer_tick.is_zero() {
            bail!("timer tick must be positive");
        }

        Ok(())
    }
}
