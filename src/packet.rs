use std::fmt::{Debug, Display, Formatter};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::handshake::{HandshakeAccept, HandshakeRequest};

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// A connection id is assigned by each side for its own end of a connection. Packets carry the
///  *recipient's* id, so every node demultiplexes by its own ids.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ConnectionId(u32);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl ConnectionId {
    /// placeholder for packets whose recipient id is not known (yet)
    pub const NONE: ConnectionId = ConnectionId(0);

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// a random id, never [ConnectionId::NONE]
    pub fn random() -> ConnectionId {
        loop {
            let raw = rand::random::<u32>();
            if raw != Self::NONE.0 {
                return ConnectionId(raw);
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    HandshakeRequest = 1,
    HandshakeAccept = 2,
    Data = 3,
    Ack = 4,
    Termination = 5,
    Unreliable = 6,
    Keepalive = 7,
}

/// Identifies one segment of one message. Message sequence numbers are per connection (or per
///  sending interface for unreliable messages).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SegmentId {
    pub message_seq: u32,
    pub index: u16,
}

impl SegmentId {
    pub const SERIALIZED_LEN: usize = size_of::<u32>() + size_of::<u16>();

    pub fn new(message_seq: u32, index: u16) -> SegmentId {
        SegmentId { message_seq, index }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.message_seq);
        buf.put_u16(self.index);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<SegmentId> {
        let message_seq = buf.try_get_u32()?;
        let index = buf.try_get_u16()?;
        Ok(SegmentId { message_seq, index })
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Segment {
    pub id: SegmentId,
    pub count: u16,
    pub payload: Bytes,
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment{{{}:{}/{} ({} bytes)}}", self.id.message_seq, self.id.index, self.count, self.payload.len())
    }
}

impl Segment {
    pub const HEADER_LEN: usize = SegmentId::SERIALIZED_LEN + size_of::<u16>();

    fn ser(&self, buf: &mut BytesMut) {
        self.id.ser(buf);
        buf.put_u16(self.count);
        buf.put_slice(&self.payload);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Segment> {
        let id = SegmentId::deser(buf)?;
        let count = buf.try_get_u16()?;
        if id.index >= count {
            bail!("segment index {} is out of range for a message of {} segments", id.index, count);
        }
        let payload = buf.copy_to_bytes(buf.remaining());
        Ok(Segment { id, count, payload })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketBody {
    HandshakeRequest(HandshakeRequest),
    HandshakeAccept(HandshakeAccept),
    /// `lowest_pending` is the sender's lowest unresolved message sequence number: every message
    ///  below it was either acknowledged or given up, and will not be transmitted again
    Data { segment: Segment, lowest_pending: u32 },
    Ack(SegmentId),
    Termination,
    Unreliable(Segment),
    Keepalive,
}

/// A decoded datagram.
///
/// ```ascii
///  0: protocol version (u8)
///  1: checksum (u32) - CRC-32/ISCSI of everything after the checksum
///  5: packet kind (u8)
///  6: connection id (u32) - the recipient's local id, 0 if not known
/// 10: body, depending on the packet kind
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub connection_id: ConnectionId,
    pub body: PacketBody,
}

impl Packet {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    const CHECKSUM_OFFSET: usize = 1;
    const CHECKSUMMED_OFFSET: usize = Self::CHECKSUM_OFFSET + size_of::<u32>();
    pub const HEADER_LEN: usize = Self::CHECKSUMMED_OFFSET + size_of::<u8>() + size_of::<u32>();

    /// framing bytes in a datagram carrying a segment, i.e. the difference between datagram size
    ///  and segment payload size (DATA packets, UNRELIABLE ones have a little less)
    pub const SEGMENT_OVERHEAD: usize = Self::HEADER_LEN + Self::DATA_PREFIX_LEN + Segment::HEADER_LEN;

    /// the `lowest_pending` field in front of a DATA packet's segment
    const DATA_PREFIX_LEN: usize = size_of::<u32>();

    /// the biggest control packet, i.e. the smallest datagram size the protocol can work with
    pub const MAX_CONTROL_PACKET_LEN: usize = Self::HEADER_LEN + HandshakeRequest::SERIALIZED_LEN;

    pub fn new(connection_id: ConnectionId, body: PacketBody) -> Packet {
        Packet { connection_id, body }
    }

    pub fn kind(&self) -> PacketKind {
        match &self.body {
            PacketBody::HandshakeRequest(_) => PacketKind::HandshakeRequest,
            PacketBody::HandshakeAccept(_) => PacketKind::HandshakeAccept,
            PacketBody::Data { .. } => PacketKind::Data,
            PacketBody::Ack(_) => PacketKind::Ack,
            PacketBody::Termination => PacketKind::Termination,
            PacketBody::Unreliable(_) => PacketKind::Unreliable,
            PacketBody::Keepalive => PacketKind::Keepalive,
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + match &self.body {
            PacketBody::HandshakeRequest(_) => HandshakeRequest::SERIALIZED_LEN,
            PacketBody::HandshakeAccept(_) => HandshakeAccept::SERIALIZED_LEN,
            PacketBody::Data { segment, .. } => Self::DATA_PREFIX_LEN + Segment::HEADER_LEN + segment.payload.len(),
            PacketBody::Unreliable(segment) => Segment::HEADER_LEN + segment.payload.len(),
            PacketBody::Ack(_) => SegmentId::SERIALIZED_LEN,
            PacketBody::Termination | PacketBody::Keepalive => 0,
        }
    }

    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u32(0); // checksum placeholder
        buf.put_u8(self.kind().into());
        buf.put_u32(self.connection_id.to_raw());

        match &self.body {
            PacketBody::HandshakeRequest(request) => request.ser(&mut buf),
            PacketBody::HandshakeAccept(accept) => accept.ser(&mut buf),
            PacketBody::Data { segment, lowest_pending } => {
                buf.put_u32(*lowest_pending);
                segment.ser(&mut buf);
            }
            PacketBody::Unreliable(segment) => segment.ser(&mut buf),
            PacketBody::Ack(segment_id) => segment_id.ser(&mut buf),
            PacketBody::Termination | PacketBody::Keepalive => {}
        }

        let checksum = CHECKSUM.checksum(&buf[Self::CHECKSUMMED_OFFSET..]);
        buf[Self::CHECKSUM_OFFSET..Self::CHECKSUMMED_OFFSET].copy_from_slice(&checksum.to_be_bytes());
        buf.freeze()
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<Packet> {
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }

        let checksum = buf.try_get_u32()?;
        let actual = CHECKSUM.checksum(&buf);
        if checksum != actual {
            bail!("checksum mismatch: packet has {:08x}, content has {:08x}", checksum, actual);
        }

        let raw_kind = buf.try_get_u8()?;
        let kind = PacketKind::try_from(raw_kind)
            .map_err(|_| anyhow!("unknown packet kind {}", raw_kind))?;
        let connection_id = ConnectionId::from_raw(buf.try_get_u32()?);

        let body = match kind {
            PacketKind::HandshakeRequest => PacketBody::HandshakeRequest(HandshakeRequest::deser(&mut buf)?),
            PacketKind::HandshakeAccept => PacketBody::HandshakeAccept(HandshakeAccept::deser(&mut buf)?),
            PacketKind::Data => {
                let lowest_pending = buf.try_get_u32()?;
                PacketBody::Data { segment: Segment::deser(&mut buf)?, lowest_pending }
            }
            PacketKind::Ack => PacketBody::Ack(SegmentId::deser(&mut buf)?),
            PacketKind::Termination => PacketBody::Termination,
            PacketKind::Unreliable => PacketBody::Unreliable(Segment::deser(&mut buf)?),
            PacketKind::Keepalive => PacketBody::Keepalive,
        };

        Ok(Packet { connection_id, body })
    }
}
