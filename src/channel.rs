use std::collections::BTreeMap;
use bit_set::BitSet;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::backoff::RetransmitBackoff;
use crate::completion::{Completion, CompletionSender, Delivery};
use crate::config::TransportConfig;
use crate::error::{DisconnectReason, TransportError};
use crate::packet::{Segment, SegmentId};
use crate::segments::{split_payload, DeliveredSet, Reassembler, SegmentOutcome};

/// A segment that is ready to go on the wire
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutgoingSegment {
    pub segment: Segment,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SegmentState {
    /// waiting for the connection to be established
    Unsent,
    /// handed to the send pipeline, waiting for the rate limiter
    Queued,
    AwaitingAck { deadline: Instant },
    Acked,
}

struct OutboundSegment {
    payload: Bytes,
    state: SegmentState,
    attempts: u32,
    /// the most recent socket error, if the segment never made it out successfully
    send_error: Option<TransportError>,
}

struct OutboundMessage {
    segments: Vec<OutboundSegment>,
    unacked: BitSet,
    untransmitted: BitSet,
    priority: i32,
    sent_tx: Option<CompletionSender>,
    received_tx: Option<CompletionSender>,
}

impl OutboundMessage {
    fn count(&self) -> u16 {
        self.segments.len() as u16
    }

    fn outgoing(&self, message_seq: u32, index: usize) -> OutgoingSegment {
        OutgoingSegment {
            segment: Segment {
                id: SegmentId::new(message_seq, index as u16),
                count: self.count(),
                payload: self.segments[index].payload.clone(),
            },
            priority: self.priority,
        }
    }

    fn fire_sent(&mut self) {
        if let Some(tx) = self.sent_tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail(mut self, error: TransportError) {
        if let Some(tx) = self.sent_tx.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some(tx) = self.received_tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// What the receiving side should do with an inbound data segment
#[derive(Debug, Eq, PartialEq)]
pub struct DataOutcome {
    pub ack: bool,
    pub delivered: Option<Bytes>,
}

/// The acknowledged-delivery engine of one connection, holding outbound messages until they are
///  fully acknowledged, and inbound assemblies until they are complete.
///
/// This is a passive state machine: it does no I/O and reads no clock. The owning connection
///  feeds it events (sends, transmissions, ACKs, data, timer ticks), and sends whatever segments
///  it hands out.
///
/// Each segment has its own retransmission timer with exponential backoff, armed when the segment
///  actually leaves the send pipeline, so time spent waiting for the rate limiter does not count
///  towards it. After `max_transmit_attempts` transmissions without ACK, the segment's message
///  fails; the connection itself is unaffected.
///
/// Delivery is exactly-once per message: the receiver ACKs every segment it accepts or already
///  has, but passes a message's payload on only the first time it completes.
///
/// Message sequence numbers do not wrap: once they are used up, the channel rejects further
///  messages, and the connection has to be replaced.
pub struct ReliableChannel {
    backoff: RetransmitBackoff,
    max_transmit_attempts: u32,
    max_segment_payload: usize,

    next_message_seq: u32,
    outbound: BTreeMap<u32, OutboundMessage>,

    inbound: Reassembler<u32>,
    delivered: DeliveredSet,
}

impl ReliableChannel {
    pub fn new(config: &TransportConfig) -> ReliableChannel {
        ReliableChannel {
            backoff: RetransmitBackoff::new(config.retransmit_base_timeout, config.retransmit_max_timeout),
            max_transmit_attempts: config.max_transmit_attempts,
            max_segment_payload: config.max_segment_payload(),
            next_message_seq: 0,
            outbound: BTreeMap::new(),
            inbound: Reassembler::default(),
            delivered: DeliveredSet::default(),
        }
    }

    /// the first sequence number that is never assigned
    const SEQUENCE_LIMIT: u32 = u32::MAX;

    #[cfg(test)]
    pub(crate) fn skip_to_message_seq(&mut self, message_seq: u32) {
        self.next_message_seq = message_seq;
    }

    pub fn is_sequence_space_exhausted(&self) -> bool {
        self.next_message_seq >= Self::SEQUENCE_LIMIT
    }

    /// The lowest sequence number of a message that is neither acknowledged nor given up. Every
    ///  DATA packet carries it, so that the receiver can forget about older messages.
    pub fn lowest_pending(&self) -> u32 {
        self.outbound.keys()
            .next()
            .copied()
            .unwrap_or(self.next_message_seq)
    }

    /// Registers a message for delivery. Its segments are handed out by the next call to
    ///  [ReliableChannel::take_unsent].
    pub fn send(&mut self, payload: Bytes, priority: i32) -> Delivery {
        let (sent_tx, sent) = Completion::new();
        let (received_tx, received) = Completion::new();
        let delivery = Delivery { sent, received };

        let chunks = if self.is_sequence_space_exhausted() {
            Err(TransportError::ConnectionClosed(DisconnectReason::SequenceSpaceExhausted))
        }
        else {
            split_payload(&payload, self.max_segment_payload)
        };
        let chunks = match chunks {
            Ok(chunks) => chunks,
            Err(e) => {
                debug!("rejecting message: {}", e);
                let _ = sent_tx.send(Err(e.clone()));
                let _ = received_tx.send(Err(e));
                return delivery;
            }
        };

        let message_seq = self.next_message_seq;
        self.next_message_seq += 1;

        let num_segments = chunks.len();
        trace!("registering message {} with {} segments", message_seq, num_segments);
        self.outbound.insert(message_seq, OutboundMessage {
            segments: chunks.into_iter()
                .map(|payload| OutboundSegment {
                    payload,
                    state: SegmentState::Unsent,
                    attempts: 0,
                    send_error: None,
                })
                .collect(),
            unacked: (0..num_segments).collect(),
            untransmitted: (0..num_segments).collect(),
            priority,
            sent_tx: Some(sent_tx),
            received_tx: Some(received_tx),
        });
        delivery
    }

    /// All segments that were registered but not handed out yet, in message and segment order.
    ///  They are marked as queued.
    pub fn take_unsent(&mut self) -> Vec<OutgoingSegment> {
        let mut result = Vec::new();
        for (&message_seq, message) in self.outbound.iter_mut() {
            for index in 0..message.segments.len() {
                if message.segments[index].state == SegmentState::Unsent {
                    message.segments[index].state = SegmentState::Queued;
                    result.push(message.outgoing(message_seq, index));
                }
            }
        }
        result
    }

    /// Called when the send pipeline is done with a segment. This is when the retransmission
    ///  timer starts.
    pub fn on_transmitted(&mut self, id: SegmentId, result: Result<(), TransportError>, now: Instant) {
        let Some(message) = self.outbound.get_mut(&id.message_seq) else {
            return;
        };
        let index = id.index as usize;
        let Some(segment) = message.segments.get_mut(index) else {
            return;
        };
        if segment.state != SegmentState::Queued {
            return;
        }

        segment.attempts += 1;
        segment.state = SegmentState::AwaitingAck {
            deadline: now + self.backoff.timeout_after_attempt(segment.attempts),
        };

        match result {
            Ok(()) => {
                segment.send_error = None;
                message.untransmitted.remove(index);
                if message.untransmitted.is_empty() {
                    message.fire_sent();
                }
            }
            Err(e) => {
                debug!("transmission of segment {:?} failed (attempt {}): {}", id, segment.attempts, e);
                segment.send_error = Some(e);
            }
        }
    }

    /// Returns `true` if the ACK completed its message.
    pub fn on_ack(&mut self, id: SegmentId) -> bool {
        let Some(message) = self.outbound.get_mut(&id.message_seq) else {
            trace!("ACK for unknown message {} - ignoring", id.message_seq);
            return false;
        };
        let index = id.index as usize;
        if !message.unacked.remove(index) {
            return false;
        }
        if let Some(segment) = message.segments.get_mut(index) {
            segment.state = SegmentState::Acked;
        }

        // an ACK proves that the segment was on the wire, even if the pipeline has not reported yet
        message.untransmitted.remove(index);
        if message.untransmitted.is_empty() {
            message.fire_sent();
        }

        if !message.unacked.is_empty() {
            return false;
        }

        trace!("message {} fully acknowledged", id.message_seq);
        if let Some(mut message) = self.outbound.remove(&id.message_seq) {
            if let Some(tx) = message.received_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
        true
    }

    pub fn on_data(&mut self, segment: &Segment, lowest_pending: u32, now: Instant) -> DataOutcome {
        if self.delivered.advance_to(lowest_pending) {
            trace!("sender resolved all messages below {}", lowest_pending);
            self.inbound.retain(|&message_seq| message_seq >= lowest_pending);
        }

        let message_seq = segment.id.message_seq;
        if self.delivered.contains(message_seq) {
            trace!("segment {:?} of a delivered message - acknowledging again", segment);
            return DataOutcome { ack: true, delivered: None };
        }

        match self.inbound.on_segment(message_seq, segment, now) {
            SegmentOutcome::Incomplete | SegmentOutcome::Duplicate => DataOutcome { ack: true, delivered: None },
            SegmentOutcome::Complete(payload) => {
                self.delivered.insert(message_seq);
                DataOutcome { ack: true, delivered: Some(payload) }
            }
            SegmentOutcome::Inconsistent => DataOutcome { ack: false, delivered: None },
        }
    }

    /// Collects segments whose retransmission timer expired, and fails messages with a segment
    ///  that exhausted its attempts.
    pub fn poll_timers(&mut self, now: Instant, reassembly_timeout: std::time::Duration) -> Vec<OutgoingSegment> {
        self.inbound.expire(now, reassembly_timeout);

        let mut retransmissions = Vec::new();
        let mut failed = Vec::new();

        'messages: for (&message_seq, message) in self.outbound.iter_mut() {
            let mut due = Vec::new();
            for (index, segment) in message.segments.iter().enumerate() {
                let SegmentState::AwaitingAck { deadline } = segment.state else {
                    continue;
                };
                if deadline > now {
                    continue;
                }

                if segment.attempts >= self.max_transmit_attempts {
                    let error = match &segment.send_error {
                        Some(e) => e.clone(),
                        None => TransportError::RetransmissionExhausted {
                            message_seq,
                            segment_index: index as u16,
                            attempts: segment.attempts,
                        },
                    };
                    debug!("message {} failed: {}", message_seq, error);
                    failed.push((message_seq, error));
                    continue 'messages;
                }
                due.push(index);
            }

            for index in due {
                trace!("retransmitting segment {}:{} after {} attempts", message_seq, index, message.segments[index].attempts);
                message.segments[index].state = SegmentState::Queued;
                retransmissions.push(message.outgoing(message_seq, index));
            }
        }

        for (message_seq, error) in failed {
            if let Some(message) = self.outbound.remove(&message_seq) {
                message.fail(error);
            }
        }
        retransmissions
    }

    /// fails every pending message, e.g. when the connection terminates
    pub fn fail_all(&mut self, error: TransportError) {
        let outbound = std::mem::take(&mut self.outbound);
        if !outbound.is_empty() {
            debug!("failing {} pending messages: {}", outbound.len(), error);
        }
        for message in outbound.into_values() {
            message.fail(error.clone());
        }
    }

    pub fn num_pending(&self) -> usize {
        self.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rstest::rstest;

    fn config() -> TransportConfig {
        let mut config = TransportConfig::new(0, 100_000);
        config.max_datagram_size = 10 + crate::packet::Packet::SEGMENT_OVERHEAD;
        config.retransmit_base_timeout = Duration::from_millis(100);
        config.retransmit_max_timeout = Duration::from_millis(1000);
        config.max_transmit_attempts = 3;
        config
    }

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| i as u8).collect::<Vec<_>>().into()
    }

    const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

    /// hands out all unsent segments and reports them as transmitted successfully
    fn transmit_all(channel: &mut ReliableChannel, now: Instant) -> Vec<OutgoingSegment> {
        let segments = channel.take_unsent();
        for s in &segments {
            channel.on_transmitted(s.segment.id, Ok(()), now);
        }
        segments
    }

    #[test]
    fn test_send_segments() {
        let mut channel = ReliableChannel::new(&config());
        let _d1 = channel.send(payload(25), 3);
        let _d2 = channel.send(payload(0), -1);

        let segments = channel.take_unsent();
        let ids = segments.iter()
            .map(|s| (s.segment.id.message_seq, s.segment.id.index, s.segment.count, s.segment.payload.len(), s.priority))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![
            (0, 0, 3, 10, 3),
            (0, 1, 3, 10, 3),
            (0, 2, 3, 5, 3),
            (1, 0, 1, 0, -1),
        ]);

        assert!(channel.take_unsent().is_empty());
    }

    #[test]
    fn test_sent_and_received() {
        let now = Instant::now();
        let mut channel = ReliableChannel::new(&config());
        let mut delivery = channel.send(payload(15), 0);

        let segments = channel.take_unsent();
        assert_eq!(segments.len(), 2);
        assert_eq!(delivery.sent.try_result(), None);

        channel.on_transmitted(segments[0].segment.id, Ok(()), now);
        assert_eq!(delivery.sent.try_result(), None);
        channel.on_transmitted(segments[1].segment.id, Ok(()), now);
        assert_eq!(delivery.sent.try_result(), Some(Ok(())));

        assert!(!channel.on_ack(segments[1].segment.id));
        assert_eq!(delivery.received.try_result(), None);
        assert!(!channel.on_ack(segments[1].segment.id));
        assert!(channel.on_ack(segments[0].segment.id));
        assert_eq!(delivery.received.try_result(), Some(Ok(())));
        assert_eq!(channel.num_pending(), 0);
    }

    #[test]
    fn test_ack_before_transmit_report() {
        let mut channel = ReliableChannel::new(&config());
        let mut delivery = channel.send(payload(5), 0);
        let segments = channel.take_unsent();

        assert!(channel.on_ack(segments[0].segment.id));
        assert_eq!(delivery.sent.try_result(), Some(Ok(())));
        assert_eq!(delivery.received.try_result(), Some(Ok(())));

        // a late report is harmless
        channel.on_transmitted(segments[0].segment.id, Ok(()), Instant::now());
    }

    #[test]
    fn test_payload_too_large() {
        let mut channel = ReliableChannel::new(&config());
        let mut delivery = channel.send(payload(10 * u16::MAX as usize + 1), 0);
        assert!(matches!(delivery.sent.try_result(), Some(Err(TransportError::PayloadTooLarge { .. }))));
        assert!(matches!(delivery.received.try_result(), Some(Err(TransportError::PayloadTooLarge { .. }))));
        assert_eq!(channel.num_pending(), 0);
    }

    #[test]
    fn test_retransmission_backoff() {
        let start = Instant::now();
        let mut channel = ReliableChannel::new(&config());
        let mut delivery = channel.send(payload(5), 0);
        let id = transmit_all(&mut channel, start)[0].segment.id;

        assert!(channel.poll_timers(start + Duration::from_millis(99), REASSEMBLY_TIMEOUT).is_empty());
        let retransmitted = channel.poll_timers(start + Duration::from_millis(100), REASSEMBLY_TIMEOUT);
        assert_eq!(retransmitted.iter().map(|s| s.segment.id).collect::<Vec<_>>(), vec![id]);

        // queued, so no timer while it waits for the pipeline
        assert!(channel.poll_timers(start + Duration::from_secs(10), REASSEMBLY_TIMEOUT).is_empty());

        let second = start + Duration::from_millis(150);
        channel.on_transmitted(id, Ok(()), second);
        assert!(channel.poll_timers(second + Duration::from_millis(199), REASSEMBLY_TIMEOUT).is_empty());
        assert_eq!(channel.poll_timers(second + Duration::from_millis(200), REASSEMBLY_TIMEOUT).len(), 1);

        let third = second + Duration::from_millis(250);
        channel.on_transmitted(id, Ok(()), third);
        assert!(channel.poll_timers(third + Duration::from_millis(399), REASSEMBLY_TIMEOUT).is_empty());
        assert_eq!(delivery.received.try_result(), None);

        // three transmissions without ACK
        assert!(channel.poll_timers(third + Duration::from_millis(400), REASSEMBLY_TIMEOUT).is_empty());
        assert_eq!(delivery.sent.try_result(), Some(Ok(())));
        assert_eq!(delivery.received.try_result(), Some(Err(TransportError::RetransmissionExhausted {
            message_seq: 0,
            segment_index: 0,
            attempts: 3,
        })));
        assert_eq!(channel.num_pending(), 0);
    }

    #[test]
    fn test_retransmit_only_missing_segments() {
        let start = Instant::now();
        let mut channel = ReliableChannel::new(&config());
        let _delivery = channel.send(payload(30), 0);
        let segments = transmit_all(&mut channel, start);
        assert_eq!(segments.len(), 3);

        channel.on_ack(segments[0].segment.id);
        channel.on_ack(segments[2].segment.id);

        let retransmitted = channel.poll_timers(start + Duration::from_millis(100), REASSEMBLY_TIMEOUT);
        assert_eq!(retransmitted.iter().map(|s| s.segment.id.index).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_failed_message_leaves_others() {
        let start = Instant::now();
        let mut config = config();
        config.max_transmit_attempts = 1;
        let mut channel = ReliableChannel::new(&config);

        let mut first = channel.send(payload(5), 0);
        transmit_all(&mut channel, start);
        let mut second = channel.send(payload(5), 0);
        transmit_all(&mut channel, start + Duration::from_millis(50));

        assert!(channel.poll_timers(start + Duration::from_millis(100), REASSEMBLY_TIMEOUT).is_empty());
        assert!(matches!(first.received.try_result(), Some(Err(TransportError::RetransmissionExhausted { .. }))));
        assert_eq!(second.received.try_result(), None);
        assert_eq!(channel.num_pending(), 1);

        assert!(channel.on_ack(SegmentId::new(1, 0)));
        assert_eq!(second.received.try_result(), Some(Ok(())));
    }

    #[test]
    fn test_socket_errors_count_as_attempts() {
        let start = Instant::now();
        let mut channel = ReliableChannel::new(&config());
        let mut delivery = channel.send(payload(5), 0);

        let mut now = start;
        for _ in 0..3 {
            let segments = channel.take_unsent();
            let segments = if segments.is_empty() { channel.poll_timers(now, REASSEMBLY_TIMEOUT) } else { segments };
            assert_eq!(segments.len(), 1);
            channel.on_transmitted(segments[0].segment.id, Err(TransportError::SendFailure("unreachable".to_string())), now);
            now += Duration::from_secs(1);
        }

        assert!(channel.poll_timers(now, REASSEMBLY_TIMEOUT).is_empty());
        assert_eq!(delivery.sent.try_result(), Some(Err(TransportError::SendFailure("unreachable".to_string()))));
        assert_eq!(delivery.received.try_result(), Some(Err(TransportError::SendFailure("unreachable".to_string()))));
    }

    #[test]
    fn test_fail_all() {
        let mut channel = ReliableChannel::new(&config());
        let mut transmitted = channel.send(payload(5), 0);
        transmit_all(&mut channel, Instant::now());
        let mut before_transmit = channel.send(payload(5), 0);

        channel.fail_all(TransportError::Shutdown);
        assert_eq!(before_transmit.sent.try_result(), Some(Err(TransportError::Shutdown)));
        assert_eq!(before_transmit.received.try_result(), Some(Err(TransportError::Shutdown)));
        assert_eq!(transmitted.sent.try_result(), Some(Ok(())));
        assert_eq!(transmitted.received.try_result(), Some(Err(TransportError::Shutdown)));
        assert_eq!(channel.num_pending(), 0);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::shuffled(vec![1, 2, 0])]
    fn test_receive_any_order(#[case] order: Vec<usize>) {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(&config());
        let mut receiver = ReliableChannel::new(&config());

        let payload = payload(27);
        let _delivery = sender.send(payload.clone(), 0);
        let segments = sender.take_unsent();

        let mut delivered = Vec::new();
        for i in order {
            let outcome = receiver.on_data(&segments[i].segment, 0, now);
            assert!(outcome.ack);
            delivered.extend(outcome.delivered);
        }
        assert_eq!(delivered, vec![payload]);
    }

    #[test]
    fn test_duplicates_never_redelivered() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(&config());
        let mut receiver = ReliableChannel::new(&config());

        let _delivery = sender.send(payload(15), 0);
        let segments = sender.take_unsent();

        assert_eq!(receiver.on_data(&segments[0].segment, 0, now), DataOutcome { ack: true, delivered: None });
        assert_eq!(receiver.on_data(&segments[0].segment, 0, now), DataOutcome { ack: true, delivered: None });
        assert!(receiver.on_data(&segments[1].segment, 0, now).delivered.is_some());

        for s in &segments {
            assert_eq!(receiver.on_data(&s.segment, 0, now), DataOutcome { ack: true, delivered: None });
        }
    }

    #[test]
    fn test_lowest_pending() {
        let start = Instant::now();
        let mut config = config();
        config.max_transmit_attempts = 1;
        let mut channel = ReliableChannel::new(&config);
        assert_eq!(channel.lowest_pending(), 0);

        let _lost = channel.send(payload(5), 0);
        let _acked = channel.send(payload(5), 0);
        transmit_all(&mut channel, start);
        let _pending = channel.send(payload(5), 0);
        transmit_all(&mut channel, start + Duration::from_millis(50));
        assert_eq!(channel.lowest_pending(), 0);

        assert!(channel.on_ack(SegmentId::new(1, 0)));
        assert_eq!(channel.lowest_pending(), 0);

        // message 0 is given up, message 2 still waits for its ACK
        channel.poll_timers(start + Duration::from_millis(100), REASSEMBLY_TIMEOUT);
        assert_eq!(channel.num_pending(), 1);
        assert_eq!(channel.lowest_pending(), 2);

        assert!(channel.on_ack(SegmentId::new(2, 0)));
        assert_eq!(channel.lowest_pending(), 3);
    }

    #[test]
    fn test_receiver_forgets_abandoned_messages() {
        let now = Instant::now();
        let mut receiver = ReliableChannel::new(&config());

        // the first segment of message 0 arrives, the rest is lost for good
        let partial = Segment { id: SegmentId::new(0, 0), count: 2, payload: Bytes::from_static(b"a") };
        assert_eq!(receiver.on_data(&partial, 0, now), DataOutcome { ack: true, delivered: None });

        for message_seq in 1..=1000 {
            let segment = Segment { id: SegmentId::new(message_seq, 0), count: 1, payload: Bytes::from_static(b"x") };
            assert!(receiver.on_data(&segment, 1, now).delivered.is_some());
        }
        assert_eq!(receiver.delivered.num_sparse(), 0);
        assert!(receiver.inbound.is_empty());

        // a late copy of the abandoned message is acknowledged, but not delivered
        let late = Segment { id: SegmentId::new(0, 1), count: 2, payload: Bytes::from_static(b"b") };
        assert_eq!(receiver.on_data(&late, 1001, now), DataOutcome { ack: true, delivered: None });
    }

    #[test]
    fn test_sequence_space_exhausted() {
        let mut channel = ReliableChannel::new(&config());
        channel.skip_to_message_seq(u32::MAX - 1);
        assert!(!channel.is_sequence_space_exhausted());

        let mut last = channel.send(payload(5), 0);
        assert_eq!(last.sent.try_result(), None);
        assert!(channel.is_sequence_space_exhausted());
        assert_eq!(channel.take_unsent()[0].segment.id, SegmentId::new(u32::MAX - 1, 0));

        let mut rejected = channel.send(payload(5), 0);
        let expected = Err(TransportError::ConnectionClosed(DisconnectReason::SequenceSpaceExhausted));
        assert_eq!(rejected.sent.try_result(), Some(expected.clone()));
        assert_eq!(rejected.received.try_result(), Some(expected));
        assert_eq!(channel.num_pending(), 1);
    }

    #[test]
    fn test_inconsistent_segment_not_acked() {
        let now = Instant::now();
        let mut receiver = ReliableChannel::new(&config());

        let first = Segment { id: SegmentId::new(0, 0), count: 2, payload: Bytes::from_static(b"a") };
        let other = Segment { id: SegmentId::new(0, 1), count: 3, payload: Bytes::from_static(b"b") };
        assert!(receiver.on_data(&first, 0, now).ack);
        assert_eq!(receiver.on_data(&other, 0, now), DataOutcome { ack: false, delivered: None });
    }
}
