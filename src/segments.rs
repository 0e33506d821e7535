use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hash;
use std::time::Duration;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::error::TransportError;
use crate::packet::Segment;
use crate::peer_addr::PeerAddress;

/// Splits a payload into chunks of at most `max_segment_len` bytes. An empty payload is a single
///  empty segment, so that it is still delivered (and acknowledged) as a message.
pub fn split_payload(payload: &Bytes, max_segment_len: usize) -> Result<Vec<Bytes>, TransportError> {
    let max_len = max_segment_len.saturating_mul(u16::MAX as usize);
    if max_segment_len == 0 || payload.len() > max_len {
        return Err(TransportError::PayloadTooLarge { len: payload.len(), max: max_len });
    }

    if payload.is_empty() {
        return Ok(vec![Bytes::new()]);
    }

    let mut result = Vec::with_capacity(payload.len().div_ceil(max_segment_len));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + max_segment_len).min(payload.len());
        result.push(payload.slice(offset..end));
        offset = end;
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InsertOutcome {
    Accepted,
    /// the index was received before - the segment is ignored
    Duplicate,
    /// the segment's count does not match the message's count
    Inconsistent,
}

/// Reassembly state for one partially received message
#[derive(Debug)]
pub struct InboundAssembly {
    segment_count: u16,
    segments: BTreeMap<u16, Bytes>,
    num_bytes: usize,
    created_at: Instant,
}

impl InboundAssembly {
    pub fn new(segment_count: u16, now: Instant) -> InboundAssembly {
        InboundAssembly {
            segment_count,
            segments: BTreeMap::new(),
            num_bytes: 0,
            created_at: now,
        }
    }

    pub fn insert(&mut self, segment: &Segment) -> InsertOutcome {
        if segment.count != self.segment_count || segment.id.index >= self.segment_count {
            return InsertOutcome::Inconsistent;
        }
        if self.segments.contains_key(&segment.id.index) {
            return InsertOutcome::Duplicate;
        }
        self.num_bytes += segment.payload.len();
        self.segments.insert(segment.id.index, segment.payload.clone());
        InsertOutcome::Accepted
    }

    pub fn is_complete(&self) -> bool {
        self.segments.len() == self.segment_count as usize
    }

    /// concatenates the segments in index order
    pub fn assemble(self) -> Bytes {
        if self.segments.len() == 1 {
            if let Some((_, payload)) = self.segments.into_iter().next() {
                return payload;
            }
            return Bytes::new();
        }

        let mut buf = BytesMut::with_capacity(self.num_bytes);
        for payload in self.segments.values() {
            buf.put_slice(payload);
        }
        buf.freeze()
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum SegmentOutcome {
    /// the segment was stored, more are missing
    Incomplete,
    /// the segment completed its message
    Complete(Bytes),
    Duplicate,
    Inconsistent,
}

/// Collects segments of several messages, keyed by the message they belong to
pub struct Reassembler<K> {
    assemblies: FxHashMap<K, InboundAssembly>,
}

impl<K> Default for Reassembler<K> {
    fn default() -> Self {
        Reassembler { assemblies: FxHashMap::default() }
    }
}

impl<K: Hash + Eq + Copy + std::fmt::Debug> Reassembler<K> {
    pub fn on_segment(&mut self, key: K, segment: &Segment, now: Instant) -> SegmentOutcome {
        let assembly = self.assemblies
            .entry(key)
            .or_insert_with(|| InboundAssembly::new(segment.count, now));

        match assembly.insert(segment) {
            InsertOutcome::Accepted => {}
            InsertOutcome::Duplicate => return SegmentOutcome::Duplicate,
            InsertOutcome::Inconsistent => {
                debug!("segment {:?} is inconsistent with earlier segments of message {:?} - dropping", segment, key);
                return SegmentOutcome::Inconsistent;
            }
        }

        if !assembly.is_complete() {
            return SegmentOutcome::Incomplete;
        }
        match self.assemblies.remove(&key) {
            Some(assembly) => SegmentOutcome::Complete(assembly.assemble()),
            None => SegmentOutcome::Incomplete,
        }
    }

    /// discards assemblies for which `keep` returns `false`
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.assemblies.retain(|key, _| keep(key));
    }

    /// discards assemblies that were started more than `timeout` ago
    pub fn expire(&mut self, now: Instant, timeout: Duration) {
        self.assemblies.retain(|key, assembly| {
            let keep = now.saturating_duration_since(assembly.created_at) < timeout;
            if !keep {
                debug!("discarding incomplete message {:?}: {} of {} segments after {:?}", key, assembly.segments.len(), assembly.segment_count, timeout);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }
}

/// The message sequence numbers a reliable channel delivered so far. Sequence numbers are assigned
///  consecutively, so the set is stored as a watermark (everything below it is done with) and
///  the delivered numbers above it.
///
/// A message the sender gave up on leaves a gap that no delivery fills. The sender's lowest
///  pending sequence number moves past such gaps (see [DeliveredSet::advance_to]), which keeps
///  the sparse part as small as the sender's window of unresolved messages.
#[derive(Debug, Default)]
pub struct DeliveredSet {
    watermark: u32,
    above_watermark: BTreeSet<u32>,
}

impl DeliveredSet {
    pub fn contains(&self, message_seq: u32) -> bool {
        message_seq < self.watermark || self.above_watermark.contains(&message_seq)
    }

    /// returns `false` if the sequence number was already in the set
    pub fn insert(&mut self, message_seq: u32) -> bool {
        if self.contains(message_seq) {
            return false;
        }
        self.above_watermark.insert(message_seq);
        self.drain_contiguous();
        true
    }

    /// Treats everything below `lowest_pending` as done with: the sender will not transmit it
    ///  again. Returns `false` if the watermark was at or above it already.
    pub fn advance_to(&mut self, lowest_pending: u32) -> bool {
        if lowest_pending <= self.watermark {
            return false;
        }
        self.watermark = lowest_pending;
        self.above_watermark = self.above_watermark.split_off(&lowest_pending);
        self.drain_contiguous();
        true
    }

    fn drain_contiguous(&mut self) {
        while self.watermark < u32::MAX && self.above_watermark.remove(&self.watermark) {
            self.watermark += 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn num_sparse(&self) -> usize {
        self.above_watermark.len()
    }
}

/// Reassembly of unreliable messages, which are keyed by sender and the sender's sequence number.
///  Completed messages are remembered for a while so that duplicated datagrams are not delivered
///  a second time.
#[derive(Default)]
pub struct UnreliableReassembler {
    assemblies: Reassembler<(PeerAddress, u32)>,
    completed: FxHashMap<(PeerAddress, u32), Instant>,
}

impl UnreliableReassembler {
    pub fn on_segment(&mut self, from: PeerAddress, segment: &Segment, now: Instant) -> Option<Bytes> {
        let key = (from, segment.id.message_seq);
        if self.completed.contains_key(&key) {
            trace!("duplicate segment of completed unreliable message {:?}", key);
            return None;
        }

        match self.assemblies.on_segment(key, segment, now) {
            SegmentOutcome::Complete(payload) => {
                self.completed.insert(key, now);
                Some(payload)
            }
            _ => None,
        }
    }

    pub fn expire(&mut self, now: Instant, timeout: Duration) {
        self.assemblies.expire(now, timeout);
        self.completed.retain(|_, completed_at| now.saturating_duration_since(*completed_at) < timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::packet::SegmentId;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>().into()
    }

    fn segments_of(message_seq: u32, payload: &Bytes, max_len: usize) -> Vec<Segment> {
        let chunks = split_payload(payload, max_len).unwrap();
        let count = chunks.len() as u16;
        chunks.into_iter()
            .enumerate()
            .map(|(i, chunk)| Segment { id: SegmentId::new(message_seq, i as u16), count, payload: chunk })
            .collect()
    }

    #[rstest]
    #[case::empty(0, 10, vec![0])]
    #[case::single(5, 10, vec![5])]
    #[case::exact(10, 10, vec![10])]
    #[case::one_over(11, 10, vec![10, 1])]
    #[case::several(25, 10, vec![10, 10, 5])]
    #[case::large(2000, 1006, vec![1006, 994])]
    fn test_split_payload(#[case] len: usize, #[case] max_len: usize, #[case] expected: Vec<usize>) {
        let payload = payload(len);
        let segments = split_payload(&payload, max_len).unwrap();
        assert_eq!(segments.iter().map(|s| s.len()).collect::<Vec<_>>(), expected);
        assert_eq!(segments.concat(), payload.to_vec());
    }

    #[test]
    fn test_split_payload_too_large() {
        let payload = payload(2 * u16::MAX as usize + 1);
        assert_eq!(
            split_payload(&payload, 2),
            Err(TransportError::PayloadTooLarge { len: payload.len(), max: 2 * u16::MAX as usize }),
        );
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3])]
    #[case::reversed(vec![3, 2, 1, 0])]
    #[case::shuffled(vec![2, 0, 3, 1])]
    fn test_reassembly_order_independent(#[case] order: Vec<usize>) {
        let now = Instant::now();
        let payload = payload(35);
        let segments = segments_of(4, &payload, 10);

        let mut reassembler = Reassembler::default();
        for (n, &i) in order.iter().enumerate() {
            let outcome = reassembler.on_segment(4u32, &segments[i], now);
            if n + 1 < order.len() {
                assert_eq!(outcome, SegmentOutcome::Incomplete);
            }
            else {
                assert_eq!(outcome, SegmentOutcome::Complete(payload.clone()));
            }
        }
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_reassembly_duplicate_absorbed() {
        let now = Instant::now();
        let payload = payload(25);
        let segments = segments_of(1, &payload, 10);

        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.on_segment(1u32, &segments[1], now), SegmentOutcome::Incomplete);
        assert_eq!(reassembler.on_segment(1u32, &segments[1], now), SegmentOutcome::Duplicate);
        assert_eq!(reassembler.on_segment(1u32, &segments[0], now), SegmentOutcome::Incomplete);
        assert_eq!(reassembler.on_segment(1u32, &segments[2], now), SegmentOutcome::Complete(payload));
    }

    #[test]
    fn test_reassembly_inconsistent_count() {
        let now = Instant::now();
        let mut reassembler = Reassembler::default();
        let first = Segment { id: SegmentId::new(1, 0), count: 3, payload: Bytes::from_static(b"a") };
        let other = Segment { id: SegmentId::new(1, 1), count: 2, payload: Bytes::from_static(b"b") };

        assert_eq!(reassembler.on_segment(1u32, &first, now), SegmentOutcome::Incomplete);
        assert_eq!(reassembler.on_segment(1u32, &other, now), SegmentOutcome::Inconsistent);
        assert_eq!(reassembler.len(), 1);
    }

    #[test]
    fn test_reassembly_interleaved_messages() {
        let now = Instant::now();
        let a = payload(15);
        let b = Bytes::from_static(b"0123456789abcdefghij");
        let segments_a = segments_of(1, &a, 10);
        let segments_b = segments_of(2, &b, 10);

        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.on_segment(1u32, &segments_a[0], now), SegmentOutcome::Incomplete);
        assert_eq!(reassembler.on_segment(2u32, &segments_b[1], now), SegmentOutcome::Incomplete);
        assert_eq!(reassembler.on_segment(2u32, &segments_b[0], now), SegmentOutcome::Complete(b));
        assert_eq!(reassembler.on_segment(1u32, &segments_a[1], now), SegmentOutcome::Complete(a));
    }

    #[test]
    fn test_reassembly_expiry() {
        let now = Instant::now();
        let segments = segments_of(1, &payload(25), 10);

        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.on_segment(1u32, &segments[0], now), SegmentOutcome::Incomplete);

        reassembler.expire(now + Duration::from_secs(29), Duration::from_secs(30));
        assert_eq!(reassembler.len(), 1);
        reassembler.expire(now + Duration::from_secs(30), Duration::from_secs(30));
        assert!(reassembler.is_empty());

        // a late segment starts over rather than completing anything
        assert_eq!(reassembler.on_segment(1u32, &segments[1], now), SegmentOutcome::Incomplete);
    }

    #[test]
    fn test_delivered_set_compaction() {
        let mut delivered = DeliveredSet::default();
        assert!(delivered.insert(1));
        assert!(delivered.insert(3));
        assert!(!delivered.insert(3));
        assert!(delivered.contains(1));
        assert!(!delivered.contains(0));
        assert!(!delivered.contains(2));
        assert_eq!(delivered.num_sparse(), 2);

        assert!(delivered.insert(0));
        assert_eq!(delivered.num_sparse(), 1);
        assert!(delivered.insert(2));
        assert_eq!(delivered.num_sparse(), 0);
        for seq in 0..4 {
            assert!(delivered.contains(seq));
            assert!(!delivered.insert(seq));
        }
        assert!(!delivered.contains(4));
    }

    #[test]
    fn test_delivered_set_skips_abandoned_gap() {
        let mut delivered = DeliveredSet::default();
        for seq in 1..=10_000 {
            assert!(delivered.insert(seq));
        }
        assert_eq!(delivered.num_sparse(), 10_000);

        // the sender gave up on message 0
        assert!(delivered.advance_to(1));
        assert_eq!(delivered.num_sparse(), 0);
        assert!(delivered.contains(0));
        assert!(delivered.contains(10_000));
        assert!(!delivered.contains(10_001));

        assert!(!delivered.advance_to(5));
        assert!(delivered.insert(10_002));
        assert_eq!(delivered.num_sparse(), 1);
        assert!(delivered.advance_to(10_002));
        assert_eq!(delivered.num_sparse(), 0);
        assert!(delivered.contains(10_002));
    }

    #[test]
    fn test_delivered_set_top_of_sequence_space() {
        let mut delivered = DeliveredSet::default();
        assert!(delivered.advance_to(u32::MAX - 1));
        assert!(delivered.insert(u32::MAX - 1));
        assert!(delivered.contains(u32::MAX - 1));
        assert!(delivered.insert(u32::MAX));
        assert!(delivered.contains(u32::MAX));
        assert!(!delivered.insert(u32::MAX));
    }

    #[test]
    fn test_unreliable_duplicates_not_redelivered() {
        let now = Instant::now();
        let payload = payload(15);
        let segments = segments_of(9, &payload, 10);
        let from = PeerAddress::localhost(1);

        let mut reassembler = UnreliableReassembler::default();
        assert_eq!(reassembler.on_segment(from, &segments[0], now), None);
        assert_eq!(reassembler.on_segment(from, &segments[1], now), Some(payload.clone()));
        assert_eq!(reassembler.on_segment(from, &segments[1], now), None);
        assert_eq!(reassembler.on_segment(from, &segments[0], now), None);

        // same sequence number from a different sender is a different message
        let other = PeerAddress::localhost(2);
        assert_eq!(reassembler.on_segment(other, &segments[0], now), None);
        assert_eq!(reassembler.on_segment(other, &segments[1], now), Some(payload.clone()));

        reassembler.expire(now + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(reassembler.on_segment(from, &segments[0], now), None);
        assert_eq!(reassembler.on_segment(from, &segments[1], now), Some(payload));
    }
}
