//! Fragmentation and reassembly of oversized packets.
//!
//! A packet larger than the link's fragment size is split into fragments that
//! share a random fragment id. Each fragment travels as its own packet whose
//! payload is `fragment_id(8) | index(2) | total(2) | original_type(1) | data`.
//! The receiver collects fragments per id in any order and hands back the
//! original bytes once every index has arrived.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use serde::Serialize;
use tracing::debug;

use crate::header::PacketType;
use crate::WireError;

/// Size of the fragment sub-header
pub const FRAGMENT_HEADER_SIZE: usize = 8 + 2 + 2 + 1;

/// Default data bytes per fragment
pub const DEFAULT_FRAGMENT_SIZE: usize = 500;

/// Incomplete buffers older than this are dropped
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on concurrently open reassembly buffers
pub const DEFAULT_MAX_BUFFERS: usize = 128;

/// Identifier shared by all fragments of one packet
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(pub [u8; 8]);

impl FragmentId {
    /// Generate a fresh random id
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentId({})", self)
    }
}

/// One piece of a fragmented packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Shared id
    pub fragment_id: FragmentId,
    /// 0-based position
    pub index: u16,
    /// Number of fragments
    pub total: u16,
    /// Type of the wrapped packet
    pub original_type: PacketType,
    /// Fragment data
    pub data: Bytes,
}

impl Fragment {
    /// Packet type this fragment travels as
    pub fn packet_type(&self) -> PacketType {
        if self.index == 0 {
            PacketType::FragmentStart
        } else if self.index + 1 >= self.total {
            PacketType::FragmentEnd
        } else {
            PacketType::FragmentContinue
        }
    }

    /// Encode the fragment sub-payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + self.data.len());
        buf.put_slice(&self.fragment_id.0);
        buf.put_u16(self.index);
        buf.put_u16(self.total);
        buf.put_u8(self.original_type as u8);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode a fragment sub-payload
    pub fn decode(payload: Bytes) -> Result<Self, WireError> {
        let mut buf = payload;
        if buf.remaining() < FRAGMENT_HEADER_SIZE {
            return Err(WireError::MalformedPacket("fragment shorter than header"));
        }

        let mut id = [0u8; 8];
        buf.copy_to_slice(&mut id);
        let index = buf.get_u16();
        let total = buf.get_u16();
        let original_type = PacketType::try_from(buf.get_u8())?;

        if total == 0 {
            return Err(WireError::InvalidFragment("total is zero"));
        }
        if index >= total {
            return Err(WireError::InvalidFragment("index out of range"));
        }

        Ok(Self {
            fragment_id: FragmentId(id),
            index,
            total,
            original_type,
            data: buf,
        })
    }
}

/// Split `data` into fragments of at most `max_fragment_size` bytes.
///
/// Data that already fits yields a single fragment with `index = 0` and
/// `total = 1`.
pub fn fragment(
    data: Bytes,
    max_fragment_size: usize,
    original_type: PacketType,
) -> Result<Vec<Fragment>, WireError> {
    if max_fragment_size == 0 {
        return Err(WireError::InvalidFragment("fragment size is zero"));
    }

    let count = if data.is_empty() {
        1
    } else {
        (data.len() + max_fragment_size - 1) / max_fragment_size
    };
    if count > u16::MAX as usize {
        return Err(WireError::InvalidFragment("too many fragments"));
    }
    let total = count as u16;
    let fragment_id = FragmentId::random();

    let mut fragments = Vec::with_capacity(count);
    let mut offset = 0;
    for index in 0..total {
        let end = std::cmp::min(offset + max_fragment_size, data.len());
        fragments.push(Fragment {
            fragment_id,
            index,
            total,
            original_type,
            data: data.slice(offset..end),
        });
        offset = end;
    }

    debug!(
        "split {} bytes into {} fragments (id {})",
        data.len(),
        total,
        fragment_id
    );
    Ok(fragments)
}

/// Bytes recovered from a complete set of fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    /// Id the fragments shared
    pub fragment_id: FragmentId,
    /// Type of the wrapped packet
    pub original_type: PacketType,
    /// Original bytes
    pub data: Bytes,
}

#[derive(Debug)]
struct ReassemblyBuffer {
    total: u16,
    original_type: PacketType,
    received: BTreeMap<u16, Bytes>,
    created_at: Instant,
}

impl ReassemblyBuffer {
    fn is_complete(&self) -> bool {
        self.received.len() == self.total as usize
    }

    fn assemble(self) -> Bytes {
        let size = self.received.values().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(size);
        for data in self.received.into_values() {
            out.extend_from_slice(&data);
        }
        out.freeze()
    }
}

/// Reassembler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    /// Messages handed back complete
    pub completed: u64,
    /// Buffers dropped by the timeout sweep
    pub timed_out: u64,
    /// Buffers evicted to respect the buffer bound
    pub evicted: u64,
    /// Fragments rejected as orphans
    pub orphans: u64,
}

/// Collects fragments into complete packets
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<FragmentId, ReassemblyBuffer>,
    finished: HashMap<FragmentId, Instant>,
    timeout: Duration,
    max_buffers: usize,
    stats: ReassemblyStats,
}

impl Reassembler {
    /// Create a reassembler with the given buffer timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            finished: HashMap::new(),
            timeout,
            max_buffers: DEFAULT_MAX_BUFFERS,
            stats: ReassemblyStats::default(),
        }
    }

    /// Bound the number of concurrently open buffers
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers.max(1);
        self
    }

    /// Number of incomplete messages being collected
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Counters
    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Add a fragment, returning the original bytes once all fragments arrived
    pub fn reassemble(&mut self, fragment: Fragment) -> Result<Option<Reassembled>, WireError> {
        self.reassemble_at(fragment, Instant::now())
    }

    /// Same as [`reassemble`](Self::reassemble) with an explicit clock reading
    pub fn reassemble_at(
        &mut self,
        fragment: Fragment,
        now: Instant,
    ) -> Result<Option<Reassembled>, WireError> {
        if fragment.total == 0 || fragment.index >= fragment.total {
            return Err(WireError::InvalidFragment("index out of range"));
        }

        let id = fragment.fragment_id;
        if self.finished.contains_key(&id) {
            self.stats.orphans += 1;
            return Err(WireError::OrphanFragment(id));
        }

        if let Some(open) = self.buffers.get(&id) {
            if open.total != fragment.total {
                return Err(WireError::InvalidFragment("total disagrees with earlier fragments"));
            }
        }

        if fragment.total == 1 {
            self.mark_finished(id, now);
            self.stats.completed += 1;
            return Ok(Some(Reassembled {
                fragment_id: id,
                original_type: fragment.original_type,
                data: fragment.data,
            }));
        }

        if !self.buffers.contains_key(&id) && self.buffers.len() >= self.max_buffers {
            self.evict_oldest();
        }

        let buffer = self.buffers.entry(id).or_insert_with(|| ReassemblyBuffer {
            total: fragment.total,
            original_type: fragment.original_type,
            received: BTreeMap::new(),
            created_at: now,
        });

        if buffer.total != fragment.total {
            return Err(WireError::InvalidFragment("total disagrees with earlier fragments"));
        }

        buffer.received.insert(fragment.index, fragment.data);

        if !buffer.is_complete() {
            return Ok(None);
        }

        let Some(buffer) = self.buffers.remove(&id) else {
            return Ok(None);
        };
        let original_type = buffer.original_type;
        let data = buffer.assemble();
        self.mark_finished(id, now);
        self.stats.completed += 1;

        debug!("reassembled {} bytes from fragment set {}", data.len(), id);
        Ok(Some(Reassembled {
            fragment_id: id,
            original_type,
            data,
        }))
    }

    /// Drop buffers older than the timeout. Returns how many were dropped.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Same as [`sweep`](Self::sweep) with an explicit clock reading
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.buffers.len();
        let mut expired = Vec::new();
        self.buffers.retain(|id, buffer| {
            let keep = now.saturating_duration_since(buffer.created_at) < timeout;
            if !keep {
                expired.push(*id);
            }
            keep
        });
        for id in &expired {
            debug!("reassembly of {} timed out", id);
            self.finished.insert(*id, now);
        }
        self.finished
            .retain(|_, at| now.saturating_duration_since(*at) < timeout);

        let dropped = before - self.buffers.len();
        self.stats.timed_out += dropped as u64;
        dropped
    }

    fn mark_finished(&mut self, id: FragmentId, now: Instant) {
        self.finished.insert(id, now);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.created_at)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            debug!("evicting reassembly buffer {} to make room", id);
            self.buffers.remove(&id);
            self.stats.evicted += 1;
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_small_payload_single_fragment() {
        let data = payload(500);
        let fragments = fragment(data.clone(), 500, PacketType::Message).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].index, 0);
        assert_eq!(fragments[0].total, 1);

        let mut reassembler = Reassembler::default();
        let done = reassembler
            .reassemble(fragments[0].clone())
            .unwrap()
            .unwrap();
        assert_eq!(done.data, data);
        assert_eq!(done.original_type, PacketType::Message);
    }

    #[test]
    fn test_empty_payload_single_fragment() {
        let fragments = fragment(Bytes::new(), 10, PacketType::Message).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].total, 1);
        assert!(fragments[0].data.is_empty());
    }

    #[test]
    fn test_large_payload_splits_and_concatenates() {
        let data = payload(1234);
        let fragments = fragment(data.clone(), 100, PacketType::Message).unwrap();
        assert_eq!(fragments.len(), 13);
        assert!(fragments.iter().all(|f| f.total == 13));
        assert!(fragments
            .iter()
            .all(|f| f.fragment_id == fragments[0].fragment_id));
        assert_eq!(fragments[12].data.len(), 34);

        let joined: Vec<u8> = fragments.iter().flat_map(|f| f.data.to_vec()).collect();
        assert_eq!(Bytes::from(joined), data);

        assert_eq!(fragments[0].packet_type(), PacketType::FragmentStart);
        assert_eq!(fragments[5].packet_type(), PacketType::FragmentContinue);
        assert_eq!(fragments[12].packet_type(), PacketType::FragmentEnd);
    }

    #[test]
    fn test_fresh_id_per_call() {
        let a = fragment(payload(300), 100, PacketType::Message).unwrap();
        let b = fragment(payload(300), 100, PacketType::Message).unwrap();
        assert_ne!(a[0].fragment_id, b[0].fragment_id);
    }

    #[test]
    fn test_zero_fragment_size_rejected() {
        assert!(matches!(
            fragment(payload(10), 0, PacketType::Message),
            Err(WireError::InvalidFragment(_))
        ));
    }

    #[test]
    fn test_in_order_reassembly() {
        let data = payload(1000);
        let fragments = fragment(data.clone(), 300, PacketType::Message).unwrap();
        let mut reassembler = Reassembler::default();

        let last = fragments.len() - 1;
        for (i, f) in fragments.into_iter().enumerate() {
            let result = reassembler.reassemble(f).unwrap();
            if i < last {
                assert!(result.is_none());
                assert_eq!(reassembler.pending(), 1);
            } else {
                assert_eq!(result.unwrap().data, data);
            }
        }
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(reassembler.stats().completed, 1);
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let data = payload(2048);
        let fragments = fragment(data.clone(), 200, PacketType::Message).unwrap();
        let mut reassembler = Reassembler::default();

        let mut result = None;
        for f in fragments.into_iter().rev() {
            result = reassembler.reassemble(f).unwrap();
        }
        assert_eq!(result.unwrap().data, data);
    }

    #[test]
    fn test_duplicate_index_is_idempotent() {
        let data = payload(450);
        let fragments = fragment(data.clone(), 200, PacketType::Message).unwrap();
        let mut reassembler = Reassembler::default();

        assert!(reassembler.reassemble(fragments[0].clone()).unwrap().is_none());
        assert!(reassembler.reassemble(fragments[0].clone()).unwrap().is_none());
        assert!(reassembler.reassemble(fragments[1].clone()).unwrap().is_none());
        let done = reassembler
            .reassemble(fragments[2].clone())
            .unwrap()
            .unwrap();
        assert_eq!(done.data.len(), 450);
        assert_eq!(done.data, data);
    }

    #[test]
    fn test_late_fragment_after_completion_is_orphan() {
        let fragments = fragment(payload(300), 100, PacketType::Message).unwrap();
        let mut reassembler = Reassembler::default();
        for f in fragments.iter().cloned() {
            let _ = reassembler.reassemble(f).unwrap();
        }

        let id = fragments[1].fragment_id;
        assert_eq!(
            reassembler.reassemble(fragments[1].clone()),
            Err(WireError::OrphanFragment(id))
        );
        assert_eq!(reassembler.stats().orphans, 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_fragment_after_timeout_is_orphan() {
        let fragments = fragment(payload(300), 100, PacketType::Message).unwrap();
        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let start = Instant::now();

        reassembler
            .reassemble_at(fragments[0].clone(), start)
            .unwrap();
        assert_eq!(reassembler.sweep_at(start + Duration::from_secs(29)), 0);
        assert_eq!(reassembler.sweep_at(start + Duration::from_secs(31)), 1);
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(reassembler.stats().timed_out, 1);

        assert!(matches!(
            reassembler.reassemble_at(fragments[2].clone(), start + Duration::from_secs(32)),
            Err(WireError::OrphanFragment(_))
        ));

        // Tombstones expire as well
        reassembler.sweep_at(start + Duration::from_secs(90));
        assert!(reassembler
            .reassemble_at(fragments[2].clone(), start + Duration::from_secs(91))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_inconsistent_total_rejected() {
        let fragments = fragment(payload(300), 100, PacketType::Message).unwrap();
        let mut reassembler = Reassembler::default();
        reassembler.reassemble(fragments[0].clone()).unwrap();

        let mut bad = fragments[1].clone();
        bad.total = 5;
        assert!(matches!(
            reassembler.reassemble(bad),
            Err(WireError::InvalidFragment(_))
        ));

        let mut out_of_range = fragments[1].clone();
        out_of_range.index = 3;
        assert!(matches!(
            reassembler.reassemble(out_of_range),
            Err(WireError::InvalidFragment(_))
        ));
    }

    #[test]
    fn test_single_fragment_cannot_close_open_buffer() {
        let fragments = fragment(payload(300), 100, PacketType::Message).unwrap();
        let mut reassembler = Reassembler::default();
        reassembler.reassemble(fragments[0].clone()).unwrap();

        let mut lone = fragments[1].clone();
        lone.index = 0;
        lone.total = 1;
        assert!(matches!(
            reassembler.reassemble(lone),
            Err(WireError::InvalidFragment(_))
        ));
        assert_eq!(reassembler.pending(), 1);

        reassembler.reassemble(fragments[1].clone()).unwrap();
        let done = reassembler.reassemble(fragments[2].clone()).unwrap().unwrap();
        assert_eq!(done.data, payload(300));
    }

    #[test]
    fn test_buffer_bound_evicts_oldest() {
        let mut reassembler = Reassembler::default().with_max_buffers(2);
        let start = Instant::now();
        let sets: Vec<_> = (0..3)
            .map(|_| fragment(payload(200), 100, PacketType::Message).unwrap())
            .collect();

        for (i, set) in sets.iter().enumerate() {
            reassembler
                .reassemble_at(set[0].clone(), start + Duration::from_millis(i as u64))
                .unwrap();
        }
        assert_eq!(reassembler.pending(), 2);
        assert_eq!(reassembler.stats().evicted, 1);

        // The first set lost its buffer; its second half alone cannot complete it
        assert!(reassembler
            .reassemble_at(sets[0][1].clone(), start + Duration::from_millis(5))
            .unwrap()
            .is_none());
        assert!(reassembler
            .reassemble_at(sets[2][1].clone(), start + Duration::from_millis(6))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_sub_payload_encode_decode() {
        let fragments = fragment(payload(250), 100, PacketType::Message).unwrap();
        for f in fragments {
            let decoded = Fragment::decode(f.encode()).unwrap();
            assert_eq!(decoded, f);
        }

        assert!(matches!(
            Fragment::decode(Bytes::from_static(&[0u8; 5])),
            Err(WireError::MalformedPacket(_))
        ));
    }
}
