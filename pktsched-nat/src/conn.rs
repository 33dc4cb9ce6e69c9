//! Per-connection sequence offset bookkeeping.

use parking_lot::Mutex;
use pktsched_common::seq;

/// Direction of a packet relative to the connection's first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Original,
    Reply,
}

impl Direction {
    pub const fn reverse(self) -> Self {
        match self {
            Self::Original => Self::Reply,
            Self::Reply => Self::Original,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Original => 0,
            Self::Reply => 1,
        }
    }
}

/// How far the byte stream in one direction has shifted from what the sender wrote.
///
/// Only the most recent length change is tracked precisely: segments after `correction_pos`
/// shift by `offset_after`, older ones by `offset_before`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceOffset {
    /// Sequence number of the segment whose rewrite produced the latest change.
    pub correction_pos: u32,
    pub offset_before: i32,
    pub offset_after: i32,
}

impl SequenceOffset {
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.offset_before == 0 && self.offset_after == 0
    }

    /// Records a length change of `delta` bytes in the segment starting at `seq`.
    ///
    /// Returns `false` without recording if `seq` is not past the last correction, e.g. a
    /// retransmit of the segment that was already accounted for.
    pub fn record(&mut self, seq: u32, delta: i32) -> bool {
        if self.offset_before != self.offset_after && !seq::after(seq, self.correction_pos) {
            return false;
        }

        self.correction_pos = seq;
        self.offset_before = self.offset_after;
        self.offset_after = self.offset_after.wrapping_add(delta);
        true
    }

    /// Translates a sequence number the sender wrote into the rewritten stream.
    #[inline]
    pub fn map_seq(&self, seq: u32) -> u32 {
        if seq::after(seq, self.correction_pos) {
            seq::offset(seq, self.offset_after)
        } else {
            seq::offset(seq, self.offset_before)
        }
    }

    /// Translates a sequence number the peer acknowledged in the rewritten stream back to the
    /// sender's numbering.
    #[inline]
    pub fn map_ack(&self, ack: u32) -> u32 {
        if seq::after(seq::offset(ack, self.offset_before.wrapping_neg()), self.correction_pos) {
            seq::offset(ack, self.offset_after.wrapping_neg())
        } else {
            seq::offset(ack, self.offset_before.wrapping_neg())
        }
    }
}

/// The NAT state of a tracked connection that the mangler needs: one sequence offset per
/// direction.
#[derive(Debug, Default)]
pub struct NatConnection {
    seq: Mutex<[SequenceOffset; 2]>,
}

impl NatConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self, dir: Direction) -> SequenceOffset {
        self.seq.lock()[dir.index()]
    }

    /// Offsets of `dir` and of its reverse, read under one lock.
    pub fn offsets(&self, dir: Direction) -> (SequenceOffset, SequenceOffset) {
        let seq = self.seq.lock();
        (seq[dir.index()], seq[dir.reverse().index()])
    }

    /// Whether any rewrite changed a stream length, i.e. segments need renumbering.
    pub fn needs_seq_adjust(&self) -> bool {
        self.seq.lock().iter().any(|offset| !offset.is_zero())
    }

    pub(crate) fn record(&self, dir: Direction, seq: u32, delta: i32) -> bool {
        self.seq.lock()[dir.index()].record(seq, delta)
    }
}
