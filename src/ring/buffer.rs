// Lock-free SPMC (single producer, multiple consumer) ring buffer.
//
// Sequence numbers are the indices: slot for seq S lives at S & (capacity-1),
// and each consumer tracks its own next sequence. The producer never blocks
// and never observes consumer state; consumers detect loss through the
// explicit read statuses.
//
// Correctness rests on three facts: the write cursor only ever moves forward
// (single producer); a slot's published sequence becomes S only after the
// message data for S is fully written (the Release store pairs with the
// consumer's Acquire load); and a consumer reading seq S therefore observes
// exactly one of the message for S (Ok), a newer publication (Overwritten,
// meaning it was lapped), or an older or unpublished slot (NotReady).

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

use crate::message::{Msg, SeqNum, INVALID_SEQ};

/// Cache line size assumed by the slot layout (x86-64 / aarch64 servers).
pub const CACHE_LINE_SIZE: usize = 64;

/// Outcome of a ring-buffer read at a specific sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadStatus {
    /// The message for the requested sequence, copied out consistently.
    Ok(Msg),
    /// The producer has not published this sequence yet.
    NotReady,
    /// The producer has lapped this slot; the message is gone.
    Overwritten,
}

/// One ring slot: a message plus the atomic published-sequence the seqlock
/// pivots on. Padded to exactly one cache line so adjacent slots never share
/// a line.
///
/// The layout is `#[repr(C)]` because the shared-memory ring places these
/// slots in a mapped region read by separate processes.
#[repr(C, align(64))]
pub(crate) struct Slot {
    msg: UnsafeCell<Msg>,
    seq: AtomicI64,
    _pad: [u8; CACHE_LINE_SIZE - std::mem::size_of::<Msg>() - std::mem::size_of::<AtomicI64>()],
}

const _: () = assert!(std::mem::size_of::<Slot>() == CACHE_LINE_SIZE);
const _: () = assert!(std::mem::align_of::<Slot>() == CACHE_LINE_SIZE);

// Concurrent access to `msg` is governed by the seqlock protocol below:
// the producer writes before the Release publish, consumers validate their
// copy against the published sequence on both sides of the read.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    pub(crate) fn empty() -> Self {
        Self {
            msg: UnsafeCell::new(Msg::default()),
            seq: AtomicI64::new(INVALID_SEQ),
            _pad: [0; CACHE_LINE_SIZE
                - std::mem::size_of::<Msg>()
                - std::mem::size_of::<AtomicI64>()],
        }
    }

    /// Reset the published sequence; used when (re)initialising a mapped
    /// region whose memory is not freshly constructed.
    pub(crate) fn clear(&self) {
        self.seq.store(INVALID_SEQ, Ordering::Relaxed);
    }

    pub(crate) fn published_seq(&self, order: Ordering) -> SeqNum {
        self.seq.load(order)
    }

    /// Producer side: stamp the assigned sequence into the message, write the
    /// data, then publish with a Release store.
    ///
    /// The message write races with concurrent seqlock reads; volatile access
    /// keeps the compiler from assuming exclusive ownership of the bytes.
    pub(crate) fn publish(&self, mut msg: Msg, seq: SeqNum) {
        msg.seq = seq;
        unsafe { std::ptr::write_volatile(self.msg.get(), msg) };
        self.seq.store(seq, Ordering::Release);
    }

    /// Consumer side: seqlock read. `expected_seq` must be non-negative.
    ///
    /// After copying the message we re-read the published sequence behind an
    /// acquire fence; any concurrent publication into this slot changes it,
    /// so a stable value proves the copy was not torn.
    pub(crate) fn read(&self, expected_seq: SeqNum) -> ReadStatus {
        let published = self.seq.load(Ordering::Acquire);

        if published == expected_seq {
            let local = unsafe { std::ptr::read_volatile(self.msg.get()) };
            fence(Ordering::Acquire);
            let recheck = self.seq.load(Ordering::Relaxed);
            if recheck == expected_seq {
                ReadStatus::Ok(local)
            } else {
                ReadStatus::Overwritten
            }
        } else if published > expected_seq {
            ReadStatus::Overwritten
        } else {
            // INVALID_SEQ or an older sequence: the producer hasn't reached
            // this wrap yet.
            ReadStatus::NotReady
        }
    }
}

/// The in-process SPMC ring buffer.
///
/// Capacity is fixed at construction, must be a power of two (bitmask
/// indexing) and at least 2. The producer-owned write cursor and the
/// overwrite counter live on their own cache lines so the hot publish path
/// never bounces against reader-visible metrics.
pub struct RingBuffer {
    slots: Box<[Slot]>,
    mask: usize,
    /// Next sequence to assign; only the producer advances it.
    write_seq: CachePadded<AtomicI64>,
    /// Count of publishes that replaced a previously published slot.
    overwrite_count: CachePadded<AtomicI64>,
}

impl RingBuffer {
    /// Create a ring with `capacity` slots.
    ///
    /// Panics if `capacity` is not a power of two or is below 2; both are
    /// construction bugs, not runtime conditions.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        assert!(capacity >= 2, "capacity must be at least 2");

        let slots: Box<[Slot]> = (0..capacity).map(|_| Slot::empty()).collect();
        Self {
            slots,
            mask: capacity - 1,
            write_seq: CachePadded::new(AtomicI64::new(0)),
            overwrite_count: CachePadded::new(AtomicI64::new(0)),
        }
    }

    /// Publish one message; returns the sequence assigned to it.
    ///
    /// Never blocks: when the ring is full the oldest slot is overwritten and
    /// the overwrite counter incremented. Slow consumers observe the loss via
    /// `ReadStatus::Overwritten`.
    pub fn push(&self, msg: Msg) -> SeqNum {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[seq as usize & self.mask];

        if slot.published_seq(Ordering::Acquire) != INVALID_SEQ {
            self.overwrite_count.fetch_add(1, Ordering::Relaxed);
        }
        slot.publish(msg, seq);
        seq
    }

    /// Publish a batch, reserving the whole contiguous sequence run with a
    /// single fetch-add, then publishing each slot in order with the normal
    /// per-slot protocol. Returns the first sequence of the batch, or
    /// `INVALID_SEQ` for an empty batch.
    pub fn push_batch(&self, msgs: &[Msg]) -> SeqNum {
        if msgs.is_empty() {
            return INVALID_SEQ;
        }

        let first = self.write_seq.fetch_add(msgs.len() as i64, Ordering::Relaxed);
        for (i, msg) in msgs.iter().enumerate() {
            let seq = first + i as i64;
            let slot = &self.slots[seq as usize & self.mask];
            if slot.published_seq(Ordering::Acquire) != INVALID_SEQ {
                self.overwrite_count.fetch_add(1, Ordering::Relaxed);
            }
            slot.publish(*msg, seq);
        }
        first
    }

    /// Read the message at `expected_seq` with an explicit status.
    pub fn read(&self, expected_seq: SeqNum) -> ReadStatus {
        if expected_seq < 0 {
            return ReadStatus::NotReady;
        }
        self.slots[expected_seq as usize & self.mask].read(expected_seq)
    }

    /// Latest published sequence, or `INVALID_SEQ` before the first push.
    pub fn latest_seq(&self) -> SeqNum {
        self.write_seq.load(Ordering::Acquire) - 1
    }

    /// Next sequence the producer will assign.
    pub fn next_write_seq(&self) -> SeqNum {
        self.write_seq.load(Ordering::Acquire)
    }

    /// Point-in-time availability probe; the slot may be overwritten
    /// immediately after this returns true.
    pub fn is_available(&self, seq: SeqNum) -> bool {
        if seq < 0 {
            return false;
        }
        self.slots[seq as usize & self.mask].published_seq(Ordering::Acquire) == seq
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate number of live messages currently held.
    pub fn len(&self) -> usize {
        let latest = self.latest_seq();
        if latest < 0 {
            0
        } else {
            std::cmp::min(latest as usize + 1, self.capacity())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slot overwrites since creation. After the first `capacity`
    /// pushes every push increments this; a nonzero value under a bounded
    /// workload means some consumer risked being lapped.
    pub fn overwrite_count(&self) -> i64 {
        self.overwrite_count.load(Ordering::Relaxed)
    }
}

/// A consumer's private read position: the next sequence it intends to read.
/// Not visible to other consumers; atomics only because the owning worker's
/// cursor is occasionally repositioned by a recovery running on another
/// thread.
#[derive(Debug)]
pub struct ConsumerCursor {
    read_seq: AtomicI64,
}

impl ConsumerCursor {
    pub fn new() -> Self {
        Self {
            read_seq: AtomicI64::new(0),
        }
    }

    pub fn get(&self) -> SeqNum {
        self.read_seq.load(Ordering::Acquire)
    }

    pub fn set(&self, seq: SeqNum) {
        self.read_seq.store(seq, Ordering::Release);
    }

    /// Advance by one, returning the previous position.
    pub fn advance(&self) -> SeqNum {
        self.read_seq.fetch_add(1, Ordering::AcqRel)
    }
}

impl Default for ConsumerCursor {
    fn default() -> Self {
        Self::new()
    }
}
