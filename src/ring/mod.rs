//! Lock-free ring buffers: the in-process SPMC queue and its shared-memory
//! twin for the multi-process mode. Both publish through the same seqlock
//! slot protocol.

pub mod buffer;
pub mod shm;

pub use buffer::{ConsumerCursor, ReadStatus, RingBuffer};
