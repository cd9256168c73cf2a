//! Real-time market-data replay pipeline.
//!
//! A single producer publishes a monotonic stream of fixed-size messages
//! into a lock-free SPMC ring buffer; a live aggregator and a durable
//! recorder consume it independently. When the aggregator is lost or lapped
//! it rebuilds its state by replaying the recorder's on-disk log and rejoins
//! the live stream without gap or overlap.

pub mod affinity;
pub mod aggregator;
pub mod channel;
pub mod error;
pub mod kahan;
pub mod logging;
pub mod message;
pub mod producer;
pub mod recorder;
pub mod replay;
pub mod ring;

pub use aggregator::{Aggregator, AggregatorState, FaultKind, FaultListener};
pub use channel::{Channel, FileChannel, FileWriteChannel, RingChannel, WritableChannel};
pub use error::{ReplayError, Result};
pub use kahan::KahanSum;
pub use message::{
    FileHeader, Msg, SeqNum, CATCHUP_THRESHOLD, DEFAULT_BATCH_SIZE, DEFAULT_RING_CAPACITY,
    FILE_FLAG_COMPLETE, FILE_MAGIC, FILE_VERSION, INVALID_SEQ,
};
pub use producer::Producer;
pub use recorder::Recorder;
pub use replay::ReplayReader;
pub use ring::{ConsumerCursor, ReadStatus, RingBuffer};
