//! Message channels: a unified capability set over the different data
//! sources (log files, the live ring buffer), plus the writable variant the
//! recorder persists through.

mod file;
mod ring;

pub use file::{FileChannel, FileWriteChannel};
pub use ring::RingChannel;

use crate::error::Result;
use crate::message::{Msg, SeqNum};

/// Read-side channel capability set.
///
/// `seek` positions the next read; channels that cannot honour the request
/// (closed, out of range, write-only) return `false` rather than failing.
pub trait Channel {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;

    /// Next message, or `None` when the channel is exhausted or closed.
    fn read_next(&mut self) -> Option<Msg>;

    /// Same as `read_next` without consuming the message.
    fn peek(&mut self) -> Option<Msg>;

    /// Human-readable channel description for logs.
    fn name(&self) -> String;

    /// Latest sequence available from this channel, `INVALID_SEQ` if none.
    fn latest_seq(&self) -> SeqNum;

    fn seek(&mut self, seq: SeqNum) -> bool;
}

/// Write-side extension used by the recorder.
pub trait WritableChannel: Channel {
    fn write(&mut self, msg: &Msg) -> Result<()>;

    /// Persist buffered records and integrity metadata to the underlying
    /// storage.
    fn flush(&mut self) -> Result<()>;
}
