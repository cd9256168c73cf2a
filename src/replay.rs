//! Validated sequential reader used for disk replay.
//!
//! Wraps any [`Channel`] with a monotonicity check: replayed sequences must
//! be strictly increasing. Violations are counted and logged but the message
//! is still returned; the consumer owns the policy, the reader only
//! observes.

use std::path::PathBuf;

use tracing::warn;

use crate::channel::{Channel, FileChannel};
use crate::error::Result;
use crate::message::{Msg, SeqNum, INVALID_SEQ};

pub struct ReplayReader<C: Channel = FileChannel> {
    channel: C,
    /// Last sequence returned; the validation baseline.
    last_read_seq: SeqNum,
    seq_violation_count: i64,
}

impl ReplayReader<FileChannel> {
    /// Replay reader over a recorded log file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(FileChannel::new(path))
    }

    pub fn message_count(&self) -> i64 {
        self.channel.message_count()
    }

    pub fn was_cleanly_closed(&self) -> bool {
        self.channel.was_cleanly_closed()
    }

    pub fn file_first_seq(&self) -> SeqNum {
        self.channel.first_seq()
    }

    pub fn file_last_seq(&self) -> SeqNum {
        self.channel.last_seq()
    }
}

impl<C: Channel> ReplayReader<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            last_read_seq: INVALID_SEQ,
            seq_violation_count: 0,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.channel.open()?;
        self.last_read_seq = INVALID_SEQ;
        self.seq_violation_count = 0;
        Ok(())
    }

    pub fn close(&mut self) {
        self.channel.close();
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Next message, validated against the previous one.
    pub fn next_message(&mut self) -> Option<Msg> {
        let msg = self.channel.read_next()?;
        if self.last_read_seq != INVALID_SEQ && msg.seq <= self.last_read_seq {
            self.seq_violation_count += 1;
            warn!(
                channel = %self.channel.name(),
                prev = self.last_read_seq,
                got = msg.seq,
                "replay sequence violation"
            );
        }
        self.last_read_seq = msg.seq;
        Some(msg)
    }

    pub fn peek_message(&mut self) -> Option<Msg> {
        self.channel.peek()
    }

    /// Reposition the underlying channel. Continuity cannot be verified
    /// across a seek, so the validation baseline is reset.
    pub fn seek(&mut self, seq: SeqNum) -> bool {
        let ok = self.channel.seek(seq);
        if ok {
            self.last_read_seq = INVALID_SEQ;
        }
        ok
    }

    /// Rewind to the first record.
    pub fn reset(&mut self) {
        self.channel.seek(0);
        self.last_read_seq = INVALID_SEQ;
    }

    pub fn latest_seq(&self) -> SeqNum {
        self.channel.latest_seq()
    }

    pub fn seq_violation_count(&self) -> i64 {
        self.seq_violation_count
    }
}
