// Live view over the ring buffer behind the common channel capability set,
// with a private cursor. Loss shows up as `None` here; consumers that need
// to distinguish lapping from an idle producer read the ring directly.

use std::sync::Arc;

use crate::channel::Channel;
use crate::error::Result;
use crate::message::{Msg, SeqNum};
use crate::ring::{ConsumerCursor, ReadStatus, RingBuffer};

pub struct RingChannel {
    ring: Arc<RingBuffer>,
    label: String,
    is_open: bool,
    cursor: ConsumerCursor,
}

impl RingChannel {
    pub fn new(ring: Arc<RingBuffer>, label: impl Into<String>) -> Self {
        Self {
            ring,
            label: label.into(),
            is_open: false,
            cursor: ConsumerCursor::new(),
        }
    }

    pub fn current_seq(&self) -> SeqNum {
        self.cursor.get()
    }

    pub fn set_current_seq(&self, seq: SeqNum) {
        self.cursor.set(seq);
    }
}

impl Channel for RingChannel {
    fn open(&mut self) -> Result<()> {
        self.cursor.set(0);
        self.is_open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.is_open = false;
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn read_next(&mut self) -> Option<Msg> {
        if !self.is_open {
            return None;
        }
        match self.ring.read(self.cursor.get()) {
            ReadStatus::Ok(msg) => {
                self.cursor.advance();
                Some(msg)
            }
            ReadStatus::NotReady | ReadStatus::Overwritten => None,
        }
    }

    fn peek(&mut self) -> Option<Msg> {
        if !self.is_open {
            return None;
        }
        match self.ring.read(self.cursor.get()) {
            ReadStatus::Ok(msg) => Some(msg),
            ReadStatus::NotReady | ReadStatus::Overwritten => None,
        }
    }

    fn name(&self) -> String {
        format!("ring:{}", self.label)
    }

    fn latest_seq(&self) -> SeqNum {
        self.ring.latest_seq()
    }

    /// Succeeds only while `seq` is inside the live window
    /// `[latest - capacity + 1, latest]`.
    fn seek(&mut self, seq: SeqNum) -> bool {
        if seq < 0 {
            return false;
        }
        let latest = self.ring.latest_seq();
        let oldest = std::cmp::max(0, latest - self.ring.capacity() as i64 + 1);
        if seq > latest || seq < oldest {
            return false;
        }
        self.cursor.set(seq);
        true
    }
}
