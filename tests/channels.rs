// The channel capability set over the live ring buffer, and the validated
// replay reader running on top of it.

use std::sync::Arc;

use mktreplay::channel::Channel;
use mktreplay::message::current_timestamp_ns;
use mktreplay::{Msg, ReplayReader, RingBuffer, RingChannel, INVALID_SEQ};

fn push_n(ring: &RingBuffer, n: i64) {
    for i in 0..n {
        ring.push(Msg::new(INVALID_SEQ, current_timestamp_ns(), i as f64));
    }
}

#[test]
fn ring_channel_reads_in_order() {
    let ring = Arc::new(RingBuffer::new(64));
    push_n(&ring, 10);

    let mut channel = RingChannel::new(Arc::clone(&ring), "test");
    assert!(channel.read_next().is_none());

    channel.open().unwrap();
    assert!(channel.is_open());
    assert_eq!(channel.latest_seq(), 9);

    let peeked = channel.peek().unwrap();
    assert_eq!(peeked.seq, 0);

    for i in 0..10 {
        let msg = channel.read_next().unwrap();
        assert_eq!(msg.seq, i);
    }
    // Caught up with the producer.
    assert!(channel.read_next().is_none());
    assert_eq!(channel.current_seq(), 10);
}

#[test]
fn ring_channel_seek_respects_live_window() {
    let ring = Arc::new(RingBuffer::new(16));
    push_n(&ring, 40); // window is now [24, 39]

    let mut channel = RingChannel::new(Arc::clone(&ring), "window");
    channel.open().unwrap();

    assert!(!channel.seek(-1));
    assert!(!channel.seek(0), "oldest slots are overwritten");
    assert!(!channel.seek(23));
    assert!(channel.seek(24));
    assert!(channel.seek(39));
    assert!(!channel.seek(40), "beyond the head");

    assert!(channel.seek(30));
    assert_eq!(channel.read_next().unwrap().seq, 30);
}

#[test]
fn ring_channel_returns_none_when_lapped() {
    let ring = Arc::new(RingBuffer::new(8));
    let mut channel = RingChannel::new(Arc::clone(&ring), "lapped");
    channel.open().unwrap();

    push_n(&ring, 20);
    // Cursor 0 is far behind the window; the capability-set view cannot
    // express the lap, so it reads nothing.
    assert!(channel.read_next().is_none());
    assert_eq!(channel.current_seq(), 0);
}

// The replay reader is generic over its channel: replaying the live ring
// gives a validated view of the in-flight stream.
#[test]
fn replay_reader_over_live_ring() {
    let ring = Arc::new(RingBuffer::new(64));
    push_n(&ring, 20);

    let mut replay = ReplayReader::new(RingChannel::new(Arc::clone(&ring), "live"));
    replay.open().unwrap();

    let mut count = 0;
    while let Some(msg) = replay.next_message() {
        assert_eq!(msg.seq, count);
        count += 1;
    }
    assert_eq!(count, 20);
    // Ring sequences are assigned monotonically; a clean stream has no
    // violations.
    assert_eq!(replay.seq_violation_count(), 0);

    // New messages continue the stream without resetting the baseline.
    push_n(&ring, 5);
    assert_eq!(replay.next_message().unwrap().seq, 20);
}
