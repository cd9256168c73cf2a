use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;

use mktreplay::{Msg, ReadStatus, RingBuffer, INVALID_SEQ};

fn msg(payload: f64) -> Msg {
    Msg::new(INVALID_SEQ, 0, payload)
}

#[test]
fn sequential_push_and_read() {
    let ring = RingBuffer::new(16);
    assert_eq!(ring.latest_seq(), INVALID_SEQ);
    assert_eq!(ring.read(0), ReadStatus::NotReady);

    for i in 0..8 {
        let seq = ring.push(msg(i as f64));
        assert_eq!(seq, i);
    }
    assert_eq!(ring.latest_seq(), 7);
    assert_eq!(ring.next_write_seq(), 8);
    assert_eq!(ring.len(), 8);

    for i in 0..8 {
        match ring.read(i) {
            ReadStatus::Ok(m) => {
                // The ring stamps its own sequence over the producer's.
                assert_eq!(m.seq, i);
                assert_eq!(m.payload, i as f64);
            }
            other => panic!("read({i}) returned {other:?}"),
        }
    }
    assert_eq!(ring.read(8), ReadStatus::NotReady);
    assert_eq!(ring.overwrite_count(), 0);
}

// Wrap a 16-slot ring with 32 messages: the first 16 are gone, the last 16
// readable, and the overwrite counter accounts for every replaced slot.
#[test]
fn tiny_ring_overwrite_detection() {
    let ring = RingBuffer::new(16);
    for i in 0..32 {
        ring.push(msg(i as f64));
    }

    assert_eq!(ring.read(0), ReadStatus::Overwritten);
    assert_eq!(ring.read(15), ReadStatus::Overwritten);

    match ring.read(16) {
        ReadStatus::Ok(m) => assert_eq!(m.payload, 16.0),
        other => panic!("read(16) returned {other:?}"),
    }
    assert!(matches!(ring.read(31), ReadStatus::Ok(_)));
    assert_eq!(ring.read(32), ReadStatus::NotReady);

    assert_eq!(ring.overwrite_count(), 16);
}

#[test]
fn push_batch_assigns_contiguous_sequences() {
    let ring = RingBuffer::new(64);
    let batch: Vec<Msg> = (0..10).map(|i| msg(i as f64 * 1.5)).collect();

    let first = ring.push_batch(&batch);
    assert_eq!(first, 0);
    assert_eq!(ring.latest_seq(), 9);

    for i in 0..10 {
        match ring.read(i) {
            ReadStatus::Ok(m) => {
                assert_eq!(m.seq, i);
                assert_eq!(m.payload, i as f64 * 1.5);
            }
            other => panic!("read({i}) returned {other:?}"),
        }
    }

    assert_eq!(ring.push_batch(&[]), INVALID_SEQ);
    let second = ring.push_batch(&batch[..3]);
    assert_eq!(second, 10);
}

#[test]
fn availability_probe() {
    let ring = RingBuffer::new(8);
    assert!(!ring.is_available(0));
    assert!(!ring.is_available(-1));
    ring.push(msg(1.0));
    assert!(ring.is_available(0));
    assert!(!ring.is_available(1));
}

// One producer, two independent consumers, each reading the full stream by
// sequence. The ring is large enough that nobody gets lapped.
#[test]
fn spmc_consumers_see_identical_streams() {
    let ring = Arc::new(RingBuffer::new(1 << 16));
    let total: i64 = 20_000;

    let consumed_a = Arc::new(AtomicU64::new(0));
    let consumed_b = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();

    for consumed in [Arc::clone(&consumed_a), Arc::clone(&consumed_b)] {
        let ring = Arc::clone(&ring);
        handles.push(thread::spawn(move || {
            let mut seq = 0i64;
            let mut sum = 0f64;
            while seq < total {
                match ring.read(seq) {
                    ReadStatus::Ok(m) => {
                        assert_eq!(m.seq, seq);
                        sum += m.payload;
                        seq += 1;
                        consumed.fetch_add(1, Relaxed);
                    }
                    ReadStatus::NotReady => std::hint::spin_loop(),
                    ReadStatus::Overwritten => panic!("consumer lapped at seq {seq}"),
                }
            }
            sum
        }));
    }

    {
        let ring = Arc::clone(&ring);
        handles.push(thread::spawn(move || {
            let mut sum = 0f64;
            for i in 0..total {
                ring.push(msg(i as f64));
                sum += i as f64;
            }
            sum
        }));
    }

    let sums: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(consumed_a.load(Relaxed), total as u64);
    assert_eq!(consumed_b.load(Relaxed), total as u64);
    // Both consumers reproduce the producer's sum exactly (integer payloads).
    assert_eq!(sums[0], sums[2]);
    assert_eq!(sums[1], sums[2]);
}

// A slow consumer on a tiny ring must never observe a torn message: reads
// either return a message whose payload matches its sequence, or report the
// lap explicitly.
#[test]
fn seqlock_never_returns_torn_messages() {
    let ring = Arc::new(RingBuffer::new(8));
    let total: i64 = 200_000;

    let reader = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            let mut seq = 0i64;
            let mut ok_reads = 0i64;
            while seq < total {
                match ring.read(seq) {
                    ReadStatus::Ok(m) => {
                        assert_eq!(m.seq, seq, "torn read at {seq}");
                        assert_eq!(m.payload, seq as f64, "torn payload at {seq}");
                        ok_reads += 1;
                        seq += 1;
                    }
                    ReadStatus::Overwritten => {
                        // Lapped: jump to the head and keep validating.
                        let latest = ring.latest_seq();
                        seq = latest.max(seq + 1);
                    }
                    ReadStatus::NotReady => std::hint::spin_loop(),
                }
            }
            ok_reads
        })
    };

    for i in 0..total {
        ring.push(msg(i as f64));
    }

    let ok_reads = reader.join().unwrap();
    assert!(ok_reads > 0);
}
