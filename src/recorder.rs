//! Recorder consumer: batches messages from the ring buffer and persists
//! them through a [`FileWriteChannel`].
//!
//! Messages reach disk in strictly increasing sequence order. A detected gap
//! (ring overwrite) is logged and counted but recording continues; the
//! header's first/last range reflects the actual content.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::affinity::pin_current_thread;
use crate::channel::{Channel, FileWriteChannel, WritableChannel};
use crate::error::Result;
use crate::kahan::KahanSum;
use crate::message::{Msg, SeqNum, DEFAULT_BATCH_SIZE, INVALID_SEQ};
use crate::ring::{ConsumerCursor, ReadStatus, RingBuffer};

struct RecorderInner {
    running: AtomicBool,
    stop_requested: AtomicBool,
    recorded_count: AtomicI64,
    last_seq: AtomicI64,
    /// Bit pattern of the Kahan-compensated payload sum; the compensation
    /// term stays local to the run loop.
    expected_sum_bits: AtomicU64,
    gap_count: AtomicI64,
    overwrite_count: AtomicI64,
    cursor: ConsumerCursor,
}

pub struct Recorder {
    ring: Arc<RingBuffer>,
    output_path: PathBuf,
    inner: Arc<RecorderInner>,
    handle: Option<JoinHandle<()>>,
    batch_size: usize,
    cpu_core: Option<usize>,
}

impl Recorder {
    pub fn new(ring: Arc<RingBuffer>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            ring,
            output_path: output_path.into(),
            inner: Arc::new(RecorderInner {
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                recorded_count: AtomicI64::new(0),
                last_seq: AtomicI64::new(INVALID_SEQ),
                expected_sum_bits: AtomicU64::new(0f64.to_bits()),
                gap_count: AtomicI64::new(0),
                overwrite_count: AtomicI64::new(0),
                cursor: ConsumerCursor::new(),
            }),
            handle: None,
            batch_size: DEFAULT_BATCH_SIZE,
            cpu_core: None,
        }
    }

    /// Disk write batch size; call before `start`.
    pub fn set_batch_size(&mut self, size: usize) {
        self.batch_size = size.max(1);
    }

    pub fn set_cpu_core(&mut self, core: Option<usize>) {
        self.cpu_core = core;
    }

    /// Open the output log and start the recording thread. Fails (and does
    /// not start) when the output file cannot be created.
    pub fn start(&mut self) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) {
            warn!("recorder already running; ignoring start");
            return Ok(());
        }

        let mut channel = FileWriteChannel::new(&self.output_path);
        channel.open()?;

        self.inner.stop_requested.store(false, Ordering::Release);
        self.inner.recorded_count.store(0, Ordering::Release);
        self.inner.last_seq.store(INVALID_SEQ, Ordering::Release);
        self.inner
            .expected_sum_bits
            .store(0f64.to_bits(), Ordering::Release);
        self.inner.running.store(true, Ordering::Release);

        info!(
            output = %self.output_path.display(),
            batch_size = self.batch_size,
            "recorder starting"
        );

        let ring = Arc::clone(&self.ring);
        let inner = Arc::clone(&self.inner);
        let batch_size = self.batch_size;
        let core = self.cpu_core;

        self.handle = Some(std::thread::spawn(move || {
            run(&ring, &inner, channel, batch_size, core);
        }));
        Ok(())
    }

    /// Stop, flush the remaining batch and close the log (sets COMPLETE).
    pub fn stop(&mut self) {
        self.inner.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!(
            recorded = self.recorded_count(),
            gaps = self.gap_count(),
            overwrites = self.overwrite_count(),
            "recorder stopped"
        );
    }

    pub fn wait_for_complete(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn recorded_count(&self) -> i64 {
        self.inner.recorded_count.load(Ordering::Acquire)
    }

    pub fn last_seq(&self) -> SeqNum {
        self.inner.last_seq.load(Ordering::Acquire)
    }

    /// Running payload sum over everything recorded; the aggregator's sum is
    /// cross-checked against this at the end of a run.
    pub fn expected_sum(&self) -> f64 {
        f64::from_bits(self.inner.expected_sum_bits.load(Ordering::Acquire))
    }

    pub fn gap_count(&self) -> i64 {
        self.inner.gap_count.load(Ordering::Relaxed)
    }

    pub fn overwrite_count(&self) -> i64 {
        self.inner.overwrite_count.load(Ordering::Relaxed)
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run(
    ring: &RingBuffer,
    inner: &RecorderInner,
    mut channel: FileWriteChannel,
    batch_size: usize,
    core: Option<usize>,
) {
    pin_current_thread(core, "recorder");

    inner.cursor.set(0);
    let mut batch: Vec<Msg> = Vec::with_capacity(batch_size);
    let mut expected = KahanSum::new();

    while !inner.stop_requested.load(Ordering::Acquire) {
        let seq = inner.cursor.get();
        match ring.read(seq) {
            ReadStatus::Ok(msg) => {
                let prev = inner.last_seq.load(Ordering::Relaxed);

                // Never let a duplicate or out-of-order sequence reach the
                // log.
                if prev != INVALID_SEQ && msg.seq <= prev {
                    warn!(seq = msg.seq, prev, "recorder skipping duplicate sequence");
                    inner.gap_count.fetch_add(1, Ordering::Relaxed);
                    inner.cursor.advance();
                    continue;
                }
                if prev != INVALID_SEQ && msg.seq > prev + 1 {
                    let gap = msg.seq - prev - 1;
                    inner.gap_count.fetch_add(gap, Ordering::Relaxed);
                    warn!(expected = prev + 1, got = msg.seq, gap, "recorder sequence gap");
                }

                expected.add(msg.payload);
                inner
                    .expected_sum_bits
                    .store(expected.sum().to_bits(), Ordering::Release);

                batch.push(msg);
                inner.last_seq.store(msg.seq, Ordering::Release);
                inner.recorded_count.fetch_add(1, Ordering::Release);
                inner.cursor.advance();

                if batch.len() >= batch_size {
                    write_batch(&mut channel, &mut batch);
                }
            }

            ReadStatus::Overwritten => {
                // The recorder is the durability path: being lapped means
                // permanent data loss.
                inner.overwrite_count.fetch_add(1, Ordering::Relaxed);
                error!(
                    seq,
                    "CRITICAL: recorder lapped by producer; data loss is permanent. \
                     Consider a larger ring"
                );

                let latest = ring.latest_seq();
                if latest >= 0 {
                    // Re-synchronise near the head, leaving half a ring of
                    // margin before the next lap.
                    let resync = std::cmp::max(seq + 1, latest - ring.capacity() as i64 / 2);
                    inner.cursor.set(resync);
                } else {
                    inner.cursor.advance();
                }

                // Persist everything gathered before the gap.
                if !batch.is_empty() {
                    write_batch(&mut channel, &mut batch);
                }
            }

            ReadStatus::NotReady => {
                // Idle producer: bound the latency of buffered records.
                if !batch.is_empty() {
                    write_batch(&mut channel, &mut batch);
                }
                std::thread::yield_now();
            }
        }
    }

    write_batch(&mut channel, &mut batch);
    channel.close();

    inner.running.store(false, Ordering::Release);
    info!(
        recorded = inner.recorded_count.load(Ordering::Acquire),
        "recorder completed"
    );
}

fn write_batch(channel: &mut FileWriteChannel, batch: &mut Vec<Msg>) {
    for msg in batch.iter() {
        if let Err(e) = channel.write(msg) {
            error!(error = %e, seq = msg.seq, "log write failed");
        }
    }
    batch.clear();
    if let Err(e) = channel.flush() {
        error!(error = %e, "log flush failed");
    }
}
