//! Aggregator consumer with the fault/recovery state machine.
//!
//! Accumulates a running payload sum from the live ring buffer. When it is
//! lapped (or a fault is injected) it rebuilds its state by replaying the
//! recorder's log and then rejoins the live stream at the replay boundary.
//!
//! Three guarantees hold throughout: `process` sees strictly increasing
//! sequences within any normal epoch between recoveries; on a replay-to-live
//! handoff the first live sequence equals the last replayed sequence + 1 (no
//! gap, no overlap); and after a successful recovery the accumulated sum
//! equals what a fault-free aggregator would have computed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::affinity::pin_current_thread;
use crate::kahan::AtomicKahanSum;
use crate::message::{Msg, SeqNum, CATCHUP_THRESHOLD, INVALID_SEQ};
use crate::replay::ReplayReader;
use crate::ring::{ConsumerCursor, ReadStatus, RingBuffer};

/// Injectable fault kinds, also raised internally by auto-fault detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Aggregator crash: accumulated state is wiped and rebuilt from disk.
    Crash,
    /// Test-only instrumentation: skips the cursor ahead by a fixed 10
    /// sequences to simulate losing messages in flight.
    MessageLoss,
    /// Test-only instrumentation: blocks the calling thread for one second.
    TemporaryHang,
}

/// Aggregator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Normal,
    Faulted,
    Replaying,
    CatchingUp,
}

impl AggregatorState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Faulted => 1,
            Self::Replaying => 2,
            Self::CatchingUp => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Faulted,
            2 => Self::Replaying,
            3 => Self::CatchingUp,
            _ => Self::Normal,
        }
    }
}

/// External observer notified when a crash fault fires.
pub trait FaultListener: Send + Sync {
    fn on_fault(&self);
}

impl<F: Fn() + Send + Sync> FaultListener for F {
    fn on_fault(&self) {
        self()
    }
}

/// Cursor distance of the `MessageLoss` fault.
const MESSAGE_LOSS_SKIP: i64 = 10;

/// How long an external `trigger_fault` waits for the live loop to park
/// before resetting the accumulators.
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

struct Metrics {
    gap_count: AtomicI64,
    overwrite_count: AtomicI64,
    recovery_count: AtomicI64,
    auto_fault_count: AtomicI64,
}

struct AggregatorInner {
    ring: Arc<RingBuffer>,
    log_path: PathBuf,

    running: AtomicBool,
    stop_requested: AtomicBool,

    sum: AtomicKahanSum,
    last_seq: AtomicI64,
    processed_count: AtomicI64,
    state: AtomicU8,
    in_recovery: AtomicBool,
    /// Set by the live loop once it has observed `in_recovery` and parked;
    /// the recovering thread may only touch the accumulators after this.
    live_parked: AtomicBool,
    auto_fault_detection: AtomicBool,
    catchup_threshold: AtomicI64,

    cursor: ConsumerCursor,
    /// Serialises `switch_to_live` against itself.
    switch_lock: Mutex<()>,
    fault_listener: Mutex<Option<Arc<dyn FaultListener>>>,
    metrics: Metrics,
}

pub struct Aggregator {
    inner: Arc<AggregatorInner>,
    handle: Option<JoinHandle<()>>,
    cpu_core: Option<usize>,
}

impl Aggregator {
    /// `log_path` is the recorder's output file, replayed on recovery.
    pub fn new(ring: Arc<RingBuffer>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                ring,
                log_path: log_path.into(),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                sum: AtomicKahanSum::default(),
                last_seq: AtomicI64::new(INVALID_SEQ),
                processed_count: AtomicI64::new(0),
                state: AtomicU8::new(AggregatorState::Normal.as_u8()),
                in_recovery: AtomicBool::new(false),
                live_parked: AtomicBool::new(false),
                auto_fault_detection: AtomicBool::new(true),
                catchup_threshold: AtomicI64::new(CATCHUP_THRESHOLD),
                cursor: ConsumerCursor::new(),
                switch_lock: Mutex::new(()),
                fault_listener: Mutex::new(None),
                metrics: Metrics {
                    gap_count: AtomicI64::new(0),
                    overwrite_count: AtomicI64::new(0),
                    recovery_count: AtomicI64::new(0),
                    auto_fault_count: AtomicI64::new(0),
                },
            }),
            handle: None,
            cpu_core: None,
        }
    }

    pub fn set_cpu_core(&mut self, core: Option<usize>) {
        self.cpu_core = core;
    }

    /// Enable or disable automatic recovery on an `Overwritten` read
    /// (default: enabled). When disabled the aggregator resynchronises at
    /// the head instead, accepting the loss.
    pub fn set_auto_fault_detection(&self, enabled: bool) {
        self.inner
            .auto_fault_detection
            .store(enabled, Ordering::Relaxed);
    }

    /// Maximum replay-to-head lag at which recovery switches to the live
    /// stream. Must be much smaller than the ring capacity for the handoff
    /// argument to hold.
    pub fn set_catchup_threshold(&self, threshold: i64) {
        self.inner
            .catchup_threshold
            .store(threshold, Ordering::Relaxed);
    }

    pub fn set_fault_listener(&self, listener: Arc<dyn FaultListener>) {
        *self.inner.fault_listener.lock() = Some(listener);
    }

    pub fn start(&mut self) {
        if self.inner.running.load(Ordering::Acquire) {
            warn!("aggregator already running; ignoring start");
            return;
        }

        self.inner.stop_requested.store(false, Ordering::Release);
        self.inner.running.store(true, Ordering::Release);
        self.inner
            .state
            .store(AggregatorState::Normal.as_u8(), Ordering::Release);

        info!(log = %self.inner.log_path.display(), "aggregator starting");

        let inner = Arc::clone(&self.inner);
        let core = self.cpu_core;
        self.handle = Some(std::thread::spawn(move || {
            inner.run(core);
        }));
    }

    /// Request a cooperative stop and join. A recovery in progress aborts at
    /// its next loop check.
    pub fn stop(&mut self) {
        self.inner.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.inner.running.store(false, Ordering::Release);
        info!(
            processed = self.processed_count(),
            gaps = self.gap_count(),
            overwrites = self.overwrite_count(),
            recoveries = self.recovery_count(),
            "aggregator stopped"
        );
    }

    /// Block until a recovery in progress has finished.
    pub fn wait_for_recovery(&self) {
        while self.inner.in_recovery.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Inject a fault. `Crash` wipes the accumulated state and runs the
    /// recovery procedure on the calling thread while the live loop idles.
    pub fn trigger_fault(&self, kind: FaultKind) {
        self.inner.on_fault(kind, true);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_in_recovery(&self) -> bool {
        self.inner.in_recovery.load(Ordering::Acquire)
    }

    pub fn state(&self) -> AggregatorState {
        AggregatorState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn sum(&self) -> f64 {
        self.inner.sum.sum()
    }

    pub fn processed_count(&self) -> i64 {
        self.inner.processed_count.load(Ordering::Acquire)
    }

    pub fn last_seq(&self) -> SeqNum {
        self.inner.last_seq.load(Ordering::Acquire)
    }

    pub fn gap_count(&self) -> i64 {
        self.inner.metrics.gap_count.load(Ordering::Relaxed)
    }

    pub fn overwrite_count(&self) -> i64 {
        self.inner.metrics.overwrite_count.load(Ordering::Relaxed)
    }

    pub fn recovery_count(&self) -> i64 {
        self.inner.metrics.recovery_count.load(Ordering::Relaxed)
    }

    pub fn auto_fault_count(&self) -> i64 {
        self.inner.metrics.auto_fault_count.load(Ordering::Relaxed)
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

impl AggregatorInner {
    // Live consumer loop. Overwritten reads mean the producer lapped us; the
    // lost messages exist only on disk, so (with auto-fault enabled) that
    // triggers the same recovery as an injected crash.
    fn run(&self, core: Option<usize>) {
        pin_current_thread(core, "aggregator");

        self.cursor.set(0);

        while !self.stop_requested.load(Ordering::Acquire) {
            if self.in_recovery.load(Ordering::Acquire) {
                // Parked: a recovery owns the accumulators until it clears
                // the flag.
                self.live_parked.store(true, Ordering::Release);
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            if self.live_parked.load(Ordering::Relaxed) {
                // A park acknowledgement stored after the recovery finished
                // must not satisfy the next fault's handshake.
                self.live_parked.store(false, Ordering::Release);
            }

            let seq = self.cursor.get();
            match self.ring.read(seq) {
                ReadStatus::Ok(msg) => {
                    self.process(&msg);
                    self.cursor.advance();
                }

                ReadStatus::Overwritten => {
                    self.metrics.overwrite_count.fetch_add(1, Ordering::Relaxed);
                    self.metrics.gap_count.fetch_add(1, Ordering::Relaxed);
                    warn!(seq, "aggregator lapped by producer");

                    if self.auto_fault_detection.load(Ordering::Relaxed) {
                        self.metrics.auto_fault_count.fetch_add(1, Ordering::Relaxed);
                        // Same path as an injected crash, but we are the live
                        // loop: no parking handshake needed.
                        self.on_fault(FaultKind::Crash, false);
                    } else {
                        // Accept the loss and resynchronise at the head.
                        let latest = self.ring.latest_seq();
                        if latest >= 0 {
                            self.cursor.set(latest + 1);
                        }
                    }
                }

                ReadStatus::NotReady => {
                    std::thread::yield_now();
                }
            }
        }

        self.running.store(false, Ordering::Release);
    }

    // Monotonicity guard plus Kahan accumulation. Gaps are informational
    // here: correctness rests on recovery, not on uninterrupted delivery.
    fn process(&self, msg: &Msg) {
        let prev = self.last_seq.load(Ordering::Relaxed);

        if prev != INVALID_SEQ && msg.seq <= prev {
            warn!(prev, got = msg.seq, "sequence monotonicity violation; skipping");
            self.metrics.gap_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if prev != INVALID_SEQ && msg.seq != prev + 1 {
            let gap = msg.seq - prev - 1;
            self.metrics.gap_count.fetch_add(gap, Ordering::Relaxed);
            warn!(expected = prev + 1, got = msg.seq, gap, "sequence gap");
        }

        self.sum.add(msg.payload);
        self.last_seq.store(msg.seq, Ordering::Release);
        self.processed_count.fetch_add(1, Ordering::Release);
    }

    // `external` is true when invoked from outside the live loop
    // (trigger_fault); the reset must then wait until the live loop has
    // parked, or it could race a message being processed and corrupt the
    // rebuilt sum.
    fn on_fault(&self, kind: FaultKind, external: bool) {
        match kind {
            FaultKind::Crash => {
                warn!("fault injected: crash; starting recovery");
                self.state
                    .store(AggregatorState::Faulted.as_u8(), Ordering::Release);
                self.in_recovery.store(true, Ordering::Release);

                if external {
                    self.wait_for_live_parked();
                }

                self.sum.reset();
                self.last_seq.store(INVALID_SEQ, Ordering::Release);
                self.processed_count.store(0, Ordering::Release);

                let listener = self.fault_listener.lock().clone();
                if let Some(listener) = listener {
                    listener.on_fault();
                }

                self.recover();
            }

            FaultKind::MessageLoss => {
                warn!(skip = MESSAGE_LOSS_SKIP, "fault injected: message loss");
                self.cursor.set(self.cursor.get() + MESSAGE_LOSS_SKIP);
            }

            FaultKind::TemporaryHang => {
                warn!("fault injected: temporary hang");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    fn wait_for_live_parked(&self) {
        let deadline = Instant::now() + PARK_TIMEOUT;
        while !self.live_parked.load(Ordering::Acquire)
            && self.running.load(Ordering::Acquire)
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // Recovery: replay the recorder's log from the start, then hand off to
    // the live stream.
    //
    // Handoff argument: let N be the last replayed sequence and L the ring
    // head at switch time. The catch-up predicate N >= L - T with
    // T << capacity gives N + 1 > L - capacity + 1 = oldest_available, so
    // sequence N + 1 is still inside the live window and the first live read
    // returns exactly N + 1. If the workload has outrun the ring regardless,
    // the next read returns Overwritten and recovery re-triggers; the failed
    // attempt processes no live message, so the boundary stays gapless.
    fn recover(&self) {
        self.state
            .store(AggregatorState::Replaying.as_u8(), Ordering::Release);
        self.metrics.recovery_count.fetch_add(1, Ordering::Relaxed);

        info!(log = %self.log_path.display(), "recovery started; replaying from disk");

        let mut replay = ReplayReader::from_path(&self.log_path);
        if let Err(e) = replay.open() {
            // Degraded: resume live, almost certainly straight into
            // Overwritten if we were lapped.
            error!(error = %e, "cannot open replay log; resuming live without replay");
            self.finish_recovery();
            return;
        }

        let threshold = self.catchup_threshold.load(Ordering::Relaxed);
        let mut last_replay_seq = INVALID_SEQ;
        let mut switched = false;

        while self.in_recovery.load(Ordering::Acquire)
            && !self.stop_requested.load(Ordering::Acquire)
        {
            let Some(msg) = replay.next_message() else {
                break;
            };

            self.process(&msg);
            last_replay_seq = msg.seq;

            let live = self.ring.latest_seq();
            if live >= 0 && msg.seq >= live - threshold {
                self.state
                    .store(AggregatorState::CatchingUp.as_u8(), Ordering::Release);

                let boundary = msg.seq + 1;
                self.switch_to_live(boundary);
                switched = true;

                info!(
                    last_replay_seq = msg.seq,
                    first_live_seq = boundary,
                    live_head = live,
                    "replay-to-live boundary"
                );
                break;
            }
        }

        if replay.seq_violation_count() > 0 {
            warn!(
                violations = replay.seq_violation_count(),
                "replay returned out-of-order sequences"
            );
        }
        replay.close();

        // Replay drained the whole log before the live head came within the
        // threshold: continue on the live stream right after the last
        // replayed record.
        if !switched && last_replay_seq != INVALID_SEQ {
            self.cursor.set(last_replay_seq + 1);
            info!(
                resume_seq = last_replay_seq + 1,
                "replay exhausted the log; resuming live"
            );
        }

        self.finish_recovery();
        info!(last_replay_seq, "recovery finished");
    }

    fn finish_recovery(&self) {
        self.in_recovery.store(false, Ordering::Release);
        self.live_parked.store(false, Ordering::Release);
        self.state
            .store(AggregatorState::Normal.as_u8(), Ordering::Release);
    }

    // Position the cursor at the replay boundary. The ring's read handles an
    // already-overwritten boundary gracefully, so this only warns when the
    // window check fails.
    fn switch_to_live(&self, boundary: SeqNum) {
        let _guard = self.switch_lock.lock();

        let latest = self.ring.latest_seq();
        let oldest_available = std::cmp::max(0, latest - self.ring.capacity() as i64 + 1);

        if boundary < oldest_available {
            warn!(
                boundary,
                oldest_available,
                "replay boundary already overwritten; recovery will re-trigger"
            );
        }

        self.cursor.set(boundary);
        info!(
            boundary,
            window_oldest = oldest_available,
            window_latest = latest,
            "switched to live stream"
        );
    }
}
