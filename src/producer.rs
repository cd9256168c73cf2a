//! Producer thread: turns a payload stream into timestamped messages and
//! pushes them into the ring buffer at a target rate.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::affinity::pin_current_thread;
use crate::message::{current_timestamp_ns, Msg, SeqNum, INVALID_SEQ};
use crate::ring::RingBuffer;

/// Custom payload source; the default draws uniformly from [0, 100).
pub type PayloadGenerator = Box<dyn FnMut() -> f64 + Send>;

struct ProducerInner {
    running: AtomicBool,
    stop_requested: AtomicBool,
    sent_count: AtomicI64,
}

pub struct Producer {
    ring: Arc<RingBuffer>,
    inner: Arc<ProducerInner>,
    handle: Option<JoinHandle<()>>,
    message_count: i64,
    message_rate: i64,
    generator: Option<PayloadGenerator>,
    cpu_core: Option<usize>,
}

impl Producer {
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self {
            ring,
            inner: Arc::new(ProducerInner {
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                sent_count: AtomicI64::new(0),
            }),
            handle: None,
            message_count: 10_000,
            message_rate: 1_000,
            generator: None,
            cpu_core: None,
        }
    }

    pub fn set_message_count(&mut self, count: i64) {
        self.message_count = count;
    }

    /// Target rate in messages per second; 0 disables pacing.
    pub fn set_message_rate(&mut self, rate_per_second: i64) {
        self.message_rate = rate_per_second;
    }

    pub fn set_payload_generator(&mut self, generator: PayloadGenerator) {
        self.generator = Some(generator);
    }

    /// Pin the producer thread to a core; call before `start`.
    pub fn set_cpu_core(&mut self, core: Option<usize>) {
        self.cpu_core = core;
    }

    pub fn start(&mut self) {
        if self.inner.running.load(Ordering::Acquire) {
            warn!("producer already running; ignoring start");
            return;
        }

        self.inner.stop_requested.store(false, Ordering::Release);
        self.inner.sent_count.store(0, Ordering::Release);
        self.inner.running.store(true, Ordering::Release);

        info!(
            messages = self.message_count,
            rate = self.message_rate,
            "producer starting"
        );

        let ring = Arc::clone(&self.ring);
        let inner = Arc::clone(&self.inner);
        let count = self.message_count;
        let rate = self.message_rate;
        let generator = self.generator.take();
        let core = self.cpu_core;

        self.handle = Some(std::thread::spawn(move || {
            run(&ring, &inner, count, rate, generator, core);
        }));
    }

    /// Request a cooperative stop and join the thread.
    pub fn stop(&mut self) {
        self.inner.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.inner.running.store(false, Ordering::Release);
        info!(sent = self.sent_count(), "producer stopped");
    }

    /// Block until the configured message count has been pushed.
    pub fn wait_for_complete(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn sent_count(&self) -> i64 {
        self.inner.sent_count.load(Ordering::Acquire)
    }

    /// Latest sequence published to the ring.
    pub fn latest_seq(&self) -> SeqNum {
        self.ring.latest_seq()
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run(
    ring: &RingBuffer,
    inner: &ProducerInner,
    count: i64,
    rate: i64,
    generator: Option<PayloadGenerator>,
    core: Option<usize>,
) {
    pin_current_thread(core, "producer");

    let mut generator = generator.unwrap_or_else(|| {
        let mut rng = StdRng::from_entropy();
        Box::new(move || rng.gen_range(0.0..100.0))
    });

    let interval_ns: u64 = if rate > 0 {
        1_000_000_000 / rate as u64
    } else {
        0
    };
    let start = Instant::now();

    for i in 0..count {
        if inner.stop_requested.load(Ordering::Acquire) {
            break;
        }

        let msg = Msg::new(INVALID_SEQ, current_timestamp_ns(), generator());
        ring.push(msg);
        inner.sent_count.fetch_add(1, Ordering::Release);

        if rate > 0 {
            // Absolute deadlines, so pacing does not drift with jitter.
            let deadline = start + Duration::from_nanos((i as u64 + 1) * interval_ns);
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
            }
        }
    }

    inner.running.store(false, Ordering::Release);
    info!(
        sent = inner.sent_count.load(Ordering::Acquire),
        "producer completed"
    );
}
