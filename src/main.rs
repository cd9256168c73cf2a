//! Single-process driver: producer, aggregator and recorder on their own
//! threads over one shared ring buffer, with a PASS/FAIL cross-check of the
//! two consumers' sums at the end.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};

use mktreplay::affinity::pin_current_thread;
use mktreplay::{
    logging, Aggregator, FaultKind, Producer, Recorder, ReplayError, RingBuffer,
    DEFAULT_RING_CAPACITY,
};

/// Verification tolerance between the aggregator's and the recorder's sums.
const SUM_TOLERANCE: f64 = 1e-6;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mktreplay",
    version,
    about = "Real-time market-data replay pipeline"
)]
struct Args {
    /// Run mode: test, recovery_test or stress
    #[arg(long, default_value = "test")]
    mode: String,

    /// Number of messages to produce
    #[arg(long, default_value_t = 10_000)]
    messages: i64,

    /// Production rate in messages per second (0 = unpaced)
    #[arg(long, default_value_t = 1_000)]
    rate: i64,

    /// Sequence at which to inject a crash fault (recovery_test mode;
    /// defaults to messages/2)
    #[arg(long = "fault-at")]
    fault_at: Option<i64>,

    /// Directory for the default output file
    #[arg(long = "data-dir", default_value = "data")]
    data_dir: PathBuf,

    /// Output file path (overrides --data-dir)
    #[arg(long)]
    output: Option<PathBuf>,

    /// CPU cores to pin threads to, in the order main,producer,aggregator,
    /// recorder; negative or missing slots are left unpinned
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    cpu: Vec<i64>,
}

impl Args {
    fn output_file(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let date = chrono::Local::now().format("%Y%m%d");
            self.data_dir.join(format!("mktdata_{date}.bin"))
        })
    }

    /// Core for pin slot `index` (0 main, 1 producer, 2 aggregator,
    /// 3 recorder).
    fn cpu_slot(&self, index: usize) -> Option<usize> {
        self.cpu
            .get(index)
            .copied()
            .and_then(|core| usize::try_from(core).ok())
    }
}

fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    info!(
        mode = %args.mode,
        messages = args.messages,
        rate = args.rate,
        output = %args.output_file().display(),
        "mktreplay starting"
    );

    pin_current_thread(args.cpu_slot(0), "main");

    println!("Real-time Data Replay System");
    println!("============================\n");

    match args.mode.as_str() {
        "test" => run_test(&args),
        "recovery_test" => run_recovery_test(&args),
        // Same pipeline as the basic test; only the parameters differ.
        "stress" => run_test(&args),
        other => {
            let err = ReplayError::Config(format!(
                "unknown mode '{other}' (expected test, recovery_test or stress)"
            ));
            error!(error = %err, "startup rejected");
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

struct Pipeline {
    producer: Producer,
    aggregator: Aggregator,
    recorder: Recorder,
}

fn build_pipeline(args: &Args) -> Pipeline {
    let ring = Arc::new(RingBuffer::new(DEFAULT_RING_CAPACITY));
    let output = args.output_file();

    let mut producer = Producer::new(Arc::clone(&ring));
    producer.set_message_count(args.messages);
    producer.set_message_rate(args.rate);
    producer.set_cpu_core(args.cpu_slot(1));

    let mut aggregator = Aggregator::new(Arc::clone(&ring), &output);
    aggregator.set_cpu_core(args.cpu_slot(2));

    let mut recorder = Recorder::new(ring, &output);
    recorder.set_cpu_core(args.cpu_slot(3));

    Pipeline {
        producer,
        aggregator,
        recorder,
    }
}

fn verdict(pipeline: &Pipeline, elapsed: Duration) -> ExitCode {
    let aggregator_sum = pipeline.aggregator.sum();
    let recorder_sum = pipeline.recorder.expected_sum();
    let diff = (aggregator_sum - recorder_sum).abs();
    let passed = diff < SUM_TOLERANCE;

    println!("\n=== Results ===");
    println!("Total time: {} ms", elapsed.as_millis());
    println!("Producer sent: {}", pipeline.producer.sent_count());
    println!("Aggregator processed: {}", pipeline.aggregator.processed_count());
    println!("Recorder recorded: {}", pipeline.recorder.recorded_count());
    println!("Aggregator sum: {aggregator_sum:.6}");
    println!("Recorder expected sum: {recorder_sum:.6}");
    println!("\nVerification: {}", if passed { "PASSED" } else { "FAILED" });

    info!(
        sent = pipeline.producer.sent_count(),
        processed = pipeline.aggregator.processed_count(),
        recorded = pipeline.recorder.recorded_count(),
        diff,
        passed,
        "run complete"
    );

    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn run_test(args: &Args) -> ExitCode {
    println!("=== Functionality Test ===");
    println!("Messages: {}", args.messages);
    println!("Rate: {}/s", args.rate);
    println!("Output: {}\n", args.output_file().display());

    let mut pipeline = build_pipeline(args);
    let start = Instant::now();

    if let Err(e) = pipeline.recorder.start() {
        error!(error = %e, "recorder failed to start");
        eprintln!("Cannot open output file: {e}");
        return ExitCode::from(1);
    }
    pipeline.aggregator.start();
    pipeline.producer.start();

    pipeline.producer.wait_for_complete();

    // Let the consumers drain the tail of the stream.
    std::thread::sleep(Duration::from_millis(500));

    pipeline.aggregator.stop();
    pipeline.recorder.stop();

    verdict(&pipeline, start.elapsed())
}

fn run_recovery_test(args: &Args) -> ExitCode {
    let fault_at = args.fault_at.unwrap_or(args.messages / 2);

    println!("=== Fault Recovery Test ===");
    println!("Messages: {}", args.messages);
    println!("Fault at sequence: {fault_at}\n");

    let mut pipeline = build_pipeline(args);
    let start = Instant::now();

    if let Err(e) = pipeline.recorder.start() {
        error!(error = %e, "recorder failed to start");
        eprintln!("Cannot open output file: {e}");
        return ExitCode::from(1);
    }
    pipeline.aggregator.start();
    pipeline.producer.start();

    while pipeline.aggregator.last_seq() < fault_at && pipeline.producer.is_running() {
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("Triggering fault...");
    pipeline.aggregator.trigger_fault(FaultKind::Crash);
    pipeline.aggregator.wait_for_recovery();
    println!("Recovery complete");
    info!("aggregator recovery completed");

    pipeline.producer.wait_for_complete();
    std::thread::sleep(Duration::from_millis(500));

    pipeline.aggregator.stop();
    pipeline.recorder.stop();

    println!(
        "Recoveries: {}  gaps: {}",
        pipeline.aggregator.recovery_count(),
        pipeline.aggregator.gap_count()
    );

    verdict(&pipeline, start.elapsed())
}
