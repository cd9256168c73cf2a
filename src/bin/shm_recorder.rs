//! Multi-process recorder client: attaches to the server's shared-memory
//! ring and persists the stream to a log file in batches.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};

use mktreplay::affinity::pin_current_thread;
use mktreplay::channel::{Channel, FileWriteChannel, WritableChannel};
use mktreplay::kahan::KahanSum;
use mktreplay::logging;
use mktreplay::message::{Msg, SeqNum, DEFAULT_BATCH_SIZE};
use mktreplay::ring::shm::ShmRing;
use mktreplay::ring::ReadStatus;

#[derive(Parser, Debug)]
#[command(name = "shm_recorder", version, about = "Shared-memory recorder client")]
struct Args {
    /// Output file path
    #[arg(long)]
    output: Option<PathBuf>,

    /// Pin the process to a CPU core
    #[arg(long)]
    cpu: Option<usize>,
}

fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    let output = args.output.unwrap_or_else(|| {
        let date = chrono::Local::now().format("%Y%m%d");
        PathBuf::from(format!("data/mktdata_ipc_{date}.bin"))
    });

    println!("=== Shared-Memory Recorder ===");
    println!("Output: {}", output.display());
    pin_current_thread(args.cpu, "shm_recorder");

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Release);
        });
    }

    let ring = match ShmRing::attach_with_retry(30, Duration::from_secs(1), || {
        stop.load(Ordering::Acquire)
    }) {
        Ok(ring) => ring,
        Err(e) => {
            eprintln!("Cannot connect to shared memory; start the server first ({e})");
            return ExitCode::from(1);
        }
    };
    println!("Connected to shared memory");

    let mut channel = FileWriteChannel::new(&output);
    if let Err(e) = channel.open() {
        error!(error = %e, "cannot create output file");
        eprintln!("Cannot create output file: {e}");
        return ExitCode::from(1);
    }

    let mut read_seq: SeqNum = 0;
    let mut recorded: i64 = 0;
    let mut gap_count: i64 = 0;
    let mut expected_sum = KahanSum::new();
    let mut batch: Vec<Msg> = Vec::with_capacity(DEFAULT_BATCH_SIZE);
    let start = Instant::now();

    while !stop.load(Ordering::Acquire) {
        match ring.read(read_seq) {
            ReadStatus::Ok(msg) => {
                batch.push(msg);
                expected_sum.add(msg.payload);
                recorded += 1;
                read_seq += 1;

                if batch.len() >= DEFAULT_BATCH_SIZE {
                    write_batch(&mut channel, &mut batch);
                }
                if recorded % 10_000 == 0 {
                    println!("Recorded: {recorded}");
                }
            }

            ReadStatus::Overwritten => {
                let latest = ring.latest_seq();
                let skipped = (latest + 1 - read_seq).max(1);
                gap_count += skipped;
                warn!(read_seq, latest, skipped, "lapped by server; data loss is permanent");
                read_seq = latest + 1;
                write_batch(&mut channel, &mut batch);
            }

            ReadStatus::NotReady => {
                write_batch(&mut channel, &mut batch);
                if !ring.server_running() && read_seq > ring.latest_seq() {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }

    write_batch(&mut channel, &mut batch);
    channel.close();

    let elapsed = start.elapsed();
    println!("\n=== Recorder Results ===");
    println!("Recorded: {recorded}");
    println!("Expected sum: {:.6}", expected_sum.sum());
    println!("Gaps: {gap_count}");
    println!("Time: {} ms", elapsed.as_millis());

    info!(
        recorded,
        expected_sum = expected_sum.sum(),
        gaps = gap_count,
        duration_ms = elapsed.as_millis() as u64,
        output = %output.display(),
        "recorder client complete"
    );

    ExitCode::SUCCESS
}

fn write_batch(channel: &mut FileWriteChannel, batch: &mut Vec<Msg>) {
    if batch.is_empty() {
        return;
    }
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
