//! Multi-process aggregator client: attaches to the server's shared-memory
//! ring and accumulates the payload sum until the server shuts down.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};

use mktreplay::affinity::pin_current_thread;
use mktreplay::kahan::KahanSum;
use mktreplay::logging;
use mktreplay::message::SeqNum;
use mktreplay::ring::shm::ShmRing;
use mktreplay::ring::ReadStatus;

#[derive(Parser, Debug)]
#[command(name = "shm_aggregator", version, about = "Shared-memory aggregator client")]
struct Args {
    /// Pin the process to a CPU core
    #[arg(long)]
    cpu: Option<usize>,
}

fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    println!("=== Shared-Memory Aggregator ===");
    pin_current_thread(args.cpu, "shm_aggregator");

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

    let mut read_seq: SeqNum = 0;
    let mut processed: i64 = 0;
    let mut gap_count: i64 = 0;
    let mut sum = KahanSum::new();
    let start = Instant::now();

    while !stop.load(Ordering::Acquire) {
        match ring.read(read_seq) {
            ReadStatus::Ok(msg) => {
                sum.add(msg.payload);
                processed += 1;
                read_seq += 1;

                if processed % 10_000 == 0 {
                    println!("Processed: {processed}, sum: {:.6}", sum.sum());
                }
            }

            ReadStatus::Overwritten => {
                // No recovery log on the client side: accept the loss and
                // resynchronise at the head.
                let latest = ring.latest_seq();
                let skipped = (latest + 1 - read_seq).max(1);
                gap_count += skipped;
                warn!(read_seq, latest, skipped, "lapped by server; skipping to head");
                read_seq = latest + 1;
            }

            ReadStatus::NotReady => {
                if !ring.server_running() && read_seq > ring.latest_seq() {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }

    let elapsed = start.elapsed();
    println!("\n=== Aggregator Results ===");
    println!("Processed: {processed}");
    println!("Sum: {:.6}", sum.sum());
    println!("Last sequence: {}", read_seq - 1);
    println!("Gaps: {gap_count}");
    println!("Time: {} ms", elapsed.as_millis());

    if processed > 0 && !elapsed.is_zero() {
        let throughput = processed as f64 / elapsed.as_secs_f64();
        println!("Throughput: {} msg/s", throughput as i64);
    }

    info!(
        processed,
        sum = sum.sum(),
        last_seq = read_seq - 1,
        gaps = gap_count,
        duration_ms = elapsed.as_millis() as u64,
        "aggregator client complete"
    );

    ExitCode::SUCCESS
}
