//! Multi-process server: publishes simulated market data into the named
//! shared-memory ring for the aggregator and recorder client processes.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};

use mktreplay::affinity::pin_current_thread;
use mktreplay::kahan::KahanSum;
use mktreplay::logging;
use mktreplay::message::{current_timestamp_ns, Msg, INVALID_SEQ};
use mktreplay::ring::shm::{ShmRing, SHM_NAME};

#[derive(Parser, Debug)]
#[command(name = "shm_server", version, about = "Shared-memory market data server")]
struct Args {
    /// Number of messages to publish
    #[arg(long, default_value_t = 10_000)]
    messages: i64,

    /// Publication rate in messages per second (0 = unpaced)
    #[arg(long, default_value_t = 1_000)]
    rate: i64,

    /// Pin the process to a CPU core
    #[arg(long)]
    cpu: Option<usize>,
}

fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    println!("=== Shared-Memory Server ===");
    println!("Messages: {}", args.messages);
    println!("Rate: {}/s", args.rate);

    pin_current_thread(args.cpu, "shm_server");

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Release);
        });
    }

    let ring = match ShmRing::create() {
        Ok(ring) => ring,
        Err(e) => {
            error!(error = %e, "failed to create shared memory");
            eprintln!("Failed to create shared memory: {e}");
            return ExitCode::from(1);
        }
    };

    println!("Shared memory {SHM_NAME} created; waiting for clients...");
    info!(
        name = SHM_NAME,
        slots = ring.capacity(),
        messages = args.messages,
        rate = args.rate,
        "server started"
    );

    let mut rng = StdRng::from_entropy();
    let mut total_payload = KahanSum::new();

    let interval_ns: u64 = if args.rate > 0 {
        1_000_000_000 / args.rate as u64
    } else {
        0
    };
    let start = Instant::now();

    for i in 0..args.messages {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let payload: f64 = rng.gen_range(0.0..100.0);
        ring.push(Msg::new(INVALID_SEQ, current_timestamp_ns(), payload));
        total_payload.add(payload);

        if args.rate > 0 {
            let deadline = start + Duration::from_nanos((i as u64 + 1) * interval_ns);
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
            }
        }

        if args.messages >= 10 && (i + 1) % (args.messages / 10) == 0 {
            println!("Progress: {}%", (i + 1) * 100 / args.messages);
        }
    }

    let elapsed = start.elapsed();
    println!("\n=== Server Complete ===");
    println!("Sent: {}", ring.total_messages());
    println!("Sum: {:.6}", total_payload.sum());
    println!("Time: {} ms", elapsed.as_millis());

    info!(
        sent = ring.total_messages(),
        sum = total_payload.sum(),
        duration_ms = elapsed.as_millis() as u64,
        "server complete"
    );

    // Give clients a moment to drain, then signal shutdown; the mapping is
    // unlinked when `ring` drops.
    println!("Waiting for clients to finish...");
    std::thread::sleep(Duration::from_secs(2));
    ring.set_server_running(false);
    std::thread::sleep(Duration::from_secs(1));

    println!("Shared memory cleaned up");
    ExitCode::SUCCESS
}
