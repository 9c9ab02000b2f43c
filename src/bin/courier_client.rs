//! Courier demo client
//!
//! Sends invocations to a running `courier_server` from one or more caller
//! threads over a single connection and reports round-trip latency.
//!
//! Usage:
//!   cargo run --release --bin courier_client -- [OPTIONS]

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use parking_lot::Mutex;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use courier::{ClientConfig, Error, JsonSerializer, MsgPackSerializer, RpcClient, Serializer};

#[derive(Parser, Debug)]
#[command(name = "courier_client", about = "Courier demo RPC client")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    server: SocketAddr,

    /// Operation to invoke
    #[arg(short, long, default_value = "echo")]
    operation: String,

    /// Payload sent with every request
    #[arg(short, long, default_value = "ping")]
    payload: String,

    /// Invocations per caller thread
    #[arg(short = 'n', long, default_value_t = 10_000)]
    count: usize,

    /// Concurrent caller threads
    #[arg(short, long, default_value_t = 1)]
    callers: usize,

    /// Per-invocation timeout in milliseconds
    #[arg(long, default_value_t = 1_000)]
    timeout_ms: u64,

    /// Payload encoding: msgpack or json
    #[arg(long, default_value = "msgpack")]
    format: String,
}

/// Latency samples in nanoseconds.
#[derive(Default)]
struct LatencyReport {
    samples: Vec<u64>,
    timed_out: usize,
    failed: usize,
}

impl LatencyReport {
    fn merge(&mut self, other: LatencyReport) {
        self.samples.extend(other.samples);
        self.timed_out += other.timed_out;
        self.failed += other.failed;
    }

    fn percentile(sorted: &[u64], p: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn print(mut self, elapsed: Duration) {
        println!("\n📊 LATENCY REPORT");
        println!("=================");
        println!("  Succeeded:  {}", self.samples.len());
        println!("  Timed out:  {}", self.timed_out);
        println!("  Failed:     {}", self.failed);

        if self.samples.is_empty() {
            println!("  No samples collected");
            return;
        }
        self.samples.sort_unstable();
        let sum: u64 = self.samples.iter().sum();
        let avg = sum / self.samples.len() as u64;
        let us = |ns: u64| ns as f64 / 1000.0;

        println!("  Min:        {:.2} μs", us(self.samples[0]));
        println!("  Max:        {:.2} μs", us(self.samples[self.samples.len() - 1]));
        println!("  Avg:        {:.2} μs", us(avg));
        println!("\n  Percentiles:");
        for p in [50.0, 90.0, 99.0, 99.9] {
            println!(
                "    P{:<6}  {:.2} μs",
                p,
                us(Self::percentile(&self.samples, p))
            );
        }
        println!(
            "\n  Throughput: {:.0} calls/sec",
            self.samples.len() as f64 / elapsed.as_secs_f64().max(0.001)
        );
    }
}

fn run<S: Serializer>(args: &Args, serializer: S) -> courier::Result<()> {
    let client = Arc::new(RpcClient::new(
        ClientConfig::new("courier-client", args.server),
        serializer,
    ));
    client.startup()?;
    println!("🔌 Connected to {} ({})", args.server, args.format);

    let timeout = Duration::from_millis(args.timeout_ms);
    let report = Arc::new(Mutex::new(LatencyReport::default()));
    let started = Instant::now();

    let callers: Vec<_> = (0..args.callers.max(1))
        .map(|_| {
            let client = client.clone();
            let report = report.clone();
            let operation = args.operation.clone();
            let payload = args.payload.clone().into_bytes();
            let count = args.count;
            thread::spawn(move || {
                let mut local = LatencyReport::default();
                for _ in 0..count {
                    let request = client.request(operation.as_str(), payload.clone());
                    let sent = Instant::now();
                    match client.invoke(request, timeout) {
                        Ok(resp) if resp.is_ok() => {
                            local.samples.push(sent.elapsed().as_nanos() as u64)
                        }
                        Ok(resp) => {
                            warn!(id = resp.id, error = ?resp.error, "server returned an error");
                            local.failed += 1;
                        }
                        Err(Error::TimedOut { .. }) => local.timed_out += 1,
                        Err(e) => {
                            error!(error = %e, "invocation failed");
                            local.failed += 1;
                            break;
                        }
                    }
                }
                report.lock().merge(local);
            })
        })
        .collect();

    for caller in callers {
        if caller.join().is_err() {
            error!("caller thread panicked");
        }
    }
    let elapsed = started.elapsed();

    client.shutdown()?;
    let report = std::mem::take(&mut *report.lock());
    report.print(elapsed);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = match args.format.as_str() {
        "json" => run(&args, JsonSerializer),
        "msgpack" => run(&args, MsgPackSerializer),
        other => {
            error!(format = other, "unknown format, expected msgpack or json");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        error!(error = %e, "client error");
        std::process::exit(1);
    }
}
