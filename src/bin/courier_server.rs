//! Courier demo server
//!
//! Operations:
//! - `echo`: returns the payload unchanged
//! - `upper`: ASCII-uppercases the payload
//! - `sleep`: waits the number of milliseconds given as the payload, then echoes it
//!
//! Usage:
//!   cargo run --release --bin courier_server -- [OPTIONS]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use courier::{
    ChannelOption, JsonSerializer, MsgPackSerializer, Request, Response, RpcServer, Serializer,
    ServerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "courier_server", about = "Courier demo RPC server")]
struct Args {
    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0:9999")]
    bind: SocketAddr,

    /// I/O threads (clamped to the number of cores)
    #[arg(long)]
    io_threads: Option<usize>,

    /// Handler threads
    #[arg(long)]
    dispatch_threads: Option<usize>,

    /// Maximum frame payload in bytes
    #[arg(long, default_value_t = courier::protocol::DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,

    /// Payload encoding: msgpack or json
    #[arg(long, default_value = "msgpack")]
    format: String,

    /// Seconds between stats reports
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,

    /// Stop after this many seconds (0 runs forever)
    #[arg(long, default_value_t = 0)]
    duration: u64,
}

/// Server statistics
#[derive(Default)]
struct ServerStats {
    requests: AtomicU64,
    failed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections_closed: AtomicU64,
}

impl ServerStats {
    fn print(&self, uptime: Duration) {
        let requests = self.requests.load(Ordering::Relaxed);
        let rate = requests as f64 / uptime.as_secs_f64().max(0.001);

        println!("\n📊 Server Stats (uptime: {:.1}s)", uptime.as_secs_f64());
        println!("   Requests:      {} ({:.1}/sec)", requests, rate);
        println!("   Failed:        {}", self.failed.load(Ordering::Relaxed));
        println!("   Bytes in:      {} KB", self.bytes_in.load(Ordering::Relaxed) / 1024);
        println!("   Bytes out:     {} KB", self.bytes_out.load(Ordering::Relaxed) / 1024);
        println!(
            "   Disconnects:   {}",
            self.connections_closed.load(Ordering::Relaxed)
        );
    }
}

fn handle(stats: &ServerStats, request: Request) -> Response {
    stats.requests.fetch_add(1, Ordering::Relaxed);
    stats
        .bytes_in
        .fetch_add(request.payload.len() as u64, Ordering::Relaxed);

    let response = match request.operation.as_str() {
        "echo" => Response::ok(request.id, request.payload),
        "upper" => Response::ok(request.id, request.payload.to_ascii_uppercase()),
        "sleep" => {
            let millis = std::str::from_utf8(&request.payload)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok());
            match millis {
                Some(ms) => {
                    thread::sleep(Duration::from_millis(ms));
                    Response::ok(request.id, request.payload)
                }
                None => Response::error(request.id, "sleep expects a millisecond count"),
            }
        }
        other => Response::error(request.id, format!("unknown operation `{}`", other)),
    };

    if response.is_ok() {
        stats
            .bytes_out
            .fetch_add(response.payload.len() as u64, Ordering::Relaxed);
    } else {
        stats.failed.fetch_add(1, Ordering::Relaxed);
    }
    response
}

fn run<S: Serializer>(args: &Args, serializer: S) -> courier::Result<()> {
    let stats = Arc::new(ServerStats::default());
    let mut server = RpcServer::new(ServerConfig::new("courier-server", args.bind), serializer);

    if let Some(n) = args.io_threads {
        server.set_io_threads(n)?;
    }
    if let Some(n) = args.dispatch_threads {
        server.set_dispatch_threads(n)?;
    }
    server.set_max_frame_size(args.max_frame_size)?;
    server.set_child_option(ChannelOption::TcpNoDelay(true))?;
    server.set_child_option(ChannelOption::KeepAlive(true))?;

    let handler_stats = stats.clone();
    server.set_handler(move |req: Request| handle(&handler_stats, req))?;

    let close_stats = stats.clone();
    server.add_close_listener(move |info| {
        close_stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        info!(conn = info.id, peer = %info.peer_addr, "client disconnected");
    })?;

    let ready = server.startup()?;
    if let courier::core::Outcome::Ready(addr) = ready.get(Duration::from_secs(5)) {
        println!("🚀 Courier server listening on {} ({})", addr, args.format);
    }

    let started = Instant::now();
    let interval = Duration::from_secs(args.stats_interval.max(1));
    loop {
        thread::sleep(interval);
        stats.print(started.elapsed());
        if args.duration > 0 && started.elapsed() >= Duration::from_secs(args.duration) {
            break;
        }
    }

    server.shutdown()
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
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
