//! Courier - in-process demo
//!
//! Starts a server and a client over loopback and prints codec and
//! round-trip figures. For standalone processes see `courier_server` and
//! `courier_client` under src/bin/.

use std::time::{Duration, Instant};

use courier::core::Outcome;
use courier::{
    ClientConfig, FrameCodec, MsgPackSerializer, Request, Response, RpcClient, RpcServer,
    Serializer, ServerConfig,
};

fn main() {
    println!("🚀 Courier RPC - loopback demo");
    println!("==============================\n");

    benchmark_codec();

    if let Err(e) = benchmark_round_trip() {
        eprintln!("❌ Round trip failed: {}", e);
        std::process::exit(1);
    }

    println!("\n✅ Done!");
    println!("\nTo start a server: cargo run --release --bin courier_server");
}

fn benchmark_codec() {
    println!("📊 Frame Codec + MessagePack");
    println!("----------------------------");

    const ITERATIONS: usize = 200_000;
    let codec = FrameCodec::default();
    let serializer = MsgPackSerializer;
    let request = Request::new(1, "echo", vec![0u8; 64]);

    let start = Instant::now();
    let mut frame = bytes::Bytes::new();
    for _ in 0..ITERATIONS {
        let payload = match serializer.encode(&request) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("encode failed: {}", e);
                return;
            }
        };
        frame = match codec.encode(&payload) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("frame failed: {}", e);
                return;
            }
        };
    }
    let encode_duration = start.elapsed();

    let mut decoder = codec.decoder();
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        decoder.extend(&frame);
        if let Ok(Some(payload)) = decoder.decode() {
            let _ = serializer.decode::<Request>(&payload);
        }
    }
    let decode_duration = start.elapsed();

    let encode_ns = encode_duration.as_nanos() as f64 / ITERATIONS as f64;
    let decode_ns = decode_duration.as_nanos() as f64 / ITERATIONS as f64;

    println!("  Frame size: {} bytes", frame.len());
    println!("  Operations: {}", ITERATIONS);
    println!("  Encode latency: {:.2} ns/op", encode_ns);
    println!("  Decode latency: {:.2} ns/op", decode_ns);
    println!(
        "  Encode throughput: {:.2} M msgs/sec\n",
        ITERATIONS as f64 / encode_duration.as_secs_f64() / 1_000_000.0
    );
}

fn benchmark_round_trip() -> courier::Result<()> {
    println!("📊 Loopback Round Trip (blocking invoke)");
    println!("----------------------------------------");

    const ITERATIONS: usize = 10_000;
    let timeout = Duration::from_millis(500);

    let mut server = RpcServer::new(
        ServerConfig::new("demo-server", "127.0.0.1:0".parse().map_err(invalid)?),
        MsgPackSerializer,
    );
    server.set_handler(|req: Request| Response::ok(req.id, req.payload))?;
    let addr = match server.startup()?.get(Duration::from_secs(2)) {
        Outcome::Ready(addr) => addr,
        _ => return Err(courier::Error::NotStarted("demo-server".to_string())),
    };

    let client = RpcClient::new(ClientConfig::new("demo-client", addr), MsgPackSerializer);
    client.startup()?;

    // Warm up
    for _ in 0..100 {
        client.call("echo", "warmup", timeout)?;
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        let sent = Instant::now();
        client.call("echo", "ping", timeout)?;
        samples.push(sent.elapsed().as_nanos() as u64);
    }
    let total = start.elapsed();

    client.shutdown()?;
    server.shutdown()?;

    samples.sort_unstable();
    let pick = |p: f64| samples[((p / 100.0) * (samples.len() - 1) as f64) as usize] as f64 / 1000.0;

    println!("  Calls: {}", ITERATIONS);
    println!("  P50: {:.2} μs", pick(50.0));
    println!("  P99: {:.2} μs", pick(99.0));
    println!(
        "  Throughput: {:.0} calls/sec",
        ITERATIONS as f64 / total.as_secs_f64()
    );
    Ok(())
}

fn invalid(e: std::net::AddrParseError) -> courier::Error {
    courier::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}
