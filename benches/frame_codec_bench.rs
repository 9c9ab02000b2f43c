//! Criterion benchmark for the frame codec and serializers
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use courier::{FrameCodec, JsonSerializer, MsgPackSerializer, Request, Serializer};

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    let codec = FrameCodec::default();

    for size in [16usize, 256, 4096, 65535] {
        let payload = vec![0xabu8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, p| {
            b.iter(|| codec.encode(black_box(p)));
        });

        let frame = match codec.encode(&payload) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, f| {
            let mut decoder = codec.decoder();
            b.iter(|| {
                decoder.extend(black_box(f));
                decoder.decode()
            });
        });
    }

    group.finish();
}

fn bench_fragmented_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec_fragmented");
    let codec = FrameCodec::default();

    // 100 small frames delivered in 7-byte chunks.
    let mut stream = Vec::new();
    for i in 0..100u8 {
        if let Ok(frame) = codec.encode(&[i; 32]) {
            stream.extend_from_slice(&frame);
        }
    }
    group.throughput(Throughput::Elements(100));

    group.bench_function("push_chunks", |b| {
        b.iter(|| {
            let mut decoder = codec.decoder();
            let mut frames = 0;
            for chunk in stream.chunks(7) {
                if let Ok(out) = decoder.push(black_box(chunk)) {
                    frames += out.len();
                }
            }
            frames
        });
    });

    group.finish();
}

fn bench_serializers(c: &mut Criterion) {
    let mut group = c.benchmark_group("serializer");
    group.throughput(Throughput::Elements(1));

    let request = Request::new(42, "echo", vec![7u8; 64]).with_metadata("trace", "abc123");

    group.bench_function("msgpack_encode", |b| {
        b.iter(|| MsgPackSerializer.encode(black_box(&request)));
    });
    group.bench_function("json_encode", |b| {
        b.iter(|| JsonSerializer.encode(black_box(&request)));
    });

    if let Ok(bytes) = MsgPackSerializer.encode(&request) {
        group.bench_function("msgpack_decode", |b| {
            b.iter(|| MsgPackSerializer.decode::<Request>(black_box(&bytes)));
        });
    }
    if let Ok(bytes) = JsonSerializer.encode(&request) {
        group.bench_function("json_decode", |b| {
            b.iter(|| JsonSerializer.decode::<Request>(black_box(&bytes)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_fragmented_decode,
    bench_serializers
);
criterion_main!(benches);
