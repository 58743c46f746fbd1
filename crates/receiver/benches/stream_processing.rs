//! Performance benchmarks for stream processing.
//!
//! These benchmarks measure the per-frame hot path of a session:
//! - Stream frame decryption
//! - Payload decoding
//! - Registry updates and viewer snapshots

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use protocol::{
    DecryptOutcome, SharedSecret, StreamDecryptor, StreamEncryptor, StreamKeys,
};
use receiver::decode::{DecodedFrame, FrameDecoder};
use receiver::registry::StreamRegistry;

fn stream_keys() -> StreamKeys {
    StreamKeys::derive(&SharedSecret::from_bytes([7u8; 32])).unwrap()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Benchmark decrypting one sealed frame.
fn bench_decrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decrypt");
    let keys = stream_keys();

    for (label, size) in [("small_4KB", 4096), ("medium_64KB", 65536), ("large_1MB", 1 << 20)] {
        let frame = StreamEncryptor::new(keys.clone())
            .seal_frame_with_counter(0, &vec![0xA5u8; size])
            .unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(label, |b| {
            b.iter_batched(
                || StreamDecryptor::new(keys.clone()),
                |mut decryptor| {
                    let outcome = decryptor.decrypt_next(black_box(&frame)).unwrap();
                    assert!(matches!(outcome, DecryptOutcome::Frame(_)));
                    outcome
                },
                BatchSize::SmallInput,
            );
        });
    }

    // A frame arriving in 1400-byte segments
    let frame = StreamEncryptor::new(keys.clone())
        .seal_frame_with_counter(0, &vec![0x5Au8; 65536])
        .unwrap();
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("segmented_64KB", |b| {
        b.iter_batched(
            || StreamDecryptor::new(keys.clone()),
            |mut decryptor| {
                let mut last = None;
                for segment in frame.chunks(1400) {
                    last = Some(decryptor.decrypt_next(black_box(segment)).unwrap());
                }
                last
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Benchmark decoding payloads into BGR frames.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for (label, width, height) in [("png_320x180", 320, 180), ("png_1280x720", 1280, 720)] {
        let payload = png(width, height);
        group.throughput(Throughput::Elements(1));
        group.bench_function(label, |b| {
            let mut decoder = FrameDecoder::new();
            b.iter(|| decoder.decode(black_box(&payload)).unwrap());
        });
    }

    let annexb = [0u8, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0, 0, 0, 1, 0x68];
    group.bench_function("annexb_placeholder", |b| {
        let mut decoder = FrameDecoder::new();
        b.iter(|| decoder.decode(black_box(&annexb)).unwrap());
    });

    group.finish();
}

/// Benchmark registry writes and reads with a full set of feeds.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    let registry = StreamRegistry::new(8);
    let ids: Vec<_> = (0..8)
        .map(|i| {
            let id = registry.next_feed_id();
            registry.register(id, &format!("Device {i}")).unwrap();
            id
        })
        .collect();
    let frame = DecodedFrame::from_bgr(640, 360, vec![0u8; 640 * 360 * 3]).unwrap();
    for id in &ids {
        registry.update_frame(*id, frame.clone());
    }

    group.bench_function("update_frame", |b| {
        b.iter(|| registry.update_frame(black_box(ids[3]), frame.clone()));
    });

    group.bench_function("snapshot_8_feeds", |b| {
        b.iter(|| black_box(registry.snapshot()));
    });

    // Snapshots taken while another thread keeps publishing
    let shared = Arc::new(registry);
    let writer = {
        let shared = Arc::clone(&shared);
        let frame = frame.clone();
        let id = ids[0];
        std::thread::spawn(move || {
            for _ in 0..10_000 {
                shared.update_frame(id, frame.clone());
            }
        })
    };
    group.bench_function("snapshot_under_writes", |b| {
        b.iter(|| black_box(shared.snapshot()));
    });
    writer.join().unwrap();

    group.finish();
}

criterion_group!(benches, bench_decrypt, bench_decode, bench_registry);
criterion_main!(benches);
