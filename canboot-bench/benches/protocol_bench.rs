//! Datagram and frame codec benchmarks.

use bytes::BytesMut;
use canboot_protocol::{Datagram, Frame, FrameSplitter, Reassembler};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const DESTINATIONS: [u8; 4] = [1, 2, 3, 4];

fn create_test_datagram(payload_size: usize) -> Datagram {
    let payload: Vec<u8> = (0..payload_size).map(|i| i as u8).collect();
    Datagram::from_parts(&DESTINATIONS, &payload).unwrap()
}

fn bench_datagram_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("datagram_encode");

    for size in [8, 256, 2048] {
        let datagram = create_test_datagram(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &datagram, |b, datagram| {
            b.iter(|| black_box(datagram.encode()));
        });
    }

    group.finish();
}

fn bench_datagram_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("datagram_decode");

    for size in [8, 256, 2048] {
        let encoded = create_test_datagram(size).encode();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(Datagram::decode(encoded).unwrap()));
        });
    }

    group.finish();
}

fn bench_split_and_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_and_reassemble");

    for size in [8, 256, 2048] {
        let datagram = create_test_datagram(size);
        let capacity = size + 128;

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &datagram, |b, datagram| {
            b.iter(|| {
                let mut outgoing = datagram.clone();
                let mut reassembler = Reassembler::new(capacity);
                let mut done = None;
                for frame in FrameSplitter::new(&mut outgoing, 5) {
                    if let Some(result) = reassembler.push(&frame) {
                        done = Some(result);
                    }
                }
                black_box(done)
            });
        });
    }

    group.finish();
}

fn bench_frame_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_wire");
    let frame = Frame::new(0x80 | 5, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(frame.encode()));
    });

    let encoded = frame.encode();
    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&encoded[..]);
            black_box(Frame::decode(&mut buf).unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_datagram_encode,
    bench_datagram_decode,
    bench_split_and_reassemble,
    bench_frame_wire,
);
criterion_main!(benches);
