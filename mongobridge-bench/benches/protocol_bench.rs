//! Wire codec benchmarks.

use bson::doc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mongobridge_protocol::{copy_message, MsgHeader, OpCode, ParsedQuery, HEADER_LEN};

fn query_message(doc_size: usize) -> (MsgHeader, Vec<u8>) {
    let body = doc! { "filter": "x".repeat(doc_size) };
    let doc_bytes = bson::to_vec(&body).unwrap();
    let mut wire = Vec::new();
    wire.extend_from_slice(&[0, 0, 0, 0]);
    wire.extend_from_slice(b"bench.items\0");
    wire.extend_from_slice(&0i32.to_le_bytes());
    wire.extend_from_slice(&(-1i32).to_le_bytes());
    wire.extend_from_slice(&doc_bytes);
    let header = MsgHeader {
        message_length: (HEADER_LEN + wire.len()) as i32,
        request_id: 1,
        response_to: 0,
        op_code: OpCode::Query,
    };
    (header, wire)
}

fn bench_header_roundtrip(c: &mut Criterion) {
    let header = MsgHeader {
        message_length: 1024,
        request_id: 42,
        response_to: 7,
        op_code: OpCode::Query,
    };
    c.bench_function("header_roundtrip", |b| {
        b.iter(|| {
            let wire = black_box(&header).to_wire();
            black_box(MsgHeader::from_wire(&wire))
        });
    });
}

fn bench_query_parse(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("query_parse");

    for size in [100, 1000, 10000] {
        let (header, wire) = query_message(size);
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                rt.block_on(async {
                    let mut msg = ParsedQuery::new(header);
                    let mut input = &wire[..];
                    black_box(msg.document(&mut input).await.unwrap());
                })
            });
        });
    }

    group.finish();
}

fn bench_copy_message(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("copy_message");

    for size in [100, 1000, 10000, 100000] {
        let header = MsgHeader {
            message_length: (HEADER_LEN + size) as i32,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Insert,
        };
        let mut wire = header.to_wire().to_vec();
        wire.extend_from_slice(&vec![0x42u8; size]);

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                rt.block_on(async {
                    let mut src = &wire[..];
                    let mut dst = Vec::with_capacity(wire.len());
                    copy_message(&mut dst, &mut src).await.unwrap();
                    black_box(dst)
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_header_roundtrip,
    bench_query_parse,
    bench_copy_message,
);

criterion_main!(benches);
