//! MsgBuffer construction and resize microbenchmarks.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use nexrpc::{MsgBuffer, SlabAllocator, required_class_size};

fn bench_msg_buffer(c: &mut Criterion) {
    let alloc = SlabAllocator::new();

    c.bench_function("msg_buffer_alloc_4k_3pkt", |b| {
        b.iter(|| {
            let buffer = alloc.alloc(required_class_size(4096, 3));
            let msgbuf = MsgBuffer::from_buffer(buffer, 4096, 3);
            black_box(msgbuf)
        })
    });

    let buffer = alloc.alloc(required_class_size(65536, 16));
    let mut msgbuf = MsgBuffer::from_buffer(buffer, 65536, 16);
    c.bench_function("msg_buffer_resize", |b| {
        b.iter(|| {
            msgbuf.resize(black_box(512), black_box(1));
            msgbuf.resize(black_box(65536), black_box(16));
        })
    });

    c.bench_function("msg_buffer_pkthdr_n", |b| {
        b.iter(|| {
            for n in 1..16 {
                black_box(msgbuf.pkthdr_n(n));
            }
        })
    });
}

criterion_group!(benches, bench_msg_buffer);
criterion_main!(benches);
