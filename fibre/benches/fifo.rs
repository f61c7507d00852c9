use criterion::{criterion_group, criterion_main, Criterion};

use fibre::chunk::{BufChain, Chunk};
use fibre::fifo::Fifo;

fn append_drain(c: &mut Criterion) {
    let payload = [0x5au8; 48];

    c.bench_function("fifo_append_drain", |b| {
        let mut fifo = Fifo::new(256);
        b.iter(|| {
            let chain = BufChain::from_chunks(vec![
                Chunk::buf(0, &payload),
                Chunk::frame_boundary(0),
            ]);
            fifo.append(&chain);
            let mut it = fifo.read_begin();
            while it != fifo.read_end() {
                criterion::black_box(fifo.chunk_at(it));
                it = fifo.next(it);
            }
            fifo.drop_until(it);
        })
    });
}

fn ack_advance(c: &mut Criterion) {
    let payload = [0x5au8; 16];

    c.bench_function("fifo_ack_advance", |b| {
        let mut fifo = Fifo::new(256);
        b.iter(|| {
            for _ in 0..4 {
                let chain = BufChain::from_chunks(vec![
                    Chunk::buf(0, &payload),
                    Chunk::frame_boundary(0),
                ]);
                fifo.append(&chain);
            }
            let it = fifo.advance_counts(fifo.read_begin(), [4, 0, 0], [0, 0, 0]);
            fifo.drop_until(it);
        })
    });
}

criterion_group!(benches, append_drain, ack_advance);
criterion_main!(benches);
