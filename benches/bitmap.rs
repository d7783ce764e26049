use criterion::{black_box, criterion_group, criterion_main, Criterion};
use opscan::bitmap::RangeBitmap;

fn bench_bitmap(c: &mut Criterion) {
    c.bench_function("bitmap_mark_exec", |b| {
        let mut bm = RangeBitmap::new(0, 1 << 16).unwrap();
        let mut opcode = 0u32;
        b.iter(|| {
            bm.mark_exec(black_box(opcode & 0xFFFF));
            opcode = opcode.wrapping_add(1);
        });
    });

    c.bench_function("bitmap_flush_64k", |b| {
        let mut bm = RangeBitmap::new(0, 1 << 16).unwrap();
        for opcode in (0..1u32 << 16).step_by(3) {
            bm.mark_exec(opcode);
        }
        bm.mark_timeout(5);
        b.iter(|| {
            let mut exec = Vec::with_capacity(1 << 13);
            let mut timeout = Vec::with_capacity(1 << 13);
            bm.flush(&mut exec, &mut timeout).unwrap();
            black_box(exec.len())
        });
    });
}

criterion_group!(benches, bench_bitmap);
criterion_main!(benches);
