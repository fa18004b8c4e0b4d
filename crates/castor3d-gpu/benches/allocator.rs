use castor3d_gpu::buffer::GpuBufferAllocator;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("Buddy allocator churn");
    for level in [8u32, 12, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(level), &level, |b, &level| {
            b.iter(|| {
                let mut allocator = GpuBufferAllocator::new(level, 256);
                let mut offsets = Vec::new();
                while let Some(offset) = allocator.allocate(black_box(256)) {
                    offsets.push(offset);
                }
                for offset in offsets.iter().step_by(2) {
                    let _ = allocator.deallocate(*offset);
                }
                while allocator.allocate(black_box(512)).is_some() {}
                allocator
            });
        });
    }
    group.finish();
}

fn mixed_sizes(c: &mut Criterion) {
    c.bench_function("Buddy allocator mixed sizes", |b| {
        b.iter(|| {
            let mut allocator = GpuBufferAllocator::new(14, 64);
            let sizes = [64u64, 200, 1024, 96, 4096, 128];
            let mut live = Vec::new();
            for i in 0..512 {
                if let Some(offset) = allocator.allocate(sizes[i % sizes.len()]) {
                    live.push(offset);
                }
                if i % 3 == 0 {
                    if let Some(offset) = live.pop() {
                        let _ = allocator.deallocate(offset);
                    }
                }
            }
            black_box(allocator.allocated_bytes())
        });
    });
}

criterion_group!(benches, churn, mixed_sizes);
criterion_main!(benches);
