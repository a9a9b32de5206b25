use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slabfs::core::allocator::Bitmap;
use slabfs::{Config, Volume};

fn bench_bitmap_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitmap");

    for size in [1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::new("allocate_free", size), &size, |b, &size| {
            b.iter(|| {
                let mut bitmap = Bitmap::new(1024);
                let mut live = Vec::new();
                while let Some(start) = bitmap.allocate(size).unwrap() {
                    live.push(start);
                }
                // free every other run to leave fragments, then refill them
                for start in live.iter().step_by(2) {
                    bitmap.free(*start, size).unwrap();
                }
                while bitmap.allocate(size).unwrap().is_some() {}
                black_box(bitmap.free_bits())
            });
        });
    }
    group.finish();
}

fn bench_small_file_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("small_files");

    for file_size in [256usize, 4 * 1024, 32 * 1024] {
        group.throughput(Throughput::Bytes((file_size * 50) as u64));
        group.bench_with_input(
            BenchmarkId::new("write_50", file_size),
            &file_size,
            |b, &file_size| {
                let data = vec![0xAB; file_size];
                b.iter(|| {
                    let mut volume = Volume::in_memory(Config::with_geometry(512, 0)).unwrap();
                    for i in 0..50 {
                        volume
                            .write_all_bytes(&format!("/bench/f{}.bin", i), &data)
                            .unwrap();
                    }
                    black_box(volume.stats().unwrap().free_blocks)
                });
            },
        );
    }
    group.finish();
}

fn bench_growing_file(c: &mut Criterion) {
    c.bench_function("append_until_defrag", |b| {
        let chunk = vec![0x5A; 3000];
        b.iter(|| {
            let mut volume = Volume::in_memory(Config::with_geometry(512, 0)).unwrap();
            for i in 0..60 {
                volume.append_all_bytes("/grow", &chunk).unwrap();
                volume.append_all_bytes(&format!("/gap{}", i), b"x").unwrap();
            }
            black_box(volume.file_info("/grow").unwrap().length)
        });
    });
}

criterion_group!(
    benches,
    bench_bitmap_churn,
    bench_small_file_writes,
    bench_growing_file
);
criterion_main!(benches);
