use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reg_engine::dirty::DirtyTracker;
use reg_engine::subkey_list::{lf_hash, lh_hash};
use reg_engine::utils::calculate_checksum;

fn bench_header_checksum(c: &mut Criterion) {
    let mut page = vec![0u8; 4096];
    for (i, byte) in page.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    c.bench_function("header_checksum", |b| {
        b.iter(|| calculate_checksum(black_box(&page)))
    });
}

fn bench_subkey_hashes(c: &mut Criterion) {
    let names: Vec<String> = (0..256).map(|i| format!("ControlSet{i:03}")).collect();

    c.bench_function("lh_hash_256_names", |b| {
        b.iter(|| {
            for name in &names {
                black_box(lh_hash(black_box(name)));
            }
        })
    });

    c.bench_function("lf_hash_256_names", |b| {
        b.iter(|| {
            for name in &names {
                black_box(lf_hash(black_box(name)));
            }
        })
    });
}

fn bench_dirty_coalescing(c: &mut Criterion) {
    c.bench_function("coalesce_1000_ranges", |b| {
        b.iter(|| {
            let mut tracker = DirtyTracker::new(4096);
            for i in 0..1000usize {
                tracker.add((i * 37) % (1 << 20), 64 + (i % 512));
            }
            black_box(tracker.coalesced())
        })
    });
}

criterion_group!(
    benches,
    bench_header_checksum,
    bench_subkey_hashes,
    bench_dirty_coalescing
);
criterion_main!(benches);
