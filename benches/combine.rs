//! Benchmarks for flag deduplication and per-country merge.
//!
//! Run with: `cargo bench --bench combine`
//!
//! | Operation | Notes |
//! |-----------|-------|
//! | add | Complete-form normalization + identity lookup |
//! | combine | Folding per-shard containers into one country result |
//! | reconstruct | Re-emitting merged flags as events |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sharded_checks::{Entity, Flag, FlagContainer, Location};

/// Flags of one shard; `overlap` of them are shared with the neighbor shard.
fn shard_flags(shard: i64, count: i64, overlap: i64) -> Vec<Flag> {
    (0..count)
        .map(|i| {
            let id = if i < overlap { i } else { shard * 1_000_000 + i };
            let entity = Entity::point(id, Location::new(10.0 + i as f64 * 1e-4, 20.0));
            Flag::new("OrphanEdge", id.to_string())
                .with_object(&entity)
                .with_instruction(format!("seen from shard {}", shard))
        })
        .collect()
}

fn container(flags: &[Flag]) -> FlagContainer {
    let mut container = FlagContainer::new();
    container.add_all(flags);
    container
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");
    for count in [100i64, 1_000, 10_000] {
        let flags = shard_flags(1, count, 0);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &flags, |b, flags| {
            b.iter(|| black_box(container(flags)))
        });
    }
    group.finish();
}

fn bench_combine(c: &mut Criterion) {
    let mut group = c.benchmark_group("combine");
    for shards in [4i64, 16, 64] {
        let containers: Vec<FlagContainer> = (0..shards)
            .map(|s| container(&shard_flags(s, 500, 50)))
            .collect();
        group.throughput(Throughput::Elements(shards as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(shards),
            &containers,
            |b, containers| {
                b.iter(|| {
                    let merged = containers
                        .iter()
                        .cloned()
                        .fold(FlagContainer::new(), FlagContainer::combine);
                    black_box(merged.len())
                })
            },
        );
    }
    group.finish();
}

fn bench_reconstruct(c: &mut Criterion) {
    let merged = (0..16)
        .map(|s| container(&shard_flags(s, 500, 50)))
        .fold(FlagContainer::new(), FlagContainer::combine);
    c.bench_function("reconstruct_events", |b| {
        b.iter(|| black_box(merged.reconstruct_events().count()))
    });
}

criterion_group!(benches, bench_add, bench_combine, bench_reconstruct);
criterion_main!(benches);
