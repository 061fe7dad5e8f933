use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use shardmap::recovery::compare_mappings;
use shardmap::{
    ManagerConfig, Mapping, MappingStatus, Shard, ShardKey, ShardKeyType, ShardLocation,
    ShardMap, ShardMapKind, ShardMapManager, ShardRange, SledStoreProvider,
};
use uuid::Uuid;

fn range(low: i64, high: i64) -> ShardRange {
    ShardRange::new(ShardKey::new(low).unwrap(), ShardKey::new(high).unwrap()).unwrap()
}

/// `count` adjacent mappings of width 10 on one shard.
fn build_mappings(map: &ShardMap, shard: &Shard, count: i64) -> Vec<Mapping> {
    (0..count)
        .map(|i| Mapping::new_range(map, shard, range(i * 10, i * 10 + 10), MappingStatus::Online).unwrap())
        .collect()
}

// ============================================================================
// Benchmark: Key Normalization
// ============================================================================

fn bench_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_normalization");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("int32", |b| {
        let mut counter = 0i32;
        b.iter(|| {
            let key = ShardKey::new(black_box(counter)).unwrap();
            counter = counter.wrapping_add(1);
            black_box(key);
        });
    });

    group.bench_function("int64", |b| {
        let mut counter = 0i64;
        b.iter(|| {
            let key = ShardKey::new(black_box(counter)).unwrap();
            counter = counter.wrapping_add(1);
            black_box(key);
        });
    });

    group.bench_function("guid", |b| {
        let id = Uuid::new_v4();
        b.iter(|| black_box(ShardKey::new(black_box(id)).unwrap()));
    });

    group.bench_function("parse_int64", |b| {
        b.iter(|| black_box(ShardKey::parse(ShardKeyType::Int64, black_box("-123456789")).unwrap()));
    });

    group.bench_function("compare", |b| {
        let low = ShardKey::new(-5i64).unwrap();
        let high = ShardKey::new(5i64).unwrap();
        b.iter(|| black_box(black_box(&low) < black_box(&high)));
    });

    group.finish();
}

// ============================================================================
// Benchmark: Mapping Comparison
// ============================================================================

fn bench_compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("compare_mappings");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    let map = ShardMap::new("bench", ShardMapKind::Range, ShardKeyType::Int64);
    let shard = Shard::new(&map, ShardLocation::new("srv", "db0"));

    for count in [10i64, 100, 1000].iter() {
        let global = build_mappings(&map, &shard, *count);

        // Identical sides
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("identical", count), count, |b, _| {
            let local: Vec<Mapping> = global.iter().map(Mapping::local_copy).collect();
            b.iter(|| black_box(compare_mappings(&global, &local).unwrap()));
        });

        // Every other mapping lost on the shard
        group.bench_with_input(BenchmarkId::new("half_missing", count), count, |b, _| {
            let local: Vec<Mapping> = global
                .iter()
                .step_by(2)
                .map(Mapping::local_copy)
                .collect();
            b.iter(|| black_box(compare_mappings(&global, &local).unwrap()));
        });

        // Shard holds a different set of boundaries
        group.bench_with_input(BenchmarkId::new("shifted", count), count, |b, _| {
            let local: Vec<Mapping> = (0..*count)
                .map(|i| {
                    Mapping::new_range(&map, &shard, range(i * 10 + 5, i * 10 + 15), MappingStatus::Online)
                        .unwrap()
                })
                .collect();
            b.iter(|| black_box(compare_mappings(&global, &local).unwrap()));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Lookup
// ============================================================================

fn lookup_manager(cache_enabled: bool) -> (ShardMapManager, ShardMap) {
    let config = ManagerConfig {
        cache_enabled,
        replay_on_access: false,
        ..Default::default()
    };
    let manager = ShardMapManager::new(Arc::new(SledStoreProvider::temporary()), config);
    let map = manager
        .create_shard_map("bench", ShardMapKind::Range, ShardKeyType::Int64)
        .unwrap();
    let shard = manager
        .add_shard(&map, ShardLocation::new("srv", "db0"))
        .unwrap();
    for i in 0..100i64 {
        manager
            .add_range_mapping(&map, &shard, range(i * 10, i * 10 + 10), MappingStatus::Online)
            .unwrap();
    }
    (manager, map)
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(10));

    for cache_enabled in [true, false] {
        let (manager, map) = lookup_manager(cache_enabled);
        let name = if cache_enabled { "cached" } else { "uncached" };
        group.bench_function(name, |b| {
            let mut counter = 0i64;
            b.iter(|| {
                let key = ShardKey::new(counter % 1000).unwrap();
                counter += 1;
                black_box(manager.lookup(&map, &key).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_keys, bench_compare, bench_lookup);

criterion_main!(benches);
