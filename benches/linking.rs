//! Linking benchmarks.
//!
//! Run with:
//! ```
//! cargo bench --bench linking
//! ```

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use linkrust_rs::events::NullSink;
use linkrust_rs::lcrd::LcrdFilter;
use linkrust_rs::test_support::{generate_references, person_ontology};
use linkrust_rs::{
    HashAlgorithm, IdGenerator, Linkrust, NoMonitor, PersistentStore, RunSettings, VecSource,
};
use std::hint::black_box;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// MERGE-PURGE BENCHMARKS
// =============================================================================

fn bench_merge_purge_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("linking/merge_purge");
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));

    let ontology = person_ontology();
    for count in [1_000usize, 5_000] {
        let references = generate_references(count, 0.2, 42).references;
        group.throughput(Throughput::Elements(count as u64));
        for bypass_filter in [false, true] {
            let label = if bypass_filter { "bypass" } else { "lcrd" };
            group.bench_with_input(
                BenchmarkId::new(label, count),
                &references,
                |b, references| {
                    b.iter_batched(
                        || VecSource::new(references.clone()),
                        |mut source| {
                            let mut repo = Linkrust::new(
                                ontology.clone(),
                                RunSettings {
                                    bypass_filter,
                                    ..RunSettings::default()
                                },
                            );
                            black_box(repo.run(&mut source, &mut NullSink, &NoMonitor).unwrap())
                        },
                        BatchSize::SmallInput,
                    )
                },
            );
        }
    }

    group.finish();
}

fn bench_identity_capture_persistent(c: &mut Criterion) {
    let mut group = c.benchmark_group("linking/identity_capture");
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(5));

    let ontology = person_ontology();
    let count = 1_000usize;
    let references = generate_references(count, 0.2, 42).references;
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function(BenchmarkId::new("rocksdb", count), |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let store = PersistentStore::open(dir.path()).unwrap();
                (dir, store, VecSource::new(references.clone()))
            },
            |(dir, store, mut source)| {
                let mut repo = Linkrust::with_store(ontology.clone(), store, RunSettings::default());
                let summary = repo.run(&mut source, &mut NullSink, &NoMonitor).unwrap();
                drop(repo);
                drop(dir);
                black_box(summary)
            },
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

// =============================================================================
// COMPONENT BENCHMARKS
// =============================================================================

fn bench_components(c: &mut Criterion) {
    let mut group = c.benchmark_group("linking/components");
    let ontology = person_ontology();
    let generated = generate_references(256, 0.0, 7);
    let resolved: Vec<_> = generated
        .references
        .iter()
        .enumerate()
        .map(|(seq, r)| ontology.resolve_reference(r, seq as u64).unwrap())
        .collect();

    let lcrd = LcrdFilter::build(ontology.rules());
    group.bench_function("lcrd_admits", |b| {
        b.iter(|| {
            let probe = &resolved[0].values;
            resolved
                .iter()
                .filter(|r| lcrd.admits(black_box(probe), &r.values))
                .count()
        })
    });

    for algorithm in [HashAlgorithm::Md5, HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
        let ids = IdGenerator::new(algorithm);
        group.bench_function(BenchmarkId::new("compute_id", algorithm), |b| {
            b.iter(|| {
                for r in &resolved {
                    black_box(ids.compute_id(&ontology, Some(&r.values), false));
                }
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_merge_purge_memory,
    bench_identity_capture_persistent,
    bench_components
);
criterion_main!(benches);
