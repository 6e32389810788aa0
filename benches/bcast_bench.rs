use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use star_forest::prelude::*;

// leaves in root order (contiguous pack) vs shuffled (gathered pack)
fn self_graph(n: usize, shuffled: bool) -> Vec<SfNode> {
    let mut idx: Vec<usize> = (0..n).collect();
    if shuffled {
        idx.shuffle(&mut SmallRng::seed_from_u64(42));
    }
    idx.into_iter().map(|i| SfNode::new(0, i)).collect()
}

fn bench_self_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("self-partition");
    let ctx = SfContext::default();
    for &n in &[1_000usize, 100_000] {
        for shuffled in [false, true] {
            let mut sf = StarForest::new(&ctx, &NoComm).unwrap();
            sf.set_graph(n, n, None, self_graph(n, shuffled)).unwrap();
            sf.set_up().unwrap();
            let roots: Vec<f64> = (0..n).map(|i| i as f64).collect();
            let mut leaves = vec![0.0f64; n];
            let label = if shuffled { "bcast-shuffled" } else { "bcast-contiguous" };
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, _| {
                b.iter(|| {
                    sf.bcast(Unit::scalar(), black_box(&roots), &mut leaves, ReduceOp::Replace)
                        .unwrap()
                })
            });
            let mut acc = vec![0.0f64; n];
            let label = if shuffled { "reduce-shuffled" } else { "reduce-contiguous" };
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, _| {
                b.iter(|| {
                    sf.reduce(Unit::scalar(), black_box(&leaves), &mut acc, ReduceOp::Sum)
                        .unwrap()
                })
            });
        }
    }
    group.finish();
}

fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread-ring");
    group.sample_size(20);
    for backend in [SfBackend::Basic, SfBackend::Window] {
        let config = SfConfig {
            backend,
            ..SfConfig::default()
        };
        group.bench_function(BenchmarkId::new("bcast-x16", format!("{backend:?}")), |b| {
            b.iter(|| {
                ThreadWorld::run(4, |comm| {
                    let ctx = SfContext::initialize(config.clone());
                    let mut sf = StarForest::new(&ctx, &comm).unwrap();
                    let next = (comm.rank() + 1) % 4;
                    let n = 4096;
                    let remote: Vec<SfNode> = (0..n).map(|i| SfNode::new(next, i)).collect();
                    sf.set_graph(n, n, None, remote).unwrap();
                    let roots = vec![comm.rank() as u64; n];
                    let mut leaves = vec![0u64; n];
                    for _ in 0..16 {
                        sf.bcast(Unit::scalar(), &roots, &mut leaves, ReduceOp::Replace)
                            .unwrap();
                    }
                    leaves[0]
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_self_partition, bench_ring);
criterion_main!(benches);
