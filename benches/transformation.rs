//! Criterion benchmarks for lpt-rs.
//!
//! Run with: `cargo bench`
//!
//! # Benchmark groups
//!
//! 1. **transform_scenario**: one transformation pass over every
//!    concat-with-strided-slice scenario (graph construction excluded).
//!
//! 2. **markup_wide_concat**: a single pass over a Concat of 2, 8 and 32
//!    FakeQuantize branches, per-channel and per-tensor.
//!
//! 3. **evaluate**: the reference interpreter on the original and the
//!    transformed scenario graph, reported as input elements/second.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lpt_rs::graph::interpreter::evaluate;
use lpt_rs::graph::{Graph, OpType, PartialShape, Precision};
use lpt_rs::quantization::restrictions::{GranularityRestrictions, PrecisionRestrictions};
use lpt_rs::quantization::QuantizationInterval;
use lpt_rs::scenarios;
use lpt_rs::transformations::{all_rules, LowPrecisionTransformer};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Concat of `branches` FakeQuantize nodes with widening intervals.
fn wide_concat(branches: usize) -> Graph {
    let mut g = Graph::new("wide_concat");
    let fqs: Vec<_> = (0..branches)
        .map(|i| {
            let p = g
                .add_parameter(&format!("input{i}"), Precision::F32, PartialShape::from_static(&[1, 4, 8, 8]))
                .unwrap();
            let high = 2.55 * (i + 1) as f32;
            g.add_fake_quantize(p, QuantizationInterval::symmetric_io(256, 0.0, high)).unwrap()
        })
        .collect();
    let c = g.add_concat(&fqs, 1).unwrap();
    g.add_result(c).unwrap();
    g
}

// ---------------------------------------------------------------------------
// Group 1: Scenario transformation
// ---------------------------------------------------------------------------

fn bench_transform_scenario(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform_scenario");
    let shape = PartialShape::from_static(&[1, 4, 9, 9]);

    for case in scenarios::catalog() {
        let graph = case.build(&shape).unwrap().graph;
        let transformer = LowPrecisionTransformer::from_config(&case.config());
        group.bench_function(BenchmarkId::from_parameter(case.name), |b| {
            b.iter_batched(
                || graph.clone(),
                |mut g| {
                    let report = transformer.transform(&mut g).unwrap();
                    black_box(report.rewrites)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Group 2: Wide concat
// ---------------------------------------------------------------------------

fn bench_markup_wide_concat(c: &mut Criterion) {
    let mut group = c.benchmark_group("markup_wide_concat");

    for &branches in &[2_usize, 8, 32] {
        let graph = wide_concat(branches);
        group.throughput(Throughput::Elements(branches as u64));

        for (label, granularity) in [
            ("per_channel", GranularityRestrictions::new()),
            ("per_tensor", GranularityRestrictions::new().with(OpType::Concat)),
        ] {
            let transformer = LowPrecisionTransformer::new(PrecisionRestrictions::new(), granularity, &all_rules());
            group.bench_with_input(BenchmarkId::new(label, branches), &graph, |b, graph| {
                b.iter_batched(
                    || graph.clone(),
                    |mut g| black_box(transformer.transform(&mut g).unwrap().rewrites),
                    criterion::BatchSize::SmallInput,
                )
            });
        }
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Group 3: Interpreter
// ---------------------------------------------------------------------------

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    let case = scenarios::find("different_intervals").unwrap();

    for &(batch, spatial) in &[(1_usize, 9_usize), (4, 32)] {
        let shape = PartialShape::from_static(&[batch, 4, spatial, spatial]);
        let original = case.build(&shape).unwrap().graph;
        let mut transformed = original.clone();
        LowPrecisionTransformer::from_config(&case.config())
            .transform(&mut transformed)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let inputs = scenarios::random_inputs(&original, &mut rng, (0.0, 25.5), spatial);
        let elements: usize = inputs.values().map(|a| a.len()).sum();
        group.throughput(Throughput::Elements(elements as u64));

        let label = format!("{batch}x4x{spatial}x{spatial}");
        group.bench_with_input(BenchmarkId::new("original", &label), &original, |b, g| {
            b.iter(|| evaluate(black_box(g), black_box(&inputs)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("transformed", &label), &transformed, |b, g| {
            b.iter(|| evaluate(black_box(g), black_box(&inputs)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_transform_scenario, bench_markup_wide_concat, bench_evaluate);
criterion_main!(benches);
