//! Criterion benchmarks for gradient projection on synthetic grids.
//!
//! Run with: cargo bench --bench assignment

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tapgp::evaluation::relative_gap;
use tapgp::options::CostModel;
use tapgp::synthetic::{grid_network, GridOptions};
use tapgp::{ClassDemand, GradientProjection, MultiClassGradientProjection, Solver, SolverConfig, TrafficClass};

fn config() -> SolverConfig {
    SolverConfig::default()
        .with_max_iterations(50)
        .with_iteration_history(false)
}

fn bench_single_class(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_class");
    for size in [5usize, 10, 20] {
        let options = GridOptions::new(size, size).with_od_draws(size * size);
        let network = grid_network(&options, CostModel::default(), 7).expect("valid grid");
        group.bench_with_input(BenchmarkId::from_parameter(size), &network, |b, network| {
            b.iter(|| {
                let mut solver = Solver::new(network.clone(), config(), GradientProjection::new());
                black_box(solver.solve().expect("valid config"))
            });
        });
    }
    group.finish();
}

fn bench_multi_class(c: &mut Criterion) {
    let options = GridOptions::new(10, 10).with_od_draws(100).with_tolls(0.2, 1.5);
    let network = grid_network(&options, CostModel::default(), 7).expect("valid grid");
    c.bench_function("multi_class_10x10", |b| {
        b.iter(|| {
            let classes = vec![
                TrafficClass::new("cars", ClassDemand::Share(0.8)),
                TrafficClass::new("trucks", ClassDemand::Share(0.2)).with_toll_factor(3.0),
            ];
            let mut solver = Solver::new(
                network.clone(),
                config(),
                MultiClassGradientProjection::new(classes),
            );
            black_box(solver.solve().expect("valid config"))
        });
    });
}

fn bench_relative_gap(c: &mut Criterion) {
    let options = GridOptions::new(20, 20).with_od_draws(400);
    let network = grid_network(&options, CostModel::default(), 7).expect("valid grid");
    let mut solver = Solver::new(network, config().with_max_iterations(5), GradientProjection::new());
    solver.solve().expect("valid config");
    let (network, _) = solver.into_parts();
    c.bench_function("relative_gap_20x20", |b| {
        b.iter(|| black_box(relative_gap(&network, 0.0, true)))
    });
}

criterion_group!(benches, bench_single_class, bench_multi_class, bench_relative_gap);
criterion_main!(benches);
