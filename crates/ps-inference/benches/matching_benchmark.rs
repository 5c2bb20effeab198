use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ps_inference::{
    GbmConfig, GbmPropensity, MatchConfig, SimulationConfig, generate_dataset, match_estimate,
};
use ps_translate::AnalysisFrame;
use std::hint::black_box;

fn dataset(n: usize) -> (Vec<f64>, Vec<u8>, Vec<Vec<f64>>, Vec<String>) {
    let cfg = SimulationConfig { n, ..SimulationConfig::default() };
    let table = generate_dataset(&cfg).unwrap();
    let frame = AnalysisFrame::from_table(&table, &cfg.schema()).unwrap();
    let (x, names) = frame.design();
    (frame.outcome().unwrap().to_vec(), frame.treatment.clone(), x, names)
}

fn bench_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("matching");
    for n in [200usize, 1000] {
        let (y, t, x, _) = dataset(n);
        let cfg = MatchConfig::default();
        group.bench_with_input(BenchmarkId::new("m1_inverse_variance", n), &n, |b, _| {
            b.iter(|| black_box(match_estimate(black_box(&y), &t, &x, &cfg)).unwrap())
        });
        let cfg4 = MatchConfig { m: 4, ..MatchConfig::default() };
        group.bench_with_input(BenchmarkId::new("m4_inverse_variance", n), &n, |b, _| {
            b.iter(|| black_box(match_estimate(black_box(&y), &t, &x, &cfg4)).unwrap())
        });
    }
    group.finish();
}

fn bench_gbm_propensity(c: &mut Criterion) {
    let (_, t, x, names) = dataset(1000);
    let model = GbmPropensity::new(GbmConfig { n_trees: 200, ..GbmConfig::default() }, names);
    c.bench_function("gbm_propensity_1000x200", |b| {
        b.iter(|| black_box(model.fit(black_box(&t), &x)).unwrap())
    });
}

criterion_group!(benches, bench_matching, bench_gbm_propensity);
criterion_main!(benches);
