use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fcwta::sparsity::{apply_mask, lifetime_mask, sparsity_k};
use fcwta::{ModelConfig, Session, WtaModel};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::hint::black_box;

fn gen_code(batch: usize, hidden: usize) -> Array2<f32> {
    Array2::<f32>::random((batch, hidden), Uniform::new(0.0, 1.0))
}

fn mask_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Lifetime_Mask");

    // (batch_size, hidden_units)
    let params = vec![
        (100, 64),   // Small code
        (100, 1000), // Wide code
        (1000, 256), // Large batch
    ];
    let sparsity = 0.05;

    for (batch_size, hidden) in params {
        let code = gen_code(batch_size, hidden);
        let k = sparsity_k(sparsity, batch_size).unwrap();
        group.throughput(Throughput::Elements((batch_size * hidden) as u64));

        group.bench_with_input(
            BenchmarkId::new("mask_and_apply", format!("{batch_size}x{hidden}")),
            &code,
            |b, code| {
                b.iter(|| {
                    let mask = lifetime_mask(black_box(code.view()), k).unwrap();
                    apply_mask(code.view(), &mask).unwrap()
                });
            },
        );
    }
    group.finish();
}

fn step_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Training_Step");

    let (input_dim, batch_size, hidden) = (784, 100, 100);
    let config = ModelConfig {
        hidden_units: hidden,
        ..ModelConfig::new(input_dim, batch_size)
    };
    let mut session = Session::new();
    let model = WtaModel::build(config, &mut session).unwrap();
    let input = Array2::<f32>::random((batch_size, input_dim), Uniform::new(0.0, 1.0));

    group.bench_function("forward_only", |b| {
        b.iter(|| model.step(&mut session, black_box(&input), true).unwrap());
    });
    group.bench_function("train", |b| {
        b.iter(|| model.step(&mut session, black_box(&input), false).unwrap());
    });
    group.finish();
}

criterion_group!(benches, mask_benchmark, step_benchmark);
criterion_main!(benches);
