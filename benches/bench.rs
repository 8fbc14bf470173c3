use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use imclass::*;

fn random_descs(rng: &mut StdRng, n: usize, dim: usize) -> Vec<Desc> {
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

/// Benchmark for BagOfFeatures::feature_vector()
fn encode(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let voc = Vocabulary::from_centroids(random_descs(&mut rng, 500, 64)).unwrap();
    let features = random_descs(&mut rng, 1000, 64);

    let mut group = c.benchmark_group("encode");
    for &soft_kernel in [false, true].iter() {
        let settings = EncodingSettings {
            soft_kernel,
            ..Default::default()
        };
        let bof = BagOfFeatures::new(&voc, settings).unwrap();
        group.bench_with_input(
            BenchmarkId::new("soft_kernel", soft_kernel),
            &features,
            |b, f| b.iter(|| bof.feature_vector(black_box(f)).unwrap()),
        );
    }
    group.finish();
}

/// Benchmark for KNearest::classify()
fn classify(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let mut set = TrainingSet::new();
    for (i, bow) in random_descs(&mut rng, 2000, 500).into_iter().enumerate() {
        set.add_sample(bow, (i % 10) as Label).unwrap();
    }
    let query = random_descs(&mut rng, 1, 500).remove(0);

    let mut group = c.benchmark_group("classify");
    for &neighbors in [1usize, 5, 25].iter() {
        let cls = set
            .create_classifier(&ClassifierSettings { neighbors })
            .unwrap();
        group.bench_with_input(BenchmarkId::new("neighbors", neighbors), &query, |b, q| {
            b.iter(|| cls.classify(black_box(q)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, encode, classify);
criterion_main!(benches);
