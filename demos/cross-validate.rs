use imclass::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::{fmt, EnvFilter};

/// Fake "image": descriptors drawn mostly around the centers its class favors.
fn image(rng: &mut StdRng, centers: &[Desc], class: usize) -> (Vec<Desc>, Vec<KeyPoint>) {
    let n = rng.gen_range(20..60);
    let mut features = Vec::with_capacity(n);
    let mut keypoints = Vec::with_capacity(n);
    for _ in 0..n {
        let c = match rng.gen_bool(0.7) {
            true => (class * 2 + rng.gen_range(0..2)) % centers.len(),
            false => rng.gen_range(0..centers.len()),
        };
        features.push(
            centers[c]
                .iter()
                .map(|v| *v + rng.gen_range(-1.0f32..1.0))
                .collect(),
        );
        keypoints.push(KeyPoint {
            x: rng.gen_range(0.0..640.0),
            y: rng.gen_range(0.0..480.0),
        });
    }
    (features, keypoints)
}

fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let mut rng = StdRng::seed_from_u64(42);
    let centers: Vec<Desc> = (0..6)
        .map(|_| (0..32).map(|_| rng.gen_range(-4.0..4.0)).collect())
        .collect();
    let classes = ["beach", "forest", "city"];
    let extent = ImageExtent {
        width: 640.,
        height: 480.,
    };

    // Images of every class, with the descriptors pooled for the vocabulary
    let mut images = Vec::new();
    let mut builder = VocabularyBuilder::new();
    for i in 0..60 {
        let class = i % classes.len();
        let (features, keypoints) = image(&mut rng, &centers, class);
        builder.add_descriptors(&features).unwrap();
        images.push((classes[class], features, keypoints));
    }
    let voc = builder
        .compute(&VocabularySettings {
            size: 12,
            attempts: 2,
            seed: Some(1),
            ..Default::default()
        })
        .unwrap();
    println!("Vocabulary: {:#?}", voc);

    for &soft_kernel in [false, true].iter() {
        let settings = EncodingSettings {
            soft_kernel,
            kernel_distance_squared: 16.,
            spatial_pyramid_depth: 2,
        };
        let bof = BagOfFeatures::new(&voc, settings).unwrap();

        let mut labels = LabelMap::new();
        let mut set = TrainingSet::new();
        for (name, features, keypoints) in images.iter() {
            let bow = bof
                .spatial_feature_vector(features, keypoints, extent)
                .unwrap();
            set.add_sample(bow, labels.get_or_insert(name)).unwrap();
        }

        let report = cross_validate_report(&set, 5, &ClassifierSettings::default()).unwrap();
        println!(
            "soft kernel: {:5} | accuracy: {:.3} | folds: {:?}",
            soft_kernel, report.accuracy, report.folds
        );
    }
}
