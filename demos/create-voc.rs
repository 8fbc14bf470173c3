use imclass::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    // Stand-in for detected descriptors: noisy samples around 8 hidden centers
    let mut rng = StdRng::seed_from_u64(2013);
    let centers: Vec<Desc> = (0..8)
        .map(|_| (0..16).map(|_| rng.gen_range(-5.0..5.0)).collect())
        .collect();
    let features: Vec<Desc> = (0..4000)
        .map(|i| {
            centers[i % centers.len()]
                .iter()
                .map(|c| *c + rng.gen_range(-0.5f32..0.5))
                .collect()
        })
        .collect();

    // Create vocabulary from features
    let mut builder = VocabularyBuilder::new();
    builder.add_descriptors(&features).unwrap();
    let settings = VocabularySettings {
        size: 8,
        seed: Some(7),
        ..Default::default()
    };
    let voc = builder.compute(&settings).unwrap();
    println!("\nVocabulary = {:#?}", voc);

    // Save vocab and load it again just for fun
    std::fs::create_dir_all("vocabs").unwrap();
    voc.save("vocabs/test.voc").unwrap();
    let loaded_voc = Vocabulary::load("vocabs/test.voc").unwrap();

    // Make sure save & load worked
    assert_eq!(voc, loaded_voc);
}
