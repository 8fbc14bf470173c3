use rand::{distributions::WeightedIndex, prelude::*, rngs::StdRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::*;

/// Options used when clustering descriptors into a vocabulary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VocabularySettings {
    /// Number of words (clusters). When clustering, the requested count; a
    /// computed vocabulary records the count it actually holds.
    pub size: usize,
    /// Upper bound on Lloyd iterations per attempt.
    pub max_iterations: usize,
    /// Stop once no centroid moves further than this.
    pub epsilon: f32,
    /// Number of independently seeded runs; the most compact one wins.
    pub attempts: usize,
    /// Fixed seed for reproducible clustering. Entropy-seeded when `None`.
    pub seed: Option<u64>,
}

impl Default for VocabularySettings {
    fn default() -> Self {
        Self {
            size: 500,
            max_iterations: 10_000,
            epsilon: 1e-4,
            attempts: 5,
            seed: None,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Visual vocabulary: an ordered set of `K` centroid descriptors ("visual words").
/// Can be:
/// 1. Created from externally computed centroids, or clustered by a [`VocabularyBuilder`].
/// 2. Saved to a file & loaded from a file (requires bincode feature, enabled by default).
/// 3. Shared read-only by any number of encoders, see [`crate::BagOfFeatures`].
pub struct Vocabulary {
    centroids: Vec<Desc>,
    dim: usize,
    settings: VocabularySettings,
}

/// Vocabulary API
impl Vocabulary {
    /// Wrap an externally computed centroid matrix (one row per word).
    ///
    /// Fails with `EmptyVocabulary` for zero rows and `DimensionMismatch` when
    /// the rows do not share one width.
    pub fn from_centroids(centroids: Vec<Desc>) -> ClassResult<Self> {
        let settings = VocabularySettings {
            size: centroids.len(),
            ..Default::default()
        };
        Self::with_settings(centroids, settings)
    }

    fn with_settings(centroids: Vec<Desc>, settings: VocabularySettings) -> ClassResult<Self> {
        let dim = match centroids.first() {
            Some(c) => c.len(),
            None => return Err(ClassErr::EmptyVocabulary),
        };
        for c in centroids.iter() {
            check_dim(dim, c.len())?;
        }
        Ok(Self {
            centroids,
            dim,
            settings,
        })
    }

    /// Number of words `K`.
    pub fn size(&self) -> usize {
        self.centroids.len()
    }

    /// Width of every centroid, and so of every descriptor encoded against it.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn centroids(&self) -> &[Desc] {
        &self.centroids
    }

    /// Settings the vocabulary was produced with.
    pub fn settings(&self) -> &VocabularySettings {
        &self.settings
    }

    /// Index and squared distance of the centroid closest to `feature`.
    /// Ties go to the first centroid in order.
    pub fn nearest(&self, feature: &[f32]) -> (usize, f32) {
        nearest_centroid(&self.centroids, feature)
    }

    /// Fail with `EmptyVocabulary` for a vocabulary without words. Deserialized
    /// values bypass `from_centroids`, so consumers re-check on use.
    pub(crate) fn ensure_words(&self) -> ClassResult<()> {
        if self.centroids.is_empty() {
            Err(ClassErr::EmptyVocabulary)
        } else {
            Ok(())
        }
    }

    /// Load a vocabulary from a file
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> ClassResult<Self> {
        let stored: Self = crate::persist::load(file)?;
        Self::with_settings(stored.centroids, stored.settings)
    }

    /// Save vocabulary to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> ClassResult<()> {
        crate::persist::save(self, file)
    }
}

/// Collects descriptors from many images, then clusters them into a [`Vocabulary`].
#[derive(Debug, Default, Clone)]
pub struct VocabularyBuilder {
    descriptors: Vec<Desc>,
}

impl VocabularyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add descriptors used to compute the cluster centers. All rows must share
    /// the width of the first descriptor ever added.
    pub fn add_descriptors(&mut self, descriptors: &[Desc]) -> ClassResult<()> {
        let dim = self
            .descriptors
            .first()
            .or_else(|| descriptors.first())
            .map(|d| d.len())
            .unwrap_or(0);
        for d in descriptors {
            check_dim(dim, d.len())?;
        }
        self.descriptors.extend_from_slice(descriptors);
        Ok(())
    }

    /// Number of descriptors collected so far.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Compute the visual vocabulary with k-means (k-means++ seeding).
    pub fn compute(&self, settings: &VocabularySettings) -> ClassResult<Vocabulary> {
        if settings.size == 0 {
            return Err(ClassErr::InvalidSettings("vocabulary size must be at least 1"));
        }
        if self.descriptors.is_empty() {
            return Err(ClassErr::EmptyVocabulary);
        }

        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut best: Option<(f32, Vec<Desc>)> = None;
        for attempt in 0..settings.attempts.max(1) {
            let (compactness, centroids) = self.kmeans(settings, &mut rng);
            debug!(
                attempt,
                compactness,
                words = centroids.len(),
                "KMeans attempt finished"
            );
            if best.as_ref().map_or(true, |(c, _)| compactness < *c) {
                best = Some((compactness, centroids));
            }
        }
        let (compactness, centroids) = best.ok_or(ClassErr::EmptyVocabulary)?;
        info!(
            features = self.descriptors.len(),
            requested = settings.size,
            words = centroids.len(),
            compactness,
            "Visual vocabulary computed"
        );
        let settings = VocabularySettings {
            size: centroids.len(),
            ..settings.clone()
        };
        Vocabulary::with_settings(centroids, settings)
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl VocabularyBuilder {
    /// One k-means run. Returns (compactness, centroids).
    fn kmeans(&self, settings: &VocabularySettings, rng: &mut StdRng) -> (f32, Vec<Desc>) {
        let features = &self.descriptors;
        let mut clusters = Self::initialize_clusters(features, settings.size, rng);

        for _ in 0..settings.max_iterations {
            let groups = Self::assign(features, &clusters);

            // update clusters, keeping the old center of an emptied cluster
            let new_clusters: Vec<Desc> = groups
                .iter()
                .zip(clusters.iter())
                .map(|(group, old)| match Self::desc_mean(features, group) {
                    Some(mean) => mean,
                    None => old.clone(),
                })
                .collect();

            let shift = clusters
                .iter()
                .zip(new_clusters.iter())
                .map(|(a, b)| a.l2(b).sqrt())
                .fold(0., f32::max);
            clusters = new_clusters;

            if shift <= settings.epsilon {
                break; // converged
            }
        }

        let compactness = features
            .iter()
            .map(|f| nearest_centroid(&clusters, f).1)
            .sum::<f32>();
        (compactness, clusters)
    }

    /// Group feature indices by their nearest cluster.
    fn assign(features: &[Desc], clusters: &[Desc]) -> Vec<Vec<usize>> {
        let nearest: Vec<usize> = features
            .par_iter()
            .map(|f| nearest_centroid(clusters, f).0)
            .collect();
        let mut groups = vec![Vec::new(); clusters.len()];
        for (i, c) in nearest.into_iter().enumerate() {
            groups[c].push(i);
        }
        groups
    }

    /// k-means++ initialization. Stops early when every remaining feature
    /// coincides with an already chosen center.
    fn initialize_clusters(features: &[Desc], k: usize, rng: &mut StdRng) -> Vec<Desc> {
        let mut clusters: Vec<Desc> = Vec::with_capacity(k);
        clusters.push(features[rng.gen_range(0..features.len())].clone());

        let mut dists: Vec<f32> = features.iter().map(|f| f.l2(&clusters[0])).collect();
        while clusters.len() < k {
            let next = match WeightedIndex::new(&dists) {
                Ok(w) => w.sample(rng),
                Err(_) => break, // all remaining weights are zero
            };
            clusters.push(features[next].clone());
            let newest = &clusters[clusters.len() - 1];
            for (d, f) in dists.iter_mut().zip(features) {
                *d = d.min(f.l2(newest));
            }
        }
        clusters
    }

    #[inline]
    /// Compute the mean of the features listed in `group`.
    fn desc_mean(features: &[Desc], group: &[usize]) -> Option<Desc> {
        let first = features.get(*group.first()?)?;
        let mut mean = vec![0.; first.len()];
        for &i in group {
            for (m, v) in mean.iter_mut().zip(&features[i]) {
                *m += v;
            }
        }
        let inv = 1. / group.len() as f32;
        mean.iter_mut().for_each(|m| *m *= inv);
        Some(mean)
    }
}

/// Index and squared euclidean distance of the closest centroid,
/// first minimum found in centroid order.
#[inline]
pub(crate) fn nearest_centroid(centroids: &[Desc], feature: &[f32]) -> (usize, f32) {
    let mut best: (usize, f32) = (0, f32::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = feature.l2(c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

impl fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vocabulary")
            .field("Words", &self.centroids.len())
            .field("Descriptor Width", &self.dim)
            .field("Requested Size", &self.settings.size)
            .field("Seed", &self.settings.seed)
            .finish()
    }
}
