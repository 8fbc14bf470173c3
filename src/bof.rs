use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::*;

/// Descriptors encoded per parallel task. Fixed so the summation order is too.
const ENCODE_CHUNK: usize = 256;

/// Deepest spatial pyramid accepted; one histogram then holds 21845 copies of the vocabulary.
pub const MAX_PYRAMID_DEPTH: u32 = 8;

/// Options for the bag of features. These settings change how a feature
/// vector is computed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EncodingSettings {
    /// Expected squared distance between a descriptor and its visual word.
    /// Controls the falloff of the gaussian used for soft assignment.
    pub kernel_distance_squared: f32,
    /// Spread each descriptor's vote over all words instead of the nearest one.
    pub soft_kernel: bool,
    /// Number of spatial pyramid levels. `0` is treated as `1` (base level only).
    pub spatial_pyramid_depth: u32,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            kernel_distance_squared: 0.25,
            soft_kernel: false,
            spatial_pyramid_depth: 1,
        }
    }
}

impl EncodingSettings {
    /// Number of levels actually laid out in the histogram.
    pub fn pyramid_levels(&self) -> u32 {
        self.spatial_pyramid_depth.max(1)
    }

    /// Number of spatial cells across all levels.
    pub fn pyramid_size(&self) -> usize {
        pyramid_size(self.pyramid_levels())
    }

    /// Weight of a pyramid level; level 0 shares the weight of level 1.
    pub fn pyramid_weight(&self, level: u32) -> f32 {
        let level = level.max(1);
        let depth = self.pyramid_levels();
        1. / (1u64 << (depth + 1).saturating_sub(level)) as f32
    }

    pub fn validate(&self) -> ClassResult<()> {
        if !(self.kernel_distance_squared > 0.) || !self.kernel_distance_squared.is_finite() {
            return Err(ClassErr::InvalidSettings(
                "kernel_distance_squared must be positive and finite",
            ));
        }
        if self.spatial_pyramid_depth > MAX_PYRAMID_DEPTH {
            return Err(ClassErr::InvalidSettings("spatial_pyramid_depth is too large"));
        }
        Ok(())
    }

    /// Load encoding settings from a file
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> ClassResult<Self> {
        let settings: Self = crate::persist::load(file)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save encoding settings to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> ClassResult<()> {
        crate::persist::save(self, file)
    }
}

/// Cells in a pyramid of `depth` levels: 1 + 4 + 16 + ... = (4^depth - 1) / 3.
#[inline]
pub fn pyramid_size(depth: u32) -> usize {
    ((1usize << (2 * depth)) - 1) / 3
}

/// Image position of the keypoint a descriptor was extracted at.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
}

/// Size of the image keypoints were detected in, used to lay out pyramid cells.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ImageExtent {
    pub width: f32,
    pub height: f32,
}

impl ImageExtent {
    /// Row-major index of the cell holding `kp` in a `cells x cells` grid.
    /// Points on or past the border land in the nearest edge cell.
    fn cell(&self, kp: &KeyPoint, cells: usize) -> usize {
        let bin = |v: f32, extent: f32| {
            // float to int casts saturate, NaN becomes 0
            (((v / extent) * cells as f32).floor() as usize).min(cells - 1)
        };
        bin(kp.y, self.height) * cells + bin(kp.x, self.width)
    }
}

/// Computes bag of features histograms for descriptor sets against a shared vocabulary.
///
/// The histogram holds one `K`-length block per spatial pyramid cell: the base
/// level first, then the 4 cells of level 1 in row-major order, and so on.
#[derive(Debug, Clone)]
pub struct BagOfFeatures<'v> {
    vocabulary: &'v Vocabulary,
    settings: EncodingSettings,
}

impl<'v> BagOfFeatures<'v> {
    pub fn new(vocabulary: &'v Vocabulary, settings: EncodingSettings) -> ClassResult<Self> {
        vocabulary.ensure_words()?;
        settings.validate()?;
        debug!(
            words = vocabulary.size(),
            soft = settings.soft_kernel,
            levels = settings.pyramid_levels(),
            "Bag of features encoder ready"
        );
        Ok(Self {
            vocabulary,
            settings,
        })
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        self.vocabulary
    }

    pub fn settings(&self) -> &EncodingSettings {
        &self.settings
    }

    /// Length of every histogram this encoder produces.
    pub fn len(&self) -> usize {
        self.vocabulary.size() * self.settings.pyramid_size()
    }

    /// Weight of one descriptor for every word: soft or hard depending on the settings.
    /// The weights are in `[0, 1]` and sum to 1.
    pub fn assign(&self, feature: &[f32]) -> ClassResult<Vec<f32>> {
        check_dim(self.vocabulary.dim(), feature.len())?;
        Ok(self.weights(feature))
    }

    /// Computes the feature vector for a set of descriptors, without spatial binning.
    ///
    /// Only the base level is filled; the buffer is still sized for the whole
    /// pyramid. The result is l1 normalized, or all zero for no descriptors.
    pub fn feature_vector(&self, features: &[Desc]) -> ClassResult<BoW> {
        self.check_features(features)?;
        let k = self.vocabulary.size();

        let mut bow = sum_partials(
            k,
            features
                .par_chunks(ENCODE_CHUNK)
                .map(|chunk| {
                    let mut acc = vec![0.; k];
                    for f in chunk {
                        add_scaled(&mut acc, &self.weights(f), 1.);
                    }
                    acc
                })
                .collect(),
        );
        bow.resize(self.len(), 0.);

        normalize(&mut bow, k);
        trace!(features = features.len(), "Encoded feature vector");
        Ok(bow)
    }

    /// Computes the spatial pyramid feature vector for a set of descriptors.
    ///
    /// `keypoints[i]` is where `features[i]` was extracted in an image of size
    /// `extent`. Every level is weighted by [`EncodingSettings::pyramid_weight`]
    /// and the whole histogram is scaled so the base level sums to 1.
    pub fn spatial_feature_vector(
        &self,
        features: &[Desc],
        keypoints: &[KeyPoint],
        extent: ImageExtent,
    ) -> ClassResult<BoW> {
        self.check_features(features)?;
        check_dim(features.len(), keypoints.len())?;
        if !(extent.width > 0. && extent.height > 0.) {
            return Err(ClassErr::InvalidSettings("image extent must be positive"));
        }
        let k = self.vocabulary.size();
        let len = self.len();
        let levels = self.settings.pyramid_levels();
        let level_weights: Vec<f32> = (0..levels)
            .map(|l| self.settings.pyramid_weight(l))
            .collect();

        let mut bow = sum_partials(
            len,
            features
                .par_chunks(ENCODE_CHUNK)
                .zip(keypoints.par_chunks(ENCODE_CHUNK))
                .map(|(chunk, kps)| {
                    let mut acc = vec![0.; len];
                    for (f, kp) in chunk.iter().zip(kps) {
                        let w = self.weights(f);
                        for (level, &scale) in level_weights.iter().enumerate() {
                            let cells = 1usize << level;
                            let cell = pyramid_size(level as u32) + extent.cell(kp, cells);
                            add_scaled(&mut acc[cell * k..(cell + 1) * k], &w, scale);
                        }
                    }
                    acc
                })
                .collect(),
        );

        normalize(&mut bow, k);
        trace!(
            features = features.len(),
            levels,
            "Encoded spatial feature vector"
        );
        Ok(bow)
    }
}

/// Encode `features` against `vocabulary` into an l1 normalized base-level histogram.
pub fn encode(
    features: &[Desc],
    vocabulary: &Vocabulary,
    settings: &EncodingSettings,
) -> ClassResult<BoW> {
    BagOfFeatures::new(vocabulary, settings.clone())?.feature_vector(features)
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl<'v> BagOfFeatures<'v> {
    fn check_features(&self, features: &[Desc]) -> ClassResult<()> {
        let dim = self.vocabulary.dim();
        features.iter().try_for_each(|f| check_dim(dim, f.len()))
    }

    fn weights(&self, feature: &[f32]) -> Vec<f32> {
        match self.settings.soft_kernel {
            true => self.soft_assign(feature),
            false => self.hard_assign(feature),
        }
    }

    /// Gaussian kernel over the distance to every word, l1 normalized.
    ///
    /// Distances are shifted by the smallest one before exponentiation; the
    /// shift cancels in the normalization and keeps far descriptors from
    /// underflowing to an all-zero vote.
    fn soft_assign(&self, feature: &[f32]) -> Vec<f32> {
        let inv_sigma_squared = 1. / self.settings.kernel_distance_squared;
        let dists: Vec<f32> = self
            .vocabulary
            .centroids()
            .iter()
            .map(|c| feature.l2(c))
            .collect();
        let min = dists.iter().cloned().fold(f32::INFINITY, f32::min);

        let mut w: Vec<f32> = dists
            .iter()
            .map(|d| (-(d - min) * inv_sigma_squared).exp())
            .collect();
        let sum: f32 = w.iter().sum();
        if sum > 0. && sum.is_finite() {
            let inv_sum = 1. / sum;
            w.iter_mut().for_each(|x| *x *= inv_sum);
        } else {
            // non-finite descriptor values; fall back to the nearest word
            return self.hard_assign(feature);
        }
        w
    }

    /// One-hot vote for the nearest word.
    fn hard_assign(&self, feature: &[f32]) -> Vec<f32> {
        let mut w = vec![0.; self.vocabulary.size()];
        w[self.vocabulary.nearest(feature).0] = 1.;
        w
    }
}

#[inline]
fn add_scaled(acc: &mut [f32], w: &[f32], scale: f32) {
    for (a, b) in acc.iter_mut().zip(w) {
        *a += scale * b;
    }
}

/// Sum per-chunk histograms in chunk order, so the result does not depend on
/// how many threads produced them.
fn sum_partials(len: usize, partials: Vec<Vec<f32>>) -> Vec<f32> {
    let mut bow = vec![0.; len];
    for p in partials.iter() {
        add_scaled(&mut bow, p, 1.);
    }
    bow
}

/// Scale `bow` so its first `k` entries sum to 1. All-zero histograms are left alone.
fn normalize(bow: &mut [f32], k: usize) {
    let sum: f32 = bow[..k].iter().sum();
    if sum > 0. {
        let inv_sum = 1. / sum;
        for w in bow.iter_mut() {
            *w *= inv_sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voc() -> Vocabulary {
        Vocabulary::from_centroids(vec![vec![0., 0.], vec![10., 10.]]).unwrap()
    }

    fn soft(kernel_distance_squared: f32) -> EncodingSettings {
        EncodingSettings {
            kernel_distance_squared,
            soft_kernel: true,
            ..Default::default()
        }
    }

    #[test]
    fn pyramid_sizes() {
        assert_eq!(pyramid_size(0), 0);
        assert_eq!(pyramid_size(1), 1);
        assert_eq!(pyramid_size(2), 5);
        assert_eq!(pyramid_size(3), 21);
    }

    #[test]
    fn pyramid_weights() {
        let s = EncodingSettings {
            spatial_pyramid_depth: 3,
            ..Default::default()
        };
        assert_eq!(s.pyramid_weight(0), s.pyramid_weight(1));
        assert_eq!(s.pyramid_weight(1), 0.125);
        assert_eq!(s.pyramid_weight(2), 0.25);
    }

    #[test]
    fn hard_assignment_scenario() {
        let voc = voc();
        let bow = encode(&[vec![0., 1.], vec![9., 9.]], &voc, &Default::default()).unwrap();
        assert_eq!(bow, vec![0.5, 0.5]);
    }

    #[test]
    fn soft_assignment_scenario() {
        let voc = voc();
        let bof = BagOfFeatures::new(&voc, soft(1.)).unwrap();
        let w = bof.assign(&[0., 1.]).unwrap();
        assert!(w[0] > 0.99 && w[1] < 0.01);

        let bow = bof.feature_vector(&[vec![0., 1.], vec![9., 9.]]).unwrap();
        assert!((bow[0] - 0.5).abs() < 1e-3);
        assert!((bow[1] - 0.5).abs() < 1e-3);
        assert!((bow.iter().sum::<f32>() - 1.).abs() < 1e-6);
    }

    #[test]
    fn soft_assignment_spreads_equidistant_votes() {
        let voc = voc();
        let bof = BagOfFeatures::new(&voc, soft(100.)).unwrap();
        let w = bof.assign(&[5., 5.]).unwrap();
        assert!((w[0] - 0.5).abs() < 1e-6);
        assert!((w[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn soft_assignment_far_descriptor_does_not_vanish() {
        let voc = voc();
        let bof = BagOfFeatures::new(&voc, soft(0.01)).unwrap();
        let w = bof.assign(&[1000., 1000.]).unwrap();
        assert!((w.iter().sum::<f32>() - 1.).abs() < 1e-6);
        assert_eq!(w[1], 1.);
    }

    #[test]
    fn empty_descriptor_set_is_zero() {
        let voc = voc();
        let settings = EncodingSettings {
            spatial_pyramid_depth: 2,
            ..Default::default()
        };
        let bow = encode(&[], &voc, &settings).unwrap();
        assert_eq!(bow, vec![0.; 10]);
    }

    #[test]
    fn buffer_sized_for_pyramid_but_only_base_filled() {
        let voc = voc();
        let settings = EncodingSettings {
            spatial_pyramid_depth: 2,
            ..Default::default()
        };
        let bow = encode(&[vec![0., 0.], vec![0., 0.5]], &voc, &settings).unwrap();
        assert_eq!(bow.len(), 10);
        assert_eq!(&bow[..2], &[1., 0.]);
        assert!(bow[2..].iter().all(|&x| x == 0.));
    }

    #[test]
    fn dimension_mismatch() {
        let voc = voc();
        let res = encode(&[vec![0., 0., 0.]], &voc, &Default::default());
        assert!(matches!(
            res,
            Err(ClassErr::DimensionMismatch {
                expected: 2,
                found: 3
            })
        ));
    }

    #[test]
    fn invalid_kernel_distance() {
        let voc = voc();
        assert!(matches!(
            BagOfFeatures::new(&voc, soft(0.)),
            Err(ClassErr::InvalidSettings(_))
        ));
    }

    #[test]
    fn depth_zero_behaves_as_base_level() {
        let voc = voc();
        let settings = EncodingSettings {
            spatial_pyramid_depth: 0,
            ..Default::default()
        };
        let bow = encode(&[vec![10., 10.]], &voc, &settings).unwrap();
        assert_eq!(bow, vec![0., 1.]);
    }

    #[test]
    fn spatial_binning_routes_cells() {
        let voc = voc();
        let settings = EncodingSettings {
            spatial_pyramid_depth: 2,
            ..Default::default()
        };
        let bof = BagOfFeatures::new(&voc, settings).unwrap();
        let extent = ImageExtent {
            width: 100.,
            height: 100.,
        };
        let features = vec![vec![0., 0.], vec![10., 10.]];
        let keypoints = vec![KeyPoint { x: 10., y: 10. }, KeyPoint { x: 90., y: 60. }];
        let bow = bof
            .spatial_feature_vector(&features, &keypoints, extent)
            .unwrap();

        assert_eq!(bow.len(), 10);
        assert_eq!(&bow[..2], &[0.5, 0.5]);
        // level 1 shares the base weight: top-left gets word 0, bottom-right word 1
        assert_eq!(&bow[2..4], &[0.5, 0.]);
        assert_eq!(&bow[4..6], &[0., 0.]);
        assert_eq!(&bow[6..8], &[0., 0.]);
        assert_eq!(&bow[8..10], &[0., 0.5]);
    }

    #[test]
    fn spatial_binning_clamps_border_points() {
        let voc = voc();
        let settings = EncodingSettings {
            spatial_pyramid_depth: 3,
            ..Default::default()
        };
        let bof = BagOfFeatures::new(&voc, settings).unwrap();
        let extent = ImageExtent {
            width: 8.,
            height: 8.,
        };
        let bow = bof
            .spatial_feature_vector(
                &[vec![0., 0.]],
                &[KeyPoint { x: 8., y: -1. }],
                extent,
            )
            .unwrap();
        assert_eq!(bow.len(), 42);
        assert_eq!(bow[0], 1.);
        // level 2 top-right cell is cell 5 + 3
        assert_eq!(bow[(5 + 3) * 2], 2.);
    }

    #[test]
    fn soft_encoding_is_bitwise_reproducible_across_threads() {
        let centroids: Vec<Desc> = (0..64)
            .map(|i| (0..8).map(|j| ((i * 31 + j * 7) % 17) as f32 * 0.3).collect())
            .collect();
        let voc = Vocabulary::from_centroids(centroids).unwrap();
        let bof = BagOfFeatures::new(&voc, soft(0.5)).unwrap();
        let features: Vec<Desc> = (0..5000)
            .map(|i| (0..8).map(|j| ((i * 13 + j * 5) % 101) as f32 * 0.05).collect())
            .collect();
        let keypoints: Vec<KeyPoint> = (0..5000)
            .map(|i| KeyPoint {
                x: (i % 97) as f32,
                y: (i % 89) as f32,
            })
            .collect();
        let extent = ImageExtent {
            width: 100.,
            height: 100.,
        };
        let bits = |bow: BoW| bow.iter().map(|x| x.to_bits()).collect::<Vec<u32>>();

        let single = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(|| bits(bof.feature_vector(&features).unwrap()));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(8)
            .build()
            .unwrap();
        for _ in 0..10 {
            let multi = pool.install(|| bits(bof.feature_vector(&features).unwrap()));
            assert_eq!(multi, single);
        }

        let spatial = |threads: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| {
                    bits(
                        bof.spatial_feature_vector(&features, &keypoints, extent)
                            .unwrap(),
                    )
                })
        };
        let expected = spatial(1);
        for _ in 0..5 {
            assert_eq!(spatial(8), expected);
        }
    }

    #[test]
    fn spatial_requires_one_keypoint_per_feature() {
        let voc = voc();
        let bof = BagOfFeatures::new(&voc, Default::default()).unwrap();
        let extent = ImageExtent {
            width: 1.,
            height: 1.,
        };
        assert!(bof
            .spatial_feature_vector(&[vec![0., 0.]], &[], extent)
            .is_err());
    }
}
