use thiserror::Error;

/// Visual vocabulary (codebook) and a k-means builder for it.
pub mod vocab;
pub use vocab::{Vocabulary, VocabularyBuilder, VocabularySettings};

/// Bag-of-features encoding of descriptor sets against a vocabulary.
pub mod bof;
pub use bof::{encode, BagOfFeatures, EncodingSettings, ImageExtent, KeyPoint};

/// Classifier capability and the k-nearest-neighbor implementation.
pub mod classifier;
pub use classifier::{Classifier, ClassifierSettings, KNearest};

/// Incremental accumulation of labeled training samples.
pub mod training;
pub use training::TrainingSet;

/// k-fold cross-validation over an accumulated training set.
pub mod cross_validate;
pub use cross_validate::{cross_validate, cross_validate_report, CrossValidation, FoldScore};

/// Caller-owned mapping from class names to numeric labels.
pub mod labels;
pub use labels::LabelMap;

#[cfg(feature = "bincode")]
mod persist;

/// A local image descriptor: one fixed-width real-valued row per detected feature.
///
/// All descriptors handed to one vocabulary must share its centroid width.
pub type Desc = Vec<f32>;

/// Bag-of-Words representation of an image or descriptor set.
///
/// Index: word id in the vocabulary (repeated once per spatial pyramid cell).
///
/// Value: total weight of that word in provided features.
pub type BoW = Vec<f32>;

/// Numeric class identifier attached to a training sample.
pub type Label = u32;

/// Provides the distance used between bow vectors and descriptors.
pub trait BoWTrait {
    /// Squared euclidean distance. Callers check that both sides share one width.
    fn l2(&self, other: &Self) -> f32;
}

impl BoWTrait for [f32] {
    fn l2(&self, other: &Self) -> f32 {
        self.iter().zip(other).fold(0., |a, (b, c)| {
            let d = b - c;
            a + d * d
        })
    }
}

pub type ClassResult<T> = std::result::Result<T, ClassErr>;

#[derive(Error, Debug)]
pub enum ClassErr {
    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Classifier has not been trained")]
    NotTrained,
    #[error("Invalid fold count {folds} for {samples} samples")]
    InvalidFoldCount { folds: usize, samples: usize },
    #[error("Vocabulary has no centroids")]
    EmptyVocabulary,
    #[error("Training sample {row} holds a non-finite value")]
    NonFiniteSample { row: usize },
    #[error("Invalid settings: {0}")]
    InvalidSettings(&'static str),
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Serialization Error")]
    Bincode(#[from] bincode::Error),
}

/// Fail with `DimensionMismatch` unless `found == expected`.
#[inline]
pub(crate) fn check_dim(expected: usize, found: usize) -> ClassResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(ClassErr::DimensionMismatch { expected, found })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_is_squared_distance() {
        let a: BoW = vec![0., 0.];
        let b: BoW = vec![3., 4.];
        assert!((a.l2(&b) - 25.).abs() < 1e-6);
    }
}
