use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use tracing::debug;

use crate::*;

/// Options for the k-nearest-neighbor classifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClassifierSettings {
    /// Number of neighbors `k` that vote on a label.
    pub neighbors: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self { neighbors: 5 }
    }
}

impl ClassifierSettings {
    pub fn validate(&self) -> ClassResult<()> {
        if self.neighbors == 0 {
            return Err(ClassErr::InvalidSettings("neighbors must be at least 1"));
        }
        Ok(())
    }
}

/// Capability shared by every classifier backend.
///
/// A classifier has a single writer: `train` takes `&mut self`, so callers
/// wanting to retrain one that is being queried from other threads must
/// synchronize externally. Once trained, any number of threads may `classify`.
pub trait Classifier: Send + Sync {
    /// (Re)build the classifier from row samples and their aligned labels.
    ///
    /// Empty input leaves the classifier untrained. A failed call leaves the
    /// previous state untouched.
    fn train(&mut self, samples: &[BoW], responses: &[Label]) -> ClassResult<()>;

    /// Predict the label of one query vector.
    fn classify(&self, query: &[f32]) -> ClassResult<Label>;

    /// Predict labels for many queries, output aligned with input. Fails with
    /// `NotTrained` before training even for an empty batch.
    fn classify_batch(&self, queries: &[BoW]) -> ClassResult<Vec<Label>> {
        if !self.is_trained() {
            return Err(ClassErr::NotTrained);
        }
        queries.par_iter().map(|q| self.classify(q)).collect()
    }

    fn is_trained(&self) -> bool;
}

/// Inline capacity of the neighbor and vote buffers; larger `k` spills to the heap.
const INLINE_NEIGHBORS: usize = 16;

/// k-nearest-neighbor classifier over euclidean distance in histogram space.
///
/// The trained index is an owned copy of the samples, never a view into the
/// set it was trained from. Ties are broken deterministically:
/// * neighbors at equal distance are ordered by training insertion order;
/// * labels with equal votes go to the one whose nearest member ranks first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KNearest {
    settings: ClassifierSettings,
    samples: Vec<BoW>,
    responses: Vec<Label>,
}

impl KNearest {
    pub fn new(settings: ClassifierSettings) -> ClassResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            samples: Vec::new(),
            responses: Vec::new(),
        })
    }

    pub fn settings(&self) -> &ClassifierSettings {
        &self.settings
    }

    /// Change `k`. The trained samples are kept.
    pub fn set_settings(&mut self, settings: ClassifierSettings) -> ClassResult<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    pub fn samples(&self) -> &[BoW] {
        &self.samples
    }

    pub fn responses(&self) -> &[Label] {
        &self.responses
    }

    /// Number of trained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Width of the trained samples, if any.
    pub fn width(&self) -> Option<usize> {
        self.samples.first().map(|s| s.len())
    }

    /// The `min(k, len)` training samples closest to `query`, nearest first,
    /// as (sample index, squared distance).
    pub fn find_nearest(&self, query: &[f32], k: usize) -> ClassResult<Vec<(usize, f32)>> {
        let width = self.width().ok_or(ClassErr::NotTrained)?;
        check_dim(width, query.len())?;
        Ok(self
            .neighbors(query, k)
            .into_iter()
            .map(|(d, i)| (i, d))
            .collect())
    }

    /// Load a trained classifier from a file. The loaded samples are
    /// validated exactly as `train` would.
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> ClassResult<Self> {
        let stored: Self = crate::persist::load(file)?;
        let mut cls = Self::new(stored.settings)?;
        cls.train(&stored.samples, &stored.responses)?;
        Ok(cls)
    }

    /// Save settings and trained samples to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> ClassResult<()> {
        crate::persist::save(self, file)
    }
}

impl Classifier for KNearest {
    fn train(&mut self, samples: &[BoW], responses: &[Label]) -> ClassResult<()> {
        check_dim(samples.len(), responses.len())?;
        if let Some(first) = samples.first() {
            let width = first.len();
            samples.iter().try_for_each(|s| check_dim(width, s.len()))?;
        }
        if let Some(row) = samples
            .iter()
            .position(|s| s.iter().any(|x| !x.is_finite()))
        {
            return Err(ClassErr::NonFiniteSample { row });
        }

        self.samples = samples.to_vec();
        self.responses = responses.to_vec();
        debug!(
            samples = self.samples.len(),
            width = self.width().unwrap_or(0),
            neighbors = self.settings.neighbors,
            "Trained k-nearest-neighbor classifier"
        );
        Ok(())
    }

    fn classify(&self, query: &[f32]) -> ClassResult<Label> {
        let width = self.width().ok_or(ClassErr::NotTrained)?;
        check_dim(width, query.len())?;

        let neighbors = self.neighbors(query, self.settings.neighbors);

        // (label, votes) in order of each label's nearest member
        let mut votes: SmallVec<[(Label, usize); INLINE_NEIGHBORS]> = SmallVec::new();
        for &(_, i) in neighbors.iter() {
            let label = self.responses[i];
            match votes.iter_mut().find(|(l, _)| *l == label) {
                Some((_, v)) => *v += 1,
                None => votes.push((label, 1)),
            }
        }

        let mut best = votes.first().copied().ok_or(ClassErr::NotTrained)?;
        for &(label, v) in votes.iter().skip(1) {
            if v > best.1 {
                best = (label, v);
            }
        }
        Ok(best.0)
    }

    fn is_trained(&self) -> bool {
        !self.samples.is_empty()
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl KNearest {
    /// (squared distance, sample index) of the `k` nearest samples, sorted.
    /// `k` is clamped to `[1, len]`.
    fn neighbors(&self, query: &[f32], k: usize) -> SmallVec<[(f32, usize); INLINE_NEIGHBORS]> {
        let k = k.max(1).min(self.samples.len());
        let mut best: SmallVec<[(f32, usize); INLINE_NEIGHBORS]> = SmallVec::with_capacity(k);
        for (i, s) in self.samples.iter().enumerate() {
            let d = query.l2(s);
            if best.len() == k {
                match best.last() {
                    Some(&(worst, _)) if d.total_cmp(&worst) == Ordering::Less => {
                        best.pop();
                    }
                    _ => continue,
                }
            }
            // total order; equal distances keep insertion order
            let at = best
                .iter()
                .position(|&(bd, _)| d.total_cmp(&bd) == Ordering::Less)
                .unwrap_or(best.len());
            best.insert(at, (d, i));
        }
        best
    }
}
