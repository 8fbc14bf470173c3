use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::*;

/// Labeled bag of features histograms, accumulated one image at a time.
///
/// Rows are kept in insertion order; cross-validation assigns folds by row index.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TrainingSet {
    samples: Vec<BoW>,
    responses: Vec<Label>,
}

impl TrainingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a histogram and its label. Every histogram must have the width
    /// of the first one added.
    pub fn add_sample(&mut self, bow: BoW, label: Label) -> ClassResult<()> {
        if let Some(width) = self.width() {
            check_dim(width, bow.len())?;
        }
        self.push(bow, label);
        Ok(())
    }

    pub fn samples(&self) -> &[BoW] {
        &self.samples
    }

    /// Labels, aligned with [`Self::samples`].
    pub fn responses(&self) -> &[Label] {
        &self.responses
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Histogram width, once a sample has been added.
    pub fn width(&self) -> Option<usize> {
        self.samples.first().map(|s| s.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BoW, Label)> {
        self.samples.iter().zip(self.responses.iter().copied())
    }

    /// Train `classifier` on every accumulated sample. The set is left as is,
    /// so it can train any number of classifiers.
    pub fn train<C: Classifier>(&self, classifier: &mut C) -> ClassResult<()> {
        classifier.train(&self.samples, &self.responses)
    }

    /// Build a k-nearest-neighbor classifier trained on every accumulated sample.
    pub fn create_classifier(&self, settings: &ClassifierSettings) -> ClassResult<KNearest> {
        let mut cls = KNearest::new(settings.clone())?;
        self.train(&mut cls)?;
        debug!(samples = self.len(), "Created classifier from training set");
        Ok(cls)
    }

    /// Rows already share one width.
    pub(crate) fn push(&mut self, bow: BoW, label: Label) {
        self.samples.push(bow);
        self.responses.push(label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sample_keeps_order() {
        let mut set = TrainingSet::new();
        set.add_sample(vec![1., 0.], 3).unwrap();
        set.add_sample(vec![0., 1.], 1).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.width(), Some(2));
        assert_eq!(set.responses(), &[3, 1]);
        assert_eq!(set.samples()[1], vec![0., 1.]);
    }

    #[test]
    fn width_change_rejected() {
        let mut set = TrainingSet::new();
        set.add_sample(vec![1., 0.], 0).unwrap();
        assert!(matches!(
            set.add_sample(vec![1., 0., 0.], 0),
            Err(ClassErr::DimensionMismatch {
                expected: 2,
                found: 3
            })
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn classifier_does_not_consume_set() {
        let mut set = TrainingSet::new();
        set.add_sample(vec![0.], 0).unwrap();
        set.add_sample(vec![1.], 1).unwrap();

        let one = set
            .create_classifier(&ClassifierSettings { neighbors: 1 })
            .unwrap();
        let two = set
            .create_classifier(&ClassifierSettings { neighbors: 2 })
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(one.classify(&[0.9]).unwrap(), 1);
        assert_eq!(two.samples(), set.samples());
    }

    #[test]
    fn empty_set_builds_untrained_classifier() {
        let set = TrainingSet::new();
        let cls = set.create_classifier(&Default::default()).unwrap();
        assert!(!cls.is_trained());
    }
}
