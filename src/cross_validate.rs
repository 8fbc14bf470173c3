use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::*;

/// Held-out results of one fold.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldScore {
    pub correct: usize,
    pub total: usize,
}

/// Outcome of a k-fold cross-validation run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrossValidation {
    /// One entry per fold, in fold order.
    pub folds: Vec<FoldScore>,
    /// Correct predictions over all samples, in `[0, 1]`.
    pub accuracy: f32,
}

/// Fold of every sample: sample `i` goes to fold `i % num_folds`.
///
/// This is deterministic, not shuffled: block-ordered input yields folds that
/// mirror that order.
pub fn fold_assignment(len: usize, num_folds: usize) -> Vec<usize> {
    (0..len).map(|i| i % num_folds).collect()
}

/// Split `set` into (training, held out) for `fold`.
pub fn split_fold(set: &TrainingSet, fold: usize, num_folds: usize) -> (TrainingSet, TrainingSet) {
    let mut train = TrainingSet::new();
    let mut held_out = TrainingSet::new();
    for (i, (bow, label)) in set.iter().enumerate() {
        match i % num_folds == fold {
            true => held_out.push(bow.clone(), label),
            false => train.push(bow.clone(), label),
        }
    }
    (train, held_out)
}

/// Mean k-NN accuracy over `num_folds` held-out folds.
pub fn cross_validate(
    set: &TrainingSet,
    num_folds: usize,
    settings: &ClassifierSettings,
) -> ClassResult<f32> {
    cross_validate_report(set, num_folds, settings).map(|cv| cv.accuracy)
}

/// k-NN cross-validation with per-fold scores.
pub fn cross_validate_report(
    set: &TrainingSet,
    num_folds: usize,
    settings: &ClassifierSettings,
) -> ClassResult<CrossValidation> {
    settings.validate()?;
    cross_validate_with(set, num_folds, || KNearest::new(settings.clone()))
}

/// Cross-validate any classifier backend. `make` builds one fresh, untrained
/// classifier per fold; folds run in parallel.
///
/// Fails with `InvalidFoldCount` unless `2 <= num_folds <= set.len()`, before
/// any training.
pub fn cross_validate_with<C, F>(
    set: &TrainingSet,
    num_folds: usize,
    make: F,
) -> ClassResult<CrossValidation>
where
    C: Classifier,
    F: Fn() -> ClassResult<C> + Sync,
{
    if num_folds < 2 || num_folds > set.len() {
        return Err(ClassErr::InvalidFoldCount {
            folds: num_folds,
            samples: set.len(),
        });
    }

    let folds = (0..num_folds)
        .into_par_iter()
        .map(|fold| -> ClassResult<FoldScore> {
            let (train, held_out) = split_fold(set, fold, num_folds);
            let mut cls = make()?;
            train.train(&mut cls)?;

            let predicted = cls.classify_batch(held_out.samples())?;
            let correct = predicted
                .iter()
                .zip(held_out.responses())
                .filter(|(p, r)| p == r)
                .count();
            debug!(
                fold,
                train = train.len(),
                held_out = held_out.len(),
                correct,
                "Fold evaluated"
            );
            Ok(FoldScore {
                correct,
                total: held_out.len(),
            })
        })
        .collect::<ClassResult<Vec<_>>>()?;

    let correct: usize = folds.iter().map(|f| f.correct).sum();
    let accuracy = correct as f32 / set.len() as f32;
    info!(num_folds, samples = set.len(), accuracy, "Cross-validation finished");
    Ok(CrossValidation { folds, accuracy })
}
