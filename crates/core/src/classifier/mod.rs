//! Sequence classifiers over padded, standardised embedding tensors.
//!
//! The pipeline only relies on the [`Classifier`] contract:
//! `fit` on labelled tensors, `predict` class probabilities, `evaluate`
//! loss/accuracy. [`LstmClassifier`] is the recurrent implementation.

mod lstm;
mod metrics;

use crate::normalize::PaddedTensor;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

pub use lstm::LstmClassifier;
pub use metrics::{ConfusionMatrix, Evaluation};

pub const DEFAULT_LEARNING_RATE: f64 = 0.001;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_MAX_EPOCHS: usize = 100;
pub const DEFAULT_EARLY_STOPPING_PATIENCE: usize = 10;
pub const DEFAULT_LR_PLATEAU_PATIENCE: usize = 5;
pub const DEFAULT_LR_FACTOR: f64 = 0.2;
pub const DEFAULT_MIN_LEARNING_RATE: f64 = 1e-4;

#[derive(thiserror::Error, Debug)]
pub enum ClassifierError {
    #[error("tensor backend error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("classifier has not been trained")]
    NotFitted,

    #[error("{samples} samples but {labels} labels")]
    LabelCount { samples: usize, labels: usize },

    #[error("label {label} out of range for {classes} classes")]
    LabelOutOfRange { label: u32, classes: usize },

    #[error("need at least one class")]
    NoClasses,

    #[error("cannot train on an empty set")]
    EmptyTrainingSet,

    #[error("input shape mismatch: {0}")]
    Shape(String),

    #[error("invalid classifier config: {0}")]
    Config(String),

    #[error("weight store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, ClassifierError>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    /// Units of the sequence-returning recurrent layer.
    pub first_units: usize,
    /// Units of the final-state recurrent layer.
    pub second_units: usize,
    pub dense_units: usize,
    pub dropout: f32,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    pub early_stopping_patience: usize,
    pub lr_plateau_patience: usize,
    pub lr_factor: f64,
    pub min_learning_rate: f64,
    /// Seeds weight initialisation and batch shuffling. Dropout masks come
    /// from the backend generator, so runs with dropout are not repeatable.
    pub seed: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            first_units: 64,
            second_units: 32,
            dense_units: 32,
            dropout: 0.5,
            learning_rate: DEFAULT_LEARNING_RATE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_epochs: DEFAULT_MAX_EPOCHS,
            early_stopping_patience: DEFAULT_EARLY_STOPPING_PATIENCE,
            lr_plateau_patience: DEFAULT_LR_PLATEAU_PATIENCE,
            lr_factor: DEFAULT_LR_FACTOR,
            min_learning_rate: DEFAULT_MIN_LEARNING_RATE,
            seed: 42,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.first_units == 0 || self.second_units == 0 || self.dense_units == 0 {
            return Err(ClassifierError::Config("layer sizes must be > 0".to_owned()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ClassifierError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.learning_rate <= 0.0 || self.min_learning_rate <= 0.0 {
            return Err(ClassifierError::Config(
                "learning rates must be > 0".to_owned(),
            ));
        }
        if self.batch_size == 0 || self.max_epochs == 0 {
            return Err(ClassifierError::Config(
                "batch size and epoch ceiling must be > 0".to_owned(),
            ));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(ClassifierError::Config(format!(
                "lr factor must be in (0, 1), got {}",
                self.lr_factor
            )));
        }
        Ok(())
    }
}

/// Inputs paired with their class indices.
#[derive(Clone, Copy, Debug)]
pub struct LabeledSet<'a> {
    pub inputs: &'a PaddedTensor,
    pub labels: &'a [u32],
}

impl<'a> LabeledSet<'a> {
    pub fn new(inputs: &'a PaddedTensor, labels: &'a [u32]) -> Self {
        Self { inputs, labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn check(&self, num_classes: usize) -> Result<()> {
        if self.inputs.num_samples() != self.labels.len() {
            return Err(ClassifierError::LabelCount {
                samples: self.inputs.num_samples(),
                labels: self.labels.len(),
            });
        }
        if let Some(&label) = self.labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(ClassifierError::LabelOutOfRange {
                label,
                classes: num_classes,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub learning_rate: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingReport {
    pub epochs: Vec<EpochStats>,
    /// 1-based epoch whose weights were kept.
    pub best_epoch: usize,
    pub best_monitored_loss: f32,
    pub stopped_early: bool,
}

pub trait Classifier {
    /// Train on `train`, monitoring `validation` (or the training loss when
    /// absent) for early stopping and learning-rate decay.
    fn fit(
        &mut self,
        train: LabeledSet<'_>,
        validation: Option<LabeledSet<'_>>,
        num_classes: usize,
    ) -> Result<TrainingReport>;

    /// Class probabilities, one row per sample.
    fn predict(&self, inputs: &PaddedTensor) -> Result<Array2<f32>>;

    fn evaluate(&self, data: LabeledSet<'_>) -> Result<Evaluation> {
        let probabilities = self.predict(data.inputs)?;
        data.check(probabilities.ncols())?;
        Evaluation::from_probabilities(probabilities.view(), data.labels)
    }
}

/// Index of the largest value; ties resolve to the first.
pub fn argmax(row: ArrayView1<'_, f32>) -> Option<(usize, f32)> {
    row.iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        })
}
