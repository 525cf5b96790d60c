//! Training orchestration and single-file inference.
//!
//! [`TrainingPipeline::run`] walks the corpus, fits the normalizer and label
//! codec, splits, trains and evaluates. It hands back a [`FittedPipeline`]
//! that owns every piece of fitted state, so inference always reuses exactly
//! what training produced.

use crate::{
    audio::{AudioLoader, LoadError, Waveform},
    augment::{AugmentConfig, AugmentError, Augmenter},
    classifier::{argmax, Classifier, ClassifierError, Evaluation, LabeledSet, TrainingReport},
    config::{AppConfig, SplitConfig},
    dataset::{train_test_split, BuildReport, DatasetBuilder, DatasetError},
    embedding::{EmbedError, EmbeddingModel},
    labels::{emotion_name, LabelCodec, LabelError},
    normalize::{NormalizeError, ScalerState, SequenceNormalizer},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const LOG_TARGET: &str = "speech_emotion::pipeline";

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Augment(#[from] AugmentError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: Box<PipelineError>,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub augment: AugmentConfig,
    pub split: SplitConfig,
}

impl PipelineConfig {
    pub fn from_app(app: &AppConfig) -> Self {
        Self {
            augment: app.augment.clone(),
            split: app.split.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainingSummary {
    pub build: BuildReport,
    pub max_len: usize,
    pub classes: Vec<String>,
    pub train_rows: usize,
    pub test_rows: usize,
    pub training: TrainingReport,
    /// Absent when the corpus is too small to hold out a test row.
    pub evaluation: Option<Evaluation>,
}

pub struct TrainingPipeline<M, C> {
    pub model: M,
    pub classifier: C,
    pub config: PipelineConfig,
}

impl<M, C> TrainingPipeline<M, C>
where
    M: EmbeddingModel,
    C: Classifier,
{
    pub fn new(model: M, classifier: C, config: PipelineConfig) -> Self {
        Self {
            model,
            classifier,
            config,
        }
    }

    pub fn run(self, corpus_root: &Path) -> Result<(FittedPipeline<M, C>, TrainingSummary)> {
        let Self {
            model,
            mut classifier,
            config,
        } = self;

        let augmenter = Augmenter::new(config.augment.clone())?;
        let loader = AudioLoader::default();
        let (dataset, build) = DatasetBuilder::new(&model)
            .with_loader(loader.clone())
            .with_augmenter(augmenter)
            .build(corpus_root)?;
        let (sequences, labels) = dataset.into_columns();

        let mut normalizer = SequenceNormalizer::new();
        let scaled = normalizer.fit_transform(&sequences)?;
        let scaler = normalizer.into_state()?;
        drop(sequences);

        let codec = LabelCodec::fit(&labels)?;
        let encoded = codec.encode_all(&labels)?;

        let split = train_test_split(encoded.len(), config.split.test_fraction, config.split.seed)?;
        let train_x = scaled.select(&split.train)?;
        let train_y = pick(&encoded, &split.train);
        let test_x = scaled.select(&split.test)?;
        let test_y = pick(&encoded, &split.test);

        info!(
            target: LOG_TARGET,
            rows = encoded.len(),
            train = train_y.len(),
            test = test_y.len(),
            classes = codec.len(),
            max_len = scaler.max_len,
            "fitted normalizer and label codec"
        );

        let validation = (!test_y.is_empty()).then(|| LabeledSet::new(&test_x, &test_y));
        let training = classifier.fit(
            LabeledSet::new(&train_x, &train_y),
            validation,
            codec.len(),
        )?;
        let evaluation = validation
            .map(|test| classifier.evaluate(test))
            .transpose()?;
        if let Some(eval) = &evaluation {
            info!(
                target: LOG_TARGET,
                loss = eval.loss,
                accuracy = eval.accuracy,
                "test evaluation"
            );
        }

        let summary = TrainingSummary {
            build,
            max_len: scaler.max_len,
            classes: codec.classes().to_vec(),
            train_rows: train_y.len(),
            test_rows: test_y.len(),
            training,
            evaluation,
        };
        let fitted = FittedPipeline {
            model,
            loader,
            scaler,
            codec,
            classifier,
        };
        Ok((fitted, summary))
    }
}

fn pick(values: &[u32], indices: &[usize]) -> Vec<u32> {
    indices.iter().map(|&i| values[i]).collect()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    /// Raw class label, e.g. `"03"`.
    pub label: String,
    /// Human-readable emotion, `"Unknown Emotion"` for unrecognised labels.
    pub emotion: String,
    pub class_index: usize,
    /// Probability of the predicted class as a percentage in `[0, 100]`.
    pub confidence_percent: f32,
    pub probabilities: Vec<f32>,
}

/// Embedding model, scaler state, label codec and trained classifier that
/// belong together.
pub struct FittedPipeline<M, C> {
    model: M,
    loader: AudioLoader,
    scaler: ScalerState,
    codec: LabelCodec,
    classifier: C,
}

impl<M, C> FittedPipeline<M, C>
where
    M: EmbeddingModel,
    C: Classifier,
{
    /// Reassembles a pipeline from state produced by an earlier fit.
    pub fn from_parts(model: M, scaler: ScalerState, codec: LabelCodec, classifier: C) -> Self {
        Self {
            model,
            loader: AudioLoader::default(),
            scaler,
            codec,
            classifier,
        }
    }

    pub fn scaler(&self) -> &ScalerState {
        &self.scaler
    }

    pub fn codec(&self) -> &LabelCodec {
        &self.codec
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Loads, embeds, scales and classifies one file. Any failure is
    /// reported with the file path attached.
    pub fn predict_file(&self, path: &Path) -> Result<Prediction> {
        self.loader
            .load(path)
            .map_err(PipelineError::from)
            .and_then(|waveform| self.predict_waveform(&waveform))
            .map_err(|source| PipelineError::File {
                path: path.to_path_buf(),
                source: Box::new(source),
            })
            .inspect(|p| {
                info!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    emotion = %p.emotion,
                    confidence = p.confidence_percent,
                    "prediction"
                );
            })
    }

    pub fn predict_waveform(&self, waveform: &Waveform) -> Result<Prediction> {
        let sequence = self.model.embed(waveform)?;
        let inputs = self.scaler.transform(&sequence)?;
        let probabilities = self.classifier.predict(&inputs)?;
        if probabilities.nrows() != 1 {
            return Err(ClassifierError::Shape(format!(
                "expected one probability row, got {}",
                probabilities.nrows()
            ))
            .into());
        }
        let row = probabilities.row(0);
        let (class_index, probability) = argmax(row)
            .ok_or_else(|| ClassifierError::Shape("empty probability row".to_owned()))?;
        let label = self.codec.decode(class_index)?.to_owned();

        Ok(Prediction {
            emotion: emotion_name(&label).to_owned(),
            label,
            class_index,
            confidence_percent: (probability * 100.0).clamp(0.0, 100.0),
            probabilities: row.to_vec(),
        })
    }
}
