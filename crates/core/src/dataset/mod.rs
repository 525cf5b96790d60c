//! Corpus walking: every audio file becomes one original row plus its
//! augmented variants, all sharing the label parsed from the file name.

use crate::audio::{is_audio_file, AudioLoader, LoadError};
use crate::augment::{AugmentError, AugmentKind, Augmenter};
use crate::embedding::{EmbedError, EmbeddingModel, EmbeddingSequence};
use crate::labels::{parse_label, LabelError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const LOG_TARGET: &str = "speech_emotion::dataset";

pub const DEFAULT_TEST_FRACTION: f64 = 0.2;
pub const DEFAULT_SPLIT_SEED: u64 = 42;

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("corpus root {0} does not exist")]
    RootNotFound(PathBuf),

    #[error("cannot walk corpus: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("embedding model failed on {path}: {source}")]
    Embed {
        path: PathBuf,
        #[source]
        source: EmbedError,
    },

    #[error("corpus at {0} produced no samples")]
    EmptyCorpus(PathBuf),

    #[error("test fraction must be in (0, 1), got {0}")]
    InvalidSplit(f64),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

/// Why one corpus file did not make it into the dataset.
#[derive(thiserror::Error, Debug)]
pub enum FileError {
    #[error(transparent)]
    Label(#[from] LabelError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Augment(#[from] AugmentError),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Origin {
    Original,
    Augmented(AugmentKind),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub label: String,
    pub sequence: EmbeddingSequence,
    pub source: PathBuf,
    pub origin: Origin,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn labels(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.label.as_str()).collect()
    }

    pub fn max_frames(&self) -> usize {
        self.samples
            .iter()
            .map(|s| s.sequence.num_frames())
            .max()
            .unwrap_or(0)
    }

    /// Splits into parallel sequence and label columns.
    pub fn into_columns(self) -> (Vec<EmbeddingSequence>, Vec<String>) {
        self.samples
            .into_iter()
            .map(|s| (s.sequence, s.label))
            .unzip()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildReport {
    /// Audio files encountered by the walk.
    pub files_seen: usize,
    pub files_processed: usize,
    pub rows: usize,
    pub skipped: Vec<SkippedFile>,
}

impl BuildReport {
    pub fn files_skipped(&self) -> usize {
        self.skipped.len()
    }
}

pub struct DatasetBuilder<'m, M: EmbeddingModel + ?Sized> {
    model: &'m M,
    loader: AudioLoader,
    augmenter: Option<Augmenter>,
}

impl<'m, M: EmbeddingModel + ?Sized> DatasetBuilder<'m, M> {
    pub fn new(model: &'m M) -> Self {
        Self {
            model,
            loader: AudioLoader::default(),
            augmenter: None,
        }
    }

    pub fn with_loader(mut self, loader: AudioLoader) -> Self {
        self.loader = loader;
        self
    }

    /// A disabled augmenter is dropped, so only original rows are produced.
    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = augmenter.is_enabled().then_some(augmenter);
        self
    }

    pub fn build(&mut self, root: &Path) -> Result<(Dataset, BuildReport)> {
        if !root.exists() {
            return Err(DatasetError::RootNotFound(root.to_path_buf()));
        }
        info!(
            target: LOG_TARGET,
            root = %root.display(),
            augment = self.augmenter.is_some(),
            "building dataset"
        );

        let mut dataset = Dataset::default();
        let mut report = BuildReport::default();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(e.into()),
                Err(e) => {
                    warn!(target: LOG_TARGET, error = %e, "skipping unreadable corpus entry");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || !is_audio_file(path) {
                continue;
            }
            report.files_seen += 1;

            match self.process_file(path) {
                Ok(rows) => {
                    debug!(
                        target: LOG_TARGET,
                        path = %path.display(),
                        rows = rows.len(),
                        "file processed"
                    );
                    report.files_processed += 1;
                    dataset.samples.extend(rows);
                }
                Err(FileError::Embed(e)) if e.is_fatal() => {
                    return Err(DatasetError::Embed {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, path = %path.display(), error = %e, "skipping file");
                    report.skipped.push(SkippedFile {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if dataset.is_empty() {
            return Err(DatasetError::EmptyCorpus(root.to_path_buf()));
        }
        report.rows = dataset.len();
        info!(
            target: LOG_TARGET,
            rows = report.rows,
            processed = report.files_processed,
            skipped = report.files_skipped(),
            "dataset ready"
        );
        Ok((dataset, report))
    }

    /// Original row first, then one row per augmented variant.
    fn process_file(&mut self, path: &Path) -> std::result::Result<Vec<Sample>, FileError> {
        let label = parse_label(path)?;
        let waveform = self.loader.load(path)?;
        let sample = |sequence, origin| Sample {
            label: label.clone(),
            sequence,
            source: path.to_path_buf(),
            origin,
        };

        let mut rows = vec![sample(self.model.embed(&waveform)?, Origin::Original)];
        if let Some(augmenter) = self.augmenter.as_mut() {
            for variant in augmenter.augment(&waveform)? {
                let sequence = self.model.embed(&variant.waveform)?;
                rows.push(sample(sequence, Origin::Augmented(variant.kind)));
            }
        }
        Ok(rows)
    }
}

/// Disjoint, shuffled train/test index sets over `0..n`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Test size is `ceil(n * test_fraction)`, capped so at least one row trains.
pub fn train_test_split(n: usize, test_fraction: f64, seed: u64) -> Result<Split> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(DatasetError::InvalidSplit(test_fraction));
    }
    let test_len = ((n as f64 * test_fraction).ceil() as usize).min(n.saturating_sub(1));
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let train = indices.split_off(test_len);
    Ok(Split {
        train,
        test: indices,
    })
}
