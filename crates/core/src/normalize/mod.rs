//! Padding and feature standardisation for embedding sequences.
//!
//! Training data is padded to the longest sequence and standardised with
//! per-feature statistics computed over every (sample, timestep) row of the
//! padded tensor. The resulting [`ScalerState`] is the only thing inference
//! needs: it pads or truncates a new sequence to the same length and applies
//! the same statistics.

use crate::embedding::EmbeddingSequence;
use ndarray::{s, Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// Sentinel written into padded timesteps before scaling.
pub const PAD_VALUE: f32 = 0.0;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("sequence normalizer has not been fit")]
    NotFitted,

    #[error("sequence normalizer is already fit")]
    AlreadyFitted,

    #[error("embedding width mismatch: expected {expected}, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("cannot fit on an empty dataset")]
    EmptyDataset,

    #[error("invalid tensor shape: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, NormalizeError>;

/// Rectangular samples x timesteps x width batch plus the number of real
/// (unpadded) timesteps in each sample.
#[derive(Clone, Debug, PartialEq)]
pub struct PaddedTensor {
    values: Array3<f32>,
    lengths: Vec<usize>,
}

impl PaddedTensor {
    pub fn new(values: Array3<f32>, lengths: Vec<usize>) -> Result<Self> {
        let (n, t, _) = values.dim();
        if lengths.len() != n {
            return Err(NormalizeError::Shape(format!(
                "{} lengths for {n} samples",
                lengths.len()
            )));
        }
        if let Some(&bad) = lengths.iter().find(|&&l| l > t) {
            return Err(NormalizeError::Shape(format!(
                "length {bad} exceeds {t} timesteps"
            )));
        }
        Ok(Self { values, lengths })
    }

    pub fn values(&self) -> ArrayView3<'_, f32> {
        self.values.view()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn num_samples(&self) -> usize {
        self.values.dim().0
    }

    pub fn max_len(&self) -> usize {
        self.values.dim().1
    }

    pub fn width(&self) -> usize {
        self.values.dim().2
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.num_samples()) {
            return Err(NormalizeError::Shape(format!(
                "index {bad} out of range for {} samples",
                self.num_samples()
            )));
        }
        Ok(Self {
            values: self.values.select(Axis(0), indices),
            lengths: indices.iter().map(|&i| self.lengths[i]).collect(),
        })
    }

    pub fn into_parts(self) -> (Array3<f32>, Vec<usize>) {
        (self.values, self.lengths)
    }
}

/// Post-pad every sequence with [`PAD_VALUE`] to `max_len` frames.
///
/// Longer sequences lose their leading frames so the most recent `max_len`
/// frames are kept.
pub fn pad_sequences(
    sequences: &[EmbeddingSequence],
    max_len: usize,
    width: usize,
) -> Result<PaddedTensor> {
    let mut values = Array3::from_elem((sequences.len(), max_len, width), PAD_VALUE);
    let mut lengths = Vec::with_capacity(sequences.len());

    for (i, seq) in sequences.iter().enumerate() {
        if seq.width() != width {
            return Err(NormalizeError::WidthMismatch {
                expected: width,
                actual: seq.width(),
            });
        }
        let frames = seq.num_frames();
        let keep = frames.min(max_len);
        let start = frames - keep;
        values
            .slice_mut(s![i, ..keep, ..])
            .assign(&seq.view().slice(s![start.., ..]));
        lengths.push(keep);
    }

    PaddedTensor::new(values, lengths)
}

/// Fitted padding length and per-feature statistics.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScalerState {
    pub max_len: usize,
    pub mean: Vec<f32>,
    /// Population standard deviation per feature.
    pub std: Vec<f32>,
}

impl ScalerState {
    /// Fit on the full training set and return the state with the scaled
    /// training tensor.
    pub fn fit(sequences: &[EmbeddingSequence]) -> Result<(Self, PaddedTensor)> {
        let first = sequences.first().ok_or(NormalizeError::EmptyDataset)?;
        let width = first.width();
        let max_len = sequences
            .iter()
            .map(EmbeddingSequence::num_frames)
            .max()
            .unwrap_or(0);
        if max_len == 0 || width == 0 {
            return Err(NormalizeError::EmptyDataset);
        }

        let padded = pad_sequences(sequences, max_len, width)?;
        let (mean, std) = feature_moments(&padded.values);
        let state = Self { max_len, mean, std };

        tracing::info!(
            samples = sequences.len(),
            max_len,
            width,
            "sequence normalizer fit"
        );

        let (mut values, lengths) = padded.into_parts();
        state.scale_in_place(&mut values);
        Ok((state, PaddedTensor::new(values, lengths)?))
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, sequence: &EmbeddingSequence) -> Result<PaddedTensor> {
        self.transform_batch(std::slice::from_ref(sequence))
    }

    pub fn transform_batch(&self, sequences: &[EmbeddingSequence]) -> Result<PaddedTensor> {
        let padded = pad_sequences(sequences, self.max_len, self.width())?;
        let (mut values, lengths) = padded.into_parts();
        self.scale_in_place(&mut values);
        PaddedTensor::new(values, lengths)
    }

    fn scale_in_place(&self, values: &mut Array3<f32>) {
        for mut row in values.lanes_mut(Axis(2)) {
            for ((x, &m), &sd) in row.iter_mut().zip(&self.mean).zip(&self.std) {
                *x = (*x - m) / effective_scale(sd);
            }
        }
    }
}

fn effective_scale(std: f32) -> f32 {
    if std > f32::EPSILON {
        std
    } else {
        1.0
    }
}

/// Per-feature mean and population std over all timestep rows.
fn feature_moments(values: &Array3<f32>) -> (Vec<f32>, Vec<f32>) {
    let (n, steps, width) = values.dim();
    let moments = values
        .mapv(f64::from)
        .into_shape_with_order((n * steps, width))
        .ok()
        .and_then(|rows| Some((rows.mean_axis(Axis(0))?, rows.std_axis(Axis(0), 0.0))));
    match moments {
        Some((mean, std)) => (
            mean.iter().map(|&m| m as f32).collect(),
            std.iter().map(|&s| s as f32).collect(),
        ),
        None => (vec![0.0; width], vec![0.0; width]),
    }
}

/// Stateful wrapper that enforces fit-once, transform-after-fit.
#[derive(Clone, Debug, Default)]
pub struct SequenceNormalizer {
    state: Option<ScalerState>,
}

impl SequenceNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fit_transform(&mut self, sequences: &[EmbeddingSequence]) -> Result<PaddedTensor> {
        if self.state.is_some() {
            return Err(NormalizeError::AlreadyFitted);
        }
        let (state, tensor) = ScalerState::fit(sequences)?;
        self.state = Some(state);
        Ok(tensor)
    }

    pub fn transform(&self, sequence: &EmbeddingSequence) -> Result<PaddedTensor> {
        self.state()?.transform(sequence)
    }

    pub fn state(&self) -> Result<&ScalerState> {
        self.state.as_ref().ok_or(NormalizeError::NotFitted)
    }

    pub fn into_state(self) -> Result<ScalerState> {
        self.state.ok_or(NormalizeError::NotFitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn seq(rows: Vec<Vec<f32>>) -> EmbeddingSequence {
        let n = rows.len();
        let w = rows.first().map(Vec::len).unwrap_or(0);
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        EmbeddingSequence::new(Array2::from_shape_vec((n, w), flat).expect("shape"))
    }

    #[test]
    fn pads_shorter_sequences_with_zero() {
        let seqs = vec![seq(vec![vec![1.0, 2.0]]), seq(vec![vec![3.0, 4.0], vec![5.0, 6.0]])];
        let padded = pad_sequences(&seqs, 2, 2).expect("pad");
        assert_eq!(padded.lengths(), [1, 2]);
        assert_eq!(
            padded.values().to_owned(),
            array![[[1.0, 2.0], [0.0, 0.0]], [[3.0, 4.0], [5.0, 6.0]]]
        );
    }

    #[test]
    fn padding_a_full_length_sequence_is_identity() {
        let s = seq(vec![vec![1.0, -1.0], vec![2.0, -2.0], vec![3.0, -3.0]]);
        let padded = pad_sequences(std::slice::from_ref(&s), 3, 2).expect("pad");
        assert_eq!(padded.values().index_axis(Axis(0), 0), s.view());
        assert_eq!(padded.lengths(), [3]);
    }

    #[test]
    fn longer_sequences_keep_their_last_frames() {
        let s = seq(vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]]);
        let padded = pad_sequences(&[s], 2, 1).expect("pad");
        assert_eq!(padded.values().to_owned(), array![[[3.0], [4.0]]]);
        assert_eq!(padded.lengths(), [2]);
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let err = pad_sequences(&[seq(vec![vec![1.0, 2.0, 3.0]])], 2, 2).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::WidthMismatch {
                expected: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn fit_uses_padded_rows_for_statistics() {
        // Rows: [2, 10], [4, 10], [6, 10], pad [0, 0]
        let seqs = vec![
            seq(vec![vec![2.0, 10.0], vec![4.0, 10.0]]),
            seq(vec![vec![6.0, 10.0]]),
        ];
        let (state, tensor) = ScalerState::fit(&seqs).expect("fit");
        assert_eq!(state.max_len, 2);
        assert!((state.mean[0] - 3.0).abs() < 1e-6);
        assert!((state.mean[1] - 7.5).abs() < 1e-6);
        // population variance of [2,4,6,0] is 5
        assert!((state.std[0] - 5.0f32.sqrt()).abs() < 1e-5);
        assert_eq!(tensor.lengths(), [2, 1]);

        let col0: Vec<f32> = tensor.values().slice(s![.., .., 0]).iter().copied().collect();
        let mean0 = col0.iter().sum::<f32>() / col0.len() as f32;
        assert!(mean0.abs() < 1e-6);
    }

    #[test]
    fn constant_feature_scales_by_one() {
        let seqs = vec![seq(vec![vec![1.0, 7.0], vec![3.0, 7.0]])];
        let (state, tensor) = ScalerState::fit(&seqs).expect("fit");
        assert_eq!(state.std[1], 0.0);
        assert_eq!(tensor.values()[[0, 0, 1]], 0.0);
        assert_eq!(tensor.values()[[0, 1, 1]], 0.0);
    }

    #[test]
    fn fitting_twice_is_deterministic() {
        let seqs = vec![
            seq(vec![vec![0.3, 1.5], vec![0.1, -2.0], vec![0.8, 0.0]]),
            seq(vec![vec![-0.4, 2.5]]),
        ];
        let (a, ta) = ScalerState::fit(&seqs).expect("fit");
        let (b, tb) = ScalerState::fit(&seqs).expect("fit");
        assert_eq!(a, b);
        assert_eq!(ta, tb);
    }

    #[test]
    fn transform_reuses_fitted_state() {
        let seqs = vec![
            seq(vec![vec![1.0], vec![3.0]]),
            seq(vec![vec![5.0]]),
        ];
        let mut normalizer = SequenceNormalizer::new();
        let train = normalizer.fit_transform(&seqs).expect("fit");

        let one = normalizer.transform(&seqs[1]).expect("transform");
        assert_eq!(one.max_len(), 2);
        assert_eq!(
            one.values().index_axis(Axis(0), 0),
            train.values().index_axis(Axis(0), 1)
        );

        let long = seq(vec![vec![1.0], vec![2.0], vec![3.0]]);
        assert_eq!(normalizer.transform(&long).expect("transform").max_len(), 2);
    }

    #[test]
    fn transform_before_fit_is_not_fitted() {
        let normalizer = SequenceNormalizer::new();
        assert_eq!(
            normalizer.transform(&seq(vec![vec![1.0]])).unwrap_err(),
            NormalizeError::NotFitted
        );
        assert_eq!(normalizer.state().unwrap_err(), NormalizeError::NotFitted);
    }

    #[test]
    fn refit_is_rejected() {
        let seqs = vec![seq(vec![vec![1.0]])];
        let mut normalizer = SequenceNormalizer::new();
        normalizer.fit_transform(&seqs).expect("fit");
        assert_eq!(
            normalizer.fit_transform(&seqs).unwrap_err(),
            NormalizeError::AlreadyFitted
        );
    }

    #[test]
    fn empty_dataset_cannot_be_fit() {
        assert_eq!(
            ScalerState::fit(&[]).unwrap_err(),
            NormalizeError::EmptyDataset
        );
    }

    #[test]
    fn select_keeps_lengths_aligned() {
        let seqs = vec![
            seq(vec![vec![1.0]]),
            seq(vec![vec![2.0], vec![3.0]]),
            seq(vec![vec![4.0]]),
        ];
        let padded = pad_sequences(&seqs, 2, 1).expect("pad");
        let picked = padded.select(&[2, 1]).expect("select");
        assert_eq!(picked.lengths(), [1, 2]);
        assert_eq!(picked.values()[[0, 0, 0]], 4.0);
        assert!(padded.select(&[3]).is_err());
    }
}
