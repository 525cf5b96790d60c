//! Frame-level audio embeddings.
//!
//! An [`EmbeddingModel`] turns a 16 kHz waveform into one fixed-width vector
//! per analysis frame. The production backend is YAMNet (1024-wide frames
//! every 0.48 s); tests plug in their own models behind the same trait.

#[cfg(feature = "onnx")]
mod yamnet;

use crate::audio::{Waveform, TARGET_SAMPLE_RATE};
use ndarray::{Array2, ArrayView2};

#[cfg(feature = "onnx")]
pub use yamnet::YamnetEmbedder;

pub const YAMNET_EMBEDDING_WIDTH: usize = 1024;
/// Name of the embeddings output in YAMNet exports.
pub const DEFAULT_EMBEDDINGS_OUTPUT: &str = "embeddings";
/// 0.975 s analysis window at 16 kHz.
pub const YAMNET_WINDOW_SAMPLES: usize = 15_600;
/// 0.48 s hop at 16 kHz.
pub const YAMNET_HOP_SAMPLES: usize = 7_680;

/// Number of frames YAMNet emits for a waveform of `num_samples` samples.
///
/// Short inputs are padded up to one window; longer ones are padded so the
/// last hop is complete.
pub fn yamnet_frame_count(num_samples: usize) -> usize {
    if num_samples == 0 {
        return 0;
    }
    let extra = num_samples.saturating_sub(YAMNET_WINDOW_SAMPLES);
    1 + extra.div_ceil(YAMNET_HOP_SAMPLES)
}

/// Ordered frames x width matrix produced for one waveform.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingSequence {
    frames: Array2<f32>,
}

impl EmbeddingSequence {
    pub fn new(frames: Array2<f32>) -> Self {
        Self { frames }
    }

    pub fn from_flat(data: Vec<f32>, num_frames: usize, width: usize) -> Result<Self, EmbedError> {
        let frames = Array2::from_shape_vec((num_frames, width), data).map_err(|e| {
            EmbedError::InvalidOutput(format!(
                "cannot shape embeddings as {num_frames}x{width}: {e}"
            ))
        })?;
        Ok(Self { frames })
    }

    pub fn num_frames(&self) -> usize {
        self.frames.nrows()
    }

    pub fn width(&self) -> usize {
        self.frames.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.frames.view()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EmbedError {
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("embedding inference failed: {0}")]
    Inference(String),

    #[error("waveform too short to embed ({samples} samples)")]
    WaveformTooShort { samples: usize },

    #[error("expected {expected} Hz audio, got {actual} Hz")]
    SampleRate { expected: u32, actual: u32 },

    #[error("invalid embedding output: {0}")]
    InvalidOutput(String),
}

impl EmbedError {
    /// Errors after which no further file can be embedded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EmbedError::ModelUnavailable(_))
    }
}

pub trait EmbeddingModel: Send + Sync {
    fn embedding_width(&self) -> usize;

    fn embed(&self, waveform: &Waveform) -> Result<EmbeddingSequence, EmbedError>;
}

impl<M: EmbeddingModel + ?Sized> EmbeddingModel for Box<M> {
    fn embedding_width(&self) -> usize {
        (**self).embedding_width()
    }

    fn embed(&self, waveform: &Waveform) -> Result<EmbeddingSequence, EmbedError> {
        (**self).embed(waveform)
    }
}

/// Shared input validation for embedding backends.
pub fn check_waveform(waveform: &Waveform) -> Result<(), EmbedError> {
    if waveform.sample_rate != TARGET_SAMPLE_RATE {
        return Err(EmbedError::SampleRate {
            expected: TARGET_SAMPLE_RATE,
            actual: waveform.sample_rate,
        });
    }
    if waveform.is_empty() {
        return Err(EmbedError::WaveformTooShort { samples: 0 });
    }
    Ok(())
}
