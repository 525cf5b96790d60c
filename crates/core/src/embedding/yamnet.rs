//! YAMNet embedding backend.
//!
//! Runs the full-waveform YAMNet ONNX export, which takes a 1-D float
//! waveform at 16 kHz and returns `(scores, embeddings, spectrogram)`.
//! Only `embeddings` ([frames, 1024]) is used.

use super::{
    check_waveform, EmbedError, EmbeddingModel, EmbeddingSequence, DEFAULT_EMBEDDINGS_OUTPUT,
    YAMNET_EMBEDDING_WIDTH,
};
use crate::audio::Waveform;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Position of the embeddings output when the export uses other names.
const EMBEDDINGS_OUTPUT_INDEX: usize = 1;

pub struct YamnetEmbedder {
    // `Session::run` needs `&mut`, the trait hands out `&self`.
    session: Mutex<Session>,
    output_name: String,
}

impl YamnetEmbedder {
    pub fn new(model_path: &Path, n_threads: usize) -> Result<Self, EmbedError> {
        Self::with_output_name(model_path, n_threads, DEFAULT_EMBEDDINGS_OUTPUT)
    }

    pub fn with_output_name(
        model_path: &Path,
        n_threads: usize,
        output_name: &str,
    ) -> Result<Self, EmbedError> {
        if !model_path.exists() {
            return Err(EmbedError::ModelUnavailable(format!(
                "YAMNet model not found at {}",
                model_path.display()
            )));
        }

        info!(path = %model_path.display(), threads = n_threads, "loading YAMNet model");

        let session = Session::builder()
            .map_err(|e| EmbedError::ModelUnavailable(format!("session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EmbedError::ModelUnavailable(format!("optimization level: {e}")))?
            .with_intra_threads(n_threads.max(1))
            .map_err(|e| EmbedError::ModelUnavailable(format!("thread count: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| EmbedError::ModelUnavailable(format!("failed to load model: {e}")))?;

        info!("YAMNet model loaded");

        Ok(Self {
            session: Mutex::new(session),
            output_name: output_name.to_owned(),
        })
    }
}

impl EmbeddingModel for YamnetEmbedder {
    fn embedding_width(&self) -> usize {
        YAMNET_EMBEDDING_WIDTH
    }

    fn embed(&self, waveform: &Waveform) -> Result<EmbeddingSequence, EmbedError> {
        check_waveform(waveform)?;

        let input = Tensor::from_array(([waveform.len()], waveform.samples.clone()))
            .map_err(|e| EmbedError::Inference(format!("failed to create input tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedError::ModelUnavailable("YAMNet session lock poisoned".to_owned()))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| EmbedError::Inference(e.to_string()))?;

        let mut by_name = None;
        let mut by_index = None;
        for (idx, (name, value)) in outputs.iter().enumerate() {
            if name == self.output_name {
                by_name = Some(value);
                break;
            }
            if idx == EMBEDDINGS_OUTPUT_INDEX {
                by_index = Some(value);
            }
        }
        let value = by_name.or(by_index).ok_or_else(|| {
            EmbedError::InvalidOutput(format!("no '{}' output", self.output_name))
        })?;

        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InvalidOutput(e.to_string()))?;
        let dims: Vec<i64> = shape.iter().copied().collect();
        if dims.len() != 2 || dims[1] as usize != YAMNET_EMBEDDING_WIDTH {
            return Err(EmbedError::InvalidOutput(format!(
                "expected [frames, {YAMNET_EMBEDDING_WIDTH}], got {dims:?}"
            )));
        }
        let num_frames = dims[0].max(0) as usize;

        debug!(samples = waveform.len(), frames = num_frames, "YAMNet embeddings");

        EmbeddingSequence::from_flat(data.to_vec(), num_frames, YAMNET_EMBEDDING_WIDTH)
    }
}
