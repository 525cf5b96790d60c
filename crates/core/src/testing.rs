//! Test fixtures: fake embedding models and a WAV writer.

use crate::audio::Waveform;
use crate::embedding::{
    check_waveform, yamnet_frame_count, EmbedError, EmbeddingModel, EmbeddingSequence,
    YAMNET_HOP_SAMPLES, YAMNET_WINDOW_SAMPLES,
};
use std::path::Path;

/// Two features per YAMNet-sized frame: mean absolute amplitude and
/// zero-crossing rate. Frame count follows the real framing rule.
pub struct FrameStatsModel;

impl EmbeddingModel for FrameStatsModel {
    fn embedding_width(&self) -> usize {
        2
    }

    fn embed(&self, waveform: &Waveform) -> Result<EmbeddingSequence, EmbedError> {
        check_waveform(waveform)?;
        let samples = &waveform.samples;
        let frames = yamnet_frame_count(samples.len());
        let mut data = Vec::with_capacity(frames * 2);
        for k in 0..frames {
            let start = (k * YAMNET_HOP_SAMPLES).min(samples.len());
            let end = (start + YAMNET_WINDOW_SAMPLES).min(samples.len());
            let window = &samples[start..end];
            let n = window.len().max(1) as f32;
            let level = window.iter().map(|s| s.abs()).sum::<f32>() / n;
            let crossings = window
                .windows(2)
                .filter(|w| (w[0] < 0.0) != (w[1] < 0.0))
                .count() as f32
                / n;
            data.push(level);
            data.push(crossings * 10.0);
        }
        EmbeddingSequence::from_flat(data, frames, 2)
    }
}

/// Always fails as if the model file were missing.
pub struct UnavailableModel;

impl EmbeddingModel for UnavailableModel {
    fn embedding_width(&self) -> usize {
        2
    }

    fn embed(&self, _waveform: &Waveform) -> Result<EmbeddingSequence, EmbedError> {
        Err(EmbedError::ModelUnavailable("no model".to_owned()))
    }
}

/// Writes a mono 16-bit sine at 16 kHz.
pub fn write_tone(path: &Path, freq: f32, amplitude: f32, seconds: f32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    let n = (16_000.0 * seconds) as usize;
    for i in 0..n {
        let t = i as f32 / 16_000.0;
        let v = amplitude * (2.0 * std::f32::consts::PI * freq * t).sin();
        writer
            .write_sample((v * i16::MAX as f32) as i16)
            .expect("write sample");
    }
    writer.finalize().expect("finalize wav");
}
