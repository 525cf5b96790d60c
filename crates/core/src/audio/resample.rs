use super::{LoadError, Result};
use rubato::{FftFixedIn, Resampler};

/// Input frames handed to the FFT resampler per call.
const CHUNK_FRAMES: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Number of output samples for `input_len` samples converted between rates.
pub fn resampled_len(input_len: usize, from_hz: u32, to_hz: u32) -> usize {
    if from_hz == 0 {
        return 0;
    }
    let num = input_len as u64 * u64::from(to_hz);
    num.div_ceil(u64::from(from_hz)) as usize
}

/// Resample a whole mono buffer, trimming the resampler delay so the output
/// is time-aligned with the input and exactly [`resampled_len`] long.
pub fn resample_mono(samples: &[f32], from_hz: u32, to_hz: u32) -> Result<Vec<f32>> {
    if from_hz == 0 || to_hz == 0 {
        return Err(LoadError::Resample(format!(
            "invalid sample rates {from_hz} Hz -> {to_hz} Hz"
        )));
    }
    if from_hz == to_hz || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    tracing::debug!(from_hz, to_hz, input = samples.len(), "resampling");

    let mut resampler =
        FftFixedIn::<f32>::new(from_hz as usize, to_hz as usize, CHUNK_FRAMES, SUB_CHUNKS, 1)
            .map_err(|e| LoadError::Resample(e.to_string()))?;

    let expected = resampled_len(samples.len(), from_hz, to_hz);
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + CHUNK_FRAMES);

    let mut pos = 0;
    while samples.len() - pos >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let chunk = &samples[pos..pos + n];
        let res = resampler
            .process(&[chunk], None)
            .map_err(|e| LoadError::Resample(e.to_string()))?;
        out.extend_from_slice(&res[0]);
        pos += n;
    }

    if pos < samples.len() {
        let tail: [&[f32]; 1] = [&samples[pos..]];
        let res = resampler
            .process_partial(Some(&tail[..]), None)
            .map_err(|e| LoadError::Resample(e.to_string()))?;
        out.extend_from_slice(&res[0]);
    }

    // Flush until the delayed signal has fully come out.
    while out.len() < expected + delay {
        let res = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| LoadError::Resample(e.to_string()))?;
        if res[0].is_empty() {
            break;
        }
        out.extend_from_slice(&res[0]);
    }

    let mut aligned: Vec<f32> = out.into_iter().skip(delay).collect();
    aligned.resize(expected, 0.0);
    Ok(aligned)
}
