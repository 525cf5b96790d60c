//! Waveform perturbations used to enlarge the training set.
//!
//! Each original recording yields exactly three variants, always in the
//! same order: time-stretched, pitch-shifted, and noisy.

use crate::audio::Waveform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use signalsmith_stretch::Stretch;

pub const DEFAULT_STRETCH_RATE: f64 = 1.1;
pub const DEFAULT_PITCH_SEMITONES: f32 = 2.0;
pub const DEFAULT_NOISE_STD: f32 = 0.01;
pub const DEFAULT_AUGMENT_SEED: u64 = 42;

/// Variants produced per original waveform.
pub const VARIANTS_PER_SAMPLE: usize = 3;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AugmentKind {
    TimeStretch,
    PitchShift,
    Noise,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Augmented {
    pub kind: AugmentKind,
    pub waveform: Waveform,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AugmentConfig {
    pub enabled: bool,
    /// Playback rate; 1.1 plays 10% faster and shortens the clip.
    pub stretch_rate: f64,
    pub pitch_semitones: f32,
    pub noise_std: f32,
    pub seed: u64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stretch_rate: DEFAULT_STRETCH_RATE,
            pitch_semitones: DEFAULT_PITCH_SEMITONES,
            noise_std: DEFAULT_NOISE_STD,
            seed: DEFAULT_AUGMENT_SEED,
        }
    }
}

impl AugmentConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), AugmentError> {
        if !self.stretch_rate.is_finite() || self.stretch_rate <= 0.0 {
            return Err(AugmentError::InvalidRate(self.stretch_rate));
        }
        if !self.pitch_semitones.is_finite() {
            return Err(AugmentError::InvalidPitch(self.pitch_semitones));
        }
        if !self.noise_std.is_finite() || self.noise_std < 0.0 {
            return Err(AugmentError::InvalidNoise(self.noise_std));
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AugmentError {
    #[error("stretch rate must be finite and > 0, got {0}")]
    InvalidRate(f64),

    #[error("pitch shift must be finite, got {0}")]
    InvalidPitch(f32),

    #[error("noise std must be finite and >= 0, got {0}")]
    InvalidNoise(f32),

    #[error("cannot augment an empty waveform")]
    Empty,
}

pub struct Augmenter {
    config: AugmentConfig,
    rng: StdRng,
    noise: Normal<f32>,
}

impl Augmenter {
    pub fn new(config: AugmentConfig) -> Result<Self, AugmentError> {
        config.validate()?;
        let noise = Normal::new(0.0, config.noise_std)
            .map_err(|_| AugmentError::InvalidNoise(config.noise_std))?;
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            noise,
            config,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn augment(&mut self, waveform: &Waveform) -> Result<[Augmented; 3], AugmentError> {
        if waveform.is_empty() {
            return Err(AugmentError::Empty);
        }
        let sr = waveform.sample_rate;

        let stretched = time_stretch(&waveform.samples, sr, self.config.stretch_rate);
        let shifted = pitch_shift(&waveform.samples, sr, self.config.pitch_semitones);
        let noisy = add_noise(&waveform.samples, &mut self.rng, &self.noise);

        Ok([
            Augmented {
                kind: AugmentKind::TimeStretch,
                waveform: Waveform::new(stretched, sr),
            },
            Augmented {
                kind: AugmentKind::PitchShift,
                waveform: Waveform::new(shifted, sr),
            },
            Augmented {
                kind: AugmentKind::Noise,
                waveform: Waveform::new(noisy, sr),
            },
        ])
    }
}

/// Output length of a stretch at `rate`: `round(n / rate)`, at least one sample.
pub fn stretched_len(input_len: usize, rate: f64) -> usize {
    ((input_len as f64 / rate).round() as usize).max(1)
}

/// Change duration by `1 / rate` while keeping pitch.
pub fn time_stretch(samples: &[f32], sample_rate: u32, rate: f64) -> Vec<f32> {
    let mut stretcher = Stretch::preset_default(1, sample_rate);
    run_offline(&mut stretcher, samples, stretched_len(samples.len(), rate))
}

/// Transpose by `semitones` while keeping duration.
pub fn pitch_shift(samples: &[f32], sample_rate: u32, semitones: f32) -> Vec<f32> {
    let mut stretcher = Stretch::preset_default(1, sample_rate);
    stretcher.set_transpose_factor_semitones(semitones, None);
    run_offline(&mut stretcher, samples, samples.len())
}

pub fn add_noise(samples: &[f32], rng: &mut StdRng, noise: &Normal<f32>) -> Vec<f32> {
    samples.iter().map(|&s| s + noise.sample(rng)).collect()
}

/// Push a whole buffer through the stretcher and return exactly `out_len`
/// samples aligned with the input.
///
/// Output sample `k` reflects input time `k * rate - input_latency` once the
/// first `output_latency` samples are dropped, so the input is padded with
/// `input_latency` zeros and the output trimmed by both latencies, the input
/// one scaled to output time.
fn run_offline(stretcher: &mut Stretch, input: &[f32], out_len: usize) -> Vec<f32> {
    if input.is_empty() {
        return vec![0.0; out_len];
    }
    let input_latency = stretcher.input_latency();
    let output_latency = stretcher.output_latency();
    let rate = input.len() as f64 / out_len as f64;
    let lead = (input_latency as f64 / rate).round() as usize;

    let mut padded = Vec::with_capacity(input.len() + input_latency);
    padded.extend_from_slice(input);
    padded.resize(input.len() + input_latency, 0.0);

    let mut out = vec![0.0f32; out_len + lead];
    stretcher.process(&padded, &mut out[..]);

    let mut tail = vec![0.0f32; output_latency];
    stretcher.flush(&mut tail[..]);
    out.extend_from_slice(&tail);

    let mut aligned: Vec<f32> = out.into_iter().skip(lead + output_latency).collect();
    aligned.resize(out_len, 0.0);
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 16_000;

    fn sine(seconds: f32, freq: f32) -> Vec<f32> {
        let n = (SR as f32 * seconds) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin())
            .collect()
    }

    fn zero_crossings(samples: &[f32]) -> usize {
        samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count()
    }

    fn middle(samples: &[f32]) -> &[f32] {
        let q = samples.len() / 4;
        &samples[q..samples.len() - q]
    }

    #[test]
    fn produces_three_variants_in_fixed_order() {
        let mut aug = Augmenter::new(AugmentConfig::default()).expect("augmenter");
        let wave = Waveform::new(sine(1.0, 300.0), SR);
        let out = aug.augment(&wave).expect("augment");
        let kinds: Vec<_> = out.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AugmentKind::TimeStretch,
                AugmentKind::PitchShift,
                AugmentKind::Noise
            ]
        );
        assert!(out.iter().all(|a| a.waveform.sample_rate == SR));
    }

    #[test]
    fn stretch_shortens_and_others_keep_length() {
        let mut aug = Augmenter::new(AugmentConfig::default()).expect("augmenter");
        let wave = Waveform::new(sine(2.0, 300.0), SR);
        let [stretched, shifted, noisy] = aug.augment(&wave).expect("augment");
        assert_eq!(stretched.waveform.len(), stretched_len(32_000, 1.1));
        assert_eq!(stretched.waveform.len(), 29_091);
        assert_eq!(shifted.waveform.len(), 32_000);
        assert_eq!(noisy.waveform.len(), 32_000);
    }

    #[test]
    fn stretch_keeps_pitch() {
        let input = sine(2.0, 400.0);
        let out = time_stretch(&input, SR, 1.1);
        let rate_in = zero_crossings(middle(&input)) as f32 / middle(&input).len() as f32;
        let rate_out = zero_crossings(middle(&out)) as f32 / middle(&out).len() as f32;
        let ratio = rate_out / rate_in;
        assert!((0.93..1.07).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn pitch_shift_raises_frequency_by_two_semitones() {
        let input = sine(2.0, 400.0);
        let out = pitch_shift(&input, SR, 2.0);
        let ratio =
            zero_crossings(middle(&out)) as f32 / zero_crossings(middle(&input)) as f32;
        // 2^(2/12) ~= 1.122
        assert!((1.03..1.25).contains(&ratio), "ratio {ratio}");
    }

    /// Silence with a tone burst over `[from, to)` seconds.
    fn burst(seconds: f32, from: f32, to: f32) -> Vec<f32> {
        let tone = sine(seconds, 500.0);
        tone.iter()
            .enumerate()
            .map(|(i, &s)| {
                let t = i as f32 / SR as f32;
                if (from..to).contains(&t) {
                    s
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// First and last 10 ms window whose RMS exceeds half of `peak_rms`,
    /// in seconds.
    fn active_span(samples: &[f32], peak_rms: f32) -> (f32, f32) {
        let window = (SR / 100) as usize;
        let active: Vec<usize> = samples
            .chunks(window)
            .enumerate()
            .filter(|(_, chunk)| {
                let rms = (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt();
                rms > 0.5 * peak_rms
            })
            .map(|(i, _)| i)
            .collect();
        let first = active.first().copied().unwrap_or(0);
        let last = active.last().copied().unwrap_or(0) + 1;
        let to_secs = |w: usize| (w * window) as f32 / SR as f32;
        (to_secs(first), to_secs(last))
    }

    const TONE_RMS: f32 = 0.5 / std::f32::consts::SQRT_2;

    #[test]
    fn pitch_shift_keeps_events_in_place() {
        let input = burst(2.0, 0.8, 1.2);
        let out = pitch_shift(&input, SR, 2.0);
        let (onset, release) = active_span(&out, TONE_RMS);
        assert!((onset - 0.8).abs() <= 0.03, "onset {onset}");
        assert!((release - 1.2).abs() <= 0.03, "release {release}");
    }

    #[test]
    fn pitch_shift_keeps_the_last_samples() {
        let input = burst(1.0, 0.85, 1.0);
        let out = pitch_shift(&input, SR, 2.0);
        let (onset, release) = active_span(&out, TONE_RMS);
        assert!((onset - 0.85).abs() <= 0.03, "onset {onset}");
        assert!(release >= 0.97, "release {release}");
    }

    #[test]
    fn time_stretch_scales_event_times() {
        let input = burst(2.2, 1.1, 1.54);
        let out = time_stretch(&input, SR, 1.1);
        let (onset, release) = active_span(&out, TONE_RMS);
        assert!((onset - 1.0).abs() <= 0.03, "onset {onset}");
        assert!((release - 1.4).abs() <= 0.03, "release {release}");
    }

    #[test]
    fn noise_is_seeded_and_small() {
        let wave = Waveform::new(vec![0.0; 20_000], SR);
        let mut a = Augmenter::new(AugmentConfig::default()).expect("augmenter");
        let mut b = Augmenter::new(AugmentConfig::default()).expect("augmenter");
        let [_, _, noisy_a] = a.augment(&wave).expect("augment");
        let [_, _, noisy_b] = b.augment(&wave).expect("augment");
        assert_eq!(noisy_a.waveform, noisy_b.waveform);

        let s = &noisy_a.waveform.samples;
        let mean = s.iter().sum::<f32>() / s.len() as f32;
        let std = (s.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / s.len() as f32).sqrt();
        assert!(mean.abs() < 0.001, "mean {mean}");
        assert!((std - 0.01).abs() < 0.001, "std {std}");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad_rate = AugmentConfig {
            stretch_rate: 0.0,
            ..Default::default()
        };
        assert_eq!(
            Augmenter::new(bad_rate).err(),
            Some(AugmentError::InvalidRate(0.0))
        );

        let bad_noise = AugmentConfig {
            noise_std: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            Augmenter::new(bad_noise).err(),
            Some(AugmentError::InvalidNoise(_))
        ));
    }

    #[test]
    fn empty_waveform_is_rejected() {
        let mut aug = Augmenter::new(AugmentConfig::default()).expect("augmenter");
        assert_eq!(
            aug.augment(&Waveform::new(Vec::new(), SR)).err(),
            Some(AugmentError::Empty)
        );
    }
}
