//! Audio loading.
//!
//! Every file that enters the pipeline goes through [`AudioLoader`]: the
//! container is probed and decoded with symphonia, channels are averaged down
//! to mono and the signal is resampled to 16 kHz.

mod resample;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

pub use resample::{resample_mono, resampled_len};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Extensions the corpus walk treats as audio.
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "flac", "ogg", "mp3"];

/// Mono PCM samples at a known sample rate.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        duration_from_samples(self.sample_rate, self.samples.len())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode audio: {0}")]
    Decode(String),

    #[error("unsupported audio stream: {0}")]
    UnsupportedFormat(String),

    #[error("no audio track found")]
    NoAudioTrack,

    #[error("resampling failed: {0}")]
    Resample(String),
}

pub type Result<T> = std::result::Result<T, LoadError>;

#[derive(Clone, Debug)]
pub struct AudioLoader {
    target_rate: u32,
}

impl Default for AudioLoader {
    fn default() -> Self {
        Self {
            target_rate: TARGET_SAMPLE_RATE,
        }
    }
}

impl AudioLoader {
    pub fn load(&self, path: &Path) -> Result<Waveform> {
        let decoded = decode_file(path)?;
        let mono = downmix_to_mono(&decoded.interleaved, decoded.channels);
        if mono.is_empty() {
            return Err(LoadError::Decode(format!(
                "{} contains no samples",
                path.display()
            )));
        }

        let samples = resample_mono(&mono, decoded.sample_rate, self.target_rate)?;
        tracing::debug!(
            path = %path.display(),
            source_rate = decoded.sample_rate,
            channels = decoded.channels,
            samples = samples.len(),
            "audio loaded"
        );

        Ok(Waveform::new(samples, self.target_rate))
    }
}

/// Returns true when the path carries one of [`AUDIO_EXTENSIONS`] (any case).
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            AUDIO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

struct DecodedAudio {
    interleaved: Vec<f32>,
    sample_rate: u32,
    channels: usize,
}

fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| LoadError::Decode(format!("unrecognised container: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(LoadError::NoAudioTrack)?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| LoadError::UnsupportedFormat("unknown sample rate".to_owned()))?;
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| LoadError::UnsupportedFormat(e.to_string()))?;

    let mut interleaved = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(LoadError::Decode(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                channels = spec.channels.count().max(1);
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(buf.samples());
            }
            // A corrupt packet costs us that packet only.
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping corrupt packet");
            }
            Err(e) => return Err(LoadError::Decode(e.to_string())),
        }
    }

    Ok(DecodedAudio {
        interleaved,
        sample_rate,
        channels,
    })
}

pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

pub fn duration_from_samples(sample_rate_hz: u32, samples: usize) -> Duration {
    if sample_rate_hz == 0 {
        return Duration::from_secs(0);
    }
    let micros = (u128::from(samples as u64) * 1_000_000u128) / u128::from(sample_rate_hz);
    Duration::from_micros(micros.min(u128::from(u64::MAX)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: &[Vec<i16>]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for frame in frames {
            for &s in frame {
                writer.write_sample(s).expect("write sample");
            }
        }
        writer.finalize().expect("finalize wav");
    }

    fn tone(sample_rate: u32, seconds: f32, freq: f32) -> Vec<i16> {
        let n = (sample_rate as f32 * seconds) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((2.0 * std::f32::consts::PI * freq * t).sin() * 0.5 * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn loads_16k_mono_wav_unchanged_in_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        let frames: Vec<Vec<i16>> = tone(16_000, 1.0, 440.0).into_iter().map(|s| vec![s]).collect();
        write_wav(&path, 16_000, 1, &frames);

        let wave = AudioLoader::default().load(&path).expect("load");
        assert_eq!(wave.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(wave.len(), 16_000);
        assert_eq!(wave.duration().as_secs(), 1);
    }

    #[test]
    fn resamples_stereo_44k1_to_16k_mono() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        let left = tone(44_100, 0.5, 220.0);
        let frames: Vec<Vec<i16>> = left.iter().map(|&s| vec![s, s]).collect();
        write_wav(&path, 44_100, 2, &frames);

        let wave = AudioLoader::default().load(&path).expect("load");
        assert_eq!(wave.sample_rate, 16_000);
        assert_eq!(wave.len(), resampled_len(left.len(), 44_100, 16_000));
        let peak = wave.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.3 && peak < 0.7, "peak {peak}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = AudioLoader::default()
            .load(Path::new("/definitely/not/here.wav"))
            .unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn garbage_bytes_are_decode_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("noise.wav");
        std::fs::write(&path, b"this is not a riff file at all").expect("write");

        let err = AudioLoader::default().load(&path).unwrap_err();
        assert!(matches!(err, LoadError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn audio_extension_match_is_case_insensitive() {
        assert!(is_audio_file(Path::new("a/03-01-03-01-01-01-01.WAV")));
        assert!(is_audio_file(Path::new("clip.flac")));
        assert!(!is_audio_file(Path::new("notes.txt")));
        assert!(!is_audio_file(Path::new("no_extension")));
    }

    #[test]
    fn downmix_averages_channels() {
        let mono = downmix_to_mono(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }
}
