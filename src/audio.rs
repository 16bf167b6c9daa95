//! Decoded audio and the decoding collaborator.
//!
//! Sessions only see [`AudioBuffer`] values produced by an [`AudioDecoder`].
//! [`WavDecoder`] is the bundled implementation; anything that turns a path
//! into mono `f32` samples can be plugged in instead.

use std::path::Path;
use std::time::Duration;

use hound::{SampleFormat, WavReader};
use tracing::debug;

use crate::error::AsrError;

/// Mono 32-bit float samples plus their sample rate.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Wraps mono samples recorded at `sample_rate` Hz.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Samples in playback order.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration; zero when the sample rate is zero.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Turns an input file into an [`AudioBuffer`].
///
/// Implementations must reject anything that is not single-channel with
/// [`AsrError::UnsupportedFormat`].
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<AudioBuffer, AsrError>;
}

impl<F> AudioDecoder for F
where
    F: Fn(&Path) -> Result<AudioBuffer, AsrError> + Send + Sync,
{
    fn decode(&self, path: &Path) -> Result<AudioBuffer, AsrError> {
        self(path)
    }
}

/// WAV decoder backed by `hound`.
///
/// Integer PCM is normalised into `[-1.0, 1.0)` by `2^(bits - 1)`; float PCM
/// is passed through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct WavDecoder;

impl AudioDecoder for WavDecoder {
    fn decode(&self, path: &Path) -> Result<AudioBuffer, AsrError> {
        let reader = WavReader::open(path).map_err(map_wav_error)?;
        let spec = reader.spec();

        if spec.channels != 1 {
            return Err(AsrError::UnsupportedFormat(format!(
                "only mono audio is supported, {} has {} channels",
                path.display(),
                spec.channels
            )));
        }

        let samples = match spec.sample_format {
            SampleFormat::Int => {
                if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                    return Err(AsrError::UnsupportedFormat(format!(
                        "unsupported bit depth {}",
                        spec.bits_per_sample
                    )));
                }
                let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(map_wav_error)?
            }
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_wav_error)?,
        };

        debug!(
            event = "audio_decoded",
            path = %path.display(),
            samples = samples.len(),
            sample_rate = spec.sample_rate,
            bits_per_sample = spec.bits_per_sample
        );

        Ok(AudioBuffer::new(samples, spec.sample_rate))
    }
}

/// Rejects audio whose sample rate differs from `expected`.
pub fn require_sample_rate(audio: &AudioBuffer, expected: u32) -> Result<(), AsrError> {
    if audio.sample_rate() != expected {
        return Err(AsrError::UnsupportedFormat(format!(
            "expected {expected} Hz audio, got {} Hz",
            audio.sample_rate()
        )));
    }
    Ok(())
}

fn map_wav_error(err: hound::Error) -> AsrError {
    match err {
        hound::Error::IoError(err) => AsrError::Io(err),
        other => AsrError::UnsupportedFormat(other.to_string()),
    }
}
