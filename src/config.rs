//! Session parameters and their defaults.
//!
//! Option structs derive `Deserialize` with `#[serde(default)]`, so callers can
//! load partial settings from any serde format and keep the defaults for the
//! rest. Validation happens once, before a session opens its connection.

use std::time::Duration;

use serde::Deserialize;

use crate::error::AsrError;

/// Upper bound for a single outbound batch message, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 1_000_000;
/// Samples per streaming chunk (0.5 s at 16 kHz).
pub const DEFAULT_SAMPLES_PER_CHUNK: usize = 8_000;
/// Simulated wall-clock duration between two streaming chunks.
pub const DEFAULT_SECONDS_PER_CHUNK: f64 = 0.1;
/// Sample rate the streaming endpoints accept.
pub const STREAMING_SAMPLE_RATE: u32 = 16_000;
/// Parallel batch sessions allowed at once.
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 4;
/// Time given to the result listener to drain after the close frame.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 2_000;

/// Options for pre-recorded (batch) sessions.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchOptions {
    /// Largest binary message sent over the connection.
    pub max_message_bytes: usize,
    /// Connection limit for [`crate::session::batch::transcribe_parallel`].
    pub max_concurrent_connections: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_message_bytes: MAX_MESSAGE_BYTES,
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
        }
    }
}

impl BatchOptions {
    /// Rejects zero message sizes and connection limits.
    pub fn validate(&self) -> Result<(), AsrError> {
        if self.max_message_bytes == 0 {
            return Err(AsrError::Configuration(
                "max_message_bytes must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_connections == 0 {
            return Err(AsrError::Configuration(
                "max_concurrent_connections must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for live-simulated streaming sessions.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingOptions {
    /// Samples carried by each outbound chunk.
    pub samples_per_chunk: usize,
    /// Pause after each chunk, in seconds. `0.0` sends as fast as possible.
    pub seconds_per_chunk: f64,
    /// Sample rate the audio must have; it is negotiated out of band.
    pub sample_rate: u32,
    /// Server-side endpointing flag, sent as the `endpoints` query parameter.
    pub endpointing: Option<bool>,
    /// Wait for the `Done!` acknowledgement after the sentinel.
    pub await_ack: bool,
    /// Optional bound on the acknowledgement wait, in seconds.
    pub ack_timeout_sec: Option<f64>,
    /// Grace period for late results once the close frame is sent.
    pub close_timeout_ms: u64,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            samples_per_chunk: DEFAULT_SAMPLES_PER_CHUNK,
            seconds_per_chunk: DEFAULT_SECONDS_PER_CHUNK,
            sample_rate: STREAMING_SAMPLE_RATE,
            endpointing: None,
            await_ack: false,
            ack_timeout_sec: None,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
        }
    }
}

impl StreamingOptions {
    /// Hosted API behavior: endpointing enabled, no acknowledgement wait.
    pub fn hosted() -> Self {
        Self {
            endpointing: Some(true),
            ..Self::default()
        }
    }

    /// On-premise server behavior: wait for `Done!` before closing.
    pub fn on_premise() -> Self {
        Self {
            await_ack: true,
            ..Self::default()
        }
    }

    /// Sets whether the session waits for `Done!` before closing.
    pub fn with_await_ack(mut self, await_ack: bool) -> Self {
        self.await_ack = await_ack;
        self
    }

    /// Sets chunk size and the pause after each chunk.
    pub fn with_pacing(mut self, samples_per_chunk: usize, seconds_per_chunk: f64) -> Self {
        self.samples_per_chunk = samples_per_chunk;
        self.seconds_per_chunk = seconds_per_chunk;
        self
    }

    /// Rejects zero sizes and pacing values that are not representable delays.
    pub fn validate(&self) -> Result<(), AsrError> {
        if self.samples_per_chunk == 0 {
            return Err(AsrError::Configuration(
                "samples_per_chunk must be > 0".to_string(),
            ));
        }
        validate_seconds(self.seconds_per_chunk, "seconds_per_chunk")?;
        if let Some(timeout) = self.ack_timeout_sec {
            validate_seconds(timeout, "ack_timeout_sec")?;
        }
        if self.sample_rate == 0 {
            return Err(AsrError::Configuration(
                "sample_rate must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Pacing delay between chunks.
    pub fn pacing_interval(&self) -> Result<Duration, AsrError> {
        seconds_to_duration(self.seconds_per_chunk, "seconds_per_chunk")
    }

    /// Bound on the `Done!` wait, if one is configured.
    pub fn ack_timeout(&self) -> Result<Option<Duration>, AsrError> {
        self.ack_timeout_sec
            .map(|seconds| seconds_to_duration(seconds, "ack_timeout_sec"))
            .transpose()
    }

    /// Grace period for late results after the close frame.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

fn validate_seconds(value: f64, field: &str) -> Result<(), AsrError> {
    seconds_to_duration(value, field).map(|_| ())
}

fn seconds_to_duration(value: f64, field: &str) -> Result<Duration, AsrError> {
    if !value.is_finite() {
        return Err(AsrError::Configuration(format!(
            "{field} must be a finite number"
        )));
    }
    if value < 0.0 {
        return Err(AsrError::Configuration(format!("{field} must be >= 0")));
    }
    Duration::try_from_secs_f64(value).map_err(|_| {
        AsrError::Configuration(format!("{field} is too large to be a duration"))
    })
}
