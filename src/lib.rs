//! Rust client for Banafo speech recognition over websockets.
//!
//! The crate is organized by layer:
//! - `ws`: endpoint selection, handshake, connection adapter and wire framing.
//! - `session`: batch and streaming protocol controllers.
//! - `audio`: decoded audio buffers and the WAV decoder.
//! - `config`: session options and their defaults.
//! - `error`: error taxonomy shared by all layers.

/// Decoded audio and the decoding collaborator.
pub mod audio;
/// Session options and defaults.
pub mod config;
/// Error types.
pub mod error;
/// Batch and streaming session controllers.
pub mod session;
/// Websocket transport and protocol messages.
pub mod ws;

pub use audio::{AudioBuffer, AudioDecoder, WavDecoder};
pub use config::{BatchOptions, StreamingOptions};
pub use error::{AsrError, SessionError, SessionPhase};
pub use session::batch::{transcribe_parallel, BatchReport, BatchSession, FileTranscript};
pub use session::streaming::{StreamingReport, StreamingSession};
pub use ws::client::{AsrClient, Connection, SessionMode};
pub use ws::proto::{Transcript, TranscriptSegment};
