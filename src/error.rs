//! Error taxonomy shared by the transport, framing and session layers.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by connection handling, framing, decoding and sessions.
#[derive(Debug, Error)]
pub enum AsrError {
    /// Handshake failed, or the server went away before a graceful shutdown.
    #[error("connection error: {reason}")]
    Connection {
        /// Close or failure reason reported by the transport (may be empty).
        reason: String,
    },

    /// Transport rejected an outbound message.
    #[error("send failed: {reason}")]
    Send { reason: String },

    /// Channel closed or failed while a result was awaited.
    #[error("receive failed: {reason}")]
    Receive { reason: String },

    /// Audio input was rejected by the decoding collaborator.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Framing, pacing or endpoint parameters are invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Reading an input file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The session was cancelled by the caller.
    #[error("session cancelled")]
    Cancelled,
}

impl From<url::ParseError> for AsrError {
    fn from(err: url::ParseError) -> Self {
        Self::Configuration(format!("invalid endpoint url: {err}"))
    }
}

/// Protocol phase a session was in when it failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    Configuring,
    Connecting,
    Decoding,
    SendingFile,
    AwaitingResult,
    Streaming,
    Finalizing,
    AwaitingAck,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuring => "configuring",
            Self::Connecting => "connecting",
            Self::Decoding => "decoding",
            Self::SendingFile => "sending file",
            Self::AwaitingResult => "awaiting result",
            Self::Streaming => "streaming",
            Self::Finalizing => "finalizing",
            Self::AwaitingAck => "awaiting acknowledgement",
        };
        f.write_str(name)
    }
}

/// Terminal session failure, surfaced after the connection has been closed.
#[derive(Debug, Error)]
#[error("{phase} failed{}: {source}", file_suffix(.file))]
pub struct SessionError {
    /// Phase the session was in.
    pub phase: SessionPhase,
    /// Input file being processed, for batch sessions.
    pub file: Option<PathBuf>,
    /// Underlying cause.
    #[source]
    pub source: AsrError,
}

impl SessionError {
    pub fn new(phase: SessionPhase, source: AsrError) -> Self {
        Self {
            phase,
            file: None,
            source,
        }
    }

    pub fn for_file(phase: SessionPhase, file: impl Into<PathBuf>, source: AsrError) -> Self {
        Self {
            phase,
            file: Some(file.into()),
            source,
        }
    }

    /// Returns true when the failure was caused by caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, AsrError::Cancelled)
    }
}

fn file_suffix(file: &Option<PathBuf>) -> String {
    match file {
        Some(path) => format!(" for {}", path.display()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{AsrError, SessionError, SessionPhase};

    #[test]
    fn session_error_names_phase_and_file() {
        let err = SessionError::for_file(
            SessionPhase::Decoding,
            "/tmp/b.wav",
            AsrError::UnsupportedFormat("expected 1 channel, got 2".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "decoding failed for /tmp/b.wav: unsupported audio format: expected 1 channel, got 2"
        );
    }

    #[test]
    fn session_error_without_file() {
        let err = SessionError::new(SessionPhase::AwaitingAck, AsrError::Cancelled);
        assert_eq!(
            err.to_string(),
            "awaiting acknowledgement failed: session cancelled"
        );
        assert!(err.is_cancelled());
    }
}
