use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::error::AsrError;

/// Text message announcing that no more audio follows on this connection.
pub const SENTINEL: &str = "Done";
/// Text message the on-premise streaming server sends once the sentinel has
/// been processed.
pub const ACK: &str = "Done!";
/// Size of the batch frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// Batch-mode prefix: sample rate and payload byte length, both LE u32.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Payload length in bytes, header excluded.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Encodes the header as 8 little-endian bytes.
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let mut bytes = [0u8; FRAME_HEADER_LEN];
        bytes[..4].copy_from_slice(&self.sample_rate.to_le_bytes());
        bytes[4..].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    /// Reads a header from the start of `bytes`, if enough bytes are present.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let sample_rate = bytes.get(..4)?.try_into().ok()?;
        let payload_len = bytes.get(4..FRAME_HEADER_LEN)?.try_into().ok()?;
        Some(Self {
            sample_rate: u32::from_le_bytes(sample_rate),
            payload_len: u32::from_le_bytes(payload_len),
        })
    }
}

/// Little-endian IEEE-754 encoding of `samples`.
pub fn samples_to_le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Frames one file for batch transfer.
///
/// The header and the sample bytes form one logical stream which is cut into
/// consecutive messages of at most `max_message_bytes`. An empty buffer still
/// yields the header message.
pub fn frame_batch(
    samples: &[f32],
    sample_rate: u32,
    max_message_bytes: usize,
) -> Result<Vec<Vec<u8>>, AsrError> {
    if max_message_bytes == 0 {
        return Err(AsrError::Configuration(
            "max_message_bytes must be > 0".to_string(),
        ));
    }

    let payload_bytes = samples.len() * SAMPLE_BYTES;
    let payload_len = u32::try_from(payload_bytes).map_err(|_| {
        AsrError::UnsupportedFormat(format!(
            "{payload_bytes} bytes of audio do not fit the frame header"
        ))
    })?;

    let header = FrameHeader {
        sample_rate,
        payload_len,
    };
    let mut stream = Vec::with_capacity(FRAME_HEADER_LEN + payload_bytes);
    stream.extend_from_slice(&header.to_bytes());
    for sample in samples {
        stream.extend_from_slice(&sample.to_le_bytes());
    }

    Ok(stream
        .chunks(max_message_bytes)
        .map(<[u8]>::to_vec)
        .collect())
}

/// Frames samples for streaming: `samples_per_chunk` samples per message,
/// the last message holding the remainder. No header, no padding.
pub fn frame_streaming(
    samples: &[f32],
    samples_per_chunk: usize,
) -> Result<impl ExactSizeIterator<Item = Vec<u8>> + '_, AsrError> {
    if samples_per_chunk == 0 {
        return Err(AsrError::Configuration(
            "samples_per_chunk must be > 0".to_string(),
        ));
    }
    Ok(samples.chunks(samples_per_chunk).map(samples_to_le_bytes))
}

/// Messages the client puts on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// Framed audio bytes.
    Audio(Vec<u8>),
    /// End-of-stream sentinel.
    Done,
}

impl ClientMessage {
    /// Converts into the websocket frame put on the wire.
    pub fn into_ws(self) -> Message {
        match self {
            Self::Audio(bytes) => Message::Binary(bytes),
            Self::Done => Message::Text(SENTINEL.to_string()),
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Audio(bytes) => bytes.len(),
            Self::Done => SENTINEL.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Data messages received from the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Recognition result.
    Transcript(Transcript),
    /// Streaming completion acknowledgement (`Done!`).
    Ack,
    /// Binary payload; the known servers only send text.
    Binary(Vec<u8>),
}

impl ServerMessage {
    /// Classifies a text message: `Done!` is the acknowledgement, anything else a result.
    pub fn from_text(text: String) -> Self {
        if text == ACK {
            Self::Ack
        } else {
            Self::Transcript(Transcript::new(text))
        }
    }

    /// Converts a result message into a transcript, decoding binary lossily.
    pub fn into_transcript(self) -> Option<Transcript> {
        match self {
            Self::Transcript(transcript) => Some(transcript),
            Self::Binary(bytes) => Some(Transcript::new(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
            Self::Ack => None,
        }
    }
}

/// One recognition result, kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transcript {
    raw: String,
}

impl Transcript {
    /// Wraps a raw result payload.
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Payload exactly as received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Consumes the transcript, returning the payload.
    pub fn into_raw(self) -> String {
        self.raw
    }

    /// Parses the JSON result object, if the payload is one.
    pub fn segment(&self) -> Option<TranscriptSegment> {
        serde_json::from_str(&self.raw).ok()
    }

    /// Recognised text, falling back to the raw payload.
    pub fn text(&self) -> String {
        self.segment()
            .map(|segment| segment.text)
            .unwrap_or_else(|| self.raw.clone())
    }
}

/// Value of the segment `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Hypothesis that may still change.
    Partial,
    /// Settled text for the segment.
    Final,
    /// Any value this client does not know.
    #[serde(other)]
    Other,
}

/// Result object: `{"segment": 3, "type": "final", "text": "..."}`.
///
/// Pre-recorded results only carry `text`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptSegment {
    /// Segment counter, streaming results only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<u64>,
    /// Partial or final, streaming results only.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SegmentKind>,
    /// Recognised text.
    pub text: String,
}

impl TranscriptSegment {
    /// Whether the server marked this segment final.
    pub fn is_final(&self) -> bool {
        self.kind == Some(SegmentKind::Final)
    }

    /// Whether no text was recognised.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}
