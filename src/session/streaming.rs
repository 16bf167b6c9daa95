//! Live-simulated streaming over one connection.
//!
//! The connection is split as soon as it opens. A listener task owns the
//! receive half and reports everything it sees over an in-process channel;
//! the send loop owns the send half, paces the chunks and reads that channel
//! between sends. Results are not correlated with chunks.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{require_sample_rate, AudioBuffer};
use crate::config::StreamingOptions;
use crate::error::{AsrError, SessionError, SessionPhase};
use crate::session::{close_quietly, until_cancelled};
use crate::ws::client::{
    AsrClient, Connection, ConnectionReceiver, ConnectionSender, MessageChannel, SessionMode,
    NORMAL_CLOSURE,
};
use crate::ws::proto::{frame_streaming, ClientMessage, ServerMessage, Transcript};

/// What the listener task observed on the receive half.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenerEvent {
    /// A recognition result.
    Transcript(Transcript),
    /// The `Done!` acknowledgement.
    Ack,
    /// The receive half ended; carries the close or failure reason.
    Disconnected(String),
}

/// Outcome of a completed streaming session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamingReport {
    /// Audio chunks sent, the sentinel excluded.
    pub chunks_sent: usize,
    /// Results observed before the listener stopped, in arrival order.
    pub transcripts: Vec<Transcript>,
    /// Whether `Done!` was observed.
    pub acknowledged: bool,
}

impl StreamingReport {
    /// Text of the final segments joined by spaces.
    ///
    /// Results that are not segment objects contribute their raw text.
    pub fn final_text(&self) -> String {
        self.transcripts
            .iter()
            .filter_map(|transcript| match transcript.segment() {
                Some(segment) if segment.kind.is_some() && !segment.is_final() => None,
                Some(segment) => Some(segment.text),
                None => Some(transcript.raw().to_string()),
            })
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Default)]
struct Observed {
    transcripts: Vec<Transcript>,
    acknowledged: bool,
    disconnected: Option<String>,
}

impl Observed {
    /// Records `event`; a disconnect is returned as a connection error.
    fn apply(&mut self, event: ListenerEvent) -> Result<(), AsrError> {
        match event {
            ListenerEvent::Transcript(transcript) => self.transcripts.push(transcript),
            ListenerEvent::Ack => self.acknowledged = true,
            ListenerEvent::Disconnected(reason) => {
                self.disconnected = Some(reason.clone());
                return Err(AsrError::Connection { reason });
            }
        }
        Ok(())
    }

    /// Applies every event already queued.
    fn observe_pending(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
    ) -> Result<(), AsrError> {
        while let Ok(event) = events.try_recv() {
            self.apply(event)?;
        }
        Ok(())
    }
}

/// Drives the streaming protocol.
#[derive(Clone, Debug)]
pub struct StreamingSession {
    options: StreamingOptions,
    transcripts: Option<mpsc::UnboundedSender<Transcript>>,
}

impl StreamingSession {
    /// Creates a session without a transcript sink.
    pub fn new(options: StreamingOptions) -> Self {
        Self {
            options,
            transcripts: None,
        }
    }

    /// Forwards every result to `sink` as soon as it arrives.
    pub fn with_transcript_sink(mut self, sink: mpsc::UnboundedSender<Transcript>) -> Self {
        self.transcripts = Some(sink);
        self
    }

    /// Options this session runs with.
    pub fn options(&self) -> &StreamingOptions {
        &self.options
    }

    /// Opens a streaming connection on `client` and streams `audio`.
    ///
    /// Options and the audio sample rate are checked before connecting.
    pub async fn stream(
        &self,
        client: &AsrClient,
        audio: &AudioBuffer,
        cancel: &CancellationToken,
    ) -> Result<StreamingReport, SessionError> {
        self.check(audio)?;

        let connection = until_cancelled(
            cancel,
            client.connect(SessionMode::Streaming, self.options.endpointing),
        )
        .await
        .map_err(|err| SessionError::new(SessionPhase::Connecting, err))?;

        self.run_checked(connection, audio, cancel).await
    }

    /// Streams `audio` over an already-opened connection.
    ///
    /// The connection is closed before this returns, whatever the outcome.
    pub async fn run<S: MessageChannel>(
        &self,
        mut connection: Connection<S>,
        audio: &AudioBuffer,
        cancel: &CancellationToken,
    ) -> Result<StreamingReport, SessionError> {
        if let Err(err) = self.check(audio) {
            close_quietly(connection.close(NORMAL_CLOSURE)).await;
            return Err(err);
        }
        self.run_checked(connection, audio, cancel).await
    }

    fn check(&self, audio: &AudioBuffer) -> Result<(), SessionError> {
        self.options
            .validate()
            .and_then(|()| require_sample_rate(audio, self.options.sample_rate))
            .map_err(|err| SessionError::new(SessionPhase::Configuring, err))
    }

    async fn run_checked<S: MessageChannel>(
        &self,
        connection: Connection<S>,
        audio: &AudioBuffer,
        cancel: &CancellationToken,
    ) -> Result<StreamingReport, SessionError> {
        let (mut sender, receiver) = connection.split();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let listener = tokio::spawn(listen(receiver, events_tx, self.transcripts.clone()));

        let mut observed = Observed::default();
        let result = self
            .drive(&mut sender, &mut events, &mut observed, audio, cancel)
            .await;

        close_quietly(sender.close(NORMAL_CLOSURE)).await;
        debug!(event = "connection_closed", ok = result.is_ok());

        let chunks_sent = match result {
            Ok(chunks_sent) => chunks_sent,
            Err(err) => {
                listener.abort();
                return Err(err);
            }
        };

        drain(&mut events, &mut observed, listener, &self.options, cancel).await;

        Ok(StreamingReport {
            chunks_sent,
            transcripts: observed.transcripts,
            acknowledged: observed.acknowledged,
        })
    }

    async fn drive<S: MessageChannel>(
        &self,
        sender: &mut ConnectionSender<S>,
        events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
        observed: &mut Observed,
        audio: &AudioBuffer,
        cancel: &CancellationToken,
    ) -> Result<usize, SessionError> {
        let streaming = |err| SessionError::new(SessionPhase::Streaming, err);
        let configuring = |err| SessionError::new(SessionPhase::Configuring, err);

        let chunks = frame_streaming(audio.samples(), self.options.samples_per_chunk)
            .map_err(configuring)?;
        let total = chunks.len();
        let interval = self.options.pacing_interval().map_err(configuring)?;
        let ack_timeout = self.options.ack_timeout().map_err(configuring)?;

        info!(
            event = "streaming_started",
            chunks = total,
            samples = audio.len(),
            ?interval
        );

        let mut chunks_sent = 0;
        for chunk in chunks {
            observed.observe_pending(events).map_err(streaming)?;
            send(sender, events, observed, ClientMessage::Audio(chunk), cancel)
                .await
                .map_err(streaming)?;
            chunks_sent += 1;
            debug!(event = "chunk_sent", index = chunks_sent, total);

            if !interval.is_zero() {
                pace(interval, events, observed, cancel)
                    .await
                    .map_err(streaming)?;
            }
        }

        let finalizing = |err| SessionError::new(SessionPhase::Finalizing, err);
        observed.observe_pending(events).map_err(finalizing)?;
        send(sender, events, observed, ClientMessage::Done, cancel)
            .await
            .map_err(finalizing)?;
        info!(event = "sentinel_sent", chunks = chunks_sent);

        if self.options.await_ack && !observed.acknowledged {
            let wait = wait_for_ack(events, observed);
            let waited = match ack_timeout {
                Some(timeout) => until_cancelled(cancel, with_ack_timeout(timeout, wait)).await,
                None => until_cancelled(cancel, wait).await,
            };
            waited.map_err(|err| SessionError::new(SessionPhase::AwaitingAck, err))?;
            info!(event = "ack_received");
        }

        Ok(chunks_sent)
    }
}

/// Sends one message, preferring a disconnect the listener already saw over
/// the transport's own send failure.
async fn send<S: MessageChannel>(
    sender: &mut ConnectionSender<S>,
    events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
    observed: &mut Observed,
    message: ClientMessage,
    cancel: &CancellationToken,
) -> Result<(), AsrError> {
    match until_cancelled(cancel, sender.send(message)).await {
        Err(err @ AsrError::Send { .. }) => {
            observed.observe_pending(events)?;
            if let Some(reason) = observed.disconnected.clone() {
                return Err(AsrError::Connection { reason });
            }
            Err(err)
        }
        other => other,
    }
}

/// Waits out one pacing interval while recording listener events.
async fn pace(
    interval: Duration,
    events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
    observed: &mut Observed,
    cancel: &CancellationToken,
) -> Result<(), AsrError> {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);
    let mut listener_open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AsrError::Cancelled),
            event = events.recv(), if listener_open => match event {
                Some(event) => observed.apply(event)?,
                None => listener_open = false,
            },
            _ = &mut sleep => return Ok(()),
        }
    }
}

async fn wait_for_ack(
    events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
    observed: &mut Observed,
) -> Result<(), AsrError> {
    loop {
        match events.recv().await {
            Some(ListenerEvent::Ack) => {
                observed.acknowledged = true;
                return Ok(());
            }
            Some(ListenerEvent::Transcript(transcript)) => observed.transcripts.push(transcript),
            Some(ListenerEvent::Disconnected(reason)) => {
                observed.disconnected = Some(reason.clone());
                return Err(AsrError::Receive {
                    reason: format!("closed before acknowledgement: {reason}"),
                });
            }
            None => {
                return Err(AsrError::Receive {
                    reason: "listener stopped before acknowledgement".to_string(),
                })
            }
        }
    }
}

async fn with_ack_timeout<F>(timeout: Duration, wait: F) -> Result<(), AsrError>
where
    F: Future<Output = Result<(), AsrError>>,
{
    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(AsrError::Receive {
            reason: format!("no acknowledgement within {} ms", timeout.as_millis()),
        }),
    }
}

/// Collects late results until the server's close arrives or the grace
/// period ends, then stops the listener.
async fn drain(
    events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
    observed: &mut Observed,
    listener: JoinHandle<()>,
    options: &StreamingOptions,
    cancel: &CancellationToken,
) {
    if observed.disconnected.is_none() {
        let collect = async {
            while let Some(event) = events.recv().await {
                if observed.apply(event).is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::timeout(options.close_timeout(), collect) => {}
        }
    }
    listener.abort();
    debug!(
        event = "listener_stopped",
        transcripts = observed.transcripts.len(),
        acknowledged = observed.acknowledged
    );
}

/// Listener task: forwards every inbound message until the receive half ends.
async fn listen<S: MessageChannel>(
    mut receiver: ConnectionReceiver<S>,
    events: mpsc::UnboundedSender<ListenerEvent>,
    sink: Option<mpsc::UnboundedSender<Transcript>>,
) {
    loop {
        let event = match receiver.recv_next().await {
            Ok(ServerMessage::Ack) => ListenerEvent::Ack,
            Ok(message) => match message.into_transcript() {
                Some(transcript) => {
                    debug!(event = "transcript_received", bytes = transcript.raw().len());
                    if let Some(sink) = sink.as_ref() {
                        if sink.send(transcript.clone()).is_err() {
                            warn!(event = "transcript_sink_closed");
                        }
                    }
                    ListenerEvent::Transcript(transcript)
                }
                None => continue,
            },
            Err(err) => {
                let reason = match err {
                    AsrError::Receive { reason } => reason,
                    other => other.to_string(),
                };
                debug!(event = "listener_disconnected", reason = %reason);
                let _ = events.send(ListenerEvent::Disconnected(reason));
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}
