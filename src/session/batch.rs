//! Pre-recorded transcription over one connection.
//!
//! Files are sent strictly one after another: the whole framed file goes
//! out, exactly one result comes back, then the next file starts. The
//! `Done` sentinel follows the last result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::AudioDecoder;
use crate::config::BatchOptions;
use crate::error::{AsrError, SessionError, SessionPhase};
use crate::session::{close_quietly, until_cancelled};
use crate::ws::client::{AsrClient, Connection, MessageChannel, SessionMode, NORMAL_CLOSURE};
use crate::ws::proto::{frame_batch, ClientMessage, ServerMessage, Transcript};

/// Result for one input file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileTranscript {
    /// Input file as given by the caller.
    pub path: PathBuf,
    /// Sample rate announced in the frame header.
    pub sample_rate: u32,
    /// Number of decoded samples sent.
    pub samples: usize,
    /// The server's single result for this file.
    pub transcript: Transcript,
}

/// Results of a completed batch session, in input order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    /// One entry per input file.
    pub results: Vec<FileTranscript>,
}

/// Drives the pre-recorded protocol.
#[derive(Clone, Debug)]
pub struct BatchSession<D> {
    options: BatchOptions,
    decoder: D,
}

impl<D: AudioDecoder> BatchSession<D> {
    /// Creates a session decoding input files with `decoder`.
    pub fn new(options: BatchOptions, decoder: D) -> Self {
        Self { options, decoder }
    }

    /// Options this session runs with.
    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Opens a pre-recorded connection on `client` and transcribes `files`.
    pub async fn transcribe<P: AsRef<Path>>(
        &self,
        client: &AsrClient,
        files: &[P],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, SessionError> {
        self.check()?;

        let connection = until_cancelled(cancel, client.connect(SessionMode::PreRecorded, None))
            .await
            .map_err(|err| SessionError::new(SessionPhase::Connecting, err))?;

        self.run_checked(connection, files, cancel).await
    }

    /// Transcribes `files` over an already-opened connection.
    ///
    /// The connection is closed before this returns, whatever the outcome.
    /// The first failure aborts the remaining files.
    pub async fn run<S, P>(
        &self,
        mut connection: Connection<S>,
        files: &[P],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, SessionError>
    where
        S: MessageChannel,
        P: AsRef<Path>,
    {
        if let Err(err) = self.check() {
            close_quietly(connection.close(NORMAL_CLOSURE)).await;
            return Err(err);
        }
        self.run_checked(connection, files, cancel).await
    }

    fn check(&self) -> Result<(), SessionError> {
        self.options
            .validate()
            .map_err(|err| SessionError::new(SessionPhase::Configuring, err))
    }

    async fn run_checked<S, P>(
        &self,
        mut connection: Connection<S>,
        files: &[P],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, SessionError>
    where
        S: MessageChannel,
        P: AsRef<Path>,
    {
        let result = self.run_files(&mut connection, files, cancel).await;
        close_quietly(connection.close(NORMAL_CLOSURE)).await;
        debug!(event = "connection_closed", ok = result.is_ok());
        result
    }

    async fn run_files<S, P>(
        &self,
        connection: &mut Connection<S>,
        files: &[P],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, SessionError>
    where
        S: MessageChannel,
        P: AsRef<Path>,
    {
        let mut report = BatchReport::default();
        for (index, file) in files.iter().enumerate() {
            let path = file.as_ref();
            let result = self.transcribe_one(connection, path, index, cancel).await?;
            report.results.push(result);
        }

        until_cancelled(cancel, connection.send(ClientMessage::Done))
            .await
            .map_err(|err| SessionError::new(SessionPhase::Finalizing, err))?;
        info!(event = "sentinel_sent", files = report.results.len());

        Ok(report)
    }

    async fn transcribe_one<S: MessageChannel>(
        &self,
        connection: &mut Connection<S>,
        path: &Path,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<FileTranscript, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::for_file(
                SessionPhase::Decoding,
                path,
                AsrError::Cancelled,
            ));
        }

        let audio = self
            .decoder
            .decode(path)
            .map_err(|err| SessionError::for_file(SessionPhase::Decoding, path, err))?;

        let messages = frame_batch(
            audio.samples(),
            audio.sample_rate(),
            self.options.max_message_bytes,
        )
        .map_err(|err| SessionError::for_file(SessionPhase::SendingFile, path, err))?;

        info!(
            event = "file_sending",
            path = %path.display(),
            index,
            samples = audio.len(),
            sample_rate = audio.sample_rate(),
            messages = messages.len()
        );

        for message in messages {
            let bytes = message.len();
            until_cancelled(cancel, connection.send(ClientMessage::Audio(message)))
                .await
                .map_err(|err| SessionError::for_file(SessionPhase::SendingFile, path, err))?;
            debug!(event = "message_sent", index, bytes);
        }

        let reply = until_cancelled(cancel, connection.recv_next())
            .await
            .map_err(|err| SessionError::for_file(SessionPhase::AwaitingResult, path, err))?;
        let transcript = match reply {
            ServerMessage::Ack => {
                return Err(SessionError::for_file(
                    SessionPhase::AwaitingResult,
                    path,
                    AsrError::Receive {
                        reason: "acknowledgement received instead of a result".to_string(),
                    },
                ))
            }
            other => other.into_transcript(),
        };
        let Some(transcript) = transcript else {
            return Err(SessionError::for_file(
                SessionPhase::AwaitingResult,
                path,
                AsrError::Receive {
                    reason: "empty result".to_string(),
                },
            ));
        };

        info!(
            event = "file_transcribed",
            path = %path.display(),
            index,
            result_bytes = transcript.raw().len()
        );

        Ok(FileTranscript {
            path: path.to_path_buf(),
            sample_rate: audio.sample_rate(),
            samples: audio.len(),
            transcript,
        })
    }
}

/// Transcribes every file over its own connection, several at a time.
///
/// Each connection carries one file, one result and the sentinel. At most
/// `options.max_concurrent_connections` are open at once. Results keep the
/// input order. The first failure cancels the sessions still running and is
/// returned once all of them have closed their connections.
pub async fn transcribe_parallel<D>(
    client: &AsrClient,
    options: &BatchOptions,
    decoder: D,
    files: Vec<PathBuf>,
    cancel: &CancellationToken,
) -> Result<BatchReport, SessionError>
where
    D: AudioDecoder + 'static,
{
    options
        .validate()
        .map_err(|err| SessionError::new(SessionPhase::Configuring, err))?;

    let session = Arc::new(BatchSession::new(options.clone(), decoder));
    let limit = Arc::new(Semaphore::new(options.max_concurrent_connections));
    let abort = cancel.child_token();
    let file_count = files.len();

    let mut tasks = JoinSet::new();
    for (index, path) in files.into_iter().enumerate() {
        let session = Arc::clone(&session);
        let limit = Arc::clone(&limit);
        let client = client.clone();
        let abort = abort.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await.map_err(|_| {
                SessionError::for_file(SessionPhase::Connecting, &path, AsrError::Cancelled)
            })?;
            let report = session
                .transcribe(&client, std::slice::from_ref(&path), &abort)
                .await?;
            Ok::<_, SessionError>((index, report))
        });
    }

    let mut slots: Vec<Option<FileTranscript>> = (0..file_count).map(|_| None).collect();
    let mut failure: Option<SessionError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((index, report))) => {
                slots[index] = report.results.into_iter().next();
            }
            Ok(Err(err)) => {
                if failure.is_none() {
                    abort.cancel();
                    failure = Some(err);
                }
            }
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                failure.get_or_insert(SessionError::new(
                    SessionPhase::Connecting,
                    AsrError::Connection {
                        reason: format!("session task stopped: {err}"),
                    },
                ));
            }
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }

    Ok(BatchReport {
        results: slots.into_iter().flatten().collect(),
    })
}
