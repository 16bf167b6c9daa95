use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use banafo_asr_sdk::ws::proto::{FrameHeader, FRAME_HEADER_LEN};
use banafo_asr_sdk::{
    transcribe_parallel, AsrClient, AsrError, AudioBuffer, BatchOptions, BatchSession,
    SessionPhase, StreamingOptions, StreamingSession, WavDecoder,
};
use hound::{SampleFormat, WavSpec, WavWriter};
use secrecy::SecretString;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_API_KEY: &str = "test-api-key";
const NORMAL_CLOSURE: u16 = 1000;

#[derive(Clone, Copy, Debug)]
enum Scenario {
    Batch,
    Streaming {
        ack: bool,
        close_after: Option<usize>,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Frame {
    Binary(usize),
    Text(String),
    Close(Option<u16>),
    Replied { sample_rate: u32, payload_len: u32 },
    Acked,
    ServerClosed,
}

#[derive(Debug)]
struct Observed {
    query: Option<String>,
    frames: Vec<Frame>,
}

#[derive(Clone)]
struct MockState {
    scenario: Scenario,
    observed_tx: mpsc::UnboundedSender<Observed>,
}

struct MockServer {
    addr: SocketAddr,
    observed_rx: mpsc::UnboundedReceiver<Observed>,
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    async fn start(scenario: Scenario) -> Self {
        let (observed_tx, observed_rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/", get(transcripts_handler))
            .route("/transcripts", get(transcripts_handler))
            .with_state(MockState {
                scenario,
                observed_tx,
            });
        let (addr, shutdown_tx, task) = spawn_server(app).await;
        Self {
            addr,
            observed_rx,
            shutdown_tx,
            task,
        }
    }

    fn hosted_client(&self, api_key: &str) -> AsrClient {
        AsrClient::hosted(SecretString::new(api_key.to_string()))
            .with_endpoint(format!("ws://{}/transcripts", self.addr))
    }

    async fn next_connection(&mut self) -> Observed {
        timeout(Duration::from_secs(5), self.observed_rx.recv())
            .await
            .expect("timed out waiting for mock connection to finish")
            .expect("mock observation channel closed")
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        self.task.await.expect("mock ws server task should join");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_session_sends_files_in_turn_then_one_sentinel() {
    let dir = TempDir::new().expect("tempdir");
    let first = write_wav(&dir, "first.wav", 16_000, 1_000);
    let second = write_wav(&dir, "second.wav", 8_000, 2_000);

    let mut server = MockServer::start(Scenario::Batch).await;
    let session = BatchSession::new(
        BatchOptions {
            max_message_bytes: 1_000,
            ..BatchOptions::default()
        },
        WavDecoder,
    );

    let report = session
        .transcribe(
            &server.hosted_client(TEST_API_KEY),
            &[&first, &second],
            &CancellationToken::new(),
        )
        .await
        .expect("batch session should complete");

    let texts: Vec<_> = report
        .results
        .iter()
        .map(|result| result.transcript.text())
        .collect();
    assert_eq!(
        texts,
        vec!["1000 samples at 16000 Hz", "2000 samples at 8000 Hz"]
    );
    assert_eq!(report.results[0].path, first);
    assert_eq!(report.results[1].sample_rate, 8_000);

    let observed = server.next_connection().await;
    assert_eq!(
        observed.query.as_deref(),
        Some("apiKey=test-api-key&languageCode=en-US")
    );

    // 4008 bytes for the first file and 8008 for the second, cut at 1000.
    let mut expected = vec![Frame::Binary(1_000); 4];
    expected.push(Frame::Binary(8));
    expected.push(Frame::Replied {
        sample_rate: 16_000,
        payload_len: 4_000,
    });
    expected.extend(vec![Frame::Binary(1_000); 8]);
    expected.push(Frame::Binary(8));
    expected.push(Frame::Replied {
        sample_rate: 8_000,
        payload_len: 8_000,
    });
    expected.push(Frame::Text("Done".to_string()));
    expected.push(Frame::Close(Some(NORMAL_CLOSURE)));
    assert_eq!(observed.frames, expected);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_decode_failure_stops_before_next_file() {
    let mut server = MockServer::start(Scenario::Batch).await;
    let decoder = |path: &Path| -> Result<AudioBuffer, AsrError> {
        if path.ends_with("b.wav") {
            return Err(AsrError::UnsupportedFormat("expected 1 channel, got 2".to_string()));
        }
        Ok(AudioBuffer::new(vec![0.25; 100], 16_000))
    };
    let session = BatchSession::new(BatchOptions::default(), decoder);

    let err = session
        .transcribe(
            &server.hosted_client(TEST_API_KEY),
            &["a.wav", "b.wav", "c.wav"],
            &CancellationToken::new(),
        )
        .await
        .expect_err("second file must fail to decode");
    assert_eq!(err.phase, SessionPhase::Decoding);
    assert_eq!(err.file.as_deref(), Some(Path::new("b.wav")));
    assert!(matches!(err.source, AsrError::UnsupportedFormat(_)), "{err:?}");

    let observed = server.next_connection().await;
    assert_eq!(
        observed.frames,
        vec![
            Frame::Binary(FRAME_HEADER_LEN + 400),
            Frame::Replied {
                sample_rate: 16_000,
                payload_len: 400,
            },
            Frame::Close(Some(NORMAL_CLOSURE)),
        ]
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_handshake_is_reported_as_connection_error() {
    let server = MockServer::start(Scenario::Batch).await;
    let session = BatchSession::new(BatchOptions::default(), WavDecoder);

    let err = session
        .transcribe(
            &server.hosted_client("wrong-key"),
            &["unused.wav"],
            &CancellationToken::new(),
        )
        .await
        .expect_err("handshake must be refused");
    assert_eq!(err.phase, SessionPhase::Connecting);
    match err.source {
        AsrError::Connection { reason } => assert!(reason.contains("401"), "{reason}"),
        other => panic!("expected connection error, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_runner_keeps_input_order() {
    let dir = TempDir::new().expect("tempdir");
    let files = vec![
        write_wav(&dir, "one.wav", 16_000, 300),
        write_wav(&dir, "two.wav", 16_000, 100),
        write_wav(&dir, "three.wav", 16_000, 200),
    ];

    let mut server = MockServer::start(Scenario::Batch).await;
    let options = BatchOptions {
        max_concurrent_connections: 2,
        ..BatchOptions::default()
    };

    let report = transcribe_parallel(
        &server.hosted_client(TEST_API_KEY),
        &options,
        WavDecoder,
        files.clone(),
        &CancellationToken::new(),
    )
    .await
    .expect("parallel batch should complete");

    let paths: Vec<_> = report.results.iter().map(|r| r.path.clone()).collect();
    assert_eq!(paths, files);
    let samples: Vec<_> = report.results.iter().map(|r| r.samples).collect();
    assert_eq!(samples, vec![300, 100, 200]);

    for _ in 0..3 {
        let observed = server.next_connection().await;
        let tail = &observed.frames[observed.frames.len() - 2..];
        assert_eq!(
            tail,
            [
                Frame::Text("Done".to_string()),
                Frame::Close(Some(NORMAL_CLOSURE))
            ]
        );
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_runner_surfaces_first_failure() {
    let dir = TempDir::new().expect("tempdir");
    let missing = dir.path().join("missing.wav");
    let files = vec![write_wav(&dir, "ok.wav", 16_000, 100), missing.clone()];

    let server = MockServer::start(Scenario::Batch).await;
    let err = transcribe_parallel(
        &server.hosted_client(TEST_API_KEY),
        &BatchOptions::default(),
        WavDecoder,
        files,
        &CancellationToken::new(),
    )
    .await
    .expect_err("missing file must fail");

    assert_eq!(err.file.as_deref(), Some(missing.as_path()));
    assert!(matches!(err.source, AsrError::Io(_)), "{err:?}");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_session_paces_chunks_and_collects_results() {
    let mut server = MockServer::start(Scenario::Streaming {
        ack: false,
        close_after: None,
    })
    .await;
    let options = StreamingOptions {
        close_timeout_ms: 1_000,
        ..StreamingOptions::hosted().with_pacing(4_000, 0.01)
    };
    let audio = AudioBuffer::new(vec![0.5; 10_000], 16_000);

    let report = StreamingSession::new(options)
        .stream(
            &server.hosted_client(TEST_API_KEY),
            &audio,
            &CancellationToken::new(),
        )
        .await
        .expect("streaming session should complete");
    assert_eq!(report.chunks_sent, 3);
    assert!(!report.acknowledged);
    assert_eq!(report.final_text(), "chunk 0 chunk 1 chunk 2");

    let observed = server.next_connection().await;
    assert_eq!(
        observed.query.as_deref(),
        Some("apiKey=test-api-key&languageCode=en-US&endpoints=true")
    );
    assert_eq!(
        observed.frames,
        vec![
            Frame::Binary(16_000),
            Frame::Binary(16_000),
            Frame::Binary(8_000),
            Frame::Text("Done".to_string()),
            Frame::Close(Some(NORMAL_CLOSURE)),
        ]
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn on_premise_streaming_waits_for_ack_before_closing() {
    let mut server = MockServer::start(Scenario::Streaming {
        ack: true,
        close_after: None,
    })
    .await;
    let client = AsrClient::on_premise("127.0.0.1", server.addr.port());
    let options = StreamingOptions::on_premise().with_pacing(8_000, 0.0);
    let audio = AudioBuffer::new(vec![0.0; 8_000], 16_000);

    let report = StreamingSession::new(options)
        .stream(&client, &audio, &CancellationToken::new())
        .await
        .expect("streaming session should complete");
    assert!(report.acknowledged);

    let observed = server.next_connection().await;
    assert_eq!(observed.query, None);
    assert_eq!(
        observed.frames,
        vec![
            Frame::Binary(32_000),
            Frame::Text("Done".to_string()),
            Frame::Acked,
            Frame::Close(Some(NORMAL_CLOSURE)),
        ]
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_server_close_mid_pacing_is_a_connection_error() {
    let mut server = MockServer::start(Scenario::Streaming {
        ack: false,
        close_after: Some(1),
    })
    .await;
    let options = StreamingOptions::default().with_pacing(8_000, 0.2);
    let audio = AudioBuffer::new(vec![0.0; 8_000 * 5], 16_000);

    let err = StreamingSession::new(options)
        .stream(
            &server.hosted_client(TEST_API_KEY),
            &audio,
            &CancellationToken::new(),
        )
        .await
        .expect_err("server closed mid-stream");
    assert_eq!(err.phase, SessionPhase::Streaming);
    match &err.source {
        AsrError::Connection { reason } => assert!(reason.contains("1011"), "{reason}"),
        other => panic!("expected connection error, got {other:?}"),
    }

    let observed = server.next_connection().await;
    let closed_at = observed
        .frames
        .iter()
        .position(|frame| *frame == Frame::ServerClosed)
        .expect("server closed the connection");
    assert_eq!(observed.frames[..closed_at], [Frame::Binary(32_000)]);
    assert!(observed.frames[closed_at..]
        .iter()
        .all(|frame| !matches!(frame, Frame::Binary(_) | Frame::Text(_))));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_streaming_closes_without_sentinel() {
    let mut server = MockServer::start(Scenario::Streaming {
        ack: false,
        close_after: None,
    })
    .await;
    let options = StreamingOptions::default().with_pacing(8_000, 10.0);
    let audio = AudioBuffer::new(vec![0.0; 8_000 * 3], 16_000);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = timeout(
        Duration::from_secs(5),
        StreamingSession::new(options).stream(
            &server.hosted_client(TEST_API_KEY),
            &audio,
            &cancel,
        ),
    )
    .await
    .expect("cancellation must interrupt pacing")
    .expect_err("session was cancelled");
    assert!(err.is_cancelled(), "{err:?}");

    let observed = server.next_connection().await;
    assert_eq!(
        observed.frames,
        vec![Frame::Binary(32_000), Frame::Close(Some(NORMAL_CLOSURE))]
    );

    server.stop().await;
}

#[tokio::test]
async fn streaming_rejects_wrong_sample_rate_before_connecting() {
    let client = AsrClient::on_premise("127.0.0.1", 9);
    let audio = AudioBuffer::new(vec![0.0; 8_000], 8_000);

    let err = StreamingSession::new(StreamingOptions::default())
        .stream(&client, &audio, &CancellationToken::new())
        .await
        .expect_err("8 kHz audio is rejected");
    assert_eq!(err.phase, SessionPhase::Configuring);
    assert!(matches!(err.source, AsrError::UnsupportedFormat(_)));
}

async fn transcripts_handler(
    State(state): State<MockState>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = match query.as_deref() {
        Some(query) => query
            .split('&')
            .any(|pair| pair == format!("apiKey={TEST_API_KEY}")),
        None => true,
    };
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let frames = match state.scenario {
            Scenario::Batch => run_batch(socket).await,
            Scenario::Streaming { ack, close_after } => {
                run_streaming(socket, ack, close_after).await
            }
        };
        let _ = state.observed_tx.send(Observed { query, frames });
    })
}

async fn run_batch(mut socket: WebSocket) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(bytes) => {
                frames.push(Frame::Binary(bytes.len()));
                pending.extend_from_slice(&bytes);
                let Some(header) = FrameHeader::parse(&pending) else {
                    continue;
                };
                let total = FRAME_HEADER_LEN + header.payload_len as usize;
                if pending.len() < total {
                    continue;
                }
                pending.drain(..total);
                let reply = json!({
                    "text": format!(
                        "{} samples at {} Hz",
                        header.payload_len / 4,
                        header.sample_rate
                    )
                });
                if socket.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
                frames.push(Frame::Replied {
                    sample_rate: header.sample_rate,
                    payload_len: header.payload_len,
                });
            }
            Message::Text(text) => frames.push(Frame::Text(text)),
            Message::Close(frame) => {
                frames.push(Frame::Close(frame.map(|frame| frame.code)));
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    frames
}

async fn run_streaming(
    mut socket: WebSocket,
    ack: bool,
    close_after: Option<usize>,
) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut chunks = 0usize;
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(bytes) => {
                frames.push(Frame::Binary(bytes.len()));
                let result = json!({
                    "segment": chunks,
                    "type": "final",
                    "text": format!("chunk {chunks}"),
                });
                chunks += 1;
                if close_after == Some(chunks) {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: 1011,
                            reason: "overloaded".into(),
                        })))
                        .await;
                    frames.push(Frame::ServerClosed);
                    continue;
                }
                let _ = socket.send(Message::Text(result.to_string())).await;
            }
            Message::Text(text) => {
                let sentinel = text == "Done";
                frames.push(Frame::Text(text));
                if sentinel && ack {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if socket.send(Message::Text("Done!".to_string())).await.is_ok() {
                        frames.push(Frame::Acked);
                    }
                }
            }
            Message::Close(frame) => {
                frames.push(Frame::Close(frame.map(|frame| frame.code)));
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    frames
}

fn write_wav(dir: &TempDir, name: &str, sample_rate: u32, samples: usize) -> PathBuf {
    let path = dir.path().join(name);
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&path, spec).expect("create wav fixture");
    for index in 0..samples {
        writer
            .write_sample((index % 256) as i16 * 64)
            .expect("write wav sample");
    }
    writer.finalize().expect("finalize wav fixture");
    path
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
