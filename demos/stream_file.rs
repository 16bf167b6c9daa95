//! Stream a WAV file to an on-premise server at live-capture pace.
//!
//! Before running:
//! - Start the server on `localhost:6006`, or change the address below.
//! - Pass a 16 kHz mono WAV file as the only argument.
//!
//! Results are printed as they arrive. The hosted API works the same way with
//! `AsrClient::hosted` and `StreamingOptions::hosted()`.

use std::error::Error;
use std::path::PathBuf;

use banafo_asr_sdk::{AsrClient, AudioDecoder, StreamingOptions, StreamingSession, WavDecoder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or("usage: stream_file <file.wav>")?;
    let audio = WavDecoder.decode(&path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = AsrClient::local();
        let (sink, mut results) = mpsc::unbounded_channel();
        let session = StreamingSession::new(StreamingOptions::on_premise())
            .with_transcript_sink(sink);

        let printer = tokio::spawn(async move {
            while let Some(transcript) = results.recv().await {
                match transcript.segment() {
                    Some(segment) if segment.is_final() => println!("final: {}", segment.text),
                    Some(segment) if !segment.is_empty() => println!("partial: {}", segment.text),
                    Some(_) => {}
                    None => println!("{}", transcript.raw()),
                }
            }
        });

        let cancel = CancellationToken::new();
        let on_ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_ctrl_c.cancel();
            }
        });

        let report = session.stream(&client, &audio, &cancel).await?;
        drop(session);
        let _ = printer.await;

        println!(
            "chunks={} acknowledged={} text={}",
            report.chunks_sent,
            report.acknowledged,
            report.final_text()
        );

        Ok::<(), Box<dyn Error>>(())
    })
}
