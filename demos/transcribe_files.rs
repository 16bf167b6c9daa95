//! Transcribe pre-recorded WAV files with the hosted API.
//!
//! Before running:
//! - Replace the API key placeholder.
//! - Pass mono WAV files as arguments.
//!
//! `--parallel` opens one connection per file instead of reusing a single
//! connection. Set `RUST_LOG=banafo_asr_sdk=debug` to see per-message traffic.

use std::error::Error;
use std::path::PathBuf;

use banafo_asr_sdk::{
    transcribe_parallel, AsrClient, BatchOptions, BatchSession, WavDecoder,
};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api_key = "REPLACE_WITH_API_KEY".to_string();
    let language = "en-US";

    let mut parallel = false;
    let mut files = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--parallel" {
            parallel = true;
        } else {
            files.push(PathBuf::from(arg));
        }
    }
    if files.is_empty() {
        return Err("usage: transcribe_files [--parallel] <file.wav>...".into());
    }

    let client = AsrClient::hosted(SecretString::new(api_key)).with_language(language);
    let options = BatchOptions::default();

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let report = if parallel {
        transcribe_parallel(&client, &options, WavDecoder, files, &cancel).await?
    } else {
        BatchSession::new(options, WavDecoder)
            .transcribe(&client, &files, &cancel)
            .await?
    };

    for result in report.results {
        println!("{}: {}", result.path.display(), result.transcript.text());
    }

    Ok(())
}
