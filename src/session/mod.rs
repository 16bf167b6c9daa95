//! Session controllers.
//!
//! - `batch`: pre-recorded files, one request/response pair per file.
//! - `streaming`: one paced audio source with asynchronous results.
//!
//! Both controllers own their connection for the whole session and close it
//! exactly once on every exit path before returning.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::AsrError;

/// Pre-recorded (batch) session controller.
pub mod batch;
/// Live-simulated streaming session controller.
pub mod streaming;

/// Runs `future` unless `cancel` fires first.
pub(crate) async fn until_cancelled<T, F>(
    cancel: &CancellationToken,
    future: F,
) -> Result<T, AsrError>
where
    F: Future<Output = Result<T, AsrError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AsrError::Cancelled),
        result = future => result,
    }
}

/// Awaits a close request; failures are logged, never surfaced.
pub(crate) async fn close_quietly<F>(close: F)
where
    F: Future<Output = Result<(), AsrError>>,
{
    if let Err(err) = close.await {
        warn!(event = "close_failed", error = %err);
    }
}
