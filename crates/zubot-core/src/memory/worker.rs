//! Background summary worker loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::MemoryPipeline;

/// Spawn the worker: drains queued summary jobs every poll interval and
/// whenever the pipeline is kicked.
pub fn spawn_summary_worker(
    pipeline: Arc<MemoryPipeline>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let poll = Duration::from_secs(pipeline.config().summary_worker_poll_sec.max(1));
    tokio::spawn(async move {
        info!(poll_sec = poll.as_secs(), "Summary worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = pipeline.wait_for_kick() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            pipeline.process_pending_jobs(Utc::now()).await;
        }
        info!("Summary worker stopped");
    })
}
