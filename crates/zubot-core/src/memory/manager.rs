//! Periodic and completion-debounced summary sweeps.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::MemoryPipeline;

/// Gates the sweeps on a monotonic clock so neither run-completion bursts
/// nor frequent heartbeats turn into repeated full sweeps.
#[derive(Default)]
pub struct MemoryManager {
    inner: Mutex<SweepClocks>,
}

#[derive(Default)]
struct SweepClocks {
    last_sweep: Option<Instant>,
    last_completion_sweep: Option<Instant>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heartbeat-driven sweep, at most once per `sweep_interval`.
    pub fn maybe_periodic_sweep(
        &self,
        pipeline: &MemoryPipeline,
        sweep_interval: Duration,
    ) -> Option<usize> {
        let now = Instant::now();
        let mut clocks = self.inner.lock().unwrap();
        if let Some(last) = clocks.last_sweep {
            if now.duration_since(last) < sweep_interval.max(Duration::from_secs(1)) {
                return None;
            }
        }
        clocks.last_sweep = Some(now);
        drop(clocks);
        Some(self.sweep(pipeline))
    }

    /// Run-completion sweep, debounced.
    pub fn maybe_completion_sweep(
        &self,
        pipeline: &MemoryPipeline,
        debounce: Duration,
    ) -> Option<usize> {
        let now = Instant::now();
        let mut clocks = self.inner.lock().unwrap();
        if let Some(last) = clocks.last_completion_sweep {
            if now.duration_since(last) < debounce.max(Duration::from_secs(1)) {
                return None;
            }
        }
        clocks.last_completion_sweep = Some(now);
        clocks.last_sweep = Some(now);
        drop(clocks);
        Some(self.sweep(pipeline))
    }

    fn sweep(&self, pipeline: &MemoryPipeline) -> usize {
        match pipeline.sweep_pending_prior_days(Utc::now()) {
            Ok(enqueued) => {
                if enqueued > 0 {
                    debug!(enqueued, "Memory sweep enqueued summary jobs");
                }
                enqueued
            }
            Err(e) => {
                warn!(error = %e, "Memory sweep failed");
                0
            }
        }
    }
}
