//! Day-memory ingestion and the asynchronous summary pipeline.

mod manager;
mod summary;
mod worker;

pub use manager::MemoryManager;
pub use summary::{estimate_tokens, summarize_events, DaySummarizer};
pub use worker::spawn_summary_worker;

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::Result as SqliteResult;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::store::CoreStore;
use crate::types::DayStatus;

/// Result of one summary-worker tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SummaryTickResult {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Ingestion plus job-queue frontend for day memory. Shared by the service,
/// the dispatcher's lifecycle hook, and the background worker.
pub struct MemoryPipeline {
    store: Arc<CoreStore>,
    config: MemoryConfig,
    summarizer: RwLock<Option<Arc<dyn DaySummarizer>>>,
    wake: Notify,
    last_result: Mutex<Option<SummaryTickResult>>,
}

impl MemoryPipeline {
    pub fn new(store: Arc<CoreStore>, config: MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            summarizer: RwLock::new(None),
            wake: Notify::new(),
            last_result: Mutex::new(None),
        })
    }

    /// Install the model-backed summarizer (used only when
    /// `daily_summary_use_model` is enabled).
    pub fn set_summarizer(&self, summarizer: Arc<dyn DaySummarizer>) {
        *self.summarizer.write().unwrap() = Some(summarizer);
    }

    pub fn kick(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn wait_for_kick(&self) {
        self.wake.notified().await;
    }

    pub fn last_result(&self) -> Option<SummaryTickResult> {
        self.last_result.lock().unwrap().clone()
    }

    /// Day key for an instant (UTC calendar date).
    pub fn day_for(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    /// Append one raw event: bumps counters and, past the realtime
    /// threshold, enqueues a (deduped) summary job and kicks the worker.
    pub fn ingest_event(
        &self,
        day: Option<&str>,
        session_id: &str,
        kind: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> SqliteResult<DayStatus> {
        let day_key = day
            .map(|d| d.to_string())
            .unwrap_or_else(|| Self::day_for(now));
        let status = self
            .store
            .ingest_raw_event(&day_key, session_id, kind, text, now)?;

        if status.messages_since_last_summary >= self.config.realtime_summary_turn_threshold {
            let (job_id, deduped) =
                self.store
                    .enqueue_summary_job(&day_key, "realtime_threshold", now)?;
            if !deduped {
                debug!(day = %day_key, job_id, "Enqueued realtime summary job");
            }
            self.kick();
        }
        Ok(status)
    }

    /// Explicitly request a summary of a day.
    pub fn trigger_summary(
        &self,
        day: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SqliteResult<(i64, bool)> {
        let out = self.store.enqueue_summary_job(day, reason, now)?;
        self.kick();
        Ok(out)
    }

    /// Claim and process up to `summary_worker_max_jobs_per_tick` jobs.
    pub async fn process_pending_jobs(&self, now: DateTime<Utc>) -> SummaryTickResult {
        let mut result = SummaryTickResult::default();
        let today = Self::day_for(now);

        while result.processed < self.config.summary_worker_max_jobs_per_tick.max(1) {
            let claimed = match self.store.claim_next_summary_job(now) {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to claim summary job");
                    break;
                }
            };
            result.processed += 1;
            // Successful summary of a prior day finalizes it.
            let finalize = claimed.day < today;
            match self
                .summarize_day(&claimed.day, &format!("queued:{}", claimed.reason), finalize, now)
                .await
            {
                Ok(_) => {
                    let _ = self
                        .store
                        .complete_summary_job(claimed.job_id, true, None, now);
                    result.completed += 1;
                }
                Err(e) => {
                    warn!(day = %claimed.day, error = %e, "Summary job failed");
                    let _ = self.store.complete_summary_job(
                        claimed.job_id,
                        false,
                        Some(&e.to_string()),
                        now,
                    );
                    result.failed += 1;
                }
            }
        }

        *self.last_result.lock().unwrap() = Some(result.clone());
        result
    }

    /// Summarize one day from its raw transcript and replace the snapshot.
    pub async fn summarize_day(
        &self,
        day: &str,
        reason: &str,
        finalize: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let events = self.store.list_day_raw_events(day)?;
        let model = if self.config.daily_summary_use_model {
            self.summarizer.read().unwrap().clone()
        } else {
            None
        };
        let summary = summarize_events(&events, model.as_deref()).await;
        let snapshot = format!(
            "- Summary reason: {reason}\n- Day event entries: {}\n{summary}",
            events.len()
        );
        self.store
            .replace_day_summary(day, &snapshot, events.len() as i64, now)?;
        self.store.mark_day_summarized(day, finalize, now)?;
        Ok(summary)
    }

    /// Days before `today` still owing a summary; used by the sweeps.
    pub fn sweep_pending_prior_days(&self, now: DateTime<Utc>) -> SqliteResult<usize> {
        let today = Self::day_for(now);
        let pending = self.store.days_pending_summary(Some(&today))?;
        let mut enqueued = 0;
        for status in pending.iter().filter(|s| !s.is_finalized) {
            let (_, deduped) = self
                .store
                .enqueue_summary_job(&status.day, "memory_manager_sweep", now)?;
            if !deduped {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            self.kick();
        }
        Ok(enqueued)
    }

    pub fn store(&self) -> &Arc<CoreStore> {
        &self.store
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn recent_summaries(&self, limit: usize) -> SqliteResult<Vec<crate::types::DaySummary>> {
        self.store.list_recent_summaries(limit)
    }

    /// Status payload for observability surfaces.
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "poll_interval_sec": self.config.summary_worker_poll_sec,
            "max_jobs_per_tick": self.config.summary_worker_max_jobs_per_tick,
            "use_model": self.config.daily_summary_use_model,
            "model_installed": self.summarizer.read().unwrap().is_some(),
            "last_result": self.last_result(),
        })
    }
}
