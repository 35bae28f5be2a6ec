//! Lifecycle event ring buffer and the durable-memory milestone hook.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::memory::{MemoryManager, MemoryPipeline};
use crate::types::{iso, LifecycleEvent};

/// Only these run milestones are persisted to day memory; tool telemetry and
/// internal chatter stay out so summaries keep their signal.
pub const MILESTONE_KINDS: [&str; 6] = [
    "run_queued",
    "run_finished",
    "run_failed",
    "run_blocked",
    "run_waiting",
    "run_resumed",
];

const EVENT_BUFFER_CAP: usize = 500;

/// Shared sink for run lifecycle events: an in-memory ring surfaced through
/// status/metrics plus the milestone path into day memory.
pub struct LifecycleHub {
    events: Mutex<VecDeque<LifecycleEvent>>,
    pipeline: Arc<MemoryPipeline>,
    manager: MemoryManager,
    completion_debounce: Duration,
}

impl LifecycleHub {
    pub fn new(pipeline: Arc<MemoryPipeline>, completion_debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
            pipeline,
            manager: MemoryManager::new(),
            completion_debounce,
        })
    }

    /// Record a run lifecycle event. Milestones also land in day memory.
    pub fn run_event(&self, event_type: &str, profile_id: &str, run_id: &str, detail: &str) {
        if MILESTONE_KINDS.contains(&event_type) {
            let text = format!("{event_type} profile={profile_id} run_id={run_id} {detail}");
            let now = Utc::now();
            if let Err(e) =
                self.pipeline
                    .ingest_event(None, "central_service", "task_agent_event", text.trim(), now)
            {
                tracing::warn!(error = %e, "Failed to persist milestone to day memory");
            }
        }
        self.record(
            "task_agent_event",
            serde_json::json!({
                "event_type": event_type,
                "profile_id": profile_id,
                "run_id": run_id,
                "detail": detail,
            }),
            true,
        );
    }

    /// Record an arbitrary service event into the ring buffer.
    pub fn record(&self, event_type: &str, payload: Value, forward_to_user: bool) {
        let event = LifecycleEvent {
            event_id: format!("tevt_{}", Uuid::new_v4().simple()),
            event_type: event_type.to_string(),
            timestamp: iso(Utc::now()),
            payload,
            forward_to_user,
            forwarded: false,
        };
        let mut events = self.events.lock().unwrap();
        events.push_back(event);
        while events.len() > EVENT_BUFFER_CAP {
            events.pop_front();
        }
    }

    /// Debounced sweep triggered when a run reaches a terminal state.
    pub fn on_run_completed(&self) {
        if let Some(enqueued) = self
            .manager
            .maybe_completion_sweep(&self.pipeline, self.completion_debounce)
        {
            if enqueued > 0 {
                self.record(
                    "memory_manager_sweep",
                    serde_json::json!({"enqueued": enqueued, "trigger": "completion"}),
                    false,
                );
            }
        }
    }

    /// Heartbeat-driven sweep.
    pub fn maybe_periodic_sweep(&self, interval: Duration) {
        if let Some(enqueued) = self.manager.maybe_periodic_sweep(&self.pipeline, interval) {
            if enqueued > 0 {
                self.record(
                    "memory_manager_sweep",
                    serde_json::json!({"enqueued": enqueued, "trigger": "periodic"}),
                    false,
                );
            }
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<LifecycleEvent> {
        let events = self.events.lock().unwrap();
        let safe_limit = limit.clamp(1, 200);
        events
            .iter()
            .rev()
            .take(safe_limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Events pending delivery to the user surface; `consume` marks them
    /// forwarded.
    pub fn drain_forwardable(&self, consume: bool) -> Vec<LifecycleEvent> {
        let mut events = self.events.lock().unwrap();
        let mut out = Vec::new();
        for event in events.iter_mut() {
            if !event.forward_to_user || event.forwarded {
                continue;
            }
            out.push(event.clone());
            if consume {
                event.forwarded = true;
            }
        }
        out
    }

    pub fn buffer_len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn pipeline(&self) -> &Arc<MemoryPipeline> {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::store::CoreStore;

    fn hub() -> Arc<LifecycleHub> {
        let store = Arc::new(CoreStore::open_in_memory().unwrap());
        let pipeline = MemoryPipeline::new(
            store,
            MemoryConfig {
                realtime_summary_turn_threshold: 100,
                ..Default::default()
            },
        );
        LifecycleHub::new(pipeline, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_milestones_reach_day_memory() {
        let hub = hub();
        hub.run_event("run_queued", "echo", "trun_1", "trigger=manual");
        hub.run_event("run_finished", "echo", "trun_1", "status=done");
        // Not a milestone: stays out of durable memory.
        hub.run_event("run_started", "echo", "trun_1", "started");

        let day = MemoryPipeline::day_for(Utc::now());
        let events = hub.pipeline().store().list_day_raw_events(&day).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].text.starts_with("run_queued"));

        // All three land in the ring buffer.
        assert_eq!(hub.recent(10).len(), 3);
    }

    #[tokio::test]
    async fn test_drain_forwardable_consumes() {
        let hub = hub();
        hub.run_event("run_failed", "echo", "trun_1", "error=boom");
        hub.record("internal", serde_json::json!({}), false);

        let drained = hub.drain_forwardable(true);
        assert_eq!(drained.len(), 1);
        assert!(hub.drain_forwardable(true).is_empty());
    }

    #[tokio::test]
    async fn test_ring_buffer_cap() {
        let hub = hub();
        for i in 0..600 {
            hub.record("noise", serde_json::json!({"i": i}), false);
        }
        assert_eq!(hub.buffer_len(), EVENT_BUFFER_CAP);
    }
}
