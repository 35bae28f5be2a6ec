//! Dispatcher: a fixed pool of execution slots over the run queue.
//!
//! Each slot claims the oldest eligible queued run (no-overlap re-checked in
//! the claim), invokes the runner with a cancellation token, and writes the
//! terminal status. A slot whose run parks in `waiting_for_user` is released
//! immediately so interactive holds never starve the pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zubot_runner::{OutcomeStatus, RunSpec, RunnerError, TaskKind, TaskRunner};

use crate::events::LifecycleHub;
use crate::store::CoreStore;
use crate::types::{iso, Run, RunStatus, SlotInfo, SlotResult, SlotState};

/// Idle slots re-poll the queue at this cadence even without a kick.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Shared slot metadata for observability.
pub struct SlotTable {
    slots: RwLock<Vec<SlotInfo>>,
}

impl SlotTable {
    pub fn new(count: usize) -> Arc<Self> {
        let slots = (0..count).map(SlotInfo::free).collect();
        Arc::new(Self {
            slots: RwLock::new(slots),
        })
    }

    pub fn snapshot(&self) -> Vec<SlotInfo> {
        self.slots.read().unwrap().clone()
    }

    fn bind(&self, slot_id: usize, run: &Run) {
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(slot_id) {
            slot.state = SlotState::Busy;
            slot.run_id = Some(run.run_id.clone());
            slot.task_id = Some(run.profile_id.clone());
            slot.started_at = Some(iso(Utc::now()));
        }
    }

    fn release(&self, slot_id: usize, last_result: Option<SlotResult>) {
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(slot_id) {
            slot.state = SlotState::Free;
            slot.run_id = None;
            slot.task_id = None;
            slot.started_at = None;
            if last_result.is_some() {
                slot.last_result = last_result;
            }
        }
    }

    pub fn busy_count(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.state == SlotState::Busy)
            .count()
    }
}

/// Cancellation tokens for in-flight runs, keyed by run id.
#[derive(Default)]
pub struct KillRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl KillRegistry {
    fn register(&self, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap()
            .insert(run_id.to_string(), token.clone());
        token
    }

    fn remove(&self, run_id: &str) {
        self.tokens.lock().unwrap().remove(run_id);
    }

    /// Signal an in-flight run; returns false when no slot holds it.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.tokens.lock().unwrap().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Result of a kill request.
#[derive(Debug, Clone, Serialize)]
pub struct KillOutcome {
    pub run_id: String,
    pub status: String,
    pub already_terminal: bool,
    pub cancel_requested: bool,
}

pub struct Dispatcher {
    store: Arc<CoreStore>,
    runner: Arc<TaskRunner>,
    slots: Arc<SlotTable>,
    kills: Arc<KillRegistry>,
    hub: Arc<LifecycleHub>,
    wake: Notify,
    concurrency: usize,
    /// Fallback waiting deadline for contracts without a usable expiry.
    waiting_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<CoreStore>,
        runner: Arc<TaskRunner>,
        hub: Arc<LifecycleHub>,
        concurrency: usize,
        waiting_timeout: Duration,
    ) -> Arc<Self> {
        let concurrency = concurrency.max(1);
        Arc::new(Self {
            store,
            runner,
            slots: SlotTable::new(concurrency),
            kills: Arc::new(KillRegistry::default()),
            hub,
            wake: Notify::new(),
            concurrency,
            waiting_timeout,
        })
    }

    /// Kick idle slots; called after enqueue, trigger, and resume.
    pub fn kick(&self) {
        self.wake.notify_waiters();
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn one worker per slot. Workers stop at the next suspension point
    /// after `cancel` fires.
    pub fn spawn_slots(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|slot_id| {
                let dispatcher = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    dispatcher.slot_loop(slot_id, cancel).await;
                })
            })
            .collect()
    }

    async fn slot_loop(self: Arc<Self>, slot_id: usize, cancel: CancellationToken) {
        debug!(slot_id, "Dispatcher slot started");
        loop {
            // Drain the queue, then sleep until kicked or the poll elapses.
            loop {
                if cancel.is_cancelled() {
                    debug!(slot_id, "Dispatcher slot stopped");
                    return;
                }
                let claimed = match self.store.claim_next_run(Utc::now()) {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        error!(slot_id, error = %e, "Run claim failed");
                        None
                    }
                };
                match claimed {
                    Some(run) => self.execute_claimed(slot_id, run).await,
                    None => break,
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(slot_id, "Dispatcher slot stopped");
                    return;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }

    async fn execute_claimed(&self, slot_id: usize, run: Run) {
        let run_id = run.run_id.clone();
        let profile_id = run.profile_id.clone();
        info!(slot_id, run_id = %run_id, profile_id = %profile_id, "Run started");
        self.hub
            .run_event("run_started", &profile_id, &run_id, "started");
        self.slots.bind(slot_id, &run);

        let spec = match self.build_spec(&run) {
            Ok(spec) => spec,
            Err(reason) => {
                self.finalize(
                    slot_id,
                    &run_id,
                    &profile_id,
                    RunStatus::Failed,
                    None,
                    Some(&reason),
                )
                .await;
                return;
            }
        };

        let token = self.kills.register(&run_id);
        let result = self.runner.run(spec, token).await;
        self.kills.remove(&run_id);

        match result {
            Ok(outcome) if outcome.status == OutcomeStatus::WaitingForUser => {
                let Some(mut contract) = outcome.waiting else {
                    self.finalize(
                        slot_id,
                        &run_id,
                        &profile_id,
                        RunStatus::Failed,
                        None,
                        Some("waiting outcome without contract"),
                    )
                    .await;
                    return;
                };
                if crate::types::parse_iso(&contract.expires_at).is_none() {
                    let deadline = Utc::now()
                        + chrono::Duration::from_std(self.waiting_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
                    contract.expires_at = iso(deadline);
                }
                match self
                    .store
                    .mark_run_waiting(&run_id, &contract, Utc::now())
                {
                    Ok(true) => {
                        info!(run_id = %run_id, request_id = %contract.request_id, "Run waiting for user");
                        self.hub.run_event(
                            "run_waiting",
                            &profile_id,
                            &run_id,
                            &format!("request_id={}", contract.request_id),
                        );
                        // Slot released; the run stays parked in the queue.
                        self.slots.release(
                            slot_id,
                            Some(SlotResult {
                                run_id: run_id.clone(),
                                status: RunStatus::WaitingForUser,
                                finished_at: iso(Utc::now()),
                            }),
                        );
                    }
                    Ok(false) | Err(_) => {
                        self.finalize(
                            slot_id,
                            &run_id,
                            &profile_id,
                            RunStatus::Failed,
                            None,
                            Some("failed to persist waiting contract"),
                        )
                        .await;
                    }
                }
            }
            Ok(outcome) => {
                let status = match outcome.status {
                    OutcomeStatus::Done => RunStatus::Done,
                    OutcomeStatus::Blocked => RunStatus::Blocked,
                    _ => RunStatus::Failed,
                };
                self.finalize(
                    slot_id,
                    &run_id,
                    &profile_id,
                    status,
                    outcome.summary.as_deref(),
                    outcome.error.as_deref(),
                )
                .await;
            }
            Err(RunnerError::Cancelled) => {
                self.finalize(
                    slot_id,
                    &run_id,
                    &profile_id,
                    RunStatus::Blocked,
                    None,
                    Some("killed"),
                )
                .await;
            }
            Err(RunnerError::Timeout(_)) => {
                self.finalize(
                    slot_id,
                    &run_id,
                    &profile_id,
                    RunStatus::Failed,
                    None,
                    Some("timeout"),
                )
                .await;
            }
            Err(e) => {
                self.finalize(
                    slot_id,
                    &run_id,
                    &profile_id,
                    RunStatus::Failed,
                    None,
                    Some(&e.to_string()),
                )
                .await;
            }
        }
    }

    async fn finalize(
        &self,
        slot_id: usize,
        run_id: &str,
        profile_id: &str,
        status: RunStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) {
        let now = Utc::now();
        if let Err(e) = self.store.complete_run(run_id, status, summary, error, now) {
            error!(run_id = %run_id, error = %e, "Failed to write terminal run status");
        }

        let event = match status {
            RunStatus::Done => "run_finished",
            RunStatus::Blocked => "run_blocked",
            _ => "run_failed",
        };
        let mut detail = format!("status={}", status.as_str());
        if let Some(summary) = summary {
            detail.push_str(&format!(" summary={}", truncate(summary, 160)));
        }
        if let Some(error) = error {
            detail.push_str(&format!(" error={}", truncate(error, 160)));
        }
        info!(run_id = %run_id, status = status.as_str(), "Run finished");
        self.hub.run_event(event, profile_id, run_id, &detail);
        self.hub.on_run_completed();

        self.slots.release(
            slot_id,
            Some(SlotResult {
                run_id: run_id.to_string(),
                status,
                finished_at: iso(now),
            }),
        );
    }

    fn build_spec(&self, run: &Run) -> Result<RunSpec, String> {
        let profile = self
            .store
            .get_profile(&run.profile_id)
            .map_err(|e| e.to_string())?;

        if let Some(profile) = profile {
            let mut spec = RunSpec::new(&run.run_id, &profile.task_id, profile.kind);
            spec.entrypoint_path = profile.entrypoint_path.clone();
            spec.args = profile.args.clone();
            spec.module = profile.module.clone();
            spec.timeout = Duration::from_secs(profile.timeout_sec.max(1) as u64);
            spec.payload = run.payload.clone();
            return Ok(spec);
        }

        // One-off agentic runs carry their spec inline in the payload.
        if run.payload.get("trigger").and_then(Value::as_str) == Some("agentic") {
            let module = run
                .payload
                .get("module")
                .and_then(Value::as_str)
                .unwrap_or("inline")
                .to_string();
            let timeout_sec = run
                .payload
                .get("timeout_sec")
                .and_then(Value::as_i64)
                .filter(|t| *t > 0)
                .unwrap_or(180);
            let mut spec = RunSpec::new(&run.run_id, &run.profile_id, TaskKind::Agentic);
            spec.module = Some(module);
            spec.timeout = Duration::from_secs(timeout_sec as u64);
            spec.payload = run.payload.clone();
            return Ok(spec);
        }

        Err(format!("unknown task profile `{}`", run.profile_id))
    }

    /// Kill a run in any non-terminal state. Queued and waiting runs
    /// transition directly; running runs are cancelled through their slot.
    pub fn kill_run(&self, run_id: &str) -> anyhow::Result<KillOutcome> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| anyhow::anyhow!("run not found: {run_id}"))?;

        if run.status.is_terminal() {
            return Ok(KillOutcome {
                run_id: run_id.to_string(),
                status: run.status.as_str().to_string(),
                already_terminal: true,
                cancel_requested: false,
            });
        }

        match run.status {
            RunStatus::Queued | RunStatus::WaitingForUser => {
                self.store.complete_run(
                    run_id,
                    RunStatus::Blocked,
                    None,
                    Some("killed"),
                    Utc::now(),
                )?;
                self.hub
                    .run_event("run_blocked", &run.profile_id, run_id, "error=killed");
                self.hub.on_run_completed();
                Ok(KillOutcome {
                    run_id: run_id.to_string(),
                    status: RunStatus::Blocked.as_str().to_string(),
                    already_terminal: false,
                    cancel_requested: false,
                })
            }
            RunStatus::Running => {
                if !self.kills.cancel(run_id) {
                    // The run claims to be running but no slot holds it:
                    // a previous process died mid-flight. Finalize directly.
                    warn!(run_id = %run_id, "No slot holds this run; finalizing as killed");
                    self.store.complete_run(
                        run_id,
                        RunStatus::Blocked,
                        None,
                        Some("killed"),
                        Utc::now(),
                    )?;
                }
                Ok(KillOutcome {
                    run_id: run_id.to_string(),
                    status: RunStatus::Running.as_str().to_string(),
                    already_terminal: false,
                    cancel_requested: true,
                })
            }
            _ => unreachable!("non-terminal statuses handled above"),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::MemoryPipeline;
    use crate::store::test_support::script_profile;
    use serde_json::json;
    use zubot_runner::{FnHandler, RunOutcome, TaskContext, WaitingContract};

    struct Rig {
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
        handles: Vec<JoinHandle<()>>,
    }

    impl Rig {
        fn start(concurrency: usize, register: impl FnOnce(&TaskRunner)) -> Self {
            let store = Arc::new(CoreStore::open_in_memory().unwrap());
            let pipeline = MemoryPipeline::new(
                Arc::clone(&store),
                MemoryConfig {
                    realtime_summary_turn_threshold: 1000,
                    ..Default::default()
                },
            );
            let hub = LifecycleHub::new(pipeline, Duration::from_secs(300));
            let runner = Arc::new(TaskRunner::new(".", std::env::temp_dir().join("zubot-test-logs")));
            register(&runner);
            let dispatcher =
                Dispatcher::new(store, runner, hub, concurrency, Duration::from_secs(3600));
            let cancel = CancellationToken::new();
            let handles = dispatcher.spawn_slots(cancel.clone());
            Self {
                dispatcher,
                cancel,
                handles,
            }
        }

        async fn wait_for_status(&self, run_id: &str, status: RunStatus) -> Run {
            for _ in 0..200 {
                let run = self.dispatcher.store.get_run(run_id).unwrap().unwrap();
                if run.status == status {
                    return run;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("run {run_id} never reached {}", status.as_str());
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.dispatcher.kick();
            for handle in self.handles {
                let _ = handle.await;
            }
        }
    }

    fn agentic_profile(task_id: &str, module: &str) -> crate::types::TaskProfile {
        let mut profile = script_profile(task_id);
        profile.kind = TaskKind::Agentic;
        profile.entrypoint_path = None;
        profile.module = Some(module.to_string());
        profile
    }

    #[tokio::test]
    async fn test_backlog_for_one_profile_runs_sequentially() {
        // S2 execution half: several queued runs for one task complete one
        // at a time even with spare slots.
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (active_h, peak_h) = (Arc::clone(&active), Arc::clone(&peak));

        let rig = Rig::start(3, move |runner| {
            runner.handlers().register(
                "counting",
                FnHandler::new(move |_ctx| {
                    let active = Arc::clone(&active_h);
                    let peak = Arc::clone(&peak_h);
                    async move {
                        let n = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        peak.fetch_max(n, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(RunOutcome::done("ok"))
                    }
                }),
            );
        });
        let store = &rig.dispatcher.store;
        store.upsert_profile(&agentic_profile("backlog", "counting")).unwrap();
        // Simulate a heartbeat backlog: three queued rows for one profile.
        for i in 0..3 {
            store
                .raw_execute(
                    "INSERT INTO task_runs (run_id, schedule_id, profile_id, status, queued_at, payload_json)
                     VALUES (?1, NULL, 'backlog', 'queued', ?2, '{}')",
                    &[json!(format!("trun_{i}")), json!(format!("2026-03-01T12:00:0{i}+00:00"))],
                )
                .unwrap();
        }
        rig.dispatcher.kick();

        for i in 0..3 {
            rig.wait_for_status(&format!("trun_{i}"), RunStatus::Done).await;
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
        rig.stop().await;
    }

    #[tokio::test]
    async fn test_distinct_profiles_run_in_parallel() {
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (active_h, peak_h) = (Arc::clone(&active), Arc::clone(&peak));

        let rig = Rig::start(3, move |runner| {
            runner.handlers().register(
                "counting",
                FnHandler::new(move |_ctx| {
                    let active = Arc::clone(&active_h);
                    let peak = Arc::clone(&peak_h);
                    async move {
                        let n = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        peak.fetch_max(n, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(RunOutcome::done("ok"))
                    }
                }),
            );
        });
        let store = &rig.dispatcher.store;
        for name in ["p1", "p2", "p3"] {
            store.upsert_profile(&agentic_profile(name, "counting")).unwrap();
            store
                .enqueue_run(&format!("trun_{name}"), name, &json!({}), Utc::now())
                .unwrap()
                .unwrap();
        }
        rig.dispatcher.kick();
        for name in ["p1", "p2", "p3"] {
            rig.wait_for_status(&format!("trun_{name}"), RunStatus::Done).await;
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        rig.stop().await;
    }

    #[tokio::test]
    async fn test_waiting_run_releases_slot_and_resume_completes() {
        // S4: interactive run parks, the slot frees, resume finishes it.
        let rig = Rig::start(1, |runner| {
            runner.handlers().register(
                "asks",
                FnHandler::new(|ctx: TaskContext| async move {
                    if let Some(response) = ctx.user_response() {
                        let choice = response.get("choice").and_then(Value::as_str).unwrap_or("?");
                        return Ok(RunOutcome::done(format!("picked {choice}")));
                    }
                    Ok(RunOutcome::waiting(WaitingContract {
                        request_id: "q1".into(),
                        question: "pick one".into(),
                        context: None,
                        expires_at: "2099-01-01T00:00:00+00:00".into(),
                    }))
                }),
            );
        });
        let store = &rig.dispatcher.store;
        let mut profile = agentic_profile("asker", "asks");
        profile.kind = TaskKind::InteractiveWrapper;
        store.upsert_profile(&profile).unwrap();
        store
            .enqueue_run("trun_wait", "asker", &json!({}), Utc::now())
            .unwrap()
            .unwrap();
        rig.dispatcher.kick();

        let run = rig
            .wait_for_status("trun_wait", RunStatus::WaitingForUser)
            .await;
        assert_eq!(run.waiting_contract().unwrap().request_id, "q1");

        // The single slot is back to free while the run waits.
        for _ in 0..100 {
            if rig.dispatcher.slots().busy_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rig.dispatcher.slots().busy_count(), 0);

        store
            .resume_run("trun_wait", &json!({"choice": "a"}), Utc::now())
            .unwrap()
            .unwrap();
        rig.dispatcher.kick();
        let run = rig.wait_for_status("trun_wait", RunStatus::Done).await;
        assert_eq!(run.summary.as_deref(), Some("picked a"));
        rig.stop().await;
    }

    #[tokio::test]
    async fn test_kill_running_run_becomes_blocked() {
        // S6 shape: a long-running body is cancelled and lands blocked/killed.
        let rig = Rig::start(1, |runner| {
            runner.handlers().register(
                "stuck",
                FnHandler::new(|ctx: TaskContext| async move {
                    ctx.cancel.cancelled().await;
                    Ok(RunOutcome::failed("interrupted"))
                }),
            );
        });
        let store = &rig.dispatcher.store;
        store.upsert_profile(&agentic_profile("sleeper", "stuck")).unwrap();
        store
            .enqueue_run("trun_kill", "sleeper", &json!({}), Utc::now())
            .unwrap()
            .unwrap();
        rig.dispatcher.kick();
        rig.wait_for_status("trun_kill", RunStatus::Running).await;

        let outcome = rig.dispatcher.kill_run("trun_kill").unwrap();
        assert!(outcome.cancel_requested);

        let run = rig.wait_for_status("trun_kill", RunStatus::Blocked).await;
        assert_eq!(run.error.as_deref(), Some("killed"));
        rig.stop().await;
    }

    #[tokio::test]
    async fn test_kill_queued_run_direct_transition() {
        // No slots running: a queued run is killed in place.
        let rig = Rig::start(1, |_| {});
        let store = &rig.dispatcher.store;
        rig.cancel.cancel();

        store.upsert_profile(&agentic_profile("idle", "none")).unwrap();
        store
            .enqueue_run("trun_q", "idle", &json!({}), Utc::now())
            .unwrap()
            .unwrap();

        let outcome = rig.dispatcher.kill_run("trun_q").unwrap();
        assert!(!outcome.cancel_requested);
        let run = store.get_run("trun_q").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Blocked);
        assert_eq!(run.error.as_deref(), Some("killed"));

        // Killing again reports the terminal state.
        let again = rig.dispatcher.kill_run("trun_q").unwrap();
        assert!(again.already_terminal);
        rig.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let rig = Rig::start(1, |runner| {
            runner.handlers().register(
                "slowpoke",
                FnHandler::new(|_ctx| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(RunOutcome::done("never"))
                }),
            );
        });
        let store = &rig.dispatcher.store;
        let mut profile = agentic_profile("slow", "slowpoke");
        profile.timeout_sec = 1;
        store.upsert_profile(&profile).unwrap();
        store
            .enqueue_run("trun_slow", "slow", &json!({}), Utc::now())
            .unwrap()
            .unwrap();
        rig.dispatcher.kick();

        let run = rig.wait_for_status("trun_slow", RunStatus::Failed).await;
        assert_eq!(run.error.as_deref(), Some("timeout"));
        rig.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_profile_fails_run() {
        let rig = Rig::start(1, |_| {});
        let store = &rig.dispatcher.store;
        store
            .raw_execute(
                "INSERT INTO task_runs (run_id, schedule_id, profile_id, status, queued_at, payload_json)
                 VALUES ('trun_ghost', NULL, 'ghost', 'queued', '2026-03-01T12:00:00+00:00', '{}')",
                &[],
            )
            .unwrap();
        rig.dispatcher.kick();

        let run = rig.wait_for_status("trun_ghost", RunStatus::Failed).await;
        assert!(run.error.unwrap().contains("unknown task profile"));
        rig.stop().await;
    }

    #[tokio::test]
    async fn test_inline_agentic_payload_spec() {
        let rig = Rig::start(1, |runner| {
            runner.handlers().register(
                "inline",
                FnHandler::new(|ctx: TaskContext| async move {
                    let instructions = ctx
                        .payload
                        .get("instructions")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Ok(RunOutcome::done(format!("ran: {instructions}")))
                }),
            );
        });
        let store = &rig.dispatcher.store;
        store
            .enqueue_run(
                "trun_adhoc",
                "agentic_research",
                &json!({
                    "trigger": "agentic",
                    "module": "inline",
                    "instructions": "collect pricing data",
                    "timeout_sec": 60,
                }),
                Utc::now(),
            )
            .unwrap()
            .unwrap();
        rig.dispatcher.kick();

        let run = rig.wait_for_status("trun_adhoc", RunStatus::Done).await;
        assert_eq!(run.summary.as_deref(), Some("ran: collect pricing data"));
        rig.stop().await;
    }
}
