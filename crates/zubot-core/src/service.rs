//! Central service: the coordinator that owns every core loop.
//!
//! Mirrors the shape of a single-process daemon core: one store, one SQL
//! gateway, a heartbeat loop, a slot pool, a summary worker, and provider
//! queues, with idempotent start/stop and JSON-shaped control operations for
//! the HTTP surface and tools.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use zubot_runner::{TaskKind, TaskRunner};

use crate::config::ZubotConfig;
use crate::dispatcher::Dispatcher;
use crate::events::LifecycleHub;
use crate::gateway::{SqlGateway, SqlRequest};
use crate::memory::{spawn_summary_worker, MemoryPipeline};
use crate::provider_queue::ProviderQueues;
use crate::scheduler::{normalize_days_of_week, parse_time_of_day, Heartbeat};
use crate::store::CoreStore;
use crate::types::{
    MisfirePolicy, RunStatus, RunTimeSpec, Schedule, ScheduleMode, ScheduleSpec, TaskProfile,
};

struct RunningLoops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Single-process scheduler + queue consumer + memory pipeline.
pub struct CentralService {
    config: ZubotConfig,
    workspace_root: PathBuf,
    store: Arc<CoreStore>,
    gateway: Arc<SqlGateway>,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Heartbeat,
    pipeline: Arc<MemoryPipeline>,
    hub: Arc<LifecycleHub>,
    queues: Arc<ProviderQueues>,
    loops: Mutex<Option<RunningLoops>>,
}

impl CentralService {
    /// Build the service against a workspace root. Fails on an unopenable
    /// database (fatal init, the daemon exits non-zero).
    pub fn new(config: ZubotConfig, workspace_root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let workspace_root = workspace_root.into();
        let db_path = resolve_db_path(&workspace_root, &config.central_service.scheduler_db_path);
        let store = Arc::new(
            CoreStore::open(&db_path, config.central_service.db_queue_busy_timeout_ms)
                .with_context(|| format!("failed to open database at {}", db_path.display()))?,
        );
        Self::with_store(config, workspace_root, store)
    }

    /// As `new`, but over an existing store (tests use in-memory stores).
    pub fn with_store(
        config: ZubotConfig,
        workspace_root: PathBuf,
        store: Arc<CoreStore>,
    ) -> Result<Arc<Self>> {
        let gateway = SqlGateway::new(
            Arc::clone(&store),
            config.central_service.db_queue_default_max_rows,
        );
        let pipeline = MemoryPipeline::new(Arc::clone(&store), config.memory.clone());
        let hub = LifecycleHub::new(
            Arc::clone(&pipeline),
            Duration::from_secs(config.central_service.memory_manager_completion_debounce_sec),
        );
        let runner = Arc::new(TaskRunner::new(
            workspace_root.clone(),
            workspace_root.join("memory/tasks/logs"),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&runner),
            Arc::clone(&hub),
            config.central_service.task_runner_concurrency,
            Duration::from_secs(config.central_service.waiting_for_user_timeout_sec.max(1) as u64),
        );
        let heartbeat = Heartbeat::new(Arc::clone(&store));
        let queues = ProviderQueues::new(config.provider_queues.clone());

        Ok(Arc::new(Self {
            config,
            workspace_root,
            store,
            gateway,
            dispatcher,
            heartbeat,
            pipeline,
            hub,
            queues,
            loops: Mutex::new(None),
        }))
    }

    pub fn store(&self) -> &Arc<CoreStore> {
        &self.store
    }

    /// The dispatcher's runner; exposed so embedders can register agentic
    /// and interactive handlers.
    pub fn runner(&self) -> &Arc<TaskRunner> {
        self.dispatcher.runner()
    }

    pub fn pipeline(&self) -> &Arc<MemoryPipeline> {
        &self.pipeline
    }

    pub fn provider_queues(&self) -> &Arc<ProviderQueues> {
        &self.queues
    }

    pub fn config(&self) -> &ZubotConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    // ============ Lifecycle ============

    /// Start the core loops (idempotent).
    pub fn start(self: &Arc<Self>) -> Value {
        let mut loops = self.loops.lock().unwrap();
        if loops.is_some() {
            return json!({"ok": true, "running": true, "already_running": true});
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        handles.extend(self.dispatcher.spawn_slots(cancel.clone()));
        handles.push(spawn_summary_worker(
            Arc::clone(&self.pipeline),
            cancel.clone(),
        ));
        handles.push(self.spawn_heartbeat_loop(cancel.clone()));

        *loops = Some(RunningLoops { cancel, handles });
        info!(
            concurrency = self.dispatcher.concurrency(),
            poll_sec = self.config.central_service.heartbeat_poll_interval_sec,
            "Central service started"
        );
        json!({"ok": true, "running": true, "already_running": false})
    }

    /// Stop the core loops (idempotent). Loops exit at their next
    /// suspension point.
    pub async fn stop(&self) -> Value {
        let running = self.loops.lock().unwrap().take();
        let Some(running) = running else {
            return json!({"ok": true, "running": false, "already_running": false});
        };
        running.cancel.cancel();
        self.dispatcher.kick();
        self.pipeline.kick();
        for handle in running.handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        info!("Central service stopped");
        json!({"ok": true, "running": false, "already_running": true})
    }

    pub fn is_running(&self) -> bool {
        self.loops.lock().unwrap().is_some()
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let poll =
            Duration::from_secs(self.config.central_service.heartbeat_poll_interval_sec.max(1));
        tokio::spawn(async move {
            info!(poll_sec = poll.as_secs(), "Heartbeat loop started");
            loop {
                service.run_tick();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            info!("Heartbeat loop stopped");
        })
    }

    /// One heartbeat tick plus housekeeping. Public so tests and the
    /// trigger path can drive it without waiting for the loop.
    pub fn run_tick(&self) {
        let now = Utc::now();
        let outcome = self.heartbeat.tick(now);
        for run in &outcome.enqueued {
            self.hub
                .run_event("run_queued", &run.profile_id, &run.run_id, "trigger=scheduled");
        }
        if !outcome.enqueued.is_empty() {
            self.dispatcher.kick();
        }

        for expired in self.heartbeat.expire_waiting(now) {
            self.hub.run_event(
                "run_blocked",
                &expired.profile_id,
                &expired.run_id,
                "error=waiting_for_user_timeout",
            );
        }

        self.heartbeat.prune_history(
            self.config.central_service.run_history_retention_days,
            self.config.central_service.run_history_max_rows,
            now,
        );
        self.hub.maybe_periodic_sweep(Duration::from_secs(
            self.config.central_service.memory_manager_sweep_interval_sec,
        ));
    }

    // ============ Task profiles ============

    pub fn upsert_task_profile(&self, profile: Value) -> Value {
        let task_id = match required_str(&profile, "task_id") {
            Ok(id) => id,
            Err(e) => return e,
        };
        let kind_raw = profile
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("script");
        let Some(kind) = TaskKind::from_str(kind_raw) else {
            return error_json(format!("unknown task kind `{kind_raw}`"));
        };
        let entrypoint_path = profile
            .get("entrypoint_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        let module = profile
            .get("module")
            .and_then(Value::as_str)
            .map(str::to_string);
        if kind == TaskKind::Script && entrypoint_path.is_none() {
            return error_json("script tasks require entrypoint_path");
        }
        if kind != TaskKind::Script && module.is_none() && entrypoint_path.is_none() {
            return error_json("agentic tasks require module");
        }

        let record = TaskProfile {
            task_id: task_id.clone(),
            name: profile
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&task_id)
                .to_string(),
            kind,
            entrypoint_path,
            args: profile
                .get("args")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            module,
            queue_group: profile
                .get("queue_group")
                .and_then(Value::as_str)
                .map(str::to_string),
            timeout_sec: profile
                .get("timeout_sec")
                .and_then(Value::as_i64)
                .filter(|t| *t > 0)
                .unwrap_or(1800),
            retry_policy: profile
                .get("retry_policy")
                .and_then(Value::as_str)
                .map(str::to_string),
            enabled: profile.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            created_at: String::new(),
            updated_at: String::new(),
        };
        match self.store.upsert_profile(&record) {
            Ok(()) => json!({"ok": true, "task_id": task_id}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn delete_task_profile(&self, task_id: &str) -> Value {
        match self.store.delete_profile(task_id) {
            Ok(deleted) => json!({"ok": true, "task_id": task_id, "deleted": deleted}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn list_task_profiles(&self) -> Value {
        match self.store.list_profiles() {
            Ok(profiles) => json!({"ok": true, "tasks": profiles}),
            Err(e) => error_json(e.to_string()),
        }
    }

    // ============ Schedules ============

    pub fn upsert_schedule(&self, spec: ScheduleSpec) -> Value {
        let task_id = spec.task_id.trim().to_string();
        if task_id.is_empty() {
            return error_json("task_id is required");
        }
        match self.store.get_profile(&task_id) {
            Ok(Some(_)) => {}
            Ok(None) => return error_json(format!("unknown task_id `{task_id}`")),
            Err(e) => return error_json(e.to_string()),
        }

        let Some(mode) = ScheduleMode::from_str(spec.mode.trim()) else {
            return error_json("mode must be `frequency` or `calendar`");
        };
        let misfire_policy = match &spec.misfire_policy {
            Some(raw) => match MisfirePolicy::from_str(raw.trim()) {
                Some(policy) => policy,
                None => {
                    return error_json("misfire_policy must be queue_all, queue_latest, or skip")
                }
            },
            None => MisfirePolicy::QueueLatest,
        };

        let mut run_frequency_minutes = None;
        let mut run_times: Vec<RunTimeSpec> = Vec::new();
        let mut days: Vec<String> = Vec::new();
        match mode {
            ScheduleMode::Frequency => {
                let Some(freq) = spec.run_frequency_minutes.filter(|f| *f > 0) else {
                    return error_json("run_frequency_minutes must be > 0 for frequency mode");
                };
                run_frequency_minutes = Some(freq);
            }
            ScheduleMode::Calendar => {
                let timezone = spec
                    .timezone
                    .as_deref()
                    .map(str::trim)
                    .filter(|tz| !tz.is_empty())
                    .unwrap_or("UTC")
                    .to_string();
                if timezone.parse::<chrono_tz::Tz>().is_err() {
                    return error_json(format!("unknown timezone `{timezone}`"));
                }
                for raw in &spec.run_times {
                    let Some((hour, minute)) = parse_time_of_day(raw) else {
                        return error_json(format!("invalid time_of_day `{raw}` (expected HH:MM)"));
                    };
                    let normalized = format!("{hour:02}:{minute:02}");
                    if run_times.iter().any(|rt| rt.time_of_day == normalized) {
                        continue;
                    }
                    run_times.push(RunTimeSpec {
                        time_of_day: normalized,
                        timezone: timezone.clone(),
                        enabled: true,
                    });
                }
                if run_times.is_empty() {
                    return error_json("run_times is required for calendar mode");
                }
                days = normalize_days_of_week(&spec.days_of_week);
            }
        }

        let schedule_id = spec
            .schedule_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("sched_{}_{}", sanitize_id(&task_id), &Uuid::new_v4().simple().to_string()[..8])
            });

        match self.store.upsert_schedule(
            &schedule_id,
            &task_id,
            spec.enabled,
            mode,
            misfire_policy,
            spec.execution_order.max(0),
            run_frequency_minutes,
            &run_times,
            &days,
            Utc::now(),
        ) {
            Ok(()) => json!({"ok": true, "schedule_id": schedule_id}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> Value {
        match self.store.delete_schedule(schedule_id) {
            Ok(deleted) => json!({"ok": true, "schedule_id": schedule_id, "deleted": deleted}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn list_schedules(&self) -> Value {
        match self.store.list_schedules() {
            Ok(schedules) => json!({"ok": true, "schedules": schedules}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Option<Schedule> {
        self.store.get_schedule(schedule_id).ok().flatten()
    }

    // ============ Runs ============

    /// Manually enqueue a run for a profile, subject to no-overlap.
    pub fn trigger_task(&self, task_id: &str, description: Option<&str>) -> Value {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return error_json("task_id is required");
        }
        match self.store.get_profile(task_id) {
            Ok(Some(profile)) if !profile.enabled => {
                return error_json(format!("task `{task_id}` is disabled"));
            }
            Ok(Some(_)) => {}
            Ok(None) => return error_json(format!("unknown task_id `{task_id}`")),
            Err(e) => return error_json(e.to_string()),
        }

        let now = Utc::now();
        let run_id = format!("trun_{}", Uuid::new_v4().simple());
        let payload = json!({
            "schedule_id": null,
            "profile_id": task_id,
            "trigger": "manual",
            "description": description,
            "enqueued_at": crate::types::iso(now),
        });
        match self.store.enqueue_run(&run_id, task_id, &payload, now) {
            Ok(Some(run)) => {
                let mut detail = "trigger=manual".to_string();
                if let Some(description) = description.filter(|d| !d.trim().is_empty()) {
                    detail.push_str(&format!(
                        " description={}",
                        description.chars().take(120).collect::<String>()
                    ));
                }
                self.hub.run_event("run_queued", task_id, &run.run_id, &detail);
                self.dispatcher.kick();
                json!({"ok": true, "run_id": run.run_id})
            }
            Ok(None) => error_json(format!("task `{task_id}` already has an active run")),
            Err(e) => error_json(e.to_string()),
        }
    }

    /// Enqueue a one-off agentic run with inline instructions.
    pub fn enqueue_agentic_task(&self, req: Value) -> Value {
        let instructions = match required_str(&req, "instructions") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let task_name = req
            .get("task_name")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("Background Research Task");
        let requested_by = req
            .get("requested_by")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("main_agent");
        let module = req
            .get("module")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("inline");
        let timeout_sec = req
            .get("timeout_sec")
            .and_then(Value::as_i64)
            .filter(|t| *t > 0)
            .unwrap_or(180);
        let metadata = req.get("metadata").cloned().unwrap_or(Value::Null);

        let profile_id = format!("agentic_{}", sanitize_id(task_name));
        let now = Utc::now();
        let run_id = format!("trun_{}", Uuid::new_v4().simple());
        let payload = json!({
            "trigger": "agentic",
            "task_name": task_name,
            "instructions": instructions,
            "requested_by": requested_by,
            "module": module,
            "timeout_sec": timeout_sec,
            "metadata": metadata,
            "enqueued_at": crate::types::iso(now),
        });
        match self.store.enqueue_run(&run_id, &profile_id, &payload, now) {
            Ok(Some(run)) => {
                self.hub
                    .run_event("run_queued", &profile_id, &run.run_id, "trigger=agentic");
                self.dispatcher.kick();
                json!({"ok": true, "run_id": run.run_id, "profile_id": profile_id})
            }
            Ok(None) => error_json(format!(
                "agentic task `{task_name}` already has an active run"
            )),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn kill_run(&self, run_id: &str) -> Value {
        match self.dispatcher.kill_run(run_id) {
            Ok(outcome) => {
                let mut value = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));
                value["ok"] = json!(true);
                value
            }
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn resume_run(&self, run_id: &str, response: Value) -> Value {
        match self.store.resume_run(run_id, &response, Utc::now()) {
            Ok(Some(run)) => {
                self.hub
                    .run_event("run_resumed", &run.profile_id, run_id, "trigger=user_response");
                self.dispatcher.kick();
                json!({"ok": true, "run_id": run_id, "status": run.status.as_str()})
            }
            Ok(None) => error_json(format!("run `{run_id}` is not waiting for user input")),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn list_runs(&self, limit: usize) -> Value {
        match self.store.list_runs(limit) {
            Ok(runs) => json!({"ok": true, "runs": runs}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn list_waiting_runs(&self, limit: usize) -> Value {
        match self
            .store
            .list_runs_by_status(RunStatus::WaitingForUser, limit)
        {
            Ok(runs) => json!({"ok": true, "runs": runs}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn list_run_history(&self, limit: usize) -> Value {
        match self.store.list_run_history(limit) {
            Ok(runs) => json!({"ok": true, "runs": runs}),
            Err(e) => error_json(e.to_string()),
        }
    }

    // ============ Gateway / KV / seen items ============

    pub async fn execute_sql(&self, request: SqlRequest) -> Value {
        let reply = self.gateway.execute(request).await;
        serde_json::to_value(&reply).unwrap_or_else(|_| error_json("reply serialization failed"))
    }

    pub fn upsert_task_state(
        &self,
        task_id: &str,
        state_key: &str,
        value: Value,
        updated_by: &str,
    ) -> Value {
        if task_id.trim().is_empty() || state_key.trim().is_empty() {
            return error_json("task_id and state_key are required");
        }
        match self
            .store
            .upsert_task_state(task_id, state_key, &value, updated_by, Utc::now())
        {
            Ok(()) => json!({"ok": true, "task_id": task_id, "state_key": state_key}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn get_task_state(&self, task_id: &str, state_key: &str) -> Value {
        match self.store.get_task_state(task_id, state_key) {
            Ok(value) => json!({
                "ok": true,
                "task_id": task_id,
                "state_key": state_key,
                "found": value.is_some(),
                "value": value,
            }),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn mark_task_item_seen(
        &self,
        task_id: &str,
        provider: &str,
        item_key: &str,
        metadata: Value,
    ) -> Value {
        if task_id.trim().is_empty() || provider.trim().is_empty() || item_key.trim().is_empty() {
            return error_json("task_id, provider, and item_key are required");
        }
        match self
            .store
            .mark_seen_item(task_id, provider, item_key, &metadata, Utc::now())
        {
            Ok(item) => json!({"ok": true, "item": item}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn has_task_item_seen(&self, task_id: &str, provider: &str, item_key: &str) -> Value {
        match self.store.has_seen_item(task_id, provider, item_key) {
            Ok(seen) => json!({"ok": true, "seen": seen}),
            Err(e) => error_json(e.to_string()),
        }
    }

    // ============ Memory ============

    pub fn ingest_memory_event(&self, session_id: &str, kind: &str, text: &str) -> Value {
        if text.trim().is_empty() {
            return error_json("text is required");
        }
        match self
            .pipeline
            .ingest_event(None, session_id, kind, text.trim(), Utc::now())
        {
            Ok(status) => json!({"ok": true, "status": status}),
            Err(e) => error_json(e.to_string()),
        }
    }

    /// The most recent day summaries, sized by `memory.autoload_summary_days`
    /// (the window context assembly preloads).
    pub fn recent_day_summaries(&self) -> Value {
        let days = self.config.memory.autoload_summary_days.max(1) as usize;
        match self.pipeline.recent_summaries(days) {
            Ok(summaries) => json!({"ok": true, "days": days, "summaries": summaries}),
            Err(e) => error_json(e.to_string()),
        }
    }

    pub fn trigger_day_summary(&self, day: &str, reason: &str) -> Value {
        match self.pipeline.trigger_summary(day, reason, Utc::now()) {
            Ok((job_id, deduped)) => {
                json!({"ok": true, "job_id": job_id, "deduped": deduped})
            }
            Err(e) => error_json(e.to_string()),
        }
    }

    // ============ Observability ============

    pub fn status(&self) -> Value {
        let now = Utc::now();
        let counts = self.store.runtime_counts().unwrap_or_default();
        let metrics = self.store.runtime_metrics(now).unwrap_or_default();
        let heartbeat = self.store.get_heartbeat().unwrap_or_default();
        let central = &self.config.central_service;

        let mut warnings: Vec<&str> = Vec::new();
        if central.queue_warning_threshold > 0 && counts.queued_count >= central.queue_warning_threshold
        {
            warnings.push("queue_depth_high");
        }
        if let Some(age) = metrics.longest_running_age_sec {
            if central.running_age_warning_sec > 0 && age >= central.running_age_warning_sec as f64
            {
                warnings.push("running_task_stale");
            }
        }

        json!({
            "ok": true,
            "service": {
                "running": self.is_running(),
                "enabled_in_config": central.enabled,
                "heartbeat_poll_interval_sec": central.heartbeat_poll_interval_sec,
                "task_runner_concurrency": central.task_runner_concurrency,
                "scheduler_db_path": self.store.db_path().display().to_string(),
                "run_history_retention_days": central.run_history_retention_days,
                "run_history_max_rows": central.run_history_max_rows,
                "memory_manager_sweep_interval_sec": central.memory_manager_sweep_interval_sec,
                "memory_manager_completion_debounce_sec": central.memory_manager_completion_debounce_sec,
                "queue_warning_threshold": central.queue_warning_threshold,
                "running_age_warning_sec": central.running_age_warning_sec,
                "waiting_for_user_timeout_sec": central.waiting_for_user_timeout_sec,
            },
            "runtime": {
                "queued_count": counts.queued_count,
                "running_count": counts.running_count,
                "waiting_count": counts.waiting_count,
                "busy_slots": self.dispatcher.slots().busy_count(),
                "task_event_buffer_count": self.hub.buffer_len(),
                "oldest_queued_age_sec": metrics.oldest_queued_age_sec,
                "longest_running_age_sec": metrics.longest_running_age_sec,
                "warnings": warnings,
            },
            "heartbeat": heartbeat,
            "slots": self.dispatcher.slots().snapshot(),
            "task_agents": self.check_in_payload(),
        })
    }

    pub fn metrics(&self) -> Value {
        let status = self.status();
        json!({
            "ok": true,
            "source": "central_service_metrics",
            "service": status["service"],
            "runtime": status["runtime"],
            "recent_events": self.hub.recent(20),
            "gateway": self.gateway.health(),
            "provider_queues": self.queues.all_stats(),
            "summary_worker": self.pipeline.status(),
        })
    }

    pub fn list_forward_events(&self, consume: bool) -> Value {
        let events = self.hub.drain_forwardable(consume);
        json!({"ok": true, "count": events.len(), "consumed": consume, "events": events})
    }

    /// Per-profile check-in rows for the status surface.
    fn check_in_payload(&self) -> Vec<Value> {
        let profiles = self.store.list_profiles().unwrap_or_default();
        let runs = self.store.list_runs(500).unwrap_or_default();

        let mut queued: Vec<&crate::types::Run> = runs
            .iter()
            .filter(|r| r.status == RunStatus::Queued)
            .collect();
        queued.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        let queue_position = |run_id: &str| {
            queued
                .iter()
                .position(|r| r.run_id == run_id)
                .map(|idx| idx + 1)
        };

        profiles
            .iter()
            .map(|profile| {
                let profile_runs: Vec<&crate::types::Run> = runs
                    .iter()
                    .filter(|r| r.profile_id == profile.task_id)
                    .collect();
                let current = profile_runs
                    .iter()
                    .find(|r| r.status == RunStatus::Running)
                    .or_else(|| {
                        profile_runs
                            .iter()
                            .find(|r| r.status == RunStatus::WaitingForUser)
                    })
                    .or_else(|| profile_runs.iter().find(|r| r.status == RunStatus::Queued));
                let state = match current.map(|r| r.status) {
                    Some(RunStatus::Running) => "running",
                    Some(RunStatus::WaitingForUser) => "waiting_for_user",
                    Some(RunStatus::Queued) => "queued",
                    _ => "free",
                };
                let last_result = profile_runs
                    .iter()
                    .filter(|r| r.status.is_terminal())
                    .max_by_key(|r| r.finished_at)
                    .map(|r| {
                        json!({
                            "status": r.status.as_str(),
                            "summary": r.summary,
                            "error": r.error,
                            "finished_at": r.finished_at,
                        })
                    });
                json!({
                    "profile_id": profile.task_id,
                    "name": profile.name,
                    "state": state,
                    "current_run_id": current.map(|r| r.run_id.clone()),
                    "queue_position": current
                        .filter(|r| r.status == RunStatus::Queued)
                        .and_then(|r| queue_position(&r.run_id)),
                    "last_result": last_result,
                })
            })
            .collect()
    }
}

fn resolve_db_path(root: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    }
}

fn sanitize_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn required_str(value: &Value, key: &str) -> Result<String, Value> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| error_json(format!("{key} is required")))
}

fn error_json(message: impl Into<String>) -> Value {
    let message = message.into();
    warn!(error = %message, "Service operation rejected");
    json!({"ok": false, "error": message})
}
