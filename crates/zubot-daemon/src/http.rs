//! HTTP control API over the central service.
//!
//! Route paths are stable; external tooling depends on them.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use zubot_core::{CentralService, ScheduleSpec, SqlRequest};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CentralService>,
}

pub fn router(service: Arc<CentralService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/central/status", get(central_status))
        .route("/api/central/start", post(central_start))
        .route("/api/central/stop", post(central_stop))
        .route("/api/central/metrics", get(central_metrics))
        .route("/api/central/tasks", get(list_tasks).post(upsert_task))
        .route("/api/central/tasks/:task_id", delete(delete_task))
        .route(
            "/api/central/schedules",
            get(list_schedules).post(upsert_schedule),
        )
        .route("/api/central/schedules/:schedule_id", delete(delete_schedule))
        .route("/api/central/runs", get(list_runs))
        .route("/api/central/runs/waiting", get(list_waiting_runs))
        .route("/api/central/runs/history", get(list_run_history))
        .route("/api/central/trigger/:task_id", post(trigger_task))
        .route("/api/central/agentic/enqueue", post(enqueue_agentic))
        .route("/api/central/runs/:run_id/kill", post(kill_run))
        .route("/api/central/runs/:run_id/resume", post(resume_run))
        .route("/api/central/sql", post(execute_sql))
        .route("/api/central/task-state/upsert", post(task_state_upsert))
        .route("/api/central/task-state/get", post(task_state_get))
        .route("/api/central/task-seen/mark", post(task_seen_mark))
        .route("/api/central/task-seen/has", post(task_seen_has))
        .route("/api/central/events", get(list_forward_events))
        .route("/api/central/memory/summaries", get(recent_day_summaries))
        .route("/api/central/memory/ingest", post(ingest_memory_event))
        .route("/api/central/memory/summarize", post(trigger_day_summary))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct ResumeRequest {
    user_response: Value,
}

#[derive(Deserialize)]
struct TaskStateUpsertRequest {
    task_id: String,
    state_key: String,
    value: Value,
    #[serde(default = "default_updated_by")]
    updated_by: String,
}

fn default_updated_by() -> String {
    "task_runtime".to_string()
}

#[derive(Deserialize)]
struct TaskStateGetRequest {
    task_id: String,
    state_key: String,
}

#[derive(Deserialize)]
struct TaskSeenMarkRequest {
    task_id: String,
    provider: String,
    item_key: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Deserialize)]
struct TaskSeenHasRequest {
    task_id: String,
    provider: String,
    item_key: String,
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_consume")]
    consume: bool,
}

fn default_consume() -> bool {
    true
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "running": state.service.is_running(),
    }))
}

async fn central_status(State(state): State<AppState>) -> Json<Value> {
    Json(state.service.status())
}

async fn central_start(State(state): State<AppState>) -> Json<Value> {
    Json(state.service.start())
}

async fn central_stop(State(state): State<AppState>) -> Json<Value> {
    Json(state.service.stop().await)
}

async fn central_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(state.service.metrics())
}

async fn list_tasks(State(state): State<AppState>) -> Json<Value> {
    Json(state.service.list_task_profiles())
}

async fn upsert_task(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    Json(state.service.upsert_task_profile(body))
}

async fn delete_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Json<Value> {
    Json(state.service.delete_task_profile(&task_id))
}

async fn list_schedules(State(state): State<AppState>) -> Json<Value> {
    Json(state.service.list_schedules())
}

async fn upsert_schedule(
    State(state): State<AppState>,
    Json(spec): Json<ScheduleSpec>,
) -> Json<Value> {
    Json(state.service.upsert_schedule(spec))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> Json<Value> {
    Json(state.service.delete_schedule(&schedule_id))
}

async fn list_runs(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Json<Value> {
    Json(state.service.list_runs(q.limit))
}

async fn list_waiting_runs(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Json<Value> {
    Json(state.service.list_waiting_runs(q.limit))
}

async fn list_run_history(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Json<Value> {
    Json(state.service.list_run_history(q.limit))
}

async fn trigger_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<TriggerRequest>>,
) -> Json<Value> {
    let description = body.and_then(|Json(req)| req.description);
    Json(state.service.trigger_task(&task_id, description.as_deref()))
}

async fn enqueue_agentic(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    Json(state.service.enqueue_agentic_task(body))
}

async fn kill_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Json<Value> {
    Json(state.service.kill_run(&run_id))
}

async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Json<Value> {
    Json(state.service.resume_run(&run_id, req.user_response))
}

async fn execute_sql(
    State(state): State<AppState>,
    Json(request): Json<SqlRequest>,
) -> Json<Value> {
    Json(state.service.execute_sql(request).await)
}

async fn task_state_upsert(
    State(state): State<AppState>,
    Json(req): Json<TaskStateUpsertRequest>,
) -> Json<Value> {
    Json(state.service.upsert_task_state(
        &req.task_id,
        &req.state_key,
        req.value,
        &req.updated_by,
    ))
}

async fn task_state_get(
    State(state): State<AppState>,
    Json(req): Json<TaskStateGetRequest>,
) -> Json<Value> {
    Json(state.service.get_task_state(&req.task_id, &req.state_key))
}

async fn task_seen_mark(
    State(state): State<AppState>,
    Json(req): Json<TaskSeenMarkRequest>,
) -> Json<Value> {
    Json(state.service.mark_task_item_seen(
        &req.task_id,
        &req.provider,
        &req.item_key,
        req.metadata,
    ))
}

async fn task_seen_has(
    State(state): State<AppState>,
    Json(req): Json<TaskSeenHasRequest>,
) -> Json<Value> {
    Json(
        state
            .service
            .has_task_item_seen(&req.task_id, &req.provider, &req.item_key),
    )
}

async fn list_forward_events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Json<Value> {
    Json(state.service.list_forward_events(q.consume))
}

#[derive(Deserialize)]
struct IngestRequest {
    #[serde(default = "default_session")]
    session_id: String,
    #[serde(default = "default_kind")]
    kind: String,
    text: String,
}

fn default_session() -> String {
    "default".to_string()
}

fn default_kind() -> String {
    "user".to_string()
}

#[derive(Deserialize)]
struct SummarizeRequest {
    day: String,
    #[serde(default = "default_reason")]
    reason: String,
}

fn default_reason() -> String {
    "manual".to_string()
}

async fn recent_day_summaries(State(state): State<AppState>) -> Json<Value> {
    Json(state.service.recent_day_summaries())
}

async fn ingest_memory_event(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Json<Value> {
    Json(
        state
            .service
            .ingest_memory_event(&req.session_id, &req.kind, &req.text),
    )
}

async fn trigger_day_summary(
    State(state): State<AppState>,
    Json(req): Json<SummarizeRequest>,
) -> Json<Value> {
    Json(state.service.trigger_day_summary(&req.day, &req.reason))
}
