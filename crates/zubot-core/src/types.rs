//! Core types for the central execution substrate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use zubot_runner::{OutcomeStatus, RunOutcome, TaskKind, WaitingContract};

/// ISO-8601 UTC string, the canonical timestamp format in the database.
pub fn iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============ Run lifecycle ============

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingForUser,
    Done,
    Failed,
    Blocked,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::WaitingForUser => "waiting_for_user",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "waiting_for_user" => Some(RunStatus::WaitingForUser),
            "done" => Some(RunStatus::Done),
            "failed" => Some(RunStatus::Failed),
            "blocked" => Some(RunStatus::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Blocked)
    }

    /// Statuses counted by the no-overlap rule.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::Running | RunStatus::WaitingForUser
        )
    }
}

/// An active or recently finished run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub schedule_id: Option<String>,
    pub profile_id: String,
    pub status: RunStatus,
    pub planned_fire_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub payload: Value,
}

impl Run {
    /// The waiting contract persisted into the payload, if any.
    pub fn waiting_contract(&self) -> Option<WaitingContract> {
        self.payload
            .get("waiting")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

// ============ Task profiles ============

/// Declares an executable task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProfile {
    pub task_id: String,
    pub name: String,
    pub kind: TaskKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,
    pub timeout_sec: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<String>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ============ Schedules ============

/// How a schedule derives its fire instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Frequency,
    Calendar,
}

impl ScheduleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleMode::Frequency => "frequency",
            ScheduleMode::Calendar => "calendar",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            // `interval` is accepted as a legacy alias.
            "frequency" | "interval" => Some(ScheduleMode::Frequency),
            "calendar" => Some(ScheduleMode::Calendar),
            _ => None,
        }
    }
}

/// How the scheduler handles fire instants it missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    QueueAll,
    QueueLatest,
    Skip,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfirePolicy::QueueAll => "queue_all",
            MisfirePolicy::QueueLatest => "queue_latest",
            MisfirePolicy::Skip => "skip",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queue_all" => Some(MisfirePolicy::QueueAll),
            "queue_latest" => Some(MisfirePolicy::QueueLatest),
            "skip" => Some(MisfirePolicy::Skip),
            _ => None,
        }
    }
}

/// A calendar-mode fire time in a specific timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTimeSpec {
    /// `HH:MM`, interpreted in `timezone`.
    pub time_of_day: String,
    /// IANA timezone name.
    pub timezone: String,
    pub enabled: bool,
}

/// Recurring binding of a task, with its scheduler cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub profile_id: String,
    pub enabled: bool,
    pub mode: ScheduleMode,
    pub misfire_policy: MisfirePolicy,
    pub execution_order: i64,
    pub run_frequency_minutes: Option<i64>,
    /// Cursor: earliest future instant this schedule should fire at.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Cursor: the highest fire instant already planned into a run.
    pub last_planned_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<String>,
    pub last_successful_run_at: Option<String>,
    pub last_status: Option<String>,
    pub last_summary: Option<String>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_times: Vec<RunTimeSpec>,
    #[serde(default)]
    pub days_of_week: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for creating or updating a schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub schedule_id: Option<String>,
    pub task_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: String,
    #[serde(default)]
    pub misfire_policy: Option<String>,
    #[serde(default = "default_execution_order")]
    pub execution_order: i64,
    #[serde(default)]
    pub run_frequency_minutes: Option<i64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub run_times: Vec<String>,
    #[serde(default)]
    pub days_of_week: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_execution_order() -> i64 {
    100
}

// ============ Heartbeat ============

/// Singleton heartbeat bookkeeping row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub last_started_at: Option<String>,
    pub last_finished_at: Option<String>,
    pub last_status: Option<String>,
    pub last_enqueued_count: i64,
    pub last_error: Option<String>,
}

// ============ Day memory ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLayer {
    Raw,
    Summary,
}

impl MemoryLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryLayer::Raw => "raw",
            MemoryLayer::Summary => "summary",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(MemoryLayer::Raw),
            "summary" => Some(MemoryLayer::Summary),
            _ => None,
        }
    }
}

/// Append-only raw or summary event on a day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayEvent {
    pub event_id: i64,
    pub day: String,
    pub event_time: String,
    pub session_id: String,
    pub kind: String,
    pub text: String,
    pub layer: MemoryLayer,
}

/// Per-day counters driving the summary pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayStatus {
    pub day: String,
    pub total_messages: i64,
    pub last_summarized_total: i64,
    pub messages_since_last_summary: i64,
    pub summaries_count: i64,
    pub is_finalized: bool,
    pub last_event_at: Option<String>,
    pub last_summary_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryJobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl SummaryJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryJobStatus::Queued => "queued",
            SummaryJobStatus::Running => "running",
            SummaryJobStatus::Done => "done",
            SummaryJobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(SummaryJobStatus::Queued),
            "running" => Some(SummaryJobStatus::Running),
            "done" => Some(SummaryJobStatus::Done),
            "failed" => Some(SummaryJobStatus::Failed),
            _ => None,
        }
    }
}

/// One unit of per-day summarization work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryJob {
    pub job_id: i64,
    pub day: String,
    pub status: SummaryJobStatus,
    pub reason: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub attempt_count: i64,
}

/// Materialized narrative summary of one day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaySummary {
    pub day: String,
    pub summary_text: String,
    pub entry_count: i64,
    pub updated_at: String,
}

// ============ Task state / seen items ============

/// Idempotency ledger row for externally discovered items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenItem {
    pub task_id: String,
    pub provider: String,
    pub item_key: String,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub seen_count: i64,
    pub metadata: Value,
}

// ============ Slots ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Free,
    Busy,
}

/// Last outcome a slot handled, kept for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotResult {
    pub run_id: String,
    pub status: RunStatus,
    pub finished_at: String,
}

/// Snapshot of one execution slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot_id: usize,
    pub state: SlotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<SlotResult>,
}

impl SlotInfo {
    pub fn free(slot_id: usize) -> Self {
        Self {
            slot_id,
            state: SlotState::Free,
            run_id: None,
            task_id: None,
            started_at: None,
            last_result: None,
        }
    }
}

// ============ Lifecycle events ============

/// In-memory lifecycle event surfaced through status/metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    pub payload: Value,
    pub forward_to_user: bool,
    pub forwarded: bool,
}

// ============ Runtime observability ============

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RuntimeCounts {
    pub queued_count: i64,
    pub running_count: i64,
    pub waiting_count: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub oldest_queued_age_sec: Option<f64>,
    pub longest_running_age_sec: Option<f64>,
    pub waiting_count: i64,
}
