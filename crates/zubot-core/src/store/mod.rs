//! SQLite store for the central execution substrate.
//!
//! Owns the schema and exposes narrowly-typed operations over a single
//! writer connection. Callers outside this process boundary go through the
//! SQL gateway; in-process components call these methods directly and are
//! serialized by the connection lock.

mod memory;
mod runs;
mod schedules;
mod state;

pub use schedules::PlannedRun;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde_json::Value;

use crate::types::HeartbeatState;

const SCHEMA: &str = r#"
-- Task profiles: what can be executed
CREATE TABLE IF NOT EXISTS task_profiles (
  task_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('script', 'agentic', 'interactive_wrapper')),
  entrypoint_path TEXT,
  args_json TEXT NOT NULL DEFAULT '[]',
  module TEXT,
  queue_group TEXT,
  timeout_sec INTEGER NOT NULL DEFAULT 1800 CHECK (timeout_sec > 0),
  retry_policy TEXT,
  enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

-- Schedules: recurring bindings of a task, with the scheduler cursor
CREATE TABLE IF NOT EXISTS schedules (
  schedule_id TEXT PRIMARY KEY,
  profile_id TEXT NOT NULL,
  enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
  mode TEXT NOT NULL DEFAULT 'frequency' CHECK (mode IN ('frequency', 'calendar')),
  misfire_policy TEXT NOT NULL DEFAULT 'queue_latest'
    CHECK (misfire_policy IN ('queue_all', 'queue_latest', 'skip')),
  execution_order INTEGER NOT NULL DEFAULT 100 CHECK (execution_order >= 0),
  run_frequency_minutes INTEGER
    CHECK (run_frequency_minutes IS NULL OR run_frequency_minutes > 0),
  next_run_at TEXT,
  last_planned_run_at TEXT,
  last_run_at TEXT,
  last_successful_run_at TEXT,
  last_status TEXT,
  last_summary TEXT,
  last_error TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY(profile_id) REFERENCES task_profiles(task_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS schedule_run_times (
  run_time_id INTEGER PRIMARY KEY AUTOINCREMENT,
  schedule_id TEXT NOT NULL,
  time_of_day TEXT NOT NULL,
  timezone TEXT NOT NULL,
  enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY(schedule_id) REFERENCES schedules(schedule_id) ON DELETE CASCADE,
  UNIQUE(schedule_id, time_of_day, timezone)
);

CREATE TABLE IF NOT EXISTS schedule_days_of_week (
  schedule_id TEXT NOT NULL,
  day_of_week TEXT NOT NULL
    CHECK (day_of_week IN ('mon', 'tue', 'wed', 'thu', 'fri', 'sat', 'sun')),
  created_at TEXT NOT NULL,
  PRIMARY KEY(schedule_id, day_of_week),
  FOREIGN KEY(schedule_id) REFERENCES schedules(schedule_id) ON DELETE CASCADE
);

-- Active run queue/lifecycle
CREATE TABLE IF NOT EXISTS task_runs (
  run_id TEXT PRIMARY KEY,
  schedule_id TEXT,
  profile_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN
    ('queued', 'running', 'waiting_for_user', 'done', 'failed', 'blocked')),
  planned_fire_at TEXT,
  queued_at TEXT NOT NULL,
  started_at TEXT,
  finished_at TEXT,
  summary TEXT,
  error TEXT,
  payload_json TEXT NOT NULL,
  FOREIGN KEY(schedule_id) REFERENCES schedules(schedule_id) ON DELETE SET NULL
);

-- Terminal snapshots for bounded history
CREATE TABLE IF NOT EXISTS task_run_history (
  run_id TEXT PRIMARY KEY,
  schedule_id TEXT,
  profile_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('done', 'failed', 'blocked')),
  planned_fire_at TEXT,
  queued_at TEXT NOT NULL,
  started_at TEXT,
  finished_at TEXT,
  summary TEXT,
  error TEXT,
  payload_json TEXT NOT NULL,
  archived_at TEXT NOT NULL,
  FOREIGN KEY(schedule_id) REFERENCES schedules(schedule_id) ON DELETE SET NULL
);

-- Idempotency ledger of externally discovered items
CREATE TABLE IF NOT EXISTS task_seen_items (
  task_id TEXT NOT NULL,
  provider TEXT NOT NULL,
  item_key TEXT NOT NULL,
  first_seen_at TEXT NOT NULL,
  last_seen_at TEXT NOT NULL,
  seen_count INTEGER NOT NULL DEFAULT 1,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  PRIMARY KEY(task_id, provider, item_key)
);

-- Atomic per-task checkpoint values
CREATE TABLE IF NOT EXISTS task_state (
  task_id TEXT NOT NULL,
  state_key TEXT NOT NULL,
  value_json TEXT NOT NULL,
  updated_by TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY(task_id, state_key)
);

-- Append-only day memory event log
CREATE TABLE IF NOT EXISTS day_memory_events (
  event_id INTEGER PRIMARY KEY AUTOINCREMENT,
  day TEXT NOT NULL,
  event_time TEXT NOT NULL,
  session_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  text TEXT NOT NULL,
  layer TEXT NOT NULL DEFAULT 'raw' CHECK (layer IN ('raw', 'summary'))
);

CREATE TABLE IF NOT EXISTS day_memory_status (
  day TEXT PRIMARY KEY,
  total_messages INTEGER NOT NULL DEFAULT 0,
  last_summarized_total INTEGER NOT NULL DEFAULT 0,
  messages_since_last_summary INTEGER NOT NULL DEFAULT 0,
  summaries_count INTEGER NOT NULL DEFAULT 0,
  is_finalized INTEGER NOT NULL DEFAULT 0 CHECK (is_finalized IN (0, 1)),
  last_event_at TEXT,
  last_summary_at TEXT
);

CREATE TABLE IF NOT EXISTS memory_summary_jobs (
  job_id INTEGER PRIMARY KEY AUTOINCREMENT,
  day TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'done', 'failed')),
  reason TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  finished_at TEXT,
  error TEXT,
  attempt_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS day_summaries (
  day TEXT PRIMARY KEY,
  summary_text TEXT NOT NULL,
  entry_count INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL
);

-- Heartbeat bookkeeping (singleton row 'main')
CREATE TABLE IF NOT EXISTS heartbeat_state (
  id TEXT PRIMARY KEY DEFAULT 'main',
  last_started_at TEXT,
  last_finished_at TEXT,
  last_status TEXT,
  last_enqueued_count INTEGER NOT NULL DEFAULT 0,
  last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_schedules_enabled_order
  ON schedules(enabled, execution_order, schedule_id);
CREATE INDEX IF NOT EXISTS idx_schedule_run_times_schedule
  ON schedule_run_times(schedule_id, enabled, time_of_day);
CREATE INDEX IF NOT EXISTS idx_task_runs_status_queued_at
  ON task_runs(status, queued_at);
CREATE INDEX IF NOT EXISTS idx_task_runs_profile_queued_at
  ON task_runs(profile_id, queued_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_task_runs_schedule_planned_fire
  ON task_runs(schedule_id, planned_fire_at)
  WHERE schedule_id IS NOT NULL AND planned_fire_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_task_run_history_status_finished_at
  ON task_run_history(status, finished_at);
CREATE INDEX IF NOT EXISTS idx_task_run_history_profile_finished_at
  ON task_run_history(profile_id, finished_at);
CREATE INDEX IF NOT EXISTS idx_task_seen_items_recency
  ON task_seen_items(task_id, provider, first_seen_at);
CREATE INDEX IF NOT EXISTS idx_day_memory_events_day_layer
  ON day_memory_events(day, layer, event_id);
CREATE INDEX IF NOT EXISTS idx_day_memory_status_finalized
  ON day_memory_status(is_finalized);
CREATE INDEX IF NOT EXISTS idx_memory_summary_jobs_status_created
  ON memory_summary_jobs(status, created_at, job_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_memory_summary_jobs_day_active
  ON memory_summary_jobs(day)
  WHERE status IN ('queued', 'running');
"#;

/// SQLite store with a single serialized writer connection.
pub struct CoreStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl CoreStore {
    /// Open (creating parents and schema as needed) a file-backed store.
    pub fn open<P: AsRef<Path>>(db_path: P, busy_timeout_ms: i64) -> SqliteResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", busy_timeout_ms.max(0))?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        };
        store.init()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> SqliteResult<T>,
    ) -> SqliteResult<T> {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }

    // ============ Heartbeat state ============

    pub fn record_heartbeat(
        &self,
        started_at: &str,
        finished_at: &str,
        status: &str,
        enqueued_count: i64,
        error: Option<&str>,
    ) -> SqliteResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO heartbeat_state
                   (id, last_started_at, last_finished_at, last_status, last_enqueued_count, last_error)
                 VALUES ('main', ?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   last_started_at = excluded.last_started_at,
                   last_finished_at = excluded.last_finished_at,
                   last_status = excluded.last_status,
                   last_enqueued_count = excluded.last_enqueued_count,
                   last_error = excluded.last_error",
                params![started_at, finished_at, status, enqueued_count, error],
            )?;
            Ok(())
        })
    }

    pub fn get_heartbeat(&self) -> SqliteResult<HeartbeatState> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT last_started_at, last_finished_at, last_status,
                            last_enqueued_count, last_error
                     FROM heartbeat_state WHERE id = 'main'",
                    [],
                    |row| {
                        Ok(HeartbeatState {
                            last_started_at: row.get(0)?,
                            last_finished_at: row.get(1)?,
                            last_status: row.get(2)?,
                            last_enqueued_count: row.get(3)?,
                            last_error: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row.unwrap_or_default())
        })
    }

    // ============ Raw SQL (gateway path) ============

    /// Execute a read statement, returning rows as JSON objects capped at
    /// `max_rows`. The second element reports truncation.
    pub fn raw_query(
        &self,
        sql: &str,
        args: &[Value],
        max_rows: usize,
    ) -> SqliteResult<(Vec<Value>, bool)> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(|c| c.to_string())
                .collect();
            let params = json_params(args);
            let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

            let mut out = Vec::new();
            let mut truncated = false;
            while let Some(row) = rows.next()? {
                if out.len() >= max_rows {
                    truncated = true;
                    break;
                }
                let mut obj = serde_json::Map::new();
                for (idx, name) in columns.iter().enumerate() {
                    obj.insert(name.clone(), value_ref_to_json(row.get_ref(idx)?));
                }
                out.push(Value::Object(obj));
            }
            Ok((out, truncated))
        })
    }

    /// Execute a write statement, returning affected rows.
    pub fn raw_execute(&self, sql: &str, args: &[Value]) -> SqliteResult<usize> {
        self.with_conn(|conn| {
            let params = json_params(args);
            conn.execute(sql, rusqlite::params_from_iter(params))
        })
    }
}

fn json_params(args: &[Value]) -> Vec<rusqlite::types::Value> {
    args.iter().map(json_to_sql_value).collect()
}

fn json_to_sql_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_initializes() {
        let store = CoreStore::open_in_memory().unwrap();
        let (rows, truncated) = store
            .raw_query(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                &[],
                100,
            )
            .unwrap();
        assert!(!truncated);
        let names: Vec<&str> = rows
            .iter()
            .filter_map(|r| r.get("name").and_then(|v| v.as_str()))
            .collect();
        for table in [
            "task_profiles",
            "schedules",
            "task_runs",
            "task_run_history",
            "task_seen_items",
            "task_state",
            "day_memory_events",
            "day_memory_status",
            "memory_summary_jobs",
            "day_summaries",
            "heartbeat_state",
        ] {
            assert!(names.contains(&table), "missing table {table}");
        }
    }

    #[test]
    fn test_raw_query_truncation() {
        let store = CoreStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .raw_execute(
                    "INSERT INTO task_state (task_id, state_key, value_json, updated_by, updated_at)
                     VALUES (?1, ?2, '{}', 'test', '2026-01-01T00:00:00+00:00')",
                    &[json!("t"), json!(format!("k{i}"))],
                )
                .unwrap();
        }
        let (rows, truncated) = store
            .raw_query("SELECT state_key FROM task_state ORDER BY state_key", &[], 3)
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(truncated);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let store = CoreStore::open_in_memory().unwrap();
        assert_eq!(store.get_heartbeat().unwrap().last_enqueued_count, 0);

        store
            .record_heartbeat(
                "2026-01-01T00:00:00+00:00",
                "2026-01-01T00:00:01+00:00",
                "ok",
                4,
                None,
            )
            .unwrap();
        let hb = store.get_heartbeat().unwrap();
        assert_eq!(hb.last_status.as_deref(), Some("ok"));
        assert_eq!(hb.last_enqueued_count, 4);
        assert!(hb.last_error.is_none());

        store
            .record_heartbeat(
                "2026-01-01T00:01:00+00:00",
                "2026-01-01T00:01:01+00:00",
                "error",
                0,
                Some("boom"),
            )
            .unwrap();
        let hb = store.get_heartbeat().unwrap();
        assert_eq!(hb.last_error.as_deref(), Some("boom"));
    }
}
