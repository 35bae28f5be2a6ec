//! Run queue and lifecycle operations.
//!
//! Claims are select-then-update under the connection lock; the no-overlap
//! rule is enforced both at enqueue and re-checked inside the claim query.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use serde_json::Value;

use super::CoreStore;
use crate::types::{
    iso, parse_iso, Run, RunStatus, RuntimeCounts, RuntimeMetrics, WaitingContract,
};

const SELECT_RUN: &str = "SELECT run_id, schedule_id, profile_id, status, planned_fire_at,
        queued_at, started_at, finished_at, summary, error, payload_json
 FROM task_runs";

const SELECT_HISTORY: &str = "SELECT run_id, schedule_id, profile_id, status, planned_fire_at,
        queued_at, started_at, finished_at, summary, error, payload_json
 FROM task_run_history";

impl CoreStore {
    /// Enqueue a manually triggered or ad-hoc run, subject to no-overlap.
    /// Returns `None` when the profile already has an active run.
    pub fn enqueue_run(
        &self,
        run_id: &str,
        profile_id: &str,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> SqliteResult<Option<Run>> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM task_runs
                 WHERE profile_id = ?1
                   AND status IN ('queued', 'running', 'waiting_for_user')",
                params![profile_id],
                |row| row.get(0),
            )?;
            if active > 0 {
                tx.commit()?;
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO task_runs (run_id, schedule_id, profile_id, status, queued_at, payload_json)
                 VALUES (?1, NULL, ?2, 'queued', ?3, ?4)",
                params![run_id, profile_id, now_iso, payload.to_string()],
            )?;
            let run = tx.query_row(
                &format!("{SELECT_RUN} WHERE run_id = ?1"),
                params![run_id],
                row_to_run,
            )?;
            tx.commit()?;
            Ok(Some(run))
        })
    }

    /// Claim the oldest queued run whose profile has no active run,
    /// transitioning it to running.
    pub fn claim_next_run(&self, now: DateTime<Utc>) -> SqliteResult<Option<Run>> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let run_id: Option<String> = tx
                .query_row(
                    "SELECT run_id FROM task_runs
                     WHERE status = 'queued'
                       AND profile_id NOT IN (
                         SELECT profile_id FROM task_runs
                         WHERE status IN ('running', 'waiting_for_user')
                       )
                     ORDER BY queued_at ASC, run_id ASC
                     LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(run_id) = run_id else {
                tx.commit()?;
                return Ok(None);
            };
            tx.execute(
                "UPDATE task_runs SET status = 'running', started_at = ?2
                 WHERE run_id = ?1 AND status = 'queued'",
                params![run_id, now_iso],
            )?;
            let run = tx.query_row(
                &format!("{SELECT_RUN} WHERE run_id = ?1"),
                params![run_id],
                row_to_run,
            )?;
            tx.commit()?;
            Ok(Some(run))
        })
    }

    pub fn get_run(&self, run_id: &str) -> SqliteResult<Option<Run>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{SELECT_RUN} WHERE run_id = ?1"),
                params![run_id],
                row_to_run,
            )
            .optional()
        })
    }

    pub fn list_runs(&self, limit: usize) -> SqliteResult<Vec<Run>> {
        let safe_limit = limit.clamp(1, 500) as i64;
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_RUN} ORDER BY queued_at DESC LIMIT ?1"))?;
            let rows = stmt.query_map(params![safe_limit], row_to_run)?.collect();
            rows
        })
    }

    pub fn list_runs_by_status(&self, status: RunStatus, limit: usize) -> SqliteResult<Vec<Run>> {
        let safe_limit = limit.clamp(1, 500) as i64;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_RUN} WHERE status = ?1 ORDER BY queued_at ASC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![status.as_str(), safe_limit], row_to_run)?
                .collect();
            rows
        })
    }

    pub fn list_run_history(&self, limit: usize) -> SqliteResult<Vec<Run>> {
        let safe_limit = limit.clamp(1, 500) as i64;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_HISTORY} ORDER BY COALESCE(finished_at, queued_at) DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![safe_limit], row_to_run)?.collect();
            rows
        })
    }

    pub fn has_active_run(&self, profile_id: &str) -> SqliteResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_runs
                 WHERE profile_id = ?1
                   AND status IN ('queued', 'running', 'waiting_for_user')",
                params![profile_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Terminal transition: stamp the run, archive a snapshot to history,
    /// and roll the parent schedule's last-run metadata, in one transaction.
    /// Returns false when the run is missing or already terminal.
    pub fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        summary: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> SqliteResult<bool> {
        debug_assert!(status.is_terminal());
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let done = complete_run_tx(&tx, run_id, status, summary, error, now)?;
            tx.commit()?;
            Ok(done)
        })
    }

    /// Persist a waiting contract and park the run. Only a running run can
    /// start waiting.
    pub fn mark_run_waiting(
        &self,
        run_id: &str,
        contract: &WaitingContract,
        _now: DateTime<Utc>,
    ) -> SqliteResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let payload: Option<String> = tx
                .query_row(
                    "SELECT payload_json FROM task_runs WHERE run_id = ?1 AND status = 'running'",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(payload) = payload else {
                tx.commit()?;
                return Ok(false);
            };
            let merged = merge_payload(
                &payload,
                "waiting",
                serde_json::to_value(contract).unwrap_or(Value::Null),
            );
            tx.execute(
                "UPDATE task_runs SET status = 'waiting_for_user', payload_json = ?2
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id, merged],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Resume a waiting run: merge the user response into the payload and
    /// put the run back on the queue.
    pub fn resume_run(
        &self,
        run_id: &str,
        response: &Value,
        now: DateTime<Utc>,
    ) -> SqliteResult<Option<Run>> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let payload: Option<String> = tx
                .query_row(
                    "SELECT payload_json FROM task_runs
                     WHERE run_id = ?1 AND status = 'waiting_for_user'",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(payload) = payload else {
                tx.commit()?;
                return Ok(None);
            };
            let merged = merge_payload(&payload, "user_response", response.clone());
            let merged = merge_payload(&merged, "resumed_at", Value::String(now_iso));
            tx.execute(
                "UPDATE task_runs
                 SET status = 'queued', started_at = NULL, payload_json = ?2
                 WHERE run_id = ?1 AND status = 'waiting_for_user'",
                params![run_id, merged],
            )?;
            let run = tx
                .query_row(
                    &format!("{SELECT_RUN} WHERE run_id = ?1"),
                    params![run_id],
                    row_to_run,
                )
                .optional()?;
            tx.commit()?;
            Ok(run)
        })
    }

    /// Expire waiting runs whose contract deadline has passed. Returns the
    /// runs that were transitioned.
    pub fn expire_waiting_runs(&self, now: DateTime<Utc>) -> SqliteResult<Vec<Run>> {
        let waiting = self.list_runs_by_status(RunStatus::WaitingForUser, 500)?;
        let mut expired = Vec::new();
        for run in waiting {
            let deadline = run
                .waiting_contract()
                .and_then(|c| parse_iso(&c.expires_at));
            let is_past = match deadline {
                Some(deadline) => deadline <= now,
                // A waiting run without a parseable deadline can never be
                // released by the user path, so it expires too.
                None => true,
            };
            if !is_past {
                continue;
            }
            if self.complete_run(
                &run.run_id,
                RunStatus::Blocked,
                None,
                Some("waiting_for_user_timeout"),
                now,
            )? {
                expired.push(run);
            }
        }
        Ok(expired)
    }

    pub fn runtime_counts(&self) -> SqliteResult<RuntimeCounts> {
        self.with_conn(|conn| {
            let mut count_for = |status: &str| -> SqliteResult<i64> {
                conn.query_row(
                    "SELECT COUNT(*) FROM task_runs WHERE status = ?1",
                    params![status],
                    |row| row.get(0),
                )
            };
            Ok(RuntimeCounts {
                queued_count: count_for("queued")?,
                running_count: count_for("running")?,
                waiting_count: count_for("waiting_for_user")?,
            })
        })
    }

    pub fn runtime_metrics(&self, now: DateTime<Utc>) -> SqliteResult<RuntimeMetrics> {
        self.with_conn(|conn| {
            let oldest_queued: Option<String> = conn.query_row(
                "SELECT MIN(queued_at) FROM task_runs WHERE status = 'queued'",
                [],
                |row| row.get(0),
            )?;
            let oldest_running: Option<String> = conn.query_row(
                "SELECT MIN(started_at) FROM task_runs WHERE status = 'running'",
                [],
                |row| row.get(0),
            )?;
            let waiting_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_runs WHERE status = 'waiting_for_user'",
                [],
                |row| row.get(0),
            )?;
            let age = |value: Option<String>| {
                value
                    .as_deref()
                    .and_then(parse_iso)
                    .map(|dt| ((now - dt).num_milliseconds() as f64 / 1000.0).max(0.0))
            };
            Ok(RuntimeMetrics {
                oldest_queued_age_sec: age(oldest_queued),
                longest_running_age_sec: age(oldest_running),
                waiting_count,
            })
        })
    }

    /// Retention: drop archived runs older than `max_age_days` and keep at
    /// most `max_history_rows` terminal snapshots.
    pub fn prune_runs(
        &self,
        max_age_days: i64,
        max_history_rows: i64,
        now: DateTime<Utc>,
    ) -> SqliteResult<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0usize;

            if max_age_days >= 0 {
                let cutoff = iso(now - Duration::days(max_age_days));
                let old: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT run_id FROM task_run_history
                         WHERE COALESCE(finished_at, queued_at) < ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![cutoff], |row| row.get(0))?
                        .collect::<SqliteResult<_>>()?;
                    rows
                };
                for run_id in old {
                    deleted += tx.execute(
                        "DELETE FROM task_run_history WHERE run_id = ?1",
                        params![run_id],
                    )?;
                    deleted += tx.execute(
                        "DELETE FROM task_runs WHERE run_id = ?1 AND status IN ('done', 'failed', 'blocked')",
                        params![run_id],
                    )?;
                }
            }

            if max_history_rows >= 0 {
                let overflow: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT run_id FROM task_run_history
                         ORDER BY COALESCE(finished_at, queued_at) DESC
                         LIMIT -1 OFFSET ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![max_history_rows], |row| row.get(0))?
                        .collect::<SqliteResult<_>>()?;
                    rows
                };
                for run_id in overflow {
                    deleted += tx.execute(
                        "DELETE FROM task_run_history WHERE run_id = ?1",
                        params![run_id],
                    )?;
                    deleted += tx.execute(
                        "DELETE FROM task_runs WHERE run_id = ?1 AND status IN ('done', 'failed', 'blocked')",
                        params![run_id],
                    )?;
                }
            }

            tx.commit()?;
            Ok(deleted)
        })
    }
}

fn complete_run_tx(
    tx: &Connection,
    run_id: &str,
    status: RunStatus,
    summary: Option<&str>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> SqliteResult<bool> {
    let now_iso = iso(now);
    let current: Option<(String, Option<String>)> = tx
        .query_row(
            "SELECT status, schedule_id FROM task_runs WHERE run_id = ?1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((current_status, schedule_id)) = current else {
        return Ok(false);
    };
    if RunStatus::from_str(&current_status).is_some_and(|s| s.is_terminal()) {
        return Ok(false);
    }

    tx.execute(
        "UPDATE task_runs SET status = ?2, finished_at = ?3, summary = ?4, error = ?5
         WHERE run_id = ?1",
        params![run_id, status.as_str(), now_iso, summary, error],
    )?;
    tx.execute(
        "INSERT INTO task_run_history
           (run_id, schedule_id, profile_id, status, planned_fire_at, queued_at,
            started_at, finished_at, summary, error, payload_json, archived_at)
         SELECT run_id, schedule_id, profile_id, status, planned_fire_at, queued_at,
                started_at, finished_at, summary, error, payload_json, ?2
         FROM task_runs WHERE run_id = ?1
         ON CONFLICT(run_id) DO UPDATE SET
           status = excluded.status,
           started_at = excluded.started_at,
           finished_at = excluded.finished_at,
           summary = excluded.summary,
           error = excluded.error,
           payload_json = excluded.payload_json,
           archived_at = excluded.archived_at",
        params![run_id, now_iso],
    )?;

    if let Some(schedule_id) = schedule_id {
        let successful_at = (status == RunStatus::Done).then(|| now_iso.clone());
        tx.execute(
            "UPDATE schedules
             SET last_run_at = ?2,
                 last_successful_run_at = COALESCE(?3, last_successful_run_at),
                 last_status = ?4,
                 last_summary = ?5,
                 last_error = ?6,
                 updated_at = ?2
             WHERE schedule_id = ?1",
            params![schedule_id, now_iso, successful_at, status.as_str(), summary, error],
        )?;
    }
    Ok(true)
}

fn merge_payload(payload_json: &str, key: &str, value: Value) -> String {
    let mut payload: Value =
        serde_json::from_str(payload_json).unwrap_or_else(|_| Value::Object(Default::default()));
    if !payload.is_object() {
        payload = Value::Object(Default::default());
    }
    if let Some(map) = payload.as_object_mut() {
        map.insert(key.to_string(), value);
    }
    payload.to_string()
}

fn row_to_run(row: &Row) -> SqliteResult<Run> {
    let status_str: String = row.get("status")?;
    let planned: Option<String> = row.get("planned_fire_at")?;
    let queued_at: String = row.get("queued_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    let payload_json: String = row.get("payload_json")?;
    Ok(Run {
        run_id: row.get("run_id")?,
        schedule_id: row.get("schedule_id")?,
        profile_id: row.get("profile_id")?,
        status: RunStatus::from_str(&status_str).unwrap_or(RunStatus::Queued),
        planned_fire_at: planned.as_deref().and_then(parse_iso),
        queued_at: parse_iso(&queued_at).unwrap_or_else(Utc::now),
        started_at: started_at.as_deref().and_then(parse_iso),
        finished_at: finished_at.as_deref().and_then(parse_iso),
        summary: row.get("summary")?,
        error: row.get("error")?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
    })
}
