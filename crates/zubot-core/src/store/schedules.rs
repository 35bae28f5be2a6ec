//! Task profile and schedule operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};

use super::CoreStore;
use crate::types::{
    iso, parse_iso, MisfirePolicy, RunTimeSpec, Schedule, ScheduleMode, TaskKind, TaskProfile,
};

pub(crate) const WEEKDAY_ORDER: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// A run the heartbeat decided to enqueue for a schedule.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub run_id: String,
    pub profile_id: String,
    pub planned_fire_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl CoreStore {
    // ============ Task profiles ============

    pub fn upsert_profile(&self, profile: &TaskProfile) -> SqliteResult<()> {
        let now = iso(Utc::now());
        let args_json = serde_json::to_string(&profile.args).unwrap_or_else(|_| "[]".into());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_profiles
                   (task_id, name, kind, entrypoint_path, args_json, module, queue_group,
                    timeout_sec, retry_policy, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT(task_id) DO UPDATE SET
                   name = excluded.name,
                   kind = excluded.kind,
                   entrypoint_path = excluded.entrypoint_path,
                   args_json = excluded.args_json,
                   module = excluded.module,
                   queue_group = excluded.queue_group,
                   timeout_sec = excluded.timeout_sec,
                   retry_policy = excluded.retry_policy,
                   enabled = excluded.enabled,
                   updated_at = excluded.updated_at",
                params![
                    profile.task_id,
                    profile.name,
                    profile.kind.as_str(),
                    profile.entrypoint_path,
                    args_json,
                    profile.module,
                    profile.queue_group,
                    profile.timeout_sec,
                    profile.retry_policy,
                    profile.enabled,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, task_id: &str) -> SqliteResult<Option<TaskProfile>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT task_id, name, kind, entrypoint_path, args_json, module, queue_group,
                        timeout_sec, retry_policy, enabled, created_at, updated_at
                 FROM task_profiles WHERE task_id = ?1",
                params![task_id],
                row_to_profile,
            )
            .optional()
        })
    }

    pub fn list_profiles(&self) -> SqliteResult<Vec<TaskProfile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, name, kind, entrypoint_path, args_json, module, queue_group,
                        timeout_sec, retry_policy, enabled, created_at, updated_at
                 FROM task_profiles ORDER BY task_id ASC",
            )?;
            let rows = stmt.query_map([], row_to_profile)?;
            rows.collect()
        })
    }

    /// Deleting a profile cascades to its schedules and, from there, detaches
    /// run rows (schedule_id goes NULL).
    pub fn delete_profile(&self, task_id: &str) -> SqliteResult<usize> {
        self.with_conn(|conn| conn.execute("DELETE FROM task_profiles WHERE task_id = ?1", params![task_id]))
    }

    // ============ Schedules ============

    /// Insert or update a schedule. On insert the cursor starts at `now`
    /// (due immediately; the first tick resolves the real fire sequence).
    /// On update the `last_planned_run_at` cursor is preserved and
    /// `next_run_at` is reset to `now` so edits take effect next tick.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_schedule(
        &self,
        schedule_id: &str,
        profile_id: &str,
        enabled: bool,
        mode: ScheduleMode,
        misfire_policy: MisfirePolicy,
        execution_order: i64,
        run_frequency_minutes: Option<i64>,
        run_times: &[RunTimeSpec],
        days_of_week: &[String],
        now: DateTime<Utc>,
    ) -> SqliteResult<()> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO schedules
                   (schedule_id, profile_id, enabled, mode, misfire_policy, execution_order,
                    run_frequency_minutes, next_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(schedule_id) DO UPDATE SET
                   profile_id = excluded.profile_id,
                   enabled = excluded.enabled,
                   mode = excluded.mode,
                   misfire_policy = excluded.misfire_policy,
                   execution_order = excluded.execution_order,
                   run_frequency_minutes = excluded.run_frequency_minutes,
                   next_run_at = excluded.next_run_at,
                   updated_at = excluded.updated_at",
                params![
                    schedule_id,
                    profile_id,
                    enabled,
                    mode.as_str(),
                    misfire_policy.as_str(),
                    execution_order,
                    run_frequency_minutes,
                    now_iso,
                    now_iso,
                ],
            )?;

            tx.execute(
                "DELETE FROM schedule_run_times WHERE schedule_id = ?1",
                params![schedule_id],
            )?;
            for spec in run_times {
                tx.execute(
                    "INSERT INTO schedule_run_times
                       (schedule_id, time_of_day, timezone, enabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![schedule_id, spec.time_of_day, spec.timezone, spec.enabled, now_iso],
                )?;
            }

            tx.execute(
                "DELETE FROM schedule_days_of_week WHERE schedule_id = ?1",
                params![schedule_id],
            )?;
            for day in days_of_week {
                tx.execute(
                    "INSERT OR IGNORE INTO schedule_days_of_week (schedule_id, day_of_week, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![schedule_id, day, now_iso],
                )?;
            }

            tx.commit()
        })
    }

    pub fn get_schedule(&self, schedule_id: &str) -> SqliteResult<Option<Schedule>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_SCHEDULE} WHERE schedule_id = ?1"),
                    params![schedule_id],
                    row_to_schedule,
                )
                .optional()?;
            match row {
                Some(mut schedule) => {
                    load_schedule_children(conn, &mut schedule)?;
                    Ok(Some(schedule))
                }
                None => Ok(None),
            }
        })
    }

    pub fn list_schedules(&self) -> SqliteResult<Vec<Schedule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SCHEDULE} ORDER BY execution_order ASC, schedule_id ASC"
            ))?;
            let mut schedules: Vec<Schedule> =
                stmt.query_map([], row_to_schedule)?.collect::<SqliteResult<_>>()?;
            for schedule in &mut schedules {
                load_schedule_children(conn, schedule)?;
            }
            Ok(schedules)
        })
    }

    /// Enabled schedules whose cursor is due, in dispatch order.
    pub fn list_due_schedules(&self, now: DateTime<Utc>) -> SqliteResult<Vec<Schedule>> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SCHEDULE}
                 WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY execution_order ASC, schedule_id ASC"
            ))?;
            let mut schedules: Vec<Schedule> = stmt
                .query_map(params![now_iso], row_to_schedule)?
                .collect::<SqliteResult<_>>()?;
            for schedule in &mut schedules {
                load_schedule_children(conn, schedule)?;
            }
            Ok(schedules)
        })
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> SqliteResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM schedules WHERE schedule_id = ?1",
                params![schedule_id],
            )
        })
    }

    /// Apply one schedule's tick plan atomically: insert the selected runs
    /// and advance the cursor. Duplicate `(schedule_id, planned_fire_at)`
    /// inserts are swallowed by the partial unique index. Returns the run
    /// ids actually inserted.
    pub fn apply_schedule_plan(
        &self,
        schedule_id: &str,
        runs: &[PlannedRun],
        last_planned_run_at: Option<DateTime<Utc>>,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SqliteResult<Vec<String>> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = Vec::new();
            for run in runs {
                let changed = tx.execute(
                    "INSERT OR IGNORE INTO task_runs
                       (run_id, schedule_id, profile_id, status, planned_fire_at, queued_at, payload_json)
                     VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6)",
                    params![
                        run.run_id,
                        schedule_id,
                        run.profile_id,
                        iso(run.planned_fire_at),
                        now_iso,
                        run.payload.to_string(),
                    ],
                )?;
                if changed > 0 {
                    inserted.push(run.run_id.clone());
                }
            }
            tx.execute(
                "UPDATE schedules
                 SET last_planned_run_at = COALESCE(?2, last_planned_run_at),
                     next_run_at = ?3,
                     updated_at = ?4
                 WHERE schedule_id = ?1",
                params![
                    schedule_id,
                    last_planned_run_at.map(iso),
                    iso(next_run_at),
                    now_iso,
                ],
            )?;
            tx.commit()?;
            Ok(inserted)
        })
    }
}

const SELECT_SCHEDULE: &str = "SELECT schedule_id, profile_id, enabled, mode, misfire_policy,
        execution_order, run_frequency_minutes, next_run_at, last_planned_run_at,
        last_run_at, last_successful_run_at, last_status, last_summary, last_error,
        created_at, updated_at
 FROM schedules";

fn row_to_profile(row: &Row) -> SqliteResult<TaskProfile> {
    let kind_str: String = row.get("kind")?;
    let args_json: String = row.get("args_json")?;
    Ok(TaskProfile {
        task_id: row.get("task_id")?,
        name: row.get("name")?,
        kind: TaskKind::from_str(&kind_str).unwrap_or(TaskKind::Script),
        entrypoint_path: row.get("entrypoint_path")?,
        args: serde_json::from_str(&args_json).unwrap_or_default(),
        module: row.get("module")?,
        queue_group: row.get("queue_group")?,
        timeout_sec: row.get("timeout_sec")?,
        retry_policy: row.get("retry_policy")?,
        enabled: row.get("enabled")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_schedule(row: &Row) -> SqliteResult<Schedule> {
    let mode_str: String = row.get("mode")?;
    let misfire_str: String = row.get("misfire_policy")?;
    let next_run_at: Option<String> = row.get("next_run_at")?;
    let last_planned: Option<String> = row.get("last_planned_run_at")?;
    Ok(Schedule {
        schedule_id: row.get("schedule_id")?,
        profile_id: row.get("profile_id")?,
        enabled: row.get("enabled")?,
        mode: ScheduleMode::from_str(&mode_str).unwrap_or(ScheduleMode::Frequency),
        misfire_policy: MisfirePolicy::from_str(&misfire_str).unwrap_or(MisfirePolicy::QueueLatest),
        execution_order: row.get("execution_order")?,
        run_frequency_minutes: row.get("run_frequency_minutes")?,
        next_run_at: next_run_at.as_deref().and_then(parse_iso),
        last_planned_run_at: last_planned.as_deref().and_then(parse_iso),
        last_run_at: row.get("last_run_at")?,
        last_successful_run_at: row.get("last_successful_run_at")?,
        last_status: row.get("last_status")?,
        last_summary: row.get("last_summary")?,
        last_error: row.get("last_error")?,
        run_times: Vec::new(),
        days_of_week: Vec::new(),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn load_schedule_children(conn: &Connection, schedule: &mut Schedule) -> SqliteResult<()> {
    let mut stmt = conn.prepare(
        "SELECT time_of_day, timezone, enabled
         FROM schedule_run_times
         WHERE schedule_id = ?1
         ORDER BY time_of_day ASC",
    )?;
    schedule.run_times = stmt
        .query_map(params![schedule.schedule_id], |row| {
            Ok(RunTimeSpec {
                time_of_day: row.get(0)?,
                timezone: row.get(1)?,
                enabled: row.get(2)?,
            })
        })?
        .collect::<SqliteResult<_>>()?;

    let mut stmt = conn.prepare(
        "SELECT day_of_week FROM schedule_days_of_week WHERE schedule_id = ?1",
    )?;
    let mut days: Vec<String> = stmt
        .query_map(params![schedule.schedule_id], |row| row.get(0))?
        .collect::<SqliteResult<_>>()?;
    days.sort_by_key(|day| WEEKDAY_ORDER.iter().position(|d| d == day).unwrap_or(99));
    schedule.days_of_week = days;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{at, script_profile, store};
    use super::*;

    #[test]
    fn test_profile_crud() {
        let store = store();
        let mut profile = script_profile("echo");
        store.upsert_profile(&profile).unwrap();

        let loaded = store.get_profile("echo").unwrap().unwrap();
        assert_eq!(loaded.kind, TaskKind::Script);
        assert_eq!(loaded.entrypoint_path.as_deref(), Some("tasks/echo.sh"));

        profile.name = "Echo Task".to_string();
        profile.timeout_sec = 60;
        store.upsert_profile(&profile).unwrap();
        let loaded = store.get_profile("echo").unwrap().unwrap();
        assert_eq!(loaded.name, "Echo Task");
        assert_eq!(loaded.timeout_sec, 60);

        assert_eq!(store.list_profiles().unwrap().len(), 1);
        assert_eq!(store.delete_profile("echo").unwrap(), 1);
        assert!(store.get_profile("echo").unwrap().is_none());
    }

    #[test]
    fn test_schedule_upsert_initializes_cursor() {
        let store = store();
        store.upsert_profile(&script_profile("echo")).unwrap();
        let now = at("2026-03-01T12:00:00+00:00");
        store
            .upsert_schedule(
                "sched_echo",
                "echo",
                true,
                ScheduleMode::Frequency,
                MisfirePolicy::QueueLatest,
                100,
                Some(5),
                &[],
                &[],
                now,
            )
            .unwrap();

        let schedule = store.get_schedule("sched_echo").unwrap().unwrap();
        assert_eq!(schedule.next_run_at, Some(now));
        assert!(schedule.last_planned_run_at.is_none());
        assert_eq!(schedule.misfire_policy, MisfirePolicy::QueueLatest);
    }

    #[test]
    fn test_schedule_children_roundtrip() {
        let store = store();
        store.upsert_profile(&script_profile("daily")).unwrap();
        let now = at("2026-03-01T12:00:00+00:00");
        let run_times = vec![
            RunTimeSpec {
                time_of_day: "09:00".into(),
                timezone: "America/New_York".into(),
                enabled: true,
            },
            RunTimeSpec {
                time_of_day: "17:30".into(),
                timezone: "America/New_York".into(),
                enabled: true,
            },
        ];
        let days = vec!["sat".to_string(), "mon".to_string()];
        store
            .upsert_schedule(
                "sched_daily",
                "daily",
                true,
                ScheduleMode::Calendar,
                MisfirePolicy::Skip,
                10,
                None,
                &run_times,
                &days,
                now,
            )
            .unwrap();

        let schedule = store.get_schedule("sched_daily").unwrap().unwrap();
        assert_eq!(schedule.run_times.len(), 2);
        assert_eq!(schedule.run_times[0].time_of_day, "09:00");
        // Weekdays come back in week order regardless of insert order.
        assert_eq!(schedule.days_of_week, vec!["mon", "sat"]);
    }

    #[test]
    fn test_list_due_schedules() {
        let store = store();
        store.upsert_profile(&script_profile("echo")).unwrap();
        store.upsert_profile(&script_profile("other")).unwrap();
        let created = at("2026-03-01T12:00:00+00:00");
        for (id, profile, order) in [("s_b", "echo", 200), ("s_a", "other", 50)] {
            store
                .upsert_schedule(
                    id,
                    profile,
                    true,
                    ScheduleMode::Frequency,
                    MisfirePolicy::QueueLatest,
                    order,
                    Some(5),
                    &[],
                    &[],
                    created,
                )
                .unwrap();
        }

        let due = store
            .list_due_schedules(at("2026-03-01T12:00:01+00:00"))
            .unwrap();
        assert_eq!(due.len(), 2);
        // execution_order breaks the tie.
        assert_eq!(due[0].schedule_id, "s_a");

        let due = store
            .list_due_schedules(at("2026-03-01T11:59:59+00:00"))
            .unwrap();
        assert!(due.is_empty());
    }

    #[test]
    fn test_apply_schedule_plan_dedupes_planned_fire() {
        let store = store();
        store.upsert_profile(&script_profile("echo")).unwrap();
        let now = at("2026-03-01T12:00:00+00:00");
        store
            .upsert_schedule(
                "sched_echo",
                "echo",
                true,
                ScheduleMode::Frequency,
                MisfirePolicy::QueueAll,
                100,
                Some(5),
                &[],
                &[],
                now,
            )
            .unwrap();

        let fire = at("2026-03-01T12:05:00+00:00");
        let plan = vec![PlannedRun {
            run_id: "trun_1".into(),
            profile_id: "echo".into(),
            planned_fire_at: fire,
            payload: serde_json::json!({"trigger": "scheduled"}),
        }];
        let inserted = store
            .apply_schedule_plan("sched_echo", &plan, Some(fire), at("2026-03-01T12:10:00+00:00"), now)
            .unwrap();
        assert_eq!(inserted, vec!["trun_1".to_string()]);

        // Same planned fire instant again: structurally deduped.
        let dup = vec![PlannedRun {
            run_id: "trun_2".into(),
            profile_id: "echo".into(),
            planned_fire_at: fire,
            payload: serde_json::json!({"trigger": "scheduled"}),
        }];
        let inserted = store
            .apply_schedule_plan("sched_echo", &dup, Some(fire), at("2026-03-01T12:10:00+00:00"), now)
            .unwrap();
        assert!(inserted.is_empty());

        let schedule = store.get_schedule("sched_echo").unwrap().unwrap();
        assert_eq!(schedule.last_planned_run_at, Some(fire));
    }

    #[test]
    fn test_delete_profile_cascades_to_schedule() {
        let store = store();
        store.upsert_profile(&script_profile("echo")).unwrap();
        let now = at("2026-03-01T12:00:00+00:00");
        store
            .upsert_schedule(
                "sched_echo",
                "echo",
                true,
                ScheduleMode::Frequency,
                MisfirePolicy::QueueLatest,
                100,
                Some(5),
                &[],
                &[],
                now,
            )
            .unwrap();

        store.delete_profile("echo").unwrap();
        assert!(store.get_schedule("sched_echo").unwrap().is_none());
    }
}
