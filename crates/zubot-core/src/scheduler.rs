//! Heartbeat scheduler: decides what should run, never executes.
//!
//! Each tick reads due schedules, expands the missed fire instants in the
//! window `(last_planned_run_at, now]`, applies the misfire policy, and
//! advances the cursor transactionally. The clock is always passed in so the
//! whole tick is drivable from tests.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{CoreStore, PlannedRun};
use crate::types::{iso, MisfirePolicy, Run, RunStatus, Schedule, ScheduleMode};

/// Fresh calendar schedules only fire within this window after an instant.
pub const DEFAULT_CALENDAR_CATCHUP_MINUTES: i64 = 180;

/// Runaway guard for backlog expansion (a week of 1-minute cadence).
const MAX_BACKLOG_INSTANTS: usize = 500;

const WEEKDAY_ORDER: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// One run the tick enqueued.
#[derive(Debug, Clone)]
pub struct EnqueuedRun {
    pub run_id: String,
    pub schedule_id: String,
    pub profile_id: String,
    pub execution_order: i64,
}

/// Result of one heartbeat tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub enqueued: Vec<EnqueuedRun>,
    pub errors: Vec<String>,
}

pub struct Heartbeat {
    store: Arc<CoreStore>,
}

impl Heartbeat {
    pub fn new(store: Arc<CoreStore>) -> Self {
        Self { store }
    }

    /// Inspect due schedules and enqueue runs per misfire policy. Partial
    /// failures are collected; the heartbeat row records the final status.
    pub fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let started = iso(now);
        let mut outcome = TickOutcome::default();

        let due = match self.store.list_due_schedules(now) {
            Ok(due) => due,
            Err(e) => {
                let msg = format!("list_due_schedules: {e}");
                let _ = self
                    .store
                    .record_heartbeat(&started, &iso(Utc::now()), "error", 0, Some(&msg));
                outcome.errors.push(msg);
                return outcome;
            }
        };

        for schedule in due {
            if let Err(e) = self.tick_schedule(&schedule, now, &mut outcome) {
                let msg = format!("schedule {}: {e}", schedule.schedule_id);
                warn!(schedule_id = %schedule.schedule_id, error = %e, "Heartbeat tick failed for schedule");
                outcome.errors.push(msg);
            }
        }

        // Enqueue order within the tick follows execution_order, then id.
        outcome
            .enqueued
            .sort_by(|a, b| (a.execution_order, &a.schedule_id).cmp(&(b.execution_order, &b.schedule_id)));

        let status = if outcome.errors.is_empty() { "ok" } else { "error" };
        let error = (!outcome.errors.is_empty()).then(|| outcome.errors.join("; "));
        let _ = self.store.record_heartbeat(
            &started,
            &iso(Utc::now()),
            status,
            outcome.enqueued.len() as i64,
            error.as_deref(),
        );
        outcome
    }

    fn tick_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        outcome: &mut TickOutcome,
    ) -> anyhow::Result<()> {
        let missed = missed_instants(schedule, now);
        let new_last_planned = missed.last().copied();

        let mut selected: Vec<DateTime<Utc>> = match schedule.misfire_policy {
            MisfirePolicy::QueueAll => missed.clone(),
            MisfirePolicy::QueueLatest => missed.last().copied().into_iter().collect(),
            MisfirePolicy::Skip => Vec::new(),
        };

        // No-overlap: an active run for the profile blocks this tick's
        // enqueue, but the cursor still advances so no backlog accumulates.
        if !selected.is_empty() && self.store.has_active_run(&schedule.profile_id)? {
            debug!(
                schedule_id = %schedule.schedule_id,
                profile_id = %schedule.profile_id,
                "Active run exists; skipping enqueue for this tick"
            );
            selected.clear();
        }

        let cursor_anchor = new_last_planned.or(schedule.last_planned_run_at);
        let next_run_at = next_fire_after(schedule, cursor_anchor, now)
            // A schedule with no computable future instant re-arms in a day
            // rather than hot-looping the heartbeat.
            .unwrap_or_else(|| now + Duration::days(1));

        let planned: Vec<PlannedRun> = selected
            .iter()
            .map(|fire| PlannedRun {
                run_id: format!("trun_{}", Uuid::new_v4().simple()),
                profile_id: schedule.profile_id.clone(),
                planned_fire_at: *fire,
                payload: serde_json::json!({
                    "schedule_id": schedule.schedule_id,
                    "profile_id": schedule.profile_id,
                    "trigger": "scheduled",
                    "enqueued_at": iso(now),
                    "mode": schedule.mode.as_str(),
                    "scheduled_fire_time": iso(*fire),
                }),
            })
            .collect();

        let inserted = self.store.apply_schedule_plan(
            &schedule.schedule_id,
            &planned,
            new_last_planned,
            next_run_at,
            now,
        )?;

        for run_id in inserted {
            outcome.enqueued.push(EnqueuedRun {
                run_id,
                schedule_id: schedule.schedule_id.clone(),
                profile_id: schedule.profile_id.clone(),
                execution_order: schedule.execution_order,
            });
        }
        Ok(())
    }

    /// Housekeeping shared with the heartbeat loop: expire waiting runs past
    /// their contract deadline.
    pub fn expire_waiting(&self, now: DateTime<Utc>) -> Vec<Run> {
        match self.store.expire_waiting_runs(now) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "Failed to expire waiting runs");
                Vec::new()
            }
        }
    }

    /// Housekeeping: history retention.
    pub fn prune_history(&self, max_age_days: i64, max_rows: i64, now: DateTime<Utc>) {
        match self.store.prune_runs(max_age_days, max_rows, now) {
            Ok(0) => {}
            Ok(n) => debug!(deleted = n, "Pruned run history"),
            Err(e) => warn!(error = %e, "Failed to prune run history"),
        }
    }

    pub fn store(&self) -> &Arc<CoreStore> {
        &self.store
    }
}

/// All fire instants this schedule missed in `(last_planned_run_at, now]`,
/// ascending.
pub fn missed_instants(schedule: &Schedule, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    match schedule.mode {
        ScheduleMode::Frequency => missed_frequency_instants(schedule, now),
        ScheduleMode::Calendar => missed_calendar_instants(schedule, now),
    }
}

fn missed_frequency_instants(schedule: &Schedule, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let Some(minutes) = schedule.run_frequency_minutes.filter(|m| *m > 0) else {
        return Vec::new();
    };
    let step = Duration::minutes(minutes);
    let mut t = match schedule.last_planned_run_at {
        Some(last_planned) => last_planned + step,
        // Fresh schedule: the sequence anchors at the cursor stamped on
        // creation, and that first instant itself is due.
        None => match schedule.next_run_at {
            Some(next) => next,
            None => now,
        },
    };
    let mut out = Vec::new();
    while t <= now && out.len() < MAX_BACKLOG_INSTANTS {
        out.push(t);
        t += step;
    }
    out
}

fn missed_calendar_instants(schedule: &Schedule, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    // A fresh calendar schedule only looks back through the catch-up window;
    // once a cursor exists the full (last_planned_run_at, now] window applies.
    let floor = schedule
        .last_planned_run_at
        .unwrap_or_else(|| now - Duration::minutes(DEFAULT_CALENDAR_CATCHUP_MINUTES));
    if floor >= now {
        return Vec::new();
    }

    let mut out: Vec<DateTime<Utc>> = Vec::new();
    for spec in schedule.run_times.iter().filter(|s| s.enabled) {
        let Ok(tz) = spec.timezone.parse::<Tz>() else {
            continue;
        };
        let Some((hour, minute)) = parse_time_of_day(&spec.time_of_day) else {
            continue;
        };

        // Candidate days span the window in local time, padded one day on
        // each side to absorb timezone offsets.
        let start_date = floor.with_timezone(&tz).date_naive() - Duration::days(1);
        let end_date = now.with_timezone(&tz).date_naive() + Duration::days(1);
        let mut date = start_date;
        while date <= end_date && out.len() < MAX_BACKLOG_INSTANTS {
            if weekday_allowed(&schedule.days_of_week, date) {
                if let Some(instant) = local_instant(tz, date, hour, minute) {
                    if instant > floor && instant <= now {
                        out.push(instant);
                    }
                }
            }
            date += Duration::days(1);
        }
    }
    out.sort();
    out.dedup();
    out.truncate(MAX_BACKLOG_INSTANTS);
    out
}

/// Earliest fire instant strictly after `after`, given the (possibly just
/// advanced) cursor anchor.
pub fn next_fire_after(
    schedule: &Schedule,
    anchor: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule.mode {
        ScheduleMode::Frequency => {
            let minutes = schedule.run_frequency_minutes.filter(|m| *m > 0)?;
            let step = Duration::minutes(minutes);
            let anchor = anchor.or(schedule.next_run_at).unwrap_or(after);
            if anchor > after {
                return Some(anchor);
            }
            let elapsed = (after - anchor).num_milliseconds();
            let step_ms = step.num_milliseconds().max(1);
            let k = elapsed / step_ms + 1;
            Some(anchor + Duration::milliseconds(step_ms * k))
        }
        ScheduleMode::Calendar => {
            let mut best: Option<DateTime<Utc>> = None;
            for spec in schedule.run_times.iter().filter(|s| s.enabled) {
                let Ok(tz) = spec.timezone.parse::<Tz>() else {
                    continue;
                };
                let Some((hour, minute)) = parse_time_of_day(&spec.time_of_day) else {
                    continue;
                };
                let local_date = after.with_timezone(&tz).date_naive();
                for delta in 0..15 {
                    let date = local_date + Duration::days(delta);
                    if !weekday_allowed(&schedule.days_of_week, date) {
                        continue;
                    }
                    if let Some(instant) = local_instant(tz, date, hour, minute) {
                        if instant > after {
                            best = Some(best.map_or(instant, |b: DateTime<Utc>| b.min(instant)));
                            break;
                        }
                    }
                }
            }
            best
        }
    }
}

pub(crate) fn parse_time_of_day(raw: &str) -> Option<(u32, u32)> {
    let (hour_str, minute_str) = raw.trim().split_once(':')?;
    let hour: u32 = hour_str.parse().ok()?;
    let minute: u32 = minute_str.parse().ok()?;
    (hour <= 23 && minute <= 59).then_some((hour, minute))
}

/// Normalize arbitrary day tokens to ordered `mon`..`sun`.
pub fn normalize_days_of_week(raw: &[String]) -> Vec<String> {
    let tokens: Vec<String> = raw
        .iter()
        .filter_map(|day| {
            let token: String = day.trim().to_lowercase().chars().take(3).collect();
            WEEKDAY_ORDER.contains(&token.as_str()).then_some(token)
        })
        .collect();
    WEEKDAY_ORDER
        .iter()
        .filter(|day| tokens.iter().any(|t| t == *day))
        .map(|day| day.to_string())
        .collect()
}

fn weekday_allowed(days: &[String], date: NaiveDate) -> bool {
    if days.is_empty() {
        return true;
    }
    let token = WEEKDAY_ORDER[date.weekday().num_days_from_monday() as usize];
    days.iter().any(|d| d == token)
}

fn local_instant(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    // DST gaps skip the day; ambiguous times take the earlier offset.
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{at, frequency_spec, script_profile, store};
    use crate::types::RunTimeSpec;

    fn heartbeat_with_frequency(
        minutes: i64,
        misfire: &str,
        created: DateTime<Utc>,
    ) -> (Heartbeat, String) {
        let store = Arc::new(store());
        store.upsert_profile(&script_profile("echo")).unwrap();
        let spec = frequency_spec("echo", minutes, misfire);
        let schedule_id = spec.schedule_id.clone().unwrap();
        store
            .upsert_schedule(
                &schedule_id,
                "echo",
                true,
                ScheduleMode::Frequency,
                crate::types::MisfirePolicy::from_str(misfire).unwrap(),
                100,
                Some(minutes),
                &[],
                &[],
                created,
            )
            .unwrap();
        (Heartbeat::new(store), schedule_id)
    }

    #[test]
    fn test_interval_catch_up_queue_latest() {
        // S1: 5-minute schedule, 37 minutes pass without a tick.
        let created = at("2026-03-01T12:00:00+00:00");
        let (hb, schedule_id) = heartbeat_with_frequency(5, "queue_latest", created);

        let now = at("2026-03-01T12:37:00+00:00");
        let outcome = hb.tick(now);
        assert_eq!(outcome.enqueued.len(), 1);
        assert!(outcome.errors.is_empty());

        let run = hb
            .store()
            .get_run(&outcome.enqueued[0].run_id)
            .unwrap()
            .unwrap();
        // The latest 5-minute boundary at or before now.
        assert_eq!(run.planned_fire_at, Some(at("2026-03-01T12:35:00+00:00")));
        assert_eq!(run.status, RunStatus::Queued);

        let schedule = hb.store().get_schedule(&schedule_id).unwrap().unwrap();
        assert_eq!(
            schedule.last_planned_run_at,
            Some(at("2026-03-01T12:35:00+00:00"))
        );
        // Strictly in the future.
        assert_eq!(schedule.next_run_at, Some(at("2026-03-01T12:40:00+00:00")));
    }

    #[test]
    fn test_queue_all_backlog() {
        // S2: after an initial tick establishes the cursor, a 3-interval gap
        // backfills three runs in planned order.
        let created = at("2026-03-01T12:00:00+00:00");
        let (hb, schedule_id) = heartbeat_with_frequency(5, "queue_all", created);

        let first = hb.tick(created);
        assert_eq!(first.enqueued.len(), 1);
        // Drain the first run so no-overlap does not suppress the backlog.
        let claimed = hb.store().claim_next_run(created).unwrap().unwrap();
        hb.store()
            .complete_run(&claimed.run_id, RunStatus::Done, Some("ok"), None, created)
            .unwrap();

        let now = at("2026-03-01T12:15:00+00:00");
        let outcome = hb.tick(now);
        assert_eq!(outcome.enqueued.len(), 3);

        let mut fires: Vec<_> = outcome
            .enqueued
            .iter()
            .map(|r| {
                hb.store()
                    .get_run(&r.run_id)
                    .unwrap()
                    .unwrap()
                    .planned_fire_at
                    .unwrap()
            })
            .collect();
        fires.sort();
        assert_eq!(
            fires,
            vec![
                at("2026-03-01T12:05:00+00:00"),
                at("2026-03-01T12:10:00+00:00"),
                at("2026-03-01T12:15:00+00:00"),
            ]
        );

        let schedule = hb.store().get_schedule(&schedule_id).unwrap().unwrap();
        assert_eq!(
            schedule.last_planned_run_at,
            Some(at("2026-03-01T12:15:00+00:00"))
        );
        assert_eq!(schedule.next_run_at, Some(at("2026-03-01T12:20:00+00:00")));
    }

    #[test]
    fn test_skip_policy_advances_cursor_only() {
        let created = at("2026-03-01T12:00:00+00:00");
        let (hb, schedule_id) = heartbeat_with_frequency(5, "skip", created);

        let outcome = hb.tick(at("2026-03-01T12:17:00+00:00"));
        assert!(outcome.enqueued.is_empty());

        let schedule = hb.store().get_schedule(&schedule_id).unwrap().unwrap();
        assert_eq!(
            schedule.last_planned_run_at,
            Some(at("2026-03-01T12:15:00+00:00"))
        );
        assert_eq!(schedule.next_run_at, Some(at("2026-03-01T12:20:00+00:00")));
        assert_eq!(hb.store().runtime_counts().unwrap().queued_count, 0);
    }

    #[test]
    fn test_overlap_skips_enqueue_but_advances_cursor() {
        // S3: with an active manual run, the tick inserts nothing, yet the
        // cursor still moves.
        let created = at("2026-03-01T12:00:00+00:00");
        let (hb, schedule_id) = heartbeat_with_frequency(5, "queue_latest", created);

        hb.store()
            .enqueue_run(
                "trun_manual",
                "echo",
                &serde_json::json!({"trigger": "manual"}),
                created,
            )
            .unwrap()
            .unwrap();
        hb.store().claim_next_run(created).unwrap().unwrap();

        let outcome = hb.tick(at("2026-03-01T12:06:00+00:00"));
        assert!(outcome.enqueued.is_empty());

        let schedule = hb.store().get_schedule(&schedule_id).unwrap().unwrap();
        assert_eq!(
            schedule.last_planned_run_at,
            Some(at("2026-03-01T12:05:00+00:00"))
        );
        assert_eq!(schedule.next_run_at, Some(at("2026-03-01T12:10:00+00:00")));
        assert_eq!(hb.store().runtime_counts().unwrap().queued_count, 0);
    }

    #[test]
    fn test_next_run_at_monotone_across_ticks() {
        let created = at("2026-03-01T12:00:00+00:00");
        let (hb, schedule_id) = heartbeat_with_frequency(5, "skip", created);

        let mut previous = created;
        for minute in [3, 7, 12, 40, 41] {
            let now = created + Duration::minutes(minute);
            hb.tick(now);
            let schedule = hb.store().get_schedule(&schedule_id).unwrap().unwrap();
            let next = schedule.next_run_at.unwrap();
            assert!(next > now);
            assert!(next >= previous);
            previous = next;
        }
    }

    #[test]
    fn test_duplicate_tick_same_instant_is_structural_noop() {
        let created = at("2026-03-01T12:00:00+00:00");
        let (hb, _) = heartbeat_with_frequency(5, "queue_latest", created);

        let now = at("2026-03-01T12:05:00+00:00");
        let first = hb.tick(now);
        assert_eq!(first.enqueued.len(), 1);
        // The cursor moved, so an identical re-tick plans nothing.
        let second = hb.tick(now);
        assert!(second.enqueued.is_empty());
        assert_eq!(hb.store().runtime_counts().unwrap().queued_count, 1);
    }

    fn calendar_schedule(days: Vec<String>) -> Schedule {
        Schedule {
            schedule_id: "sched_cal".into(),
            profile_id: "daily".into(),
            enabled: true,
            mode: ScheduleMode::Calendar,
            misfire_policy: crate::types::MisfirePolicy::QueueLatest,
            execution_order: 100,
            run_frequency_minutes: None,
            next_run_at: None,
            last_planned_run_at: None,
            last_run_at: None,
            last_successful_run_at: None,
            last_status: None,
            last_summary: None,
            last_error: None,
            run_times: vec![RunTimeSpec {
                time_of_day: "09:00".into(),
                timezone: "America/New_York".into(),
                enabled: true,
            }],
            days_of_week: days,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_calendar_instant_in_local_timezone() {
        let schedule = calendar_schedule(vec![]);
        // 2026-03-02 is a Monday; 09:00 America/New_York == 14:00 UTC (EST).
        let now = at("2026-03-02T14:30:00+00:00");
        let missed = missed_instants(&schedule, now);
        assert_eq!(missed, vec![at("2026-03-02T14:00:00+00:00")]);
    }

    #[test]
    fn test_calendar_fresh_schedule_respects_catchup_window() {
        let schedule = calendar_schedule(vec![]);
        // Four hours after the 09:00 local fire: outside the 180-minute
        // catch-up window, so a fresh schedule plans nothing.
        let now = at("2026-03-02T18:00:00+00:00");
        assert!(missed_instants(&schedule, now).is_empty());
    }

    #[test]
    fn test_calendar_cursor_window_backfills_days() {
        let mut schedule = calendar_schedule(vec![]);
        schedule.last_planned_run_at = Some(at("2026-03-02T14:00:00+00:00"));
        // Two days later: both missed daily instants appear, in order.
        let now = at("2026-03-04T20:00:00+00:00");
        let missed = missed_instants(&schedule, now);
        assert_eq!(
            missed,
            vec![
                at("2026-03-03T14:00:00+00:00"),
                at("2026-03-04T14:00:00+00:00"),
            ]
        );
    }

    #[test]
    fn test_calendar_day_of_week_restriction() {
        let schedule = calendar_schedule(vec!["tue".into()]);
        // Monday 2026-03-02: not an allowed day.
        assert!(missed_instants(&schedule, at("2026-03-02T14:30:00+00:00")).is_empty());
        // Tuesday 2026-03-03 fires.
        let missed = missed_instants(&schedule, at("2026-03-03T14:30:00+00:00"));
        assert_eq!(missed, vec![at("2026-03-03T14:00:00+00:00")]);
    }

    #[test]
    fn test_calendar_next_fire_skips_disallowed_days() {
        let schedule = calendar_schedule(vec!["fri".into()]);
        // After Monday's instant, the next allowed fire is Friday 09:00 local.
        let next = next_fire_after(&schedule, None, at("2026-03-02T15:00:00+00:00")).unwrap();
        assert_eq!(next, at("2026-03-06T14:00:00+00:00"));
    }

    #[test]
    fn test_normalize_days_of_week() {
        let raw = vec![
            "Monday".to_string(),
            "FRI".to_string(),
            "tue".to_string(),
            "nonsense".to_string(),
            "tue".to_string(),
        ];
        assert_eq!(normalize_days_of_week(&raw), vec!["mon", "tue", "fri"]);
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("09:30"), Some((9, 30)));
        assert_eq!(parse_time_of_day("23:59"), Some((23, 59)));
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("9"), None);
    }

    #[test]
    fn test_backlog_expansion_is_capped() {
        let created = at("2026-03-01T12:00:00+00:00");
        let (hb, _) = heartbeat_with_frequency(1, "queue_all", created);
        // Two weeks of 1-minute cadence would be ~20k instants.
        let outcome = hb.tick(at("2026-03-15T12:00:00+00:00"));
        assert_eq!(outcome.enqueued.len(), MAX_BACKLOG_INSTANTS);
    }
}
