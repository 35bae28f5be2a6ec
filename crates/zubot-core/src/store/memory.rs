//! Day-memory event log, per-day counters, and the deduped summary-job queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Result as SqliteResult, Row};

use super::CoreStore;
use crate::types::{iso, DayEvent, DayStatus, DaySummary, MemoryLayer, SummaryJob, SummaryJobStatus};

impl CoreStore {
    /// Append one raw event and bump the day's counters, transactionally.
    /// Returns the day status after the write.
    pub fn ingest_raw_event(
        &self,
        day: &str,
        session_id: &str,
        kind: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> SqliteResult<DayStatus> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO day_memory_events (day, event_time, session_id, kind, text, layer)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'raw')",
                params![day, now_iso, session_id, kind, text],
            )?;
            tx.execute(
                "INSERT INTO day_memory_status
                   (day, total_messages, last_summarized_total, messages_since_last_summary,
                    summaries_count, is_finalized, last_event_at)
                 VALUES (?1, 1, 0, 1, 0, 0, ?2)
                 ON CONFLICT(day) DO UPDATE SET
                   total_messages = day_memory_status.total_messages + 1,
                   messages_since_last_summary = day_memory_status.messages_since_last_summary + 1,
                   is_finalized = 0,
                   last_event_at = excluded.last_event_at",
                params![day, now_iso],
            )?;
            let status = query_day_status(&tx, day)?.expect("status row just upserted");
            tx.commit()?;
            Ok(status)
        })
    }

    pub fn list_day_raw_events(&self, day: &str) -> SqliteResult<Vec<DayEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, day, event_time, session_id, kind, text, layer
                 FROM day_memory_events
                 WHERE day = ?1 AND layer = 'raw'
                 ORDER BY event_id ASC",
            )?;
            let rows = stmt.query_map(params![day], row_to_event)?.collect();
            rows
        })
    }

    pub fn get_day_status(&self, day: &str) -> SqliteResult<Option<DayStatus>> {
        self.with_conn(|conn| query_day_status(conn, day))
    }

    /// Record a successful summary: counters reset to the totals at the
    /// moment of completion; optionally finalizes the day.
    pub fn mark_day_summarized(
        &self,
        day: &str,
        finalize: bool,
        now: DateTime<Utc>,
    ) -> SqliteResult<DayStatus> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO day_memory_status
                   (day, total_messages, last_summarized_total, messages_since_last_summary,
                    summaries_count, is_finalized, last_summary_at, last_event_at)
                 VALUES (?1, 0, 0, 0, 1, ?2, ?3, ?3)
                 ON CONFLICT(day) DO UPDATE SET
                   last_summarized_total = day_memory_status.total_messages,
                   messages_since_last_summary = 0,
                   summaries_count = day_memory_status.summaries_count + 1,
                   is_finalized = CASE WHEN ?2 = 1 THEN 1 ELSE day_memory_status.is_finalized END,
                   last_summary_at = ?3",
                params![day, finalize, now_iso],
            )?;
            let status = query_day_status(&tx, day)?.expect("status row just upserted");
            tx.commit()?;
            Ok(status)
        })
    }

    pub fn mark_day_finalized(&self, day: &str) -> SqliteResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO day_memory_status
                   (day, total_messages, last_summarized_total, messages_since_last_summary,
                    summaries_count, is_finalized)
                 VALUES (?1, 0, 0, 0, 0, 1)
                 ON CONFLICT(day) DO UPDATE SET is_finalized = 1",
                params![day],
            )?;
            Ok(())
        })
    }

    /// Enqueue a summary job for a day, collapsing into any job already
    /// queued or running for it. Returns `(job_id, deduped)`.
    pub fn enqueue_summary_job(
        &self,
        day: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SqliteResult<(i64, bool)> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT job_id FROM memory_summary_jobs
                     WHERE day = ?1 AND status IN ('queued', 'running')
                     ORDER BY job_id ASC LIMIT 1",
                    params![day],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(job_id) = existing {
                tx.commit()?;
                return Ok((job_id, true));
            }
            tx.execute(
                "INSERT INTO memory_summary_jobs (day, status, reason, created_at)
                 VALUES (?1, 'queued', ?2, ?3)",
                params![day, reason, now_iso],
            )?;
            let job_id = tx.last_insert_rowid();
            tx.commit()?;
            Ok((job_id, false))
        })
    }

    /// Claim the oldest queued summary job, transitioning it to running and
    /// bumping its attempt count.
    pub fn claim_next_summary_job(&self, now: DateTime<Utc>) -> SqliteResult<Option<SummaryJob>> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let job_id: Option<i64> = tx
                .query_row(
                    "SELECT job_id FROM memory_summary_jobs
                     WHERE status = 'queued'
                     ORDER BY created_at ASC, job_id ASC
                     LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(job_id) = job_id else {
                tx.commit()?;
                return Ok(None);
            };
            let updated = tx.execute(
                "UPDATE memory_summary_jobs
                 SET status = 'running', started_at = ?2, attempt_count = attempt_count + 1
                 WHERE job_id = ?1 AND status = 'queued'",
                params![job_id, now_iso],
            )?;
            if updated == 0 {
                tx.commit()?;
                return Ok(None);
            }
            let job = tx
                .query_row(
                    "SELECT job_id, day, status, reason, created_at, started_at,
                            finished_at, error, attempt_count
                     FROM memory_summary_jobs WHERE job_id = ?1",
                    params![job_id],
                    row_to_job,
                )
                .optional()?;
            tx.commit()?;
            Ok(job)
        })
    }

    pub fn complete_summary_job(
        &self,
        job_id: i64,
        ok: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> SqliteResult<()> {
        let now_iso = iso(now);
        let status = if ok { "done" } else { "failed" };
        let error = error.map(|e| e.chars().take(500).collect::<String>());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_summary_jobs
                 SET status = ?2, finished_at = ?3, error = ?4
                 WHERE job_id = ?1",
                params![job_id, status, now_iso, error],
            )?;
            Ok(())
        })
    }

    pub fn count_active_summary_jobs(&self, day: &str) -> SqliteResult<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM memory_summary_jobs
                 WHERE day = ?1 AND status IN ('queued', 'running')",
                params![day],
                |row| row.get(0),
            )
        })
    }

    /// Days with raw events not yet covered by a summary, oldest first.
    pub fn days_pending_summary(&self, before_day: Option<&str>) -> SqliteResult<Vec<DayStatus>> {
        self.with_conn(|conn| {
            let base = "SELECT day, total_messages, last_summarized_total,
                        messages_since_last_summary, summaries_count, is_finalized,
                        last_event_at, last_summary_at
                 FROM day_memory_status
                 WHERE (messages_since_last_summary > 0
                        OR total_messages > last_summarized_total)";
            match before_day {
                Some(before) => {
                    let mut stmt =
                        conn.prepare(&format!("{base} AND day < ?1 ORDER BY day ASC"))?;
                    let rows = stmt.query_map(params![before], row_to_status)?.collect();
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!("{base} ORDER BY day ASC"))?;
                    let rows = stmt.query_map([], row_to_status)?.collect();
                    rows
                }
            }
        })
    }

    /// Rewrite the materialized summary for a day in full.
    pub fn replace_day_summary(
        &self,
        day: &str,
        summary_text: &str,
        entry_count: i64,
        now: DateTime<Utc>,
    ) -> SqliteResult<()> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO day_summaries (day, summary_text, entry_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(day) DO UPDATE SET
                   summary_text = excluded.summary_text,
                   entry_count = excluded.entry_count,
                   updated_at = excluded.updated_at",
                params![day, summary_text, entry_count, now_iso],
            )?;
            Ok(())
        })
    }

    pub fn get_day_summary(&self, day: &str) -> SqliteResult<Option<DaySummary>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT day, summary_text, entry_count, updated_at
                 FROM day_summaries WHERE day = ?1",
                params![day],
                row_to_summary,
            )
            .optional()
        })
    }

    pub fn list_recent_summaries(&self, limit: usize) -> SqliteResult<Vec<DaySummary>> {
        let safe_limit = limit.clamp(1, 100) as i64;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT day, summary_text, entry_count, updated_at
                 FROM day_summaries ORDER BY day DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![safe_limit], row_to_summary)?.collect();
            rows
        })
    }
}

fn query_day_status(conn: &rusqlite::Connection, day: &str) -> SqliteResult<Option<DayStatus>> {
    conn.query_row(
        "SELECT day, total_messages, last_summarized_total, messages_since_last_summary,
                summaries_count, is_finalized, last_event_at, last_summary_at
         FROM day_memory_status WHERE day = ?1",
        params![day],
        row_to_status,
    )
    .optional()
}

fn row_to_status(row: &Row) -> SqliteResult<DayStatus> {
    Ok(DayStatus {
        day: row.get("day")?,
        total_messages: row.get("total_messages")?,
        last_summarized_total: row.get("last_summarized_total")?,
        messages_since_last_summary: row.get("messages_since_last_summary")?,
        summaries_count: row.get("summaries_count")?,
        is_finalized: row.get("is_finalized")?,
        last_event_at: row.get("last_event_at")?,
        last_summary_at: row.get("last_summary_at")?,
    })
}

fn row_to_event(row: &Row) -> SqliteResult<DayEvent> {
    let layer: String = row.get("layer")?;
    Ok(DayEvent {
        event_id: row.get("event_id")?,
        day: row.get("day")?,
        event_time: row.get("event_time")?,
        session_id: row.get("session_id")?,
        kind: row.get("kind")?,
        text: row.get("text")?,
        layer: MemoryLayer::from_str(&layer).unwrap_or(MemoryLayer::Raw),
    })
}

fn row_to_summary(row: &Row) -> SqliteResult<DaySummary> {
    Ok(DaySummary {
        day: row.get("day")?,
        summary_text: row.get("summary_text")?,
        entry_count: row.get("entry_count")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_job(row: &Row) -> SqliteResult<SummaryJob> {
    let status: String = row.get("status")?;
    let reason: Option<String> = row.get("reason")?;
    Ok(SummaryJob {
        job_id: row.get("job_id")?,
        day: row.get("day")?,
        status: SummaryJobStatus::from_str(&status).unwrap_or(SummaryJobStatus::Queued),
        reason: reason.unwrap_or_default(),
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        error: row.get("error")?,
        attempt_count: row.get("attempt_count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{at, store};
    use super::*;

    const DAY: &str = "2026-03-01";

    #[test]
    fn test_ingest_counters_arithmetic() {
        let store = store();
        let t = at("2026-03-01T10:00:00+00:00");
        for i in 0..3 {
            let status = store
                .ingest_raw_event(DAY, "session", "user", &format!("msg {i}"), t)
                .unwrap();
            assert_eq!(status.total_messages, i + 1);
            assert_eq!(status.messages_since_last_summary, i + 1);
            assert_eq!(
                status.messages_since_last_summary,
                status.total_messages - status.last_summarized_total
            );
        }
        assert_eq!(store.list_day_raw_events(DAY).unwrap().len(), 3);
    }

    #[test]
    fn test_mark_summarized_resets_counters() {
        let store = store();
        let t = at("2026-03-01T10:00:00+00:00");
        for i in 0..5 {
            store
                .ingest_raw_event(DAY, "session", "user", &format!("msg {i}"), t)
                .unwrap();
        }
        let status = store.mark_day_summarized(DAY, false, t).unwrap();
        assert_eq!(status.messages_since_last_summary, 0);
        assert_eq!(status.last_summarized_total, status.total_messages);
        assert_eq!(status.summaries_count, 1);
        assert!(!status.is_finalized);

        // New event after a summary re-opens the pending window.
        let status = store.ingest_raw_event(DAY, "session", "user", "more", t).unwrap();
        assert_eq!(status.messages_since_last_summary, 1);
        assert_eq!(status.total_messages, 6);

        let status = store.mark_day_summarized(DAY, true, t).unwrap();
        assert!(status.is_finalized);
    }

    #[test]
    fn test_summary_job_dedupe() {
        let store = store();
        let t = at("2026-03-01T10:00:00+00:00");
        let (job_id, deduped) = store.enqueue_summary_job(DAY, "threshold", t).unwrap();
        assert!(!deduped);

        // Burst enqueues collapse into the single active job.
        for _ in 0..10 {
            let (dup_id, deduped) = store.enqueue_summary_job(DAY, "threshold", t).unwrap();
            assert!(deduped);
            assert_eq!(dup_id, job_id);
        }
        assert_eq!(store.count_active_summary_jobs(DAY).unwrap(), 1);

        // Still deduped while running.
        let job = store.claim_next_summary_job(t).unwrap().unwrap();
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.attempt_count, 1);
        let (_, deduped) = store.enqueue_summary_job(DAY, "again", t).unwrap();
        assert!(deduped);

        // Once terminal, a fresh job can be enqueued.
        store.complete_summary_job(job_id, true, None, t).unwrap();
        let (next_id, deduped) = store.enqueue_summary_job(DAY, "again", t).unwrap();
        assert!(!deduped);
        assert_ne!(next_id, job_id);
    }

    #[test]
    fn test_claim_order_and_exhaustion() {
        let store = store();
        store
            .enqueue_summary_job("2026-03-02", "sweep", at("2026-03-02T01:00:00+00:00"))
            .unwrap();
        store
            .enqueue_summary_job("2026-03-01", "sweep", at("2026-03-02T02:00:00+00:00"))
            .unwrap();

        let t = at("2026-03-02T03:00:00+00:00");
        let first = store.claim_next_summary_job(t).unwrap().unwrap();
        assert_eq!(first.day, "2026-03-02");
        let second = store.claim_next_summary_job(t).unwrap().unwrap();
        assert_eq!(second.day, "2026-03-01");
        assert!(store.claim_next_summary_job(t).unwrap().is_none());
    }

    #[test]
    fn test_days_pending_summary() {
        let store = store();
        let t = at("2026-03-02T10:00:00+00:00");
        store.ingest_raw_event("2026-03-01", "s", "user", "a", t).unwrap();
        store.ingest_raw_event("2026-03-02", "s", "user", "b", t).unwrap();
        store.mark_day_summarized("2026-03-02", false, t).unwrap();

        let pending = store.days_pending_summary(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].day, "2026-03-01");

        let pending = store.days_pending_summary(Some("2026-03-01")).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_day_summary_replaced_in_full() {
        let store = store();
        let t = at("2026-03-01T10:00:00+00:00");
        store.replace_day_summary(DAY, "first pass", 3, t).unwrap();
        store.replace_day_summary(DAY, "second pass", 7, t).unwrap();

        let summary = store.get_day_summary(DAY).unwrap().unwrap();
        assert_eq!(summary.summary_text, "second pass");
        assert_eq!(summary.entry_count, 7);
        assert_eq!(store.list_recent_summaries(5).unwrap().len(), 1);
    }
}
