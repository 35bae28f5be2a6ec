//! Per-task key/value state and the seen-item idempotency ledger.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Result as SqliteResult, Row};
use serde_json::Value;

use super::CoreStore;
use crate::types::{iso, SeenItem};

impl CoreStore {
    pub fn upsert_task_state(
        &self,
        task_id: &str,
        state_key: &str,
        value: &Value,
        updated_by: &str,
        now: DateTime<Utc>,
    ) -> SqliteResult<()> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_state (task_id, state_key, value_json, updated_by, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(task_id, state_key) DO UPDATE SET
                   value_json = excluded.value_json,
                   updated_by = excluded.updated_by,
                   updated_at = excluded.updated_at",
                params![task_id, state_key, value.to_string(), updated_by, now_iso],
            )?;
            Ok(())
        })
    }

    pub fn get_task_state(&self, task_id: &str, state_key: &str) -> SqliteResult<Option<Value>> {
        self.with_conn(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM task_state WHERE task_id = ?1 AND state_key = ?2",
                    params![task_id, state_key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
        })
    }

    /// Mark an item seen: first observation inserts, repeats bump
    /// `last_seen_at` / `seen_count`. Returns the ledger row.
    pub fn mark_seen_item(
        &self,
        task_id: &str,
        provider: &str,
        item_key: &str,
        metadata: &Value,
        now: DateTime<Utc>,
    ) -> SqliteResult<SeenItem> {
        let now_iso = iso(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO task_seen_items
                   (task_id, provider, item_key, first_seen_at, last_seen_at, seen_count, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?4, 1, ?5)
                 ON CONFLICT(task_id, provider, item_key) DO UPDATE SET
                   last_seen_at = excluded.last_seen_at,
                   seen_count = task_seen_items.seen_count + 1,
                   metadata_json = excluded.metadata_json",
                params![task_id, provider, item_key, now_iso, metadata.to_string()],
            )?;
            let item = tx.query_row(
                "SELECT task_id, provider, item_key, first_seen_at, last_seen_at,
                        seen_count, metadata_json
                 FROM task_seen_items
                 WHERE task_id = ?1 AND provider = ?2 AND item_key = ?3",
                params![task_id, provider, item_key],
                row_to_seen_item,
            )?;
            tx.commit()?;
            Ok(item)
        })
    }

    pub fn has_seen_item(
        &self,
        task_id: &str,
        provider: &str,
        item_key: &str,
    ) -> SqliteResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_seen_items
                 WHERE task_id = ?1 AND provider = ?2 AND item_key = ?3",
                params![task_id, provider, item_key],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Recent items for a task/provider, newest first observations first.
    pub fn list_recent_seen_items(
        &self,
        task_id: &str,
        provider: &str,
        limit: usize,
    ) -> SqliteResult<Vec<SeenItem>> {
        let safe_limit = limit.clamp(1, 1000) as i64;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, provider, item_key, first_seen_at, last_seen_at,
                        seen_count, metadata_json
                 FROM task_seen_items
                 WHERE task_id = ?1 AND provider = ?2
                 ORDER BY first_seen_at DESC, item_key ASC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![task_id, provider, safe_limit], row_to_seen_item)?
                .collect();
            rows
        })
    }
}

fn row_to_seen_item(row: &Row) -> SqliteResult<SeenItem> {
    let metadata_json: String = row.get("metadata_json")?;
    Ok(SeenItem {
        task_id: row.get("task_id")?,
        provider: row.get("provider")?,
        item_key: row.get("item_key")?,
        first_seen_at: row.get("first_seen_at")?,
        last_seen_at: row.get("last_seen_at")?,
        seen_count: row.get("seen_count")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
    })
}
