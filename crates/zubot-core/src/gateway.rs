//! Serialized SQL gateway.
//!
//! All ad-hoc SQL from tools and API callers funnels through one worker that
//! owns the write path. Submitters suspend on a oneshot reply; dropping a
//! submitter merely discards its reply. Read-only is the default and is
//! validated against a write-disallow rule.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::store::CoreStore;

/// A single SQL request.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default)]
    pub request_id: Option<String>,
}

fn default_read_only() -> bool {
    true
}

/// Bounded result set plus outcome metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SqlReply {
    pub ok: bool,
    pub request_id: String,
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SqlReply {
    fn error(request_id: String, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            request_id,
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
            rows_affected: None,
            error: Some(error.into()),
        }
    }
}

/// Gateway health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub queue_depth: usize,
    pub requests_total: u64,
    pub last_error: Option<String>,
    pub default_max_rows: usize,
}

struct GatewayJob {
    request: SqlRequest,
    request_id: String,
    reply: oneshot::Sender<SqlReply>,
}

/// Single-worker SQL serialization layer over the store.
pub struct SqlGateway {
    tx: mpsc::UnboundedSender<GatewayJob>,
    depth: Arc<AtomicUsize>,
    requests_total: AtomicU64,
    last_error: Arc<Mutex<Option<String>>>,
    default_max_rows: usize,
}

impl SqlGateway {
    pub fn new(store: Arc<CoreStore>, default_max_rows: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let last_error = Arc::new(Mutex::new(None));
        let gateway = Arc::new(Self {
            tx,
            depth: Arc::clone(&depth),
            requests_total: AtomicU64::new(0),
            last_error: Arc::clone(&last_error),
            default_max_rows: default_max_rows.max(1),
        });
        tokio::spawn(worker_loop(store, rx, depth, last_error));
        gateway
    }

    /// Submit a request and suspend until the worker replies.
    pub async fn execute(&self, request: SqlRequest) -> SqlReply {
        let seq = self.requests_total.fetch_add(1, Ordering::Relaxed) + 1;
        let request_id = request
            .request_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("sqlq_{seq}"));

        let sql = request.sql.trim().to_string();
        if sql.is_empty() {
            return SqlReply::error(request_id, "sql is required");
        }
        if request.read_only && !is_read_only_sql(&sql) {
            return SqlReply::error(
                request_id,
                "read_only query must be SELECT/PRAGMA/EXPLAIN/WITH",
            );
        }

        let mut request = request;
        request.sql = sql;
        if request.max_rows.is_none() {
            request.max_rows = Some(self.default_max_rows);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::Relaxed);
        let job = GatewayJob {
            request,
            request_id: request_id.clone(),
            reply: reply_tx,
        };
        if self.tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return SqlReply::error(request_id, "sql gateway is not running");
        }
        match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => SqlReply::error(request_id, "sql gateway dropped the request"),
        }
    }

    pub fn health(&self) -> GatewayHealth {
        GatewayHealth {
            queue_depth: self.depth.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            last_error: self.last_error.lock().unwrap().clone(),
            default_max_rows: self.default_max_rows,
        }
    }
}

async fn worker_loop(
    store: Arc<CoreStore>,
    mut rx: mpsc::UnboundedReceiver<GatewayJob>,
    depth: Arc<AtomicUsize>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    debug!("SQL gateway worker started");
    while let Some(job) = rx.recv().await {
        depth.fetch_sub(1, Ordering::Relaxed);
        let GatewayJob {
            request,
            request_id,
            reply,
        } = job;
        let max_rows = request.max_rows.unwrap_or(500);

        let result = if request.read_only {
            store
                .raw_query(&request.sql, &request.params, max_rows)
                .map(|(rows, truncated)| SqlReply {
                    ok: true,
                    request_id: request_id.clone(),
                    row_count: rows.len(),
                    rows,
                    truncated,
                    rows_affected: None,
                    error: None,
                })
        } else {
            store
                .raw_execute(&request.sql, &request.params)
                .map(|affected| SqlReply {
                    ok: true,
                    request_id: request_id.clone(),
                    rows: Vec::new(),
                    row_count: 0,
                    truncated: false,
                    rows_affected: Some(affected),
                    error: None,
                })
        };

        let out = result.unwrap_or_else(|e| {
            let msg = e.to_string();
            warn!(request_id = %request_id, error = %msg, "SQL gateway request failed");
            *last_error.lock().unwrap() = Some(msg.clone());
            SqlReply::error(request_id.clone(), msg)
        });
        // A cancelled submitter just discards the reply.
        let _ = reply.send(out);
    }
    debug!("SQL gateway worker stopped");
}

fn is_read_only_sql(sql: &str) -> bool {
    let head = sql
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    matches!(head.as_str(), "select" | "pragma" | "explain" | "with")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway() -> (Arc<SqlGateway>, Arc<CoreStore>) {
        let store = Arc::new(CoreStore::open_in_memory().unwrap());
        let gateway = SqlGateway::new(Arc::clone(&store), 500);
        (gateway, store)
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let (gateway, _store) = gateway();
        let reply = gateway
            .execute(SqlRequest {
                sql: "DELETE FROM task_runs".into(),
                params: vec![],
                read_only: true,
                max_rows: None,
                request_id: None,
            })
            .await;
        assert!(!reply.ok);
        assert!(reply.error.unwrap().contains("read_only"));
    }

    #[tokio::test]
    async fn test_select_returns_rows() {
        let (gateway, store) = gateway();
        store
            .raw_execute(
                "INSERT INTO task_state (task_id, state_key, value_json, updated_by, updated_at)
                 VALUES ('t', 'k', '{\"n\":1}', 'test', '2026-01-01T00:00:00+00:00')",
                &[],
            )
            .unwrap();

        let reply = gateway
            .execute(SqlRequest {
                sql: "SELECT task_id, state_key FROM task_state WHERE task_id = ?1".into(),
                params: vec![json!("t")],
                read_only: true,
                max_rows: None,
                request_id: Some("sqlq_custom".into()),
            })
            .await;
        assert!(reply.ok);
        assert_eq!(reply.request_id, "sqlq_custom");
        assert_eq!(reply.row_count, 1);
        assert_eq!(reply.rows[0]["state_key"], "k");
        assert!(!reply.truncated);
    }

    #[tokio::test]
    async fn test_truncation_flag() {
        let (gateway, store) = gateway();
        for i in 0..10 {
            store
                .raw_execute(
                    "INSERT INTO task_state (task_id, state_key, value_json, updated_by, updated_at)
                     VALUES ('t', ?1, '{}', 'test', '2026-01-01T00:00:00+00:00')",
                    &[json!(format!("k{i:02}"))],
                )
                .unwrap();
        }
        let reply = gateway
            .execute(SqlRequest {
                sql: "SELECT state_key FROM task_state ORDER BY state_key".into(),
                params: vec![],
                read_only: true,
                max_rows: Some(4),
                request_id: None,
            })
            .await;
        assert!(reply.ok);
        assert_eq!(reply.row_count, 4);
        assert!(reply.truncated);
    }

    #[tokio::test]
    async fn test_explicit_write_path() {
        let (gateway, store) = gateway();
        let reply = gateway
            .execute(SqlRequest {
                sql: "INSERT INTO task_state (task_id, state_key, value_json, updated_by, updated_at)
                      VALUES (?1, ?2, ?3, 'gateway', ?4)"
                    .into(),
                params: vec![
                    json!("search"),
                    json!("cursor"),
                    json!("{\"page\":1}"),
                    json!("2026-01-01T00:00:00+00:00"),
                ],
                read_only: false,
                max_rows: None,
                request_id: None,
            })
            .await;
        assert!(reply.ok);
        assert_eq!(reply.rows_affected, Some(1));
        assert!(store.get_task_state("search", "cursor").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bad_sql_is_structured_error() {
        let (gateway, _store) = gateway();
        let reply = gateway
            .execute(SqlRequest {
                sql: "SELECT definitely not valid sql FROM".into(),
                params: vec![],
                read_only: true,
                max_rows: None,
                request_id: None,
            })
            .await;
        assert!(!reply.ok);
        assert!(reply.error.is_some());
        assert!(gateway.health().last_error.is_some());
    }

    #[tokio::test]
    async fn test_empty_sql_rejected() {
        let (gateway, _store) = gateway();
        let reply = gateway
            .execute(SqlRequest {
                sql: "   ".into(),
                params: vec![],
                read_only: true,
                max_rows: None,
                request_id: None,
            })
            .await;
        assert!(!reply.ok);
    }
}
