//! Per-group serialized outbound-call queues.
//!
//! One worker per queue group dispatches calls FIFO, pacing them with a
//! minimum interval plus jitter and retrying transient failures with linear
//! backoff. A misbehaving provider only stalls its own group.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ProviderQueueConfig;

/// Failure from a provider call; `retryable` gates the retry loop.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

type CallFuture = Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send>>;
type CallFn = Arc<dyn Fn() -> CallFuture + Send + Sync>;

/// Running counters for one queue group.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub in_flight: bool,
    pub calls_total: i64,
    pub calls_success: i64,
    pub calls_failed: i64,
    pub last_error: Option<String>,
    pub wait_sec_last: f64,
    pub wait_sec_avg: f64,
    pub wait_sec_max: f64,
}

#[derive(Debug, Default)]
struct GroupStats {
    stats: QueueStats,
    wait_sec_total: f64,
}

/// Observability fields attached to every reply.
#[derive(Debug, Clone, Serialize)]
pub struct QueueReceipt {
    pub group: String,
    pub wait_sec: f64,
    pub attempt: u32,
}

/// Result of one provider call through its group queue.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queue: QueueReceipt,
    pub stats: QueueStats,
}

struct GroupJob {
    call: CallFn,
    enqueued_at: Instant,
    reply: oneshot::Sender<ProviderCallResult>,
}

struct GroupHandle {
    tx: mpsc::UnboundedSender<GroupJob>,
    stats: Arc<Mutex<GroupStats>>,
}

/// Registry of per-group queues, created lazily on first submit.
pub struct ProviderQueues {
    configs: Mutex<HashMap<String, ProviderQueueConfig>>,
    groups: Mutex<HashMap<String, GroupHandle>>,
}

impl ProviderQueues {
    pub fn new(configs: HashMap<String, ProviderQueueConfig>) -> Arc<Self> {
        Arc::new(Self {
            configs: Mutex::new(configs),
            groups: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_config(&self, group: &str, config: ProviderQueueConfig) {
        self.configs.lock().unwrap().insert(group.to_string(), config);
    }

    /// Submit a call to its group queue and suspend until it resolves.
    pub async fn submit<F, Fut>(&self, group: &str, f: F) -> ProviderCallResult
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProviderError>> + Send + 'static,
    {
        let call: CallFn = Arc::new(move || Box::pin(f()) as CallFuture);
        let (tx, stats) = self.group_handle(group);
        {
            let mut guard = stats.lock().unwrap();
            guard.stats.pending += 1;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = GroupJob {
            call,
            enqueued_at: Instant::now(),
            reply: reply_tx,
        };
        if tx.send(job).is_err() {
            let snapshot = stats.lock().unwrap().stats.clone();
            return ProviderCallResult {
                ok: false,
                value: None,
                error: Some("provider queue is not running".into()),
                queue: QueueReceipt {
                    group: group.to_string(),
                    wait_sec: 0.0,
                    attempt: 0,
                },
                stats: snapshot,
            };
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => {
                let snapshot = stats.lock().unwrap().stats.clone();
                ProviderCallResult {
                    ok: false,
                    value: None,
                    error: Some("provider queue dropped the call".into()),
                    queue: QueueReceipt {
                        group: group.to_string(),
                        wait_sec: 0.0,
                        attempt: 0,
                    },
                    stats: snapshot,
                }
            }
        }
    }

    pub fn stats(&self, group: &str) -> Option<QueueStats> {
        let groups = self.groups.lock().unwrap();
        groups
            .get(group)
            .map(|handle| handle.stats.lock().unwrap().stats.clone())
    }

    pub fn all_stats(&self) -> HashMap<String, QueueStats> {
        let groups = self.groups.lock().unwrap();
        groups
            .iter()
            .map(|(name, handle)| (name.clone(), handle.stats.lock().unwrap().stats.clone()))
            .collect()
    }

    fn group_handle(
        &self,
        group: &str,
    ) -> (mpsc::UnboundedSender<GroupJob>, Arc<Mutex<GroupStats>>) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(handle) = groups.get(group) {
            return (handle.tx.clone(), Arc::clone(&handle.stats));
        }
        let config = self
            .configs
            .lock()
            .unwrap()
            .get(group)
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(GroupStats::default()));
        tokio::spawn(group_worker(
            group.to_string(),
            config,
            rx,
            Arc::clone(&stats),
        ));
        groups.insert(
            group.to_string(),
            GroupHandle {
                tx: tx.clone(),
                stats: Arc::clone(&stats),
            },
        );
        (tx, stats)
    }
}

async fn group_worker(
    group: String,
    config: ProviderQueueConfig,
    mut rx: mpsc::UnboundedReceiver<GroupJob>,
    stats: Arc<Mutex<GroupStats>>,
) {
    debug!(group = %group, "Provider queue worker started");
    let mut last_finished: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        {
            let mut guard = stats.lock().unwrap();
            guard.stats.pending = (guard.stats.pending - 1).max(0);
            guard.stats.in_flight = true;
            guard.stats.calls_total += 1;
        }

        // Pace: minimum interval since the previous dispatch, plus jitter.
        if config.queue_min_interval_sec > 0.0 {
            if let Some(finished) = last_finished {
                let min_interval = Duration::from_secs_f64(config.queue_min_interval_sec);
                let elapsed = finished.elapsed();
                if elapsed < min_interval {
                    tokio::time::sleep(min_interval - elapsed).await;
                }
            }
        }
        if config.queue_jitter_sec > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..config.queue_jitter_sec);
            tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
        }

        let wait_sec = job.enqueued_at.elapsed().as_secs_f64();
        {
            let mut guard = stats.lock().unwrap();
            guard.stats.wait_sec_last = wait_sec;
            guard.wait_sec_total += wait_sec;
            guard.stats.wait_sec_max = guard.stats.wait_sec_max.max(wait_sec);
            let total = guard.stats.calls_total.max(1) as f64;
            guard.stats.wait_sec_avg = guard.wait_sec_total / total;
        }

        let mut attempt: u32 = 1;
        let result = loop {
            match (job.call)().await {
                Ok(value) => break Ok(value),
                Err(e) => {
                    let can_retry = e.retryable && attempt <= config.queue_max_retries;
                    if !can_retry {
                        break Err(e);
                    }
                    // Linear backoff per attempt.
                    if config.queue_retry_backoff_sec > 0.0 {
                        let delay = config.queue_retry_backoff_sec * attempt as f64;
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                    attempt += 1;
                }
            }
        };

        last_finished = Some(Instant::now());
        let snapshot = {
            let mut guard = stats.lock().unwrap();
            guard.stats.in_flight = false;
            match &result {
                Ok(_) => {
                    guard.stats.calls_success += 1;
                    guard.stats.last_error = None;
                }
                Err(e) => {
                    guard.stats.calls_failed += 1;
                    guard.stats.last_error = Some(e.message.clone());
                }
            }
            guard.stats.clone()
        };

        let receipt = QueueReceipt {
            group: group.clone(),
            wait_sec,
            attempt,
        };
        let out = match result {
            Ok(value) => ProviderCallResult {
                ok: true,
                value: Some(value),
                error: None,
                queue: receipt,
                stats: snapshot,
            },
            Err(e) => ProviderCallResult {
                ok: false,
                value: None,
                error: Some(e.message),
                queue: receipt,
                stats: snapshot,
            },
        };
        let _ = job.reply.send(out);
    }
    debug!(group = %group, "Provider queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn queues_with(group: &str, config: ProviderQueueConfig) -> Arc<ProviderQueues> {
        let mut configs = HashMap::new();
        configs.insert(group.to_string(), config);
        ProviderQueues::new(configs)
    }

    #[tokio::test]
    async fn test_calls_are_serialized_fifo() {
        let queues = ProviderQueues::new(HashMap::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let queues = Arc::clone(&queues);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queues
                    .submit("api", move || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().unwrap().push(i);
                            Ok(serde_json::json!(i))
                        }
                    })
                    .await
            }));
            // Give each submit a moment to enqueue so FIFO order is defined.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().ok);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_min_interval_paces_dispatches() {
        let queues = queues_with(
            "slow",
            ProviderQueueConfig {
                queue_min_interval_sec: 0.1,
                ..Default::default()
            },
        );
        let started = Instant::now();
        for _ in 0..3 {
            let result = queues
                .submit("slow", || async { Ok(serde_json::json!("ok")) })
                .await;
            assert!(result.ok);
        }
        // Two inter-call gaps of >= 100ms each.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_with_attempts() {
        let queues = queues_with(
            "flaky",
            ProviderQueueConfig {
                queue_max_retries: 3,
                queue_retry_backoff_sec: 0.01,
                ..Default::default()
            },
        );
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = queues
            .submit("flaky", move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(ProviderError::transient("http 429"))
                    } else {
                        Ok(serde_json::json!({"attempt": n}))
                    }
                }
            })
            .await;
        assert!(result.ok);
        assert_eq!(result.queue.attempt, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.stats.calls_success, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let queues = queues_with(
            "strict",
            ProviderQueueConfig {
                queue_max_retries: 5,
                ..Default::default()
            },
        );
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = queues
            .submit("strict", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(ProviderError::permanent("http 401"))
                }
            })
            .await;
        assert!(!result.ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(result.error.as_deref(), Some("http 401"));
        assert_eq!(result.stats.calls_failed, 1);
        assert_eq!(result.stats.last_error.as_deref(), Some("http 401"));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let queues = queues_with(
            "down",
            ProviderQueueConfig {
                queue_max_retries: 2,
                queue_retry_backoff_sec: 0.01,
                ..Default::default()
            },
        );
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = queues
            .submit("down", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(ProviderError::transient("network"))
                }
            })
            .await;
        assert!(!result.ok);
        // 1 initial + 2 retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.queue.attempt, 3);
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let queues = queues_with(
            "slow",
            ProviderQueueConfig {
                queue_min_interval_sec: 10.0,
                ..Default::default()
            },
        );
        // Prime the slow group so its next dispatch would wait.
        queues
            .submit("slow", || async { Ok(serde_json::json!("ok")) })
            .await;

        let slow_queues = Arc::clone(&queues);
        let slow = tokio::spawn(async move {
            slow_queues
                .submit("slow", || async { Ok(serde_json::json!("late")) })
                .await
        });

        // A different group dispatches immediately despite the stalled one.
        let started = Instant::now();
        let result = queues
            .submit("fast", || async { Ok(serde_json::json!("now")) })
            .await;
        assert!(result.ok);
        assert!(started.elapsed() < Duration::from_secs(1));
        slow.abort();
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let queues = ProviderQueues::new(HashMap::new());
        queues
            .submit("api", || async { Ok(serde_json::json!(1)) })
            .await;
        let stats = queues.stats("api").unwrap();
        assert_eq!(stats.calls_total, 1);
        assert_eq!(stats.calls_success, 1);
        assert_eq!(stats.pending, 0);
        assert!(!stats.in_flight);
        assert!(queues.all_stats().contains_key("api"));
    }
}
