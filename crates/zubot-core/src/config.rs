//! Daemon configuration (YAML file, tolerant defaults).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_PATH: &str = "memory/central/zubot_core.db";

/// Settings for the scheduler, dispatcher, gateway, and housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralServiceConfig {
    /// Autostart the core loops when the daemon boots.
    pub enabled: bool,
    pub heartbeat_poll_interval_sec: u64,
    pub task_runner_concurrency: usize,
    pub scheduler_db_path: String,
    pub run_history_retention_days: i64,
    pub run_history_max_rows: i64,
    pub memory_manager_sweep_interval_sec: u64,
    pub memory_manager_completion_debounce_sec: u64,
    pub queue_warning_threshold: i64,
    pub running_age_warning_sec: i64,
    pub db_queue_busy_timeout_ms: i64,
    pub db_queue_default_max_rows: usize,
    pub waiting_for_user_timeout_sec: i64,
}

impl Default for CentralServiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heartbeat_poll_interval_sec: 60,
            task_runner_concurrency: 3,
            scheduler_db_path: DEFAULT_DB_PATH.to_string(),
            run_history_retention_days: 30,
            run_history_max_rows: 5000,
            memory_manager_sweep_interval_sec: 12 * 60 * 60,
            memory_manager_completion_debounce_sec: 5 * 60,
            queue_warning_threshold: 25,
            running_age_warning_sec: 1800,
            db_queue_busy_timeout_ms: 5000,
            db_queue_default_max_rows: 500,
            waiting_for_user_timeout_sec: 3600,
        }
    }
}

/// Settings for the day-memory summary pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub autoload_summary_days: i64,
    pub realtime_summary_turn_threshold: i64,
    pub summary_worker_poll_sec: u64,
    pub summary_worker_max_jobs_per_tick: usize,
    pub daily_summary_use_model: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            autoload_summary_days: 2,
            realtime_summary_turn_threshold: 12,
            summary_worker_poll_sec: 15,
            summary_worker_max_jobs_per_tick: 1,
            daily_summary_use_model: false,
        }
    }
}

/// Rate-limit policy for one outbound queue group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderQueueConfig {
    pub queue_min_interval_sec: f64,
    pub queue_jitter_sec: f64,
    pub queue_max_retries: u32,
    pub queue_retry_backoff_sec: f64,
}

impl Default for ProviderQueueConfig {
    fn default() -> Self {
        Self {
            queue_min_interval_sec: 0.0,
            queue_jitter_sec: 0.0,
            queue_max_retries: 0,
            queue_retry_backoff_sec: 0.0,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZubotConfig {
    pub central_service: CentralServiceConfig,
    pub memory: MemoryConfig,
    pub provider_queues: HashMap<String, ProviderQueueConfig>,
}

impl ZubotConfig {
    /// Load from a YAML file; a missing file yields defaults, a malformed
    /// file is an error (the daemon refuses to start on bad config).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn queue_config(&self, group: &str) -> ProviderQueueConfig {
        self.provider_queues.get(group).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ZubotConfig::default();
        assert!(!config.central_service.enabled);
        assert_eq!(config.central_service.task_runner_concurrency, 3);
        assert_eq!(config.central_service.scheduler_db_path, DEFAULT_DB_PATH);
        assert_eq!(config.memory.summary_worker_poll_sec, 15);
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
central_service:
  enabled: true
  task_runner_concurrency: 5
provider_queues:
  indeed:
    queue_min_interval_sec: 2.5
    queue_max_retries: 3
"#,
        )
        .unwrap();

        let config = ZubotConfig::load(&path).unwrap();
        assert!(config.central_service.enabled);
        assert_eq!(config.central_service.task_runner_concurrency, 5);
        // Unspecified keys keep their defaults.
        assert_eq!(config.central_service.heartbeat_poll_interval_sec, 60);

        let queue = config.queue_config("indeed");
        assert_eq!(queue.queue_max_retries, 3);
        assert_eq!(config.queue_config("unknown").queue_max_retries, 0);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ZubotConfig::load(&dir.path().join("nope.yaml")).unwrap();
        assert!(!config.central_service.enabled);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "central_service: [not, a, map]").unwrap();
        assert!(ZubotConfig::load(&path).is_err());
    }
}
