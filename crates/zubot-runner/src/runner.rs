//! Task runner: executes one claimed run by profile kind.
//!
//! Scripts launch as child processes in their own process group with run
//! context passed via environment variables; agentic and interactive bodies
//! run in-process through the handler registry. All paths honor the run
//! timeout and the slot's cancellation token.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handlers::HandlerRegistry;
use crate::types::{OutcomeStatus, RunOutcome, RunSpec, RunnerError, TaskContext, TaskKind};

/// Grace period between SIGTERM and SIGKILL on teardown, and the budget an
/// agentic body gets to unwind after cancellation.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Executes claimed runs. One instance is shared by every dispatcher slot.
pub struct TaskRunner {
    handlers: Arc<HandlerRegistry>,
    /// Root against which script entrypoints resolve.
    workspace_root: PathBuf,
    /// Per-run logs land under `<logs_dir>/<task_id>/<run_id>.log`.
    logs_dir: PathBuf,
}

impl TaskRunner {
    pub fn new(workspace_root: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            handlers: Arc::new(HandlerRegistry::new()),
            workspace_root: workspace_root.into(),
            logs_dir: logs_dir.into(),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Execute one run to its outcome.
    pub async fn run(
        &self,
        spec: RunSpec,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunnerError> {
        match spec.kind {
            TaskKind::Script => self.run_script(spec, cancel).await,
            TaskKind::Agentic | TaskKind::InteractiveWrapper => {
                self.run_handler(spec, cancel).await
            }
        }
    }

    /// Entrypoints are repository-relative; traversal outside the workspace
    /// root is rejected before anything is spawned.
    fn resolve_entrypoint(&self, raw: &str) -> Result<PathBuf, RunnerError> {
        let candidate = Path::new(raw.trim());
        if candidate.as_os_str().is_empty() {
            return Err(RunnerError::InvalidEntrypoint(
                "entrypoint_path is empty".into(),
            ));
        }
        if candidate.is_absolute() {
            return Err(RunnerError::InvalidEntrypoint(format!(
                "entrypoint_path must be repository-relative: {raw}"
            )));
        }
        if candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(RunnerError::InvalidEntrypoint(format!(
                "path traversal is not allowed: {raw}"
            )));
        }
        let resolved = self.workspace_root.join(candidate);
        if !resolved.is_file() {
            return Err(RunnerError::InvalidEntrypoint(format!(
                "entrypoint file not found: {raw}"
            )));
        }
        Ok(resolved)
    }

    async fn open_run_log(&self, spec: &RunSpec) -> Result<tokio::fs::File, RunnerError> {
        let dir = self.logs_dir.join(&spec.task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.log", spec.run_id));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(file)
    }

    async fn run_script(
        &self,
        spec: RunSpec,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunnerError> {
        let entrypoint = self.resolve_entrypoint(
            spec.entrypoint_path
                .as_deref()
                .ok_or_else(|| RunnerError::InvalidEntrypoint("missing entrypoint_path".into()))?,
        )?;

        let payload_json = serde_json::to_string(&spec.payload)?;
        let log_file = self.open_run_log(&spec).await?;

        let mut cmd = Command::new(&entrypoint);
        cmd.args(&spec.args)
            .current_dir(&self.workspace_root)
            .env("ZUBOT_RUN_ID", &spec.run_id)
            .env("ZUBOT_TASK_ID", &spec.task_id)
            .env("ZUBOT_TASK_PAYLOAD_JSON", &payload_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(run_id = %spec.run_id, path = %entrypoint.display(), "Spawning script task");

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            path: entrypoint.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Stream stdout into the per-run log, remembering the last non-empty
        // line for the run summary.
        let stdout_task = tokio::spawn(async move {
            let mut last_line: Option<String> = None;
            let mut log = log_file;
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = log.write_all(line.as_bytes()).await;
                    let _ = log.write_all(b"\n").await;
                    if !line.trim().is_empty() {
                        last_line = Some(line.trim().to_string());
                    }
                }
                let _ = log.flush().await;
            }
            last_line
        });
        let stderr_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() >= STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                teardown_process(&mut child, pid).await;
                return Err(RunnerError::Cancelled);
            }
            _ = tokio::time::sleep(spec.timeout) => {
                teardown_process(&mut child, pid).await;
                return Err(RunnerError::Timeout(spec.timeout));
            }
        };

        let last_line = stdout_task.await.unwrap_or(None);
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            let summary = last_line
                .map(|line| truncate(&line, 300))
                .unwrap_or_else(|| format!("{} completed.", spec.task_id));
            return Ok(RunOutcome::done(summary));
        }

        let code = status.code().map_or("signal".to_string(), |c| c.to_string());
        let detail = if stderr_tail.is_empty() {
            format!("exit_code={code}")
        } else {
            truncate(&stderr_tail.join("\n"), 500)
        };
        Ok(RunOutcome {
            status: OutcomeStatus::Failed,
            summary: last_line.map(|line| truncate(&line, 300)),
            error: Some(format!("script `{}` failed: {detail}", spec.task_id)),
            artifacts: None,
            waiting: None,
        })
    }

    async fn run_handler(
        &self,
        spec: RunSpec,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunnerError> {
        let module = spec
            .module
            .clone()
            .unwrap_or_else(|| spec.task_id.clone());
        let handler = self
            .handlers
            .get(&module)
            .ok_or_else(|| RunnerError::MissingHandler(module.clone()))?;

        let ctx = TaskContext {
            run_id: spec.run_id.clone(),
            task_id: spec.task_id.clone(),
            payload: spec.payload.clone(),
            cancel: cancel.clone(),
        };

        let fut = handler.run(ctx);
        tokio::pin!(fut);

        let outcome = tokio::select! {
            out = &mut fut => out?,
            _ = cancel.cancelled() => {
                // Cooperative bodies get a bounded teardown budget, then the
                // future is dropped at its next suspension point.
                let _ = tokio::time::timeout(TEARDOWN_GRACE, &mut fut).await;
                return Err(RunnerError::Cancelled);
            }
            _ = tokio::time::sleep(spec.timeout) => {
                return Err(RunnerError::Timeout(spec.timeout));
            }
        };

        if outcome.status == OutcomeStatus::WaitingForUser
            && spec.kind != TaskKind::InteractiveWrapper
        {
            warn!(run_id = %spec.run_id, module = %module, "Non-interactive task yielded a waiting contract");
            return Ok(RunOutcome::failed(
                "waiting_for_user is only supported by interactive_wrapper tasks",
            ));
        }
        Ok(outcome)
    }
}

/// SIGTERM to the process group, bounded grace, then SIGKILL.
async fn teardown_process(child: &mut Child, pid: Option<u32>) {
    signal_group(pid, libc::SIGTERM);
    if tokio::time::timeout(TEARDOWN_GRACE, child.wait()).await.is_ok() {
        return;
    }
    signal_group(pid, libc::SIGKILL);
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    if let Some(pid) = pid {
        // Negative pid addresses the whole process group.
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: libc::c_int) {}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
