//! zubot-runner - per-run task execution
//!
//! Executes one claimed run by profile kind: scripts as child processes in
//! their own process group, agentic and interactive bodies as in-process
//! cooperative handlers. Cancellation and timeout are enforced uniformly.
//!
//! # Example
//!
//! ```no_run
//! use zubot_runner::{RunSpec, TaskKind, TaskRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = TaskRunner::new(".", "memory/tasks/logs");
//!
//!     let mut spec = RunSpec::new("trun_demo", "echo", TaskKind::Script);
//!     spec.entrypoint_path = Some("tasks/echo.sh".to_string());
//!
//!     let outcome = runner.run(spec, CancellationToken::new()).await?;
//!     println!("status: {}", outcome.status.as_str());
//!     Ok(())
//! }
//! ```

mod handlers;
mod runner;
mod types;

pub use handlers::{FnHandler, HandlerRegistry, TaskHandler};
pub use runner::TaskRunner;
pub use types::*;
