//! zubot-core - central execution substrate
//!
//! The core of the zubot automation daemon: a cursor-driven heartbeat
//! scheduler, a SQLite-backed run queue with strict no-overlap per task, a
//! fixed pool of execution slots with interactive pause/resume, a serialized
//! SQL gateway, per-provider rate-limit queues, and the asynchronous
//! day-summary pipeline.
//!
//! The HTTP surface lives in `zubot-daemon`; run bodies live in
//! `zubot-runner`. Everything here is driven through [`CentralService`].

pub mod config;
pub mod dispatcher;
pub mod events;
pub mod gateway;
pub mod memory;
pub mod provider_queue;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;

pub use config::{ProviderQueueConfig, ZubotConfig, DEFAULT_DB_PATH};
pub use dispatcher::{Dispatcher, KillOutcome, SlotTable};
pub use events::LifecycleHub;
pub use gateway::{SqlGateway, SqlReply, SqlRequest};
pub use memory::{DaySummarizer, MemoryManager, MemoryPipeline};
pub use provider_queue::{ProviderCallResult, ProviderError, ProviderQueues, QueueStats};
pub use scheduler::Heartbeat;
pub use service::CentralService;
pub use store::CoreStore;
pub use types::*;
