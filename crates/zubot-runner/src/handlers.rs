//! Handler registry for agentic and interactive task bodies.
//!
//! The chat/LLM engine is an external collaborator: it registers its handlers
//! here at startup. Task profiles name a handler via their `module` field.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::types::{RunOutcome, RunnerError, TaskContext};

/// One agentic or interactive task body.
///
/// Implementations must observe `ctx.cancel` at suspension points; the slot
/// abandons the future after a short teardown budget once cancelled.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<RunOutcome, RunnerError>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<RunOutcome, RunnerError>> + Send>>;

/// Closure adapter, mainly for embedders and tests.
pub struct FnHandler {
    f: Box<dyn Fn(TaskContext) -> HandlerFuture + Send + Sync>,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunOutcome, RunnerError>> + Send + 'static,
    {
        Arc::new(Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        })
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn run(&self, ctx: TaskContext) -> Result<RunOutcome, RunnerError> {
        (self.f)(ctx).await
    }
}

/// Named handler registry shared by all slots.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let mut handlers = self.handlers.write().unwrap();
        handlers.insert(module.into(), handler);
    }

    pub fn get(&self, module: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().unwrap();
        handlers.get(module).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap();
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
