//! Lifecycle events emitted by the coordinator and the worker loop.

use crate::executor::Executor;
use async_trait::async_trait;
use job_queue_core::{Job, Payload};
use serde_json::Value;
use std::sync::Arc;

/// One execution attempt, handed to the pre- and post-execute hooks.
///
/// Pre-execute listeners may rewrite `payload` before it is validated;
/// post-execute listeners may rewrite `result`.
pub struct ExecutionEvent {
    pub executor: Arc<dyn Executor>,
    pub action: String,
    pub payload: Payload,
    pub result: Option<Value>,
}

impl ExecutionEvent {
    pub fn new(executor: Arc<dyn Executor>, action: &str, payload: Payload) -> Self {
        ExecutionEvent {
            executor,
            action: action.to_string(),
            payload,
            result: None,
        }
    }
}

/// A job was buried and needs manual attention
pub struct JobBuriedEvent {
    pub job: Job,
    pub cause: anyhow::Error,
    /// Release count of the job when it was buried
    pub attempts: u32,
}

#[async_trait]
pub trait WorkerListener: Send + Sync {
    async fn on_job_received(&self, _job: &Job) {}

    async fn on_pre_execute(&self, _event: &mut ExecutionEvent) {}

    async fn on_post_execute(&self, _event: &mut ExecutionEvent) {}

    async fn on_job_buried(&self, _event: &JobBuriedEvent) {}

    /// Commit whatever was buffered during the last batch of jobs
    async fn on_flush(&self) {}

    async fn on_terminate(&self) {}
}

/// Calls listeners in the order they were added
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn WorkerListener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<L: WorkerListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Arc::new(listener));
    }

    pub fn subscribe_arc(&mut self, listener: Arc<dyn WorkerListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub async fn job_received(&self, job: &Job) {
        for listener in &self.listeners {
            listener.on_job_received(job).await;
        }
    }

    pub async fn pre_execute(&self, event: &mut ExecutionEvent) {
        for listener in &self.listeners {
            listener.on_pre_execute(event).await;
        }
    }

    pub async fn post_execute(&self, event: &mut ExecutionEvent) {
        for listener in &self.listeners {
            listener.on_post_execute(event).await;
        }
    }

    pub async fn job_buried(&self, event: &JobBuriedEvent) {
        for listener in &self.listeners {
            listener.on_job_buried(event).await;
        }
    }

    pub async fn flush(&self) {
        for listener in &self.listeners {
            listener.on_flush().await;
        }
    }

    pub async fn terminate(&self) {
        for listener in &self.listeners {
            listener.on_terminate().await;
        }
    }
}
