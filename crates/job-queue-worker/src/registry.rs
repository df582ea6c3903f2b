use crate::executor::Executor;
use job_queue_core::{QueueError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of executors by action.
///
/// Filled once at startup and read-only afterwards; share it behind an `Arc`.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn Executor>>,
    index: HashMap<String, usize>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own name
    pub fn register<E: Executor + 'static>(&mut self, executor: E) -> Result<()> {
        self.register_arc(Arc::new(executor))
    }

    pub fn register_arc(&mut self, executor: Arc<dyn Executor>) -> Result<()> {
        let action = executor.name().to_string();
        if self.index.contains_key(&action) {
            return Err(QueueError::DuplicateAction(action));
        }

        debug!("Registered executor for {}", action);
        self.index.insert(action, self.executors.len());
        self.executors.push(executor);
        Ok(())
    }

    pub fn resolve(&self, action: &str) -> Result<Arc<dyn Executor>> {
        self.index
            .get(action)
            .map(|&position| Arc::clone(&self.executors[position]))
            .ok_or_else(|| QueueError::UnknownAction(action.to_string()))
    }

    pub fn has(&self, action: &str) -> bool {
        self.index.contains_key(action)
    }

    /// All executors in registration order
    pub fn list(&self) -> impl Iterator<Item = (&str, &Arc<dyn Executor>)> {
        self.executors.iter().map(|executor| (executor.name(), executor))
    }

    pub fn actions(&self) -> Vec<String> {
        self.executors.iter().map(|executor| executor.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
