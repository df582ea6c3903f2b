use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use job_queue_core::{parse_relative, Payload, PayloadSchema, Priority, QueueError};
use serde_json::Value;
use std::any::Any;
use thiserror::Error;

/// Result type for executors
pub type ExecutionResult = Result<Value, ExecutorError>;

/// Request to run the job again at a later moment.
///
/// Honored regardless of how many attempts the job already had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reschedule {
    pub at: DateTime<Utc>,
    /// Priority override; the job keeps its current priority when `None`
    pub priority: Option<Priority>,
}

impl Reschedule {
    pub fn at(at: DateTime<Utc>) -> Self {
        Reschedule { at, priority: None }
    }

    /// Reschedule relative to now, e.g. `Reschedule::after("+30 minutes")`
    pub fn after(expr: &str) -> Result<Self, QueueError> {
        let seconds = parse_relative(expr)?;
        Ok(Self::at(Utc::now() + ChronoDuration::seconds(seconds)))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Ways an executor can end without a result.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Defer the job; see [`Reschedule`]
    #[error("Rescheduled for {}", .0.at)]
    Reschedule(Reschedule),

    /// Stop the whole worker. The job is left reserved and will be
    /// redelivered once its time-to-run expires.
    #[error("Aborted: {reason}")]
    Abort { reason: String },

    /// Any other fault, subject to the retry policy
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn abort(reason: impl Into<String>) -> Self {
        ExecutorError::Abort {
            reason: reason.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ExecutorError::Failed(anyhow::anyhow!(message.into()))
    }
}

impl From<Reschedule> for ExecutorError {
    fn from(reschedule: Reschedule) -> Self {
        ExecutorError::Reschedule(reschedule)
    }
}

/// A named unit of work.
///
/// Executors must be idempotent: a job can be delivered more than once when a
/// reservation expires while it is still running.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The action this executor handles, also the tube its jobs live in
    fn name(&self) -> &str;

    /// Declare the payload fields this executor accepts
    fn configure_payload(&self, schema: &mut PayloadSchema);

    async fn execute(&self, payload: Payload) -> ExecutionResult;

    /// Optional capability to schedule jobs straight from domain objects
    fn as_object_payload(&self) -> Option<&dyn ObjectPayload> {
        None
    }
}

/// Builds payloads from domain objects.
pub trait ObjectPayload: Send + Sync {
    fn supports_object(&self, object: &dyn Any) -> bool;

    fn object_payload(&self, object: &dyn Any) -> Result<Payload, QueueError>;
}
