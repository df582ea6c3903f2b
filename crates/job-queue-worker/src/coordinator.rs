//! Runs a single reserved job through its executor and settles it on the
//! queue: deleted on success, released on reschedule or retry, buried once
//! the retries are used up.

use crate::error::{Result, WorkerError};
use crate::events::{EventDispatcher, ExecutionEvent, JobBuriedEvent};
use crate::executor::{ExecutionResult, Executor, ExecutorError};
use crate::queue::Queue;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use job_queue_core::{
    decode_payload, take_retry_delay, Delay, Job, JobId, Payload, PayloadSchema, Priority,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Backoff before a failed job is retried when it carries no usable override
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(600);

/// What to do with a job whose payload does not match the executor's schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidPayloadPolicy {
    /// Drop the job as if it had completed
    #[default]
    Delete,
    /// Bury the job and emit a buried event
    Bury,
}

/// How one execution attempt ended. Each outcome maps to exactly one
/// queue operation, except `Aborted` which leaves the job reserved.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Executor returned a result; job deleted
    Completed(Value),
    /// Payload failed validation; job deleted
    Discarded { reason: String },
    Rescheduled { at: DateTime<Utc>, priority: Priority },
    /// Failed attempt number `attempt`, released to run again after `delay`
    Retried { delay: Duration, attempt: u32 },
    /// Executor asked the worker to stop
    Aborted { reason: String },
    Buried { cause: String, attempts: u32 },
}

impl Outcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted { .. })
    }
}

/// Result of running an action without the queue
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Completed(Value),
    /// The payload was rejected by the executor's schema
    Invalid(String),
}

pub struct Coordinator {
    queue: Arc<Queue>,
    events: Arc<EventDispatcher>,
    max_retries: u32,
    invalid_payload: InvalidPayloadPolicy,
    schemas: Mutex<HashMap<String, Arc<PayloadSchema>>>,
}

impl Coordinator {
    pub fn new(queue: Arc<Queue>, events: Arc<EventDispatcher>) -> Self {
        Coordinator {
            queue,
            events,
            max_retries: 1,
            invalid_payload: InvalidPayloadPolicy::default(),
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Failed jobs are buried once their release count exceeds this
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_invalid_payload(mut self, policy: InvalidPayloadPolicy) -> Self {
        self.invalid_payload = policy;
        self
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Process one reserved job and settle it on the queue.
    ///
    /// Executor failures are turned into an [`Outcome`]; an `Err` means the
    /// queue itself failed (or a reschedule date was in the past) and the job
    /// may not have been settled.
    pub async fn execute_job(&self, job: Job) -> Result<Outcome> {
        self.events.job_received(&job).await;

        let mut payload = match decode_payload(&job.data) {
            Ok(payload) => payload,
            Err(err) => {
                let cause = anyhow!(err).context(format!("Undecodable payload {}", job.data_lossy()));
                return self.bury_unprocessable(job, cause).await;
            }
        };
        let retry_delay = take_retry_delay(&mut payload);

        let executor = match self.queue.registry().resolve(&job.tube) {
            Ok(executor) => executor,
            Err(err) => return self.bury_unprocessable(job, anyhow!(err)).await,
        };

        let attempt = job.releases + 1;
        debug!("[{}] Working {} (attempt {})", job.id, job.tube, attempt);

        let execution = self.run(executor, &job.tube, payload).await;
        match execution {
            Ok(Execution::Completed(result)) => {
                self.settle(&job, "delete", self.queue.delete(&job).await)?;
                info!("[{}] Completed job with result: {}", job.id, result);
                Ok(Outcome::Completed(result))
            }
            Ok(Execution::Invalid(reason)) => match self.invalid_payload {
                InvalidPayloadPolicy::Delete => {
                    self.settle(&job, "delete", self.queue.delete(&job).await)?;
                    Ok(Outcome::Discarded { reason })
                }
                InvalidPayloadPolicy::Bury => self.bury_unprocessable(job, anyhow!(reason)).await,
            },
            Err(ExecutorError::Reschedule(reschedule)) => {
                let priority = reschedule.priority.unwrap_or(job.priority);
                let released = self.queue.reschedule(&job, reschedule.at, priority).await;
                self.settle(&job, "reschedule", released)?;

                Ok(Outcome::Rescheduled {
                    at: reschedule.at,
                    priority,
                })
            }
            Err(ExecutorError::Abort { reason }) => {
                error!("[{}] Executor for {} aborted the worker: {}", job.id, job.tube, reason);
                Ok(Outcome::Aborted { reason })
            }
            Err(ExecutorError::Failed(cause)) => self.fail(job, cause, retry_delay.as_deref()).await,
        }
    }

    /// Run `action` with `payload` directly, without touching the queue.
    ///
    /// Reschedule and abort signals come back as [`WorkerError::Executor`].
    pub async fn execute(&self, action: &str, payload: Payload) -> Result<Execution> {
        let executor = self.queue.registry().resolve(action)?;

        self.run(executor, action, payload)
            .await
            .map_err(WorkerError::from)
    }

    async fn run(
        &self,
        executor: Arc<dyn Executor>,
        action: &str,
        payload: Payload,
    ) -> std::result::Result<Execution, ExecutorError> {
        let mut event = ExecutionEvent::new(Arc::clone(&executor), action, payload);
        self.events.pre_execute(&mut event).await;

        let schema = self.schema(executor.as_ref());
        let payload = match schema.resolve(event.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                let rendered = Value::Object(event.payload.clone());
                error!("Payload {} for \"{}\" is invalid: {}", rendered, action, err);
                return Ok(Execution::Invalid(err.to_string()));
            }
        };

        let result = invoke(executor, payload).await?;

        event.result = Some(result);
        self.events.post_execute(&mut event).await;

        Ok(Execution::Completed(event.result.unwrap_or(Value::Null)))
    }

    /// Schema for an executor, built on first use
    fn schema(&self, executor: &dyn Executor) -> Arc<PayloadSchema> {
        let mut schemas = self.schemas.lock();
        let schema = schemas.entry(executor.name().to_string()).or_insert_with(|| {
            let mut schema = PayloadSchema::new();
            executor.configure_payload(&mut schema);
            Arc::new(schema)
        });

        Arc::clone(schema)
    }

    async fn fail(&self, job: Job, cause: anyhow::Error, retry_delay: Option<&str>) -> Result<Outcome> {
        let attempt = job.releases + 1;
        error!(
            "[{}] Exception occurred in {} (attempt {}): {:#}",
            job.id, job.tube, attempt, cause
        );
        debug!("[{}] {:?}", job.id, cause);

        if job.releases > self.max_retries {
            return self.bury_with(job, cause).await;
        }

        let delay = retry_backoff(job.id, retry_delay);
        let released = self.queue.release(&job, job.priority, delay).await;
        self.settle(&job, "release", released)?;

        info!("[{}] Retrying job in {}s", job.id, delay.as_secs());
        Ok(Outcome::Retried { delay, attempt })
    }

    /// Bury a job that can never succeed, without consuming retries
    async fn bury_unprocessable(&self, job: Job, cause: anyhow::Error) -> Result<Outcome> {
        error!("[{}] Job in {} cannot be processed: {:#}", job.id, job.tube, cause);
        self.bury_with(job, cause).await
    }

    /// Bury a job and raise the buried alert, unless the job had already
    /// left this worker's hands
    async fn bury_with(&self, job: Job, cause: anyhow::Error) -> Result<Outcome> {
        let buried = self.queue.bury(&job).await;
        let applied = self.settle(&job, "bury", buried)?;

        let message = format!("{:#}", cause);
        let attempts = job.releases;
        if applied {
            error!("[{}] Job buried after {} releases", job.id, job.releases);
            self.events
                .job_buried(&JobBuriedEvent { job, cause, attempts })
                .await;
        }

        Ok(Outcome::Buried {
            cause: message,
            attempts,
        })
    }

    /// Whether the operation applied. A job that vanished was settled by
    /// someone else; anything else is a fault.
    fn settle(&self, job: &Job, operation: &str, result: job_queue_core::Result<()>) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => {
                warn!("[{}] Could not {} job, it is gone: {}", job.id, operation, err);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Run the executor on its own task so a panic is contained
async fn invoke(executor: Arc<dyn Executor>, payload: Payload) -> ExecutionResult {
    let action = executor.name().to_string();

    match tokio::spawn(async move { executor.execute(payload).await }).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            error!("Executor for {} panicked: {:?}", action, err);
            Err(ExecutorError::failed(format!("Executor for \"{}\" panicked", action)))
        }
        Err(_) => Err(ExecutorError::failed(format!("Executor for \"{}\" was cancelled", action))),
    }
}

fn retry_backoff(job_id: JobId, expr: Option<&str>) -> Duration {
    let Some(expr) = expr else {
        return DEFAULT_RETRY_BACKOFF;
    };

    match Delay::from(expr).resolve() {
        Ok(delay) => delay,
        Err(err) => {
            warn!("[{}] Ignoring retry delay \"{}\": {}", job_id, expr, err);
            DEFAULT_RETRY_BACKOFF
        }
    }
}
