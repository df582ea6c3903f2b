use async_trait::async_trait;
use job_queue_core::{Job, JobId, JobStats, Priority, TransportError, TubeStats};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Primitive operations of a beanstalk-style work queue, as seen from a
/// single connection.
///
/// Implementations own the wire protocol. A "not found" condition (unknown
/// tube, unknown job, nothing to peek) must be reported as
/// [`TransportError::NotFound`] so callers can tell it apart from real faults.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Put a job into a tube, returning its id
    async fn put_in_tube(
        &self,
        tube: &str,
        data: Vec<u8>,
        priority: Priority,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId>;

    /// Reserve a job from any watched tube, waiting at most `timeout`.
    /// Returns `None` when the timeout passes without a job.
    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>>;

    /// Return a reserved job to the ready (or delayed) state
    async fn release(&self, id: JobId, priority: Priority, delay: Duration) -> Result<()>;

    async fn delete(&self, id: JobId) -> Result<()>;

    /// Move a reserved job to the buried state
    async fn bury(&self, id: JobId, priority: Priority) -> Result<()>;

    /// Move up to `max` buried jobs (or delayed jobs when none are buried)
    /// of a tube back to ready, returning how many were moved
    async fn kick(&self, tube: &str, max: u32) -> Result<u32>;

    async fn peek_ready(&self, tube: &str) -> Result<Job>;

    async fn peek_delayed(&self, tube: &str) -> Result<Job>;

    async fn peek_buried(&self, tube: &str) -> Result<Job>;

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats>;

    async fn stats_job(&self, id: JobId) -> Result<JobStats>;

    /// Add a tube to the watch list, returning the number of watched tubes
    async fn watch(&self, tube: &str) -> Result<usize>;

    /// Remove a tube from the watch list, returning the number of watched tubes
    async fn ignore(&self, tube: &str) -> Result<usize>;

    async fn list_tubes_watched(&self) -> Result<Vec<String>>;
}
