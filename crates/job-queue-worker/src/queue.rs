use crate::registry::ExecutorRegistry;
use chrono::{DateTime, Utc};
use job_queue_core::{
    check_bound, encode_payload, parse_relative, Delay, Job, JobId, JobStats, Payload, PeekState, Priority,
    QueueError, Result, TubeStats, DEFAULT_RETRY_DELAY, DEFAULT_TTR_SECS, RETRY_DELAY_FIELD,
};
use job_queue_transport::Transport;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How a new job is put on the queue
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Delay,
    /// Defaults to [`Priority::DEFAULT`]
    pub priority: Option<Priority>,
    /// Defaults to the queue's default time-to-run
    pub ttr: Option<Duration>,
    /// Backoff before a failed attempt is retried, as a relative time
    /// expression. Defaults to [`DEFAULT_RETRY_DELAY`].
    pub retry_delay: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: impl Into<Delay>) -> Self {
        self.delay = delay.into();
        self
    }

    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn ttr(mut self, ttr: Duration) -> Self {
        self.ttr = Some(ttr);
        self
    }

    pub fn retry_delay(mut self, expr: impl Into<String>) -> Self {
        self.retry_delay = Some(expr.into());
        self
    }
}

/// Job operations against the transport, restricted to registered actions.
pub struct Queue {
    transport: Arc<dyn Transport>,
    registry: Arc<ExecutorRegistry>,
    default_ttr: Duration,
}

impl Queue {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<ExecutorRegistry>) -> Self {
        Queue {
            transport,
            registry,
            default_ttr: Duration::from_secs(DEFAULT_TTR_SECS),
        }
    }

    /// Time-to-run for jobs added without one
    pub fn with_default_ttr(mut self, ttr: Duration) -> Self {
        self.default_ttr = ttr;
        self
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn default_ttr(&self) -> Duration {
        self.default_ttr
    }

    fn ensure_registered(&self, action: &str) -> Result<()> {
        if self.registry.has(action) {
            Ok(())
        } else {
            Err(QueueError::UnknownAction(action.to_string()))
        }
    }

    /// Add a job for `action`, returning the transport's job id.
    pub async fn add(&self, action: &str, mut payload: Payload, options: EnqueueOptions) -> Result<JobId> {
        self.ensure_registered(action)?;

        if payload.contains_key(RETRY_DELAY_FIELD) {
            return Err(QueueError::InvalidArgument(format!(
                "{} is reserved in payload",
                RETRY_DELAY_FIELD
            )));
        }

        let retry_delay = options
            .retry_delay
            .unwrap_or_else(|| DEFAULT_RETRY_DELAY.to_string());
        if parse_relative(&retry_delay)? < 0 {
            return Err(QueueError::InvalidArgument(format!(
                "The retry delay cannot be negative (was \"{}\")",
                retry_delay
            )));
        }

        let delay = options.delay.resolve()?;
        let priority = options.priority.unwrap_or_default();
        let ttr = options.ttr.unwrap_or(self.default_ttr);
        check_bound("time-to-run", ttr)?;

        payload.insert(RETRY_DELAY_FIELD.to_string(), Value::String(retry_delay));
        let data = encode_payload(&payload)?;
        let rendered = Value::Object(payload);
        let id = self
            .transport
            .put_in_tube(action, data, priority, delay, ttr)
            .await?;

        debug!(
            "[{}] Added job in tube \"{}\" with: payload: {}, priority: {}, delay: {}s, ttr: {}s",
            id,
            action,
            rendered,
            priority,
            delay.as_secs(),
            ttr.as_secs()
        );

        Ok(id)
    }

    /// Add a job whose payload is derived from a domain object by the
    /// action's executor.
    pub async fn add_for_object(
        &self,
        action: &str,
        object: &(dyn Any + Sync),
        options: EnqueueOptions,
    ) -> Result<JobId> {
        let payload = self.object_payload(action, object)?;
        self.add(action, payload, options).await
    }

    /// Bulk variant of [`Queue::add_for_object`]
    pub async fn add_for_objects<T: Any + Sync>(
        &self,
        action: &str,
        objects: &[T],
        options: EnqueueOptions,
    ) -> Result<Vec<JobId>> {
        let mut ids = Vec::with_capacity(objects.len());
        for object in objects {
            ids.push(self.add_for_object(action, object, options.clone()).await?);
        }

        Ok(ids)
    }

    fn object_payload(&self, action: &str, object: &dyn Any) -> Result<Payload> {
        let executor = self.registry.resolve(action)?;
        let capability = executor
            .as_object_payload()
            .ok_or_else(|| QueueError::UnsupportedObject {
                action: action.to_string(),
                reason: "the executor does not build payloads from objects".to_string(),
            })?;

        if !capability.supports_object(object) {
            return Err(QueueError::InvalidArgument(format!(
                "The executor for action \"{}\" does not support this object",
                action
            )));
        }

        capability.object_payload(object)
    }

    /// Release a reserved job so it runs again at `at`.
    ///
    /// Dates in the past are rejected before the transport is contacted.
    pub async fn reschedule(&self, job: &Job, at: DateTime<Utc>, priority: Priority) -> Result<()> {
        let now = Utc::now();
        if at < now {
            return Err(QueueError::InvalidArgument(format!(
                "You cannot reschedule a job in the past (got {}, and the current date is {})",
                at.to_rfc3339(),
                now.to_rfc3339()
            )));
        }

        // round up, so a job never runs before its date
        let millis = (at - now).num_milliseconds().max(0) as u64;
        let delay = Duration::from_secs(millis.div_ceil(1000));
        check_bound("delay", delay)?;
        self.transport.release(job.id, priority, delay).await?;

        info!("[{}] Rescheduled job for {}", job.id, at.format("%Y-%m-%d %H:%M:%S"));
        Ok(())
    }

    /// Release a reserved job back onto the queue after `delay`
    pub async fn release(&self, job: &Job, priority: Priority, delay: Duration) -> Result<()> {
        check_bound("delay", delay)?;
        self.transport.release(job.id, priority, delay).await?;

        debug!("[{}] Released job with priority {} and delay {}s", job.id, priority, delay.as_secs());
        Ok(())
    }

    pub async fn watch<S: AsRef<str>>(&self, actions: &[S]) -> Result<()> {
        for action in actions {
            self.transport.watch(action.as_ref()).await?;
            debug!("Watching tube \"{}\"", action.as_ref());
        }

        Ok(())
    }

    pub async fn ignore<S: AsRef<str>>(&self, actions: &[S]) -> Result<()> {
        for action in actions {
            self.transport.ignore(action.as_ref()).await?;
            debug!("Ignoring tube \"{}\"", action.as_ref());
        }

        Ok(())
    }

    /// Replace the watched tubes with `actions`.
    ///
    /// The new tubes are watched before the old ones are ignored, so the
    /// connection never watches nothing.
    pub async fn watch_only<S: AsRef<str>>(&self, actions: &[S]) -> Result<()> {
        if actions.is_empty() {
            return Err(QueueError::InvalidArgument(
                "At least one action must be watched".to_string(),
            ));
        }

        let watching = self.transport.list_tubes_watched().await?;
        self.watch(actions).await?;

        let stale: Vec<String> = watching
            .into_iter()
            .filter(|tube| !actions.iter().any(|action| action.as_ref() == tube))
            .collect();
        self.ignore(&stale).await
    }

    /// Reserve the next job from the watched tubes, waiting at most `timeout`
    pub async fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        Ok(self.transport.reserve(timeout).await?)
    }

    /// Look at the next job of `action` in the given state without reserving it
    pub async fn peek(&self, action: &str, state: PeekState) -> Result<Option<Job>> {
        self.ensure_registered(action)?;

        let peeked = match state {
            PeekState::Ready => self.transport.peek_ready(action).await,
            PeekState::Delayed => self.transport.peek_delayed(action).await,
            PeekState::Buried => self.transport.peek_buried(action).await,
        };

        not_found_as_none(peeked.map_err(QueueError::from))
    }

    pub async fn delete(&self, job: &Job) -> Result<()> {
        self.transport.delete(job.id).await?;

        debug!("[{}] Job deleted", job.id);
        Ok(())
    }

    pub async fn bury(&self, job: &Job) -> Result<()> {
        self.transport.bury(job.id, job.priority).await?;

        debug!("[{}] Job buried", job.id);
        Ok(())
    }

    /// Move up to `max` buried jobs of `action` back to the ready queue
    pub async fn kick(&self, action: &str, max: u32) -> Result<u32> {
        let kicked = self.transport.kick(action, max).await?;

        debug!("Kicked {} \"{}\" jobs back onto the ready queue", kicked, action);
        Ok(kicked)
    }

    pub async fn job_stats(&self, job: &Job) -> Result<JobStats> {
        Ok(self.transport.stats_job(job.id).await?)
    }

    /// Statistics of the tube behind `action`, `None` when the tube does not exist
    pub async fn action_stats(&self, action: &str) -> Result<Option<TubeStats>> {
        not_found_as_none(self.transport.stats_tube(action).await.map_err(QueueError::from))
    }

    /// Delete every job of `action` in the given states (all states when empty),
    /// returning the number of deleted jobs.
    pub async fn clear(&self, action: &str, states: &[PeekState]) -> Result<u64> {
        let states = if states.is_empty() { &PeekState::ALL[..] } else { states };
        let mut deleted = 0;

        for &state in states {
            while let Some(job) = self.peek(action, state).await? {
                match self.delete(&job).await {
                    Ok(()) => deleted += 1,
                    // another worker got there first
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err),
                }
            }
        }

        info!("Cleared {} \"{}\" jobs", deleted, action);
        Ok(deleted)
    }

    /// Reserve up to `limit` ready jobs of `action` and put them straight
    /// back, returning what was seen.
    ///
    /// Changes the connection's watch list to `action` only.
    pub async fn inspect(&self, action: &str, limit: usize) -> Result<Vec<Job>> {
        self.ensure_registered(action)?;
        self.watch_only(&[action]).await?;

        let mut jobs = Vec::new();
        while jobs.len() < limit {
            match self.reserve(Duration::from_secs(1)).await? {
                Some(job) => jobs.push(job),
                None => break,
            }
        }

        for job in &jobs {
            self.release(job, job.priority, Duration::ZERO).await?;
        }

        Ok(jobs)
    }
}

fn not_found_as_none<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionResult, Executor, ObjectPayload};
    use async_trait::async_trait;
    use job_queue_core::{decode_payload, PayloadSchema, TransportError, MAX_DELAY_SECS};
    use job_queue_transport::MemoryTransport;
    use serde_json::json;

    struct User {
        id: u64,
    }

    struct IndexUser;

    #[async_trait]
    impl Executor for IndexUser {
        fn name(&self) -> &str {
            "user.index"
        }

        fn configure_payload(&self, schema: &mut PayloadSchema) {
            schema.required("id");
        }

        async fn execute(&self, _payload: Payload) -> ExecutionResult {
            Ok(Value::Bool(true))
        }

        fn as_object_payload(&self) -> Option<&dyn ObjectPayload> {
            Some(self)
        }
    }

    impl ObjectPayload for IndexUser {
        fn supports_object(&self, object: &dyn Any) -> bool {
            object.is::<User>()
        }

        fn object_payload(&self, object: &dyn Any) -> Result<Payload> {
            let user = object
                .downcast_ref::<User>()
                .ok_or_else(|| QueueError::InvalidArgument("not a user".to_string()))?;

            let mut payload = Payload::new();
            payload.insert("id".to_string(), json!(user.id));
            Ok(payload)
        }
    }

    struct Plain;

    #[async_trait]
    impl Executor for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        fn configure_payload(&self, _schema: &mut PayloadSchema) {}

        async fn execute(&self, _payload: Payload) -> ExecutionResult {
            Ok(Value::Null)
        }
    }

    fn queue() -> Queue {
        let mut registry = ExecutorRegistry::new();
        registry.register(IndexUser).unwrap();
        registry.register(Plain).unwrap();

        Queue::new(Arc::new(MemoryTransport::new()), Arc::new(registry))
    }

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    #[tokio::test]
    async fn test_add_stores_retry_delay() {
        let queue = queue();
        let id = queue
            .add("user.index", payload(json!({"id": 1})), EnqueueOptions::new().retry_delay("5 minutes"))
            .await
            .unwrap();

        let job = queue.peek("user.index", PeekState::Ready).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.priority, Priority::DEFAULT);
        assert_eq!(job.ttr, Duration::from_secs(DEFAULT_TTR_SECS));

        let stored = decode_payload(&job.data).unwrap();
        assert_eq!(stored[RETRY_DELAY_FIELD], "5 minutes");
        assert_eq!(stored["id"], 1);
    }

    #[tokio::test]
    async fn test_add_defaults_retry_delay_and_ttr() {
        let queue = queue().with_default_ttr(Duration::from_secs(1200));
        queue.add("plain", Payload::new(), EnqueueOptions::new()).await.unwrap();

        let job = queue.peek("plain", PeekState::Ready).await.unwrap().unwrap();
        assert_eq!(decode_payload(&job.data).unwrap()[RETRY_DELAY_FIELD], DEFAULT_RETRY_DELAY);
        assert_eq!(job.ttr, Duration::from_secs(1200));
    }

    #[tokio::test]
    async fn test_add_rejections() {
        let queue = queue();

        let err = queue.add("nope", Payload::new(), EnqueueOptions::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownAction(_)));

        let mut reserved = Payload::new();
        reserved.insert(RETRY_DELAY_FIELD.to_string(), json!("1min"));
        let err = queue.add("plain", reserved, EnqueueOptions::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));

        let err = queue
            .add("plain", Payload::new(), EnqueueOptions::new().retry_delay("whenever"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));

        let err = queue
            .add("plain", Payload::new(), EnqueueOptions::new().delay(-1i64))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_relative_delay() {
        let queue = queue();
        let id = queue
            .add("plain", Payload::new(), EnqueueOptions::new().delay("10 seconds"))
            .await
            .unwrap();

        assert!(queue.peek("plain", PeekState::Ready).await.unwrap().is_none());
        let job = queue.peek("plain", PeekState::Delayed).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(queue.job_stats(&job).await.unwrap().delay, 10);
    }

    #[tokio::test]
    async fn test_add_for_object() {
        let queue = queue();

        let ids = queue
            .add_for_objects("user.index", &[User { id: 7 }, User { id: 8 }], EnqueueOptions::new())
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let job = queue.peek("user.index", PeekState::Ready).await.unwrap().unwrap();
        assert_eq!(decode_payload(&job.data).unwrap()["id"], 7);

        let err = queue
            .add_for_object("user.index", &"not a user", EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));

        let err = queue
            .add_for_object("plain", &User { id: 1 }, EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnsupportedObject { .. }));
    }

    #[tokio::test]
    async fn test_peek_and_stats_not_found() {
        let queue = queue();

        assert!(queue.peek("plain", PeekState::Buried).await.unwrap().is_none());
        assert!(queue.action_stats("plain").await.unwrap().is_none());
        assert!(matches!(
            queue.peek("nope", PeekState::Ready).await,
            Err(QueueError::UnknownAction(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_durations_are_rejected() {
        let queue = queue();

        for options in [
            EnqueueOptions::new().delay(i64::MAX),
            EnqueueOptions::new().delay(MAX_DELAY_SECS as i64 + 1),
            EnqueueOptions::new().ttr(Duration::from_secs(u64::MAX)),
        ] {
            let err = queue.add("plain", Payload::new(), options).await.unwrap_err();
            assert!(matches!(err, QueueError::InvalidArgument(_)));
        }
        assert!(queue.action_stats("plain").await.unwrap().is_none());

        queue.watch_only(&["plain"]).await.unwrap();
        queue
            .add("plain", Payload::new(), EnqueueOptions::new().delay(MAX_DELAY_SECS as i64))
            .await
            .unwrap();
        queue.add("plain", Payload::new(), EnqueueOptions::new()).await.unwrap();
        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

        let far = Utc::now() + chrono::Duration::days(365 * 1_000);
        let err = queue.reschedule(&job, far, job.priority).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
        let err = queue
            .release(&job, job.priority, Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));

        // still reserved by us, so it can be settled normally
        queue.delete(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_reschedule_rejects_past_dates() {
        let queue = queue();
        queue.watch_only(&["plain"]).await.unwrap();
        queue.add("plain", Payload::new(), EnqueueOptions::new()).await.unwrap();
        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

        let err = queue
            .reschedule(&job, Utc::now() - chrono::Duration::seconds(5), job.priority)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));

        queue
            .reschedule(&job, Utc::now() + chrono::Duration::seconds(30), Priority::new(3))
            .await
            .unwrap();
        let stats = queue.job_stats(&job).await.unwrap();
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.priority, Priority::new(3));
        assert!(stats.delay >= 29 && stats.delay <= 30);
    }

    #[tokio::test]
    async fn test_watch_only_replaces_subscription() {
        let queue = queue();
        queue.watch_only(&["plain", "user.index"]).await.unwrap();
        assert_eq!(
            queue.transport().list_tubes_watched().await.unwrap(),
            vec!["plain".to_string(), "user.index".to_string()]
        );

        queue.watch_only(&["user.index"]).await.unwrap();
        assert_eq!(
            queue.transport().list_tubes_watched().await.unwrap(),
            vec!["user.index".to_string()]
        );

        let empty: [&str; 0] = [];
        assert!(matches!(queue.watch_only(&empty).await, Err(QueueError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_bury_kick_clear() {
        let queue = queue();
        queue.watch_only(&["plain"]).await.unwrap();
        for _ in 0..3 {
            queue.add("plain", Payload::new(), EnqueueOptions::new()).await.unwrap();
        }

        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        queue.bury(&job).await.unwrap();
        assert_eq!(queue.peek("plain", PeekState::Buried).await.unwrap().unwrap().id, job.id);

        assert_eq!(queue.kick("plain", 10).await.unwrap(), 1);
        assert!(queue.peek("plain", PeekState::Buried).await.unwrap().is_none());

        assert_eq!(queue.clear("plain", &[]).await.unwrap(), 3);
        assert!(queue.peek("plain", PeekState::Ready).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inspect_puts_jobs_back() {
        let queue = queue();
        for id in 0..3 {
            queue
                .add("user.index", payload(json!({"id": id})), EnqueueOptions::new().priority(10u32))
                .await
                .unwrap();
        }

        let jobs = queue.inspect("user.index", 2).await.unwrap();
        assert_eq!(jobs.len(), 2);

        let stats = queue.action_stats("user.index").await.unwrap().unwrap();
        assert_eq!(stats.current_jobs_ready, 3);
        assert_eq!(stats.current_jobs_reserved, 0);

        let stats = queue.job_stats(&jobs[0]).await.unwrap();
        assert_eq!(stats.priority, Priority::new(10));
    }

    #[tokio::test]
    async fn test_delete_missing_job_is_not_found() {
        let queue = queue();
        let job = Job {
            id: 99,
            tube: "plain".to_string(),
            data: Vec::new(),
            priority: Priority::DEFAULT,
            releases: 0,
            ttr: Duration::from_secs(60),
        };

        let err = queue.delete(&job).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, QueueError::Transport(TransportError::NotFound(_))));
    }
}
