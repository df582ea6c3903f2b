#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use job_queue_core::{Job, JobId, JobStats, Payload, PayloadSchema, Priority, TubeStats, ValueKind};
use job_queue_transport::{MemoryTransport, Result, Transport};
use job_queue_worker::{
    Coordinator, EventDispatcher, ExecutionEvent, ExecutionResult, Executor, ExecutorError,
    ExecutorRegistry, JobBuriedEvent, Queue, Reschedule, WorkerListener,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("test payload must be an object"),
    }
}

/// Transport calls that change a job's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Put { tube: String, priority: Priority, delay: Duration },
    Release { id: JobId, priority: Priority, delay: Duration },
    Delete(JobId),
    Bury(JobId),
    Kick { tube: String, max: u32 },
}

/// Delegates to a [`MemoryTransport`] and records every state-changing call
pub struct RecordingTransport {
    inner: MemoryTransport,
    calls: Mutex<Vec<Call>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        RecordingTransport {
            inner: MemoryTransport::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Calls that settle a reserved job
    pub fn settlements(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Release { .. } | Call::Delete(_) | Call::Bury(_)))
            .collect()
    }

    pub fn forget(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn put_in_tube(
        &self,
        tube: &str,
        data: Vec<u8>,
        priority: Priority,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId> {
        self.record(Call::Put {
            tube: tube.to_string(),
            priority,
            delay,
        });
        self.inner.put_in_tube(tube, data, priority, delay, ttr).await
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        self.inner.reserve(timeout).await
    }

    async fn release(&self, id: JobId, priority: Priority, delay: Duration) -> Result<()> {
        self.record(Call::Release { id, priority, delay });
        self.inner.release(id, priority, delay).await
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.record(Call::Delete(id));
        self.inner.delete(id).await
    }

    async fn bury(&self, id: JobId, priority: Priority) -> Result<()> {
        self.record(Call::Bury(id));
        self.inner.bury(id, priority).await
    }

    async fn kick(&self, tube: &str, max: u32) -> Result<u32> {
        self.record(Call::Kick {
            tube: tube.to_string(),
            max,
        });
        self.inner.kick(tube, max).await
    }

    async fn peek_ready(&self, tube: &str) -> Result<Job> {
        self.inner.peek_ready(tube).await
    }

    async fn peek_delayed(&self, tube: &str) -> Result<Job> {
        self.inner.peek_delayed(tube).await
    }

    async fn peek_buried(&self, tube: &str) -> Result<Job> {
        self.inner.peek_buried(tube).await
    }

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats> {
        self.inner.stats_tube(tube).await
    }

    async fn stats_job(&self, id: JobId) -> Result<JobStats> {
        self.inner.stats_job(id).await
    }

    async fn watch(&self, tube: &str) -> Result<usize> {
        self.inner.watch(tube).await
    }

    async fn ignore(&self, tube: &str) -> Result<usize> {
        self.inner.ignore(tube).await
    }

    async fn list_tubes_watched(&self) -> Result<Vec<String>> {
        self.inner.list_tubes_watched().await
    }
}

/// Sends nothing, but insists on a recipient
pub struct SendEmail;

#[async_trait]
impl Executor for SendEmail {
    fn name(&self) -> &str {
        "send.email"
    }

    fn configure_payload(&self, schema: &mut PayloadSchema) {
        schema.required("to").allowed_kinds("to", &[ValueKind::String]);
    }

    async fn execute(&self, _payload: Payload) -> ExecutionResult {
        Ok(Value::String("sent".to_string()))
    }
}

/// Fails every attempt
pub struct Failing {
    pub name: &'static str,
    pub attempts: AtomicUsize,
}

impl Failing {
    pub fn new(name: &'static str) -> Self {
        Failing {
            name,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Executor for Failing {
    fn name(&self) -> &str {
        self.name
    }

    fn configure_payload(&self, schema: &mut PayloadSchema) {
        schema.allow_extra_fields();
    }

    async fn execute(&self, _payload: Payload) -> ExecutionResult {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Err(ExecutorError::failed(format!("smtp unreachable (attempt {})", attempt)))
    }
}

/// Defers every job to a fixed date
pub struct Deferring {
    pub at: DateTime<Utc>,
    pub priority: Option<Priority>,
}

#[async_trait]
impl Executor for Deferring {
    fn name(&self) -> &str {
        "report.build"
    }

    fn configure_payload(&self, schema: &mut PayloadSchema) {
        schema.allow_extra_fields();
    }

    async fn execute(&self, _payload: Payload) -> ExecutionResult {
        let mut reschedule = Reschedule::at(self.at);
        if let Some(priority) = self.priority {
            reschedule = reschedule.with_priority(priority);
        }

        Err(reschedule.into())
    }
}

pub struct Aborting;

#[async_trait]
impl Executor for Aborting {
    fn name(&self) -> &str {
        "disk.check"
    }

    fn configure_payload(&self, schema: &mut PayloadSchema) {
        schema.allow_extra_fields();
    }

    async fn execute(&self, _payload: Payload) -> ExecutionResult {
        Err(ExecutorError::abort("disk full"))
    }
}

pub struct Panicking;

#[async_trait]
impl Executor for Panicking {
    fn name(&self) -> &str {
        "panic.now"
    }

    fn configure_payload(&self, schema: &mut PayloadSchema) {
        schema.allow_extra_fields();
    }

    async fn execute(&self, _payload: Payload) -> ExecutionResult {
        panic!("executor bug");
    }
}

/// Sums `amount` without any state of its own
pub struct Total;

#[async_trait]
impl Executor for Total {
    fn name(&self) -> &str {
        "invoice.total"
    }

    fn configure_payload(&self, schema: &mut PayloadSchema) {
        schema
            .required("amounts")
            .allowed_kinds("amounts", &[ValueKind::Array]);
    }

    async fn execute(&self, payload: Payload) -> ExecutionResult {
        let total: i64 = payload["amounts"]
            .as_array()
            .map(|amounts| amounts.iter().filter_map(Value::as_i64).sum())
            .unwrap_or(0);

        Ok(Value::from(total))
    }
}

/// Takes `seconds` of (tokio) time to complete
pub struct Slow;

#[async_trait]
impl Executor for Slow {
    fn name(&self) -> &str {
        "slow.job"
    }

    fn configure_payload(&self, schema: &mut PayloadSchema) {
        schema.default_value("seconds", 10);
    }

    async fn execute(&self, payload: Payload) -> ExecutionResult {
        let seconds = payload["seconds"].as_u64().unwrap_or(10);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(Value::Null)
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<&'static str>>,
    pub results: Mutex<Vec<Value>>,
    pub buried: Mutex<Vec<(JobId, String, u32)>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|event| **event == name).count()
    }
}

#[async_trait]
impl WorkerListener for RecordingListener {
    async fn on_job_received(&self, _job: &Job) {
        self.events.lock().push("received");
    }

    async fn on_pre_execute(&self, _event: &mut ExecutionEvent) {
        self.events.lock().push("pre_execute");
    }

    async fn on_post_execute(&self, event: &mut ExecutionEvent) {
        self.events.lock().push("post_execute");
        if let Some(result) = &event.result {
            self.results.lock().push(result.clone());
        }
    }

    async fn on_job_buried(&self, event: &JobBuriedEvent) {
        self.events.lock().push("buried");
        self.buried
            .lock()
            .push((event.job.id, format!("{:#}", event.cause), event.attempts));
    }

    async fn on_flush(&self) {
        self.events.lock().push("flush");
    }

    async fn on_terminate(&self) {
        self.events.lock().push("terminate");
    }
}

/// A queue over a recording transport, plus a listener wired into the events
pub struct Harness {
    pub transport: Arc<RecordingTransport>,
    pub queue: Arc<Queue>,
    pub listener: Arc<RecordingListener>,
}

impl Harness {
    pub fn new(executors: Vec<Arc<dyn Executor>>) -> Self {
        init_tracing();

        let mut registry = ExecutorRegistry::new();
        for executor in executors {
            registry.register_arc(executor).unwrap();
        }

        let transport = Arc::new(RecordingTransport::new());
        let queue = Queue::new(transport.clone(), Arc::new(registry));

        Harness {
            transport,
            queue: Arc::new(queue),
            listener: Arc::new(RecordingListener::default()),
        }
    }

    pub fn dispatcher(&self) -> EventDispatcher {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe_arc(self.listener.clone());
        dispatcher
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.queue.clone(), Arc::new(self.dispatcher()))
    }

    /// Reserve the next job of `action`, after it was released `releases` times
    pub async fn reserve_after_releases(&self, action: &str, releases: u32) -> Job {
        self.queue.watch_only(&[action]).await.unwrap();

        for _ in 0..releases {
            let job = self.queue.reserve(Duration::ZERO).await.unwrap().unwrap();
            self.queue.release(&job, job.priority, Duration::ZERO).await.unwrap();
        }

        let job = self.queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.releases, releases);
        self.transport.forget();
        job
    }
}
