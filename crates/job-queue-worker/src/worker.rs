use crate::config::WorkerConfig;
use crate::coordinator::{Coordinator, Outcome};
use crate::error::{Result, WorkerError};
use crate::events::EventDispatcher;
use crate::queue::Queue;
use crate::registry::ExecutorRegistry;
use job_queue_core::Job;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Reads the memory in use by the worker process
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> u64;
}

/// Resident memory of the current process, as reported by the OS
pub struct ProcessMemory;

impl MemoryProbe for ProcessMemory {
    fn used_bytes(&self) -> u64 {
        use sysinfo::{Pid, ProcessesToUpdate, System};

        let pid = Pid::from_u32(std::process::id());
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        sys.process(pid).map(|process| process.memory()).unwrap_or(0)
    }
}

/// Why a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No job arrived within the reserve timeout
    Idle,
    JobLimit,
    MemoryLimit,
    TimeLimit,
    /// An executor aborted the worker
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Attempts processed, whatever their outcome
    pub jobs: u64,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Process exit code: non-zero only when an executor aborted the run
    pub fn exit_code(&self) -> i32 {
        match self.stop_reason {
            StopReason::Aborted => 1,
            _ => 0,
        }
    }
}

/// Sequential consumer: reserves one job at a time and runs it to completion
/// before reserving the next.
pub struct Worker {
    config: WorkerConfig,
    worker_id: String,
    queue: Arc<Queue>,
    events: Arc<EventDispatcher>,
    coordinator: Coordinator,
    memory: Box<dyn MemoryProbe>,
}

impl Worker {
    pub fn new(config: WorkerConfig, queue: Arc<Queue>, events: EventDispatcher) -> Result<Self> {
        config.validate()?;

        let worker_id = config.identity(&select_actions(&config, queue.registry()));
        let events = Arc::new(events);
        let coordinator = Coordinator::new(Arc::clone(&queue), Arc::clone(&events))
            .with_max_retries(config.max_retries)
            .with_invalid_payload(config.invalid_payload);

        Ok(Worker {
            config,
            worker_id,
            queue,
            events,
            coordinator,
            memory: Box::new(ProcessMemory),
        })
    }

    pub fn with_memory_probe<P: MemoryProbe + 'static>(mut self, probe: P) -> Self {
        self.memory = Box::new(probe);
        self
    }

    pub fn id(&self) -> &str {
        &self.worker_id
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Tubes this worker subscribes to: the configured actions, or every
    /// registered action, minus the filters
    pub fn actions(&self) -> Vec<String> {
        select_actions(&self.config, self.queue.registry())
    }

    /// Work jobs until a stop condition is met
    pub async fn run(&self) -> Result<RunSummary> {
        let span = info_span!("worker", id = %self.worker_id);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let limits = &self.config.limits;

        let actions = self.actions();
        if actions.is_empty() {
            return Err(WorkerError::Config("there are no actions to work on".to_string()));
        }
        self.queue.watch_only(&actions).await?;
        info!("Waiting for reserved job in {}", actions.join(", "));

        let mut jobs: u64 = 0;
        let stop_reason = loop {
            let Some(job) = self.queue.reserve(limits.reserve_timeout()).await? else {
                info!("No job reserved within {}s", limits.reserve_timeout_seconds);
                break StopReason::Idle;
            };

            debug!("[{}] Working {} with payload {}", job.id, job.tube, job.data_lossy());
            let aborted = self.process(job).await;
            jobs += 1;

            if jobs % limits.batch_size == 0 {
                debug!("Batch complete");
                self.events.flush().await;
            }

            if aborted {
                break StopReason::Aborted;
            }

            if limits.max_jobs > 0 && jobs >= limits.max_jobs {
                info!("Maximum number of jobs completed");
                break StopReason::JobLimit;
            }

            if limits.max_memory_bytes > 0 {
                let used = self.memory.used_bytes();
                if used > limits.max_memory_bytes {
                    info!("Memory limit of {} bytes reached (using {})", limits.max_memory_bytes, used);
                    break StopReason::MemoryLimit;
                }
            }

            if let Some(max_run) = limits.max_run() {
                if started.elapsed() > max_run {
                    info!("Maximum execution time of {}s reached", max_run.as_secs());
                    break StopReason::TimeLimit;
                }
            }
        };

        self.events.flush().await;

        let elapsed = started.elapsed();
        let min_run = limits.min_run();
        if elapsed < min_run {
            info!("Sleeping until worker has run for at least {}s", min_run.as_secs());
            tokio::time::sleep(min_run - elapsed).await;
        }

        self.events.terminate().await;

        let summary = RunSummary {
            jobs,
            stop_reason,
            elapsed: started.elapsed(),
        };
        info!("Shutting down worker after {} jobs ({:?})", summary.jobs, summary.stop_reason);

        Ok(summary)
    }

    /// Run one job, returning whether it aborted the worker
    async fn process(&self, job: Job) -> bool {
        let id = job.id;
        let fallback = job.clone();

        match self.coordinator.execute_job(job).await {
            Ok(Outcome::Aborted { reason }) => {
                error!("[{}] Aborting worker: {}", id, reason);
                true
            }
            Ok(outcome) => {
                debug!("[{}] {:?}", id, outcome);
                false
            }
            Err(err) => {
                error!("[{}] {}", id, err);
                if let Err(err) = self.queue.bury(&fallback).await {
                    warn!("[{}] Could not bury job: {}", id, err);
                }
                false
            }
        }
    }
}

fn select_actions(config: &WorkerConfig, registry: &ExecutorRegistry) -> Vec<String> {
    let actions = if config.actions.is_empty() {
        registry.actions()
    } else {
        config.actions.clone()
    };

    actions
        .into_iter()
        .filter(|action| !config.filters.contains(action))
        .collect()
}
