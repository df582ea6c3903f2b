use crate::coordinator::InvalidPayloadPolicy;
use crate::error::WorkerError;
use crate::queue::Queue;
use crate::registry::ExecutorRegistry;
use job_queue_core::MAX_DELAY_SECS;
use job_queue_transport::Transport;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Operational limits of one worker run. A zero disables a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Stop after this many jobs
    pub max_jobs: u64,
    /// Stop once the process uses more memory than this
    pub max_memory_bytes: u64,
    /// Stop once the worker has run this long
    pub max_run_seconds: u64,
    /// Jobs between two flush events
    pub batch_size: u64,
    /// A run shorter than this sleeps before returning, so a process
    /// supervisor does not mistake a quick exit for a crash
    pub min_run_seconds: u64,
    pub reserve_timeout_seconds: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            max_jobs: 20,
            max_memory_bytes: 0,
            max_run_seconds: 0,
            batch_size: 15,
            min_run_seconds: 15,
            reserve_timeout_seconds: 60,
        }
    }
}

impl ResourceLimits {
    pub fn max_run(&self) -> Option<Duration> {
        (self.max_run_seconds > 0).then(|| Duration::from_secs(self.max_run_seconds))
    }

    pub fn min_run(&self) -> Duration {
        Duration::from_secs(self.min_run_seconds)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: Option<String>,
    /// Actions to work on; every registered action when empty
    pub actions: Vec<String>,
    /// Actions never to work on
    pub filters: Vec<String>,
    pub max_retries: u32,
    pub invalid_payload: InvalidPayloadPolicy,
    /// Time-to-run for jobs added without one
    pub default_ttr_secs: u64,
    pub limits: ResourceLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: None,
            actions: Vec::new(),
            filters: vec!["default".to_string()],
            max_retries: 1,
            invalid_payload: InvalidPayloadPolicy::default(),
            default_ttr_secs: 1200,
            limits: ResourceLimits::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.limits.batch_size == 0 {
            return Err(WorkerError::Config("batch_size must be greater than 0".to_string()));
        }

        if self.default_ttr_secs == 0 || self.default_ttr_secs > MAX_DELAY_SECS {
            return Err(WorkerError::Config(format!(
                "default_ttr_secs must be between 1 and {}",
                MAX_DELAY_SECS
            )));
        }

        Ok(())
    }

    pub fn default_ttr(&self) -> Duration {
        Duration::from_secs(self.default_ttr_secs)
    }

    /// A queue over `transport` that adds jobs with the configured
    /// time-to-run when none is given
    pub fn queue(&self, transport: Arc<dyn Transport>, registry: Arc<ExecutorRegistry>) -> Queue {
        Queue::new(transport, registry).with_default_ttr(self.default_ttr())
    }

    /// The configured `worker_id`, or `host.pid:scope:suffix` where scope
    /// names the watched actions
    pub fn identity(&self, actions: &[String]) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let host = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        let scope = match actions {
            [] => "none".to_string(),
            [action] => action.clone(),
            [first, rest @ ..] => format!("{}+{}", first, rest.len()),
        };

        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}.{}:{}:{}", host, std::process::id(), scope, &suffix[..6])
    }
}
