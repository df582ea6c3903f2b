pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod queue;
pub mod registry;
pub mod worker;

pub use config::{ResourceLimits, WorkerConfig};
pub use coordinator::{Coordinator, Execution, InvalidPayloadPolicy, Outcome, DEFAULT_RETRY_BACKOFF};
pub use error::{Result, WorkerError};
pub use events::{EventDispatcher, ExecutionEvent, JobBuriedEvent, WorkerListener};
pub use executor::{ExecutionResult, Executor, ExecutorError, ObjectPayload, Reschedule};
pub use queue::{EnqueueOptions, Queue};
pub use registry::ExecutorRegistry;
pub use worker::{MemoryProbe, ProcessMemory, RunSummary, StopReason, Worker};
