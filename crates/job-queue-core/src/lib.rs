mod delay;
mod error;
mod job;
mod payload;
mod priority;
mod schema;

pub use delay::{check_bound, parse_relative, Delay, MAX_DELAY_SECS};
pub use error::{QueueError, Result, TransportError, ValidationError};
pub use job::{Action, Job, JobId, JobState, JobStats, PeekState, TubeStats};
pub use payload::{
    decode as decode_payload, encode as encode_payload, take_retry_delay, Payload,
    DEFAULT_RETRY_DELAY, RETRY_DELAY_FIELD,
};
pub use priority::Priority;
pub use schema::{PayloadSchema, ValueKind};

/// Default time-to-run for a job, in seconds
pub const DEFAULT_TTR_SECS: u64 = 60;
