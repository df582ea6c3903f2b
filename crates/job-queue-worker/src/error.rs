use crate::executor::ExecutorError;
use job_queue_core::{QueueError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A control-flow signal raised by an executor that was run outside the queue
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for WorkerError {
    fn from(err: TransportError) -> Self {
        WorkerError::Queue(QueueError::Transport(err))
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
