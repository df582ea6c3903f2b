use thiserror::Error;

/// Errors raised by a queue transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The tube or job does not exist (anymore).
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Ignoring the tube would leave the connection watching nothing.
    #[error("NOT_IGNORED: cannot ignore the last watched tube \"{0}\"")]
    NotIgnored(String),

    /// A delay, time-to-run or timeout the server cannot represent.
    #[error("BAD_FORMAT: {0}")]
    BadFormat(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server error: {0}")]
    Server(String),
}

/// Payload schema violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("The field \"{0}\" does not exist")]
    UndefinedField(String),

    #[error("The required field \"{0}\" is missing")]
    MissingField(String),

    #[error("The field \"{field}\" is expected to be of type {expected}, got {actual}")]
    InvalidKind {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("The field \"{field}\" has a value that is not allowed: {value}")]
    ValueNotAllowed { field: String, value: String },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("There is no executor registered for action \"{0}\"")]
    UnknownAction(String),

    #[error("There is already an executor registered for action \"{0}\"")]
    DuplicateAction(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("The executor for action \"{action}\" cannot be used for objects: {reason}")]
    UnsupportedObject { action: String, reason: String },

    #[error("Invalid payload: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the transport reported a missing tube or job.
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::Transport(TransportError::NotFound(_)))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
