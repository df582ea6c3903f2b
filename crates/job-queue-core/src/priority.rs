use crate::QueueError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Job priority as understood by the transport.
/// Lower numerical values are more urgent: 0 is the most urgent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u32);

impl Priority {
    pub const MOST_URGENT: Priority = Priority(0);
    pub const LEAST_URGENT: Priority = Priority(u32::MAX);

    /// Default priority for new jobs
    pub const DEFAULT: Priority = Priority(1024);

    /// Jobs below this value count as "urgent" in tube statistics
    pub const URGENT_THRESHOLD: u32 = 1024;

    pub fn new(value: u32) -> Self {
        Priority(value)
    }

    /// Get the raw priority value
    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_urgent(&self) -> bool {
        self.0 < Self::URGENT_THRESHOLD
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Priority(value)
    }
}

impl From<Priority> for u32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl TryFrom<i64> for Priority {
    type Error = QueueError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(QueueError::InvalidArgument(format!(
                "The priority for a job cannot be negative (was {})",
                value
            )));
        }

        u32::try_from(value).map(Priority).map_err(|_| {
            QueueError::InvalidArgument(format!(
                "The priority for a job cannot exceed {} (was {})",
                u32::MAX,
                value
            ))
        })
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
