use crate::{Priority, QueueError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Transport-assigned job identifier
pub type JobId = u64;

/// Action name, doubling as the tube the job lives in (e.g. "mail.send")
pub type Action = String;

/// A reserved (or peeked) job, as reported by the transport.
///
/// The transport owns the job; holding a `Job` only means holding its
/// handle until it is deleted, buried or released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Tube the job was put in
    pub tube: Action,

    /// Raw payload bytes
    pub data: Vec<u8>,

    pub priority: Priority,

    /// Number of times the job was released back onto the queue,
    /// i.e. prior failed delivery attempts
    pub releases: u32,

    /// Time-to-run of the reservation
    pub ttr: Duration,
}

impl Job {
    /// The payload bytes as text, for logging
    pub fn data_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// State of a job inside the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Delayed => "delayed",
            JobState::Reserved => "reserved",
            JobState::Buried => "buried",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The states a job can be peeked in. Reserved jobs cannot be peeked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeekState {
    Ready,
    Delayed,
    Buried,
}

impl PeekState {
    pub const ALL: [PeekState; 3] = [PeekState::Ready, PeekState::Delayed, PeekState::Buried];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeekState::Ready => "ready",
            PeekState::Delayed => "delayed",
            PeekState::Buried => "buried",
        }
    }
}

impl From<PeekState> for JobState {
    fn from(state: PeekState) -> Self {
        match state {
            PeekState::Ready => JobState::Ready,
            PeekState::Delayed => JobState::Delayed,
            PeekState::Buried => JobState::Buried,
        }
    }
}

impl FromStr for PeekState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(PeekState::Ready),
            "delayed" => Ok(PeekState::Delayed),
            "buried" => Ok(PeekState::Buried),
            other => Err(QueueError::InvalidArgument(format!(
                "state must be one of [\"ready\",\"delayed\",\"buried\"], got \"{}\"",
                other
            ))),
        }
    }
}

impl fmt::Display for PeekState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobStats {
    pub id: JobId,
    pub tube: Action,
    pub state: JobState,
    #[serde(rename = "pri")]
    pub priority: Priority,
    /// Seconds since the job was created
    pub age: u64,
    /// Seconds of delay the job was put or released with
    pub delay: u64,
    pub ttr: u64,
    /// Seconds until a reserved job's lease expires, or a delayed job becomes ready
    pub time_left: u64,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
    pub kicks: u32,
}

/// Per-tube statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TubeStats {
    pub name: Action,
    /// Number of connections watching the tube
    pub current_watching: u32,
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    pub total_jobs: u64,
}
