//! In-process transport with beanstalk semantics.
//!
//! A `MemoryTransport` is one connection to a shared in-memory server.
//! [`MemoryTransport::connect`] opens another connection to the same server,
//! with its own watch list and its own reservations, which is how several
//! workers contend for the same tubes.

use crate::transport::{Result, Transport};
use async_trait::async_trait;
use job_queue_core::{Job, JobId, JobState, JobStats, Priority, TransportError, TubeStats};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_TUBE: &str = "default";

/// Delays, time-to-run and timeouts are stored in 32 bits, as in beanstalk
const MAX_SECONDS: u64 = u32::MAX as u64;

/// The instant `after` from `now`, refusing durations the server cannot hold
fn later(now: Instant, after: Duration, what: &str) -> Result<Instant> {
    if after.as_secs() > MAX_SECONDS {
        return Err(TransportError::BadFormat(format!(
            "{} of {}s exceeds {}s",
            what,
            after.as_secs(),
            MAX_SECONDS
        )));
    }

    now.checked_add(after)
        .ok_or_else(|| TransportError::BadFormat(format!("{} of {}s is out of range", what, after.as_secs())))
}

/// When a job put or released with `delay` becomes ready; `None` for now
fn ready_at(now: Instant, delay: Duration) -> Result<Option<Instant>> {
    if delay.is_zero() {
        Ok(None)
    } else {
        later(now, delay, "delay").map(Some)
    }
}

type ConnectionId = u64;

struct StoredJob {
    id: JobId,
    tube: String,
    data: Vec<u8>,
    priority: Priority,
    state: JobState,
    created_at: Instant,
    delay: Duration,
    ttr: Duration,
    ready_at: Option<Instant>,
    deadline: Option<Instant>,
    reserved_by: Option<ConnectionId>,
    reserves: u32,
    timeouts: u32,
    releases: u32,
    buries: u32,
    kicks: u32,
}

impl StoredJob {
    fn to_job(&self) -> Job {
        Job {
            id: self.id,
            tube: self.tube.clone(),
            data: self.data.clone(),
            priority: self.priority,
            releases: self.releases,
            ttr: self.ttr,
        }
    }
}

#[derive(Default)]
struct Tube {
    ready: BTreeSet<(Priority, JobId)>,
    delayed: BTreeSet<(Instant, JobId)>,
    buried: VecDeque<JobId>,
    reserved: u64,
    watchers: u32,
    total_jobs: u64,
}

impl Tube {
    fn is_idle(&self) -> bool {
        self.ready.is_empty()
            && self.delayed.is_empty()
            && self.buried.is_empty()
            && self.reserved == 0
            && self.watchers == 0
    }
}

#[derive(Default)]
struct State {
    last_id: JobId,
    last_connection: ConnectionId,
    jobs: HashMap<JobId, StoredJob>,
    tubes: HashMap<String, Tube>,
}

impl State {
    /// Promote due delayed jobs and expire overdue reservations
    fn tick(&mut self, now: Instant) {
        for tube in self.tubes.values_mut() {
            while let Some(&(ready_at, id)) = tube.delayed.first() {
                if ready_at > now {
                    break;
                }
                tube.delayed.remove(&(ready_at, id));
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Ready;
                    job.ready_at = None;
                    tube.ready.insert((job.priority, id));
                }
            }
        }

        for job in self.jobs.values_mut() {
            let expired = matches!(job.deadline, Some(deadline) if deadline <= now);
            if job.state != JobState::Reserved || !expired {
                continue;
            }
            job.state = JobState::Ready;
            job.deadline = None;
            job.reserved_by = None;
            job.timeouts += 1;
            if let Some(tube) = self.tubes.get_mut(&job.tube) {
                tube.reserved = tube.reserved.saturating_sub(1);
                tube.ready.insert((job.priority, job.id));
            }
            debug!("[{}] Reservation expired, job is ready again", job.id);
        }
    }

    /// Earliest moment the ready set may change on its own
    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self
            .tubes
            .values()
            .filter_map(|tube| tube.delayed.first().map(|&(at, _)| at));
        let leases = self.jobs.values().filter_map(|job| job.deadline);

        delayed.chain(leases).min()
    }

    fn reserve_next(&mut self, watched: &[String], connection: ConnectionId, now: Instant) -> Option<Job> {
        let (priority, id) = watched
            .iter()
            .filter_map(|name| self.tubes.get(name).and_then(|tube| tube.ready.first().copied()))
            .min()?;

        let job = self.jobs.get_mut(&id)?;
        let tube = self.tubes.get_mut(&job.tube)?;
        tube.ready.remove(&(priority, id));
        tube.reserved += 1;

        job.state = JobState::Reserved;
        job.reserved_by = Some(connection);
        job.deadline = now.checked_add(job.ttr);
        job.reserves += 1;

        Some(job.to_job())
    }

    /// Take a job reserved by `connection` out of its reservation
    fn take_reserved(&mut self, id: JobId, connection: ConnectionId) -> Result<&mut StoredJob> {
        let job = self
            .jobs
            .get_mut(&id)
            .filter(|job| job.state == JobState::Reserved && job.reserved_by == Some(connection))
            .ok_or_else(|| TransportError::NotFound(format!("job {} is not reserved by this connection", id)))?;

        if let Some(tube) = self.tubes.get_mut(&job.tube) {
            tube.reserved = tube.reserved.saturating_sub(1);
        }
        job.deadline = None;
        job.reserved_by = None;

        Ok(job)
    }

    /// Place a job in the ready set of its tube, or in the delayed set when
    /// it has a `ready_at`
    fn enqueue(&mut self, id: JobId, ready_at: Option<Instant>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        let tube = self.tubes.entry(job.tube.clone()).or_default();

        match ready_at {
            None => {
                job.state = JobState::Ready;
                job.ready_at = None;
                tube.ready.insert((job.priority, id));
            }
            Some(ready_at) => {
                job.state = JobState::Delayed;
                job.ready_at = Some(ready_at);
                tube.delayed.insert((ready_at, id));
            }
        }
    }

    fn tube(&self, name: &str) -> Result<&Tube> {
        self.tubes
            .get(name)
            .ok_or_else(|| TransportError::NotFound(format!("tube \"{}\"", name)))
    }

    fn peek(&self, id: Option<JobId>, name: &str, state: &str) -> Result<Job> {
        id.and_then(|id| self.jobs.get(&id))
            .map(StoredJob::to_job)
            .ok_or_else(|| TransportError::NotFound(format!("no {} job in tube \"{}\"", state, name)))
    }

    fn prune(&mut self, name: &str) {
        if name != DEFAULT_TUBE && self.tubes.get(name).is_some_and(Tube::is_idle) {
            self.tubes.remove(name);
        }
    }
}

struct Server {
    state: Mutex<State>,
    notify: Notify,
}

/// One connection to an in-memory queue server.
pub struct MemoryTransport {
    server: Arc<Server>,
    connection: ConnectionId,
    watched: Mutex<Vec<String>>,
}

impl MemoryTransport {
    /// Start a new server and open the first connection to it
    pub fn new() -> Self {
        let server = Arc::new(Server {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        });

        Self::attach(server)
    }

    /// Open another connection to the same server
    pub fn connect(&self) -> Self {
        Self::attach(Arc::clone(&self.server))
    }

    fn attach(server: Arc<Server>) -> Self {
        let connection = {
            let mut state = server.state.lock();
            state.last_connection += 1;
            state.tubes.entry(DEFAULT_TUBE.to_string()).or_default().watchers += 1;
            state.last_connection
        };

        MemoryTransport {
            server,
            connection,
            watched: Mutex::new(vec![DEFAULT_TUBE.to_string()]),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        let mut state = self.server.state.lock();
        state.tick(Instant::now());
        state
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let watched = std::mem::take(&mut *self.watched.lock());
        let mut state = self.server.state.lock();

        // a closed connection hands its reservations back
        let reserved: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.reserved_by == Some(self.connection))
            .map(|job| job.id)
            .collect();
        for id in reserved {
            if state.take_reserved(id, self.connection).is_ok() {
                state.enqueue(id, None);
            }
        }

        for name in watched {
            if let Some(tube) = state.tubes.get_mut(&name) {
                tube.watchers = tube.watchers.saturating_sub(1);
            }
            state.prune(&name);
        }

        drop(state);
        self.server.notify.notify_waiters();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn put_in_tube(
        &self,
        tube: &str,
        data: Vec<u8>,
        priority: Priority,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId> {
        let id = {
            let mut state = self.state();
            let now = Instant::now();
            let ready_at = ready_at(now, delay)?;
            later(now, ttr, "time-to-run")?;
            state.last_id += 1;
            let id = state.last_id;

            state.jobs.insert(
                id,
                StoredJob {
                    id,
                    tube: tube.to_string(),
                    data,
                    priority,
                    state: JobState::Ready,
                    created_at: now,
                    delay,
                    ttr: ttr.max(Duration::from_secs(1)),
                    ready_at: None,
                    deadline: None,
                    reserved_by: None,
                    reserves: 0,
                    timeouts: 0,
                    releases: 0,
                    buries: 0,
                    kicks: 0,
                },
            );
            state.tubes.entry(tube.to_string()).or_default().total_jobs += 1;
            state.enqueue(id, ready_at);
            id
        };

        self.server.notify.notify_waiters();
        Ok(id)
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = later(Instant::now(), timeout, "reserve timeout")?;

        loop {
            // registered before checking, so a put in between still wakes us
            let notified = self.server.notify.notified();
            let watched = self.watched.lock().clone();

            let wakeup = {
                let mut state = self.state();
                if let Some(job) = state.reserve_next(&watched, self.connection, Instant::now()) {
                    return Ok(Some(job));
                }
                state.next_wakeup()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = wakeup.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn release(&self, id: JobId, priority: Priority, delay: Duration) -> Result<()> {
        {
            let ready_at = ready_at(Instant::now(), delay)?;
            let mut state = self.state();
            let job = state.take_reserved(id, self.connection)?;
            job.priority = priority;
            job.delay = delay;
            job.releases += 1;
            state.enqueue(id, ready_at);
        }

        self.server.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        let mut state = self.state();

        let job = state
            .jobs
            .get(&id)
            .filter(|job| job.state != JobState::Reserved || job.reserved_by == Some(self.connection))
            .ok_or_else(|| TransportError::NotFound(format!("job {}", id)))?;
        let (name, job_state, priority, ready_at) = (job.tube.clone(), job.state, job.priority, job.ready_at);

        if let Some(tube) = state.tubes.get_mut(&name) {
            match job_state {
                JobState::Ready => {
                    tube.ready.remove(&(priority, id));
                }
                JobState::Delayed => {
                    if let Some(ready_at) = ready_at {
                        tube.delayed.remove(&(ready_at, id));
                    }
                }
                JobState::Buried => tube.buried.retain(|buried| *buried != id),
                JobState::Reserved => tube.reserved = tube.reserved.saturating_sub(1),
            }
        }

        state.jobs.remove(&id);
        state.prune(&name);
        Ok(())
    }

    async fn bury(&self, id: JobId, priority: Priority) -> Result<()> {
        let mut state = self.state();
        let job = state.take_reserved(id, self.connection)?;
        job.state = JobState::Buried;
        job.priority = priority;
        job.buries += 1;
        let name = job.tube.clone();

        state.tubes.entry(name).or_default().buried.push_back(id);
        Ok(())
    }

    async fn kick(&self, tube: &str, max: u32) -> Result<u32> {
        let kicked = {
            let mut state = self.state();
            let Some(entry) = state.tubes.get_mut(tube) else {
                return Ok(0);
            };

            let ids: Vec<JobId> = if entry.buried.is_empty() {
                let ids: Vec<(Instant, JobId)> = entry.delayed.iter().take(max as usize).copied().collect();
                for key in &ids {
                    entry.delayed.remove(key);
                }
                ids.into_iter().map(|(_, id)| id).collect()
            } else {
                let count = entry.buried.len().min(max as usize);
                entry.buried.drain(..count).collect()
            };

            for id in &ids {
                if let Some(job) = state.jobs.get_mut(id) {
                    job.kicks += 1;
                }
                state.enqueue(*id, None);
            }
            ids.len() as u32
        };

        if kicked > 0 {
            self.server.notify.notify_waiters();
        }
        Ok(kicked)
    }

    async fn peek_ready(&self, tube: &str) -> Result<Job> {
        let state = self.state();
        let id = state.tube(tube)?.ready.first().map(|&(_, id)| id);
        state.peek(id, tube, "ready")
    }

    async fn peek_delayed(&self, tube: &str) -> Result<Job> {
        let state = self.state();
        let id = state.tube(tube)?.delayed.first().map(|&(_, id)| id);
        state.peek(id, tube, "delayed")
    }

    async fn peek_buried(&self, tube: &str) -> Result<Job> {
        let state = self.state();
        let id = state.tube(tube)?.buried.front().copied();
        state.peek(id, tube, "buried")
    }

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats> {
        let state = self.state();
        let entry = state.tube(tube)?;

        let urgent = entry
            .ready
            .iter()
            .filter(|(priority, _)| priority.is_urgent())
            .count();

        Ok(TubeStats {
            name: tube.to_string(),
            current_watching: entry.watchers,
            current_jobs_urgent: urgent as u64,
            current_jobs_ready: entry.ready.len() as u64,
            current_jobs_reserved: entry.reserved,
            current_jobs_delayed: entry.delayed.len() as u64,
            current_jobs_buried: entry.buried.len() as u64,
            total_jobs: entry.total_jobs,
        })
    }

    async fn stats_job(&self, id: JobId) -> Result<JobStats> {
        let state = self.state();
        let job = state
            .jobs
            .get(&id)
            .ok_or_else(|| TransportError::NotFound(format!("job {}", id)))?;
        let now = Instant::now();

        let time_left = match job.state {
            JobState::Reserved => job.deadline,
            JobState::Delayed => job.ready_at,
            _ => None,
        }
        .map_or(0, |at| at.saturating_duration_since(now).as_secs());

        Ok(JobStats {
            id: job.id,
            tube: job.tube.clone(),
            state: job.state,
            priority: job.priority,
            age: now.saturating_duration_since(job.created_at).as_secs(),
            delay: job.delay.as_secs(),
            ttr: job.ttr.as_secs(),
            time_left,
            reserves: job.reserves,
            timeouts: job.timeouts,
            releases: job.releases,
            buries: job.buries,
            kicks: job.kicks,
        })
    }

    async fn watch(&self, tube: &str) -> Result<usize> {
        let mut watched = self.watched.lock();
        if !watched.iter().any(|name| name == tube) {
            watched.push(tube.to_string());
            self.state().tubes.entry(tube.to_string()).or_default().watchers += 1;
        }

        Ok(watched.len())
    }

    async fn ignore(&self, tube: &str) -> Result<usize> {
        let mut watched = self.watched.lock();
        let Some(position) = watched.iter().position(|name| name == tube) else {
            return Ok(watched.len());
        };

        if watched.len() == 1 {
            return Err(TransportError::NotIgnored(tube.to_string()));
        }

        watched.remove(position);
        let mut state = self.state();
        if let Some(entry) = state.tubes.get_mut(tube) {
            entry.watchers = entry.watchers.saturating_sub(1);
        }
        state.prune(tube);

        Ok(watched.len())
    }

    async fn list_tubes_watched(&self) -> Result<Vec<String>> {
        Ok(self.watched.lock().clone())
    }
}
