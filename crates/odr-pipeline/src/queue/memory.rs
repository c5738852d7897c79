//! In-process broker with beanstalkd semantics
//!
//! Used by tests and by single-host deployments that run every stage inside
//! one process. Time is measured with `tokio::time::Instant`, so paused-clock
//! tests can step through delays and TTR expiry deterministically.

use super::{Job, JobId, Queue, DEFAULT_TTR_SECS};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct StoredJob {
    id: JobId,
    tube: String,
    body: Vec<u8>,
    priority: u32,
    ready_at: Instant,
    reservation: Option<Reservation>,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    connection: u64,
    expires_at: Instant,
}

impl StoredJob {
    fn is_ready(&self, now: Instant) -> bool {
        match self.reservation {
            Some(r) => r.expires_at <= now,
            None => self.ready_at <= now,
        }
    }

    /// When this job next becomes reservable, if it is not already
    fn wakes_at(&self) -> Instant {
        match self.reservation {
            Some(r) => r.expires_at,
            None => self.ready_at,
        }
    }
}

/// Snapshot of a queued job, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: JobId,
    pub body: Vec<u8>,
    pub priority: u32,
    /// Remaining delay; zero when ready
    pub ready_in: Duration,
    pub reserved: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: JobId,
    jobs: HashMap<JobId, StoredJob>,
}

/// Shared job store. Hand out connections with [`MemoryBroker::connect`].
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    ttr: Duration,
    connections: AtomicU64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TTR_SECS))
    }
}

impl MemoryBroker {
    pub fn new(ttr: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            ttr,
            connections: AtomicU64::new(0),
        }
    }

    pub fn connect(self: &Arc<Self>) -> MemoryQueue {
        MemoryQueue {
            broker: Arc::clone(self),
            connection: self.connections.fetch_add(1, Ordering::Relaxed) + 1,
            watched: Mutex::new(Vec::new()),
            used: Mutex::new(String::from("default")),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs currently on `tube`, most urgent first
    pub fn snapshot(&self, tube: &str) -> Vec<QueuedJob> {
        let now = Instant::now();
        let state = self.lock();
        let mut jobs: Vec<QueuedJob> = state
            .jobs
            .values()
            .filter(|job| job.tube == tube)
            .map(|job| QueuedJob {
                id: job.id,
                body: job.body.clone(),
                priority: job.priority,
                ready_in: job.ready_at.saturating_duration_since(now),
                reserved: job.reservation.is_some_and(|r| r.expires_at > now),
            })
            .collect();
        jobs.sort_by_key(|job| (job.priority, job.id));
        jobs
    }

    /// Total jobs on `tube` in any state
    pub fn len(&self, tube: &str) -> usize {
        self.lock().jobs.values().filter(|job| job.tube == tube).count()
    }

    pub fn is_empty(&self, tube: &str) -> bool {
        self.len(tube) == 0
    }
}

/// One client connection to a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryQueue {
    broker: Arc<MemoryBroker>,
    connection: u64,
    watched: Mutex<Vec<String>>,
    used: Mutex<String>,
}

impl MemoryQueue {
    fn watched(&self) -> Vec<String> {
        self.watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn used_tube(&self) -> String {
        self.used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reserve the most urgent ready job, or report when the next one wakes
    fn try_reserve(&self, watched: &[String]) -> std::result::Result<Job, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.broker.lock();

        let candidate = state
            .jobs
            .values()
            .filter(|job| watched.contains(&job.tube) && job.is_ready(now))
            .min_by_key(|job| (job.priority, job.id))
            .map(|job| job.id);

        if let Some(job) = candidate.and_then(|id| state.jobs.get_mut(&id)) {
            job.reservation = Some(Reservation {
                connection: self.connection,
                expires_at: now + self.broker.ttr,
            });
            return Ok(Job {
                id: job.id,
                body: job.body.clone(),
            });
        }

        Err(state
            .jobs
            .values()
            .filter(|job| watched.contains(&job.tube))
            .map(StoredJob::wakes_at)
            .min())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn watch(&self, tube: &str) -> Result<()> {
        let mut watched = self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !watched.iter().any(|t| t == tube) {
            watched.push(tube.to_string());
        }
        Ok(())
    }

    async fn use_tube(&self, tube: &str) -> Result<()> {
        *self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = tube.to_string();
        Ok(())
    }

    async fn put(&self, tube: &str, body: &[u8], priority: u32, delay: Duration) -> Result<JobId> {
        let id = {
            let mut state = self.broker.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.jobs.insert(
                id,
                StoredJob {
                    id,
                    tube: tube.to_string(),
                    body: body.to_vec(),
                    priority,
                    ready_at: Instant::now() + delay,
                    reservation: None,
                },
            );
            id
        };

        trace!(job_id = id, tube = %tube, priority, delay_secs = delay.as_secs(), "Job put");
        self.broker.notify.notify_waiters();
        Ok(id)
    }

    async fn reserve(&self, timeout: Option<Duration>) -> Result<Option<Job>> {
        let watched = self.watched();
        if watched.is_empty() {
            return Err(PipelineError::queue("reserve called before watching a tube"));
        }

        let give_up_at = timeout.map(|t| Instant::now() + t);

        loop {
            // Register for wakeups before inspecting state so a put in between is not lost
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);

            let next_wake = match self.try_reserve(&watched) {
                Ok(job) => return Ok(Some(job)),
                Err(next_wake) => next_wake,
            };

            let wake_at = match (next_wake, give_up_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            if let Some(limit) = give_up_at {
                if Instant::now() >= limit {
                    return Ok(None);
                }
            }

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(at) => {},
                    }
                },
                None => notified.await,
            }
        }
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        let now = Instant::now();
        let mut state = self.broker.lock();

        let owned = match state.jobs.get(&id) {
            Some(job) => match job.reservation {
                Some(r) => r.connection == self.connection && r.expires_at > now,
                // Unreserved jobs may be deleted by anyone
                None => true,
            },
            None => false,
        };

        if !owned {
            return Err(PipelineError::queue(format!("job {} not found", id)));
        }

        state.jobs.remove(&id);
        Ok(())
    }

    async fn ready_count(&self, tube: &str) -> Result<u64> {
        let now = Instant::now();
        let state = self.broker.lock();
        Ok(state
            .jobs
            .values()
            .filter(|job| job.tube == tube && job.is_ready(now))
            .count() as u64)
    }
}
