//! Queue consumer loop shared by every stage
//!
//! A [`Worker`] watches one tube, reserves jobs one at a time, decodes each
//! into an [`Envelope`] and hands it to its [`StageHandler`]. Whatever the
//! handler returns, the reserved job is deleted afterwards; follow-up work is
//! always a new job. Errors are logged and counted but never end the loop.

use crate::envelope::{Envelope, Stage};
use crate::error::{PipelineError, Result};
use crate::queue::{Job, Queue, DEFAULT_PRIORITY};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

// ============================================================================
// Worker Constants
// ============================================================================

/// Pause after a queue error before reserving again
pub const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Reserved,
    Processing,
    Deleting,
    Requeueing,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Reserved => "reserved",
            WorkerState::Processing => "processing",
            WorkerState::Deleting => "deleting",
            WorkerState::Requeueing => "requeueing",
        };
        f.write_str(name)
    }
}

/// What a handler wants done after a job succeeded
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    /// Put `envelope` back on the worker's tube
    Requeue {
        envelope: Envelope,
        delay: Duration,
        priority: u32,
    },
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn handle(&self, envelope: &Envelope) -> Result<Outcome>;
}

/// How failed jobs are retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per job, the first one included
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Where a job goes once it will not be retried; dropped when `None`
    pub dead_letter_tube: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay: Duration::from_secs(crate::config::DEFAULT_RETRY_DELAY_SECS),
            dead_letter_tube: None,
        }
    }
}

impl RetryPolicy {
    /// Whether a job that failed on try number `attempt + 1` gets another try
    pub fn should_retry(&self, attempt: u32, err: &PipelineError) -> bool {
        err.is_transient() && attempt.saturating_add(1) < self.max_attempts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Time spent inside handlers
    pub busy: Duration,
}

pub struct Worker {
    worker_id: Uuid,
    queue: Arc<dyn Queue>,
    tube: String,
    handler: Arc<dyn StageHandler>,
    retry: RetryPolicy,
    reserve_timeout: Duration,
}

impl Worker {
    pub fn new(queue: Arc<dyn Queue>, tube: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            queue,
            tube: tube.into(),
            handler,
            retry: RetryPolicy::default(),
            reserve_timeout: Duration::from_secs(crate::config::DEFAULT_RESERVE_TIMEOUT_SECS),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn tube(&self) -> &str {
        &self.tube
    }

    fn transition(&self, state: &mut WorkerState, next: WorkerState) {
        debug!(from = %state, to = %next, "Worker state");
        *state = next;
    }

    /// Start consuming the worker's tube
    pub async fn subscribe(&self) -> Result<()> {
        self.queue.watch(&self.tube).await
    }

    /// Consume jobs until `shutdown` fires. A job in progress is always
    /// finished first.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!(
            worker_id = %self.worker_id,
            stage = %self.handler.stage(),
            tube = %self.tube,
            "Worker starting"
        );

        while let Err(e) = self.subscribe().await {
            error!(tube = %self.tube, error = %e, "Cannot watch tube");
            if sleep_or_cancel(&shutdown, QUEUE_ERROR_BACKOFF).await {
                return stats;
            }
        }

        while !shutdown.is_cancelled() {
            match self.run_once(&mut stats).await {
                Ok(true) => {},
                Ok(false) => self.log_idle().await,
                Err(e) => {
                    warn!(tube = %self.tube, error = %e, "Reserve failed");
                    if sleep_or_cancel(&shutdown, QUEUE_ERROR_BACKOFF).await {
                        break;
                    }
                },
            }
        }

        info!(
            worker_id = %self.worker_id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            requeued = stats.requeued,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            busy_ms = stats.busy.as_millis() as u64,
            "Worker stopped"
        );
        stats
    }

    /// Reserve and process at most one job. `Ok(false)` means the reserve
    /// timed out with nothing to do.
    pub async fn run_once(&self, stats: &mut WorkerStats) -> Result<bool> {
        let Some(job) = self.queue.reserve(Some(self.reserve_timeout)).await? else {
            return Ok(false);
        };

        let span = info_span!("job", stage = %self.handler.stage(), tube = %self.tube, job_id = job.id);
        self.process(job, stats).instrument(span).await;
        Ok(true)
    }

    async fn process(&self, job: Job, stats: &mut WorkerStats) {
        let mut state = WorkerState::Idle;
        self.transition(&mut state, WorkerState::Reserved);
        stats.processed += 1;

        let envelope = match Envelope::decode(self.handler.stage(), &job.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable job");
                stats.failed += 1;
                self.transition(&mut state, WorkerState::Deleting);
                self.delete(job.id).await;
                return;
            },
        };

        self.transition(&mut state, WorkerState::Processing);
        let started = Instant::now();
        let result = self.handler.handle(&envelope).await;
        let elapsed = started.elapsed();
        stats.busy += elapsed;

        match result {
            Ok(Outcome::Done) => {
                stats.succeeded += 1;
                info!(elapsed_ms = elapsed.as_millis() as u64, attempt = envelope.attempt, "Job done");
            },
            Ok(Outcome::Requeue {
                envelope: next,
                delay,
                priority,
            }) => {
                self.transition(&mut state, WorkerState::Requeueing);
                stats.succeeded += 1;
                if let Err(e) = self.put(&next, priority, delay).await {
                    // Leave the original reserved; it is redelivered when its TTR runs out
                    error!(error = %e, "Cannot requeue job, leaving it to time out");
                    return;
                }
                stats.requeued += 1;
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    delay_secs = delay.as_secs(),
                    "Job requeued"
                );
            },
            Err(e) => {
                stats.failed += 1;
                if !self.handle_failure(&job, envelope, e, stats).await {
                    return;
                }
            },
        }

        self.transition(&mut state, WorkerState::Deleting);
        self.delete(job.id).await;
        self.transition(&mut state, WorkerState::Idle);
    }

    /// Retry, dead-letter or drop a failed job. Returns false when the
    /// follow-up put failed and the original must stay reserved.
    async fn handle_failure(&self, job: &Job, mut envelope: Envelope, err: PipelineError, stats: &mut WorkerStats) -> bool {
        if self.retry.should_retry(envelope.attempt, &err) {
            envelope.attempt += 1;
            warn!(error = %err, attempt = envelope.attempt, "Job failed, retrying");
            return match self.put(&envelope, DEFAULT_PRIORITY, self.retry.retry_delay).await {
                Ok(()) => {
                    stats.retried += 1;
                    true
                },
                Err(e) => {
                    error!(error = %e, "Cannot put retry, leaving job to time out");
                    false
                },
            };
        }

        match &self.retry.dead_letter_tube {
            Some(tube) => {
                error!(error = %err, dead_letter = %tube, "Job failed, dead-lettering");
                match self.queue.put(tube, &job.body, DEFAULT_PRIORITY, Duration::ZERO).await {
                    Ok(_) => {
                        stats.dead_lettered += 1;
                        true
                    },
                    Err(e) => {
                        error!(error = %e, "Cannot put job on dead-letter tube, leaving job to time out");
                        false
                    },
                }
            },
            None => {
                error!(error = %err, attempt = envelope.attempt, "Job failed, dropping");
                true
            },
        }
    }

    async fn put(&self, envelope: &Envelope, priority: u32, delay: Duration) -> Result<()> {
        let body = envelope.encode()?;
        let id = self.queue.put(&self.tube, &body, priority, delay).await?;
        debug!(new_job_id = id, "Put follow-up job");
        Ok(())
    }

    async fn delete(&self, id: u64) {
        if let Err(e) = self.queue.delete(id).await {
            warn!(job_id = id, error = %e, "Delete failed");
        }
    }

    async fn log_idle(&self) {
        match self.queue.ready_count(&self.tube).await {
            Ok(depth) => debug!(tube = %self.tube, depth, "Queue idle"),
            Err(e) => debug!(tube = %self.tube, error = %e, "Queue idle, depth unknown"),
        }
    }
}

/// Sleep for `duration`; `true` if shutdown fired first
async fn sleep_or_cancel(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
