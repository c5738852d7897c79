//! Run completion: wait for every builder, then finalize the outputs
//!
//! In `requeue` mode each poll is one queue job that puts a copy of itself
//! back with a bumped counter until the run is done. In `inline` mode
//! [`Finisher::poll_until_complete`] keeps polling inside the worker until
//! the run finishes, the deadline passes or the worker shuts down.

use super::PipelineContext;
use crate::archive::{archive_directory, ArchiveResult};
use crate::config::{FinisherMode, PipelineKind};
use crate::envelope::{Envelope, FinisherInput, Payload, Stage};
use crate::error::{PipelineError, Result};
use crate::output::RunLock;
use crate::queue::FINISHER_PRIORITY;
use crate::tracked_job::{FinisherDecision, TrackedJob};
use crate::worker::{Outcome, StageHandler};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of one or more polls of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinisherStep {
    Finalized,
    /// Another finisher already completed the run
    AlreadyCompleted,
    /// Poll again after `delay` with `counter`
    Pending { counter: u32, delay: Duration },
    /// Poll budget or deadline spent
    Exhausted,
    /// The tracked job no longer exists
    Vanished,
    /// Shutdown while waiting; resume from `counter`
    Interrupted { counter: u32 },
}

pub struct Finisher {
    ctx: Arc<PipelineContext>,
    shutdown: CancellationToken,
}

impl Finisher {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop inline polling when `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Poll the tracked job once and act on what it says
    pub async fn step(&self, input: &FinisherInput, counter: u32) -> Result<FinisherStep> {
        let tracked_job_id = input.correlation.tracked_job_id;
        let job = match self.ctx.api.get_job_status(&input.credentials, tracked_job_id).await {
            Ok(job) => job,
            Err(PipelineError::JobNotFound(_)) => {
                warn!(tracked_job_id, "Tracked job vanished, dropping run");
                self.abandon(input).await;
                return Ok(FinisherStep::Vanished);
            },
            Err(e) => return Err(e),
        };

        if job.completed {
            info!(tracked_job_id, "Run already completed");
            return Ok(FinisherStep::AlreadyCompleted);
        }

        match self.ctx.poll_policy().decide(&job, counter) {
            FinisherDecision::Finalize => {
                self.finalize(input, job).await?;
                Ok(FinisherStep::Finalized)
            },
            FinisherDecision::Requeue { counter, delay } => {
                info!(
                    tracked_job_id,
                    current = job.current,
                    total = job.total,
                    counter,
                    "Run not finished yet"
                );
                Ok(FinisherStep::Pending { counter, delay })
            },
            FinisherDecision::Exhausted => {
                error!(tracked_job_id, counter, current = job.current, total = job.total, "Gave up waiting for run");
                self.abandon(input).await;
                Ok(FinisherStep::Exhausted)
            },
        }
    }

    /// Keep polling in-process until the run reaches a terminal step
    pub async fn poll_until_complete(&self, input: &FinisherInput) -> Result<FinisherStep> {
        let deadline = Instant::now() + Duration::from_secs(self.ctx.config.finisher.deadline_secs);
        let mut counter = input.counter;

        loop {
            let (next, delay) = match self.step(input, counter).await? {
                FinisherStep::Pending { counter, delay } => (counter, delay),
                terminal => return Ok(terminal),
            };

            if Instant::now() + delay > deadline {
                error!(
                    tracked_job_id = input.correlation.tracked_job_id,
                    counter, "Finisher deadline passed"
                );
                self.abandon(input).await;
                return Ok(FinisherStep::Exhausted);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(FinisherStep::Interrupted { counter }),
                _ = tokio::time::sleep(delay) => {},
            }
            counter = next;
        }
    }

    async fn finalize(&self, input: &FinisherInput, mut job: TrackedJob) -> Result<()> {
        match self.ctx.config.pipeline.kind {
            PipelineKind::Files => {
                let written = self.archive_categories().await?;
                info!(archives = written, "Archived category directories");
            },
            PipelineKind::Data => {
                self.ctx
                    .layout
                    .promote_outputs(&input.correlation.file_extension, input.incremental)
                    .await?;
            },
        }

        job.completed = true;
        self.ctx.api.create_or_update_job(&input.credentials, &job).await?;
        self.release_lock().await;
        info!(tracked_job_id = job.id, total = job.total, "Run completed");
        Ok(())
    }

    /// Zip every category directory. Returns the number of archives written.
    async fn archive_categories(&self) -> Result<usize> {
        let mut written = 0;
        for category in self.ctx.layout.categories() {
            let dir = self.ctx.layout.category_dir(category);
            let archive = self.ctx.layout.archive_path(category);
            let result = tokio::task::spawn_blocking(move || archive_directory(&dir, &archive))
                .await
                .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;

            match result {
                Ok(ArchiveResult::Written { .. }) => written += 1,
                Ok(ArchiveResult::Skipped) => {},
                Err(e) => warn!(category = %category.directory, error = %e, "Cannot archive category"),
            }
        }
        Ok(written)
    }

    /// Clean up after a run that will never complete
    async fn abandon(&self, input: &FinisherInput) {
        if self.ctx.config.pipeline.kind == PipelineKind::Data {
            let removed = self
                .ctx
                .layout
                .remove_temp_outputs(&input.correlation.file_extension)
                .await;
            info!(removed, "Removed temporary outputs");
        }
        self.release_lock().await;
    }

    async fn release_lock(&self) {
        if self.ctx.config.pipeline.single_flight {
            RunLock::release_in(self.ctx.layout.root()).await;
        }
    }
}

fn requeue(input: &FinisherInput, counter: u32, delay: Duration) -> Outcome {
    let next = FinisherInput {
        counter,
        ..input.clone()
    };
    Outcome::Requeue {
        envelope: Envelope::new(Payload::Finish(next)),
        delay,
        priority: FINISHER_PRIORITY,
    }
}

#[async_trait]
impl StageHandler for Finisher {
    fn stage(&self) -> Stage {
        Stage::Finisher
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Outcome> {
        let Payload::Finish(input) = &envelope.payload else {
            return Err(PipelineError::validation("finisher received a non-finisher payload"));
        };

        let step = match self.ctx.config.finisher.mode {
            FinisherMode::Requeue => self.step(input, input.counter).await?,
            FinisherMode::Inline => self.poll_until_complete(input).await?,
        };

        Ok(match step {
            FinisherStep::Pending { counter, delay } => requeue(input, counter, delay),
            FinisherStep::Interrupted { counter } => requeue(input, counter, Duration::ZERO),
            _ => Outcome::Done,
        })
    }
}
