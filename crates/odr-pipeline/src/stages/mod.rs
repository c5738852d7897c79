//! Pipeline stages
//!
//! One [`StageHandler`] per tube: the [`Analyzer`] starts a run and fans out
//! one builder job per record, a builder ([`FileBuilder`] or
//! [`RecordBuilder`], depending on the pipeline kind) produces that record's
//! artifacts, and the [`Finisher`] waits for the run to complete before
//! finalizing the outputs.

pub mod analyzer;
pub mod file_builder;
pub mod finisher;
pub mod record_builder;

pub use analyzer::Analyzer;
pub use file_builder::FileBuilder;
pub use finisher::{Finisher, FinisherStep};
pub use record_builder::RecordBuilder;

use crate::api::ProducerApi;
use crate::clock::Clock;
use crate::config::{PipelineKind, WorkerConfig};
use crate::envelope::Stage;
use crate::error::Result;
use crate::output::OutputLayout;
use crate::queue::Queue;
use crate::tracked_job::PollPolicy;
use crate::worker::StageHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a stage needs to talk to the outside world
pub struct PipelineContext {
    pub api: Arc<dyn ProducerApi>,
    pub queue: Arc<dyn Queue>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<WorkerConfig>,
    pub layout: OutputLayout,
}

impl PipelineContext {
    pub fn new(
        api: Arc<dyn ProducerApi>,
        queue: Arc<dyn Queue>,
        clock: Arc<dyn Clock>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        let layout = OutputLayout::new(&config.pipeline);
        Self {
            api,
            queue,
            clock,
            config,
            layout,
        }
    }

    /// Unique key for one worker progress report
    pub fn progress_key(&self) -> String {
        format!("{}_{}", self.config.pipeline.progress_key_prefix, uuid::Uuid::new_v4().simple())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let finisher = &self.config.finisher;
        PollPolicy {
            interval: Duration::from_secs(finisher.poll_interval_secs),
            backoff_factor: finisher.backoff_factor,
            max_interval: Duration::from_secs(finisher.max_interval_secs),
            max_polls: finisher.max_retries,
        }
    }
}

/// Handler for `stage`, picking the builder that matches the pipeline kind.
/// `shutdown` interrupts an inline Finisher between polls.
pub fn handler_for(
    stage: Stage,
    ctx: Arc<PipelineContext>,
    shutdown: CancellationToken,
) -> Result<Arc<dyn StageHandler>> {
    let handler: Arc<dyn StageHandler> = match stage {
        Stage::Analyzer => Arc::new(Analyzer::new(ctx)),
        Stage::Builder => match ctx.config.pipeline.kind {
            PipelineKind::Files => Arc::new(FileBuilder::new(ctx)?),
            PipelineKind::Data => Arc::new(RecordBuilder::new(ctx)?),
        },
        Stage::Finisher => Arc::new(Finisher::new(ctx).with_shutdown(shutdown)),
    };
    Ok(handler)
}
