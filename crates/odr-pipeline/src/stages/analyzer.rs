//! Run start: tracked job, output preparation and fan-out

use super::PipelineContext;
use crate::api::endpoints::with_watermark;
use crate::config::PipelineKind;
use crate::envelope::{AnalyzerInput, BuilderInput, Correlation, Envelope, FinisherInput, Payload, Stage};
use crate::error::{PipelineError, Result};
use crate::output::RunLock;
use crate::queue::DEFAULT_PRIORITY;
use crate::tracked_job::TrackedJob;
use crate::worker::{Outcome, StageHandler};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct Analyzer {
    ctx: Arc<PipelineContext>,
}

impl Analyzer {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Wipe or patch the previous run's outputs
    async fn prepare_outputs(&self, input: &AnalyzerInput, watermark: Option<i64>, extension: &str) -> Result<()> {
        let layout = &self.ctx.layout;
        match self.ctx.config.pipeline.kind {
            PipelineKind::Files => match watermark {
                None => {
                    let removed = layout.clear_categories().await?;
                    info!(removed, "Full rebuild, cleared category directories");
                },
                Some(since) => {
                    let Some(url) = &input.modified_files_url else {
                        debug!("No modified files listing configured");
                        return Ok(());
                    };
                    let url = with_watermark(url, since);
                    let listing = self.ctx.api.fetch_listing(&input.credentials, &url).await?;
                    let removed = layout.delete_modified(&listing.files).await;
                    info!(modified = listing.files.len(), removed, "Removed modified files");
                },
            },
            PipelineKind::Data => layout.init_temp_outputs(extension, watermark.is_none()).await?,
        }
        Ok(())
    }

    async fn put(&self, tube: &str, envelope: &Envelope) -> Result<()> {
        self.ctx
            .queue
            .put(tube, &envelope.encode()?, DEFAULT_PRIORITY, Duration::ZERO)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StageHandler for Analyzer {
    fn stage(&self) -> Stage {
        Stage::Analyzer
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Outcome> {
        let Payload::Analyze(input) = &envelope.payload else {
            return Err(PipelineError::validation("analyzer received a non-analyzer payload"));
        };
        let pipeline = &self.ctx.config.pipeline;
        let tubes = &self.ctx.config.tubes;
        let credentials = &input.credentials;
        let extension = self.ctx.clock.now_millis().to_string();

        let lock = if pipeline.single_flight {
            Some(RunLock::acquire(self.ctx.layout.root(), &extension).await?)
        } else {
            None
        };

        let tracked = TrackedJob::new(&pipeline.job_type, &pipeline.target_entity, extension.as_str());
        let mut tracked = self.ctx.api.create_or_update_job(credentials, &tracked).await?;
        info!(tracked_job_id = tracked.id, file_extension = %extension, "Created tracked job");

        let watermark = if input.incremental {
            self.ctx.layout.watermark_millis().await?
        } else {
            None
        };
        let incremental = watermark.is_some();
        match watermark {
            Some(since) => info!(since, "Incremental run"),
            None if input.incremental => info!("Incremental run requested without a watermark, rebuilding"),
            None => info!("Full rebuild"),
        }

        self.prepare_outputs(input, watermark, &extension).await?;
        self.ctx.layout.touch_marker().await?;

        let url = match watermark {
            Some(since) => with_watermark(&input.full_url, since),
            None => input.full_url.clone(),
        };
        let listing = self.ctx.api.fetch_listing(credentials, &url).await?;

        let correlation = Correlation {
            tracked_job_id: tracked.id,
            file_extension: extension.clone(),
        };
        for (index, record) in listing.records.iter().enumerate() {
            let builder = Envelope::new(Payload::Build(BuilderInput {
                credentials: credentials.clone(),
                correlation: correlation.clone(),
                record: record.clone(),
                index,
                incremental,
                schema: input.schema.clone(),
            }));
            self.put(&tubes.builder, &builder).await?;
        }
        let fan_out = listing.records.len();
        info!(fan_out, tube = %tubes.builder, "Queued builder jobs");

        tracked.total = fan_out as i64;
        self.ctx.api.create_or_update_job(credentials, &tracked).await?;

        let finisher = Envelope::new(Payload::Finish(FinisherInput {
            credentials: credentials.clone(),
            correlation,
            incremental,
            counter: 0,
        }));
        self.put(&tubes.finisher, &finisher).await?;

        if let Some(lock) = lock {
            lock.persist();
        }
        Ok(Outcome::Done)
    }
}
