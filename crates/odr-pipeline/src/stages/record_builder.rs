//! Builder for data pipelines: one rendered line per template per record

use super::PipelineContext;
use crate::envelope::{Envelope, Payload, Stage};
use crate::error::{PipelineError, Result};
use crate::format::{LineRenderer, RenderContext};
use crate::worker::{Outcome, StageHandler};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RecordBuilder {
    ctx: Arc<PipelineContext>,
    renderer: LineRenderer,
}

impl RecordBuilder {
    pub fn new(ctx: Arc<PipelineContext>) -> Result<Self> {
        Ok(Self {
            ctx,
            renderer: LineRenderer::new()?,
        })
    }
}

#[async_trait]
impl StageHandler for RecordBuilder {
    fn stage(&self) -> Stage {
        Stage::Builder
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Outcome> {
        let Payload::Build(input) = &envelope.payload else {
            return Err(PipelineError::validation("builder received a non-builder payload"));
        };
        let credentials = &input.credentials;
        let extension = &input.correlation.file_extension;

        let record = self.ctx.api.get_record(credentials, &input.record.unique_id).await?;
        let render = RenderContext {
            record: &record,
            unique_id: &input.record.unique_id,
            index: input.index,
        };

        // Render everything before touching the outputs so a bad template
        // leaves no partial record behind
        let mut lines = Vec::with_capacity(self.ctx.config.pipeline.line_templates.len());
        for template in &self.ctx.config.pipeline.line_templates {
            let output = self.ctx.layout.output(&template.output).ok_or_else(|| {
                PipelineError::config(format!("line template refers to unknown output '{}'", template.output))
            })?;
            lines.push((output, self.renderer.render(template, &render)?));
        }

        for (output, line) in &lines {
            self.ctx.layout.append(output, extension, line).await?;
            debug!(output = %output.name, bytes = line.len(), "Appended line");
        }

        let key = self.ctx.progress_key();
        self.ctx
            .api
            .report_worker_progress(credentials, input.correlation.tracked_job_id, &key)
            .await?;

        info!(
            record = %input.record.unique_id,
            index = input.index,
            lines = lines.len(),
            tracked_job_id = input.correlation.tracked_job_id,
            "Record built"
        );
        Ok(Outcome::Done)
    }
}
