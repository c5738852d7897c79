//! Builder for file pipelines
//!
//! Mirrors the files attached to one record into the category directories.
//! A file is downloaded only when the local copy is missing or older than the
//! upload. Older revisions of the same file (same name stub, different file
//! UUID) are removed once the record has been processed.

use super::PipelineContext;
use crate::api::endpoints::resolve_url;
use crate::config::{FileRule, Placement};
use crate::envelope::{Envelope, Payload, Stage};
use crate::error::{PipelineError, Result};
use crate::output::{is_up_to_date, remove_stale, stub_matches};
use crate::worker::{Outcome, StageHandler};
use async_trait::async_trait;
use futures::StreamExt;
use odr_common::record::{find_fields, FileRef, RecordNode};
use reqwest::Client;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Quality ratings as directory labels
fn quality_label(quality: Option<i32>) -> &'static str {
    match quality {
        Some(-1) => "ignore",
        Some(1) => "poor",
        Some(2) => "fair",
        Some(3) => "excellent",
        _ => "unrated",
    }
}

fn orientation(name: &str) -> &'static str {
    if name.contains("______Raman") || name.contains("unoriented") {
        "unoriented"
    } else {
        "oriented"
    }
}

/// Directory (relative to the output root) a file belongs in
pub fn placement_dir(placement: &Placement, file: &FileRef) -> String {
    match placement {
        Placement::Fixed { directory } => directory.clone(),
        Placement::BySuffix {
            suffix,
            matched,
            otherwise,
        } => {
            if file.original_name.ends_with(suffix.as_str()) {
                matched.clone()
            } else {
                otherwise.clone()
            }
        },
        Placement::ByQuality { base } => format!(
            "{}/{}_{}",
            base.trim_end_matches('/'),
            quality_label(file.quality),
            orientation(&file.original_name)
        ),
    }
}

/// Files of `record` a rule applies to, in tree order
pub fn select_files<'a>(rule: &'a FileRule, record: &'a RecordNode) -> Vec<&'a FileRef> {
    let mut selected = Vec::new();
    for field in find_fields(record, &rule.field) {
        let candidates = field.files.iter().filter(|file| {
            rule.min_quality.is_none_or(|min| file.quality.unwrap_or(0) >= min)
                && !(rule.originals_only && file.parent_image_id.is_some())
        });
        if rule.all_files {
            selected.extend(candidates);
        } else {
            selected.extend(candidates.take(1));
        }
    }
    selected
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != "." && name != ".."
}

/// Tally for one record
#[derive(Debug, Default)]
struct MirrorStats {
    downloaded: usize,
    current: usize,
    failed: usize,
    skipped: usize,
}

pub struct FileBuilder {
    ctx: Arc<PipelineContext>,
    http: Client,
}

impl FileBuilder {
    pub fn new(ctx: Arc<PipelineContext>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(ctx.config.api.timeout_secs))
            .build()
            .map_err(|e| PipelineError::config(format!("failed to build download client: {}", e)))?;
        Ok(Self { ctx, http })
    }

    /// Stream `url` into `target` through a `.part` file. Returns bytes written.
    async fn download(&self, url: &str, target: &Path) -> Result<u64> {
        let response = self.http.get(url).send().await.map_err(|e| PipelineError::api(url, e))?;
        if !response.status().is_success() {
            return Err(PipelineError::api(url, format!("HTTP {}", response.status())));
        }

        let mut part = target.as_os_str().to_os_string();
        part.push(".part");
        let part = PathBuf::from(part);

        let written = async {
            let mut file = tokio::fs::File::create(&part)
                .await
                .map_err(|e| PipelineError::file_io(&part, e))?;
            let mut written = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| PipelineError::api(url, e))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| PipelineError::file_io(&part, e))?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(|e| PipelineError::file_io(&part, e))?;
            Ok::<_, PipelineError>(written)
        }
        .await;

        match written {
            Ok(written) => {
                tokio::fs::rename(&part, target)
                    .await
                    .map_err(|e| PipelineError::file_io(target, e))?;
                Ok(written)
            },
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            },
        }
    }

    async fn mirror(
        &self,
        rule: &FileRule,
        file: &FileRef,
        stats: &mut MirrorStats,
        candidates: &mut Vec<PathBuf>,
        valid: &mut HashSet<PathBuf>,
    ) -> Result<()> {
        let Some(stub) = file.stub().filter(|s| !s.is_empty()) else {
            debug!(name = %file.original_name, "File name does not embed its UUID, skipping");
            stats.skipped += 1;
            return Ok(());
        };
        if !is_safe_name(&file.original_name) {
            warn!(name = %file.original_name, "Unsafe file name, skipping");
            stats.skipped += 1;
            return Ok(());
        }

        let dir = self.ctx.layout.resolve(&placement_dir(&rule.placement, file));
        let target = dir.join(&file.original_name);
        candidates.extend(stub_matches(&dir, stub).await);
        valid.insert(target.clone());

        if is_up_to_date(&target, file.created.as_deref()).await {
            stats.current += 1;
            return Ok(());
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipelineError::file_io(&dir, e))?;

        let url = resolve_url(&self.ctx.config.api.base_url, &file.href);
        match self.download(&url, &target).await {
            Ok(bytes) => {
                debug!(path = %target.display(), bytes, "Downloaded file");
                stats.downloaded += 1;
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Download failed");
                stats.failed += 1;
            },
        }
        Ok(())
    }
}

#[async_trait]
impl StageHandler for FileBuilder {
    fn stage(&self) -> Stage {
        Stage::Builder
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Outcome> {
        let Payload::Build(input) = &envelope.payload else {
            return Err(PipelineError::validation("builder received a non-builder payload"));
        };
        let credentials = &input.credentials;
        let record = self.ctx.api.get_record(credentials, &input.record.unique_id).await?;

        let mut stats = MirrorStats::default();
        let mut candidates = Vec::new();
        let mut valid = HashSet::new();
        for rule in &self.ctx.config.pipeline.file_rules {
            for file in select_files(rule, &record) {
                self.mirror(rule, file, &mut stats, &mut candidates, &mut valid).await?;
            }
        }

        candidates.sort();
        candidates.dedup();
        let removed = remove_stale(&candidates, &valid).await;

        let key = self.ctx.progress_key();
        self.ctx
            .api
            .report_worker_progress(credentials, input.correlation.tracked_job_id, &key)
            .await?;

        info!(
            record = %input.record.unique_id,
            downloaded = stats.downloaded,
            current = stats.current,
            failed = stats.failed,
            skipped = stats.skipped,
            removed,
            "Record files mirrored"
        );
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file(name: &str, quality: Option<i32>) -> FileRef {
        FileRef {
            file_uuid: "f1".into(),
            original_name: name.into(),
            href: "https://example.org/f1".into(),
            quality,
            ..FileRef::default()
        }
    }

    #[test]
    fn test_quality_placement() {
        let placement = Placement::ByQuality { base: "raman".into() };
        assert_eq!(
            placement_dir(&placement, &file("R050031-3__Raman_f1.txt", Some(3))),
            "raman/excellent_oriented"
        );
        assert_eq!(
            placement_dir(&placement, &file("R050031______Raman_f1.txt", Some(0))),
            "raman/unrated_unoriented"
        );
        assert_eq!(
            placement_dir(&placement, &file("R1_unoriented_f1.txt", Some(-1))),
            "raman/ignore_unoriented"
        );
        assert_eq!(placement_dir(&placement, &file("x_f1.txt", None)), "raman/unrated_oriented");
    }

    #[test]
    fn test_suffix_placement() {
        let placement = Placement::BySuffix {
            suffix: "pdf".into(),
            matched: "chemistry/reference_pdf".into(),
            otherwise: "chemistry/microprobe_data".into(),
        };
        assert_eq!(placement_dir(&placement, &file("a_f1.pdf", None)), "chemistry/reference_pdf");
        assert_eq!(placement_dir(&placement, &file("a_f1.txt", None)), "chemistry/microprobe_data");
    }

    #[test]
    fn test_select_files_filters() {
        let record = RecordNode::from_value(&json!({
            "record_uuid": "r",
            "template_uuid": "t",
            "fields_t": [{"k": {
                "template_field_uuid": "img",
                "files": [
                    {"file_uuid": "a", "original_name": "s_a.jpg", "href": "h/a", "_file_metadata": {"_quality": "2"}},
                    {"file_uuid": "b", "original_name": "s_b.jpg", "href": "h/b", "_file_metadata": {"_quality": "0"}},
                    {"file_uuid": "c", "original_name": "s_c.jpg", "href": "h/c", "parent_image_id": 4,
                     "_file_metadata": {"_quality": "3"}},
                    {"file_uuid": "d", "original_name": "s_d.jpg", "href": "h/d", "_file_metadata": {"_quality": "1"}}
                ]
            }}]
        }))
        .unwrap();

        let rule = FileRule {
            field: "img".into(),
            placement: Placement::Fixed {
                directory: "rruff_good_images".into(),
            },
            all_files: true,
            min_quality: Some(1),
            originals_only: true,
        };
        let names: Vec<&str> = select_files(&rule, &record)
            .into_iter()
            .map(|f| f.file_uuid.as_str())
            .collect();
        assert_eq!(names, vec!["a", "d"]);

        let first_only = FileRule {
            all_files: false,
            min_quality: None,
            originals_only: false,
            ..rule
        };
        assert_eq!(select_files(&first_only, &record).len(), 1);
    }

    #[test]
    fn test_unsafe_names() {
        assert!(is_safe_name("R1_raman.txt"));
        assert!(!is_safe_name("../etc/passwd"));
        assert!(!is_safe_name(".."));
        assert!(!is_safe_name(""));
    }
}
