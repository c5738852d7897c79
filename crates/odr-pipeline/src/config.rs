//! Worker configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `ODR__SECTION__KEY` environment variables (a `.env` file is read first),
//! then command-line overrides applied by the binary.

use crate::error::{PipelineError, Result};
use crate::token_cache::{DEFAULT_TOKEN_KEY, DEFAULT_TOKEN_TTL_SECS};
use crate::tracked_job::{DEFAULT_MAX_POLLS, DEFAULT_MAX_POLL_INTERVAL_SECS, DEFAULT_POLL_INTERVAL_SECS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Worker Configuration Constants
// ============================================================================

/// Environment variable prefix; nested keys use a double underscore
pub const ENV_PREFIX: &str = "ODR";

/// Default producer API base URL.
pub const DEFAULT_API_BASE_URL: &str = crate::api::client::DEFAULT_API_BASE_URL;

/// Default API request timeout in seconds.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = crate::api::client::DEFAULT_API_TIMEOUT_SECS;

/// Default beanstalkd address.
pub const DEFAULT_QUEUE_ADDRESS: &str = crate::queue::beanstalk::DEFAULT_BEANSTALK_ADDR;

/// Seconds a reserve waits before the worker logs an idle tick.
pub const DEFAULT_RESERVE_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_ANALYZER_TUBE: &str = "odr_rruff_record_analyzer";
pub const DEFAULT_BUILDER_TUBE: &str = "odr_rruff_file_builder";
pub const DEFAULT_FINISHER_TUBE: &str = "odr_rruff_file_finisher";

/// Default attempts per job (one means a failed job is dropped).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Default delay before a retried job becomes ready again.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 30;

/// Default upper bound for an inline Finisher run (one day).
pub const DEFAULT_FINISHER_DEADLINE_SECS: u64 = 86_400;

pub const DEFAULT_JOB_TYPE: &str = "rruff_file_update";
pub const DEFAULT_TARGET_ENTITY: &str = "rruff_files";
pub const DEFAULT_OUTPUT_ROOT: &str = "app/rruff_files";
pub const DEFAULT_MARKER_FILE: &str = "last_updated.txt";

/// Separator between delimited columns
pub const DEFAULT_DELIMITER: &str = "||";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub api: ApiConfig,
    pub queue: QueueConfig,
    pub tubes: TubeConfig,
    pub retry: RetryConfig,
    pub finisher: FinisherConfig,
    pub token_cache: TokenCacheConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub token_ttl_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// In-process broker; only useful when every stage runs in one process
    Memory,
    #[default]
    Beanstalk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub address: String,
    pub reserve_timeout_secs: u64,
    pub ttr_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            address: DEFAULT_QUEUE_ADDRESS.to_string(),
            reserve_timeout_secs: DEFAULT_RESERVE_TIMEOUT_SECS,
            ttr_secs: crate::queue::DEFAULT_TTR_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TubeConfig {
    pub analyzer: String,
    pub builder: String,
    pub finisher: String,
    /// Where jobs go after their last failed attempt; dropped when unset
    pub dead_letter: Option<String>,
}

impl Default for TubeConfig {
    fn default() -> Self {
        Self {
            analyzer: DEFAULT_ANALYZER_TUBE.to_string(),
            builder: DEFAULT_BUILDER_TUBE.to_string(),
            finisher: DEFAULT_FINISHER_TUBE.to_string(),
            dead_letter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinisherMode {
    /// Re-put the Finisher job on its own tube after each poll
    #[default]
    Requeue,
    /// Keep the job reserved and poll in-process
    Inline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinisherConfig {
    pub mode: FinisherMode,
    pub poll_interval_secs: u64,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub max_interval_secs: u64,
    pub deadline_secs: u64,
}

impl Default for FinisherConfig {
    fn default() -> Self {
        Self {
            mode: FinisherMode::default(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_POLLS,
            backoff_factor: 1.0,
            max_interval_secs: DEFAULT_MAX_POLL_INTERVAL_SECS,
            deadline_secs: DEFAULT_FINISHER_DEADLINE_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenBackend {
    #[default]
    Memory,
    /// JSON files in a directory shared by every worker process
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCacheConfig {
    pub backend: TokenBackend,
    pub key: String,
    pub path: PathBuf,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            backend: TokenBackend::default(),
            key: DEFAULT_TOKEN_KEY.to_string(),
            path: std::env::temp_dir().join("odr-tokens"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Mirror record files into category directories and zip them
    #[default]
    Files,
    /// Render one line per record into static data files
    Data,
}

/// A directory of mirrored files and the archive built from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Relative to `output_root`
    pub directory: String,
    /// Relative to `archive_root`
    pub archive: String,
}

impl CategoryConfig {
    pub fn new(directory: impl Into<String>, archive: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            archive: archive.into(),
        }
    }
}

/// A static data file built by a data pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    /// Canonical file, relative to `output_root`
    pub path: String,
    /// Written at the top of the file on a full rebuild
    #[serde(default)]
    pub header: String,
    /// File that receives incremental runs; `None` means incremental runs
    /// replace the canonical file too
    #[serde(default)]
    pub update_path: Option<String>,
}

/// Chooses the directory a downloaded file lands in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    Fixed {
        directory: String,
    },
    /// `matched` when the file name ends with `suffix`, else `otherwise`
    BySuffix {
        suffix: String,
        matched: String,
        otherwise: String,
    },
    /// `{base}/{quality}_{oriented|unoriented}` from the file's quality rating
    ByQuality {
        base: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRule {
    /// Template field UUID carrying the files
    pub field: String,
    pub placement: Placement,
    /// Take every file of the field instead of only the first
    #[serde(default)]
    pub all_files: bool,
    /// Skip files rated below this
    #[serde(default)]
    pub min_quality: Option<i32>,
    /// Skip derived images (those with a parent image)
    #[serde(default)]
    pub originals_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineMode {
    /// `prefix` + columns joined by `delimiter` + `suffix`
    #[default]
    Delimited,
    /// `prefix` + JSON object of `keys[i] -> columns[i]` + `suffix`
    Json,
}

/// How one record is rendered into one line of an output file.
///
/// `prefix`, `suffix` and every column are placeholder expressions, see
/// [`crate::format`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTemplate {
    /// Name of the [`OutputConfig`] the line is appended to
    pub output: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub mode: LineMode,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub keys: Vec<String>,
}

fn default_delimiter() -> String {
    DEFAULT_DELIMITER.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub kind: PipelineKind,
    pub job_type: String,
    pub target_entity: String,
    pub output_root: PathBuf,
    /// Where archives are written; defaults to `output_root`
    pub archive_root: Option<PathBuf>,
    /// Relative to `output_root`; its mtime is the incremental watermark
    pub marker_file: String,
    /// Refuse to start a run while another one holds the lock
    pub single_flight: bool,
    /// Prefix of worker progress keys
    pub progress_key_prefix: String,
    pub categories: Vec<CategoryConfig>,
    pub outputs: Vec<OutputConfig>,
    pub file_rules: Vec<FileRule>,
    pub line_templates: Vec<LineTemplate>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            kind: PipelineKind::default(),
            job_type: DEFAULT_JOB_TYPE.to_string(),
            target_entity: DEFAULT_TARGET_ENTITY.to_string(),
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            archive_root: None,
            marker_file: DEFAULT_MARKER_FILE.to_string(),
            single_flight: false,
            progress_key_prefix: "RRUFF_FILE".to_string(),
            categories: rruff_categories(),
            outputs: Vec::new(),
            file_rules: Vec::new(),
            line_templates: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn archive_root(&self) -> &Path {
        self.archive_root.as_deref().unwrap_or(&self.output_root)
    }
}

/// Directory layout of the RRUFF file mirror
pub fn rruff_categories() -> Vec<CategoryConfig> {
    [
        ("raman/excellent_oriented", "raman/excellent_oriented.zip"),
        ("raman/fair_oriented", "raman/fair_oriented.zip"),
        ("raman/ignore_unoriented", "raman/ignore_unoriented.zip"),
        ("raman/poor_oriented", "raman/poor_oriented.zip"),
        ("raman/unrated_oriented", "raman/unrated_oriented.zip"),
        ("raman/excellent_unoriented", "raman/excellent_unoriented.zip"),
        ("raman/fair_unoriented", "raman/fair_unoriented.zip"),
        ("raman/lr-raman", "raman/LR-Raman.zip"),
        ("raman/poor_unoriented", "raman/poor_unoriented.zip"),
        ("raman/unrated_unoriented", "raman/unrated_unoriented.zip"),
        ("powder/dif", "powder/DIF.zip"),
        ("powder/reference_pdf", "powder/Reference_PDF.zip"),
        ("powder/refinement_data", "powder/Refinement_Data.zip"),
        ("powder/refinement_output_data", "powder/Refinement_Output_Data.zip"),
        ("powder/xy_processed", "powder/XY_Processed.zip"),
        ("powder/xy_raw", "powder/XY_RAW.zip"),
        ("infrared/processed", "infrared/Processed.zip"),
        ("infrared/raw", "infrared/RAW.zip"),
        ("chemistry/microprobe_data", "chemistry/Microprobe_Data.zip"),
        ("chemistry/reference_pdf", "chemistry/Reference_PDF.zip"),
        ("rruff_good_images", "rruff_good_images.zip"),
    ]
    .into_iter()
    .map(|(directory, archive)| CategoryConfig::new(directory, archive))
    .collect()
}

impl WorkerConfig {
    /// Load defaults, the optional TOML file and `ODR__*` environment
    /// variables. Callers validate once command-line overrides are applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: WorkerConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(PipelineError::config("api.base_url cannot be empty"));
        }
        if self.api.timeout_secs == 0 {
            return Err(PipelineError::config("api.timeout_secs must be greater than 0"));
        }

        for (name, tube) in [
            ("analyzer", &self.tubes.analyzer),
            ("builder", &self.tubes.builder),
            ("finisher", &self.tubes.finisher),
        ] {
            if tube.trim().is_empty() {
                return Err(PipelineError::config(format!("tubes.{} cannot be empty", name)));
            }
        }
        if self.tubes.dead_letter.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(PipelineError::config("tubes.dead_letter cannot be an empty name"));
        }

        if self.queue.ttr_secs == 0 {
            return Err(PipelineError::config("queue.ttr_secs must be greater than 0"));
        }
        if self.queue.reserve_timeout_secs == 0 {
            return Err(PipelineError::config("queue.reserve_timeout_secs must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::config("retry.max_attempts must be at least 1"));
        }

        if self.finisher.poll_interval_secs == 0 {
            return Err(PipelineError::config("finisher.poll_interval_secs must be greater than 0"));
        }
        if !self.finisher.backoff_factor.is_finite() || self.finisher.backoff_factor < 1.0 {
            return Err(PipelineError::config("finisher.backoff_factor must be a finite number >= 1.0"));
        }
        if self.finisher.mode == FinisherMode::Inline && self.queue.ttr_secs < self.finisher.deadline_secs {
            // The reserved job would age out and be handed to another finisher
            return Err(PipelineError::config(
                "inline finisher mode needs queue.ttr_secs >= finisher.deadline_secs",
            ));
        }

        match self.pipeline.kind {
            PipelineKind::Files => {
                if self.pipeline.categories.is_empty() {
                    return Err(PipelineError::config("a files pipeline needs at least one category"));
                }
            },
            PipelineKind::Data => {
                if self.pipeline.outputs.is_empty() {
                    return Err(PipelineError::config("a data pipeline needs at least one output"));
                }
                for template in &self.pipeline.line_templates {
                    if !self.pipeline.outputs.iter().any(|o| o.name == template.output) {
                        return Err(PipelineError::config(format!(
                            "line template refers to unknown output '{}'",
                            template.output
                        )));
                    }
                }
            },
        }

        if self.pipeline.marker_file.trim().is_empty() {
            return Err(PipelineError::config("pipeline.marker_file cannot be empty"));
        }

        Ok(())
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.reserve_timeout_secs)
    }

    /// Tube a stage consumes from
    pub fn tube_for(&self, stage: crate::envelope::Stage) -> &str {
        use crate::envelope::Stage;
        match stage {
            Stage::Analyzer => &self.tubes.analyzer,
            Stage::Builder => &self.tubes.builder,
            Stage::Finisher => &self.tubes.finisher,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.finisher.poll_interval_secs, 5);
        assert_eq!(config.finisher.max_retries, 10_000);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.pipeline.archive_root(), Path::new(DEFAULT_OUTPUT_ROOT));
    }

    #[test]
    fn test_rejects_empty_tube() {
        let mut config = WorkerConfig::default();
        config.tubes.finisher = " ".into();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_rejects_data_pipeline_without_outputs() {
        let mut config = WorkerConfig::default();
        config.pipeline.kind = PipelineKind::Data;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_template_for_unknown_output() {
        let mut config = WorkerConfig::default();
        config.pipeline.kind = PipelineKind::Data;
        config.pipeline.outputs.push(OutputConfig {
            name: "mineral_data".into(),
            path: "mineral_data.js".into(),
            header: String::new(),
            update_path: None,
        });
        config.pipeline.line_templates.push(LineTemplate {
            output: "references".into(),
            prefix: String::new(),
            suffix: String::new(),
            delimiter: default_delimiter(),
            mode: LineMode::Delimited,
            columns: Vec::new(),
            keys: Vec::new(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("references"));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[api]
base_url = "https://rruff.net/odr_rruff"

[finisher]
mode = "inline"
backoff_factor = 2.0
deadline_secs = 100

[pipeline]
kind = "files"
single_flight = true

[[pipeline.categories]]
directory = "powder/dif"
archive = "powder/DIF.zip"

[[pipeline.file_rules]]
field = "eeef0e5f2639f24107384feeeff7"
placement = {{ kind = "fixed", directory = "powder/dif" }}

[[pipeline.file_rules]]
field = "9cf77fe1d4068f96c1f7b182bab2"
placement = {{ kind = "by_quality", base = "raman" }}
"#
        )
        .unwrap();

        let config = WorkerConfig::load(Some(file.path())).unwrap();
        config.validate().unwrap();
        assert_eq!(config.api.base_url, "https://rruff.net/odr_rruff");
        assert_eq!(config.finisher.mode, FinisherMode::Inline);
        assert!(config.pipeline.single_flight);
        assert_eq!(config.pipeline.categories.len(), 1);
        assert_eq!(
            config.pipeline.file_rules[1].placement,
            Placement::ByQuality { base: "raman".into() }
        );
        assert_eq!(config.tubes.builder, DEFAULT_BUILDER_TUBE);
    }

    #[test]
    fn test_inline_finisher_must_fit_in_ttr() {
        let mut config = WorkerConfig::default();
        config.finisher.mode = FinisherMode::Inline;
        config.finisher.deadline_secs = config.queue.ttr_secs + 1;
        assert!(config.validate().is_err());

        config.finisher.deadline_secs = config.queue.ttr_secs;
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_reserve_timeout() {
        let mut config = WorkerConfig::default();
        config.queue.reserve_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reserve_timeout_secs"));
    }

    #[test]
    fn test_shipped_configs_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config");

        let files = WorkerConfig::load(Some(&dir.join("rruff_files.toml"))).unwrap();
        assert_eq!(files.pipeline.kind, PipelineKind::Files);
        assert_eq!(files.pipeline.categories.len(), rruff_categories().len());
        assert_eq!(files.pipeline.file_rules.len(), 12);
        files.validate().unwrap();

        let data = WorkerConfig::load(Some(&dir.join("ima_data.toml"))).unwrap();
        assert_eq!(data.pipeline.kind, PipelineKind::Data);
        assert_eq!(data.pipeline.line_templates.len(), 3);
        data.validate().unwrap();
        assert_eq!(data.pipeline.line_templates[2].columns.len(), 27);
        assert!(data.pipeline.outputs[0].header.starts_with("var mineral_data_array"));
    }

    #[test]
    fn test_rruff_layout_names_lr_raman_archive() {
        let categories = rruff_categories();
        let lr = categories.iter().find(|c| c.directory == "raman/lr-raman").unwrap();
        assert_eq!(lr.archive, "raman/LR-Raman.zip");
    }
}
