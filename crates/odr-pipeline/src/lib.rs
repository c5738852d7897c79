//! ODR Pipeline
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Queue-driven background workers that turn dataset records published by
//! the producer API into static downloads.
//!
//! # Overview
//!
//! - **Queue**: beanstalkd-style tubes ([`queue::Queue`]) with a TCP client and
//!   an in-process broker
//! - **Worker loop**: [`worker::Worker`] reserves, dispatches, deletes and
//!   applies the retry policy
//! - **Stages**: Analyzer, File/Record Builder and Finisher ([`stages`])
//! - **Producer API**: HTTP client with a shared token cache ([`api`],
//!   [`token_cache`])
//! - **Outputs**: category directories, zip archives and rendered data files
//!   ([`output`], [`archive`], [`format`])

pub mod api;
pub mod app;
pub mod archive;
pub mod clock;
pub mod config;
mod de;
pub mod envelope;
pub mod error;
pub mod format;
pub mod output;
pub mod queue;
pub mod stages;
pub mod token_cache;
pub mod tracked_job;
pub mod worker;

// Re-export commonly used types
pub use config::WorkerConfig;
pub use envelope::{Envelope, Payload, Stage};
pub use error::{PipelineError, Result};
pub use worker::{Worker, WorkerStats};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ODR pipeline worker
#[derive(Parser, Debug)]
#[command(name = "odr-worker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration file
    #[arg(short, long, env = "ODR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Consume from this tube instead of the configured one
    #[arg(long, global = true)]
    pub tube: Option<String>,

    /// Producer API base URL
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Seconds between Finisher polls
    #[arg(long, global = true)]
    pub poll_interval: Option<u64>,

    /// Finisher poll budget
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start runs and fan out builder jobs
    Analyzer,

    /// Mirror record files (files pipelines)
    FileBuilder,

    /// Render record lines (data pipelines)
    RecordBuilder,

    /// Wait for runs to complete and finalize outputs
    Finisher,

    /// Put a JSON trigger on a tube
    Enqueue {
        /// JSON file holding the job payload
        payload: PathBuf,

        /// Delay before the job becomes ready, in seconds
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },

    /// Print the number of ready jobs on a tube
    Depth,
}

impl Commands {
    /// Rolling log file prefix for this subcommand
    pub fn log_file_prefix(&self) -> &'static str {
        match self {
            Commands::Analyzer => "odr-analyzer",
            Commands::FileBuilder => "odr-file-builder",
            Commands::RecordBuilder => "odr-record-builder",
            Commands::Finisher => "odr-finisher",
            Commands::Enqueue { .. } | Commands::Depth => "odr-admin",
        }
    }
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut WorkerConfig) {
        if let Some(base) = &self.api_base {
            config.api.base_url = base.clone();
        }
        if let Some(interval) = self.poll_interval {
            config.finisher.poll_interval_secs = interval;
        }
        if let Some(max) = self.max_retries {
            config.finisher.max_retries = max;
        }
    }
}
