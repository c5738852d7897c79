//! ODR worker - Main entry point

use anyhow::Context;
use clap::Parser;
use odr_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use odr_pipeline::{app, Cli, Commands, Stage, WorkerConfig};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix(cli.command.log_file_prefix())
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    if let Err(e) = execute(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute(cli: &Cli) -> anyhow::Result<()> {
    let mut config = WorkerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;
    let config = Arc::new(config);

    let stage = match &cli.command {
        Commands::Analyzer => Stage::Analyzer,
        Commands::FileBuilder | Commands::RecordBuilder => Stage::Builder,
        Commands::Finisher => Stage::Finisher,
        Commands::Enqueue { payload, delay } => {
            let tube = cli.tube.as_deref().unwrap_or(&config.tubes.analyzer);
            let queue = app::build_queue(&config);
            let id = app::enqueue(queue.as_ref(), tube, payload, Duration::from_secs(*delay)).await?;
            println!("{}", id);
            return Ok(());
        },
        Commands::Depth => {
            let tube = cli.tube.as_deref().unwrap_or(&config.tubes.analyzer);
            let depth = app::build_queue(&config).ready_count(tube).await?;
            println!("{}", depth);
            return Ok(());
        },
    };

    let kind = config.pipeline.kind;
    match (&cli.command, kind) {
        (Commands::FileBuilder, odr_pipeline::config::PipelineKind::Data)
        | (Commands::RecordBuilder, odr_pipeline::config::PipelineKind::Files) => {
            warn!(pipeline = ?kind, "Builder subcommand does not match the pipeline kind, using the {:?} builder", kind);
        },
        _ => {},
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested, finishing current job");
                shutdown.cancel();
            }
        }
    });

    let stats = app::run_stage(config, stage, cli.tube.clone(), shutdown).await?;
    info!(
        processed = stats.processed,
        failed = stats.failed,
        "Worker exited"
    );
    Ok(())
}
