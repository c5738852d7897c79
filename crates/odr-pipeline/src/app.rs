//! Wiring from configuration to running workers

use crate::api::ApiClient;
use crate::clock::{Clock, SystemClock};
use crate::config::{QueueBackend, TokenBackend, WorkerConfig};
use crate::envelope::Stage;
use crate::error::{PipelineError, Result};
use crate::queue::{BeanstalkQueue, JobId, MemoryBroker, Queue, DEFAULT_PRIORITY};
use crate::stages::{handler_for, PipelineContext};
use crate::token_cache::{FileTokenStore, MemoryTokenStore, TokenCache, TokenStore};
use crate::worker::{RetryPolicy, Worker, WorkerStats};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn build_token_cache(config: &WorkerConfig, clock: Arc<dyn Clock>) -> TokenCache {
    let store: Arc<dyn TokenStore> = match config.token_cache.backend {
        TokenBackend::Memory => Arc::new(MemoryTokenStore::new()),
        TokenBackend::File => Arc::new(FileTokenStore::new(&config.token_cache.path)),
    };
    TokenCache::new(store, clock)
        .with_ttl(Duration::from_secs(config.api.token_ttl_secs))
        .with_key(&config.token_cache.key)
}

pub fn build_api(config: &WorkerConfig, clock: Arc<dyn Clock>) -> Result<ApiClient> {
    let tokens = Arc::new(build_token_cache(config, clock));
    ApiClient::new(
        &config.api.base_url,
        Duration::from_secs(config.api.timeout_secs),
        tokens,
    )
}

pub fn build_queue(config: &WorkerConfig) -> Arc<dyn Queue> {
    let ttr = Duration::from_secs(config.queue.ttr_secs);
    match config.queue.backend {
        QueueBackend::Beanstalk => Arc::new(BeanstalkQueue::new(&config.queue.address).with_ttr(ttr)),
        QueueBackend::Memory => {
            warn!("Using the in-process queue; jobs are not shared with other processes");
            Arc::new(Arc::new(MemoryBroker::new(ttr)).connect())
        },
    }
}

pub fn retry_policy(config: &WorkerConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.retry.max_attempts,
        retry_delay: Duration::from_secs(config.retry.retry_delay_secs),
        dead_letter_tube: config.tubes.dead_letter.clone(),
    }
}

/// Run one stage until `shutdown` fires
pub async fn run_stage(
    config: Arc<WorkerConfig>,
    stage: Stage,
    tube: Option<String>,
    shutdown: CancellationToken,
) -> Result<WorkerStats> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let api = Arc::new(build_api(&config, Arc::clone(&clock))?);
    let queue = build_queue(&config);
    let tube = tube.unwrap_or_else(|| config.tube_for(stage).to_string());

    let ctx = Arc::new(PipelineContext::new(api, Arc::clone(&queue), clock, Arc::clone(&config)));
    let handler = handler_for(stage, ctx, shutdown.clone())?;

    let worker = Worker::new(queue, tube, handler)
        .with_retry(retry_policy(&config))
        .with_reserve_timeout(config.reserve_timeout());

    Ok(worker.run(shutdown).await)
}

/// Put the JSON document in `payload` on `tube` as-is
pub async fn enqueue(queue: &dyn Queue, tube: &str, payload: &Path, delay: Duration) -> Result<JobId> {
    let body = tokio::fs::read(payload)
        .await
        .map_err(|e| PipelineError::file_io(payload, e))?;
    serde_json::from_slice::<Value>(&body)
        .map_err(|e| PipelineError::validation(format!("{} is not valid JSON: {}", payload.display(), e)))?;

    let id = queue.put(tube, &body, DEFAULT_PRIORITY, delay).await?;
    info!(tube = %tube, job_id = id, "Job enqueued");
    Ok(id)
}
