//! Shared fixtures for pipeline integration tests
//!
//! [`FakeProducer`] keeps tracked jobs, records and listings in memory and
//! records every call, so stage behaviour can be checked without HTTP.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use odr_common::record::RecordNode;
use odr_pipeline::api::{Listing, ProducerApi};
use odr_pipeline::clock::SystemClock;
use odr_pipeline::config::WorkerConfig;
use odr_pipeline::envelope::{ApiCredentials, RecordRef};
use odr_pipeline::error::{PipelineError, Result};
use odr_pipeline::queue::MemoryBroker;
use odr_pipeline::stages::PipelineContext;
use odr_pipeline::tracked_job::TrackedJob;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const RECORDS_URL: &str = "/api/v5/search/modified/records/99999999";
pub const MODIFIED_FILES_URL: &str = "/api/v5/dataset/rruff/modified_files/99999999";

/// A record the fake producer can list, with its last modification time
#[derive(Debug, Clone)]
pub struct FakeRecord {
    pub unique_id: String,
    pub modified_millis: i64,
    pub tree: Value,
}

#[derive(Default)]
struct State {
    next_job_id: i64,
    jobs: HashMap<i64, TrackedJob>,
    records: Vec<FakeRecord>,
    modified_files: Vec<String>,
    fetched: Vec<String>,
    job_writes: Vec<TrackedJob>,
    progress_keys: Vec<String>,
    /// Bump `current` on every status poll
    advance_on_poll: bool,
}

#[derive(Default)]
pub struct FakeProducer {
    state: Mutex<State>,
}

impl FakeProducer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_record(&self, unique_id: &str, modified_millis: i64, tree: Value) {
        self.state.lock().unwrap().records.push(FakeRecord {
            unique_id: unique_id.to_string(),
            modified_millis,
            tree,
        });
    }

    pub fn set_modified_files(&self, files: &[&str]) {
        self.state.lock().unwrap().modified_files = files.iter().map(|f| f.to_string()).collect();
    }

    /// Insert a tracked job directly
    pub fn insert_job(&self, job: TrackedJob) {
        let mut state = self.state.lock().unwrap();
        state.next_job_id = state.next_job_id.max(job.id);
        state.jobs.insert(job.id, job);
    }

    pub fn remove_job(&self, id: i64) {
        self.state.lock().unwrap().jobs.remove(&id);
    }

    pub fn advance_on_poll(&self) {
        self.state.lock().unwrap().advance_on_poll = true;
    }

    pub fn job(&self, id: i64) -> Option<TrackedJob> {
        self.state.lock().unwrap().jobs.get(&id).cloned()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.state.lock().unwrap().fetched.clone()
    }

    pub fn job_writes(&self) -> Vec<TrackedJob> {
        self.state.lock().unwrap().job_writes.clone()
    }

    pub fn completions(&self, id: i64) -> usize {
        self.job_writes().iter().filter(|j| j.id == id && j.completed).count()
    }

    pub fn progress_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().progress_keys.clone()
    }
}

/// Trailing path segment of a listing URL as a watermark
fn since_of(url: &str) -> i64 {
    url.rsplit('/').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl ProducerApi for FakeProducer {
    async fn fetch_listing(&self, _credentials: &ApiCredentials, url: &str) -> Result<Listing> {
        let mut state = self.state.lock().unwrap();
        state.fetched.push(url.to_string());

        if url.contains("modified_files") {
            return Ok(Listing {
                records: Vec::new(),
                files: state.modified_files.clone(),
            });
        }

        let since = since_of(url);
        let records = state
            .records
            .iter()
            .filter(|r| r.modified_millis > since)
            .map(|r| RecordRef {
                unique_id: r.unique_id.clone(),
                ..RecordRef::default()
            })
            .collect();
        Ok(Listing {
            records,
            files: Vec::new(),
        })
    }

    async fn get_record(&self, _credentials: &ApiCredentials, record_uuid: &str) -> Result<RecordNode> {
        let state = self.state.lock().unwrap();
        let record = state
            .records
            .iter()
            .find(|r| r.unique_id == record_uuid)
            .ok_or_else(|| PipelineError::RecordNotFound(record_uuid.to_string()))?;
        Ok(RecordNode::from_value(&record.tree)?)
    }

    async fn get_job_status(&self, _credentials: &ApiCredentials, tracked_job_id: i64) -> Result<TrackedJob> {
        let mut state = self.state.lock().unwrap();
        let advance = state.advance_on_poll;
        let job = state
            .jobs
            .get_mut(&tracked_job_id)
            .ok_or(PipelineError::JobNotFound(tracked_job_id))?;
        if advance && job.current < job.total {
            job.current += 1;
        }
        Ok(job.clone())
    }

    async fn create_or_update_job(&self, _credentials: &ApiCredentials, job: &TrackedJob) -> Result<TrackedJob> {
        let mut state = self.state.lock().unwrap();
        let mut job = job.clone();
        if job.id == 0 {
            state.next_job_id += 1;
            job.id = state.next_job_id;
        } else {
            let existing = state
                .jobs
                .get(&job.id)
                .ok_or(PipelineError::JobNotFound(job.id))?;
            // Progress is owned by the producer
            job.current = existing.current;
        }
        state.jobs.insert(job.id, job.clone());
        state.job_writes.push(job.clone());
        Ok(job)
    }

    async fn report_worker_progress(
        &self,
        _credentials: &ApiCredentials,
        tracked_job_id: i64,
        random_key: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.progress_keys.push(random_key.to_string());
        let job = state
            .jobs
            .get_mut(&tracked_job_id)
            .ok_or(PipelineError::JobNotFound(tracked_job_id))?;
        job.current += 1;
        Ok(())
    }
}

/// Config for a files pipeline rooted at `root`
pub fn files_config(root: &Path) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.pipeline.output_root = root.to_path_buf();
    config.finisher.poll_interval_secs = 5;
    config
}

pub fn context(producer: Arc<FakeProducer>, broker: &Arc<MemoryBroker>, config: WorkerConfig) -> Arc<PipelineContext> {
    Arc::new(PipelineContext::new(
        producer,
        Arc::new(broker.connect()),
        Arc::new(SystemClock),
        Arc::new(config),
    ))
}

pub fn credentials() -> ApiCredentials {
    ApiCredentials::new("publisher", "secret")
}
