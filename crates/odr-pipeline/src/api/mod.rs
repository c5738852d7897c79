//! Producer API access
//!
//! Stages talk to the producer only through [`ProducerApi`]. [`ApiClient`] is
//! the HTTP implementation; tests substitute an in-memory fake.

pub mod client;
pub mod endpoints;
pub mod types;

pub use client::ApiClient;
pub use types::Listing;

use crate::envelope::ApiCredentials;
use crate::error::Result;
use crate::tracked_job::TrackedJob;
use async_trait::async_trait;
use odr_common::record::RecordNode;

#[async_trait]
pub trait ProducerApi: Send + Sync {
    /// GET a record or file listing. `url` may be absolute, scheme-relative
    /// (`//host/path`) or relative to the API base.
    async fn fetch_listing(&self, credentials: &ApiCredentials, url: &str) -> Result<Listing>;

    /// Fetch the full record tree. Fails with `RecordNotFound` on 404.
    async fn get_record(&self, credentials: &ApiCredentials, record_uuid: &str) -> Result<RecordNode>;

    /// Fails with `JobNotFound` when the tracked job no longer exists.
    async fn get_job_status(&self, credentials: &ApiCredentials, tracked_job_id: i64) -> Result<TrackedJob>;

    /// Create the job when `job.id == 0`, otherwise update it
    async fn create_or_update_job(&self, credentials: &ApiCredentials, job: &TrackedJob) -> Result<TrackedJob>;

    /// Count one finished unit of work against a tracked job
    async fn report_worker_progress(
        &self,
        credentials: &ApiCredentials,
        tracked_job_id: i64,
        random_key: &str,
    ) -> Result<()>;
}
