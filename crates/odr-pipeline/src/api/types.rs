//! Request and response bodies for the producer API

use crate::envelope::RecordRef;
use crate::tracked_job::TrackedJob;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub token: Option<String>,
}

/// `{"job": {...}}` wrapper used for tracked job create/update
#[derive(Debug, Serialize)]
pub struct JobRequest<'a> {
    pub job: &'a TrackedJob,
}

#[derive(Debug, Serialize)]
pub struct WorkerJobRequest<'a> {
    pub job: WorkerJob<'a>,
}

/// One progress report. `random_key` must be unique per report; the
/// producer ignores duplicates.
#[derive(Debug, Serialize)]
pub struct WorkerJob<'a> {
    pub tracked_job_id: i64,
    pub random_key: &'a str,
    pub job_order: u32,
    pub line_count: u32,
}

impl<'a> WorkerJob<'a> {
    pub fn single(tracked_job_id: i64, random_key: &'a str) -> Self {
        Self {
            tracked_job_id,
            random_key,
            job_order: 0,
            line_count: 1,
        }
    }
}

/// Record and/or file listing
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub records: Vec<RecordRef>,

    /// File names changed since a watermark
    #[serde(default)]
    pub files: Vec<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_job_body() {
        let body = WorkerJobRequest {
            job: WorkerJob::single(42, "rruff_file_abc"),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"job": {"tracked_job_id": 42, "random_key": "rruff_file_abc", "job_order": 0, "line_count": 1}})
        );
    }

    #[test]
    fn test_listing_with_numeric_ids() {
        let listing: Listing = serde_json::from_value(json!({
            "records": [{"internal_id": 17, "unique_id": "a1b2", "external_id": 1001, "record_name": "Quartz"}]
        }))
        .unwrap();
        assert_eq!(listing.records[0].internal_id.as_deref(), Some("17"));
        assert!(listing.files.is_empty());
    }
}
