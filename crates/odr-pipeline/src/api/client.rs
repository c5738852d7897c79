//! HTTP client for the producer API
//!
//! Every authenticated call fetches its bearer token through the shared
//! [`TokenCache`]; a `401` evicts the cached token so the next job logs in
//! again. No retries happen here, retrying is the worker loop's business.

use crate::api::types::{JobRequest, Listing, LoginRequest, LoginResponse, WorkerJob, WorkerJobRequest};
use crate::api::{endpoints, ProducerApi};
use crate::envelope::ApiCredentials;
use crate::error::{PipelineError, Result};
use crate::token_cache::{Authenticator, TokenCache};
use crate::tracked_job::TrackedJob;
use async_trait::async_trait;
use odr_common::record::RecordNode;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// ============================================================================
// API Client Constants
// ============================================================================

/// Default timeout for API requests in seconds.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;

/// Default producer base URL when not configured.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

/// Longest response excerpt included in error messages
const ERROR_BODY_EXCERPT: usize = 200;

pub struct ApiClient {
    client: Client,
    base_url: String,
    tokens: Arc<TokenCache>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, tokens: Arc<TokenCache>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send an authenticated request. `Ok(None)` means the resource answered 404.
    async fn call<B>(
        &self,
        credentials: &ApiCredentials,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<Option<Value>>
    where
        B: Serialize + ?Sized + Sync,
    {
        let token = self.tokens.ensure_token(self, credentials).await?;
        debug!(method = %method, url = %url, "API call");

        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| PipelineError::api(url, e))?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(credentials).await;
        }

        let text = response.text().await.map_err(|e| PipelineError::api(url, e))?;
        if !status.is_success() {
            return Err(PipelineError::api(url, format!("HTTP {}: {}", status, excerpt(&text))));
        }
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PipelineError::api(url, format!("malformed JSON response: {}", e)))
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(ERROR_BODY_EXCERPT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Job endpoints answer either with the job itself or wrapped in `{"job": ...}`
fn unwrap_job(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("job").is_some_and(Value::is_object) => {
            map.remove("job").unwrap_or(Value::Null)
        },
        other => other,
    }
}

fn parse_job(url: &str, value: Value) -> Result<TrackedJob> {
    serde_json::from_value(value).map_err(|e| PipelineError::api(url, format!("unexpected job body: {}", e)))
}

#[async_trait]
impl Authenticator for ApiClient {
    async fn login(&self, credentials: &ApiCredentials) -> Result<String> {
        let url = endpoints::token_url(&self.base_url);
        let request = LoginRequest {
            username: &credentials.api_user,
            password: &credentials.api_key,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::auth(format!("login request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::auth(format!("login rejected with HTTP {}", status)));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::auth(format!("unreadable login response: {}", e)))?;

        body.token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PipelineError::auth("login response carried no token"))
    }
}

#[async_trait]
impl ProducerApi for ApiClient {
    async fn fetch_listing(&self, credentials: &ApiCredentials, url: &str) -> Result<Listing> {
        let url = endpoints::resolve_url(&self.base_url, url);
        let value = self
            .call(credentials, Method::GET, &url, None::<&()>)
            .await?
            .ok_or_else(|| PipelineError::api(&url, "HTTP 404 Not Found"))?;

        serde_json::from_value(value).map_err(|e| PipelineError::api(&url, format!("unexpected listing body: {}", e)))
    }

    async fn get_record(&self, credentials: &ApiCredentials, record_uuid: &str) -> Result<RecordNode> {
        let url = endpoints::record_url(&self.base_url, record_uuid);
        let value = self
            .call(credentials, Method::GET, &url, None::<&()>)
            .await?
            .ok_or_else(|| PipelineError::RecordNotFound(record_uuid.to_string()))?;

        RecordNode::from_value(&value).map_err(|e| PipelineError::api(&url, e))
    }

    async fn get_job_status(&self, credentials: &ApiCredentials, tracked_job_id: i64) -> Result<TrackedJob> {
        let url = endpoints::job_status_url(&self.base_url, tracked_job_id);
        let value = self
            .call(credentials, Method::GET, &url, None::<&()>)
            .await?
            .map(unwrap_job)
            .ok_or(PipelineError::JobNotFound(tracked_job_id))?;

        // A deleted job comes back as an empty or id-less body
        if value.get("id").map_or(true, Value::is_null) {
            return Err(PipelineError::JobNotFound(tracked_job_id));
        }

        parse_job(&url, value)
    }

    async fn create_or_update_job(&self, credentials: &ApiCredentials, job: &TrackedJob) -> Result<TrackedJob> {
        let url = endpoints::job_url(&self.base_url);
        let method = if job.id == 0 { Method::POST } else { Method::PUT };

        let value = self
            .call(credentials, method, &url, Some(&JobRequest { job }))
            .await?
            .map(unwrap_job)
            .ok_or(PipelineError::JobNotFound(job.id))?;

        parse_job(&url, value)
    }

    async fn report_worker_progress(
        &self,
        credentials: &ApiCredentials,
        tracked_job_id: i64,
        random_key: &str,
    ) -> Result<()> {
        let url = endpoints::worker_job_url(&self.base_url);
        let body = WorkerJobRequest {
            job: WorkerJob::single(tracked_job_id, random_key),
        };

        self.call(credentials, Method::POST, &url, Some(&body))
            .await?
            .ok_or(PipelineError::JobNotFound(tracked_job_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_job() {
        assert_eq!(unwrap_job(json!({"job": {"id": 3}})), json!({"id": 3}));
        assert_eq!(unwrap_job(json!({"id": 3})), json!({"id": 3}));
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let long = "x".repeat(1000);
        assert_eq!(excerpt(&long).len(), ERROR_BODY_EXCERPT);
        assert_eq!(excerpt("short"), "short");
    }
}
