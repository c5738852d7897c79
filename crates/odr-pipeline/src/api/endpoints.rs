//! API endpoint URL builders
//!
//! Helper functions to construct producer API URLs.

/// Placeholder at the end of listing URLs, replaced by the watermark
pub const WATERMARK_SENTINEL: &str = "99999999";

fn trim(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

/// Build login URL
pub fn token_url(base_url: &str) -> String {
    format!("{}/api/v5/token", trim(base_url))
}

/// Build record tree URL
pub fn record_url(base_url: &str, record_uuid: &str) -> String {
    format!("{}/api/v5/dataset/record/{}", trim(base_url), record_uuid)
}

/// Build tracked job create/update URL
pub fn job_url(base_url: &str) -> String {
    format!("{}/api/v4/job", trim(base_url))
}

/// Build tracked job status URL
pub fn job_status_url(base_url: &str, tracked_job_id: i64) -> String {
    format!("{}/api/v4/job/status/{}/1", trim(base_url), tracked_job_id)
}

/// Build worker progress URL
pub fn worker_job_url(base_url: &str) -> String {
    format!("{}/api/v4/worker/job", trim(base_url))
}

/// Resolve a URL carried in a job payload.
///
/// Producers historically send scheme-less URLs (`//host/path` or
/// `host/path`), which are treated as HTTPS. Paths starting with `/` are
/// relative to the API base.
pub fn resolve_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("//") {
        format!("https://{}", rest)
    } else if url.starts_with('/') {
        format!("{}{}", trim(base_url), url)
    } else {
        format!("https://{}", url)
    }
}

pub fn has_watermark_sentinel(url: &str) -> bool {
    url.ends_with(WATERMARK_SENTINEL)
}

/// Replace a trailing sentinel with `since_millis`; other URLs are returned
/// unchanged.
pub fn with_watermark(url: &str, since_millis: i64) -> String {
    match url.strip_suffix(WATERMARK_SENTINEL) {
        Some(prefix) => format!("{}{}", prefix, since_millis),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_url() {
        assert_eq!(
            token_url("https://rruff.net/odr_rruff/"),
            "https://rruff.net/odr_rruff/api/v5/token"
        );
    }

    #[test]
    fn test_record_url() {
        assert_eq!(
            record_url("http://localhost:8000", "3f2a9c"),
            "http://localhost:8000/api/v5/dataset/record/3f2a9c"
        );
    }

    #[test]
    fn test_job_urls() {
        assert_eq!(job_url("http://h"), "http://h/api/v4/job");
        assert_eq!(job_status_url("http://h", 42), "http://h/api/v4/job/status/42/1");
        assert_eq!(worker_job_url("http://h"), "http://h/api/v4/worker/job");
    }

    #[test]
    fn test_resolve_url() {
        let base = "https://rruff.net/odr_rruff";
        assert_eq!(resolve_url(base, "http://x/y"), "http://x/y");
        assert_eq!(resolve_url(base, "//rruff.net/a"), "https://rruff.net/a");
        assert_eq!(
            resolve_url(base, "/api/v5/search/records"),
            "https://rruff.net/odr_rruff/api/v5/search/records"
        );
        assert_eq!(resolve_url(base, "rruff.net/a"), "https://rruff.net/a");
    }

    #[test]
    fn test_watermark_substitution() {
        let url = "//rruff.net/odr_rruff/api/v5/search/modified/records/99999999";
        assert!(has_watermark_sentinel(url));
        assert_eq!(
            with_watermark(url, 1717000000000),
            "//rruff.net/odr_rruff/api/v5/search/modified/records/1717000000000"
        );
        assert_eq!(with_watermark("/records/all", 5), "/records/all");
    }
}
