//! Shared bearer-token cache
//!
//! Every stage authenticates before talking to the producer API. Logging in
//! on every job is wasteful, so tokens are cached in a [`TokenStore`] and
//! reused until they are older than the configured TTL.
//!
//! There is no lock around refresh: two workers that find a stale token at
//! the same moment will both log in and the last write wins. Both tokens stay
//! valid server-side, so this only costs an extra login.

use crate::clock::Clock;
use crate::envelope::ApiCredentials;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// ============================================================================
// Token Cache Constants
// ============================================================================

/// Tokens older than this are refreshed before use.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 120;

/// Store key prefix; the API user is appended.
pub const DEFAULT_TOKEN_KEY: &str = "ima_api_token";

/// A bearer token and the instant it was obtained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Exchanges credentials for a fresh token
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, credentials: &ApiCredentials) -> Result<String>;
}

/// Backing storage for cached tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Token>>;
    async fn set(&self, key: &str, token: &Token) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<Token>> {
        Ok(self.tokens.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, token: &Token) -> Result<()> {
        self.tokens.write().await.insert(key.to_string(), token.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.tokens.write().await.remove(key);
        Ok(())
    }
}

/// Store shared by every worker process on a host: one JSON file per key
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, key: &str) -> Result<Option<Token>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::file_io(&path, e)),
        };

        match serde_json::from_slice(&bytes) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cached token");
                Ok(None)
            },
        }
    }

    async fn set(&self, key: &str, token: &Token) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PipelineError::file_io(&self.dir, e))?;

        let path = self.path_for(key);
        let tmp = path.with_extension(format!("json.{}", uuid::Uuid::new_v4().simple()));
        write_then_rename(&tmp, &path, &serde_json::to_vec(token)?).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::file_io(&path, e)),
        }
    }
}

async fn write_then_rename(tmp: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(tmp, bytes)
        .await
        .map_err(|e| PipelineError::file_io(tmp, e))?;
    tokio::fs::rename(tmp, dest)
        .await
        .map_err(|e| PipelineError::file_io(dest, e))
}

/// TTL-bounded token cache in front of a [`TokenStore`]
pub struct TokenCache {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    key: String,
}

impl TokenCache {
    pub fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS as i64),
            key: DEFAULT_TOKEN_KEY.to_string(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = chrono::Duration::from_std(ttl).unwrap_or(self.ttl);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    fn cache_key(&self, credentials: &ApiCredentials) -> String {
        format!("{}:{}", self.key, credentials.api_user)
    }

    /// A token is fresh until it is strictly older than the TTL
    pub fn is_fresh(&self, token: &Token) -> bool {
        self.clock.now() - token.timestamp <= self.ttl
    }

    /// Return a usable bearer token, logging in only when the cached one is
    /// missing or stale
    pub async fn ensure_token(
        &self,
        authenticator: &dyn Authenticator,
        credentials: &ApiCredentials,
    ) -> Result<String> {
        let key = self.cache_key(credentials);

        match self.store.get(&key).await {
            Ok(Some(token)) if self.is_fresh(&token) => {
                debug!(key = %key, "Using cached API token");
                return Ok(token.token);
            },
            Ok(_) => {},
            Err(e) => warn!(key = %key, error = %e, "Token store read failed"),
        }

        let token = Token {
            token: authenticator.login(credentials).await?,
            timestamp: self.clock.now(),
        };
        info!(key = %key, "Obtained fresh API token");

        if let Err(e) = self.store.set(&key, &token).await {
            warn!(key = %key, error = %e, "Failed to cache API token");
        }

        Ok(token.token)
    }

    /// Drop the cached token, e.g. after the API rejected it
    pub async fn invalidate(&self, credentials: &ApiCredentials) {
        let key = self.cache_key(credentials);
        if let Err(e) = self.store.remove(&key).await {
            warn!(key = %key, error = %e, "Failed to invalidate cached API token");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuth {
        logins: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for CountingAuth {
        async fn login(&self, _credentials: &ApiCredentials) -> Result<String> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{}", n))
        }
    }

    struct RejectingAuth;

    #[async_trait]
    impl Authenticator for RejectingAuth {
        async fn login(&self, _credentials: &ApiCredentials) -> Result<String> {
            Err(PipelineError::auth("invalid credentials"))
        }
    }

    fn creds() -> ApiCredentials {
        ApiCredentials::new("publisher@example.org", "secret")
    }

    fn setup() -> (TokenCache, ManualClock, CountingAuth) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let cache = TokenCache::new(Arc::new(MemoryTokenStore::new()), Arc::new(clock.clone()));
        let auth = CountingAuth {
            logins: AtomicUsize::new(0),
        };
        (cache, clock, auth)
    }

    #[tokio::test]
    async fn test_reuses_token_within_ttl() {
        let (cache, clock, auth) = setup();

        assert_eq!(cache.ensure_token(&auth, &creds()).await.unwrap(), "token-1");
        clock.advance(chrono::Duration::seconds(119));
        assert_eq!(cache.ensure_token(&auth, &creds()).await.unwrap(), "token-1");
        assert_eq!(auth.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refreshes_exactly_once_after_ttl() {
        let (cache, clock, auth) = setup();

        cache.ensure_token(&auth, &creds()).await.unwrap();
        clock.advance(chrono::Duration::seconds(121));

        assert_eq!(cache.ensure_token(&auth, &creds()).await.unwrap(), "token-2");
        assert_eq!(cache.ensure_token(&auth, &creds()).await.unwrap(), "token-2");
        assert_eq!(auth.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_boundary_is_inclusive() {
        let (cache, clock, auth) = setup();

        cache.ensure_token(&auth, &creds()).await.unwrap();
        clock.advance(chrono::Duration::seconds(120));
        cache.ensure_token(&auth, &creds()).await.unwrap();
        assert_eq!(auth.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_login() {
        let (cache, _clock, auth) = setup();

        cache.ensure_token(&auth, &creds()).await.unwrap();
        cache.invalidate(&creds()).await;
        assert_eq!(cache.ensure_token(&auth, &creds()).await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_login_failure_is_auth_error() {
        let (cache, _clock, _auth) = setup();
        let err = cache.ensure_token(&RejectingAuth, &creds()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
    }

    #[tokio::test]
    async fn test_file_store_shared_between_caches() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let auth = CountingAuth {
            logins: AtomicUsize::new(0),
        };

        let first = TokenCache::new(Arc::new(FileTokenStore::new(dir.path())), Arc::new(clock.clone()));
        let second = TokenCache::new(Arc::new(FileTokenStore::new(dir.path())), Arc::new(clock.clone()));

        first.ensure_token(&auth, &creds()).await.unwrap();
        assert_eq!(second.ensure_token(&auth, &creds()).await.unwrap(), "token-1");
        assert_eq!(auth.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_file_store_ignores_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        std::fs::write(store.path_for("k"), b"not json").unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
    }
}
