//! Rate-limited, de-duplicating, cache-aware fetch layer
//!
//! Every request to the relationship service flows through one
//! [`FetchPipeline`]: the pipeline owns the single [`RateLimiter`] and
//! [`RequestCache`] for a session, so tests can build isolated instances and a
//! session tears both down with the pipeline.

pub mod cache;
pub mod fan_out;
pub mod paginated;
pub mod rate_limiter;

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::EngineConfig;
use crate::transport::{Credential, CredentialProvider, Transport, TransportError};
use crate::upload::UploadFile;

pub use cache::{CacheKey, RequestCache};
pub use fan_out::{FanOutFetcher, FanOutResult};
pub use paginated::{normalize_timestamp, PaginatedFetcher, RelationQuery};
pub use rate_limiter::RateLimiter;

/// Fetch errors
///
/// `Clone` because a single settled request is handed to every waiter that
/// joined it through the cache.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Upstream answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    /// No status was obtained
    #[error("Network error: {0}")]
    Network(String),

    /// Response body could not be interpreted
    #[error("Decode error: {0}")]
    Decode(String),

    /// No credential is available for the account
    #[error("No credential for account {0}")]
    Credential(String),

    /// A paginated accumulation was aborted
    #[error("Page at offset {offset} failed: {source}")]
    Page {
        offset: usize,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// HTTP status when the failure came from a non-2xx response
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Transport { status, .. } => Some(*status),
            FetchError::Page { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        FetchError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Decode(e.to_string())
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Shared fetch service: one limiter, one cache, one transport
pub struct FetchPipeline {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    account: String,
    limiter: Arc<RateLimiter>,
    text_cache: RequestCache<Arc<str>>,
    json_cache: RequestCache<serde_json::Value>,
    config: EngineConfig,
}

impl FetchPipeline {
    /// Create a pipeline issuing requests on behalf of `account`
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(config.min_interval())),
            text_cache: RequestCache::new(config.cache_ttl()),
            json_cache: RequestCache::new(config.cache_ttl()),
            transport,
            credentials,
            account: account.into(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Forced refresh: forget every cached response
    pub async fn clear_cache(&self) {
        self.text_cache.clear().await;
        self.json_cache.clear().await;
    }

    /// Forget the cached responses for one path
    pub async fn invalidate(&self, path: &str) {
        let key = CacheKey::new(path, self.account.clone());
        self.text_cache.remove(&key).await;
        self.json_cache.remove(&key).await;
    }

    /// Cached, de-duplicated GET returning the raw body
    pub async fn get_text(&self, path: &str) -> FetchResult<Arc<str>> {
        self.cached_get(&self.text_cache, path, |body| Ok(Arc::from(body)))
            .await
    }

    /// Cached, de-duplicated GET parsed as JSON
    ///
    /// Parsing runs inside the shared operation, so a body that fails to
    /// decode settles as an error and is not kept.
    pub async fn get_json(&self, path: &str) -> FetchResult<serde_json::Value> {
        self.cached_get(&self.json_cache, path, |body| Ok(serde_json::from_str(&body)?))
            .await
    }

    async fn cached_get<T>(
        &self,
        cache: &RequestCache<T>,
        path: &str,
        parse: fn(String) -> FetchResult<T>,
    ) -> FetchResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = CacheKey::new(path, self.account.clone());
        let transport = Arc::clone(&self.transport);
        let credentials = Arc::clone(&self.credentials);
        let limiter = Arc::clone(&self.limiter);
        let account = self.account.clone();
        let path = path.to_string();

        cache
            .get(key, move || async move {
                let credential = resolve_credential(credentials.as_ref(), &account).await?;
                limiter.acquire().await;
                let body = dispatch_get(transport.as_ref(), &path, &credential).await?;
                parse(body)
            })
            .await
    }

    /// Rate-limited GET that bypasses the cache (status polling)
    pub async fn get_json_uncached(&self, path: &str) -> FetchResult<serde_json::Value> {
        let credential = resolve_credential(self.credentials.as_ref(), &self.account).await?;
        self.limiter.acquire().await;
        let body = dispatch_get(self.transport.as_ref(), path, &credential).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Rate-limited multipart POST
    pub async fn post_file(&self, path: &str, file: &UploadFile) -> FetchResult<serde_json::Value> {
        let credential = resolve_credential(self.credentials.as_ref(), &self.account).await?;
        self.limiter.acquire().await;
        debug!("Dispatching upload of {} to {}", file.name(), path);
        let resp = self.transport.post_multipart(path, &credential, file).await?;
        if !resp.is_success() {
            return Err(FetchError::Transport {
                status: resp.status,
                body: resp.body,
            });
        }
        Ok(serde_json::from_str(&resp.body)?)
    }
}

async fn resolve_credential(
    credentials: &dyn CredentialProvider,
    account: &str,
) -> FetchResult<Credential> {
    credentials
        .credential(account)
        .await
        .ok_or_else(|| FetchError::Credential(account.to_string()))
}

async fn dispatch_get(
    transport: &dyn Transport,
    path: &str,
    credential: &Credential,
) -> FetchResult<String> {
    debug!("Dispatching GET {}", path);
    let resp = transport.get(path, credential).await?;
    if resp.is_success() {
        Ok(resp.body)
    } else {
        Err(FetchError::Transport {
            status: resp.status,
            body: resp.body,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::transport::{StaticCredentials, TransportResponse};

    #[tokio::test(start_paused = true)]
    async fn test_get_json_caches_body() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/firms/1", TransportResponse::ok(r#"{"name":"Acme"}"#));
        let pipeline = pipeline_with(Arc::clone(&transport), EngineConfig::default());

        let first = pipeline.get_json("/firms/1").await.unwrap();
        let second = pipeline.get_json("/firms/1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.request_count(), 1);

        pipeline.clear_cache().await;
        pipeline.get_json("/firms/1").await.unwrap();
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_body_is_refetched() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue("/p", TransportResponse::ok("<html>gateway hiccup</html>"));
        transport.enqueue("/p", TransportResponse::ok("[1,2]"));
        let pipeline = pipeline_with(Arc::clone(&transport), EngineConfig::default());

        let err = pipeline.get_json("/p").await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
        assert_eq!(pipeline.get_json("/p").await.unwrap(), serde_json::json!([1, 2]));
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_success_status_maps_to_transport_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/firms/1", TransportResponse::new(403, "forbidden"));
        let pipeline = pipeline_with(transport, EngineConfig::default());

        let err = pipeline.get_json("/firms/1").await.unwrap_err();
        assert_eq!(err, FetchError::Transport { status: 403, body: "forbidden".to_string() });
        assert_eq!(err.status(), Some(403));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential() {
        let transport = Arc::new(ScriptedTransport::new());
        let pipeline = FetchPipeline::new(
            EngineConfig::default(),
            transport.clone(),
            Arc::new(StaticCredentials::new()),
            "nobody",
        );
        let err = pipeline.get_text("/x").await.unwrap_err();
        assert_eq!(err, FetchError::Credential("nobody".to_string()));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_requests_respect_min_interval() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/a", TransportResponse::ok("1"));
        transport.respond("/b", TransportResponse::ok("2"));
        let pipeline = pipeline_with(transport, EngineConfig::default());

        let start = tokio::time::Instant::now();
        pipeline.get_text("/a").await.unwrap();
        pipeline.get_text("/b").await.unwrap();
        assert!(start.elapsed() >= pipeline.config().min_interval());
    }
}
