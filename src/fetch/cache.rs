//! In-flight de-duplication and short-lived response cache

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{FetchError, FetchResult};

/// Request signature: path plus the identity of the credential used
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: String,
    account: String,
}

impl CacheKey {
    pub fn new(path: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            account: account.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.account)
    }
}

type SharedResult<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

struct CacheEntry<T: Clone> {
    generation: u64,
    created_at: Instant,
    result: SharedResult<T>,
}

impl<T: Clone> CacheEntry<T> {
    /// Pending entries are always joinable; settled ones only while fresh
    fn is_live(&self, ttl: Duration) -> bool {
        match self.result.peek() {
            None => true,
            Some(Ok(_)) => self.created_at.elapsed() < ttl,
            Some(Err(_)) => false,
        }
    }
}

/// Shares one in-flight operation between concurrent callers of the same key
/// and keeps successful results for `ttl`. Failures are never cached.
pub struct RequestCache<T: Clone> {
    entries: Arc<Mutex<HashMap<CacheKey, CacheEntry<T>>>>,
    ttl: Duration,
    next_generation: AtomicU64,
}

impl<T> RequestCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the pending or fresh result for `key`, or run `producer` and
    /// register it so later callers join the same operation.
    pub async fn get<F, Fut>(&self, key: CacheKey, producer: F) -> FetchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (shared, generation, owner) = {
            let mut entries = self.entries.lock().await;
            match entries.get(&key) {
                Some(entry) if entry.is_live(self.ttl) => {
                    debug!("Cache hit for {}", key);
                    (entry.result.clone(), entry.generation, false)
                }
                _ => {
                    debug!("Cache miss for {}", key);
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let shared = producer().boxed().shared();
                    entries.insert(
                        key.clone(),
                        CacheEntry {
                            generation,
                            created_at: Instant::now(),
                            result: shared.clone(),
                        },
                    );
                    (shared, generation, true)
                }
            }
        };

        let result = shared.await;
        if owner {
            self.settle(key, generation, &result).await;
        }
        result
    }

    async fn settle(&self, key: CacheKey, generation: u64, result: &Result<T, FetchError>) {
        match result {
            Err(_) => {
                let mut entries = self.entries.lock().await;
                if entries.get(&key).map(|e| e.generation) == Some(generation) {
                    entries.remove(&key);
                    debug!("Evicted failed entry {}", key);
                }
            }
            Ok(_) => {
                let entries = Arc::clone(&self.entries);
                let ttl = self.ttl;
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    let mut entries = entries.lock().await;
                    if entries.get(&key).map(|e| e.generation) == Some(generation) {
                        entries.remove(&key);
                        debug!("Evicted expired entry {}", key);
                    }
                });
            }
        }
    }

    /// Drop every entry; in-flight operations still complete for their waiters
    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        debug!("Clearing {} cache entries", entries.len());
        entries.clear();
    }

    /// Drop the entry for `key`, if any
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.entries.lock().await.remove(key).is_some();
        if removed {
            debug!("Invalidated {}", key);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_producer(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, FetchResult<String>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value.to_string())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_request() {
        let cache = Arc::new(RequestCache::<String>::new(Duration::from_secs(30)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let producer = counting_producer(&calls, "page");
            handles.push(tokio::spawn(async move {
                cache.get(CacheKey::new("/relations", "main"), producer).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "page");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_reused_within_ttl_and_refetched_after() {
        let cache = RequestCache::<String>::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("/relations", "main");

        cache.get(key.clone(), counting_producer(&calls, "a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        cache.get(key.clone(), counting_producer(&calls, "b")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        let value = cache.get(key, counting_producer(&calls, "c")).await.unwrap();
        assert_eq!(value, "c");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_cached() {
        let cache = RequestCache::<String>::new(Duration::from_secs(30));
        let key = CacheKey::new("/relations", "main");

        let err = cache
            .get(key.clone(), || async {
                Err(FetchError::Transport { status: 500, body: "boom".to_string() })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport { status: 500, .. }));
        assert!(cache.is_empty().await);

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache.get(key, counting_producer(&calls, "ok")).await.unwrap();
        assert_eq!(value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_forces_refetch() {
        let cache = RequestCache::<String>::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("/relations", "main");

        cache.get(key.clone(), counting_producer(&calls, "a")).await.unwrap();
        assert!(cache.remove(&key).await);
        assert!(!cache.remove(&key).await);
        let value = cache.get(key, counting_producer(&calls, "b")).await.unwrap();
        assert_eq!(value, "b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_propagates_to_all_waiters() {
        let cache = Arc::new(RequestCache::<String>::new(Duration::from_secs(30)));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get(CacheKey::new("/broken", "main"), || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(FetchError::Network("reset".to_string()))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(FetchError::Network("reset".to_string())));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_differ_by_account() {
        let cache = RequestCache::<String>::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get(CacheKey::new("/r", "a"), counting_producer(&calls, "x")).await.unwrap();
        cache.get(CacheKey::new("/r", "b"), counting_producer(&calls, "y")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_forces_fresh_attempt() {
        let cache = RequestCache::<String>::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("/r", "a");
        cache.get(key.clone(), counting_producer(&calls, "x")).await.unwrap();
        cache.clear().await;
        cache.get(key, counting_producer(&calls, "y")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_eviction_after_ttl() {
        let cache = RequestCache::<String>::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get(CacheKey::new("/r", "a"), counting_producer(&calls, "x")).await.unwrap();
        assert_eq!(cache.len().await, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.is_empty().await);
    }
}
