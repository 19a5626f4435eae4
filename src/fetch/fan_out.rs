//! Staggered per-entity fan-out with isolated failures

use futures::future::join_all;
use indexmap::IndexMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::{FetchError, FetchResult};

/// Per-id outcomes of a fan-out, in input order
#[derive(Debug)]
pub struct FanOutResult<K: Hash + Eq, V> {
    outcomes: IndexMap<K, FetchResult<V>>,
}

impl<K: Hash + Eq, V> FanOutResult<K, V> {
    pub fn get(&self, id: &K) -> Option<&FetchResult<V>> {
        self.outcomes.get(id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&K, &V)> {
        self.outcomes
            .iter()
            .filter_map(|(k, r)| r.as_ref().ok().map(|v| (k, v)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&K, &FetchError)> {
        self.outcomes
            .iter()
            .filter_map(|(k, r)| r.as_ref().err().map(|e| (k, e)))
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// True when some items came back without their enrichment
    pub fn is_degraded(&self) -> bool {
        self.failure_count() > 0
    }

    pub fn into_inner(self) -> IndexMap<K, FetchResult<V>> {
        self.outcomes
    }
}

/// Launches one operation per id, the i-th delayed by `i * stagger`
#[derive(Debug, Clone)]
pub struct FanOutFetcher {
    stagger: Duration,
}

impl FanOutFetcher {
    pub fn new(stagger: Duration) -> Self {
        Self { stagger }
    }

    pub fn stagger(&self) -> Duration {
        self.stagger
    }

    /// Run `per_item` for every distinct id. Each failure is recorded against
    /// its id; nothing is cancelled and the aggregate always succeeds.
    pub async fn fetch_many<K, V, F, Fut>(
        &self,
        ids: impl IntoIterator<Item = K>,
        per_item: F,
    ) -> FanOutResult<K, V>
    where
        K: Clone + Hash + Eq + Display,
        F: Fn(K) -> Fut,
        Fut: Future<Output = FetchResult<V>>,
    {
        let mut unique: IndexMap<K, ()> = IndexMap::new();
        for id in ids {
            unique.entry(id).or_insert(());
        }

        let start = Instant::now();
        let per_item = &per_item;
        let stagger = self.stagger;
        let tasks = unique.keys().cloned().enumerate().map(|(i, id)| async move {
            sleep_until(start + stagger * i as u32).await;
            debug!("Fan-out dispatch for {}", id);
            let outcome = per_item(id.clone()).await;
            (id, outcome)
        });

        let mut outcomes = IndexMap::with_capacity(unique.len());
        for (id, outcome) in join_all(tasks).await {
            if let Err(e) = &outcome {
                warn!("Fan-out item {} failed: {}", id, e);
            }
            outcomes.insert(id, outcome);
        }

        FanOutResult { outcomes }
    }

    /// Run a fan-out and one side-channel retrieval concurrently
    pub async fn fetch_many_with_side_channel<K, V, F, Fut, S, SFut>(
        &self,
        ids: impl IntoIterator<Item = K>,
        per_item: F,
        side_channel: SFut,
    ) -> (FanOutResult<K, V>, FetchResult<S>)
    where
        K: Clone + Hash + Eq + Display,
        F: Fn(K) -> Fut,
        Fut: Future<Output = FetchResult<V>>,
        SFut: Future<Output = FetchResult<S>>,
    {
        let (fan_out, side) = tokio::join!(self.fetch_many(ids, per_item), side_channel);
        if let Err(e) = &side {
            warn!("Side-channel retrieval failed: {}", e);
        }
        (fan_out, side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_is_isolated() {
        let fetcher = FanOutFetcher::new(Duration::from_millis(100));
        let start = Instant::now();
        let dispatched = Arc::new(Mutex::new(Vec::new()));

        let result = fetcher
            .fetch_many(vec!["a", "b", "c", "d", "e"], |id| {
                let dispatched = Arc::clone(&dispatched);
                async move {
                    dispatched.lock().unwrap().push((id, start.elapsed()));
                    if id == "c" {
                        Err(FetchError::Transport { status: 404, body: "unknown producer".into() })
                    } else {
                        Ok(id.to_uppercase())
                    }
                }
            })
            .await;

        assert_eq!(result.len(), 5);
        assert_eq!(result.success_count(), 4);
        assert_eq!(result.failure_count(), 1);
        assert!(matches!(result.get(&"c"), Some(Err(FetchError::Transport { status: 404, .. }))));
        assert_eq!(result.get(&"e").unwrap().as_ref().unwrap(), "E");
        assert!(result.is_degraded());

        let dispatched = dispatched.lock().unwrap();
        for (i, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let (_, at) = dispatched.iter().find(|(d, _)| d == id).unwrap();
            assert_eq!(*at, Duration::from_millis(100) * i as u32);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ids_run_once() {
        let fetcher = FanOutFetcher::new(Duration::from_millis(10));
        let calls = Arc::new(Mutex::new(0));
        let result = fetcher
            .fetch_many(vec![1, 2, 1, 3, 2], |id| {
                let calls = Arc::clone(&calls);
                async move {
                    *calls.lock().unwrap() += 1;
                    Ok::<_, FetchError>(id * 10)
                }
            })
            .await;
        assert_eq!(result.len(), 3);
        assert_eq!(*calls.lock().unwrap(), 3);
        let keys: Vec<i32> = result.into_inner().keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_side_channel_runs_in_parallel() {
        let fetcher = FanOutFetcher::new(Duration::from_millis(100));
        let start = Instant::now();

        let (fan_out, side) = fetcher
            .fetch_many_with_side_channel(
                vec!["x", "y"],
                |id| async move { Ok::<_, FetchError>(id.len()) },
                async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok("npn,name\n".to_string())
                },
            )
            .await;

        assert_eq!(fan_out.success_count(), 2);
        assert_eq!(side.unwrap(), "npn,name\n");
        assert_eq!(start.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_side_channel_failure_does_not_touch_fan_out() {
        let fetcher = FanOutFetcher::new(Duration::ZERO);
        let (fan_out, side) = fetcher
            .fetch_many_with_side_channel(
                vec!["x"],
                |id| async move { Ok::<_, FetchError>(id) },
                async { Err::<String, _>(FetchError::Network("reset".into())) },
            )
            .await;
        assert_eq!(fan_out.success_count(), 1);
        assert!(side.is_err());
    }
}
