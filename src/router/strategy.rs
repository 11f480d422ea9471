//! Response strategies.
//!
//! Each strategy composes cache lookups and network fetches. Runtime
//! writes are fire-and-forget: the response is snapshotted, the snapshot
//! is persisted on a background task, and the original is returned
//! without waiting for storage.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::entry::{RequestKey, StoredResponse};
use crate::cache::manager::CacheStoreManager;
use crate::metrics::Metrics;
use crate::net::fetcher::{FetchError, Fetcher};
use crate::router::request::InterceptedRequest;
use crate::router::rules::{Route, Strategy};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptError {
    #[error("Network failed for {key} and no cached response exists: {source}")]
    Offline {
        key: RequestKey,
        #[source]
        source: FetchError,
    },

    #[error("Revalidation of {0} ended without a result")]
    RevalidationLost(RequestKey),
}

/// Tracks fire-and-forget work (runtime writes, revalidation) so the host
/// can wait for it.
#[derive(Default)]
pub struct BackgroundTasks {
    set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a task on the current runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        // Reap finished tasks so the set does not grow unbounded.
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Number of tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait until every task spawned so far, and any task they spawn,
    /// has finished.
    pub async fn settle(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.lock());
            if set.is_empty() {
                return;
            }
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Background task failed");
                }
            }
        }
    }
}

/// Executes strategies against the cache manager and the network.
#[derive(Clone)]
pub struct StrategyRunner {
    cache: Arc<CacheStoreManager>,
    fetcher: Arc<dyn Fetcher>,
    tasks: Arc<BackgroundTasks>,
    fallback_key: RequestKey,
    metrics: Option<Metrics>,
}

impl StrategyRunner {
    pub fn new(
        cache: Arc<CacheStoreManager>,
        fetcher: Arc<dyn Fetcher>,
        fallback_key: RequestKey,
    ) -> Self {
        Self {
            cache,
            fetcher,
            tasks: Arc::new(BackgroundTasks::default()),
            fallback_key,
            metrics: None,
        }
    }

    pub fn set_metrics(&mut self, metrics: Metrics) {
        self.metrics = Some(metrics);
    }

    pub fn tasks(&self) -> &Arc<BackgroundTasks> {
        &self.tasks
    }

    pub fn fallback_key(&self) -> &RequestKey {
        &self.fallback_key
    }

    pub async fn run(
        self,
        strategy: Strategy,
        route: Route,
        request: InterceptedRequest,
    ) -> Result<StoredResponse, InterceptError> {
        debug!(
            request_id = %request.id,
            url = %request.url,
            route = %route,
            strategy = ?strategy,
            "Handling intercepted request"
        );
        match strategy {
            Strategy::NetworkWithCacheFallback => {
                self.network_with_cache_fallback(route, request).await
            }
            Strategy::NetworkFirst { fallback_document } => {
                self.network_first(route, request, fallback_document).await
            }
            Strategy::CacheFirst => self.cache_first(route, request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(route, request).await,
        }
    }

    /// Network; on failure a cache lookup. Nothing is written.
    async fn network_with_cache_fallback(
        &self,
        route: Route,
        request: InterceptedRequest,
    ) -> Result<StoredResponse, InterceptError> {
        match self.fetcher.fetch(&request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.record_network_failure(route, &request, &e);
                let key = request.key();
                self.cached(route, &key).await.ok_or(InterceptError::Offline { key, source: e })
            }
        }
    }

    /// Network, persisted on success. On failure the cached entry for the
    /// request, then (for navigations) the fallback document.
    async fn network_first(
        &self,
        route: Route,
        request: InterceptedRequest,
        fallback_document: bool,
    ) -> Result<StoredResponse, InterceptError> {
        let key = request.key();
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                self.persist(key, &response);
                Ok(response)
            }
            Err(e) => {
                self.record_network_failure(route, &request, &e);
                if let Some(cached) = self.cached(route, &key).await {
                    return Ok(cached);
                }
                // The miss above is the only lookup recorded for this request.
                if fallback_document {
                    if let Some(doc) = self.cache.lookup_any(&self.fallback_key).await {
                        debug!(request_id = %request.id, fallback = %self.fallback_key, "Serving fallback document");
                        return Ok(doc);
                    }
                }
                Err(InterceptError::Offline { key, source: e })
            }
        }
    }

    /// Cache; on miss the network, persisted.
    async fn cache_first(
        &self,
        route: Route,
        request: InterceptedRequest,
    ) -> Result<StoredResponse, InterceptError> {
        let key = request.key();
        if let Some(cached) = self.cached(route, &key).await {
            return Ok(cached);
        }
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                self.persist(key, &response);
                Ok(response)
            }
            Err(e) => {
                self.record_network_failure(route, &request, &e);
                Err(InterceptError::Offline { key, source: e })
            }
        }
    }

    /// Cached entry right away; a network refresh is always issued. On a
    /// miss the refresh is awaited and becomes the response.
    async fn stale_while_revalidate(
        &self,
        route: Route,
        request: InterceptedRequest,
    ) -> Result<StoredResponse, InterceptError> {
        let key = request.key();
        let cached = self.cached(route, &key).await;

        let (tx, rx) = oneshot::channel();
        let fetcher = self.fetcher.clone();
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let revalidate_key = key.clone();
        self.tasks.spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(response) => {
                    let snapshot = response.snapshot();
                    // The receiver is gone when a cached entry was already served.
                    let _ = tx.send(Ok(response));
                    cache.put_runtime(revalidate_key, snapshot).await;
                }
                Err(e) => {
                    if let Some(m) = &metrics {
                        m.network_failures.with_label_values(&[route.as_str()]).inc();
                    }
                    debug!(request_id = %request.id, error = %e, "Revalidation failed");
                    let _ = tx.send(Err(e));
                }
            }
        });

        if let Some(cached) = cached {
            return Ok(cached);
        }
        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(InterceptError::Offline { key, source }),
            Err(_) => Err(InterceptError::RevalidationLost(key)),
        }
    }

    async fn cached(&self, route: Route, key: &RequestKey) -> Option<StoredResponse> {
        let found = self.cache.lookup_any(key).await;
        if let Some(m) = &self.metrics {
            let counter = if found.is_some() { &m.cache_hits } else { &m.cache_misses };
            counter.with_label_values(&[route.as_str()]).inc();
        }
        found
    }

    /// Snapshot the response and persist the copy in the background.
    fn persist(&self, key: RequestKey, response: &StoredResponse) {
        let snapshot = response.snapshot();
        let cache = self.cache.clone();
        self.tasks.spawn(async move {
            cache.put_runtime(key, snapshot).await;
        });
    }

    fn record_network_failure(&self, route: Route, request: &InterceptedRequest, error: &FetchError) {
        if let Some(m) = &self.metrics {
            m.network_failures.with_label_values(&[route.as_str()]).inc();
        }
        debug!(request_id = %request.id, url = %request.url, route = %route, error = %error, "Network fetch failed");
    }
}
