//! Shared fixtures: a scripted network and a fully wired router.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use url::Url;

use offline_tier::cache::entry::{RequestKey, StoredResponse};
use offline_tier::cache::manager::CacheStoreManager;
use offline_tier::cache::storage::{CacheStorage, MemoryStorage};
use offline_tier::config::Config;
use offline_tier::net::fetcher::{FetchError, Fetcher};
use offline_tier::router::request::InterceptedRequest;
use offline_tier::router::strategy::InterceptError;
use offline_tier::router::{Intercept, Router};

pub const ORIGIN: &str = "https://civicpol.example/";

pub fn url(target: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(target).unwrap()
}

pub fn key(target: &str) -> RequestKey {
    RequestKey::get(&url(target))
}

/// Network double: serves registered URLs, 404 otherwise, and can be
/// switched offline or held behind a gate.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, StoredResponse>>,
    offline: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, target: &str, response: StoredResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(url(target).to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold every fetch until the returned notifier fires.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &InterceptedRequest) -> Result<StoredResponse, FetchError> {
        self.calls.lock().unwrap().push(request.url.to_string());
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Unreachable(request.url.to_string()));
        }
        let found = self.responses.lock().unwrap().get(request.url.as_str()).cloned();
        Ok(found.unwrap_or_else(|| StoredResponse::new(404, vec![], "not found")))
    }
}

pub struct Harness {
    pub config: Arc<Config>,
    pub storage: Arc<dyn CacheStorage>,
    pub cache: Arc<CacheStoreManager>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub router: Router,
}

pub fn config() -> Config {
    let mut config = Config::with_default_manifest();
    config.routing.origin = Url::parse(ORIGIN).unwrap();
    config
}

pub fn harness() -> Harness {
    harness_with(config(), Arc::new(MemoryStorage::new()))
}

pub fn harness_with(config: Config, storage: Arc<dyn CacheStorage>) -> Harness {
    let config = Arc::new(config);
    let cache = Arc::new(CacheStoreManager::new(storage.clone(), &config.cache));
    let fetcher = Arc::new(ScriptedFetcher::new());
    let router = Router::new(&config, cache.clone(), fetcher.clone()).unwrap();
    Harness {
        config,
        storage,
        cache,
        fetcher,
        router,
    }
}

impl Harness {
    pub async fn seed_static(&self, target: &str, response: StoredResponse) {
        let partition = self.cache.open(self.cache.static_name()).await.unwrap();
        self.cache.put(&partition, key(target), response).await.unwrap();
    }

    pub async fn seed_runtime(&self, target: &str, response: StoredResponse) {
        assert!(self.cache.put_runtime(key(target), response).await);
    }

    /// Run a request that the router must intercept.
    pub async fn respond(&self, request: InterceptedRequest) -> Result<StoredResponse, InterceptError> {
        match self.router.intercept(request) {
            Intercept::Respond { response, .. } => response.await,
            Intercept::Passthrough(req) => panic!("{} was not intercepted", req.url),
        }
    }
}
