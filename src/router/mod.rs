//! Request routing.
//!
//! - [`request`]: the intercepted request descriptor
//! - [`rules`]: ordered classification rules and host patterns
//! - [`strategy`]: cache-first / network-first / stale-while-revalidate execution

pub mod request;
pub mod rules;
pub mod strategy;

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::cache::entry::{RequestKey, StoredResponse};
use crate::cache::manager::CacheStoreManager;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::net::fetcher::Fetcher;
use request::InterceptedRequest;
use rules::{Classifier, Route};
use strategy::{BackgroundTasks, InterceptError, StrategyRunner};

/// Deferred response computation for an intercepted request.
pub type ResponseFuture = BoxFuture<'static, Result<StoredResponse, InterceptError>>;

/// The router's decision for one request.
pub enum Intercept {
    /// Not handled; the host dispatches the request itself.
    Passthrough(InterceptedRequest),
    /// Handled; the host waits for `response`.
    Respond {
        route: Route,
        response: ResponseFuture,
    },
}

impl std::fmt::Debug for Intercept {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intercept::Passthrough(req) => f.debug_tuple("Passthrough").field(&req.url.as_str()).finish(),
            Intercept::Respond { route, .. } => f.debug_struct("Respond").field("route", route).finish(),
        }
    }
}

/// Classifies requests and dispatches them to their strategy.
#[derive(Clone)]
pub struct Router {
    classifier: Arc<Classifier>,
    runner: StrategyRunner,
    metrics: Option<Metrics>,
}

impl Router {
    pub fn new(
        config: &Config,
        cache: Arc<CacheStoreManager>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, url::ParseError> {
        let classifier = Classifier::new(&config.routing, &config.manifest);
        let fallback_key =
            RequestKey::for_path(&config.routing.origin, &config.routing.fallback_document)?;
        Ok(Self {
            classifier: Arc::new(classifier),
            runner: StrategyRunner::new(cache, fetcher, fallback_key),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.runner.set_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Decide synchronously whether to handle `request`; the response
    /// itself resolves later.
    pub fn intercept(&self, request: InterceptedRequest) -> Intercept {
        let Some(route) = self.classifier.classify(&request) else {
            debug!(request_id = %request.id, method = %request.method, url = %request.url, "Not intercepted");
            return Intercept::Passthrough(request);
        };
        if let Some(m) = &self.metrics {
            m.routed.with_label_values(&[route.as_str()]).inc();
        }
        let runner = self.runner.clone();
        Intercept::Respond {
            route,
            response: Box::pin(runner.run(route.strategy(), route, request)),
        }
    }

    /// Background work (runtime writes, revalidation) spawned so far.
    pub fn background(&self) -> &Arc<BackgroundTasks> {
        self.runner.tasks()
    }

    /// Wait for all background work to finish.
    pub async fn settle(&self) {
        self.runner.tasks().settle().await;
    }
}
