//! Prometheus counters for routing and cache activity.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters shared by the cache manager and the router.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub routed: IntCounterVec,
    pub cache_hits: IntCounterVec,
    pub cache_misses: IntCounterVec,
    pub network_failures: IntCounterVec,
    pub runtime_writes: IntCounter,
    pub write_failures: IntCounter,
    pub evictions: IntCounter,
    pub eviction_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("offline_tier".to_string()), None)?;

        let routed = IntCounterVec::new(
            Opts::new("requests_routed_total", "Intercepted requests by route"),
            &["route"],
        )?;
        let cache_hits = IntCounterVec::new(
            Opts::new("cache_hits_total", "Cache lookups that found an entry"),
            &["route"],
        )?;
        let cache_misses = IntCounterVec::new(
            Opts::new("cache_misses_total", "Cache lookups that found nothing"),
            &["route"],
        )?;
        let network_failures = IntCounterVec::new(
            Opts::new("network_failures_total", "Network fetches that failed"),
            &["route"],
        )?;
        let runtime_writes =
            IntCounter::new("runtime_writes_total", "Responses persisted to the runtime partition")?;
        let write_failures =
            IntCounter::new("runtime_write_failures_total", "Swallowed runtime write failures")?;
        let evictions = IntCounter::new("evictions_total", "Entries evicted from the runtime partition")?;
        let eviction_failures =
            IntCounter::new("eviction_failures_total", "Eviction cycles aborted by a failed delete")?;

        registry.register(Box::new(routed.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(network_failures.clone()))?;
        registry.register(Box::new(runtime_writes.clone()))?;
        registry.register(Box::new(write_failures.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(eviction_failures.clone()))?;

        Ok(Self {
            registry,
            routed,
            cache_hits,
            cache_misses,
            network_failures,
            runtime_writes,
            write_failures,
            evictions,
            eviction_failures,
        })
    }

    /// Render every counter in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_prefixed_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.routed.with_label_values(&["api"]).inc();
        metrics.evictions.inc_by(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("offline_tier_requests_routed_total{route=\"api\"} 1"));
        assert!(text.contains("offline_tier_evictions_total 2"));
    }
}
