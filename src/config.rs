//! Runtime configuration for offline-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Partition names, the runtime entry limit and the routing tables all live
//! here and are threaded into the cache manager and router at construction.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::router::rules::HostPattern;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "offline-tier", about = "Offline-capable caching front for a web application")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP front settings.
    pub server: ServerConfig,

    /// Partition naming and runtime cache bounds.
    pub cache: CacheConfig,

    /// Request classification tables.
    pub routing: RoutingConfig,

    /// Paths pre-cached into the static partition at install.
    pub manifest: Vec<String>,

    /// Install/activate behaviour.
    pub lifecycle: LifecycleConfig,
}

/// HTTP front settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8088").
    pub listen: String,

    /// Upstream request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8088".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Cache partition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Application prefix shared by every partition name.
    pub name_prefix: String,

    /// Version tag. Changing it supersedes both partitions wholesale.
    pub version: String,

    /// Maximum number of entries kept in the runtime partition.
    pub max_runtime_entries: usize,

    /// Directory holding persisted partitions.
    pub storage_path: PathBuf,

    /// zstd level for persisted response bodies (1-22).
    pub zstd_level: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name_prefix: "civicpol".to_string(),
            version: "v7".to_string(),
            max_runtime_entries: 150,
            storage_path: PathBuf::from("/tmp/offline-tier"),
            zstd_level: 3,
        }
    }
}

impl CacheConfig {
    /// Name of the pre-populated, immutable partition.
    pub fn static_partition(&self) -> String {
        format!("{}-static-{}", self.name_prefix, self.version)
    }

    /// Name of the dynamically populated, size-bounded partition.
    pub fn runtime_partition(&self) -> String {
        format!("{}-runtime-{}", self.name_prefix, self.version)
    }

    /// The partition names that survive activation.
    pub fn known_partitions(&self) -> Vec<String> {
        vec![self.static_partition(), self.runtime_partition()]
    }
}

/// Request classification tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// The application's own origin. Same-origin rules compare against it.
    pub origin: Url,

    /// Path prefix designating API endpoints.
    pub api_prefix: String,

    /// Path prefix designating user uploads.
    pub uploads_prefix: String,

    /// Document served to offline navigations with no cached match.
    pub fallback_document: String,

    /// Translation-service hosts: network only, cache lookup on failure.
    pub translate_hosts: Vec<HostPattern>,

    /// Third-party static hosts (CDN, fonts, map tiles): stale-while-revalidate.
    pub static_hosts: Vec<HostPattern>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://127.0.0.1:3000/").expect("static default origin parses"),
            api_prefix: "/api/".to_string(),
            uploads_prefix: "/uploads/".to_string(),
            fallback_document: "/index.html".to_string(),
            translate_hosts: vec![
                HostPattern::label_sequence("translate.google"),
                HostPattern::suffix("translate.gstatic.com"),
            ],
            static_hosts: vec![
                HostPattern::suffix("unpkg.com"),
                HostPattern::suffix("cdn.jsdelivr.net"),
                HostPattern::suffix("fonts.googleapis.com"),
                HostPattern::suffix("fonts.gstatic.com"),
                HostPattern::suffix("tile.openstreetmap.org"),
            ],
        }
    }
}

/// Install/activate behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Skip the waiting phase as soon as install starts.
    pub skip_waiting_on_install: bool,

    /// Take control of already-open clients on activation.
    pub claim_clients: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            skip_waiting_on_install: true,
            claim_clients: true,
        }
    }
}

/// The asset list pre-cached by default.
pub fn default_manifest() -> Vec<String> {
    [
        "/",
        "/index.html",
        "/reports.html",
        "/case.html",
        "/admin.html",
        "/style.css",
        "/manifest.json",
        "/cp-logo.svg",
        "/cp-logo-compact.svg",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

impl Config {
    /// Default configuration with the stock asset manifest filled in.
    pub fn with_default_manifest() -> Self {
        Self {
            manifest: default_manifest(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let mut config: Config = serde_json::from_str(&data)?;
            if config.manifest.is_empty() {
                config.manifest = default_manifest();
            }
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::with_default_manifest())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_partition_names() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.static_partition(), "civicpol-static-v7");
        assert_eq!(cfg.cache.runtime_partition(), "civicpol-runtime-v7");
        assert_eq!(cfg.cache.max_runtime_entries, 150);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "cache": { "version": "v8" } }"#).unwrap();
        assert_eq!(cfg.cache.runtime_partition(), "civicpol-runtime-v8");
        assert_eq!(cfg.routing.api_prefix, "/api/");
        assert_eq!(cfg.routing.static_hosts.len(), 5);
    }

    #[test]
    fn test_missing_file_uses_default_manifest() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/offline-tier.json")).unwrap();
        assert_eq!(cfg.manifest.len(), 9);
        assert_eq!(cfg.manifest[0], "/");
    }
}
