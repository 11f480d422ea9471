//! Worker lifecycle: install, activate, control messages.
//!
//! Install populates the static partition from the asset manifest; activate
//! drops every partition the current version does not name and claims open
//! clients. The host drives both triggers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::cache::manager::{CacheStoreManager, PrecacheError};
use crate::cache::manifest::{AssetManifest, ManifestError};
use crate::cache::storage::CacheError;
use crate::config::Config;
use crate::net::fetcher::Fetcher;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Install failed: {0}")]
    Install(#[from] PrecacheError),

    #[error("Activation failed: {0}")]
    Activate(#[from] CacheError),

    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: WorkerState,
    },
}

impl From<ManifestError> for LifecycleError {
    fn from(e: ManifestError) -> Self {
        LifecycleError::Install(PrecacheError::Manifest(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Messages accepted on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    SkipWaiting,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "SKIP_WAITING" => Some(ControlMessage::SkipWaiting),
            _ => None,
        }
    }
}

/// The host's client-notification capability.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Take control of every open client. Returns how many were claimed.
    async fn claim(&self) -> Result<usize, String>;
}

/// Registry for hosts without client tracking.
#[derive(Debug, Default)]
pub struct NoClients;

#[async_trait]
impl ClientRegistry for NoClients {
    async fn claim(&self) -> Result<usize, String> {
        Ok(0)
    }
}

/// Drives the install/activate triggers against the cache manager.
pub struct Worker {
    config: Arc<Config>,
    cache: Arc<CacheStoreManager>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<dyn ClientRegistry>,
    state: RwLock<WorkerState>,
    skip_waiting: AtomicBool,
}

impl Worker {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<CacheStoreManager>,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<dyn ClientRegistry>,
    ) -> Self {
        Self {
            config,
            cache,
            fetcher,
            clients,
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    async fn transition(
        &self,
        action: &'static str,
        from: WorkerState,
        to: WorkerState,
    ) -> Result<(), LifecycleError> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(LifecycleError::InvalidState {
                action,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    /// Pre-cache the manifest into the static partition. All assets or
    /// none; a failed install makes the worker redundant.
    pub async fn install(&self) -> Result<usize, LifecycleError> {
        self.transition("install", WorkerState::Parsed, WorkerState::Installing)
            .await?;
        if self.config.lifecycle.skip_waiting_on_install {
            self.skip_waiting.store(true, Ordering::SeqCst);
        }

        let result = async {
            let manifest = AssetManifest::new(self.config.manifest.clone())?;
            let count = self
                .cache
                .precache(&manifest, &self.config.routing.origin, self.fetcher.as_ref())
                .await?;
            Ok::<_, LifecycleError>(count)
        }
        .await;

        let mut state = self.state.write().await;
        match result {
            Ok(count) => {
                *state = WorkerState::Installed;
                info!(assets = count, partition = %self.cache.static_name(), "Worker installed");
                Ok(count)
            }
            Err(e) => {
                *state = WorkerState::Redundant;
                error!(error = %e, "Worker install failed");
                Err(e)
            }
        }
    }

    /// Whether an installed worker may activate now: immediately when
    /// skip-waiting was requested, otherwise only once no client of the
    /// previous version remains.
    pub async fn may_activate(&self, has_existing_clients: bool) -> bool {
        self.state().await == WorkerState::Installed
            && (self.skip_waiting_requested() || !has_existing_clients)
    }

    /// Delete stale partitions and claim clients.
    pub async fn activate(&self) -> Result<Vec<String>, LifecycleError> {
        self.transition("activate", WorkerState::Installed, WorkerState::Activating)
            .await?;

        let known: HashSet<String> = self.config.cache.known_partitions().into_iter().collect();
        let purged = match self.cache.purge_unknown_partitions(&known).await {
            Ok(purged) => purged,
            Err(e) => {
                *self.state.write().await = WorkerState::Installed;
                return Err(e.into());
            }
        };

        if self.config.lifecycle.claim_clients {
            match self.clients.claim().await {
                Ok(claimed) => debug!(claimed, "Claimed clients"),
                Err(e) => warn!(error = %e, "Client claim failed; clients attach on next load"),
            }
        }

        *self.state.write().await = WorkerState::Activated;
        info!(purged = purged.len(), "Worker activated");
        Ok(purged)
    }

    /// Handle a control-channel message. Returns the recognised message.
    pub fn handle_message(&self, text: &str) -> Option<ControlMessage> {
        match ControlMessage::parse(text) {
            Some(ControlMessage::SkipWaiting) => {
                self.skip_waiting.store(true, Ordering::SeqCst);
                info!("Skip-waiting requested");
                Some(ControlMessage::SkipWaiting)
            }
            None => {
                debug!(message = text, "Ignoring unrecognised control message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_parse() {
        assert_eq!(ControlMessage::parse("SKIP_WAITING"), Some(ControlMessage::SkipWaiting));
        assert_eq!(ControlMessage::parse(" SKIP_WAITING\n"), Some(ControlMessage::SkipWaiting));
        assert_eq!(ControlMessage::parse("skip_waiting"), None);
        assert_eq!(ControlMessage::parse("CLAIM"), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Activated.to_string(), "activated");
    }
}
