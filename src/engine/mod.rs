//! Engine orchestrator and public API
//!
//! This module provides the main `Engine` struct that assembles storage, the
//! coordinator daemon, and the coordinator's resource-log scope, and exposes
//! the public interface for embedding the engine in a host process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};

// Submodules
pub mod activity;
pub mod actor;
pub mod canary;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod plan;
pub mod resource_log;
pub mod schedule;
pub mod signal;
pub mod storage;
pub mod task;
pub mod workqueue;

/// Configuration for the Vigil engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for engine storage (default: .vigil/)
    pub root: PathBuf,

    /// Whether the engine runs under a serverless host
    ///
    /// Hosted processes wait longer before the fallback trigger fires, since
    /// an external trigger is expected.
    pub hosted: bool,

    /// Pause between tasks when draining a plan, in milliseconds
    pub tick_interval_ms: u64,

    /// How long an opened Done latch may go unanswered before the loop
    /// stops, in milliseconds
    pub handler_timeout_ms: u64,

    /// Grace window between leaving the loop and opening Exit, in
    /// milliseconds
    pub grace_ms: u64,

    /// Width of the fallback-trigger jitter window, in milliseconds
    pub fallback_bound_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".vigil"),
            hosted: false,
            tick_interval_ms: 100,
            handler_timeout_ms: 30_000,
            grace_ms: 250,
            fallback_bound_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `VIGIL_*` environment variables
    ///
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn parsed<T: std::str::FromStr>(var: &str, default: T) -> T {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Self {
            root: std::env::var("VIGIL_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
            hosted: parsed("VIGIL_HOSTED", defaults.hosted),
            tick_interval_ms: parsed("VIGIL_TICK_INTERVAL_MS", defaults.tick_interval_ms),
            handler_timeout_ms: parsed("VIGIL_HANDLER_TIMEOUT_MS", defaults.handler_timeout_ms),
            grace_ms: parsed("VIGIL_GRACE_MS", defaults.grace_ms),
            fallback_bound_ms: parsed("VIGIL_FALLBACK_BOUND_MS", defaults.fallback_bound_ms),
        }
    }

    /// Pause between tasks when draining a plan
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// How long an opened Done latch may go unanswered
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Grace window before Exit opens
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Delay before the fallback trigger fires
    ///
    /// Jittered within `fallback_bound_ms` so colocated processes do not
    /// force their iterations in lockstep. Hosted processes get a longer
    /// base, giving the expected external trigger time to arrive.
    pub fn fallback_delay(&self) -> Duration {
        let base = if self.hosted { 2_000 } else { 500 };
        let jitter = if self.fallback_bound_ms == 0 {
            0
        } else {
            // Subsecond clock noise stands in for a proper RNG here; the
            // spread only needs to break lockstep, not be uniform.
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos() as u64)
                .unwrap_or(0);
            nanos % self.fallback_bound_ms
        };
        Duration::from_millis(base + jitter)
    }
}

use coordinator::Coordinator;
use error::Result;
use resource_log::ResourceLog;
use storage::Storage;

/// The main engine orchestrator
///
/// Owns storage, the coordinator daemon, and the coordinator's resource-log
/// scope. All state lives here; nothing is process-global.
pub struct Engine {
    config: EngineConfig,
    storage: Storage,
    log: Arc<ResourceLog>,
    coordinator: Coordinator,
}

impl Engine {
    /// Create a new engine with the given configuration
    ///
    /// Initializes the storage layout, opens the coordinator's resource-log
    /// scope, and spawns the daemon. Scope creation failure is fatal: the
    /// audit trail is a correctness requirement, not telemetry.
    pub fn new(config: EngineConfig) -> Result<Self> {
        storage::init_storage(&config.root)?;
        let storage = Storage::new(config.root.clone());

        let log = Arc::new(ResourceLog::create(
            &storage.resourcelog_dir(),
            "coordinator",
        )?);

        let coordinator = Coordinator::spawn(config.clone(), log.clone());

        tracing::info!(root = %config.root.display(), hosted = config.hosted, "engine started");

        Ok(Self {
            config,
            storage,
            log,
            coordinator,
        })
    }

    /// Initialize engine storage directories and persist the configuration
    pub fn init(config: &EngineConfig) -> Result<()> {
        storage::init_storage(&config.root)?;
        storage::write_config(config)?;
        Ok(())
    }

    /// Load an engine from a previously initialized root
    pub fn load(root: &std::path::Path) -> Result<Self> {
        let config = storage::load_config(root)?;
        Self::new(config)
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The storage layout manager
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The coordinator's resource-log scope
    pub fn resource_log(&self) -> &Arc<ResourceLog> {
        &self.log
    }

    /// The lifecycle coordinator
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Open a work-queue store scoped to one canary identity
    pub fn workqueue_store(
        &self,
        identifiers: &identity::CanaryIdentifiers,
    ) -> Result<workqueue::WorkStore> {
        let path = self.storage.workqueue_db_path(identifiers);
        Ok(workqueue::WorkStore::open(&path)?)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.root, PathBuf::from(".vigil"));
        assert!(!config.hosted);
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_hosted_fallback_is_longer() {
        let local = EngineConfig::default();
        let hosted = EngineConfig {
            hosted: true,
            ..EngineConfig::default()
        };

        // Jitter spans at most fallback_bound_ms, so the hosted floor
        // always clears the local ceiling here.
        assert!(hosted.fallback_delay() >= Duration::from_millis(2_000));
        assert!(local.fallback_delay() < Duration::from_millis(500 + local.fallback_bound_ms));
    }

    #[tokio::test]
    async fn test_engine_new_initializes_layout() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = EngineConfig {
            root: temp.path().join("data"),
            ..EngineConfig::default()
        };

        let engine = Engine::new(config).unwrap();
        assert!(engine.storage().workqueue_dir().exists());
        assert!(engine.storage().resourcelog_dir().exists());
    }

    #[tokio::test]
    async fn test_init_then_load_round_trips_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = EngineConfig {
            root: temp.path().join("data"),
            hosted: true,
            ..EngineConfig::default()
        };

        Engine::init(&config).unwrap();
        let engine = Engine::load(&config.root).unwrap();
        assert!(engine.config().hosted);
    }
}
