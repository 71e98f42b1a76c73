//! Vigil – a canary execution engine for continuously exercised probes
//!
//! This crate implements a canary execution engine with:
//! - A lifecycle coordinator gating iterations on a four-latch signal
//!   protocol (Ready, Handler, Done, Exit) with no process-global state
//! - A two-phase registration API producing invocable canary handles for
//!   serverless-style external triggers, plus a jittered fallback trigger
//!   for ad-hoc local runs
//! - Activities drained as plans of single-tick tasks, with per-tick opt-in
//!   to multi-tick execution
//! - A durable work-queue state machine over an embedded store, committing
//!   every transition before the target state runs
//! - An append-only resource log pairing every acquisition with its release
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::engine::activity::CallbackActivity;
//! use vigil::engine::identity::CanaryIdentifiers;
//! use vigil::{Engine, EngineConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Engine::new(EngineConfig::default())?;
//!
//! let activity = Arc::new(CallbackActivity::from_sync("heartbeat", |_events| Ok(())));
//! let handle = engine.coordinator().register(
//!     CanaryIdentifiers::from_name_only("heartbeat"),
//!     activity,
//! )?;
//!
//! let response = handle.invoke(serde_json::json!({}), serde_json::json!({})).await;
//! assert_eq!(response.status_code, 200);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine core modules implementing the canary lifecycle
pub mod engine;

// Re-export key types for convenience
pub use engine::{Engine, EngineConfig};

/// Current version of the Vigil engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for host binaries and harnesses
///
/// Respects `RUST_LOG`, defaulting to `info`. Safe to call once per process;
/// embedders with their own subscriber should skip it.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}
