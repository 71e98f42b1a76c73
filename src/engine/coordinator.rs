//! Lifecycle coordinator: registration queue, signal protocol, daemon loop
//!
//! The coordinator bridges two time domains: an external trigger that must
//! return quickly, and a background loop that runs every registered
//! activity to a safe stopping point before the trigger returns. One daemon
//! per process; all protocol state is owned here, never global.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::EngineConfig;
use super::activity::Activity;
use super::actor::{Actor, ActorFactory, MaterializeError};
use super::canary::{CanaryHandle, Registration, TriggerState};
use super::error::{EngineError, Result};
use super::identity::{CanaryIdentifiers, validate_name};
use super::resource_log::ResourceLog;
use super::signal::SignalSet;

/// The lifecycle coordinator handle
///
/// Cheap to clone; `register` enqueues canaries, the daemon spawned by
/// [`Coordinator::spawn`] drives them.
pub struct Coordinator {
    trigger: Arc<TriggerState>,
    registrations: mpsc::UnboundedSender<Registration>,
    daemon: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Coordinator {
    /// Spawn the daemon loop and return its handle
    pub fn spawn(config: EngineConfig, log: Arc<ResourceLog>) -> Self {
        let trigger = Arc::new(TriggerState::new(SignalSet::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let daemon = tokio::spawn(run_daemon(trigger.clone(), rx, config, log));

        Self {
            trigger,
            registrations: tx,
            daemon: Mutex::new(Some(daemon)),
        }
    }

    /// Register an activity under the given identity
    ///
    /// Builds the default actor factory: construction failure there is
    /// construction-class, so the daemon treats it as fatal. Fails if the
    /// coordinator has already exited.
    pub fn register(
        &self,
        identifiers: CanaryIdentifiers,
        activity: Arc<dyn Activity>,
    ) -> Result<CanaryHandle> {
        let ids = identifiers.clone();
        let factory: ActorFactory = Arc::new(move |event, context, log| {
            Actor::new(ids.clone(), activity.clone(), event, context, log)
                .map_err(MaterializeError::Fatal)
        });
        self.register_with_factory(identifiers, factory)
    }

    /// Register with a custom actor factory
    ///
    /// Custom factories may report `MaterializeError::Recoverable` to be
    /// skipped for one iteration instead of terminating the daemon.
    pub fn register_with_factory(
        &self,
        identifiers: CanaryIdentifiers,
        factory: ActorFactory,
    ) -> Result<CanaryHandle> {
        if self.trigger.signals.exit.is_open() {
            return Err(EngineError::CoordinatorClosed);
        }

        self.registrations
            .send(Registration {
                identifiers: identifiers.clone(),
                factory,
            })
            .map_err(|_| EngineError::CoordinatorClosed)?;

        tracing::debug!(canary = %identifiers, "registration enqueued");
        Ok(CanaryHandle::new(identifiers, self.trigger.clone()))
    }

    /// Suspend until the Exit latch opens
    pub async fn wait_for_exit(&self) {
        self.trigger.signals.exit.wait().await;
    }

    /// Wait for the daemon to finish and surface its result
    ///
    /// Configuration-class errors (duplicate or unsafe names) and fatal
    /// materialization failures propagate here.
    pub async fn join(&self) -> Result<()> {
        let handle = self.daemon.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(EngineError::Config(format!("daemon panicked: {err}"))),
            },
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

/// Validate a drained snapshot: unique, filesystem-safe names
///
/// Both failure modes are configuration errors; the daemon fails fast
/// rather than entering the iteration loop.
fn validate_snapshot(snapshot: &[Registration]) -> Result<()> {
    let mut seen = HashSet::new();
    for registration in snapshot {
        let name = registration.identifiers.name();
        validate_name(name)?;
        if !seen.insert(name.to_string()) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

async fn run_daemon(
    trigger: Arc<TriggerState>,
    mut rx: mpsc::UnboundedReceiver<Registration>,
    config: EngineConfig,
    log: Arc<ResourceLog>,
) -> Result<()> {
    let signals = trigger.signals.clone();

    // Step 1: wait for the first registration.
    let Some(first) = rx.recv().await else {
        signals.exit.open();
        return Ok(());
    };
    let mut pending = vec![first];

    // Step 2: fallback trigger for local/ad-hoc runs where no external
    // trigger ever arrives.
    let fallback = {
        let handler = signals.handler.clone();
        let delay = config.fallback_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::info!(waited_ms = delay.as_millis() as u64, "no external trigger, forcing iteration");
            handler.open();
        })
    };

    // Step 3: handshake with whichever trigger comes first.
    signals.ready.open();
    signals.handler.wait().await;
    fallback.abort();
    signals.handler.close();

    // Step 4: fixed snapshot of registrations, FIFO order.
    while let Ok(registration) = rx.try_recv() {
        pending.push(registration);
    }
    if let Err(err) = validate_snapshot(&pending) {
        tracing::error!(error = %err, "registration snapshot invalid, failing fast");
        signals.exit.open();
        return Err(err);
    }
    tracing::info!(canaries = pending.len(), "entering iteration loop");

    let running = Arc::new(AtomicBool::new(true));

    // Step 5: iteration loop.
    while running.load(Ordering::SeqCst) {
        signals.ready.close();

        let (event, context) = trigger.payload.lock().clone();

        // (b) Materialize an actor per registration.
        let mut actors = Vec::with_capacity(pending.len());
        for registration in &pending {
            match (registration.factory)(event.clone(), context.clone(), log.clone()) {
                Ok(actor) => actors.push(actor),
                Err(MaterializeError::Recoverable(err)) => {
                    tracing::warn!(
                        canary = %registration.identifiers.name(),
                        error = %format!("{err:#}"),
                        "actor materialization failed, skipping this iteration"
                    );
                }
                Err(MaterializeError::Fatal(err)) => {
                    tracing::error!(
                        canary = %registration.identifiers.name(),
                        error = %format!("{err:#}"),
                        "fatal actor materialization failure"
                    );
                    signals.exit.open();
                    return Err(EngineError::FatalMaterialization {
                        name: registration.identifiers.name().to_string(),
                        detail: format!("{err:#}"),
                    });
                }
            }
        }

        // (c) Drain every plan: concurrent across actors, sequential within
        // one actor. join_all is the fan-in barrier Done depends on.
        let tick_interval = config.tick_interval();
        futures::future::join_all(actors.iter().map(|actor| actor.drain(tick_interval))).await;

        // (d) All work settled.
        signals.done.open();

        // (e) Timeout watcher: an unanswered Done terminates the process.
        let watcher = {
            let signals = signals.clone();
            let running = running.clone();
            let timeout = config.handler_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                signals.ready.close();
                running.store(false, Ordering::SeqCst);
                signals.handler.open();
            })
        };

        // (f) Wait for either a genuine next trigger or the watcher.
        if running.load(Ordering::SeqCst) {
            // A waiting trigger consumes Done itself; with no consumer
            // (fallback-triggered iteration) the daemon resets it so the
            // next trigger cannot observe a stale open. The watcher opening
            // Handler bounds the wait even if the trigger was abandoned
            // between marking itself and consuming Done.
            if trigger.consumer_waiting.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = signals.done.wait_closed() => {}
                    _ = signals.handler.wait() => {}
                }
                signals.done.close();
            } else {
                signals.done.close();
            }

            signals.ready.open();
            signals.handler.wait().await;
            watcher.abort();
            signals.handler.close();
        } else {
            watcher.abort();
        }
    }

    // Step 6: grace window, then let the process go.
    tokio::time::sleep(config.grace()).await;
    tracing::info!("coordinator loop finished, opening exit");
    signals.exit.open();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(name: &str) -> Registration {
        Registration {
            identifiers: CanaryIdentifiers::from_name_only(name),
            factory: Arc::new(|_, _, _| {
                Err(MaterializeError::Recoverable(anyhow::anyhow!("unused")))
            }),
        }
    }

    #[test]
    fn test_snapshot_rejects_duplicates() {
        let snapshot = vec![registration("dup"), registration("other"), registration("dup")];
        assert!(matches!(
            validate_snapshot(&snapshot),
            Err(EngineError::DuplicateName(name)) if name == "dup"
        ));
    }

    #[test]
    fn test_snapshot_rejects_unsafe_names() {
        let snapshot = vec![registration("../escape")];
        assert!(matches!(
            validate_snapshot(&snapshot),
            Err(EngineError::Identity(_))
        ));
    }

    #[test]
    fn test_snapshot_accepts_unique_safe_names() {
        let snapshot = vec![registration("a"), registration("b-2"), registration("c_3")];
        assert!(validate_snapshot(&snapshot).is_ok());
    }
}
