//! Canary registration items and the invocable trigger handle
//!
//! Registration is a two-phase API: `Coordinator::register` enqueues a
//! `Registration` and returns a `CanaryHandle`; invoking the handle is the
//! external-trigger side of the coordinator's signal protocol. At most one
//! invocation is in flight per process, enforced by a 1-permit semaphore.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use super::actor::ActorFactory;
use super::identity::CanaryIdentifiers;
use super::signal::SignalSet;

/// One pending registration: identity plus deferred actor construction
///
/// Enqueueing is cheap and side-effect-free; the factory is evaluated once
/// per loop iteration by the coordinator.
pub struct Registration {
    /// The canary's immutable identity
    pub identifiers: CanaryIdentifiers,
    /// Deferred, re-evaluable actor construction
    pub factory: ActorFactory,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("identifiers", &self.identifiers)
            .finish()
    }
}

/// Response returned to the serverless host or harness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerResponse {
    /// HTTP-style status code; 200-class once Done is observed
    pub status_code: u16,
    /// Structured response body
    pub body: Value,
}

/// Trigger-side state shared between handles and the coordinator daemon
#[derive(Debug)]
pub(crate) struct TriggerState {
    pub(crate) signals: SignalSet,
    pub(crate) permit: Semaphore,
    /// Opaque event/context of the in-flight trigger, read by the daemon
    /// when materializing actors
    pub(crate) payload: Mutex<(Value, Value)>,
    /// True while a trigger has opened Handler and awaits Done; tells the
    /// daemon whether Done will be consumed or must be reset by itself
    pub(crate) consumer_waiting: AtomicBool,
}

impl TriggerState {
    pub(crate) fn new(signals: SignalSet) -> Self {
        Self {
            signals,
            permit: Semaphore::new(1),
            payload: Mutex::new((Value::Null, Value::Null)),
            consumer_waiting: AtomicBool::new(false),
        }
    }
}

/// Clears the consumer mark and resets Done when the trigger side leaves
///
/// Hosts abandon `invoke` futures (their own timeouts abort them mid-await),
/// so the consumption of Done must happen on drop, not on the happy path:
/// otherwise the daemon waits forever for a consumer that no longer exists.
struct ConsumerGuard {
    trigger: Arc<TriggerState>,
}

impl ConsumerGuard {
    fn engage(trigger: Arc<TriggerState>) -> Self {
        trigger.consumer_waiting.store(true, Ordering::SeqCst);
        Self { trigger }
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.trigger.consumer_waiting.store(false, Ordering::SeqCst);
        // Consume Done whether the await finished or was abandoned; the next
        // trigger (serialized by the permit) must start with Done closed.
        self.trigger.signals.done.close();
    }
}

/// Invocable handle for one registered canary
///
/// Obtained from `Coordinator::register`; `invoke` runs the external-trigger
/// protocol: acquire the permit, await Ready, open Handler, await Done.
#[derive(Debug, Clone)]
pub struct CanaryHandle {
    identifiers: CanaryIdentifiers,
    trigger: Arc<TriggerState>,
}

impl CanaryHandle {
    pub(crate) fn new(identifiers: CanaryIdentifiers, trigger: Arc<TriggerState>) -> Self {
        Self {
            identifiers,
            trigger,
        }
    }

    /// The canary's immutable identity
    pub fn identifiers(&self) -> &CanaryIdentifiers {
        &self.identifiers
    }

    /// Trigger one coordinator iteration and wait for it to settle
    ///
    /// `event` and `context` are opaque payloads passed through untouched to
    /// the activities' tick context. A second concurrent invocation fails
    /// soft: logged, returned without effect, not an error to the caller.
    pub async fn invoke(&self, event: Value, context: Value) -> HandlerResponse {
        let signals = &self.trigger.signals;

        let _permit = match self.trigger.permit.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    canary = %self.identifiers.name(),
                    "concurrent handler invocation, returning without effect"
                );
                return self.response(false, "invocation already in flight");
            }
        };

        *self.trigger.payload.lock() = (event, context);

        tokio::select! {
            _ = signals.ready.wait() => {}
            _ = signals.exit.wait() => {
                return self.response(false, "engine exited before trigger was accepted");
            }
        }

        let guard = ConsumerGuard::engage(self.trigger.clone());
        signals.handler.open();

        tokio::select! {
            _ = signals.done.wait() => {}
            _ = signals.exit.wait() => {
                drop(guard);
                return self.response(false, "engine exited before iteration settled");
            }
        }

        // The guard consumes Done under the permit, abandoned or not.
        drop(guard);

        self.response(true, "iteration settled")
    }

    fn response(&self, triggered: bool, detail: &str) -> HandlerResponse {
        HandlerResponse {
            status_code: 200,
            body: json!({
                "canary": self.identifiers.name(),
                "triggered": triggered,
                "detail": detail,
                "at": Utc::now().to_rfc3339(),
            }),
        }
    }
}
