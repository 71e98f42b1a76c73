//! User-supplied activity behavior
//!
//! An activity is the enter/task/exit behavior a canary runs. The engine
//! dispatches on the `ActivityKind` discriminator exactly once, at plan
//! construction; adding a new variant means a new kind plus a delta
//! constructor in `plan.rs`, with no coordinator changes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use futures::future::BoxFuture;
use serde_json::Value;

/// Discriminator for activity variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    /// Simple callback-based activity: closures for enter/task/exit
    Callback,
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityKind::Callback => write!(f, "callback"),
        }
    }
}

/// Per-tick context handed to an activity's task
///
/// Carries the opaque trigger event/context payloads untouched, plus the
/// continuation switch a tick may flip to opt into another tick within the
/// same loop iteration.
#[derive(Debug)]
pub struct TaskEvents {
    event: Value,
    context: Value,
    repeat: AtomicBool,
}

impl TaskEvents {
    /// Create a tick context from opaque trigger payloads
    pub fn new(event: Value, context: Value) -> Self {
        Self {
            event,
            context,
            repeat: AtomicBool::new(false),
        }
    }

    /// The opaque trigger event payload
    pub fn event(&self) -> &Value {
        &self.event
    }

    /// The opaque trigger context payload
    pub fn context(&self) -> &Value {
        &self.context
    }

    /// Ask the schedule for another tick after this one
    pub fn request_repeat(&self) {
        self.repeat.store(true, Ordering::SeqCst);
    }

    /// Whether this tick opted into a follow-up tick
    pub fn repeat_requested(&self) -> bool {
        self.repeat.load(Ordering::SeqCst)
    }
}

impl Default for TaskEvents {
    fn default() -> Self {
        Self::new(Value::Null, Value::Null)
    }
}

/// Behavior contract consumed by the plan/task pipeline
///
/// Nothing else about the shape is assumed by the coordinator.
pub trait Activity: Send + Sync {
    /// Variant discriminator, resolved once at plan construction
    fn kind(&self) -> ActivityKind;

    /// Content contribution to the owning canary's identity
    fn hash(&self) -> String;

    /// Hook run when the activity's plan is first materialized
    fn enter(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Hook run when the activity's plan is torn down
    fn exit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One tick of the activity's work
    fn task<'a>(&'a self, events: &'a TaskEvents) -> BoxFuture<'a, anyhow::Result<()>>;
}

type EnterFn = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
type TaskFn =
    Box<dyn for<'a> Fn(&'a TaskEvents) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

/// The shipped activity variant: behavior supplied as closures
pub struct CallbackActivity {
    label: String,
    enter: Option<EnterFn>,
    exit: Option<EnterFn>,
    task: TaskFn,
}

impl CallbackActivity {
    /// Create an activity from a per-tick task closure
    pub fn new<F>(label: impl Into<String>, task: F) -> Self
    where
        F: for<'a> Fn(&'a TaskEvents) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            enter: None,
            exit: None,
            task: Box::new(task),
        }
    }

    /// Create an activity from a synchronous tick closure
    pub fn from_sync<F>(label: impl Into<String>, task: F) -> Self
    where
        F: Fn(&TaskEvents) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(label, move |events| {
            let result = task(events);
            Box::pin(async move { result })
        })
    }

    /// Attach an enter hook
    pub fn with_enter<F>(mut self, enter: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.enter = Some(Box::new(enter));
        self
    }

    /// Attach an exit hook
    pub fn with_exit<F>(mut self, exit: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.exit = Some(Box::new(exit));
        self
    }

    /// The activity's label
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Activity for CallbackActivity {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Callback
    }

    fn hash(&self) -> String {
        super::identity::hex_sha256(format!("{}:{}", self.kind(), self.label).as_bytes())
    }

    fn enter(&self) -> anyhow::Result<()> {
        match &self.enter {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }

    fn exit(&self) -> anyhow::Result<()> {
        match &self.exit {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }

    fn task<'a>(&'a self, events: &'a TaskEvents) -> BoxFuture<'a, anyhow::Result<()>> {
        (self.task)(events)
    }
}

impl fmt::Debug for CallbackActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackActivity")
            .field("label", &self.label)
            .field("has_enter", &self.enter.is_some())
            .field("has_exit", &self.exit.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_callback_activity_runs_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let activity = CallbackActivity::from_sync("counter", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let events = TaskEvents::default();
        activity.task(&events).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tick_can_request_repeat() {
        let activity = CallbackActivity::from_sync("repeater", |events| {
            events.request_repeat();
            Ok(())
        });

        let events = TaskEvents::default();
        assert!(!events.repeat_requested());
        activity.task(&events).await.unwrap();
        assert!(events.repeat_requested());
    }

    #[test]
    fn test_enter_exit_hooks_default_to_ok() {
        let activity = CallbackActivity::from_sync("noop", |_| Ok(()));
        assert!(activity.enter().is_ok());
        assert!(activity.exit().is_ok());
    }

    #[test]
    fn test_hash_is_stable_per_label() {
        let a = CallbackActivity::from_sync("x", |_| Ok(()));
        let b = CallbackActivity::from_sync("x", |_| Ok(()));
        let c = CallbackActivity::from_sync("y", |_| Ok(()));
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}
