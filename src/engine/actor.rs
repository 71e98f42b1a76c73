//! Runtime binding of one registration to its execution plan
//!
//! An `Actor` is materialized fresh each loop iteration from the
//! registration's deferred factory. It captures structured creation context
//! for the audit trail and drains its plan's task sequence to exhaustion.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use serde_json::{Value, json};

use super::activity::Activity;
use super::identity::CanaryIdentifiers;
use super::plan::ExecutionPlan;
use super::resource_log::ResourceLog;

/// Why an actor factory refused to materialize
///
/// Recoverable failures skip the actor for one iteration; fatal ones
/// terminate the coordinator (Exit opens, the error re-raises).
#[derive(Debug)]
pub enum MaterializeError {
    /// Log and skip this actor for the current iteration
    Recoverable(anyhow::Error),
    /// Open Exit and re-raise
    Fatal(anyhow::Error),
}

impl std::fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaterializeError::Recoverable(e) => write!(f, "recoverable: {e:#}"),
            MaterializeError::Fatal(e) => write!(f, "fatal: {e:#}"),
        }
    }
}

/// Deferred actor construction, evaluated once per loop iteration
pub type ActorFactory = Arc<
    dyn Fn(Value, Value, Arc<ResourceLog>) -> Result<Actor, MaterializeError> + Send + Sync,
>;

/// One registration's identity bound to its live plan
pub struct Actor {
    identifiers: CanaryIdentifiers,
    plan: ExecutionPlan,
    created: Value,
}

impl Actor {
    /// Materialize an actor for one iteration
    ///
    /// Plan construction (including the activity's `enter` hook) runs under
    /// a resource-log capture, so every materialization leaves an audit row.
    pub fn new(
        identifiers: CanaryIdentifiers,
        activity: Arc<dyn Activity>,
        event: Value,
        context: Value,
        log: Arc<ResourceLog>,
    ) -> anyhow::Result<Self> {
        let created = json!({
            "actor": identifiers.name(),
            "hash": identifiers.short_hash(),
            "path": identifiers.path().display().to_string(),
            "created_at": Utc::now().to_rfc3339(),
        });

        let plan = log.capture(created.clone(), || {
            ExecutionPlan::new(
                identifiers.clone(),
                activity,
                event,
                context,
                log.clone(),
            )
        })?;

        Ok(Self {
            identifiers,
            plan,
            created,
        })
    }

    /// The actor's immutable identity
    pub fn identifiers(&self) -> &CanaryIdentifiers {
        &self.identifiers
    }

    /// The context snapshot captured at creation
    pub fn created(&self) -> &Value {
        &self.created
    }

    /// The actor's plan
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Drain the plan's task sequence to exhaustion
    ///
    /// Ticks are strictly sequential for one actor, separated by the fixed
    /// tick interval. A delta failure is already logged by the task; an
    /// audit-write failure ends the sequence for this iteration. Returns the
    /// number of ticks executed.
    pub async fn drain(&self, tick_interval: Duration) -> usize {
        let mut ticks = 0usize;

        loop {
            let task = match self.plan.next_task() {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(
                        actor = %self.identifiers.name(),
                        error = %format!("{err:#}"),
                        "task materialization failed, ending sequence for this iteration"
                    );
                    break;
                }
            };

            task.delta().await;
            ticks += 1;

            tokio::time::sleep(tick_interval).await;
        }

        self.plan.finish();
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::activity::CallbackActivity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn scratch_log() -> (TempDir, Arc<ResourceLog>) {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(ResourceLog::create(temp.path(), "actor-test").unwrap());
        (temp, log)
    }

    #[tokio::test]
    async fn test_drain_runs_one_tick_by_default() {
        let (_temp, log) = scratch_log();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let actor = Actor::new(
            CanaryIdentifiers::from_name_only("single"),
            Arc::new(CallbackActivity::from_sync("single", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            Value::Null,
            Value::Null,
            log,
        )
        .unwrap();

        let ticks = actor.drain(Duration::from_millis(1)).await;
        assert_eq!(ticks, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_follows_repeat_requests() {
        let (_temp, log) = scratch_log();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let actor = Actor::new(
            CanaryIdentifiers::from_name_only("multi"),
            Arc::new(CallbackActivity::from_sync("multi", move |events| {
                // Three ticks, then stop
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    events.request_repeat();
                }
                Ok(())
            })),
            Value::Null,
            Value::Null,
            log,
        )
        .unwrap();

        let ticks = actor.drain(Duration::from_millis(1)).await;
        assert_eq!(ticks, 3);
    }

    #[tokio::test]
    async fn test_materialization_leaves_audit_row() {
        let (_temp, log) = scratch_log();

        let _actor = Actor::new(
            CanaryIdentifiers::from_name_only("audited"),
            Arc::new(CallbackActivity::from_sync("audited", |_| Ok(()))),
            Value::Null,
            Value::Null,
            log.clone(),
        )
        .unwrap();

        let data = std::fs::read_to_string(log.path()).unwrap();
        assert!(data.contains("audited"));
    }
}
