//! Lazy task sequence for one activity
//!
//! An `ExecutionPlan` turns one activity into a bounded sequence of ticks
//! per loop iteration: each `next_task` call captures an audit snapshot,
//! consults the schedule, and produces at most one `Task`. The activity
//! variant is resolved to a delta constructor exactly once, at plan
//! construction.

use std::sync::Arc;
use chrono::Utc;
use serde_json::{Value, json};

use super::activity::{Activity, ActivityKind, TaskEvents};
use super::identity::CanaryIdentifiers;
use super::resource_log::ResourceLog;
use super::schedule::Schedule;
use super::task::Task;

/// Constructs a task for one resolved activity variant
///
/// The dispatch point for new activity kinds: add a variant here and a match
/// arm in `DeltaCtor::resolve`; the coordinator never changes.
#[derive(Debug, Clone, Copy)]
enum DeltaCtor {
    Callback,
}

impl DeltaCtor {
    fn resolve(kind: ActivityKind) -> Self {
        match kind {
            ActivityKind::Callback => DeltaCtor::Callback,
        }
    }

    fn build(
        self,
        name: &str,
        activity: Arc<dyn Activity>,
        schedule: Schedule,
        events: Arc<TaskEvents>,
    ) -> Task {
        match self {
            DeltaCtor::Callback => Task::new(name, activity, schedule, events),
        }
    }
}

/// Produces the bounded sequence of tasks for one activity per iteration
pub struct ExecutionPlan {
    identifiers: CanaryIdentifiers,
    activity: Arc<dyn Activity>,
    schedule: Schedule,
    ctor: DeltaCtor,
    event: Value,
    context: Value,
    log: Arc<ResourceLog>,
}

impl ExecutionPlan {
    /// Build a plan for one activity
    ///
    /// Runs the activity's `enter` hook; a failing hook fails plan
    /// construction (construction-class, fatal to the caller).
    pub fn new(
        identifiers: CanaryIdentifiers,
        activity: Arc<dyn Activity>,
        event: Value,
        context: Value,
        log: Arc<ResourceLog>,
    ) -> anyhow::Result<Self> {
        let ctor = DeltaCtor::resolve(activity.kind());
        activity.enter()?;

        Ok(Self {
            identifiers,
            activity,
            schedule: Schedule::new(),
            ctor,
            event,
            context,
            log,
        })
    }

    /// The schedule bound to this plan
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Produce the next task, or `None` when the sequence ends
    ///
    /// Captures the materialization in the resource log; the audit write is
    /// part of producing the task, so a failed write fails the call.
    pub fn next_task(&self) -> anyhow::Result<Option<Task>> {
        if !self.schedule.proceed() {
            return Ok(None);
        }

        let task = self.log.capture(self.context_snapshot(), || {
            let events = Arc::new(TaskEvents::new(self.event.clone(), self.context.clone()));
            Ok(self.ctor.build(
                self.identifiers.name(),
                self.activity.clone(),
                self.schedule.clone(),
                events,
            ))
        })?;

        Ok(Some(task))
    }

    /// Run the activity's exit hook
    pub fn finish(&self) {
        if let Err(err) = self.activity.exit() {
            tracing::warn!(
                canary = %self.identifiers.name(),
                error = %format!("{err:#}"),
                "exit hook failed"
            );
        }
    }

    fn context_snapshot(&self) -> Value {
        json!({
            "canary": self.identifiers.name(),
            "hash": self.identifiers.short_hash(),
            "kind": self.activity.kind().to_string(),
            "at": Utc::now().to_rfc3339(),
        })
    }
}
