//! One executable tick of an activity
//!
//! A `Task` binds an activity's per-tick delta to the schedule that decided
//! to produce it. Running the delta logs start/end timestamps, catches tick
//! errors (recoverable class), and advances the schedule unconditionally —
//! a single failing tick must not wedge the sequence.

use std::sync::Arc;
use chrono::Utc;

use super::activity::{Activity, TaskEvents};
use super::schedule::Schedule;

/// One tick of an activity, ready to execute
pub struct Task {
    name: String,
    activity: Arc<dyn Activity>,
    schedule: Schedule,
    events: Arc<TaskEvents>,
}

impl Task {
    /// Bind a tick to its activity, schedule, and trigger context
    pub fn new(
        name: impl Into<String>,
        activity: Arc<dyn Activity>,
        schedule: Schedule,
        events: Arc<TaskEvents>,
    ) -> Self {
        Self {
            name: name.into(),
            activity,
            schedule,
            events,
        }
    }

    /// The owning canary's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute the tick
    ///
    /// Returns whether the tick succeeded. The schedule is advanced with the
    /// tick's repeat request either way, including on error.
    pub async fn delta(&self) -> bool {
        let started = Utc::now();
        tracing::debug!(canary = %self.name, %started, "tick start");

        let outcome = self.activity.task(&self.events).await;

        let succeeded = match outcome {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    canary = %self.name,
                    error = %format!("{err:#}"),
                    "tick failed"
                );
                false
            }
        };

        // Advance even on error so the sequence cannot wedge.
        let events = self.events.clone();
        self.schedule.next(|| events.repeat_requested());

        let ended = Utc::now();
        tracing::debug!(
            canary = %self.name,
            %ended,
            elapsed_ms = (ended - started).num_milliseconds(),
            succeeded,
            "tick end"
        );

        succeeded
    }
}
