//! Durable state-machine executor over the embedded work store
//!
//! A `StateMachine` is a named set of state handlers plus optional prepare
//! and resolve hooks. Each `run` dequeues (or creates) one work item and
//! steps it until a terminal action, a pass-through action, or an error.
//! Every transition target is committed before the target handler runs, so
//! a crashed run resumes from its last committed state.

pub mod action;
pub mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use super::error::{WorkQueueError, WorkQueueResult};
pub use action::TestAction;
pub use store::{WorkExecutionRow, WorkRow, WorkStore};

/// Everything a state handler sees for one invocation
///
/// Owned snapshot; handlers are free to move it into their futures.
pub struct StepContext<C> {
    /// The work row being driven
    pub work_id: i64,
    /// The state whose handler is running
    pub state: String,
    /// Output of the prepare hook, fixed at enqueue time
    pub prepared: Option<Value>,
    /// Output of the resolve hook, fixed per run
    pub resolved: Option<Value>,
    /// The action that led into this state, if any
    pub previous: Option<TestAction>,
    /// Shared clients handed to the machine at construction
    pub clients: Arc<C>,
}

impl<C> Clone for StepContext<C> {
    fn clone(&self) -> Self {
        Self {
            work_id: self.work_id,
            state: self.state.clone(),
            prepared: self.prepared.clone(),
            resolved: self.resolved.clone(),
            previous: self.previous.clone(),
            clients: self.clients.clone(),
        }
    }
}

impl<C> std::fmt::Debug for StepContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("work_id", &self.work_id)
            .field("state", &self.state)
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

type Handler<C> =
    Box<dyn Fn(StepContext<C>) -> BoxFuture<'static, anyhow::Result<TestAction>> + Send + Sync>;
type Cleanup<C> =
    Box<dyn Fn(StepContext<C>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type Hook<C> =
    Box<dyn Fn(Arc<C>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Bound on consecutive retry actions before a run is failed
///
/// `None` leaves retries unbounded; the timeout watcher in the coordinator
/// is then the only backstop.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    /// Maximum consecutive retries, or unbounded
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    /// Cap consecutive retries at `limit`
    pub fn limited(limit: u32) -> Self {
        Self {
            max_retries: Some(limit),
        }
    }
}

/// Outcome of one executor run
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// The work item reached a terminal pass
    Passed(Value),
    /// The work item reached a terminal failure
    Failed(Option<String>),
    /// A pass-through action ended the run; the same state re-runs next tick
    Pending,
}

/// Summary of one executor run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The work row that was driven
    pub work_id: i64,
    /// How the run ended
    pub status: RunStatus,
    /// Handler invocations in this run
    pub transitions: u32,
}

struct StateEntry<C> {
    handler: Handler<C>,
    cleanup: Option<Cleanup<C>>,
}

/// A durable state machine bound to a set of shared clients
pub struct StateMachine<C = ()> {
    name: String,
    entry: String,
    clients: Arc<C>,
    prepare: Option<Hook<C>>,
    resolve: Option<Hook<C>>,
    states: HashMap<String, StateEntry<C>>,
    retry_policy: RetryPolicy,
}

impl<C: Send + Sync + 'static> StateMachine<C> {
    /// Create a machine with the given entry state and shared clients
    pub fn new(name: impl Into<String>, entry: impl Into<String>, clients: C) -> Self {
        Self {
            name: name.into(),
            entry: entry.into(),
            clients: Arc::new(clients),
            prepare: None,
            resolve: None,
            states: HashMap::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Machine name, used in trace output
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the prepare hook, run once when a work item is first created
    ///
    /// Its output is persisted on the work row and visible to every state
    /// for the item's whole lifetime.
    pub fn with_prepare<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.prepare = Some(Box::new(move |clients| Box::pin(hook(clients))));
        self
    }

    /// Install the resolve hook, run once per executor run
    ///
    /// Its output is not persisted on the work row; each execution row
    /// records the value it saw.
    pub fn with_resolve<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.resolve = Some(Box::new(move |clients| Box::pin(hook(clients))));
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Register a state handler
    pub fn state<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StepContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TestAction>> + Send + 'static,
    {
        self.states.insert(
            name.into(),
            StateEntry {
                handler: Box::new(move |ctx| Box::pin(handler(ctx))),
                cleanup: None,
            },
        );
        self
    }

    /// Register a state handler with a cleanup hook
    ///
    /// The cleanup runs after the work item completes in this state, on both
    /// pass and fail. Cleanup errors are logged, never propagated.
    pub fn state_with_cleanup<F, Fut, G, GFut>(
        mut self,
        name: impl Into<String>,
        handler: F,
        cleanup: G,
    ) -> Self
    where
        F: Fn(StepContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TestAction>> + Send + 'static,
        G: Fn(StepContext<C>) -> GFut + Send + Sync + 'static,
        GFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.states.insert(
            name.into(),
            StateEntry {
                handler: Box::new(move |ctx| Box::pin(handler(ctx))),
                cleanup: Some(Box::new(move |ctx| Box::pin(cleanup(ctx)))),
            },
        );
        self
    }

    /// Drive one work item as far as it will go
    ///
    /// Dequeues the oldest pending item, creating one at the entry state if
    /// the queue is empty. Each transition is committed before the target
    /// handler runs. The run ends on a terminal action, a pass-through
    /// action, or an error.
    pub async fn run(&self, store: &WorkStore) -> WorkQueueResult<RunReport> {
        let work = match store.dequeue()? {
            Some(row) => row,
            None => {
                let prepared = match &self.prepare {
                    Some(hook) => Some(
                        hook(self.clients.clone())
                            .await
                            .map_err(|err| WorkQueueError::PrepareFailed(format!("{err:#}")))?,
                    ),
                    None => None,
                };
                let id = store.enqueue(&self.entry, prepared.as_ref())?;
                tracing::debug!(machine = %self.name, work_id = id, "created work item");
                store
                    .dequeue()?
                    .ok_or(WorkQueueError::WorkNotFound(id))?
            }
        };

        let resolved = match &self.resolve {
            Some(hook) => Some(
                hook(self.clients.clone())
                    .await
                    .map_err(|err| WorkQueueError::ResolveFailed(format!("{err:#}")))?,
            ),
            None => None,
        };

        let mut state = work.state_fn.clone();
        let mut previous = work.action.clone();
        let mut last_exec_id = store.latest_execution(work.id)?.map(|e| e.id);
        let mut retries = self.trailing_retries(store, work.id)?;
        let mut transitions = 0u32;

        tracing::info!(
            machine = %self.name,
            work_id = work.id,
            state = %state,
            "run starting"
        );

        loop {
            // A delayed continue gates the target state until its time; the
            // run parks and the next tick re-checks.
            if let Some(gate) = previous.as_ref().and_then(TestAction::deferred_until) {
                if gate > Utc::now() {
                    tracing::debug!(
                        machine = %self.name,
                        work_id = work.id,
                        state = %state,
                        until = %gate.to_rfc3339(),
                        "state deferred, run pending"
                    );
                    return Ok(RunReport {
                        work_id: work.id,
                        status: RunStatus::Pending,
                        transitions,
                    });
                }
            }

            let entry = self
                .states
                .get(&state)
                .ok_or_else(|| WorkQueueError::UnknownState(state.clone()))?;

            let ctx = StepContext {
                work_id: work.id,
                state: state.clone(),
                prepared: work.prepared.clone(),
                resolved: resolved.clone(),
                previous: previous.clone(),
                clients: self.clients.clone(),
            };

            let started = Utc::now();
            let action = (entry.handler)(ctx.clone())
                .await
                .map_err(|err| WorkQueueError::HandlerFailed {
                    state: state.clone(),
                    detail: format!("{err:#}"),
                })?;
            transitions += 1;

            last_exec_id = Some(store.record_execution(
                work.id,
                &state,
                last_exec_id,
                &action,
                resolved.as_ref(),
                started,
            )?);

            tracing::debug!(
                machine = %self.name,
                work_id = work.id,
                state = %state,
                action = ?action,
                "state handled"
            );

            match action {
                TestAction::Continue { ref to, .. } => {
                    let target = to.clone();
                    store.update_state(work.id, &target, &action)?;
                    previous = Some(action);
                    state = target;
                    retries = 0;
                }
                TestAction::Retry { ref to } => {
                    retries += 1;
                    if let Some(limit) = self.retry_policy.max_retries {
                        if retries > limit {
                            let message = WorkQueueError::RetryLimitExceeded {
                                work_id: work.id,
                                state: state.clone(),
                                limit,
                            }
                            .to_string();
                            store.complete(
                                work.id,
                                Some(&json!({"success": false, "message": message})),
                            )?;
                            self.run_cleanup(entry, ctx).await;
                            return Ok(RunReport {
                                work_id: work.id,
                                status: RunStatus::Failed(Some(message)),
                                transitions,
                            });
                        }
                    }
                    let target = to.clone().unwrap_or_else(|| self.entry.clone());
                    store.update_state(work.id, &target, &action)?;
                    previous = Some(action);
                    state = target;
                }
                TestAction::Pass { result } => {
                    store.complete(
                        work.id,
                        Some(&json!({"success": true, "result": result})),
                    )?;
                    self.run_cleanup(entry, ctx).await;
                    tracing::info!(machine = %self.name, work_id = work.id, "run passed");
                    return Ok(RunReport {
                        work_id: work.id,
                        status: RunStatus::Passed(result),
                        transitions,
                    });
                }
                TestAction::Fail { message } => {
                    store.complete(
                        work.id,
                        Some(&json!({"success": false, "message": message})),
                    )?;
                    self.run_cleanup(entry, ctx).await;
                    tracing::warn!(
                        machine = %self.name,
                        work_id = work.id,
                        message = message.as_deref().unwrap_or(""),
                        "run failed"
                    );
                    return Ok(RunReport {
                        work_id: work.id,
                        status: RunStatus::Failed(message),
                        transitions,
                    });
                }
                TestAction::Skip | TestAction::Noop => {
                    // No state change committed; the same state re-runs on
                    // the next executor tick.
                    tracing::debug!(
                        machine = %self.name,
                        work_id = work.id,
                        state = %state,
                        "pass-through action, run pending"
                    );
                    return Ok(RunReport {
                        work_id: work.id,
                        status: RunStatus::Pending,
                        transitions,
                    });
                }
            }
        }
    }

    /// Consecutive retry actions at the tail of the execution chain
    ///
    /// Counted from storage so the retry limit survives a crash mid-backoff.
    fn trailing_retries(&self, store: &WorkStore, work_id: i64) -> WorkQueueResult<u32> {
        let executions = store.executions(work_id)?;
        let mut count = 0;
        for execution in executions.iter().rev() {
            if matches!(execution.action, TestAction::Retry { .. }) {
                count += 1;
            } else {
                break;
            }
        }
        Ok(count)
    }

    async fn run_cleanup(&self, entry: &StateEntry<C>, ctx: StepContext<C>) {
        if let Some(cleanup) = &entry.cleanup {
            if let Err(err) = cleanup(ctx).await {
                tracing::warn!(
                    machine = %self.name,
                    error = %format!("{err:#}"),
                    "terminal-state cleanup failed"
                );
            }
        }
    }
}

impl<C> std::fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_linear_run_passes() {
        let store = WorkStore::open_in_memory().unwrap();
        let machine = StateMachine::new("linear", "a", ())
            .state("a", |_ctx| async {
                Ok(TestAction::continue_with("b", json!({"step": 1})))
            })
            .state("b", |ctx: StepContext<()>| async move {
                // Data from the previous action must be visible here
                match ctx.previous {
                    Some(TestAction::Continue {
                        data: Some(data), ..
                    }) => Ok(TestAction::pass(data)),
                    other => anyhow::bail!("unexpected previous action: {other:?}"),
                }
            });

        let report = machine.run(&store).await.unwrap();
        assert_eq!(report.transitions, 2);
        assert_eq!(report.status, RunStatus::Passed(json!({"step": 1})));

        let row = store.get(report.work_id).unwrap();
        assert!(row.completed.is_some());
        assert_eq!(row.result.unwrap()["success"], true);
    }

    #[tokio::test]
    async fn test_unknown_state_is_an_error() {
        let store = WorkStore::open_in_memory().unwrap();
        let machine = StateMachine::new("dangling", "a", ()).state("a", |_ctx| async {
            Ok(TestAction::continue_to("nowhere"))
        });

        let result = machine.run(&store).await;
        assert!(matches!(
            result,
            Err(WorkQueueError::UnknownState(state)) if state == "nowhere"
        ));

        // The committed target survives for the next (fixed) deployment
        let row = store.dequeue().unwrap().unwrap();
        assert_eq!(row.state_fn, "nowhere");
    }

    #[tokio::test]
    async fn test_skip_leaves_work_pending() {
        let store = WorkStore::open_in_memory().unwrap();
        let machine =
            StateMachine::new("waiting", "a", ()).state("a", |_ctx| async { Ok(TestAction::Skip) });

        let report = machine.run(&store).await.unwrap();
        assert_eq!(report.status, RunStatus::Pending);

        // Next run picks up the same item in the same state
        let row = store.dequeue().unwrap().unwrap();
        assert_eq!(row.id, report.work_id);
        assert_eq!(row.state_fn, "a");
    }

    #[tokio::test]
    async fn test_retry_limit_fails_the_run() {
        let store = WorkStore::open_in_memory().unwrap();
        let machine = StateMachine::new("flaky", "a", ())
            .with_retry_policy(RetryPolicy::limited(2))
            .state("a", |_ctx| async { Ok(TestAction::retry()) });

        let report = machine.run(&store).await.unwrap();
        let RunStatus::Failed(Some(message)) = report.status else {
            panic!("exhausted retries must fail the run");
        };
        assert!(message.contains("Retry limit 2"), "got: {message}");
        assert_eq!(report.transitions, 3);

        let row = store.get(report.work_id).unwrap();
        assert!(row.completed.is_some());
        assert_eq!(row.result.unwrap()["success"], false);
    }

    #[tokio::test]
    async fn test_delayed_continue_parks_the_run() {
        let store = WorkStore::open_in_memory().unwrap();
        let machine = StateMachine::new("deferred", "a", ())
            .state("a", |_ctx| async {
                Ok(TestAction::continue_after(
                    "b",
                    chrono::Utc::now() + chrono::Duration::hours(1),
                ))
            })
            .state("b", |_ctx| async {
                panic!("gated state must not run before its time");
                #[allow(unreachable_code)]
                Ok(TestAction::pass(json!(null)))
            });

        let report = machine.run(&store).await.unwrap();
        assert_eq!(report.status, RunStatus::Pending);
        assert_eq!(report.transitions, 1);

        // The transition itself was committed
        let row = store.get(report.work_id).unwrap();
        assert_eq!(row.state_fn, "b");
        assert!(row.completed.is_none());
    }

    #[tokio::test]
    async fn test_elapsed_delay_gate_proceeds() {
        let store = WorkStore::open_in_memory().unwrap();
        let machine = StateMachine::new("ripe", "a", ())
            .state("a", |_ctx| async {
                Ok(TestAction::continue_after(
                    "b",
                    chrono::Utc::now() - chrono::Duration::seconds(1),
                ))
            })
            .state("b", |_ctx| async { Ok(TestAction::pass(json!(null))) });

        let report = machine.run(&store).await.unwrap();
        assert!(matches!(report.status, RunStatus::Passed(_)));
        assert_eq!(report.transitions, 2);
    }

    #[tokio::test]
    async fn test_run_can_be_spawned() {
        // The run future must be Send so activities can drive the executor
        // from their own spawned ticks.
        let store = Arc::new(WorkStore::open_in_memory().unwrap());
        let machine = Arc::new(
            StateMachine::new("spawned", "a", ())
                .state("a", |_ctx| async { Ok(TestAction::pass(json!(null))) }),
        );

        let report = tokio::spawn({
            let store = store.clone();
            let machine = machine.clone();
            async move { machine.run(&store).await }
        })
        .await
        .unwrap()
        .unwrap();

        assert!(matches!(report.status, RunStatus::Passed(_)));
    }

    #[tokio::test]
    async fn test_retry_defaults_to_entry_state() {
        let store = WorkStore::open_in_memory().unwrap();
        let visits = Arc::new(AtomicU32::new(0));
        let counter = visits.clone();
        let machine = StateMachine::new("loop", "a", ())
            .state("a", move |ctx: StepContext<()>| {
                let visits = counter.clone();
                async move {
                    if visits.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(TestAction::continue_to("b"))
                    } else {
                        Ok(TestAction::pass(json!({"via": ctx.state})))
                    }
                }
            })
            .state("b", |_ctx| async { Ok(TestAction::retry()) });

        let report = machine.run(&store).await.unwrap();
        assert_eq!(report.status, RunStatus::Passed(json!({"via": "a"})));
        // a -> b -> retry back to a -> pass
        assert_eq!(report.transitions, 3);
    }

    #[tokio::test]
    async fn test_prepare_runs_once_per_work_item() {
        let store = WorkStore::open_in_memory().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let machine = StateMachine::new("prepared", "a", ())
            .with_prepare(move |_clients| {
                let calls = counter.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"session": "s-1"}))
                }
            })
            .state("a", |ctx: StepContext<()>| async move {
                assert_eq!(ctx.prepared, Some(json!({"session": "s-1"})));
                Ok(TestAction::Skip)
            });

        machine.run(&store).await.unwrap();
        machine.run(&store).await.unwrap();
        // The second run resumed the existing item; prepare must not re-run
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_on_terminal_state() {
        let store = WorkStore::open_in_memory().unwrap();
        let cleaned = Arc::new(AtomicU32::new(0));
        let counter = cleaned.clone();
        let machine = StateMachine::new("tidy", "a", ()).state_with_cleanup(
            "a",
            |_ctx| async { Ok(TestAction::fail("boom")) },
            move |_ctx| {
                let cleaned = counter.clone();
                async move {
                    cleaned.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        let report = machine.run(&store).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed(Some("boom".to_string())));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execution_chain_is_linear() {
        let store = WorkStore::open_in_memory().unwrap();
        let machine = StateMachine::new("chain", "a", ())
            .state("a", |_ctx| async { Ok(TestAction::continue_to("b")) })
            .state("b", |_ctx| async { Ok(TestAction::pass(json!(null))) });

        let report = machine.run(&store).await.unwrap();
        let executions = store.executions(report.work_id).unwrap();
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].previous_execution_id, None);
        assert_eq!(executions[1].previous_execution_id, Some(executions[0].id));
    }
}
