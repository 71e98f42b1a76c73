//! Embedded relational store for work rows and execution history
//!
//! One database file per test identity. Rows are never deleted, only
//! updated in place; the `work_execution` table is an append-only linked
//! history chained through `previous_execution_id`. The connection sits
//! behind a mutex so a store handle can be shared across async tasks.

use std::path::Path;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::super::error::{WorkQueueError, WorkQueueResult};
use super::action::TestAction;

/// One in-flight or completed state-machine run
#[derive(Debug, Clone)]
pub struct WorkRow {
    /// Row id
    pub id: i64,
    /// Current (or final) state
    pub state_fn: String,
    /// Output of the prepare hook
    pub prepared: Option<Value>,
    /// Last persisted action
    pub action: Option<TestAction>,
    /// Creation timestamp, RFC 3339
    pub created: String,
    /// Set when dequeued
    pub processing: Option<String>,
    /// Set on terminal action
    pub completed: Option<String>,
    /// Terminal result payload
    pub result: Option<Value>,
}

/// One recorded transition of a work row
#[derive(Debug, Clone)]
pub struct WorkExecutionRow {
    /// Row id
    pub id: i64,
    /// Owning work row
    pub work_id: i64,
    /// State whose handler produced this transition
    pub state_fn: String,
    /// Previous link in the execution chain
    pub previous_execution_id: Option<i64>,
    /// The action the handler returned
    pub action: TestAction,
    /// Resolved shared context at the time of the transition
    pub resolved: Option<Value>,
    /// When the transition was first observed, RFC 3339
    pub created: String,
    /// When the handler started, RFC 3339
    pub processing: Option<String>,
    /// When the transition was recorded, RFC 3339
    pub completed: Option<String>,
}

/// Store handle over one identity's database
pub struct WorkStore {
    conn: Mutex<Connection>,
}

impl WorkStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> WorkQueueResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory store (tests)
    pub fn open_in_memory() -> WorkQueueResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> WorkQueueResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS work (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              state_fn TEXT NOT NULL,
              prepared TEXT,
              action TEXT,
              created TEXT NOT NULL,
              processing TEXT,
              completed TEXT,
              result TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_work_completed ON work(completed);

            CREATE TABLE IF NOT EXISTS work_execution (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              work_id INTEGER NOT NULL REFERENCES work(id),
              state_fn TEXT NOT NULL,
              previous_execution_id INTEGER REFERENCES work_execution(id),
              action TEXT NOT NULL,
              resolved TEXT,
              created TEXT NOT NULL,
              processing TEXT,
              completed TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_work_execution_work
              ON work_execution(work_id);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a fresh pending row at the given entry state
    pub fn enqueue(&self, state_fn: &str, prepared: Option<&Value>) -> WorkQueueResult<i64> {
        let prepared_json = prepared.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO work (state_fn, prepared, created) VALUES (?1, ?2, ?3)",
            params![state_fn, prepared_json, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Dequeue the oldest non-completed row, marking it processing
    ///
    /// A row with `processing` set but `completed` unset is a crashed run;
    /// it is returned as-is so the executor resumes from its committed
    /// state rather than restarting at the entry state.
    pub fn dequeue(&self) -> WorkQueueResult<Option<WorkRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id FROM work WHERE completed IS NULL ORDER BY id ASC LIMIT 1",
                [],
                |r| r.get::<_, i64>(0),
            )
            .optional()?;

        let Some(id) = row else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE work SET processing = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;

        Ok(Some(Self::get_locked(&conn, id)?))
    }

    /// Fetch one work row
    pub fn get(&self, id: i64) -> WorkQueueResult<WorkRow> {
        Self::get_locked(&self.conn.lock(), id)
    }

    fn get_locked(conn: &Connection, id: i64) -> WorkQueueResult<WorkRow> {
        conn.query_row(
            "SELECT id, state_fn, prepared, action, created, processing, completed, result
             FROM work WHERE id = ?1",
            params![id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?
        .ok_or(WorkQueueError::WorkNotFound(id))
        .and_then(|(id, state_fn, prepared, action, created, processing, completed, result)| {
            Ok(WorkRow {
                id,
                state_fn,
                prepared: prepared.as_deref().map(serde_json::from_str).transpose()?,
                action: action.as_deref().map(serde_json::from_str).transpose()?,
                created,
                processing,
                completed,
                result: result.as_deref().map(serde_json::from_str).transpose()?,
            })
        })
    }

    /// Persist a transition target on a pending row (write-ahead)
    ///
    /// Committed before the target state's handler runs, so a crash mid-run
    /// resumes from here.
    pub fn update_state(&self, id: i64, state_fn: &str, action: &TestAction) -> WorkQueueResult<()> {
        let action_json = serde_json::to_string(action)?;
        let updated = self.conn.lock().execute(
            "UPDATE work SET state_fn = ?1, action = ?2 WHERE id = ?3 AND completed IS NULL",
            params![state_fn, action_json, id],
        )?;
        if updated == 0 {
            return Err(WorkQueueError::WorkNotFound(id));
        }
        Ok(())
    }

    /// Mark a row completed with an optional terminal result
    pub fn complete(&self, id: i64, result: Option<&Value>) -> WorkQueueResult<()> {
        let result_json = result.map(serde_json::to_string).transpose()?;
        let updated = self.conn.lock().execute(
            "UPDATE work SET completed = ?1, result = ?2 WHERE id = ?3",
            params![Utc::now().to_rfc3339(), result_json, id],
        )?;
        if updated == 0 {
            return Err(WorkQueueError::WorkNotFound(id));
        }
        Ok(())
    }

    /// Append one execution row, chained to the previous one
    ///
    /// `started` is when the handler began; created and processing are
    /// stamped from it, completed from the insert time.
    pub fn record_execution(
        &self,
        work_id: i64,
        state_fn: &str,
        previous_execution_id: Option<i64>,
        action: &TestAction,
        resolved: Option<&Value>,
        started: DateTime<Utc>,
    ) -> WorkQueueResult<i64> {
        let action_json = serde_json::to_string(action)?;
        let resolved_json = resolved.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO work_execution
               (work_id, state_fn, previous_execution_id, action, resolved,
                created, processing, completed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
            params![
                work_id,
                state_fn,
                previous_execution_id,
                action_json,
                resolved_json,
                started.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recent execution row for a work item, if any
    pub fn latest_execution(&self, work_id: i64) -> WorkQueueResult<Option<WorkExecutionRow>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, work_id, state_fn, previous_execution_id, action, resolved,
                        created, processing, completed
                 FROM work_execution WHERE work_id = ?1 ORDER BY id DESC LIMIT 1",
                params![work_id],
                Self::execution_from_row,
            )
            .optional()?
            .map(Self::decode_execution)
            .transpose()
    }

    /// All execution rows for a work item, oldest first
    pub fn executions(&self, work_id: i64) -> WorkQueueResult<Vec<WorkExecutionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, work_id, state_fn, previous_execution_id, action, resolved,
                    created, processing, completed
             FROM work_execution WHERE work_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![work_id], Self::execution_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(Self::decode_execution(row?)?);
        }
        Ok(out)
    }

    #[allow(clippy::type_complexity)]
    fn execution_from_row(
        r: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(
        i64,
        i64,
        String,
        Option<i64>,
        String,
        Option<String>,
        String,
        Option<String>,
        Option<String>,
    )> {
        Ok((
            r.get(0)?,
            r.get(1)?,
            r.get(2)?,
            r.get(3)?,
            r.get(4)?,
            r.get(5)?,
            r.get(6)?,
            r.get(7)?,
            r.get(8)?,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn decode_execution(
        (id, work_id, state_fn, previous_execution_id, action, resolved, created, processing, completed): (
            i64,
            i64,
            String,
            Option<i64>,
            String,
            Option<String>,
            String,
            Option<String>,
            Option<String>,
        ),
    ) -> WorkQueueResult<WorkExecutionRow> {
        Ok(WorkExecutionRow {
            id,
            work_id,
            state_fn,
            previous_execution_id,
            action: serde_json::from_str(&action)?,
            resolved: resolved.as_deref().map(serde_json::from_str).transpose()?,
            created,
            processing,
            completed,
        })
    }
}

impl std::fmt::Debug for WorkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStore").finish_non_exhaustive()
    }
}
