//! Append-only audit trail of scoped-resource lifetimes
//!
//! Every actor/task materialization runs under a `capture` scope: one JSON
//! line per completed lifetime, pairing the acquisition and release
//! timestamps with a context snapshot. A scope that fails during acquisition
//! writes nothing — rows are paired or absent, never released-without-
//! acquired. Each append is flushed and fsynced before `capture` returns;
//! the trail's integrity is never silently degraded.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

use super::error::{ResourceLogError, ResourceLogResult};

/// Append-only sink for acquire/release rows of one scope
pub struct ResourceLog {
    scope: String,
    path: PathBuf,
    writer: Mutex<File>,
}

impl ResourceLog {
    /// Create the log file for a new scope
    ///
    /// Failure here is process-ending for the caller: a coordinator without
    /// an audit sink must not run.
    pub fn create(dir: &Path, scope: &str) -> ResourceLogResult<Self> {
        fs::create_dir_all(dir).map_err(|e| ResourceLogError::ScopeCreation {
            scope: scope.to_string(),
            detail: format!("creating {}: {e}", dir.display()),
        })?;

        let path = dir.join(format!("{scope}-{}.log", Uuid::new_v4()));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| ResourceLogError::ScopeCreation {
                scope: scope.to_string(),
                detail: format!("opening {}: {e}", path.display()),
            })?;

        Ok(Self {
            scope: scope.to_string(),
            path,
            writer: Mutex::new(file),
        })
    }

    /// The scope name
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a scoped resource lifetime
    ///
    /// Timestamps acquisition, runs the scope, timestamps release, then
    /// appends `[acquired_at, released_at, context]`. An acquisition error
    /// propagates without writing anything; an append error is surfaced
    /// rather than swallowed.
    pub fn capture<T>(
        &self,
        context: Value,
        scope: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let acquired_at = Utc::now();
        let value = scope()?;
        let released_at = Utc::now();

        self.append(&json!([
            acquired_at.to_rfc3339(),
            released_at.to_rfc3339(),
            context,
        ]))
        .context("resource-log append failed")?;

        Ok(value)
    }

    /// Record a scoped lifetime with distinct acquire/release contexts
    ///
    /// The scope returns its value plus the release-side snapshot; the line
    /// is the 4-tuple `[acquired_at, acquired_ctx, released_at, released_ctx]`.
    pub fn capture_with<T>(
        &self,
        acquired_ctx: Value,
        scope: impl FnOnce() -> anyhow::Result<(T, Value)>,
    ) -> anyhow::Result<T> {
        let acquired_at = Utc::now();
        let (value, released_ctx) = scope()?;
        let released_at = Utc::now();

        self.append(&json!([
            acquired_at.to_rfc3339(),
            acquired_ctx,
            released_at.to_rfc3339(),
            released_ctx,
        ]))
        .context("resource-log append failed")?;

        Ok(value)
    }

    /// Append one line and make it durable
    fn append(&self, line: &Value) -> ResourceLogResult<()> {
        let mut encoded = serde_json::to_vec(line)?;
        encoded.push(b'\n');

        let sink_err = |e: std::io::Error| {
            ResourceLogError::AppendFailed(format!("{}: {e}", self.path.display()))
        };

        let mut writer = self.writer.lock();
        writer.write_all(&encoded).map_err(sink_err)?;
        writer.flush().map_err(sink_err)?;
        // Fsync before returning: a capture that reported success must
        // survive a crash.
        writer.sync_all().map_err(sink_err)?;
        Ok(())
    }
}

impl std::fmt::Debug for ResourceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLog")
            .field("scope", &self.scope)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tempfile::TempDir;

    fn read_lines(log: &ResourceLog) -> Vec<Value> {
        let data = std::fs::read_to_string(log.path()).unwrap();
        data.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_capture_writes_paired_line() {
        let temp = TempDir::new().unwrap();
        let log = ResourceLog::create(temp.path(), "coordinator").unwrap();

        let value = log
            .capture(json!({"actor": "a1"}), || Ok(42))
            .unwrap();
        assert_eq!(value, 42);

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 1);
        let row = lines[0].as_array().unwrap();
        assert_eq!(row.len(), 3);
        assert_eq!(row[2], json!({"actor": "a1"}));
        // Acquired precedes released
        assert!(row[0].as_str().unwrap() <= row[1].as_str().unwrap());
    }

    #[test]
    fn test_failed_acquisition_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let log = ResourceLog::create(temp.path(), "coordinator").unwrap();

        let result: anyhow::Result<()> =
            log.capture(json!({"actor": "a2"}), || Err(anyhow!("acquire failed")));
        assert!(result.is_err());

        let lines = read_lines(&log);
        assert!(
            lines.is_empty(),
            "no released row may exist for a failed acquisition"
        );
    }

    #[test]
    fn test_capture_with_records_both_contexts() {
        let temp = TempDir::new().unwrap();
        let log = ResourceLog::create(temp.path(), "actor").unwrap();

        log.capture_with(json!({"phase": "enter"}), || {
            Ok(((), json!({"phase": "exit", "ticks": 3})))
        })
        .unwrap();

        let lines = read_lines(&log);
        let row = lines[0].as_array().unwrap();
        assert_eq!(row.len(), 4);
        assert_eq!(row[1], json!({"phase": "enter"}));
        assert_eq!(row[3], json!({"phase": "exit", "ticks": 3}));
    }

    #[test]
    fn test_lines_append_in_order() {
        let temp = TempDir::new().unwrap();
        let log = ResourceLog::create(temp.path(), "order").unwrap();

        for i in 0..5 {
            log.capture(json!({"seq": i}), || Ok(())).unwrap();
        }

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 5);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line.as_array().unwrap()[2]["seq"], json!(i));
        }
    }

    #[test]
    fn test_distinct_scopes_get_distinct_files() {
        let temp = TempDir::new().unwrap();
        let a = ResourceLog::create(temp.path(), "scope").unwrap();
        let b = ResourceLog::create(temp.path(), "scope").unwrap();
        assert_ne!(a.path(), b.path());
    }
}
