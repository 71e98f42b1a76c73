//! Error types for the Vigil engine
//!
//! Domain errors use thiserror per subsystem; user-supplied activity and
//! state-handler code reports through anyhow at the boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Identity derivation or validation errors
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Work-queue executor or store errors
    #[error("Work queue error: {0}")]
    WorkQueue(#[from] WorkQueueError),

    /// Resource-log errors
    #[error("Resource log error: {0}")]
    ResourceLog(#[from] ResourceLogError),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Duplicate canary name in one registration snapshot
    #[error("Duplicate canary name '{0}' in registration snapshot")]
    DuplicateName(String),

    /// Registration rejected because the coordinator has shut down
    #[error("Coordinator is no longer accepting registrations")]
    CoordinatorClosed,

    /// Actor materialization failed in a way the loop cannot recover from
    #[error("Fatal actor materialization failure for '{name}': {detail}")]
    FatalMaterialization {
        /// Canary name
        name: String,
        /// Failure details
        detail: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Identity derivation errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Name contains characters outside `[A-Za-z0-9_-]`
    #[error("Canary name '{0}' contains characters outside [A-Za-z0-9_-]")]
    UnsafeName(String),

    /// Name exceeds the 50-character limit
    #[error("Canary name '{name}' is {len} characters, limit is {limit}")]
    NameTooLong {
        /// Offending name
        name: String,
        /// Actual length
        len: usize,
        /// Maximum allowed length
        limit: usize,
    },

    /// Name is empty
    #[error("Canary name must not be empty")]
    EmptyName,
}

/// Convenience result alias for identity operations
pub type IdentityResult<T> = std::result::Result<T, IdentityError>;

/// Work-queue executor and store errors
#[derive(Debug, Error)]
pub enum WorkQueueError {
    /// No handler registered for a state the store points at
    #[error("No handler registered for state '{0}'")]
    UnknownState(String),

    /// Retry limit exceeded for a work item
    #[error("Retry limit {limit} exceeded for work {work_id} in state '{state}'")]
    RetryLimitExceeded {
        /// Work row id
        work_id: i64,
        /// State in which the limit was hit
        state: String,
        /// Configured limit
        limit: u32,
    },

    /// Work row not found
    #[error("Work row {0} not found")]
    WorkNotFound(i64),

    /// Prepare hook failed
    #[error("Prepare hook failed: {0}")]
    PrepareFailed(String),

    /// Resolve hook failed
    #[error("Resolve hook failed: {0}")]
    ResolveFailed(String),

    /// State handler failed
    #[error("Handler for state '{state}' failed: {detail}")]
    HandlerFailed {
        /// State whose handler failed
        state: String,
        /// Failure details
        detail: String,
    },

    /// Underlying store error
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// JSON encoding of a persisted column failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for work-queue operations
pub type WorkQueueResult<T> = std::result::Result<T, WorkQueueError>;

/// Resource-log errors
#[derive(Debug, Error)]
pub enum ResourceLogError {
    /// Failed to create the log scope (fatal for the coordinator)
    #[error("Failed to create resource-log scope '{scope}': {detail}")]
    ScopeCreation {
        /// Scope name
        scope: String,
        /// Failure details
        detail: String,
    },

    /// A row failed to reach the sink; the audit trail must not degrade silently
    #[error("Resource-log append failed: {0}")]
    AppendFailed(String),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for resource-log operations
pub type ResourceLogResult<T> = std::result::Result<T, ResourceLogError>;

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
