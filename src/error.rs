//! # Engine Error Module
//!
//! Unified error handling for the tramita engine.
//!
//! One `EngineError` enum covers every caller-visible failure. Review-stage
//! guards are boolean transitions by design: an illegal call returns
//! `false` from its method instead of surfacing here.
//!
//! The variants map the behavioral taxonomy:
//! - `InvalidTemplate` - raised at registration, never at run time
//! - `OperatorFailed` - an operator returned Failed or panicked
//! - `RevisionConflict` - optimistic concurrency lost
//! - `ResumeWithoutWait` - input submitted to a task that is not waiting
//! - `UnknownTemplate` / `UnknownInstance` / `UnknownTask` / `UnknownHook`
//! - `Timeout` - a wait budget was exceeded on re-entry

use thiserror::Error;

/// Top-level error type for the tramita engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Template failed acyclicity / reachability / uniqueness checks
    #[error("invalid template '{dag_id}': {reason}")]
    InvalidTemplate { dag_id: String, reason: String },

    /// An operator returned FAILED or raised; retries (if any) are exhausted
    #[error("task '{task_id}' failed: {message}")]
    OperatorFailed { task_id: String, message: String },

    /// A guarded transition was attempted from an illegal state
    #[error("invalid transition for instance '{instance_id}': {reason}")]
    InvalidTransition { instance_id: String, reason: String },

    /// Optimistic concurrency lost; the caller's in-memory state is stale
    #[error("revision conflict saving instance '{instance_id}' (expected {expected})")]
    RevisionConflict { instance_id: String, expected: u64 },

    /// `submit_input` targeted a task that is not in the waiting state
    #[error("task '{task_id}' of instance '{instance_id}' is not waiting for input")]
    ResumeWithoutWait { instance_id: String, task_id: String },

    /// Unknown `dag_id`
    #[error("workflow template '{0}' not found")]
    UnknownTemplate(String),

    /// Unknown `instance_id`
    #[error("workflow instance '{0}' not found")]
    UnknownInstance(String),

    /// Unknown `task_id` within an instance
    #[error("task '{task_id}' not found in instance '{instance_id}'")]
    UnknownTask { instance_id: String, task_id: String },

    /// Unknown `hook_id`
    #[error("hook '{0}' not found")]
    UnknownHook(String),

    /// A wait budget expired (checked lazily on re-entry)
    #[error("timed out after {minutes} minutes: {what}")]
    Timeout { what: String, minutes: i64 },

    /// Input payload rejected by the task's form schema
    #[error("input validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Hook configuration rejected at registration
    #[error("invalid hook '{hook_id}': {reason}")]
    InvalidHook { hook_id: String, reason: String },

    /// Outbound integration call failed (transport or 5xx)
    #[error("integration call failed: {0}")]
    Integration(String),

    /// Persisted payload could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Create a generic error with a message
    pub fn other(msg: impl Into<String>) -> Self {
        EngineError::Other(msg.into())
    }

    /// True for errors that a tick-level retry can absorb
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::RevisionConflict { .. })
    }
}
