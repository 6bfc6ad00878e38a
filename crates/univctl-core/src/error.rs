// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for univctl-core.
//!
//! Provides a unified error type with stable error codes, plus the
//! classification used by the failure policy.

use thiserror::Error;
use uuid::Uuid;

use crate::task_types::TaskType;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse classification of an error, used to decide what happens to the
/// universe and which follow-up operations are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any mutation; the caller can retry with fresh state.
    Precondition,
    /// A topology-changing task failed mid-flight; the universe is restricted
    /// until the task is retried successfully.
    TopologyModification,
    /// A subtask failed (automation error, wait timeout).
    SubTask,
    /// The run was aborted through its cancellation token.
    Cancelled,
    /// Anything unexpected (storage failures, broken invariants).
    Fatal,
}

impl ErrorKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::TopologyModification => "topology_modification",
            Self::SubTask => "subtask",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        }
    }
}

/// Core errors that can occur while locking universes or running tasks.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Universe was not found in the store.
    #[error("Universe '{universe_id}' not found")]
    UniverseNotFound {
        /// The universe ID that was not found.
        universe_id: Uuid,
    },

    /// Universe already exists (duplicate insert).
    #[error("Universe '{universe_id}' already exists")]
    UniverseAlreadyExists {
        /// The universe ID that already exists.
        universe_id: Uuid,
    },

    /// Node was not found in the universe.
    #[error("Node '{node_name}' not found in universe '{universe_id}'")]
    NodeNotFound {
        /// The universe ID.
        universe_id: Uuid,
        /// The node name that was not found.
        node_name: String,
    },

    /// Task was not found.
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: Uuid,
    },

    /// The caller's view of the universe is stale.
    #[error(
        "Universe '{universe_id}' version {actual} is different from the expected version of {expected}"
    )]
    VersionMismatch {
        /// The universe ID.
        universe_id: Uuid,
        /// Version the caller expected.
        expected: i64,
        /// Version currently stored.
        actual: i64,
    },

    /// Another task owns the universe lock.
    #[error("Universe '{universe_id}' is already being updated by task {owner_task_id:?}")]
    AlreadyLocked {
        /// The universe ID.
        universe_id: Uuid,
        /// The task currently owning the lock.
        owner_task_id: Option<Uuid>,
    },

    /// Unlock was requested by a task that does not own the lock.
    #[error("Universe '{universe_id}' is not locked by task '{task_id}'")]
    NotLocked {
        /// The universe ID.
        universe_id: Uuid,
        /// The task that attempted to unlock.
        task_id: Uuid,
    },

    /// A forced lock could not stop the owning task in time.
    #[error(
        "Timed out after {waited_secs}s waiting for task '{owner_task_id}' to abort on universe '{universe_id}'"
    )]
    AbortTimeout {
        /// The universe ID.
        universe_id: Uuid,
        /// The task that did not stop.
        owner_task_id: Uuid,
        /// How long the lock manager waited.
        waited_secs: u64,
    },

    /// The universe is restricted by a failed topology change.
    #[error(
        "Universe '{universe_id}' has a pending placement modification from task '{pending_task_id}'; {task_type} is not allowed until it is retried successfully"
    )]
    PlacementModificationPending {
        /// The universe ID.
        universe_id: Uuid,
        /// The unresolved topology task.
        pending_task_id: Uuid,
        /// The task type that was refused.
        task_type: TaskType,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Task is in an invalid state for the requested operation.
    #[error("Task '{task_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidTaskState {
        /// The task ID.
        task_id: Uuid,
        /// The expected state.
        expected: String,
        /// The actual state.
        actual: String,
    },

    /// The node automation layer reported a failure.
    #[error("{action} on node '{node}' failed with exit code {exit_code}: {output}")]
    AutomationFailed {
        /// Node the action ran against.
        node: String,
        /// Action name.
        action: String,
        /// Exit code reported by the automation layer.
        exit_code: i32,
        /// Captured output.
        output: String,
    },

    /// The cluster admin endpoint (quorum, blacklist, load balancer) failed.
    #[error("Cluster admin call '{operation}' failed: {details}")]
    ClusterAdminFailed {
        /// The admin operation.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A bounded wait expired.
    #[error("Timed out after {timeout_secs}s waiting for {what}")]
    WaitTimeout {
        /// What was being waited for.
        what: String,
        /// The timeout that expired.
        timeout_secs: u64,
    },

    /// The run was aborted.
    #[error("Task '{task_id}' was aborted")]
    Cancelled {
        /// The aborted task.
        task_id: Uuid,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Broken invariant or other unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UniverseNotFound { .. } => "UNIVERSE_NOT_FOUND",
            Self::UniverseAlreadyExists { .. } => "UNIVERSE_ALREADY_EXISTS",
            Self::NodeNotFound { .. } => "NODE_NOT_FOUND",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
            Self::AlreadyLocked { .. } => "ALREADY_LOCKED",
            Self::NotLocked { .. } => "NOT_LOCKED",
            Self::AbortTimeout { .. } => "ABORT_TIMEOUT",
            Self::PlacementModificationPending { .. } => "PLACEMENT_MODIFICATION_PENDING",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::InvalidTaskState { .. } => "INVALID_TASK_STATE",
            Self::AutomationFailed { .. } => "AUTOMATION_FAILED",
            Self::ClusterAdminFailed { .. } => "CLUSTER_ADMIN_FAILED",
            Self::WaitTimeout { .. } => "WAIT_TIMEOUT",
            Self::Cancelled { .. } => "CANCELLED",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Classify this error on its own, without knowing which task raised it.
    ///
    /// [`crate::policy::FailurePolicy::classify`] refines this with the task
    /// type to detect topology-modification failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UniverseNotFound { .. }
            | Self::UniverseAlreadyExists { .. }
            | Self::NodeNotFound { .. }
            | Self::TaskNotFound { .. }
            | Self::VersionMismatch { .. }
            | Self::AlreadyLocked { .. }
            | Self::NotLocked { .. }
            | Self::AbortTimeout { .. }
            | Self::PlacementModificationPending { .. }
            | Self::ValidationError { .. }
            | Self::InvalidTaskState { .. } => ErrorKind::Precondition,
            Self::AutomationFailed { .. }
            | Self::ClusterAdminFailed { .. }
            | Self::WaitTimeout { .. } => ErrorKind::SubTask,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::DatabaseError { .. } | Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
