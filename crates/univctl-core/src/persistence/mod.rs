// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for univctl-core.
//!
//! This module defines the persistence abstraction and backend implementations.
//! Universes are stored as versioned records; every change goes through
//! [`Persistence::compare_and_swap`], which applies a mutator to the current
//! record and commits it with `version + 1` in one atomic step.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::Universe;
use crate::task_types::TaskType;

/// Lifecycle of a top-level task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Accepted, not yet locked.
    Created,
    /// Holding the universe lock and executing.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
    /// Stopped through abort.
    Aborted,
}

impl TaskState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Aborted => "aborted",
        }
    }

    /// Parse a state from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Whether the task will not run again on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Aborted)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task record from the persistence layer.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Unique identifier for the task.
    pub task_id: Uuid,
    /// Universe the task operates on.
    pub universe_id: Uuid,
    /// Type of the task.
    pub task_type: TaskType,
    /// Serialized task parameters.
    pub params: serde_json::Value,
    /// Current state.
    pub state: TaskState,
    /// False for retries and resumed runs.
    pub is_first_try: bool,
    /// Task this one retries, if any.
    pub retry_of: Option<Uuid>,
    /// Serialized subtask plan, written once before the first group runs.
    pub plan: Option<serde_json::Value>,
    /// Group executing now, or the one that failed.
    pub current_group: Option<String>,
    /// Root-cause message of a failure.
    pub error: Option<String>,
    /// Machine-readable code of a failure.
    pub error_code: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task record last changed.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh record in `Created` state.
    pub fn new(
        task_id: Uuid,
        universe_id: Uuid,
        task_type: TaskType,
        params: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            universe_id,
            task_type,
            params,
            state: TaskState::Created,
            is_first_try: true,
            retry_of: None,
            plan: None,
            current_group: None,
            error: None,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A completed subtask, addressed by its position in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubTaskPosition {
    /// Index of the group in the queue.
    pub group_idx: usize,
    /// Index of the task inside its group.
    pub task_idx: usize,
}

/// Mutation applied to a universe inside [`Persistence::compare_and_swap`].
pub type UniverseMutator<'a> = &'a mut (dyn FnMut(&mut Universe) -> Result<(), CoreError> + Send);

/// Persistence interface used by the updater, lock manager and commissioner.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_universe(&self, universe: &Universe) -> Result<(), CoreError>;

    /// Load a universe; fails with `UniverseNotFound` if it does not exist.
    async fn load_universe(&self, universe_id: Uuid) -> Result<Universe, CoreError>;

    async fn list_universes(&self) -> Result<Vec<Universe>, CoreError>;

    async fn delete_universe(&self, universe_id: Uuid) -> Result<(), CoreError>;

    /// Apply `mutator` to the stored universe and commit it with its version
    /// bumped by one, provided the stored version equals `expected_version`.
    ///
    /// Fails with `VersionMismatch` if the stored version differs, and with
    /// whatever the mutator returns if it rejects the change. Nothing is
    /// written in either case.
    async fn compare_and_swap(
        &self,
        universe_id: Uuid,
        expected_version: i64,
        mutator: UniverseMutator<'_>,
    ) -> Result<Universe, CoreError>;

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, CoreError>;

    async fn update_task_state(
        &self,
        task_id: Uuid,
        state: TaskState,
        error: Option<&CoreError>,
    ) -> Result<(), CoreError>;

    async fn set_task_plan(&self, task_id: Uuid, plan: &serde_json::Value)
    -> Result<(), CoreError>;

    async fn set_current_group(&self, task_id: Uuid, group: &str) -> Result<(), CoreError>;

    async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<TaskRecord>, CoreError>;

    /// Record a subtask as done. Recording the same position twice is a no-op.
    async fn record_subtask_completed(
        &self,
        task_id: Uuid,
        position: SubTaskPosition,
    ) -> Result<(), CoreError>;

    async fn completed_subtasks(&self, task_id: Uuid) -> Result<Vec<SubTaskPosition>, CoreError>;
}
