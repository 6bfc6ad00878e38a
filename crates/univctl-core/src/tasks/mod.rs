// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Top-level universe tasks.
//!
//! Each task validates its parameters against the current universe and
//! builds a [`SubTaskQueue`]. The commissioner owns the shared run loop:
//! lock, build or load the plan, run it, compensate on failure, unlock.

mod add_node;
mod backup;
mod destroy;
mod gflags_upgrade;
mod remove_node;
mod restart;
mod software_upgrade;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::automation::BackupKind;
use crate::error::Result;
use crate::model::Universe;
use crate::queue::SubTaskQueue;
use crate::task_types::TaskType;
use crate::upgrade::FlowPolicy;

pub use add_node::{AddNodeParams, AddNodeToUniverse};
pub use backup::BackupTask;
pub use destroy::DestroyUniverse;
pub use gflags_upgrade::{GFlagsUpgrade, GFlagsUpgradeParams};
pub use remove_node::{RemoveNodeFromUniverse, RemoveNodeParams};
pub use restart::{RestartParams, RestartUniverse};
pub use software_upgrade::{SoftwareUpgrade, SoftwareUpgradeParams};

/// What a task sees when it builds its plan.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    /// Universe snapshot taken right after locking.
    pub universe: &'a Universe,
    /// Run-level flow flags.
    pub policy: FlowPolicy,
    /// Current master leader, if known.
    pub master_leader: Option<String>,
}

/// A top-level operation on one universe.
pub trait UniverseTask: Send + Sync {
    /// The task type, used for lock policy.
    fn task_type(&self) -> TaskType;

    /// Reject parameters that make no sense for the universe. Runs before
    /// the lock is taken, so it must not rely on exclusive access.
    fn validate(&self, universe: &Universe, is_first_try: bool) -> Result<()>;

    /// Build the subtask plan.
    fn build_plan(&self, plan: &PlanContext<'_>) -> Result<SubTaskQueue>;
}

/// Parameters of every task the engine accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type")]
pub enum TaskParams {
    /// Upgrade database software.
    SoftwareUpgrade(SoftwareUpgradeParams),
    /// Change server flags.
    GFlagsUpgrade(GFlagsUpgradeParams),
    /// Restart processes.
    RestartUniverse(RestartParams),
    /// Add a node.
    AddNodeToUniverse(AddNodeParams),
    /// Remove a node.
    RemoveNodeFromUniverse(RemoveNodeParams),
    /// Destroy the universe.
    DestroyUniverse,
    /// Back up data through the storage layer.
    CreateBackup {
        /// Opaque storage request.
        #[serde(default)]
        request: Value,
    },
    /// Restore data through the storage layer.
    RestoreBackup {
        /// Opaque storage request.
        #[serde(default)]
        request: Value,
    },
}

impl TaskParams {
    /// Task type of these parameters.
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::SoftwareUpgrade(_) => TaskType::SoftwareUpgrade,
            Self::GFlagsUpgrade(_) => TaskType::GFlagsUpgrade,
            Self::RestartUniverse(_) => TaskType::RestartUniverse,
            Self::AddNodeToUniverse(_) => TaskType::AddNodeToUniverse,
            Self::RemoveNodeFromUniverse(_) => TaskType::RemoveNodeFromUniverse,
            Self::DestroyUniverse => TaskType::DestroyUniverse,
            Self::CreateBackup { .. } => TaskType::CreateBackup,
            Self::RestoreBackup { .. } => TaskType::RestoreBackup,
        }
    }

    /// The runnable task for these parameters.
    pub fn into_task(self) -> Box<dyn UniverseTask> {
        match self {
            Self::SoftwareUpgrade(p) => Box::new(SoftwareUpgrade::new(p)),
            Self::GFlagsUpgrade(p) => Box::new(GFlagsUpgrade::new(p)),
            Self::RestartUniverse(p) => Box::new(RestartUniverse::new(p)),
            Self::AddNodeToUniverse(p) => Box::new(AddNodeToUniverse::new(p)),
            Self::RemoveNodeFromUniverse(p) => Box::new(RemoveNodeFromUniverse::new(p)),
            Self::DestroyUniverse => Box::new(DestroyUniverse),
            Self::CreateBackup { request } => Box::new(BackupTask::new(BackupKind::Create, request)),
            Self::RestoreBackup { request } => {
                Box::new(BackupTask::new(BackupKind::Restore, request))
            }
        }
    }
}

/// A request to run a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Target universe.
    pub universe_id: Uuid,
    /// Universe version the caller based the request on;
    /// [`crate::updater::ANY_VERSION`] skips the check.
    pub expected_version: i64,
    /// Abort the current lock owner instead of failing.
    #[serde(default)]
    pub force_lock: bool,
    /// Task parameters.
    pub params: TaskParams,
}

impl TaskRequest {
    /// A request checked against `expected_version`.
    pub fn new(universe_id: Uuid, expected_version: i64, params: TaskParams) -> Self {
        Self {
            universe_id,
            expected_version,
            force_lock: false,
            params,
        }
    }

    /// Abort the current owner if the universe is locked.
    pub fn forced(mut self) -> Self {
        self.force_lock = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_serde_shape() {
        let params = TaskParams::RestartUniverse(RestartParams {
            upgrade_option: crate::upgrade::UpgradeOption::NonRollingUpgrade,
        });
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["task_type"], "RestartUniverse");
        assert_eq!(json["upgrade_option"], "NonRollingUpgrade");
        let back: TaskParams = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);

        let json = serde_json::to_value(TaskParams::DestroyUniverse).unwrap();
        assert_eq!(json, serde_json::json!({"task_type": "DestroyUniverse"}));
    }

    #[test]
    fn test_task_type_matches_params() {
        let all = [
            TaskParams::DestroyUniverse,
            TaskParams::CreateBackup {
                request: Value::Null,
            },
            TaskParams::RestoreBackup {
                request: serde_json::json!({"backup_id": "b1"}),
            },
        ];
        for params in all {
            let expected = params.task_type();
            assert_eq!(params.into_task().task_type(), expected);
        }
    }
}
