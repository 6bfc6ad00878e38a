// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task types and the lock policy table.
//!
//! The table records, per task type, whether the task changes node topology
//! (and therefore leaves the universe restricted when it fails) and which task
//! types may still run while a universe is restricted. It is built once and
//! handed to the [`LockManager`](crate::lock::LockManager).

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Every top-level operation the control plane knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Create a new universe.
    CreateUniverse,
    /// Change the node layout of a universe.
    EditUniverse,
    /// Add a (new or decommissioned) node back into a universe.
    AddNodeToUniverse,
    /// Remove a node from a universe.
    RemoveNodeFromUniverse,
    /// Destroy a universe and all its nodes.
    DestroyUniverse,
    /// Upgrade the database software.
    SoftwareUpgrade,
    /// Change server flags.
    GFlagsUpgrade,
    /// Restart every server.
    RestartUniverse,
    /// Take a backup (storage I/O lives outside this engine).
    CreateBackup,
    /// Restore a backup (storage I/O lives outside this engine).
    RestoreBackup,
}

impl TaskType {
    /// All task types, in declaration order.
    pub const ALL: [TaskType; 10] = [
        TaskType::CreateUniverse,
        TaskType::EditUniverse,
        TaskType::AddNodeToUniverse,
        TaskType::RemoveNodeFromUniverse,
        TaskType::DestroyUniverse,
        TaskType::SoftwareUpgrade,
        TaskType::GFlagsUpgrade,
        TaskType::RestartUniverse,
        TaskType::CreateBackup,
        TaskType::RestoreBackup,
    ];

    /// Returns the string representation of the task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateUniverse => "CreateUniverse",
            Self::EditUniverse => "EditUniverse",
            Self::AddNodeToUniverse => "AddNodeToUniverse",
            Self::RemoveNodeFromUniverse => "RemoveNodeFromUniverse",
            Self::DestroyUniverse => "DestroyUniverse",
            Self::SoftwareUpgrade => "SoftwareUpgrade",
            Self::GFlagsUpgrade => "GFlagsUpgrade",
            Self::RestartUniverse => "RestartUniverse",
            Self::CreateBackup => "CreateBackup",
            Self::RestoreBackup => "RestoreBackup",
        }
    }

    /// Parse a task type from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock policy for one task type.
#[derive(Debug, Clone, Default)]
pub struct TaskTypePolicy {
    /// The task changes node topology; a failure leaves the universe restricted.
    pub modifies_placement: bool,
    /// The task may start while the universe is restricted.
    pub allowed_when_restricted: bool,
}

/// Table of lock policies, keyed by task type.
#[derive(Debug, Clone)]
pub struct TaskTypeTable {
    policies: HashMap<TaskType, TaskTypePolicy>,
}

impl TaskTypeTable {
    /// The table used in production.
    pub fn standard() -> Self {
        let placement = [
            TaskType::CreateUniverse,
            TaskType::EditUniverse,
            TaskType::AddNodeToUniverse,
            TaskType::RemoveNodeFromUniverse,
        ];
        let allowed = [
            TaskType::DestroyUniverse,
            TaskType::CreateBackup,
            TaskType::RestoreBackup,
        ];

        let policies = TaskType::ALL
            .into_iter()
            .map(|t| {
                (
                    t,
                    TaskTypePolicy {
                        modifies_placement: placement.contains(&t),
                        allowed_when_restricted: allowed.contains(&t),
                    },
                )
            })
            .collect();

        Self { policies }
    }

    /// Build a table from explicit entries; unlisted types get the default
    /// (non-topology, not allowed while restricted).
    pub fn from_entries(entries: impl IntoIterator<Item = (TaskType, TaskTypePolicy)>) -> Self {
        Self {
            policies: entries.into_iter().collect(),
        }
    }

    /// Policy for a task type.
    pub fn policy(&self, task_type: TaskType) -> TaskTypePolicy {
        self.policies.get(&task_type).cloned().unwrap_or_default()
    }

    /// Whether a failure of this task type leaves the universe restricted.
    pub fn modifies_placement(&self, task_type: TaskType) -> bool {
        self.policy(task_type).modifies_placement
    }

    /// Whether this task type may start while the universe is restricted.
    pub fn allowed_when_restricted(&self, task_type: TaskType) -> bool {
        self.policy(task_type).allowed_when_restricted
    }

    /// The task types that may start while the universe is restricted.
    pub fn restricted_allow_list(&self) -> HashSet<TaskType> {
        self.policies
            .iter()
            .filter(|(_, p)| p.allowed_when_restricted)
            .map(|(t, _)| *t)
            .collect()
    }
}

impl Default for TaskTypeTable {
    fn default() -> Self {
        Self::standard()
    }
}
