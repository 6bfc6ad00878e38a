// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup and restore.
//!
//! The data path belongs to the storage layer behind
//! [`ClusterAdmin::run_backup`](crate::automation::ClusterAdmin::run_backup).
//! These tasks hold the universe lock around the call and flag the universe
//! while it runs. Both may start while a topology change is pending.

use serde_json::Value;

use super::{PlanContext, UniverseTask};
use crate::automation::BackupKind;
use crate::error::Result;
use crate::model::Universe;
use crate::queue::{SubTaskGroup, SubTaskGroupType, SubTaskQueue};
use crate::subtask::SubTask;
use crate::task_types::TaskType;

/// Runs one backup or restore under the universe lock.
pub struct BackupTask {
    kind: BackupKind,
    request: Value,
}

impl BackupTask {
    /// A backup or restore with an opaque storage request.
    pub fn new(kind: BackupKind, request: Value) -> Self {
        Self { kind, request }
    }
}

impl UniverseTask for BackupTask {
    fn task_type(&self) -> TaskType {
        match self.kind {
            BackupKind::Create => TaskType::CreateBackup,
            BackupKind::Restore => TaskType::RestoreBackup,
        }
    }

    fn validate(&self, _universe: &Universe, _is_first_try: bool) -> Result<()> {
        Ok(())
    }

    fn build_plan(&self, _plan: &PlanContext<'_>) -> Result<SubTaskQueue> {
        let name = match self.kind {
            BackupKind::Create => "Create backup",
            BackupKind::Restore => "Restore backup",
        };

        let mut queue = SubTaskQueue::new();
        queue.add_group(SubTaskGroup::single(
            "Mark backup in progress",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::SetBackupInProgress { in_progress: true },
        ));
        queue.add_group(SubTaskGroup::single(
            name,
            SubTaskGroupType::BackingUp,
            SubTask::RunBackup {
                kind: self.kind,
                request: self.request.clone(),
            },
        ));
        queue.add_group(SubTaskGroup::single(
            "Clear backup in progress",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::SetBackupInProgress { in_progress: false },
        ));
        Ok(queue)
    }
}
