// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SubTask group queue.
//!
//! Groups run strictly in the order they were added. Tasks inside a group
//! run concurrently on the shared worker pool, and the group completes only
//! when every task in it has finished. The first failure of a group stops
//! the queue.
//!
//! Recorded runs persist each completed subtask by position, so a resumed
//! run skips work that is known to be done.

use std::collections::HashSet;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::error::{CoreError, Result};
use crate::persistence::SubTaskPosition;
use crate::subtask::{SubTask, Task};

/// User-facing category of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubTaskGroupType {
    /// Universe-level bookkeeping.
    ConfigureUniverse,
    /// Creating instances.
    Provisioning,
    /// Fetching release packages.
    DownloadingSoftware,
    /// Installing and configuring software.
    InstallingSoftware,
    /// Pushing server flags.
    UpdatingGFlags,
    /// Restarting processes without changes.
    RestartingNodes,
    /// Starting processes.
    StartingNodeProcesses,
    /// Stopping processes.
    StoppingNodeProcesses,
    /// Waiting for processes to come up.
    WaitingForServers,
    /// Blacklists and load balancer.
    RebalancingLoad,
    /// Removing a node from the cluster.
    RemovingNode,
    /// Releasing instances.
    DeletingNodes,
    /// Backup or restore data transfer.
    BackingUp,
}

/// Named batch of subtasks that may run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskGroup {
    /// Name shown in status and logs.
    pub name: String,
    /// Category.
    pub group_type: SubTaskGroupType,
    /// Tasks of the group. No two of them target the same node.
    pub tasks: Vec<SubTask>,
}

impl SubTaskGroup {
    /// An empty group.
    pub fn new(name: impl Into<String>, group_type: SubTaskGroupType) -> Self {
        Self {
            name: name.into(),
            group_type,
            tasks: Vec::new(),
        }
    }

    /// A group holding one task.
    pub fn single(name: impl Into<String>, group_type: SubTaskGroupType, task: SubTask) -> Self {
        Self {
            name: name.into(),
            group_type,
            tasks: vec![task],
        }
    }

    /// Append a task.
    pub fn add(&mut self, task: SubTask) -> &mut Self {
        self.tasks.push(task);
        self
    }
}

/// Ordered list of groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubTaskQueue {
    groups: Vec<SubTaskGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Recorded,
    Ephemeral,
}

impl SubTaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group. Empty groups are dropped.
    pub fn add_group(&mut self, group: SubTaskGroup) {
        if group.tasks.is_empty() {
            return;
        }
        self.groups.push(group);
    }

    /// Append one single-task group per task, so the tasks run in order.
    pub fn add_sequential(&mut self, name: &str, group_type: SubTaskGroupType, tasks: Vec<SubTask>) {
        for task in tasks {
            self.add_group(SubTaskGroup::single(name, group_type, task));
        }
    }

    /// Groups in execution order.
    pub fn groups(&self) -> &[SubTaskGroup] {
        &self.groups
    }

    /// Whether the queue has no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of subtasks over all groups.
    pub fn total_subtasks(&self) -> usize {
        self.groups.iter().map(|g| g.tasks.len()).sum()
    }

    /// Serialize as a persisted plan.
    pub fn to_plan(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Restore a persisted plan.
    pub fn from_plan(plan: &Value) -> Result<Self> {
        Ok(serde_json::from_value(plan.clone())?)
    }

    /// Run every group, recording progress so a resumed run skips
    /// completed subtasks.
    pub async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        self.execute(ctx, RunMode::Recorded).await
    }

    /// Run every group without recording progress or observing
    /// cancellation. Used for compensation after a failed or aborted run.
    pub async fn run_ephemeral(&self, ctx: &ExecutionContext) -> Result<()> {
        self.execute(ctx, RunMode::Ephemeral).await
    }

    async fn execute(&self, ctx: &ExecutionContext, mode: RunMode) -> Result<()> {
        let persistence = ctx.services.updater.persistence();
        let completed: HashSet<SubTaskPosition> = match mode {
            RunMode::Recorded => persistence
                .completed_subtasks(ctx.task_id)
                .await?
                .into_iter()
                .collect(),
            RunMode::Ephemeral => HashSet::new(),
        };

        for (group_idx, group) in self.groups.iter().enumerate() {
            if mode == RunMode::Recorded {
                ctx.check_cancelled()?;
                persistence.set_current_group(ctx.task_id, &group.name).await?;
            }
            info!(
                task_id = %ctx.task_id,
                group = %group.name,
                tasks = group.tasks.len(),
                "Running subtask group"
            );

            let runs = group.tasks.iter().enumerate().map(|(task_idx, task)| {
                let position = SubTaskPosition {
                    group_idx,
                    task_idx,
                };
                let done = completed.contains(&position);
                async move { self.run_one(ctx, mode, position, task, done).await }
            });
            let results = join_all(runs).await;

            if let Some(err) = results.into_iter().find_map(|r| r.err()) {
                warn!(
                    task_id = %ctx.task_id,
                    group = %group.name,
                    error = %err,
                    "Subtask group failed"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    async fn run_one(
        &self,
        ctx: &ExecutionContext,
        mode: RunMode,
        position: SubTaskPosition,
        task: &SubTask,
        done: bool,
    ) -> Result<()> {
        if done {
            debug!(task_id = %ctx.task_id, subtask = %task.name(), "Skipping completed subtask");
            return task.replay(ctx).await;
        }

        let _permit = ctx
            .services
            .workers
            .acquire()
            .await
            .map_err(|_| CoreError::Internal("worker pool closed".to_string()))?;
        if mode == RunMode::Recorded {
            ctx.check_cancelled()?;
        }

        debug!(task_id = %ctx.task_id, subtask = %task.name(), "Running subtask");
        task.run(ctx).await?;

        if mode == RunMode::Recorded {
            ctx.services
                .updater
                .persistence()
                .record_subtask_completed(ctx.task_id, position)
                .await?;
        }
        Ok(())
    }
}
