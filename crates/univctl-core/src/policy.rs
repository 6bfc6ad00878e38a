// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failure and retry policy.
//!
//! Decides what a failed run leaves behind: how the error is classified,
//! which task types may still run against the universe, what happens to the
//! software upgrade state, and which compensating subtasks undo transient
//! changes (a disabled load balancer, leader blacklist entries, the backup
//! flag).
//!
//! Compensations run as an ephemeral queue after the main queue stops. A
//! compensation failure is logged and never replaces the root cause.

use std::sync::Arc;

use tracing::{error, info};

use crate::context::ExecutionContext;
use crate::error::{CoreError, ErrorKind};
use crate::model::{SoftwareUpgradeState, Universe};
use crate::queue::{SubTaskGroup, SubTaskGroupType, SubTaskQueue};
use crate::subtask::SubTask;
use crate::task_types::{TaskType, TaskTypeTable};

/// Failure handling for top-level tasks.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    table: Arc<TaskTypeTable>,
}

impl FailurePolicy {
    /// Policy over a task type table.
    pub fn new(table: Arc<TaskTypeTable>) -> Self {
        Self { table }
    }

    /// Classify a failure of `task_type`.
    ///
    /// A topology-changing task that failed after it started mutating the
    /// cluster is a [`ErrorKind::TopologyModification`]; everything else keeps
    /// the error's own kind.
    pub fn classify(&self, task_type: TaskType, err: &CoreError) -> ErrorKind {
        let kind = err.kind();
        match kind {
            ErrorKind::SubTask | ErrorKind::Fatal if self.table.modifies_placement(task_type) => {
                ErrorKind::TopologyModification
            }
            _ => kind,
        }
    }

    /// Task types that may start against `universe` right now. A retry of
    /// the task that restricted the universe is also accepted by the lock
    /// manager.
    pub fn allowed_task_types(&self, universe: &Universe) -> Vec<TaskType> {
        if !universe.placement_modification_pending() {
            return TaskType::ALL.to_vec();
        }
        let allowed = self.table.restricted_allow_list();
        TaskType::ALL
            .into_iter()
            .filter(|t| allowed.contains(t))
            .collect()
    }

    /// New software upgrade state after a failed run, if it changes. Only an
    /// upgrade that got as far as marking itself in progress is failed.
    pub fn upgrade_state_on_failure(
        &self,
        current: SoftwareUpgradeState,
    ) -> Option<SoftwareUpgradeState> {
        match current {
            SoftwareUpgradeState::Upgrading => Some(SoftwareUpgradeState::UpgradeFailed),
            _ => None,
        }
    }

    /// Subtasks undoing what the run left behind.
    pub async fn compensation_queue(&self, ctx: &ExecutionContext) -> SubTaskQueue {
        let mut group = SubTaskGroup::new("Compensate", SubTaskGroupType::RebalancingLoad);
        if ctx.load_balancer_disabled() {
            group.add(SubTask::LoadBalancerStateChange { enable: true });
        }
        let blacklisted = ctx.leader_blacklisted().await;
        if !blacklisted.is_empty() {
            group.add(SubTask::ModifyLeaderBlacklist {
                add: Vec::new(),
                remove: blacklisted,
            });
        }
        if matches!(ctx.universe().await, Ok(u) if u.details.backup_in_progress) {
            group.add(SubTask::SetBackupInProgress { in_progress: false });
        }

        let mut queue = SubTaskQueue::new();
        queue.add_group(group);
        queue
    }

    /// Run the compensations for a run that failed with `root`. Never fails.
    pub async fn compensate(&self, ctx: &ExecutionContext, root: &CoreError) {
        let queue = self.compensation_queue(ctx).await;
        if queue.is_empty() {
            return;
        }
        info!(
            task_id = %ctx.task_id,
            universe_id = %ctx.universe_id,
            subtasks = queue.total_subtasks(),
            "Running compensations"
        );
        if let Err(e) = queue.run_ephemeral(ctx).await {
            error!(
                task_id = %ctx.task_id,
                universe_id = %ctx.universe_id,
                error = %e,
                root_cause = %root,
                "Compensation failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{MockCluster, NodeAction};
    use crate::config::OrchestrationConfig;
    use crate::context::Services;
    use crate::model::{UniverseBuilder, UserIntent};
    use crate::persistence::{InMemoryPersistence, Persistence};
    use crate::quorum::QuorumCoordinator;
    use crate::subtask::Task;
    use crate::updater::UniverseUpdater;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn policy() -> FailurePolicy {
        FailurePolicy::new(Arc::new(TaskTypeTable::standard()))
    }

    #[test]
    fn test_classify() {
        let policy = policy();
        let automation = CoreError::AutomationFailed {
            node: "n1".to_string(),
            action: NodeAction::Provision.verb(),
            exit_code: 1,
            output: String::new(),
        };
        assert_eq!(
            policy.classify(TaskType::AddNodeToUniverse, &automation),
            ErrorKind::TopologyModification
        );
        assert_eq!(
            policy.classify(TaskType::GFlagsUpgrade, &automation),
            ErrorKind::SubTask
        );
        let stale = CoreError::VersionMismatch {
            universe_id: Uuid::nil(),
            expected: 5,
            actual: 7,
        };
        assert_eq!(
            policy.classify(TaskType::AddNodeToUniverse, &stale),
            ErrorKind::Precondition
        );
    }

    #[test]
    fn test_allowed_task_types() {
        let policy = policy();
        let mut universe = UniverseBuilder::new("pol")
            .primary(UserIntent::new(1, 1, "2.20.0"), &["az1"])
            .build();
        assert_eq!(policy.allowed_task_types(&universe).len(), TaskType::ALL.len());

        universe.details.placement_modification_task_id = Some(Uuid::new_v4());
        assert_eq!(
            policy.allowed_task_types(&universe),
            vec![
                TaskType::DestroyUniverse,
                TaskType::CreateBackup,
                TaskType::RestoreBackup
            ]
        );
    }

    #[test]
    fn test_upgrade_state_on_failure() {
        let policy = policy();
        assert_eq!(
            policy.upgrade_state_on_failure(SoftwareUpgradeState::Upgrading),
            Some(SoftwareUpgradeState::UpgradeFailed)
        );
        assert_eq!(policy.upgrade_state_on_failure(SoftwareUpgradeState::Ready), None);
    }

    #[tokio::test]
    async fn test_compensation_restores_cluster() {
        let universe = UniverseBuilder::new("pol")
            .primary(UserIntent::new(3, 3, "2.20.0"), &["az1", "az2", "az3"])
            .build();
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.insert_universe(&universe).await.unwrap();
        let cluster = Arc::new(MockCluster::for_universe(&universe));
        let services = Services::new(
            Arc::new(UniverseUpdater::new(persistence)),
            cluster.clone(),
            cluster.clone(),
            OrchestrationConfig::default(),
        );
        let ctx = ExecutionContext::new(
            services,
            Uuid::new_v4(),
            universe.universe_id,
            true,
            CancellationToken::new(),
        );

        let policy = policy();
        assert!(policy.compensation_queue(&ctx).await.is_empty());

        let coordinator = QuorumCoordinator::new(&ctx);
        coordinator.set_load_balancer(false).await.unwrap();
        coordinator
            .modify_leader_blacklist(&["yb-pol-n2".to_string()], &[])
            .await
            .unwrap();
        assert!(!cluster.load_balancer_enabled().await);

        let root = CoreError::Cancelled {
            task_id: ctx.task_id,
        };
        policy.compensate(&ctx, &root).await;

        assert!(cluster.load_balancer_enabled().await);
        assert!(cluster.leader_blacklist().await.is_empty());
        assert!(ctx.leader_blacklisted().await.is_empty());
        assert!(policy.compensation_queue(&ctx).await.is_empty());

        SubTask::SetBackupInProgress { in_progress: true }
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(policy.compensation_queue(&ctx).await.total_subtasks(), 1);
        policy.compensate(&ctx, &root).await;
        assert!(!ctx.universe().await.unwrap().details.backup_in_progress);
    }
}
