// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for universe locking, version checks, the placement
//! restriction and topology changes.

mod common;

use common::*;
use serde_json::json;
use univctl_core::automation::{BackupKind, BlacklistKind, MockEvent, NodeAction};
use univctl_core::model::{NodeState, ServerType};
use univctl_core::persistence::TaskState;
use univctl_core::task_types::TaskType;
use univctl_core::tasks::{
    AddNodeParams, GFlagsUpgradeParams, RemoveNodeParams, RestartParams, TaskParams, TaskRequest,
};
use univctl_core::updater::ANY_VERSION;
use univctl_core::upgrade::UpgradeOption;

fn restart(ctx: &TestContext, version: i64) -> TaskRequest {
    TaskRequest::new(
        ctx.universe_id,
        version,
        TaskParams::RestartUniverse(RestartParams {
            upgrade_option: UpgradeOption::RollingUpgrade,
        }),
    )
}

fn tserver_flags(ctx: &TestContext, version: i64) -> TaskRequest {
    TaskRequest::new(
        ctx.universe_id,
        version,
        TaskParams::GFlagsUpgrade(GFlagsUpgradeParams {
            master_gflags: Default::default(),
            tserver_gflags: [("log_min_seconds_to_retain".to_string(), "900".to_string())]
                .into_iter()
                .collect(),
            upgrade_option: UpgradeOption::RollingUpgrade,
        }),
    )
}

#[tokio::test]
async fn test_version_increases_across_lock_cycles() {
    let ctx = TestContext::new("ver", 3, 3).await;
    let mut last = ctx.version().await;

    for _ in 0..2 {
        let task_id = ctx.commissioner.submit(restart(&ctx, last)).await.unwrap();
        let status = ctx.wait(task_id).await;
        assert_eq!(status.state, TaskState::Success, "{:?}", status.error);

        let current = ctx.version().await;
        assert!(current > last, "version did not move: {} -> {}", last, current);
        last = current;
    }

    // The version the caller saw before the last run is stale now.
    let err = ctx
        .commissioner
        .submit(restart(&ctx, last - 1))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VERSION_MISMATCH");
}

#[tokio::test]
async fn test_stale_version_rejected_without_change() {
    let ctx = TestContext::new("stale", 3, 3).await;

    // Bump the stored version to 7.
    for _ in 0..6 {
        ctx.commissioner
            .force_unlock(ctx.universe_id, false)
            .await
            .unwrap();
    }
    let before = ctx.universe().await;
    assert_eq!(before.version, 7);

    let err = ctx
        .commissioner
        .submit(restart(&ctx, 5))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VERSION_MISMATCH");
    assert_eq!(ctx.universe().await, before);
    assert!(ctx.cluster.actions().await.is_empty());
}

#[tokio::test]
async fn test_second_task_rejected_while_locked() {
    let ctx = TestContext::new("busy", 3, 3).await;
    let gate = ctx
        .cluster
        .hold(&ctx.node(1), NodeAction::Stop(ServerType::Master))
        .await;

    let owner = ctx
        .commissioner
        .submit(restart(&ctx, ANY_VERSION))
        .await
        .unwrap();
    gate.reached().await;

    let err = ctx
        .commissioner
        .submit(restart(&ctx, ANY_VERSION))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ALREADY_LOCKED");

    gate.release();
    assert_eq!(ctx.wait(owner).await.state, TaskState::Success);
}

#[tokio::test]
async fn test_forced_lock_times_out_on_unresponsive_owner() {
    let ctx = TestContext::new("force", 3, 3).await;
    let gate = ctx
        .cluster
        .hold(&ctx.node(1), NodeAction::Stop(ServerType::Master))
        .await;

    let owner = ctx
        .commissioner
        .submit(restart(&ctx, ANY_VERSION))
        .await
        .unwrap();
    // The owner is stuck in an automation call and cannot observe the abort.
    gate.reached().await;

    let err = ctx
        .commissioner
        .submit(restart(&ctx, ANY_VERSION).forced())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ABORT_TIMEOUT");

    let universe = ctx.universe().await;
    assert!(universe.details.update_in_progress);
    assert_eq!(universe.details.updating_task_id, Some(owner));

    // Once released, the owner sees the abort at its next subtask.
    gate.release();
    let status = ctx.wait(owner).await;
    assert_eq!(status.state, TaskState::Aborted);
    assert!(!ctx.universe().await.details.update_in_progress);
}

#[tokio::test]
async fn test_forced_lock_takes_over_from_responsive_owner() {
    let ctx = TestContext::new("takeover", 3, 3).await;
    let gate = ctx
        .cluster
        .hold(&ctx.node(2), NodeAction::Stop(ServerType::Master))
        .await;

    let owner = ctx
        .commissioner
        .submit(restart(&ctx, ANY_VERSION))
        .await
        .unwrap();
    gate.reached().await;

    // Release the held call once the abort has been requested.
    let cluster_gate = gate.clone();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cluster_gate.release();
    });

    let successor = ctx
        .commissioner
        .submit(
            TaskRequest::new(
                ctx.universe_id,
                ANY_VERSION,
                TaskParams::RestartUniverse(RestartParams {
                    upgrade_option: UpgradeOption::NonRollingUpgrade,
                }),
            )
            .forced(),
        )
        .await
        .unwrap();
    releaser.await.unwrap();

    assert_eq!(ctx.wait(owner).await.state, TaskState::Aborted);
    let status = ctx.wait(successor).await;
    assert_eq!(status.state, TaskState::Success, "{:?}", status.error);
}

#[tokio::test]
async fn test_failed_topology_change_restricts_universe() {
    let ctx = TestContext::new("restrict", 3, 3).await;
    let new_node = ctx.node(4);
    ctx.cluster
        .fail_action(&new_node, NodeAction::Provision, 2)
        .await;

    let add = TaskRequest::new(
        ctx.universe_id,
        ctx.version().await,
        TaskParams::AddNodeToUniverse(AddNodeParams::default()),
    );
    let failed = ctx.commissioner.submit(add).await.unwrap();
    let status = ctx.wait(failed).await;
    assert_eq!(status.state, TaskState::Failure);
    assert_eq!(status.error_code.as_deref(), Some("AUTOMATION_FAILED"));
    assert!(status.placement_modification_pending);

    let universe = ctx.universe().await;
    assert_eq!(universe.details.placement_modification_task_id, Some(failed));
    assert!(!universe.details.update_in_progress);

    // Only teardown and backups may run now.
    let err = ctx
        .commissioner
        .submit(tserver_flags(&ctx, ANY_VERSION))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "PLACEMENT_MODIFICATION_PENDING");
    assert_eq!(
        ctx.commissioner
            .allowed_task_types(ctx.universe_id)
            .await
            .unwrap(),
        vec![
            TaskType::DestroyUniverse,
            TaskType::CreateBackup,
            TaskType::RestoreBackup
        ]
    );

    // A successful retry lifts the restriction.
    let retry = ctx.commissioner.retry(failed).await.unwrap();
    let status = ctx.wait(retry).await;
    assert_eq!(status.state, TaskState::Success, "{:?}", status.error);
    assert!(!status.placement_modification_pending);
    assert_eq!(ctx.cluster.invocations(&new_node, NodeAction::Provision).await, 2);

    let universe = ctx.universe().await;
    assert!(universe.details.placement_modification_task_id.is_none());
    let node = universe.node(&new_node).unwrap();
    assert!(node.is_live());
    assert_eq!(universe.details.node_details_set.len(), 4);

    let flags = ctx
        .commissioner
        .submit(tserver_flags(&ctx, ANY_VERSION))
        .await
        .unwrap();
    assert_eq!(ctx.wait(flags).await.state, TaskState::Success);
}

#[tokio::test]
async fn test_operator_force_unlock_clears_restriction() {
    let ctx = TestContext::new("unlock", 3, 3).await;
    ctx.cluster
        .fail_action(&ctx.node(4), NodeAction::Provision, 1)
        .await;
    let add = TaskRequest::new(
        ctx.universe_id,
        ANY_VERSION,
        TaskParams::AddNodeToUniverse(AddNodeParams::default()),
    );
    let failed = ctx.commissioner.submit(add).await.unwrap();
    ctx.wait(failed).await;

    let universe = ctx
        .commissioner
        .force_unlock(ctx.universe_id, true)
        .await
        .unwrap();
    assert!(!universe.placement_modification_pending());
    assert_eq!(
        ctx.commissioner
            .allowed_task_types(ctx.universe_id)
            .await
            .unwrap()
            .len(),
        TaskType::ALL.len()
    );
}

#[tokio::test]
async fn test_backups_run_on_restricted_universe() {
    let ctx = TestContext::new("backup", 3, 3).await;
    ctx.cluster
        .fail_action(&ctx.node(4), NodeAction::Provision, 1)
        .await;
    let add = TaskRequest::new(
        ctx.universe_id,
        ANY_VERSION,
        TaskParams::AddNodeToUniverse(AddNodeParams::default()),
    );
    let failed = ctx.commissioner.submit(add).await.unwrap();
    assert_eq!(ctx.wait(failed).await.state, TaskState::Failure);

    for params in [
        TaskParams::CreateBackup {
            request: json!({"storage": "s3://bucket/univ"}),
        },
        TaskParams::RestoreBackup {
            request: json!({"backup_id": "b1"}),
        },
    ] {
        let task_id = ctx
            .commissioner
            .submit(TaskRequest::new(ctx.universe_id, ANY_VERSION, params))
            .await
            .unwrap();
        let status = ctx.wait(task_id).await;
        assert_eq!(status.state, TaskState::Success, "{:?}", status.error);
        assert!(status.placement_modification_pending);
    }

    let events = ctx.cluster.events().await;
    let backups: Vec<BackupKind> = events
        .iter()
        .filter_map(|e| match e {
            MockEvent::Backup { kind } => Some(*kind),
            _ => None,
        })
        .collect();
    assert_eq!(backups, vec![BackupKind::Create, BackupKind::Restore]);

    // The restriction belongs to the failed topology change, not the backups.
    let universe = ctx.universe().await;
    assert_eq!(universe.details.placement_modification_task_id, Some(failed));
    assert!(!universe.details.backup_in_progress);
    assert!(!universe.details.update_in_progress);
}

#[tokio::test]
async fn test_removed_node_leaves_no_blacklist_entry() {
    let ctx = TestContext::new("remove", 3, 4).await;
    let gone = ctx.node(4);
    let request = TaskRequest::new(
        ctx.universe_id,
        ANY_VERSION,
        TaskParams::RemoveNodeFromUniverse(RemoveNodeParams {
            node_name: gone.clone(),
        }),
    );
    let task_id = ctx.commissioner.submit(request).await.unwrap();
    let status = ctx.wait(task_id).await;
    assert_eq!(status.state, TaskState::Success, "{:?}", status.error);

    let universe = ctx.universe().await;
    assert_eq!(universe.node(&gone).unwrap().state, NodeState::Removed);
    assert!(ctx.cluster.data_blacklist().await.is_empty());

    let data_changes: Vec<bool> = ctx
        .cluster
        .events()
        .await
        .into_iter()
        .filter_map(|e| match e {
            MockEvent::Blacklist {
                kind: BlacklistKind::Data,
                node,
                added,
            } if node == gone => Some(added),
            _ => None,
        })
        .collect();
    assert_eq!(data_changes, vec![true, false]);
}
