// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subtasks: the units of work a queue executes.
//!
//! Every subtask is serializable so a plan can be persisted and resumed, and
//! every subtask is idempotent or checks before it acts, because a resumed
//! run may repeat one whose effect was only partly observed.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::automation::{BackupKind, NodeAction, QuorumChange};
use crate::context::ExecutionContext;
use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, NodeState, ServerType, SoftwareUpgradeState, Universe};
use crate::quorum::QuorumCoordinator;
use crate::wait::poll_until;

/// A unit of work run by a [`crate::queue::SubTaskQueue`].
#[async_trait]
pub trait Task: Send + Sync {
    /// Short description for logs and status.
    fn name(&self) -> String;

    /// Execute.
    async fn run(&self, ctx: &ExecutionContext) -> Result<()>;

    /// Restore run state for a subtask that completed in an earlier run and
    /// is skipped on resume.
    async fn replay(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

/// Every subtask the engine knows how to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubTask {
    /// Move nodes to a lifecycle state.
    SetNodeState {
        /// Target nodes.
        nodes: Vec<String>,
        /// New state.
        state: NodeState,
    },
    /// Run an automation command on a node.
    NodeCommand {
        /// Target node.
        node: String,
        /// Command.
        action: NodeAction,
        /// Command parameters passed through to the automation layer.
        #[serde(default)]
        params: Value,
    },
    /// Wait until a process answers RPCs.
    WaitForServer {
        /// Target node.
        node: String,
        /// Process to wait for.
        server: ServerType,
    },
    /// Wait until a process serves traffic.
    WaitForServerReady {
        /// Target node.
        node: String,
        /// Process to wait for.
        server: ServerType,
    },
    /// Add or remove a master.
    ChangeMasterConfig {
        /// Master node.
        node: String,
        /// Membership change.
        change: QuorumChange,
    },
    /// Change the leader blacklist.
    ModifyLeaderBlacklist {
        /// Nodes to blacklist.
        add: Vec<String>,
        /// Nodes to clear.
        remove: Vec<String>,
    },
    /// Wait until blacklisted nodes hold no leaders.
    WaitForLeaderBlacklistCompletion {
        /// Nodes that must shed leadership.
        nodes: Vec<String>,
    },
    /// Change the data blacklist.
    ModifyDataBlacklist {
        /// Nodes to blacklist.
        add: Vec<String>,
        /// Nodes to clear.
        remove: Vec<String>,
    },
    /// Wait for data to move off data-blacklisted nodes.
    WaitForLoadMove,
    /// Turn the tablet load balancer on or off.
    LoadBalancerStateChange {
        /// New state.
        enable: bool,
    },
    /// Wait until a restarted tserver has caught up.
    CheckFollowerLag {
        /// Restarted node.
        node: String,
    },
    /// Settle interval after a restart.
    SleepAfterStartup {
        /// Restarted process type.
        server: ServerType,
    },
    /// Persist the software version of every cluster.
    UpdateSoftwareVersion {
        /// New version.
        version: String,
    },
    /// Persist server flags on the primary cluster.
    UpdateGFlags {
        /// New master flags, if they change.
        master_gflags: Option<BTreeMap<String, String>>,
        /// New tserver flags, if they change.
        tserver_gflags: Option<BTreeMap<String, String>>,
    },
    /// Persist the software upgrade state.
    UpdateSoftwareUpgradeState {
        /// New state.
        state: SoftwareUpgradeState,
    },
    /// Turn a process role on or off for a node.
    UpdateNodeProcess {
        /// Target node.
        node: String,
        /// Process role.
        server: ServerType,
        /// Whether the node runs it.
        enabled: bool,
    },
    /// Insert a node record unless it already exists.
    AddNodeDetails {
        /// The new node.
        node: Box<NodeDetails>,
    },
    /// Recount nodes per cluster and zone from the node set.
    RecomputePlacement,
    /// Delete the universe record.
    DeleteUniverse,
    /// Flag or unflag a running backup on the universe.
    SetBackupInProgress {
        /// New flag value.
        in_progress: bool,
    },
    /// Hand a backup or restore to the storage layer.
    RunBackup {
        /// Direction.
        kind: BackupKind,
        /// Request passed through to the storage layer.
        #[serde(default)]
        request: Value,
    },
}

impl SubTask {
    /// A command with no parameters.
    pub fn command(node: &NodeDetails, action: NodeAction) -> Self {
        Self::NodeCommand {
            node: node.node_name.clone(),
            action,
            params: Value::Null,
        }
    }

    /// Set the state of a batch of nodes.
    pub fn set_state(nodes: &[NodeDetails], state: NodeState) -> Self {
        Self::SetNodeState {
            nodes: nodes.iter().map(|n| n.node_name.clone()).collect(),
            state,
        }
    }
}

fn find_node(ctx: &ExecutionContext, universe: &Universe, name: &str) -> Result<NodeDetails> {
    universe
        .node(name)
        .cloned()
        .ok_or_else(|| CoreError::NodeNotFound {
            universe_id: ctx.universe_id,
            node_name: name.to_string(),
        })
}

async fn load_node(ctx: &ExecutionContext, name: &str) -> Result<NodeDetails> {
    let universe = ctx.universe().await?;
    find_node(ctx, &universe, name)
}

#[async_trait]
impl Task for SubTask {
    fn name(&self) -> String {
        match self {
            Self::SetNodeState { nodes, state } => {
                format!("SetNodeState({} -> {})", nodes.join(","), state)
            }
            Self::NodeCommand { node, action, .. } => format!("NodeCommand({}, {})", node, action),
            Self::WaitForServer { node, server } => format!("WaitForServer({}, {})", node, server),
            Self::WaitForServerReady { node, server } => {
                format!("WaitForServerReady({}, {})", node, server)
            }
            Self::ChangeMasterConfig { node, change } => {
                format!("ChangeMasterConfig({}, {:?})", node, change)
            }
            Self::ModifyLeaderBlacklist { add, remove } => format!(
                "ModifyLeaderBlacklist(+[{}] -[{}])",
                add.join(","),
                remove.join(",")
            ),
            Self::WaitForLeaderBlacklistCompletion { nodes } => {
                format!("WaitForLeaderBlacklistCompletion({})", nodes.join(","))
            }
            Self::ModifyDataBlacklist { add, remove } => format!(
                "ModifyDataBlacklist(+[{}] -[{}])",
                add.join(","),
                remove.join(",")
            ),
            Self::WaitForLoadMove => "WaitForLoadMove".to_string(),
            Self::LoadBalancerStateChange { enable } => {
                format!("LoadBalancerStateChange({})", enable)
            }
            Self::CheckFollowerLag { node } => format!("CheckFollowerLag({})", node),
            Self::SleepAfterStartup { server } => format!("SleepAfterStartup({})", server),
            Self::UpdateSoftwareVersion { version } => format!("UpdateSoftwareVersion({})", version),
            Self::UpdateGFlags { .. } => "UpdateGFlags".to_string(),
            Self::UpdateSoftwareUpgradeState { state } => {
                format!("UpdateSoftwareUpgradeState({:?})", state)
            }
            Self::UpdateNodeProcess {
                node,
                server,
                enabled,
            } => format!("UpdateNodeProcess({}, {}, {})", node, server, enabled),
            Self::AddNodeDetails { node } => format!("AddNodeDetails({})", node.node_name),
            Self::RecomputePlacement => "RecomputePlacement".to_string(),
            Self::DeleteUniverse => "DeleteUniverse".to_string(),
            Self::SetBackupInProgress { in_progress } => {
                format!("SetBackupInProgress({})", in_progress)
            }
            Self::RunBackup { kind, .. } => format!("RunBackup({:?})", kind),
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let updater = &ctx.services.updater;
        let admin = &ctx.services.admin;
        let universe_id = ctx.universe_id;

        match self {
            Self::SetNodeState { nodes, state } => {
                updater.set_node_states(universe_id, nodes, *state).await?;
            }

            Self::NodeCommand {
                node,
                action,
                params,
            } => {
                let details = load_node(ctx, node).await?;
                let response = ctx
                    .services
                    .automation
                    .execute(&details, *action, params)
                    .await?
                    .into_result(node, *action)?;
                debug!(node = %node, action = %action, output = %response.output, "Node command done");
            }

            Self::WaitForServer { node, server } => {
                let details = load_node(ctx, node).await?;
                let details = &details;
                let server = *server;
                poll_until(
                    &format!("{} on {} to answer", server, node),
                    ctx.server_ready_timeout(server),
                    ctx.config().poll_interval,
                    move || async move { admin.ping_server(details, server).await },
                )
                .await?;
            }

            Self::WaitForServerReady { node, server } => {
                let details = load_node(ctx, node).await?;
                let details = &details;
                let server = *server;
                poll_until(
                    &format!("{} on {} to be ready", server, node),
                    ctx.server_ready_timeout(server),
                    ctx.config().poll_interval,
                    move || async move { admin.is_server_ready(details, server).await },
                )
                .await?;
            }

            Self::ChangeMasterConfig { node, change } => {
                let details = load_node(ctx, node).await?;
                let coordinator = QuorumCoordinator::new(ctx);
                match change {
                    QuorumChange::Add => coordinator.add_to_quorum(&details).await?,
                    QuorumChange::Remove => coordinator.remove_from_quorum(&details).await?,
                }
            }

            Self::ModifyLeaderBlacklist { add, remove } => {
                QuorumCoordinator::new(ctx)
                    .modify_leader_blacklist(add, remove)
                    .await?;
            }

            Self::WaitForLeaderBlacklistCompletion { nodes } => {
                QuorumCoordinator::new(ctx)
                    .wait_for_leader_blacklist_completion(nodes)
                    .await?;
            }

            Self::ModifyDataBlacklist { add, remove } => {
                QuorumCoordinator::new(ctx)
                    .modify_data_blacklist(add, remove)
                    .await?;
            }

            Self::WaitForLoadMove => {
                QuorumCoordinator::new(ctx).wait_for_load_move().await?;
            }

            Self::LoadBalancerStateChange { enable } => {
                QuorumCoordinator::new(ctx).set_load_balancer(*enable).await?;
            }

            Self::CheckFollowerLag { node } => {
                let details = load_node(ctx, node).await?;
                let details = &details;
                let max_lag_ms = saturating_millis(ctx.config().max_follower_lag);
                poll_until(
                    &format!("followers on {} to catch up", node),
                    ctx.server_ready_timeout(ServerType::TServer),
                    ctx.config().poll_interval,
                    move || async move { Ok(admin.follower_lag_ms(details).await? <= max_lag_ms) },
                )
                .await?;
            }

            Self::SleepAfterStartup { server } => {
                let pause = ctx.sleep_after_restart(*server);
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = ctx.cancellation().cancelled() => {}
                }
            }

            Self::UpdateSoftwareVersion { version } => {
                updater
                    .update(universe_id, |universe| {
                        for cluster in &mut universe.details.clusters {
                            cluster.user_intent.software_version = version.clone();
                        }
                        Ok(())
                    })
                    .await?;
                info!(universe_id = %universe_id, version = %version, "Software version recorded");
            }

            Self::UpdateGFlags {
                master_gflags,
                tserver_gflags,
            } => {
                updater
                    .update(universe_id, |universe| {
                        let cluster = universe.primary_cluster_mut().ok_or_else(|| {
                            CoreError::Internal("universe has no primary cluster".to_string())
                        })?;
                        if let Some(flags) = master_gflags {
                            cluster.user_intent.master_gflags = flags.clone();
                        }
                        if let Some(flags) = tserver_gflags {
                            cluster.user_intent.tserver_gflags = flags.clone();
                        }
                        Ok(())
                    })
                    .await?;
            }

            Self::UpdateSoftwareUpgradeState { state } => {
                updater
                    .update(universe_id, |universe| {
                        universe.details.software_upgrade_state = *state;
                        Ok(())
                    })
                    .await?;
            }

            Self::UpdateNodeProcess {
                node,
                server,
                enabled,
            } => {
                updater
                    .update(universe_id, |universe| {
                        let details =
                            universe
                                .node_mut(node)
                                .ok_or_else(|| CoreError::NodeNotFound {
                                    universe_id,
                                    node_name: node.clone(),
                                })?;
                        match server {
                            ServerType::Master => details.is_master = *enabled,
                            ServerType::TServer => details.is_tserver = *enabled,
                        }
                        Ok(())
                    })
                    .await?;
            }

            Self::AddNodeDetails { node } => {
                updater
                    .update(universe_id, |universe| {
                        if universe.node(&node.node_name).is_none() {
                            universe.details.node_details_set.push(node.as_ref().clone());
                            universe
                                .details
                                .node_details_set
                                .sort_by_key(|n| n.node_idx);
                        }
                        Ok(())
                    })
                    .await?;
            }

            Self::RecomputePlacement => {
                updater
                    .update(universe_id, |universe| {
                        recompute_placement(universe);
                        Ok(())
                    })
                    .await?;
            }

            Self::DeleteUniverse => match updater.persistence().delete_universe(universe_id).await {
                Ok(()) | Err(CoreError::UniverseNotFound { .. }) => {
                    info!(universe_id = %universe_id, "Universe deleted");
                }
                Err(e) => return Err(e),
            },

            Self::SetBackupInProgress { in_progress } => {
                updater
                    .update(universe_id, |universe| {
                        universe.details.backup_in_progress = *in_progress;
                        Ok(())
                    })
                    .await?;
            }

            Self::RunBackup { kind, request } => {
                admin.run_backup(universe_id, *kind, request).await?;
                info!(universe_id = %universe_id, kind = ?kind, "Backup finished");
            }
        }
        Ok(())
    }

    async fn replay(&self, ctx: &ExecutionContext) -> Result<()> {
        match self {
            Self::LoadBalancerStateChange { enable } => ctx.set_load_balancer_disabled(!enable),
            Self::ModifyLeaderBlacklist { add, remove } => {
                ctx.record_leader_blacklist(add, remove).await
            }
            _ => {}
        }
        Ok(())
    }
}

/// Set node counts of every cluster and zone from the nodes still in the
/// universe.
fn recompute_placement(universe: &mut Universe) {
    let nodes: Vec<NodeDetails> = universe
        .details
        .node_details_set
        .iter()
        .filter(|n| !n.state.is_gone())
        .cloned()
        .collect();
    for cluster in &mut universe.details.clusters {
        let in_cluster: Vec<&NodeDetails> = nodes
            .iter()
            .filter(|n| n.is_in_placement(cluster.uuid))
            .collect();
        cluster.user_intent.num_nodes = in_cluster.len() as u32;
        for az in &mut cluster.placement_info.azs {
            az.num_nodes_in_az = in_cluster.iter().filter(|n| n.az_uuid == az.uuid).count() as u32;
        }
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{MockCluster, NodeAutomation};
    use crate::config::OrchestrationConfig;
    use crate::context::Services;
    use crate::model::{UniverseBuilder, UserIntent};
    use crate::persistence::{InMemoryPersistence, Persistence};
    use crate::updater::UniverseUpdater;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    async fn context() -> (ExecutionContext, Arc<MockCluster>) {
        context_with(OrchestrationConfig {
            master_ready_timeout: Duration::from_millis(200),
            tserver_ready_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            sleep_after_tserver_restart: Duration::from_secs(3600),
            ..Default::default()
        })
        .await
    }

    async fn context_with(config: OrchestrationConfig) -> (ExecutionContext, Arc<MockCluster>) {
        let universe = UniverseBuilder::new("sub")
            .primary(UserIntent::new(3, 3, "2.20.0"), &["az1", "az2", "az3"])
            .build();
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.insert_universe(&universe).await.unwrap();
        let cluster = Arc::new(MockCluster::for_universe(&universe));
        let services = Services::new(
            Arc::new(UniverseUpdater::new(persistence)),
            cluster.clone(),
            cluster.clone(),
            config,
        );
        let ctx = ExecutionContext::new(
            services,
            Uuid::new_v4(),
            universe.universe_id,
            true,
            CancellationToken::new(),
        );
        (ctx, cluster)
    }

    #[test]
    fn test_plan_serde_shape() {
        let task = SubTask::NodeCommand {
            node: "n1".to_string(),
            action: NodeAction::Stop(ServerType::TServer),
            params: Value::Null,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "node_command");
        assert_eq!(json["action"]["action"], "stop");
        let back: SubTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);

        let json = serde_json::to_value(SubTask::WaitForLoadMove).unwrap();
        assert_eq!(json, serde_json::json!({"type": "wait_for_load_move"}));
    }

    #[tokio::test]
    async fn test_node_command_failure_is_error() {
        let (ctx, cluster) = context().await;
        let action = NodeAction::Configure(ServerType::TServer);
        cluster.fail_action("yb-sub-n2", action, 2).await;

        let task = SubTask::NodeCommand {
            node: "yb-sub-n2".to_string(),
            action,
            params: Value::Null,
        };
        let err = task.run(&ctx).await.unwrap_err();
        assert!(matches!(err, CoreError::AutomationFailed { exit_code: 2, .. }));
        task.run(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_stopped_server_times_out() {
        let (ctx, cluster) = context().await;
        SubTask::NodeCommand {
            node: "yb-sub-n1".to_string(),
            action: NodeAction::Stop(ServerType::TServer),
            params: Value::Null,
        }
        .run(&ctx)
        .await
        .unwrap();
        assert!(!cluster.is_running("yb-sub-n1", ServerType::TServer).await);

        let err = SubTask::WaitForServer {
            node: "yb-sub-n1".to_string(),
            server: ServerType::TServer,
        }
        .run(&ctx)
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), "WAIT_TIMEOUT");
    }

    #[tokio::test]
    async fn test_ready_timeout_follows_server_type() {
        let (ctx, cluster) = context_with(OrchestrationConfig {
            master_ready_timeout: Duration::from_millis(50),
            tserver_ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        })
        .await;
        assert_eq!(ctx.server_ready_timeout(ServerType::Master), Duration::from_millis(50));
        assert_eq!(ctx.server_ready_timeout(ServerType::TServer), Duration::from_secs(10));

        let universe = ctx.universe().await.unwrap();
        let n1 = universe.node("yb-sub-n1").unwrap().clone();
        for server in [ServerType::Master, ServerType::TServer] {
            cluster
                .execute(&n1, NodeAction::Stop(server), &Value::Null)
                .await
                .unwrap();
        }

        let err = SubTask::WaitForServer {
            node: "yb-sub-n1".to_string(),
            server: ServerType::Master,
        }
        .run(&ctx)
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), "WAIT_TIMEOUT");

        // The tserver comes back well after the master bound has passed.
        let starter = {
            let cluster = cluster.clone();
            let n1 = n1.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cluster
                    .execute(&n1, NodeAction::Start(ServerType::TServer), &Value::Null)
                    .await
                    .unwrap();
            })
        };
        SubTask::WaitForServer {
            node: "yb-sub-n1".to_string(),
            server: ServerType::TServer,
        }
        .run(&ctx)
        .await
        .unwrap();
        starter.await.unwrap();
    }

    #[test]
    fn test_saturating_millis() {
        assert_eq!(saturating_millis(Duration::from_secs(60)), 60_000);
        assert_eq!(saturating_millis(Duration::from_secs(u64::MAX / 100)), u64::MAX);
    }

    #[tokio::test]
    async fn test_sleep_after_startup_stops_on_cancel() {
        let (ctx, _) = context().await;
        ctx.cancellation().cancel();
        SubTask::SleepAfterStartup {
            server: ServerType::TServer,
        }
        .run(&ctx)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_replay_restores_run_state() {
        let (ctx, _) = context().await;
        SubTask::LoadBalancerStateChange { enable: false }
            .replay(&ctx)
            .await
            .unwrap();
        SubTask::ModifyLeaderBlacklist {
            add: vec!["yb-sub-n1".to_string()],
            remove: vec![],
        }
        .replay(&ctx)
        .await
        .unwrap();
        assert!(ctx.load_balancer_disabled());
        assert_eq!(ctx.leader_blacklisted().await, vec!["yb-sub-n1".to_string()]);
    }

    #[tokio::test]
    async fn test_add_node_details_is_idempotent() {
        let (ctx, _) = context().await;
        let universe = ctx.universe().await.unwrap();
        let mut node = universe.details.node_details_set[0].clone();
        node.node_name = "yb-sub-n4".to_string();
        node.node_idx = 4;
        node.node_uuid = Uuid::new_v4();
        node.state = NodeState::ToBeAdded;

        let task = SubTask::AddNodeDetails {
            node: Box::new(node),
        };
        task.run(&ctx).await.unwrap();
        task.run(&ctx).await.unwrap();
        SubTask::RecomputePlacement.run(&ctx).await.unwrap();

        let universe = ctx.universe().await.unwrap();
        assert_eq!(universe.details.node_details_set.len(), 4);
        let primary = universe.primary_cluster().unwrap();
        assert_eq!(primary.user_intent.num_nodes, 4);
        assert_eq!(primary.placement_info.azs[0].num_nodes_in_az, 2);
    }

    #[tokio::test]
    async fn test_delete_universe_twice() {
        let (ctx, _) = context().await;
        SubTask::DeleteUniverse.run(&ctx).await.unwrap();
        SubTask::DeleteUniverse.run(&ctx).await.unwrap();
        assert!(ctx.universe().await.is_err());
    }
}
