// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Master quorum membership and blacklist coordination.
//!
//! Quorum changes check before they act: a master is added only once its
//! process answers, removed only once it is confirmed stopped, and a change
//! that is already in effect is skipped so a resumed run can repeat it.

use tracing::{debug, info, instrument};

use crate::automation::{BlacklistKind, QuorumChange};
use crate::context::ExecutionContext;
use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, ServerType, Universe};
use crate::wait::poll_until;

/// Whether a node may shed its tablet leadership before a restart.
///
/// Single-replica clusters have no other copy to take over, so their nodes
/// are never blacklisted.
pub fn leader_blacklist_eligible(universe: &Universe, node: &NodeDetails) -> bool {
    node.is_tserver && universe.replication_factor_for(node) > 1
}

/// Quorum and blacklist operations of one run.
pub struct QuorumCoordinator<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> QuorumCoordinator<'a> {
    /// Coordinator bound to a run.
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx }
    }

    /// Add a running master to the quorum.
    #[instrument(skip(self, node), fields(node = %node.node_name))]
    pub async fn add_to_quorum(&self, node: &NodeDetails) -> Result<()> {
        let admin = &self.ctx.services.admin;
        if !admin.ping_server(node, ServerType::Master).await? {
            return Err(CoreError::ClusterAdminFailed {
                operation: "add_to_quorum".to_string(),
                details: format!("master on {} is not answering", node.node_name),
            });
        }
        if self.ctx.quorum().await?.contains(&node.node_name) {
            debug!("Already a quorum member");
            return Ok(());
        }
        admin
            .change_master_config(self.ctx.universe_id, node, QuorumChange::Add)
            .await?;
        self.ctx.invalidate_quorum().await;
        info!("Added master to quorum");
        Ok(())
    }

    /// Remove a stopped master from the quorum. Removing the current leader
    /// is allowed; the remaining members elect a new one.
    #[instrument(skip(self, node), fields(node = %node.node_name))]
    pub async fn remove_from_quorum(&self, node: &NodeDetails) -> Result<()> {
        let admin = &self.ctx.services.admin;
        if !self.ctx.quorum().await?.contains(&node.node_name) {
            debug!("Not a quorum member");
            return Ok(());
        }
        if admin.ping_server(node, ServerType::Master).await? {
            return Err(CoreError::ClusterAdminFailed {
                operation: "remove_from_quorum".to_string(),
                details: format!("master on {} is still running", node.node_name),
            });
        }
        admin
            .change_master_config(self.ctx.universe_id, node, QuorumChange::Remove)
            .await?;
        self.ctx.invalidate_quorum().await;
        info!("Removed master from quorum");
        Ok(())
    }

    /// Add and remove nodes from the leader blacklist.
    pub async fn modify_leader_blacklist(&self, add: &[String], remove: &[String]) -> Result<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        self.ctx
            .services
            .admin
            .modify_blacklist(self.ctx.universe_id, BlacklistKind::Leader, add, remove)
            .await?;
        self.ctx.record_leader_blacklist(add, remove).await;
        debug!(?add, ?remove, "Leader blacklist modified");
        Ok(())
    }

    /// Wait until none of `nodes` holds tablet leadership.
    pub async fn wait_for_leader_blacklist_completion(&self, nodes: &[String]) -> Result<()> {
        let admin = &self.ctx.services.admin;
        let universe_id = self.ctx.universe_id;
        let config = self.ctx.config();
        poll_until(
            "leader blacklist completion",
            config.leader_blacklist_timeout,
            config.poll_interval,
            move || async move { Ok(admin.leaders_held(universe_id, nodes).await? == 0) },
        )
        .await
    }

    /// Add and remove nodes from the data blacklist.
    pub async fn modify_data_blacklist(&self, add: &[String], remove: &[String]) -> Result<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        self.ctx
            .services
            .admin
            .modify_blacklist(self.ctx.universe_id, BlacklistKind::Data, add, remove)
            .await
    }

    /// Wait until data has moved off data-blacklisted nodes.
    pub async fn wait_for_load_move(&self) -> Result<()> {
        let admin = &self.ctx.services.admin;
        let universe_id = self.ctx.universe_id;
        let config = self.ctx.config();
        poll_until(
            "data load move",
            config.load_move_timeout,
            config.poll_interval,
            move || async move { Ok(admin.load_move_completion(universe_id).await? >= 100.0) },
        )
        .await
    }

    /// Turn the tablet load balancer on or off and remember the state.
    pub async fn set_load_balancer(&self, enabled: bool) -> Result<()> {
        self.ctx
            .services
            .admin
            .set_load_balancer_enabled(self.ctx.universe_id, enabled)
            .await?;
        self.ctx.set_load_balancer_disabled(!enabled);
        info!(enabled, "Load balancer state changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{MockCluster, MockEvent, NodeAction, NodeAutomation};
    use crate::config::OrchestrationConfig;
    use crate::context::Services;
    use crate::model::{UniverseBuilder, UserIntent};
    use crate::persistence::{InMemoryPersistence, Persistence};
    use crate::updater::UniverseUpdater;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    async fn context(rf: u32) -> (ExecutionContext, Arc<MockCluster>, Universe) {
        let universe = UniverseBuilder::new("quorum")
            .primary(UserIntent::new(rf, 3, "2.20.0"), &["az1", "az2", "az3"])
            .build();
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.insert_universe(&universe).await.unwrap();
        let cluster = Arc::new(MockCluster::for_universe(&universe));
        let config = OrchestrationConfig {
            leader_blacklist_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
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
        (ctx, cluster, universe)
    }

    #[tokio::test]
    async fn test_blacklist_eligibility() {
        let (_, _, rf3) = context(3).await;
        assert!(leader_blacklist_eligible(&rf3, &rf3.details.node_details_set[0]));

        let (_, _, rf1) = context(1).await;
        assert!(!leader_blacklist_eligible(&rf1, &rf1.details.node_details_set[0]));
    }

    #[tokio::test]
    async fn test_remove_requires_stopped_master() {
        let (ctx, cluster, universe) = context(3).await;
        let n1 = universe.node("yb-quorum-n1").unwrap();
        let coordinator = QuorumCoordinator::new(&ctx);

        let err = coordinator.remove_from_quorum(n1).await.unwrap_err();
        assert_eq!(err.error_code(), "CLUSTER_ADMIN_FAILED");

        cluster
            .execute(n1, NodeAction::Stop(ServerType::Master), &Value::Null)
            .await
            .unwrap();
        coordinator.remove_from_quorum(n1).await.unwrap();
        assert!(!cluster.quorum().await.contains("yb-quorum-n1"));

        // Repeating the removal is a no-op.
        coordinator.remove_from_quorum(n1).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_requires_running_master() {
        let (ctx, cluster, universe) = context(3).await;
        let n1 = universe.node("yb-quorum-n1").unwrap();
        let coordinator = QuorumCoordinator::new(&ctx);

        cluster
            .execute(n1, NodeAction::Stop(ServerType::Master), &Value::Null)
            .await
            .unwrap();
        coordinator.remove_from_quorum(n1).await.unwrap();
        assert!(coordinator.add_to_quorum(n1).await.is_err());

        cluster
            .execute(n1, NodeAction::Start(ServerType::Master), &Value::Null)
            .await
            .unwrap();
        coordinator.add_to_quorum(n1).await.unwrap();
        coordinator.add_to_quorum(n1).await.unwrap();

        let adds = cluster
            .events()
            .await
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Quorum { change: QuorumChange::Add, .. }))
            .count();
        assert_eq!(adds, 1);
    }

    #[tokio::test]
    async fn test_leader_blacklist_wait() {
        let (ctx, cluster, _) = context(3).await;
        let coordinator = QuorumCoordinator::new(&ctx);
        let nodes = vec!["yb-quorum-n2".to_string()];

        coordinator.modify_leader_blacklist(&nodes, &[]).await.unwrap();
        coordinator
            .wait_for_leader_blacklist_completion(&nodes)
            .await
            .unwrap();
        assert_eq!(ctx.leader_blacklisted().await, nodes);

        coordinator.modify_leader_blacklist(&[], &nodes).await.unwrap();
        assert!(cluster.leader_blacklist().await.is_empty());
        assert!(ctx.leader_blacklisted().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_blacklist_wait_times_out() {
        let (ctx, _, _) = context(3).await;
        let coordinator = QuorumCoordinator::new(&ctx);
        // Never blacklisted, so it keeps its leaders.
        let err = coordinator
            .wait_for_leader_blacklist_completion(&["yb-quorum-n3".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn test_load_balancer_state_tracked() {
        let (ctx, cluster, _) = context(3).await;
        let coordinator = QuorumCoordinator::new(&ctx);

        coordinator.set_load_balancer(false).await.unwrap();
        assert!(ctx.load_balancer_disabled());
        assert!(!cluster.load_balancer_enabled().await);

        coordinator.set_load_balancer(true).await.unwrap();
        assert!(!ctx.load_balancer_disabled());
    }
}
