// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for univctl-core end-to-end tests.
//!
//! Provides TestContext: a store (in-memory, or SQLite in a temporary
//! directory), a mock cluster mirroring one universe, and a commissioner with
//! short timeouts wired to both.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use univctl_core::automation::{MockCluster, MockEvent, NodeAction};
use univctl_core::commissioner::{Commissioner, TaskStatus};
use univctl_core::config::OrchestrationConfig;
use univctl_core::model::{NodeState, ServerType, Universe, UniverseBuilder, UserIntent};
use univctl_core::persistence::{InMemoryPersistence, Persistence, SqlitePersistence};

/// Orchestration settings that keep tests fast.
pub fn fast_config() -> OrchestrationConfig {
    OrchestrationConfig {
        poll_interval: Duration::from_millis(5),
        sleep_after_master_restart: Duration::ZERO,
        sleep_after_tserver_restart: Duration::ZERO,
        master_ready_timeout: Duration::from_secs(5),
        tserver_ready_timeout: Duration::from_secs(5),
        leader_blacklist_timeout: Duration::from_secs(5),
        load_move_timeout: Duration::from_secs(5),
        abort_wait_timeout: Duration::from_millis(300),
        ..OrchestrationConfig::default()
    }
}

/// One universe with its store, mock cluster and commissioner.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub cluster: Arc<MockCluster>,
    pub commissioner: Commissioner,
    pub universe_id: Uuid,
    pub name: String,
    /// Keeps the SQLite file alive for the life of the test.
    _dir: Option<TempDir>,
}

impl TestContext {
    /// A universe named `name` with one primary cluster spread over
    /// `az1..azN`, N being the replication factor.
    pub async fn new(name: &str, rf: u32, num_nodes: u32) -> Self {
        Self::with_config(name, rf, num_nodes, fast_config()).await
    }

    pub async fn with_config(
        name: &str,
        rf: u32,
        num_nodes: u32,
        config: OrchestrationConfig,
    ) -> Self {
        Self::with_store(name, rf, num_nodes, config, Arc::new(InMemoryPersistence::new()), None)
            .await
    }

    /// Same as [`TestContext::new`], backed by a SQLite file.
    pub async fn sqlite(name: &str, rf: u32, num_nodes: u32) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = SqlitePersistence::from_path(dir.path().join("univctl.db"))
            .await
            .expect("Failed to open SQLite store");
        Self::with_store(
            name,
            rf,
            num_nodes,
            fast_config(),
            Arc::new(persistence),
            Some(dir),
        )
        .await
    }

    async fn with_store(
        name: &str,
        rf: u32,
        num_nodes: u32,
        config: OrchestrationConfig,
        persistence: Arc<dyn Persistence>,
        dir: Option<TempDir>,
    ) -> Self {
        let azs: Vec<String> = (1..=rf).map(|i| format!("az{}", i)).collect();
        let azs: Vec<&str> = azs.iter().map(String::as_str).collect();
        let universe = UniverseBuilder::new(name)
            .primary(UserIntent::new(rf, num_nodes, "2.20.0"), &azs)
            .build();

        persistence
            .insert_universe(&universe)
            .await
            .expect("Failed to insert universe");
        let cluster = Arc::new(MockCluster::for_universe(&universe));
        let commissioner = Self::commissioner_on(&persistence, &cluster, config);

        Self {
            persistence,
            cluster,
            commissioner,
            universe_id: universe.universe_id,
            name: name.to_string(),
            _dir: dir,
        }
    }

    /// A second commissioner sharing the store and cluster, as a restarted
    /// process would.
    pub fn commissioner_on(
        persistence: &Arc<dyn Persistence>,
        cluster: &Arc<MockCluster>,
        config: OrchestrationConfig,
    ) -> Commissioner {
        Commissioner::builder()
            .persistence(persistence.clone())
            .automation(cluster.clone())
            .cluster_admin(cluster.clone())
            .config(config)
            .build()
            .expect("Failed to build commissioner")
    }

    /// Overwrite the stored state of node `idx` outside of any task.
    pub async fn set_node_state(&self, idx: u32, state: NodeState) {
        let node = self.node(idx);
        let version = self.version().await;
        self.persistence
            .compare_and_swap(self.universe_id, version, &mut |u: &mut Universe| {
                if let Some(n) = u.node_mut(&node) {
                    n.state = state;
                }
                Ok(())
            })
            .await
            .expect("Failed to set node state");
    }

    pub async fn universe(&self) -> Universe {
        self.persistence
            .load_universe(self.universe_id)
            .await
            .expect("Failed to load universe")
    }

    pub async fn version(&self) -> i64 {
        self.universe().await.version
    }

    /// Wait for a task, failing the test if it does not finish in time.
    pub async fn wait(&self, task_id: Uuid) -> TaskStatus {
        tokio::time::timeout(Duration::from_secs(30), self.commissioner.wait(task_id))
            .await
            .expect("Task did not finish in time")
            .expect("Failed to read task status")
    }

    pub fn node(&self, idx: u32) -> String {
        format!("yb-{}-n{}", self.name, idx)
    }

    /// Node automation calls for one process type, as (node, is_stop).
    pub async fn restarts(&self, server: ServerType) -> Vec<(String, bool)> {
        self.cluster
            .actions()
            .await
            .into_iter()
            .filter_map(|(node, action)| match action {
                NodeAction::Stop(s) if s == server => Some((node, true)),
                NodeAction::Start(s) if s == server => Some((node, false)),
                _ => None,
            })
            .collect()
    }

    /// Position of the first event matching `pred`.
    pub async fn event_position(&self, pred: impl Fn(&MockEvent) -> bool) -> Option<usize> {
        self.cluster.events().await.iter().position(pred)
    }
}

/// Assert that every stop of a node is directly followed by its start,
/// i.e. nodes were cycled one at a time.
pub fn assert_sequential_cycles(restarts: &[(String, bool)], expected_cycles: usize) {
    assert_eq!(
        restarts.len(),
        expected_cycles * 2,
        "unexpected restarts: {:?}",
        restarts
    );
    for pair in restarts.chunks(2) {
        let (stopped, is_stop) = &pair[0];
        let (started, second_is_stop) = &pair[1];
        assert!(*is_stop, "expected a stop first in {:?}", pair);
        assert!(!*second_is_stop, "expected a start second in {:?}", pair);
        assert_eq!(stopped, started, "cycle crossed nodes: {:?}", pair);
    }
}
