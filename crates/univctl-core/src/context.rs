// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run execution context.
//!
//! [`Services`] holds the long-lived collaborators shared by every run of a
//! commissioner. [`ExecutionContext`] is built once per top-level task run,
//! handed by reference to every subtask, and dropped when the run ends.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::automation::{ClusterAdmin, NodeAutomation};
use crate::config::OrchestrationConfig;
use crate::error::{CoreError, Result};
use crate::model::{ServerType, Universe};
use crate::updater::UniverseUpdater;

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct Services {
    /// Versioned universe updates.
    pub updater: Arc<UniverseUpdater>,
    /// Node command execution.
    pub automation: Arc<dyn NodeAutomation>,
    /// Cluster admin calls.
    pub admin: Arc<dyn ClusterAdmin>,
    /// Timeouts, intervals and policy flags.
    pub config: Arc<OrchestrationConfig>,
    /// Bounded worker pool for subtasks.
    pub workers: Arc<Semaphore>,
}

impl Services {
    /// Bundle collaborators; the worker pool is sized from `config`.
    pub fn new(
        updater: Arc<UniverseUpdater>,
        automation: Arc<dyn NodeAutomation>,
        admin: Arc<dyn ClusterAdmin>,
        config: OrchestrationConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_parallel_subtasks.max(1)));
        Self {
            updater,
            automation,
            admin,
            config: Arc::new(config),
            workers,
        }
    }
}

/// State of one top-level task run.
pub struct ExecutionContext {
    /// Shared collaborators.
    pub services: Services,
    /// The top-level task.
    pub task_id: Uuid,
    /// Universe the task operates on.
    pub universe_id: Uuid,
    /// False when resuming or retrying.
    pub is_first_try: bool,
    /// Leader blacklisting before stopping tservers.
    pub blacklist_leaders: bool,
    /// Follower lag check after restarting tservers.
    pub follower_lag_check: bool,
    cancel: CancellationToken,
    locked_universes: Mutex<BTreeSet<Uuid>>,
    masters: Mutex<Option<BTreeSet<String>>>,
    load_balancer_disabled: AtomicBool,
    leader_blacklisted: Mutex<BTreeSet<String>>,
}

impl ExecutionContext {
    /// Create the context for one run.
    pub fn new(
        services: Services,
        task_id: Uuid,
        universe_id: Uuid,
        is_first_try: bool,
        cancel: CancellationToken,
    ) -> Self {
        let blacklist_leaders = services.config.blacklist_leaders;
        let follower_lag_check = services.config.follower_lag_check;
        Self {
            services,
            task_id,
            universe_id,
            is_first_try,
            blacklist_leaders,
            follower_lag_check,
            cancel,
            locked_universes: Mutex::new(BTreeSet::new()),
            masters: Mutex::new(None),
            load_balancer_disabled: AtomicBool::new(false),
            leader_blacklisted: Mutex::new(BTreeSet::new()),
        }
    }

    /// Shorthand for the configuration.
    pub fn config(&self) -> &OrchestrationConfig {
        &self.services.config
    }

    /// Current universe record.
    pub async fn universe(&self) -> Result<Universe> {
        self.services.updater.load(self.universe_id).await
    }

    /// The run's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with [`CoreError::Cancelled`] if the run was aborted.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled {
                task_id: self.task_id,
            });
        }
        Ok(())
    }

    /// Readiness timeout for a server type.
    pub fn server_ready_timeout(&self, server: ServerType) -> Duration {
        match server {
            ServerType::Master => self.config().master_ready_timeout,
            ServerType::TServer => self.config().tserver_ready_timeout,
        }
    }

    /// Settle interval after restarting a server type.
    pub fn sleep_after_restart(&self, server: ServerType) -> Duration {
        match server {
            ServerType::Master => self.config().sleep_after_master_restart,
            ServerType::TServer => self.config().sleep_after_tserver_restart,
        }
    }

    /// Record that this run holds the lock on a universe.
    pub async fn mark_locked(&self, universe_id: Uuid) {
        self.locked_universes.lock().await.insert(universe_id);
    }

    /// Record that this run released a universe.
    pub async fn mark_unlocked(&self, universe_id: Uuid) {
        self.locked_universes.lock().await.remove(&universe_id);
    }

    /// Universes currently locked by this run.
    pub async fn locked_universes(&self) -> BTreeSet<Uuid> {
        self.locked_universes.lock().await.clone()
    }

    /// Current master quorum, fetched on first use.
    pub async fn quorum(&self) -> Result<BTreeSet<String>> {
        let mut masters = self.masters.lock().await;
        if let Some(cached) = masters.as_ref() {
            return Ok(cached.clone());
        }
        let fetched: BTreeSet<String> = self
            .services
            .admin
            .list_masters(self.universe_id)
            .await?
            .into_iter()
            .collect();
        debug!(task_id = %self.task_id, masters = fetched.len(), "Fetched master quorum");
        *masters = Some(fetched.clone());
        Ok(fetched)
    }

    /// Drop the cached quorum after a membership change.
    pub async fn invalidate_quorum(&self) {
        *self.masters.lock().await = None;
    }

    /// Record the load balancer state set by this run.
    pub fn set_load_balancer_disabled(&self, disabled: bool) {
        self.load_balancer_disabled.store(disabled, Ordering::SeqCst);
    }

    /// Whether this run turned the load balancer off and has not turned it
    /// back on.
    pub fn load_balancer_disabled(&self) -> bool {
        self.load_balancer_disabled.load(Ordering::SeqCst)
    }

    /// Track leader blacklist changes made by this run.
    pub async fn record_leader_blacklist(&self, added: &[String], removed: &[String]) {
        let mut set = self.leader_blacklisted.lock().await;
        for node in added {
            set.insert(node.clone());
        }
        for node in removed {
            set.remove(node);
        }
    }

    /// Nodes this run put on the leader blacklist and has not removed.
    pub async fn leader_blacklisted(&self) -> Vec<String> {
        self.leader_blacklisted.lock().await.iter().cloned().collect()
    }
}
