// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commissioner: the caller-facing task API.
//!
//! Accepts task requests, locks the universe, and runs each task on its own
//! tokio task:
//!
//! 1. build the subtask plan (or load the persisted one when resuming)
//! 2. run the queue, recording progress
//! 3. on failure, fail the software upgrade state if needed and compensate
//! 4. unlock, clearing the placement restriction only on success
//! 5. record the final task state
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use univctl_core::commissioner::Commissioner;
//! use univctl_core::tasks::{RestartParams, TaskParams, TaskRequest};
//! use univctl_core::upgrade::UpgradeOption;
//!
//! let commissioner = Commissioner::builder()
//!     .persistence(persistence)
//!     .automation(automation.clone())
//!     .cluster_admin(automation)
//!     .build()?;
//!
//! let task_id = commissioner
//!     .submit(TaskRequest::new(
//!         universe_id,
//!         universe_version,
//!         TaskParams::RestartUniverse(RestartParams {
//!             upgrade_option: UpgradeOption::RollingUpgrade,
//!         }),
//!     ))
//!     .await?;
//! let status = commissioner.wait(task_id).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::automation::{ClusterAdmin, HealthSink, NodeAutomation, NoopHealthSink};
use crate::config::OrchestrationConfig;
use crate::context::{ExecutionContext, Services};
use crate::error::{CoreError, ErrorKind, Result};
use crate::lock::{LockManager, LockOptions, TaskControl};
use crate::model::Universe;
use crate::persistence::{Persistence, TaskRecord, TaskState};
use crate::policy::FailurePolicy;
use crate::queue::SubTaskQueue;
use crate::task_types::{TaskType, TaskTypeTable};
use crate::tasks::{PlanContext, TaskParams, TaskRequest, UniverseTask};
use crate::updater::{ANY_VERSION, UniverseUpdater};
use crate::upgrade::FlowPolicy;

/// Caller-visible state of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    /// The task.
    pub task_id: Uuid,
    /// Target universe.
    pub universe_id: Uuid,
    /// Task type.
    pub task_type: TaskType,
    /// Lifecycle state.
    pub state: TaskState,
    /// False for retries and resumed runs.
    pub is_first_try: bool,
    /// Task this one retries.
    pub retry_of: Option<Uuid>,
    /// Subtasks in the plan, once it is built.
    pub total_subtasks: usize,
    /// Subtasks recorded as done.
    pub completed_subtasks: usize,
    /// Group that was running last (the failing one after a failure).
    pub current_group: Option<String>,
    /// Root cause of a failure.
    pub error: Option<String>,
    /// Stable code of the root cause.
    pub error_code: Option<String>,
    /// Whether the universe is restricted by a failed topology change.
    pub placement_modification_pending: bool,
}

struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    join: Option<JoinHandle<()>>,
}

/// Runs executing in this process.
#[derive(Default)]
struct TaskRegistry {
    runs: Mutex<HashMap<Uuid, RunHandle>>,
}

impl TaskRegistry {
    async fn register(&self, task_id: Uuid, cancel: CancellationToken) -> watch::Sender<bool> {
        let (done_tx, done_rx) = watch::channel(false);
        self.runs.lock().await.insert(
            task_id,
            RunHandle {
                cancel,
                done: done_rx,
                join: None,
            },
        );
        done_tx
    }

    async fn attach(&self, task_id: Uuid, join: JoinHandle<()>) {
        if let Some(run) = self.runs.lock().await.get_mut(&task_id) {
            run.join = Some(join);
        }
    }

    async fn finish(&self, task_id: Uuid, done: watch::Sender<bool>) {
        self.runs.lock().await.remove(&task_id);
        let _ = done.send(true);
    }

    async fn watcher(&self, task_id: Uuid) -> Option<watch::Receiver<bool>> {
        self.runs.lock().await.get(&task_id).map(|r| r.done.clone())
    }

    async fn drain(&self) -> Vec<(Uuid, JoinHandle<()>)> {
        self.runs
            .lock()
            .await
            .drain()
            .filter_map(|(id, run)| run.join.map(|j| (id, j)))
            .collect()
    }
}

#[async_trait]
impl TaskControl for TaskRegistry {
    async fn abort(&self, task_id: Uuid) -> bool {
        match self.runs.lock().await.get(&task_id) {
            Some(run) if !*run.done.borrow() => {
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    async fn is_running(&self, task_id: Uuid) -> bool {
        self.runs
            .lock()
            .await
            .get(&task_id)
            .map(|run| !*run.done.borrow())
            .unwrap_or(false)
    }
}

/// Builder for a [`Commissioner`].
pub struct CommissionerBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    automation: Option<Arc<dyn NodeAutomation>>,
    admin: Option<Arc<dyn ClusterAdmin>>,
    health: Arc<dyn HealthSink>,
    table: TaskTypeTable,
    config: OrchestrationConfig,
}

impl std::fmt::Debug for CommissionerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommissionerBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("automation", &self.automation.as_ref().map(|_| "..."))
            .field("admin", &self.admin.as_ref().map(|_| "..."))
            .field("table", &self.table)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for CommissionerBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            automation: None,
            admin: None,
            health: Arc::new(NoopHealthSink),
            table: TaskTypeTable::standard(),
            config: OrchestrationConfig::default(),
        }
    }
}

impl CommissionerBuilder {
    /// Durable store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Node command execution (required).
    pub fn automation(mut self, automation: Arc<dyn NodeAutomation>) -> Self {
        self.automation = Some(automation);
        self
    }

    /// Cluster admin calls (required).
    pub fn cluster_admin(mut self, admin: Arc<dyn ClusterAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Health check notifications. Default: dropped.
    pub fn health(mut self, health: Arc<dyn HealthSink>) -> Self {
        self.health = health;
        self
    }

    /// Lock policy table. Default: [`TaskTypeTable::standard`].
    pub fn task_types(mut self, table: TaskTypeTable) -> Self {
        self.table = table;
        self
    }

    /// Timeouts, pool size and policy flags.
    pub fn config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the commissioner. Fails if a required collaborator is missing.
    pub fn build(self) -> Result<Commissioner> {
        let persistence = self
            .persistence
            .ok_or_else(|| CoreError::Internal("persistence is required".to_string()))?;
        let automation = self
            .automation
            .ok_or_else(|| CoreError::Internal("node automation is required".to_string()))?;
        let admin = self
            .admin
            .ok_or_else(|| CoreError::Internal("cluster admin is required".to_string()))?;

        let abort_wait = self.config.abort_wait_timeout;
        let poll_interval = self.config.poll_interval;
        let updater = Arc::new(UniverseUpdater::new(persistence));
        let services = Services::new(updater.clone(), automation, admin, self.config);
        let table = Arc::new(self.table);
        let registry = Arc::new(TaskRegistry::default());
        let locks = LockManager::new(updater, table.clone(), registry.clone(), self.health)
            .with_abort_wait(abort_wait, poll_interval);

        Ok(Commissioner {
            inner: Arc::new(Inner {
                services,
                locks,
                policy: FailurePolicy::new(table),
                registry,
            }),
        })
    }
}

struct Inner {
    services: Services,
    locks: LockManager,
    policy: FailurePolicy,
    registry: Arc<TaskRegistry>,
}

/// One run to execute: a fresh submission, a retry or a resumption.
struct Run {
    task_id: Uuid,
    universe_id: Uuid,
    task_type: TaskType,
    task: Box<dyn UniverseTask>,
    is_first_try: bool,
    plan: Option<SubTaskQueue>,
}

/// Accepts tasks and drives them to completion.
#[derive(Clone)]
pub struct Commissioner {
    inner: Arc<Inner>,
}

impl Commissioner {
    /// Start configuring a commissioner.
    pub fn builder() -> CommissionerBuilder {
        CommissionerBuilder::default()
    }

    /// The durable store.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.inner.services.updater.persistence()
    }

    /// The failure policy.
    pub fn policy(&self) -> &FailurePolicy {
        &self.inner.policy
    }

    /// Validate, lock and start a task.
    ///
    /// Precondition failures (unknown universe, invalid parameters, stale
    /// version, universe locked or restricted) are returned here and leave
    /// no trace. Once this returns, the task owns the universe lock.
    #[instrument(skip(self, request), fields(universe_id = %request.universe_id, task_type = %request.params.task_type()))]
    pub async fn submit(&self, request: TaskRequest) -> Result<Uuid> {
        let TaskRequest {
            universe_id,
            expected_version,
            force_lock,
            params,
        } = request;
        let task_type = params.task_type();
        let stored_params = serde_json::to_value(&params)?;
        let task = params.into_task();

        let universe = self.inner.services.updater.load(universe_id).await?;
        task.validate(&universe, true)?;

        let task_id = Uuid::new_v4();
        let options = LockOptions {
            force: force_lock,
            retry_of: None,
        };
        self.inner
            .locks
            .lock(universe_id, expected_version, task_id, task_type, options)
            .await?;

        let record = TaskRecord::new(task_id, universe_id, task_type, stored_params);
        self.start(
            record,
            Run {
                task_id,
                universe_id,
                task_type,
                task,
                is_first_try: true,
                plan: None,
            },
        )
        .await?;
        info!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    /// Run a failed or aborted task again under a new id.
    ///
    /// The retry skips the version check and the first-try validation, and may
    /// run while its predecessor keeps the universe restricted.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn retry(&self, task_id: Uuid) -> Result<Uuid> {
        let previous = self.record(task_id).await?;
        if !matches!(previous.state, TaskState::Failure | TaskState::Aborted) {
            return Err(CoreError::InvalidTaskState {
                task_id,
                expected: "failure or aborted".to_string(),
                actual: previous.state.as_str().to_string(),
            });
        }
        let params: TaskParams = serde_json::from_value(previous.params.clone())?;
        let task = params.into_task();
        let universe = self
            .inner
            .services
            .updater
            .load(previous.universe_id)
            .await?;
        task.validate(&universe, false)?;

        let retry_id = Uuid::new_v4();
        let options = LockOptions {
            force: false,
            retry_of: Some(task_id),
        };
        self.inner
            .locks
            .lock(
                previous.universe_id,
                ANY_VERSION,
                retry_id,
                previous.task_type,
                options,
            )
            .await?;

        let mut record = TaskRecord::new(
            retry_id,
            previous.universe_id,
            previous.task_type,
            previous.params.clone(),
        );
        record.is_first_try = false;
        record.retry_of = Some(task_id);
        self.start(
            record,
            Run {
                task_id: retry_id,
                universe_id: previous.universe_id,
                task_type: previous.task_type,
                task,
                is_first_try: false,
                plan: None,
            },
        )
        .await?;
        info!(retry_id = %retry_id, "Task retried");
        Ok(retry_id)
    }

    /// Ask a running task to stop at its next subtask boundary. Returns
    /// false if the task is not running in this process.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn abort(&self, task_id: Uuid) -> Result<bool> {
        if self.inner.registry.abort(task_id).await {
            info!("Abort requested");
            return Ok(true);
        }
        self.record(task_id).await?;
        Ok(false)
    }

    /// Current status of a task.
    pub async fn status(&self, task_id: Uuid) -> Result<TaskStatus> {
        let record = self.record(task_id).await?;
        let persistence = self.persistence();

        let total_subtasks = match &record.plan {
            Some(plan) => SubTaskQueue::from_plan(plan)?.total_subtasks(),
            None => 0,
        };
        let completed_subtasks = persistence.completed_subtasks(task_id).await?.len();
        let placement_modification_pending = match persistence.load_universe(record.universe_id).await {
            Ok(universe) => universe.placement_modification_pending(),
            Err(CoreError::UniverseNotFound { .. }) => false,
            Err(e) => return Err(e),
        };

        Ok(TaskStatus {
            task_id,
            universe_id: record.universe_id,
            task_type: record.task_type,
            state: record.state,
            is_first_try: record.is_first_try,
            retry_of: record.retry_of,
            total_subtasks,
            completed_subtasks,
            current_group: record.current_group,
            error: record.error,
            error_code: record.error_code,
            placement_modification_pending,
        })
    }

    /// Wait until a task stops running in this process, then return its
    /// status.
    pub async fn wait(&self, task_id: Uuid) -> Result<TaskStatus> {
        if let Some(mut done) = self.inner.registry.watcher(task_id).await {
            // A dropped sender means the run was halted.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.status(task_id).await
    }

    /// Task types that may start against a universe right now.
    pub async fn allowed_task_types(&self, universe_id: Uuid) -> Result<Vec<TaskType>> {
        let universe = self.inner.services.updater.load(universe_id).await?;
        Ok(self.inner.policy.allowed_task_types(&universe))
    }

    /// Operator override: drop the lock and optionally the restriction.
    pub async fn force_unlock(&self, universe_id: Uuid, clear_restriction: bool) -> Result<Universe> {
        self.inner.locks.force_unlock(universe_id, clear_restriction).await
    }

    /// Resume every task a previous process left running.
    ///
    /// Each resumed run re-enters the lock it still owns, reuses its
    /// persisted plan and skips subtasks already recorded as done.
    #[instrument(skip(self))]
    pub async fn resume_incomplete(&self) -> Result<Vec<Uuid>> {
        let persistence = self.persistence().clone();
        let mut pending = persistence.list_tasks_by_state(TaskState::Running).await?;
        pending.extend(persistence.list_tasks_by_state(TaskState::Created).await?);

        let mut resumed = Vec::new();
        for record in pending {
            let task_id = record.task_id;
            if self.inner.registry.is_running(task_id).await {
                continue;
            }
            match self.resume(record).await {
                Ok(()) => resumed.push(task_id),
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Failed to resume task");
                    persistence
                        .update_task_state(task_id, TaskState::Failure, Some(&e))
                        .await?;
                }
            }
        }
        info!(count = resumed.len(), "Resumed incomplete tasks");
        Ok(resumed)
    }

    async fn resume(&self, record: TaskRecord) -> Result<()> {
        let params: TaskParams = serde_json::from_value(record.params.clone())?;
        let task = params.into_task();
        let plan = record.plan.as_ref().map(SubTaskQueue::from_plan).transpose()?;
        let options = LockOptions {
            force: false,
            retry_of: record.retry_of,
        };
        self.inner
            .locks
            .lock(
                record.universe_id,
                ANY_VERSION,
                record.task_id,
                record.task_type,
                options,
            )
            .await?;

        info!(task_id = %record.task_id, has_plan = plan.is_some(), "Resuming task");
        let run = Run {
            task_id: record.task_id,
            universe_id: record.universe_id,
            task_type: record.task_type,
            task,
            is_first_try: false,
            plan,
        };
        self.spawn(run).await;
        Ok(())
    }

    /// Stop every run in this process without unlocking, leaving them to be
    /// resumed by the next process.
    #[instrument(skip(self))]
    pub async fn halt(&self) {
        let runs = self.inner.registry.drain().await;
        for (task_id, join) in runs {
            join.abort();
            let _ = join.await;
            info!(task_id = %task_id, "Run halted");
        }
    }

    async fn record(&self, task_id: Uuid) -> Result<TaskRecord> {
        self.persistence()
            .get_task(task_id)
            .await?
            .ok_or(CoreError::TaskNotFound { task_id })
    }

    /// Persist the record of a freshly locked task and spawn it. Releases
    /// the lock if the record cannot be written.
    async fn start(&self, record: TaskRecord, run: Run) -> Result<()> {
        if let Err(e) = self.persistence().insert_task(&record).await {
            if let Err(unlock) = self.inner.locks.unlock(run.universe_id, run.task_id, false).await {
                warn!(error = %unlock, "Failed to release lock after insert failure");
            }
            return Err(e);
        }
        self.spawn(run).await;
        Ok(())
    }

    async fn spawn(&self, run: Run) {
        let cancel = CancellationToken::new();
        let task_id = run.task_id;
        let done = self.inner.registry.register(task_id, cancel.clone()).await;
        let inner = self.inner.clone();
        let join = tokio::spawn(async move {
            inner.execute(run, cancel).await;
            inner.registry.finish(task_id, done).await;
        });
        self.inner.registry.attach(task_id, join).await;
    }
}

impl Inner {
    async fn execute(&self, run: Run, cancel: CancellationToken) {
        let task_id = run.task_id;
        let universe_id = run.universe_id;
        let persistence = self.services.updater.persistence().clone();
        let ctx = ExecutionContext::new(
            self.services.clone(),
            task_id,
            universe_id,
            run.is_first_try,
            cancel,
        );
        ctx.mark_locked(universe_id).await;

        let result = match persistence
            .update_task_state(task_id, TaskState::Running, None)
            .await
        {
            Ok(()) => self.run_plan(&ctx, &run).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(()) => self.locks.unlock(universe_id, task_id, true).await,
            Err(e) => {
                self.fail(&ctx, &run, &e).await;
                if let Err(unlock) = self.locks.unlock(universe_id, task_id, false).await {
                    error!(task_id = %task_id, error = %unlock, "Failed to unlock universe");
                }
                Err(e)
            }
        };
        ctx.mark_unlocked(universe_id).await;

        let (state, err) = match &outcome {
            Ok(()) => (TaskState::Success, None),
            Err(e) if e.kind() == ErrorKind::Cancelled => (TaskState::Aborted, Some(e)),
            Err(e) => (TaskState::Failure, Some(e)),
        };
        if let Err(e) = persistence.update_task_state(task_id, state, err).await {
            error!(task_id = %task_id, error = %e, "Failed to record task state");
        }
        info!(task_id = %task_id, state = state.as_str(), "Task finished");
    }

    async fn run_plan(&self, ctx: &ExecutionContext, run: &Run) -> Result<()> {
        let queue = match &run.plan {
            Some(plan) => plan.clone(),
            None => {
                let queue = self.build_plan(ctx, run).await?;
                self.services
                    .updater
                    .persistence()
                    .set_task_plan(run.task_id, &queue.to_plan()?)
                    .await?;
                queue
            }
        };
        info!(
            task_id = %run.task_id,
            groups = queue.groups().len(),
            subtasks = queue.total_subtasks(),
            "Running plan"
        );
        queue.run(ctx).await
    }

    async fn build_plan(&self, ctx: &ExecutionContext, run: &Run) -> Result<SubTaskQueue> {
        let universe = ctx.universe().await?;
        let master_leader = match self.services.admin.master_leader(run.universe_id).await {
            Ok(leader) => leader,
            Err(e) => {
                warn!(error = %e, "Master leader unknown; ordering masters by index");
                None
            }
        };
        run.task.build_plan(&PlanContext {
            universe: &universe,
            policy: FlowPolicy {
                blacklist_leaders: ctx.blacklist_leaders,
                follower_lag_check: ctx.follower_lag_check,
                is_first_try: run.is_first_try,
            },
            master_leader,
        })
    }

    /// Failure path before unlocking: upgrade state, then compensation.
    async fn fail(&self, ctx: &ExecutionContext, run: &Run, err: &CoreError) {
        let kind = self.policy.classify(run.task_type, err);
        error!(
            task_id = %run.task_id,
            universe_id = %run.universe_id,
            task_type = %run.task_type,
            error_kind = kind.as_str(),
            error = %err,
            "Task failed"
        );

        let policy = &self.policy;
        let result = self
            .services
            .updater
            .update(run.universe_id, |universe| {
                if let Some(state) =
                    policy.upgrade_state_on_failure(universe.details.software_upgrade_state)
                {
                    universe.details.software_upgrade_state = state;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(_) | Err(CoreError::UniverseNotFound { .. }) => {}
            Err(e) => warn!(error = %e, "Failed to record upgrade state"),
        }

        self.policy.compensate(ctx, err).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{MockCluster, NodeAction};
    use crate::model::{ServerType, UniverseBuilder, UserIntent};
    use crate::persistence::InMemoryPersistence;
    use crate::tasks::RestartParams;
    use crate::upgrade::UpgradeOption;
    use std::time::Duration;

    fn config() -> OrchestrationConfig {
        OrchestrationConfig {
            poll_interval: Duration::from_millis(5),
            sleep_after_master_restart: Duration::ZERO,
            sleep_after_tserver_restart: Duration::ZERO,
            master_ready_timeout: Duration::from_secs(5),
            tserver_ready_timeout: Duration::from_secs(5),
            leader_blacklist_timeout: Duration::from_secs(5),
            abort_wait_timeout: Duration::from_millis(200),
            ..OrchestrationConfig::default()
        }
    }

    async fn setup() -> (Commissioner, Arc<MockCluster>, Universe) {
        let universe = UniverseBuilder::new("com")
            .primary(UserIntent::new(3, 3, "2.20.0"), &["az1", "az2", "az3"])
            .build();
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.insert_universe(&universe).await.unwrap();
        let cluster = Arc::new(MockCluster::for_universe(&universe));
        let commissioner = Commissioner::builder()
            .persistence(persistence)
            .automation(cluster.clone())
            .cluster_admin(cluster.clone())
            .config(config())
            .build()
            .unwrap();
        (commissioner, cluster, universe)
    }

    fn restart(universe: &Universe) -> TaskRequest {
        TaskRequest::new(
            universe.universe_id,
            universe.version,
            TaskParams::RestartUniverse(RestartParams {
                upgrade_option: UpgradeOption::RollingUpgrade,
            }),
        )
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = Commissioner::builder().build().err().unwrap();
        assert_eq!(err.error_code(), "INTERNAL");
    }

    #[tokio::test]
    async fn test_submit_runs_to_success() {
        let (commissioner, cluster, universe) = setup().await;
        let task_id = commissioner.submit(restart(&universe)).await.unwrap();
        let status = commissioner.wait(task_id).await.unwrap();

        assert_eq!(status.state, TaskState::Success, "{:?}", status.error);
        assert_eq!(status.completed_subtasks, status.total_subtasks);
        assert!(status.total_subtasks > 0);
        assert!(!status.placement_modification_pending);
        assert_eq!(
            cluster
                .total_invocations(NodeAction::Stop(ServerType::TServer))
                .await,
            3
        );

        let after = commissioner
            .persistence()
            .load_universe(universe.universe_id)
            .await
            .unwrap();
        assert!(!after.details.update_in_progress);
        assert!(after.details.update_succeeded);
        assert!(after.version > universe.version);
    }

    #[tokio::test]
    async fn test_failure_records_root_cause_and_group() {
        let (commissioner, cluster, universe) = setup().await;
        cluster
            .fail_action("yb-com-n2", NodeAction::Stop(ServerType::TServer), 3)
            .await;

        let task_id = commissioner.submit(restart(&universe)).await.unwrap();
        let status = commissioner.wait(task_id).await.unwrap();

        assert_eq!(status.state, TaskState::Failure);
        assert_eq!(status.error_code.as_deref(), Some("AUTOMATION_FAILED"));
        assert!(status.current_group.unwrap().contains("yb-com-n2"));
        // The run blacklisted the node before stopping it; compensation
        // cleared it.
        assert!(cluster.leader_blacklist().await.is_empty());
        assert!(cluster.load_balancer_enabled().await);

        let retry_id = commissioner.retry(task_id).await.unwrap();
        let retried = commissioner.wait(retry_id).await.unwrap();
        assert_eq!(retried.state, TaskState::Success, "{:?}", retried.error);
        assert_eq!(retried.retry_of, Some(task_id));
        assert!(!retried.is_first_try);
    }

    #[tokio::test]
    async fn test_retry_requires_terminal_failure() {
        let (commissioner, _cluster, universe) = setup().await;
        let task_id = commissioner.submit(restart(&universe)).await.unwrap();
        commissioner.wait(task_id).await.unwrap();

        let err = commissioner.retry(task_id).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TASK_STATE");
        let err = commissioner.retry(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.error_code(), "TASK_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_abort_stops_at_group_boundary() {
        let (commissioner, cluster, universe) = setup().await;
        let gate = cluster
            .hold("yb-com-n1", NodeAction::Stop(ServerType::TServer))
            .await;

        let task_id = commissioner.submit(restart(&universe)).await.unwrap();
        gate.reached().await;
        assert!(commissioner.abort(task_id).await.unwrap());
        gate.release();

        let status = commissioner.wait(task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Aborted);
        assert_eq!(status.error_code.as_deref(), Some("CANCELLED"));
        assert!(!commissioner.abort(task_id).await.unwrap());

        let after = commissioner
            .persistence()
            .load_universe(universe.universe_id)
            .await
            .unwrap();
        assert!(!after.details.update_in_progress);
    }
}
