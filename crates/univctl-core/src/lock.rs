// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Universe lock manager.
//!
//! A universe is locked by exactly one task at a time. Locking checks the
//! caller's expected version, refuses a second owner unless forced, and
//! enforces the placement-modification restriction left behind by a failed
//! topology change. Unlocking clears the restriction only when the task
//! that set it succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::automation::HealthSink;
use crate::error::{CoreError, Result};
use crate::model::Universe;
use crate::task_types::{TaskType, TaskTypeTable};
use crate::updater::{ANY_VERSION, UniverseUpdater};

/// Control over tasks running in this process, used by forced locks.
#[async_trait]
pub trait TaskControl: Send + Sync {
    /// Ask a task to stop at its next subtask boundary.
    async fn abort(&self, task_id: Uuid) -> bool;

    /// Whether the task is still executing.
    async fn is_running(&self, task_id: Uuid) -> bool;
}

/// How a lock is taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// Abort the current owner instead of failing with `AlreadyLocked`.
    pub force: bool,
    /// Task being retried; a retry may run while its own failure keeps the
    /// universe restricted.
    pub retry_of: Option<Uuid>,
}

/// Serializes mutating operations per universe.
pub struct LockManager {
    updater: Arc<UniverseUpdater>,
    table: Arc<TaskTypeTable>,
    control: Arc<dyn TaskControl>,
    health: Arc<dyn HealthSink>,
    abort_wait_timeout: Duration,
    poll_interval: Duration,
}

impl LockManager {
    /// Create a lock manager.
    pub fn new(
        updater: Arc<UniverseUpdater>,
        table: Arc<TaskTypeTable>,
        control: Arc<dyn TaskControl>,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        Self {
            updater,
            table,
            control,
            health,
            abort_wait_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Bound the forced-lock abort wait.
    pub fn with_abort_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.abort_wait_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// The task type table this manager enforces.
    pub fn table(&self) -> &TaskTypeTable {
        &self.table
    }

    /// Lock a universe for `task_id`.
    ///
    /// `expected_version` of [`ANY_VERSION`] skips the staleness check. A task
    /// that already owns the lock (a resumed run) re-enters it.
    #[instrument(skip(self, options), fields(universe_id = %universe_id, task_id = %task_id, task_type = %task_type))]
    pub async fn lock(
        &self,
        universe_id: Uuid,
        expected_version: i64,
        task_id: Uuid,
        task_type: TaskType,
        options: LockOptions,
    ) -> Result<Universe> {
        let current = self.updater.load(universe_id).await?;
        if expected_version != ANY_VERSION && expected_version != current.version {
            return Err(CoreError::VersionMismatch {
                universe_id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let details = &current.details;
        let mut aborted_owner = None;
        if details.update_in_progress && details.updating_task_id != Some(task_id) {
            if !options.force {
                return Err(CoreError::AlreadyLocked {
                    universe_id,
                    owner_task_id: details.updating_task_id,
                });
            }
            if let Some(owner) = details.updating_task_id {
                self.abort_and_wait(universe_id, owner).await?;
            }
            aborted_owner = details.updating_task_id;
        }

        // Forcing may let the old owner unlock and bump the version.
        let cas_version = if options.force {
            ANY_VERSION
        } else {
            expected_version
        };
        let table = self.table.clone();

        let locked = self
            .updater
            .update_versioned(universe_id, cas_version, |universe| {
                let details = &mut universe.details;
                if details.update_in_progress
                    && details.updating_task_id != Some(task_id)
                    && details.updating_task_id != aborted_owner
                {
                    return Err(CoreError::AlreadyLocked {
                        universe_id,
                        owner_task_id: details.updating_task_id,
                    });
                }

                if let Some(pending) = details.placement_modification_task_id {
                    let is_retry = pending == task_id || options.retry_of == Some(pending);
                    if !is_retry && !table.allowed_when_restricted(task_type) {
                        return Err(CoreError::PlacementModificationPending {
                            universe_id,
                            pending_task_id: pending,
                            task_type,
                        });
                    }
                }

                details.update_in_progress = true;
                details.update_succeeded = false;
                details.updating_task_id = Some(task_id);
                details.updating_task_type = Some(task_type);
                if table.modifies_placement(task_type) {
                    details.placement_modification_task_id = Some(task_id);
                }
                Ok(())
            })
            .await?;

        info!(version = locked.version, "Locked universe");
        if let Err(e) = self.health.suspend(universe_id).await {
            warn!(error = %e, "Failed to suspend health checks");
        }
        Ok(locked)
    }

    /// Release the lock held by `task_id`.
    ///
    /// On success, a restriction set by this task is cleared; on failure it
    /// stays so only allow-listed types or a retry can run.
    #[instrument(skip(self), fields(universe_id = %universe_id, task_id = %task_id))]
    pub async fn unlock(&self, universe_id: Uuid, task_id: Uuid, success: bool) -> Result<()> {
        let result = self
            .updater
            .update(universe_id, |universe| {
                let details = &mut universe.details;
                if !details.update_in_progress || details.updating_task_id != Some(task_id) {
                    return Err(CoreError::NotLocked {
                        universe_id,
                        task_id,
                    });
                }
                details.update_in_progress = false;
                details.update_succeeded = success;
                details.updating_task_id = None;
                details.updating_task_type = None;
                if success && details.placement_modification_task_id == Some(task_id) {
                    details.placement_modification_task_id = None;
                }
                Ok(())
            })
            .await;

        match result {
            Ok(universe) => {
                info!(
                    version = universe.version,
                    success,
                    restricted = universe.placement_modification_pending(),
                    "Unlocked universe"
                );
            }
            // Destroyed by the task that held the lock.
            Err(CoreError::UniverseNotFound { .. }) => {
                info!("Universe no longer exists; nothing to unlock");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.health.resume(universe_id).await {
            warn!(error = %e, "Failed to resume health checks");
        }
        Ok(())
    }

    /// Operator override: drop the lock whoever holds it, and optionally the
    /// placement restriction.
    #[instrument(skip(self), fields(universe_id = %universe_id))]
    pub async fn force_unlock(&self, universe_id: Uuid, clear_restriction: bool) -> Result<Universe> {
        let universe = self
            .updater
            .update(universe_id, |universe| {
                let details = &mut universe.details;
                details.update_in_progress = false;
                details.updating_task_id = None;
                details.updating_task_type = None;
                if clear_restriction {
                    details.placement_modification_task_id = None;
                }
                Ok(())
            })
            .await?;
        warn!(clear_restriction, "Universe force-unlocked");
        if let Err(e) = self.health.resume(universe_id).await {
            warn!(error = %e, "Failed to resume health checks");
        }
        Ok(universe)
    }

    async fn abort_and_wait(&self, universe_id: Uuid, owner: Uuid) -> Result<()> {
        if !self.control.is_running(owner).await {
            info!(owner_task_id = %owner, "Lock owner is not running; taking over");
            return Ok(());
        }

        info!(owner_task_id = %owner, "Aborting lock owner");
        self.control.abort(owner).await;

        let deadline = Instant::now() + self.abort_wait_timeout;
        loop {
            if !self.control.is_running(owner).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::AbortTimeout {
                    universe_id,
                    owner_task_id: owner,
                    waited_secs: self.abort_wait_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
