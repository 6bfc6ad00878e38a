// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence for tests and embedding.
//!
//! Same semantics as the SQLite backend; state is lost when the value is
//! dropped. Cloning shares the underlying store, so two commissioners built
//! on clones see the same universes and tasks.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::Universe;

use super::{Persistence, SubTaskPosition, TaskRecord, TaskState, UniverseMutator};

#[derive(Default)]
struct Store {
    universes: HashMap<Uuid, Universe>,
    tasks: HashMap<Uuid, TaskRecord>,
    progress: HashMap<Uuid, BTreeSet<SubTaskPosition>>,
}

/// Persistence backed by process memory.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    store: Arc<Mutex<Store>>,
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn insert_universe(&self, universe: &Universe) -> Result<(), CoreError> {
        let mut store = self.store.lock().await;
        if store.universes.contains_key(&universe.universe_id) {
            return Err(CoreError::UniverseAlreadyExists {
                universe_id: universe.universe_id,
            });
        }
        store
            .universes
            .insert(universe.universe_id, universe.clone());
        Ok(())
    }

    async fn load_universe(&self, universe_id: Uuid) -> Result<Universe, CoreError> {
        self.store
            .lock()
            .await
            .universes
            .get(&universe_id)
            .cloned()
            .ok_or(CoreError::UniverseNotFound { universe_id })
    }

    async fn list_universes(&self) -> Result<Vec<Universe>, CoreError> {
        let store = self.store.lock().await;
        let mut universes: Vec<Universe> = store.universes.values().cloned().collect();
        universes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(universes)
    }

    async fn delete_universe(&self, universe_id: Uuid) -> Result<(), CoreError> {
        self.store
            .lock()
            .await
            .universes
            .remove(&universe_id)
            .map(|_| ())
            .ok_or(CoreError::UniverseNotFound { universe_id })
    }

    async fn compare_and_swap(
        &self,
        universe_id: Uuid,
        expected_version: i64,
        mutator: UniverseMutator<'_>,
    ) -> Result<Universe, CoreError> {
        let mut store = self.store.lock().await;
        let current = store
            .universes
            .get(&universe_id)
            .ok_or(CoreError::UniverseNotFound { universe_id })?;

        if current.version != expected_version {
            return Err(CoreError::VersionMismatch {
                universe_id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut next = current.clone();
        mutator(&mut next)?;
        next.universe_id = universe_id;
        next.version = expected_version + 1;
        store.universes.insert(universe_id, next.clone());
        Ok(next)
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError> {
        let mut store = self.store.lock().await;
        if store.tasks.contains_key(&task.task_id) {
            return Err(CoreError::DatabaseError {
                operation: "insert_task".to_string(),
                details: format!("task {} already exists", task.task_id),
            });
        }
        store.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, CoreError> {
        Ok(self.store.lock().await.tasks.get(&task_id).cloned())
    }

    async fn update_task_state(
        &self,
        task_id: Uuid,
        state: TaskState,
        error: Option<&CoreError>,
    ) -> Result<(), CoreError> {
        let mut store = self.store.lock().await;
        let task = store
            .tasks
            .get_mut(&task_id)
            .ok_or(CoreError::TaskNotFound { task_id })?;
        task.state = state;
        if let Some(error) = error {
            task.error = Some(error.to_string());
            task.error_code = Some(error.error_code().to_string());
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_task_plan(
        &self,
        task_id: Uuid,
        plan: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut store = self.store.lock().await;
        if let Some(task) = store.tasks.get_mut(&task_id) {
            task.plan = Some(plan.clone());
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_current_group(&self, task_id: Uuid, group: &str) -> Result<(), CoreError> {
        let mut store = self.store.lock().await;
        if let Some(task) = store.tasks.get_mut(&task_id) {
            task.current_group = Some(group.to_string());
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<TaskRecord>, CoreError> {
        let store = self.store.lock().await;
        let mut tasks: Vec<TaskRecord> = store
            .tasks
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn record_subtask_completed(
        &self,
        task_id: Uuid,
        position: SubTaskPosition,
    ) -> Result<(), CoreError> {
        self.store
            .lock()
            .await
            .progress
            .entry(task_id)
            .or_default()
            .insert(position);
        Ok(())
    }

    async fn completed_subtasks(&self, task_id: Uuid) -> Result<Vec<SubTaskPosition>, CoreError> {
        Ok(self
            .store
            .lock()
            .await
            .progress
            .get(&task_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}
