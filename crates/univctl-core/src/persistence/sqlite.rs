// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{Universe, UniverseDetails};
use crate::task_types::TaskType;

use super::{Persistence, SubTaskPosition, TaskRecord, TaskState, UniverseMutator};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct UniverseRow {
    universe_id: String,
    name: String,
    version: i64,
    details: String,
}

impl UniverseRow {
    fn into_universe(self) -> Result<Universe, CoreError> {
        let details: UniverseDetails = serde_json::from_str(&self.details)?;
        Ok(Universe {
            universe_id: parse_uuid("universe_id", &self.universe_id)?,
            name: self.name,
            version: self.version,
            details,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    universe_id: String,
    task_type: String,
    params: String,
    state: String,
    is_first_try: bool,
    retry_of: Option<String>,
    plan: Option<String>,
    current_group: Option<String>,
    error: Option<String>,
    error_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_record(self) -> Result<TaskRecord, CoreError> {
        let task_type = TaskType::parse(&self.task_type).ok_or_else(|| CoreError::DatabaseError {
            operation: "decode_task".to_string(),
            details: format!("unknown task type '{}'", self.task_type),
        })?;
        let state = TaskState::parse(&self.state).ok_or_else(|| CoreError::DatabaseError {
            operation: "decode_task".to_string(),
            details: format!("unknown task state '{}'", self.state),
        })?;
        let plan = match self.plan {
            Some(plan) => Some(serde_json::from_str(&plan)?),
            None => None,
        };
        let retry_of = match self.retry_of {
            Some(id) => Some(parse_uuid("retry_of", &id)?),
            None => None,
        };

        Ok(TaskRecord {
            task_id: parse_uuid("task_id", &self.task_id)?,
            universe_id: parse_uuid("universe_id", &self.universe_id)?,
            task_type,
            params: serde_json::from_str(&self.params)?,
            state,
            is_first_try: self.is_first_try,
            retry_of,
            plan,
            current_group: self.current_group,
            error: self.error,
            error_code: self.error_code,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(value).map_err(|e| CoreError::DatabaseError {
        operation: "decode_uuid".to_string(),
        details: format!("column {}: {}", column, e),
    })
}

const TASK_COLUMNS: &str = r#"
    task_id, universe_id, task_type, params, state, is_first_try, retry_of,
    plan, current_group, error, error_code, created_at, updated_at
"#;

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The caller is responsible for running [`crate::migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/univctl.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a SQLite URL (e.g. `sqlite::memory:` or `sqlite:state.db`)
    /// and run all migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        // An in-memory database is private to its connection.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    async fn current_version(&self, universe_id: Uuid) -> Result<Option<i64>, CoreError> {
        let version: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM universes WHERE universe_id = ?")
                .bind(universe_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(|(v,)| v))
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_universe(&self, universe: &Universe) -> Result<(), CoreError> {
        if self.current_version(universe.universe_id).await?.is_some() {
            return Err(CoreError::UniverseAlreadyExists {
                universe_id: universe.universe_id,
            });
        }

        let details = serde_json::to_string(&universe.details)?;
        sqlx::query(
            r#"
            INSERT INTO universes (
                universe_id, name, version, details, update_in_progress,
                updating_task_id, placement_modification_task_id, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            "#,
        )
        .bind(universe.universe_id.to_string())
        .bind(&universe.name)
        .bind(universe.version)
        .bind(details)
        .bind(universe.details.update_in_progress)
        .bind(universe.details.updating_task_id.map(|id| id.to_string()))
        .bind(
            universe
                .details
                .placement_modification_task_id
                .map(|id| id.to_string()),
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_universe(&self, universe_id: Uuid) -> Result<Universe, CoreError> {
        let row = sqlx::query_as::<_, UniverseRow>(
            r#"
            SELECT universe_id, name, version, details
            FROM universes
            WHERE universe_id = ?
            "#,
        )
        .bind(universe_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(CoreError::UniverseNotFound { universe_id })?
            .into_universe()
    }

    async fn list_universes(&self) -> Result<Vec<Universe>, CoreError> {
        let rows = sqlx::query_as::<_, UniverseRow>(
            r#"
            SELECT universe_id, name, version, details
            FROM universes
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UniverseRow::into_universe).collect()
    }

    async fn delete_universe(&self, universe_id: Uuid) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM universes WHERE universe_id = ?")
            .bind(universe_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::UniverseNotFound { universe_id });
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        universe_id: Uuid,
        expected_version: i64,
        mutator: UniverseMutator<'_>,
    ) -> Result<Universe, CoreError> {
        // Take the write lock before reading so a concurrent writer cannot
        // invalidate the snapshot between the read and the update.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let row = sqlx::query_as::<_, UniverseRow>(
            r#"
            SELECT universe_id, name, version, details
            FROM universes
            WHERE universe_id = ?
            "#,
        )
        .bind(universe_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let mut universe = row
            .ok_or(CoreError::UniverseNotFound { universe_id })?
            .into_universe()?;

        if universe.version != expected_version {
            return Err(CoreError::VersionMismatch {
                universe_id,
                expected: expected_version,
                actual: universe.version,
            });
        }

        mutator(&mut universe)?;
        universe.universe_id = universe_id;
        universe.version = expected_version + 1;

        let details = serde_json::to_string(&universe.details)?;
        let result = sqlx::query(
            r#"
            UPDATE universes
            SET name = ?, version = ?, details = ?, update_in_progress = ?,
                updating_task_id = ?, placement_modification_task_id = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE universe_id = ? AND version = ?
            "#,
        )
        .bind(&universe.name)
        .bind(universe.version)
        .bind(details)
        .bind(universe.details.update_in_progress)
        .bind(universe.details.updating_task_id.map(|id| id.to_string()))
        .bind(
            universe
                .details
                .placement_modification_task_id
                .map(|id| id.to_string()),
        )
        .bind(universe_id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            drop(tx);
            let actual = self.current_version(universe_id).await?.unwrap_or(-1);
            return Err(CoreError::VersionMismatch {
                universe_id,
                expected: expected_version,
                actual,
            });
        }

        tx.commit().await?;
        Ok(universe)
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError> {
        let plan = match &task.plan {
            Some(plan) => Some(serde_json::to_string(plan)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, universe_id, task_type, params, state, is_first_try, retry_of,
                plan, current_group, error, error_code, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.task_id.to_string())
        .bind(task.universe_id.to_string())
        .bind(task.task_type.as_str())
        .bind(serde_json::to_string(&task.params)?)
        .bind(task.state.as_str())
        .bind(task.is_first_try)
        .bind(task.retry_of.map(|id| id.to_string()))
        .bind(plan)
        .bind(&task.current_group)
        .bind(&task.error)
        .bind(&task.error_code)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, CoreError> {
        let sql = format!("SELECT {} FROM tasks WHERE task_id = ?", TASK_COLUMNS);
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(TaskRow::into_record).transpose()
    }

    async fn update_task_state(
        &self,
        task_id: Uuid,
        state: TaskState,
        error: Option<&CoreError>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?,
                error = COALESCE(?, error),
                error_code = COALESCE(?, error_code),
                updated_at = ?
            WHERE task_id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(error.map(|e| e.to_string()))
        .bind(error.map(|e| e.error_code()))
        .bind(Utc::now())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::TaskNotFound { task_id });
        }
        Ok(())
    }

    async fn set_task_plan(
        &self,
        task_id: Uuid,
        plan: &serde_json::Value,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE tasks SET plan = ?, updated_at = ? WHERE task_id = ?")
            .bind(serde_json::to_string(plan)?)
            .bind(Utc::now())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_current_group(&self, task_id: Uuid, group: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE tasks SET current_group = ?, updated_at = ? WHERE task_id = ?")
            .bind(group)
            .bind(Utc::now())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<TaskRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE state = ? ORDER BY created_at",
            TASK_COLUMNS
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn record_subtask_completed(
        &self,
        task_id: Uuid,
        position: SubTaskPosition,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO subtask_progress (task_id, group_idx, task_idx)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(task_id.to_string())
        .bind(position.group_idx as i64)
        .bind(position.task_idx as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn completed_subtasks(&self, task_id: Uuid) -> Result<Vec<SubTaskPosition>, CoreError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT group_idx, task_idx
            FROM subtask_progress
            WHERE task_id = ?
            ORDER BY group_idx, task_idx
            "#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(group_idx, task_idx)| SubTaskPosition {
                group_idx: group_idx as usize,
                task_idx: task_idx as usize,
            })
            .collect())
    }
}
