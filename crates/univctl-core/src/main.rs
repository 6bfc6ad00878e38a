// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! univctl Core - Universe Task Engine
//!
//! The daemon opens the task store, resumes every task a previous process
//! left running, and keeps running them until Ctrl-C. On shutdown the runs
//! are halted without releasing their locks, so the next start resumes them.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use univctl_core::automation::ScriptAutomation;
use univctl_core::commissioner::Commissioner;
use univctl_core::config::Config;
use univctl_core::persistence::SqlitePersistence;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("univctl_core=info".parse()?),
        )
        .init();

    info!("Starting univctl Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        automation_script = %config.automation_script,
        max_parallel_subtasks = config.orchestration.max_parallel_subtasks,
        blacklist_leaders = config.orchestration.blacklist_leaders,
        "Configuration loaded"
    );

    info!("Opening task store...");
    let persistence = if config.database_url.starts_with("sqlite:") {
        SqlitePersistence::connect(&config.database_url).await?
    } else {
        SqlitePersistence::from_path(&config.database_url).await?
    };
    info!("Task store ready");

    let automation = Arc::new(ScriptAutomation::new(config.automation_script.clone()));
    let commissioner = Commissioner::builder()
        .persistence(Arc::new(persistence))
        .automation(automation.clone())
        .cluster_admin(automation)
        .config(config.orchestration)
        .build()?;

    let resumed = commissioner.resume_incomplete().await?;
    info!(count = resumed.len(), "univctl Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, halting running tasks...");
    commissioner.halt().await;
    info!("univctl Core stopped");

    Ok(())
}
