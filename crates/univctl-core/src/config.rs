// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or file path
    pub database_url: String,
    /// Executable standing in for the node automation and cluster admin layers
    pub automation_script: String,
    /// Orchestration knobs shared by every task
    pub orchestration: OrchestrationConfig,
}

/// In-process knobs for running tasks.
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Size of the subtask worker pool.
    pub max_parallel_subtasks: usize,
    /// How long a forced lock waits for the owning task to stop.
    pub abort_wait_timeout: Duration,
    /// Drain leadership from tservers before stopping them.
    pub blacklist_leaders: bool,
    /// Check follower lag after a tserver restarts.
    pub follower_lag_check: bool,
    /// Maximum acceptable follower lag.
    pub max_follower_lag: Duration,
    /// Bound on waiting for leader blacklist completion.
    pub leader_blacklist_timeout: Duration,
    /// Bound on waiting for data moves off a blacklisted node.
    pub load_move_timeout: Duration,
    /// Bound on waiting for a master to answer and report ready.
    pub master_ready_timeout: Duration,
    /// Bound on waiting for a tserver to answer and report ready.
    pub tserver_ready_timeout: Duration,
    /// Settle interval after a master restart.
    pub sleep_after_master_restart: Duration,
    /// Settle interval after a tserver restart.
    pub sleep_after_tserver_restart: Duration,
    /// Interval between polls in bounded waits.
    pub poll_interval: Duration,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallel_subtasks: 10,
            abort_wait_timeout: Duration::from_secs(60),
            blacklist_leaders: true,
            follower_lag_check: false,
            max_follower_lag: Duration::from_secs(60),
            leader_blacklist_timeout: Duration::from_secs(300),
            load_move_timeout: Duration::from_secs(3600),
            master_ready_timeout: Duration::from_secs(300),
            tserver_ready_timeout: Duration::from_secs(300),
            sleep_after_master_restart: Duration::from_millis(10_000),
            sleep_after_tserver_restart: Duration::from_millis(10_000),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `UNIVCTL_DATABASE_URL`: SQLite connection string or file path
    ///
    /// Optional (with defaults):
    /// - `UNIVCTL_MAX_PARALLEL_SUBTASKS` (10)
    /// - `UNIVCTL_ABORT_WAIT_TIMEOUT_SECS` (60)
    /// - `UNIVCTL_BLACKLIST_LEADERS` (true)
    /// - `UNIVCTL_FOLLOWER_LAG_CHECK` (false)
    /// - `UNIVCTL_LEADER_BLACKLIST_TIMEOUT_SECS` (300)
    /// - `UNIVCTL_MASTER_READY_TIMEOUT_SECS` (300)
    /// - `UNIVCTL_TSERVER_READY_TIMEOUT_SECS` (300)
    /// - `UNIVCTL_SLEEP_AFTER_MASTER_RESTART_MS` (10000)
    /// - `UNIVCTL_SLEEP_AFTER_TSERVER_RESTART_MS` (10000)
    /// - `UNIVCTL_AUTOMATION_SCRIPT` (univctl-node)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("UNIVCTL_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("UNIVCTL_DATABASE_URL"))?;

        let automation_script = std::env::var("UNIVCTL_AUTOMATION_SCRIPT")
            .unwrap_or_else(|_| "univctl-node".to_string());

        let max_parallel_subtasks: usize =
            parse_var("UNIVCTL_MAX_PARALLEL_SUBTASKS", "10", "must be a positive integer")?;
        if max_parallel_subtasks == 0 {
            return Err(ConfigError::Invalid(
                "UNIVCTL_MAX_PARALLEL_SUBTASKS",
                "must be a positive integer",
            ));
        }

        let abort_wait_secs: u64 =
            parse_var("UNIVCTL_ABORT_WAIT_TIMEOUT_SECS", "60", "must be a number of seconds")?;
        let blacklist_leaders: bool =
            parse_var("UNIVCTL_BLACKLIST_LEADERS", "true", "must be true or false")?;
        let follower_lag_check: bool =
            parse_var("UNIVCTL_FOLLOWER_LAG_CHECK", "false", "must be true or false")?;
        let blacklist_timeout_secs: u64 = parse_var(
            "UNIVCTL_LEADER_BLACKLIST_TIMEOUT_SECS",
            "300",
            "must be a number of seconds",
        )?;
        let master_ready_secs: u64 = parse_var(
            "UNIVCTL_MASTER_READY_TIMEOUT_SECS",
            "300",
            "must be a number of seconds",
        )?;
        let tserver_ready_secs: u64 = parse_var(
            "UNIVCTL_TSERVER_READY_TIMEOUT_SECS",
            "300",
            "must be a number of seconds",
        )?;
        let master_sleep_ms: u64 = parse_var(
            "UNIVCTL_SLEEP_AFTER_MASTER_RESTART_MS",
            "10000",
            "must be a number of milliseconds",
        )?;
        let tserver_sleep_ms: u64 = parse_var(
            "UNIVCTL_SLEEP_AFTER_TSERVER_RESTART_MS",
            "10000",
            "must be a number of milliseconds",
        )?;

        Ok(Self {
            database_url,
            automation_script,
            orchestration: OrchestrationConfig {
                max_parallel_subtasks,
                abort_wait_timeout: Duration::from_secs(abort_wait_secs),
                blacklist_leaders,
                follower_lag_check,
                leader_blacklist_timeout: Duration::from_secs(blacklist_timeout_secs),
                master_ready_timeout: Duration::from_secs(master_ready_secs),
                tserver_ready_timeout: Duration::from_secs(tserver_ready_secs),
                sleep_after_master_restart: Duration::from_millis(master_sleep_ms),
                sleep_after_tserver_restart: Duration::from_millis(tserver_sleep_ms),
                ..OrchestrationConfig::default()
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
