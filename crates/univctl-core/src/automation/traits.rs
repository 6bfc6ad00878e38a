// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator trait definitions.
//!
//! The engine never talks to nodes or the database cluster directly. Node
//! commands go through [`NodeAutomation`], cluster-level admin calls
//! (quorum, blacklists, load balancer, readiness) through [`ClusterAdmin`],
//! and health-check suspension through [`HealthSink`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, ServerType};

/// A command executed on one node by the automation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", content = "process", rename_all = "snake_case")]
pub enum NodeAction {
    /// Create and prepare the instance.
    Provision,
    /// Fetch the release package.
    Download,
    /// Install the release for a process.
    InstallSoftware(ServerType),
    /// Write the server configuration (flags) for a process.
    Configure(ServerType),
    /// Start a process.
    Start(ServerType),
    /// Stop a process.
    Stop(ServerType),
    /// Run the operator's pre-upgrade hook.
    PreUpgradeHook,
    /// Run the operator's post-upgrade hook.
    PostUpgradeHook,
    /// Release the instance.
    Destroy,
}

impl NodeAction {
    /// Verb used in logs and by the automation script.
    pub fn verb(&self) -> String {
        match self {
            Self::Provision => "provision".to_string(),
            Self::Download => "download".to_string(),
            Self::InstallSoftware(p) => format!("install-{}", p),
            Self::Configure(p) => format!("configure-{}", p),
            Self::Start(p) => format!("start-{}", p),
            Self::Stop(p) => format!("stop-{}", p),
            Self::PreUpgradeHook => "pre-upgrade-hook".to_string(),
            Self::PostUpgradeHook => "post-upgrade-hook".to_string(),
            Self::Destroy => "destroy".to_string(),
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb())
    }
}

/// Reply of the automation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResponse {
    /// Zero on success.
    pub exit_code: i32,
    /// Captured output.
    #[serde(default)]
    pub output: String,
}

impl ShellResponse {
    /// A successful response.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }

    /// Turn a non-zero exit code into [`CoreError::AutomationFailed`].
    pub fn into_result(self, node: &str, action: NodeAction) -> Result<Self> {
        if self.exit_code == 0 {
            Ok(self)
        } else {
            Err(CoreError::AutomationFailed {
                node: node.to_string(),
                action: action.verb(),
                exit_code: self.exit_code,
                output: self.output,
            })
        }
    }
}

/// Quorum membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumChange {
    /// Add a master to the consensus group.
    Add,
    /// Remove a master from the consensus group.
    Remove,
}

/// Which blacklist a change targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlacklistKind {
    /// Nodes may not hold tablet leadership.
    Leader,
    /// Data is moved off the nodes.
    Data,
}

/// Direction of a backup handed to the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Copy universe data out to storage.
    Create,
    /// Load universe data back from storage.
    Restore,
}

/// Executes commands on individual nodes.
///
/// Implementations must be safe to retry for idempotent actions (start,
/// stop, status queries).
#[async_trait]
pub trait NodeAutomation: Send + Sync {
    /// Run `action` against `node`.
    ///
    /// A transport failure is an error; a command that ran and failed is a
    /// response with a non-zero exit code.
    async fn execute(
        &self,
        node: &NodeDetails,
        action: NodeAction,
        params: &Value,
    ) -> Result<ShellResponse>;
}

/// Cluster-level admin calls against a running universe.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Name of the node currently leading the master quorum.
    async fn master_leader(&self, universe_id: Uuid) -> Result<Option<String>>;

    /// Names of the nodes in the master quorum.
    async fn list_masters(&self, universe_id: Uuid) -> Result<Vec<String>>;

    /// Add or remove one master.
    async fn change_master_config(
        &self,
        universe_id: Uuid,
        node: &NodeDetails,
        change: QuorumChange,
    ) -> Result<()>;

    /// Add and remove nodes from a blacklist.
    async fn modify_blacklist(
        &self,
        universe_id: Uuid,
        kind: BlacklistKind,
        add: &[String],
        remove: &[String],
    ) -> Result<()>;

    /// Number of tablet leaders still held by `nodes`.
    async fn leaders_held(&self, universe_id: Uuid, nodes: &[String]) -> Result<u32>;

    /// Percentage (0 to 100) of data moved off data-blacklisted nodes.
    async fn load_move_completion(&self, universe_id: Uuid) -> Result<f64>;

    /// Turn the tablet load balancer on or off.
    async fn set_load_balancer_enabled(&self, universe_id: Uuid, enabled: bool) -> Result<()>;

    /// Whether the tablet load balancer is on.
    async fn is_load_balancer_enabled(&self, universe_id: Uuid) -> Result<bool>;

    /// Whether a process answers RPCs.
    async fn ping_server(&self, node: &NodeDetails, server: ServerType) -> Result<bool>;

    /// Whether a process has finished bootstrapping and serves traffic.
    async fn is_server_ready(&self, node: &NodeDetails, server: ServerType) -> Result<bool>;

    /// Maximum replication lag of tablets followed by this node, in ms.
    async fn follower_lag_ms(&self, node: &NodeDetails) -> Result<u64>;

    /// Run a backup or restore to completion. `request` is passed through
    /// untouched.
    async fn run_backup(&self, universe_id: Uuid, kind: BackupKind, request: &Value)
    -> Result<()>;
}

/// Receives health-check suspension notices. Best effort.
#[async_trait]
pub trait HealthSink: Send + Sync {
    /// Stop alerting on this universe.
    async fn suspend(&self, universe_id: Uuid) -> Result<()>;

    /// Resume alerting on this universe.
    async fn resume(&self, universe_id: Uuid) -> Result<()>;
}

/// Health sink that drops every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHealthSink;

#[async_trait]
impl HealthSink for NoopHealthSink {
    async fn suspend(&self, _universe_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn resume(&self, _universe_id: Uuid) -> Result<()> {
        Ok(())
    }
}
