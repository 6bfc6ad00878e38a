// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Automation backed by an operator-supplied executable.
//!
//! Every call runs `<script> <verb> <json>` and reads one JSON document from
//! stdout. Node commands use the verb `execute` and reply with
//! `{"exit_code": 0, "output": "..."}`; admin calls use the verb `admin`
//! with an `op` field and reply with `{"value": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::*;
use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, ServerType};

/// Default bound on one script invocation.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Deserialize)]
struct AdminReply<T> {
    value: T,
}

/// Node automation and cluster admin through an external executable.
#[derive(Debug, Clone)]
pub struct ScriptAutomation {
    script: String,
    call_timeout: Duration,
}

impl ScriptAutomation {
    /// Use `script` for every call.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound every invocation by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn invoke(&self, verb: &str, payload: &Value) -> Result<std::process::Output> {
        let child = Command::new(&self.script)
            .arg(verb)
            .arg(payload.to_string())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.call_timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CoreError::AutomationFailed {
                node: String::new(),
                action: verb.to_string(),
                exit_code: -1,
                output: format!("failed to run {}: {}", self.script, e),
            }),
            Err(_) => Err(CoreError::WaitTimeout {
                what: format!("{} {}", self.script, verb),
                timeout_secs: self.call_timeout.as_secs(),
            }),
        }
    }

    async fn admin<T: DeserializeOwned>(&self, op: &str, mut payload: Value) -> Result<T> {
        payload["op"] = Value::String(op.to_string());
        let output = self.invoke("admin", &payload).await?;

        if !output.status.success() {
            return Err(CoreError::ClusterAdminFailed {
                operation: op.to_string(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let reply: AdminReply<T> =
            serde_json::from_slice(&output.stdout).map_err(|e| CoreError::ClusterAdminFailed {
                operation: op.to_string(),
                details: format!("unreadable reply: {}", e),
            })?;
        Ok(reply.value)
    }
}

#[async_trait]
impl NodeAutomation for ScriptAutomation {
    async fn execute(
        &self,
        node: &NodeDetails,
        action: NodeAction,
        params: &Value,
    ) -> Result<ShellResponse> {
        let payload = json!({
            "node": node,
            "command": action,
            "params": params,
        });
        debug!(node = %node.node_name, action = %action, "Running automation script");

        let output = self.invoke("execute", &payload).await?;
        match serde_json::from_slice::<ShellResponse>(&output.stdout) {
            Ok(response) => Ok(response),
            Err(e) => {
                let exit_code = output.status.code().unwrap_or(-1);
                if exit_code == 0 {
                    warn!(node = %node.node_name, action = %action, error = %e, "Unreadable automation reply");
                }
                Ok(ShellResponse {
                    exit_code: if exit_code == 0 { -1 } else { exit_code },
                    output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl ClusterAdmin for ScriptAutomation {
    async fn master_leader(&self, universe_id: Uuid) -> Result<Option<String>> {
        self.admin("master_leader", json!({ "universe_id": universe_id }))
            .await
    }

    async fn list_masters(&self, universe_id: Uuid) -> Result<Vec<String>> {
        self.admin("list_masters", json!({ "universe_id": universe_id }))
            .await
    }

    async fn change_master_config(
        &self,
        universe_id: Uuid,
        node: &NodeDetails,
        change: QuorumChange,
    ) -> Result<()> {
        self.admin(
            "change_master_config",
            json!({ "universe_id": universe_id, "node": node, "change": change }),
        )
        .await
    }

    async fn modify_blacklist(
        &self,
        universe_id: Uuid,
        kind: BlacklistKind,
        add: &[String],
        remove: &[String],
    ) -> Result<()> {
        self.admin(
            "modify_blacklist",
            json!({ "universe_id": universe_id, "kind": kind, "add": add, "remove": remove }),
        )
        .await
    }

    async fn leaders_held(&self, universe_id: Uuid, nodes: &[String]) -> Result<u32> {
        self.admin(
            "leaders_held",
            json!({ "universe_id": universe_id, "nodes": nodes }),
        )
        .await
    }

    async fn load_move_completion(&self, universe_id: Uuid) -> Result<f64> {
        self.admin("load_move_completion", json!({ "universe_id": universe_id }))
            .await
    }

    async fn set_load_balancer_enabled(&self, universe_id: Uuid, enabled: bool) -> Result<()> {
        self.admin(
            "set_load_balancer",
            json!({ "universe_id": universe_id, "enabled": enabled }),
        )
        .await
    }

    async fn is_load_balancer_enabled(&self, universe_id: Uuid) -> Result<bool> {
        self.admin("load_balancer_enabled", json!({ "universe_id": universe_id }))
            .await
    }

    async fn ping_server(&self, node: &NodeDetails, server: ServerType) -> Result<bool> {
        self.admin("ping_server", json!({ "node": node, "server": server }))
            .await
    }

    async fn is_server_ready(&self, node: &NodeDetails, server: ServerType) -> Result<bool> {
        self.admin("server_ready", json!({ "node": node, "server": server }))
            .await
    }

    async fn follower_lag_ms(&self, node: &NodeDetails) -> Result<u64> {
        self.admin("follower_lag", json!({ "node": node })).await
    }

    async fn run_backup(
        &self,
        universe_id: Uuid,
        kind: BackupKind,
        request: &Value,
    ) -> Result<()> {
        self.admin(
            "backup",
            json!({ "universe_id": universe_id, "kind": kind, "request": request }),
        )
        .await
    }
}
