// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock cluster for testing.
//!
//! Simulates node processes, the master quorum, leader and data blacklists
//! and the load balancer in memory, and records every call so tests can
//! assert on ordering and invocation counts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::traits::*;
use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, ServerType, Universe};

/// Leaders a serving tserver holds in the simulation.
const LEADERS_PER_TSERVER: u32 = 3;

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Node automation command.
    Action {
        /// Target node.
        node: String,
        /// Command.
        action: NodeAction,
    },
    /// Quorum membership change.
    Quorum {
        /// Target node.
        node: String,
        /// Change applied.
        change: QuorumChange,
    },
    /// Blacklist change for one node.
    Blacklist {
        /// Which blacklist.
        kind: BlacklistKind,
        /// Target node.
        node: String,
        /// True for add, false for remove.
        added: bool,
    },
    /// Poll for leaders held by blacklisted nodes.
    LeadersPolled {
        /// Nodes polled.
        nodes: Vec<String>,
    },
    /// Load balancer toggled.
    LoadBalancer {
        /// New state.
        enabled: bool,
    },
    /// Backup or restore run.
    Backup {
        /// Direction.
        kind: BackupKind,
    },
}

#[derive(Default)]
struct MockState {
    running: HashMap<String, BTreeSet<ServerType>>,
    quorum: BTreeSet<String>,
    master_leader: Option<String>,
    leader_blacklist: BTreeSet<String>,
    data_blacklist: BTreeSet<String>,
    drain_polls_left: HashMap<String, u32>,
    load_balancer_enabled: bool,
    invocations: HashMap<(String, String), usize>,
    events: Vec<MockEvent>,
    failures: HashMap<(String, NodeAction), i32>,
}

impl MockState {
    fn elect_leader(&mut self) {
        let current_ok = self
            .master_leader
            .as_ref()
            .map(|l| self.quorum.contains(l) && self.is_running(l, ServerType::Master))
            .unwrap_or(false);
        if !current_ok {
            self.master_leader = self
                .quorum
                .iter()
                .find(|n| self.is_running(n, ServerType::Master))
                .cloned();
        }
    }

    fn is_running(&self, node: &str, server: ServerType) -> bool {
        self.running
            .get(node)
            .map(|p| p.contains(&server))
            .unwrap_or(false)
    }
}

/// Pauses one automation call until released.
#[derive(Clone)]
pub struct MockGate {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl MockGate {
    /// Wait until the held call has started.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the held call finish.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// In-memory cluster implementing [`NodeAutomation`] and [`ClusterAdmin`].
pub struct MockCluster {
    state: Mutex<MockState>,
    gates: Mutex<HashMap<(String, NodeAction), MockGate>>,
    /// Polls a blacklisted node keeps its leaders for.
    pub leader_drain_polls: u32,
    /// Lag reported by every follower.
    pub follower_lag_ms: u64,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// An empty cluster with the load balancer on.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                load_balancer_enabled: true,
                ..Default::default()
            }),
            gates: Mutex::new(HashMap::new()),
            leader_drain_polls: 1,
            follower_lag_ms: 0,
        }
    }

    /// A cluster mirroring a universe: every live node runs its configured
    /// processes, masters form the quorum and the first master leads.
    pub fn for_universe(universe: &Universe) -> Self {
        let mut state = MockState {
            load_balancer_enabled: true,
            ..Default::default()
        };
        for node in universe.details.node_details_set.iter().filter(|n| n.is_live()) {
            state
                .running
                .insert(node.node_name.clone(), node.process_types());
            if node.is_master {
                state.quorum.insert(node.node_name.clone());
            }
        }
        state.elect_leader();

        Self {
            state: Mutex::new(state),
            ..Self::new()
        }
    }

    /// Force a specific quorum leader.
    pub async fn set_master_leader(&self, node: &str) {
        self.state.lock().await.master_leader = Some(node.to_string());
    }

    /// Make the next `action` on `node` return `exit_code`.
    pub async fn fail_action(&self, node: &str, action: NodeAction, exit_code: i32) {
        self.state
            .lock()
            .await
            .failures
            .insert((node.to_string(), action), exit_code);
    }

    /// Hold the next `action` on `node` until the returned gate is released.
    pub async fn hold(&self, node: &str, action: NodeAction) -> MockGate {
        let gate = MockGate {
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        self.gates
            .lock()
            .await
            .insert((node.to_string(), action), gate.clone());
        gate
    }

    /// How often `action` ran on `node`.
    pub async fn invocations(&self, node: &str, action: NodeAction) -> usize {
        self.state
            .lock()
            .await
            .invocations
            .get(&(node.to_string(), action.verb()))
            .copied()
            .unwrap_or(0)
    }

    /// How often `action` ran on any node.
    pub async fn total_invocations(&self, action: NodeAction) -> usize {
        let verb = action.verb();
        self.state
            .lock()
            .await
            .invocations
            .iter()
            .filter(|((_, v), _)| *v == verb)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Every recorded call, in order.
    pub async fn events(&self) -> Vec<MockEvent> {
        self.state.lock().await.events.clone()
    }

    /// Node automation calls only, in order.
    pub async fn actions(&self) -> Vec<(String, NodeAction)> {
        self.state
            .lock()
            .await
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Action { node, action } => Some((node.clone(), *action)),
                _ => None,
            })
            .collect()
    }

    /// Whether the load balancer is on.
    pub async fn load_balancer_enabled(&self) -> bool {
        self.state.lock().await.load_balancer_enabled
    }

    /// Current quorum members.
    pub async fn quorum(&self) -> BTreeSet<String> {
        self.state.lock().await.quorum.clone()
    }

    /// Nodes on the leader blacklist.
    pub async fn leader_blacklist(&self) -> BTreeSet<String> {
        self.state.lock().await.leader_blacklist.clone()
    }

    /// Nodes on the data blacklist.
    pub async fn data_blacklist(&self) -> BTreeSet<String> {
        self.state.lock().await.data_blacklist.clone()
    }

    /// Whether `server` runs on `node`.
    pub async fn is_running(&self, node: &str, server: ServerType) -> bool {
        self.state.lock().await.is_running(node, server)
    }
}

#[async_trait]
impl NodeAutomation for MockCluster {
    async fn execute(
        &self,
        node: &NodeDetails,
        action: NodeAction,
        _params: &Value,
    ) -> Result<ShellResponse> {
        let name = node.node_name.clone();
        let failure = {
            let mut state = self.state.lock().await;
            *state
                .invocations
                .entry((name.clone(), action.verb()))
                .or_insert(0) += 1;
            state.events.push(MockEvent::Action {
                node: name.clone(),
                action,
            });
            state.failures.remove(&(name.clone(), action))
        };

        let gate = self.gates.lock().await.remove(&(name.clone(), action));
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }

        if let Some(exit_code) = failure {
            return Ok(ShellResponse {
                exit_code,
                output: format!("injected failure for {} on {}", action, name),
            });
        }

        let mut state = self.state.lock().await;
        match action {
            NodeAction::Start(server) => {
                state.running.entry(name).or_default().insert(server);
                state.elect_leader();
            }
            NodeAction::Stop(server) => {
                if let Some(procs) = state.running.get_mut(&name) {
                    procs.remove(&server);
                }
                state.elect_leader();
            }
            NodeAction::Destroy => {
                state.running.remove(&name);
                state.quorum.remove(&name);
                state.elect_leader();
            }
            _ => {}
        }
        Ok(ShellResponse::ok(action.verb()))
    }
}

#[async_trait]
impl ClusterAdmin for MockCluster {
    async fn master_leader(&self, _universe_id: Uuid) -> Result<Option<String>> {
        Ok(self.state.lock().await.master_leader.clone())
    }

    async fn list_masters(&self, _universe_id: Uuid) -> Result<Vec<String>> {
        Ok(self.state.lock().await.quorum.iter().cloned().collect())
    }

    async fn change_master_config(
        &self,
        _universe_id: Uuid,
        node: &NodeDetails,
        change: QuorumChange,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        match change {
            QuorumChange::Add => {
                if !state.is_running(&node.node_name, ServerType::Master) {
                    return Err(CoreError::ClusterAdminFailed {
                        operation: "change_master_config".to_string(),
                        details: format!("master on {} is not running", node.node_name),
                    });
                }
                state.quorum.insert(node.node_name.clone());
            }
            QuorumChange::Remove => {
                state.quorum.remove(&node.node_name);
            }
        }
        state.events.push(MockEvent::Quorum {
            node: node.node_name.clone(),
            change,
        });
        state.elect_leader();
        Ok(())
    }

    async fn modify_blacklist(
        &self,
        _universe_id: Uuid,
        kind: BlacklistKind,
        add: &[String],
        remove: &[String],
    ) -> Result<()> {
        let drain = self.leader_drain_polls;
        let mut state = self.state.lock().await;
        for node in add {
            match kind {
                BlacklistKind::Leader => {
                    state.leader_blacklist.insert(node.clone());
                    state.drain_polls_left.insert(node.clone(), drain);
                }
                BlacklistKind::Data => {
                    state.data_blacklist.insert(node.clone());
                }
            }
            state.events.push(MockEvent::Blacklist {
                kind,
                node: node.clone(),
                added: true,
            });
        }
        for node in remove {
            match kind {
                BlacklistKind::Leader => {
                    state.leader_blacklist.remove(node);
                    state.drain_polls_left.remove(node);
                }
                BlacklistKind::Data => {
                    state.data_blacklist.remove(node);
                }
            }
            state.events.push(MockEvent::Blacklist {
                kind,
                node: node.clone(),
                added: false,
            });
        }
        Ok(())
    }

    async fn leaders_held(&self, _universe_id: Uuid, nodes: &[String]) -> Result<u32> {
        let mut state = self.state.lock().await;
        state.events.push(MockEvent::LeadersPolled {
            nodes: nodes.to_vec(),
        });

        let mut held = 0;
        for node in nodes {
            if !state.is_running(node, ServerType::TServer) {
                continue;
            }
            if !state.leader_blacklist.contains(node) {
                held += LEADERS_PER_TSERVER;
                continue;
            }
            if let Some(left) = state.drain_polls_left.get_mut(node)
                && *left > 0
            {
                *left -= 1;
                held += LEADERS_PER_TSERVER;
            }
        }
        Ok(held)
    }

    async fn load_move_completion(&self, _universe_id: Uuid) -> Result<f64> {
        Ok(100.0)
    }

    async fn set_load_balancer_enabled(&self, _universe_id: Uuid, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.load_balancer_enabled = enabled;
        state.events.push(MockEvent::LoadBalancer { enabled });
        Ok(())
    }

    async fn is_load_balancer_enabled(&self, _universe_id: Uuid) -> Result<bool> {
        Ok(self.state.lock().await.load_balancer_enabled)
    }

    async fn ping_server(&self, node: &NodeDetails, server: ServerType) -> Result<bool> {
        Ok(self.state.lock().await.is_running(&node.node_name, server))
    }

    async fn is_server_ready(&self, node: &NodeDetails, server: ServerType) -> Result<bool> {
        Ok(self.state.lock().await.is_running(&node.node_name, server))
    }

    async fn follower_lag_ms(&self, _node: &NodeDetails) -> Result<u64> {
        Ok(self.follower_lag_ms)
    }

    async fn run_backup(
        &self,
        _universe_id: Uuid,
        kind: BackupKind,
        _request: &Value,
    ) -> Result<()> {
        self.state.lock().await.events.push(MockEvent::Backup { kind });
        Ok(())
    }
}
