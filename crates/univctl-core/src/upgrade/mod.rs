// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upgrade orchestrator.
//!
//! Builds the subtask groups that move a set of nodes to a new software
//! version or configuration. Three strategies trade availability for speed:
//!
//! | Option | Nodes disrupted at once | Process restart |
//! |--------|-------------------------|-----------------|
//! | [`UpgradeOption::RollingUpgrade`] | one | yes |
//! | [`UpgradeOption::NonRollingUpgrade`] | all | yes |
//! | [`UpgradeOption::NonRestartUpgrade`] | none | no |
//!
//! Masters and tservers are processed as two phases, masters first unless
//! [`UpgradeContext::process_tservers_first`] is set. Primary-cluster
//! tservers that are not masters can get a leading phase of their own for
//! their inactive master process ([`UpgradeContext::process_inactive_master`]).

mod flows;
pub mod ordering;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{NodeDetails, NodeState, ServerType, Universe};
use crate::queue::{SubTaskGroupType, SubTaskQueue};
use crate::subtask::SubTask;

/// How a change is applied across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeOption {
    /// One node at a time.
    RollingUpgrade,
    /// All nodes at once.
    NonRollingUpgrade,
    /// Without stopping processes.
    NonRestartUpgrade,
}

/// Per-node action: the tasks to run for a node set and its process types,
/// in order. Must not depend on orchestrator state.
pub type NodeActionFn<'a> =
    &'a (dyn Fn(&[NodeDetails], &BTreeSet<ServerType>) -> Vec<SubTask> + Sync);

/// Extra tasks to run for one node after it is back up.
pub type PostActionFn = Arc<dyn Fn(&NodeDetails) -> Vec<SubTask> + Send + Sync>;

/// Configuration of one upgrade invocation.
#[derive(Clone)]
pub struct UpgradeContext {
    /// Remove masters from the quorum while stopped and add them back once
    /// they answer.
    pub reconfigure_master: bool,
    /// Run the action before stopping the process instead of after.
    pub run_before_stopping: bool,
    /// Also process the master role of primary-cluster nodes that do not
    /// run an active master.
    pub process_inactive_master: bool,
    /// Process tservers before masters.
    pub process_tservers_first: bool,
    /// Tasks run for each node after it is back up.
    pub post_action: Option<PostActionFn>,
    /// Target software version, used by prechecks.
    pub target_software_version: Option<String>,
    /// Node state while a node is being changed.
    pub upgrading_state: NodeState,
    /// Category of the action groups.
    pub group_type: SubTaskGroupType,
}

impl Default for UpgradeContext {
    fn default() -> Self {
        Self {
            reconfigure_master: false,
            run_before_stopping: false,
            process_inactive_master: false,
            process_tservers_first: false,
            post_action: None,
            target_software_version: None,
            upgrading_state: NodeState::Stopping,
            group_type: SubTaskGroupType::RestartingNodes,
        }
    }
}

impl fmt::Debug for UpgradeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeContext")
            .field("reconfigure_master", &self.reconfigure_master)
            .field("run_before_stopping", &self.run_before_stopping)
            .field("process_inactive_master", &self.process_inactive_master)
            .field("process_tservers_first", &self.process_tservers_first)
            .field("post_action", &self.post_action.is_some())
            .field("target_software_version", &self.target_software_version)
            .field("upgrading_state", &self.upgrading_state)
            .field("group_type", &self.group_type)
            .finish()
    }
}

/// Target nodes, split by role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MastersAndTservers {
    /// Nodes whose master process is changed.
    pub masters: Vec<NodeDetails>,
    /// Nodes whose tserver process is changed.
    pub tservers: Vec<NodeDetails>,
}

impl MastersAndTservers {
    /// Every master and tserver of the universe.
    pub fn all(universe: &Universe) -> Self {
        Self {
            masters: universe.masters(),
            tservers: universe.tservers(),
        }
    }

    /// Keep only the roles selected.
    pub fn select(mut self, masters: bool, tservers: bool) -> Self {
        if !masters {
            self.masters.clear();
        }
        if !tservers {
            self.tservers.clear();
        }
        self
    }

    /// Whether there is nothing to process.
    pub fn is_empty(&self) -> bool {
        self.masters.is_empty() && self.tservers.is_empty()
    }
}

/// Run-level flags that shape the flows.
#[derive(Debug, Clone, Copy)]
pub struct FlowPolicy {
    /// Drain leaders off tservers before stopping them.
    pub blacklist_leaders: bool,
    /// Check follower lag after restarting tservers.
    pub follower_lag_check: bool,
    /// False for resumed or retried runs.
    pub is_first_try: bool,
}

/// One phase: nodes, the process types changed on them, and whether the
/// processes are supposed to run afterwards.
struct Phase {
    nodes: Vec<NodeDetails>,
    process_types: BTreeSet<ServerType>,
    active_role: bool,
}

/// Builds upgrade flows for one universe snapshot.
pub struct UpgradeOrchestrator<'a> {
    universe: &'a Universe,
    policy: FlowPolicy,
    master_leader: Option<String>,
}

impl<'a> UpgradeOrchestrator<'a> {
    /// Orchestrator over a universe snapshot. `master_leader` is sorted
    /// last among masters in rolling flows.
    pub fn new(universe: &'a Universe, policy: FlowPolicy, master_leader: Option<String>) -> Self {
        Self {
            universe,
            policy,
            master_leader,
        }
    }

    /// Append the groups applying `action` to `nodes` with `option`. Nodes
    /// that are not live are taken first in rolling phases.
    pub fn create_upgrade_task_flow(
        &self,
        queue: &mut SubTaskQueue,
        action: NodeActionFn<'_>,
        nodes: &MastersAndTservers,
        context: &UpgradeContext,
        option: UpgradeOption,
    ) {
        for phase in self.phases(nodes, context, option) {
            match option {
                UpgradeOption::RollingUpgrade => self.rolling_phase(queue, action, &phase, context),
                UpgradeOption::NonRollingUpgrade => {
                    self.non_rolling_phase(queue, action, &phase, context)
                }
                UpgradeOption::NonRestartUpgrade => {
                    self.non_restart_phase(queue, action, &phase, context)
                }
            }
        }
    }

    fn phases(
        &self,
        nodes: &MastersAndTservers,
        context: &UpgradeContext,
        option: UpgradeOption,
    ) -> Vec<Phase> {
        let rolling = option == UpgradeOption::RollingUpgrade;
        let masters = if rolling {
            ordering::sort_masters(&nodes.masters, self.master_leader.as_deref())
        } else {
            nodes.masters.clone()
        };
        let tservers = if rolling {
            ordering::sort_tservers(self.universe, &nodes.tservers)
        } else {
            nodes.tservers.clone()
        };

        let mut phases = Vec::new();
        if context.process_inactive_master && option != UpgradeOption::NonRestartUpgrade {
            let inactive = self.inactive_masters(&nodes.masters);
            phases.push(Phase {
                nodes: if rolling {
                    ordering::sort_tservers(self.universe, &inactive)
                } else {
                    inactive
                },
                process_types: BTreeSet::from([ServerType::Master]),
                active_role: false,
            });
        }

        let master_phase = Phase {
            nodes: masters,
            process_types: BTreeSet::from([ServerType::Master]),
            active_role: true,
        };
        let tserver_phase = Phase {
            nodes: tservers,
            process_types: BTreeSet::from([ServerType::TServer]),
            active_role: true,
        };
        if context.process_tservers_first {
            phases.push(tserver_phase);
            phases.push(master_phase);
        } else {
            phases.push(master_phase);
            phases.push(tserver_phase);
        }

        phases.retain(|p| !p.nodes.is_empty());
        phases
    }

    /// Primary-cluster tservers not in the master set.
    fn inactive_masters(&self, masters: &[NodeDetails]) -> Vec<NodeDetails> {
        let Some(primary) = self.universe.primary_cluster() else {
            return Vec::new();
        };
        self.universe
            .tservers()
            .into_iter()
            .filter(|n| n.is_in_placement(primary.uuid))
            .filter(|n| !masters.iter().any(|m| m.node_name == n.node_name))
            .collect()
    }
}
