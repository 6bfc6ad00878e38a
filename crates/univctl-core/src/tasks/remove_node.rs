// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node removal.

use serde::{Deserialize, Serialize};

use super::{PlanContext, UniverseTask};
use crate::automation::{NodeAction, QuorumChange};
use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, NodeState, ServerType, Universe};
use crate::queue::{SubTaskGroup, SubTaskGroupType, SubTaskQueue};
use crate::subtask::SubTask;
use crate::task_types::TaskType;

/// Parameters of a node removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveNodeParams {
    /// Node to remove.
    pub node_name: String,
}

/// Drains data off a node, stops its processes, takes its master out of
/// the quorum and marks it removed. The instance itself is kept.
pub struct RemoveNodeFromUniverse {
    params: RemoveNodeParams,
}

impl RemoveNodeFromUniverse {
    /// Task for the given parameters.
    pub fn new(params: RemoveNodeParams) -> Self {
        Self { params }
    }

    fn node<'u>(&self, universe: &'u Universe) -> Result<&'u NodeDetails> {
        universe
            .node(&self.params.node_name)
            .ok_or_else(|| CoreError::NodeNotFound {
                universe_id: universe.universe_id,
                node_name: self.params.node_name.clone(),
            })
    }
}

impl UniverseTask for RemoveNodeFromUniverse {
    fn task_type(&self) -> TaskType {
        TaskType::RemoveNodeFromUniverse
    }

    fn validate(&self, universe: &Universe, is_first_try: bool) -> Result<()> {
        let node = self.node(universe)?;
        if node.state.is_gone() {
            return Err(CoreError::validation(
                "node_name",
                format!("node {} is already {}", node.node_name, node.state),
            ));
        }
        // A retry may find the node half removed; the tablets were already
        // moved or will be moved again.
        if is_first_try && node.is_tserver {
            let remaining = universe
                .nodes_in_cluster(node.placement_uuid)
                .filter(|n| n.node_name != node.node_name)
                .filter(|n| n.is_tserver && !n.state.is_gone())
                .count() as u32;
            let rf = universe.replication_factor_for(node);
            if remaining < rf {
                return Err(CoreError::validation(
                    "node_name",
                    format!(
                        "removing {} leaves {} tservers for replication factor {}",
                        node.node_name, remaining, rf
                    ),
                ));
            }
        }
        Ok(())
    }

    fn build_plan(&self, plan: &PlanContext<'_>) -> Result<SubTaskQueue> {
        let node = self.node(plan.universe)?.clone();
        let name = node.node_name.clone();
        let single = std::slice::from_ref(&node);
        let mut queue = SubTaskQueue::new();

        queue.add_group(SubTaskGroup::single(
            "Node removing",
            SubTaskGroupType::RemovingNode,
            SubTask::set_state(single, NodeState::Removing),
        ));

        if node.is_tserver {
            queue.add_sequential(
                "Move data off node",
                SubTaskGroupType::RebalancingLoad,
                vec![
                    SubTask::ModifyDataBlacklist {
                        add: vec![name.clone()],
                        remove: Vec::new(),
                    },
                    SubTask::WaitForLoadMove,
                ],
            );
            queue.add_group(SubTaskGroup::single(
                "Stop tserver",
                SubTaskGroupType::StoppingNodeProcesses,
                SubTask::command(&node, NodeAction::Stop(ServerType::TServer)),
            ));
        }

        if node.is_master {
            queue.add_sequential(
                "Remove master",
                SubTaskGroupType::RemovingNode,
                vec![
                    SubTask::command(&node, NodeAction::Stop(ServerType::Master)),
                    SubTask::ChangeMasterConfig {
                        node: name.clone(),
                        change: QuorumChange::Remove,
                    },
                    SubTask::UpdateNodeProcess {
                        node: name.clone(),
                        server: ServerType::Master,
                        enabled: false,
                    },
                ],
            );
        }

        queue.add_group(SubTaskGroup::single(
            "Node removed",
            SubTaskGroupType::RemovingNode,
            SubTask::set_state(single, NodeState::Removed),
        ));
        queue.add_group(SubTaskGroup::single(
            "Update placement",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::RecomputePlacement,
        ));
        if node.is_tserver {
            queue.add_group(SubTaskGroup::single(
                "Clear data blacklist",
                SubTaskGroupType::RebalancingLoad,
                SubTask::ModifyDataBlacklist {
                    add: Vec::new(),
                    remove: vec![name],
                },
            ));
        }
        Ok(queue)
    }
}
