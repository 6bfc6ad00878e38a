// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node addition.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{PlanContext, UniverseTask};
use crate::automation::{NodeAction, QuorumChange};
use crate::error::{CoreError, Result};
use crate::model::{CloudInfo, Cluster, ClusterType, NodeDetails, NodeState, ServerType, Universe};
use crate::queue::{SubTaskGroup, SubTaskGroupType, SubTaskQueue};
use crate::subtask::SubTask;
use crate::task_types::TaskType;

/// Parameters of a node addition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNodeParams {
    /// Cluster to grow; the primary cluster if unset.
    #[serde(default)]
    pub cluster_uuid: Option<Uuid>,
    /// Zone name; the zone with the fewest nodes if unset.
    #[serde(default)]
    pub az_name: Option<String>,
    /// Also run a master on the new node.
    #[serde(default)]
    pub as_master: bool,
}

/// Provisions a node, installs software, joins it to the cluster and
/// updates the placement counts.
pub struct AddNodeToUniverse {
    params: AddNodeParams,
}

/// States a node passes through before it first goes live. A node found in
/// one of them was left behind by an earlier attempt and is reused.
const PENDING_STATES: [NodeState; 7] = [
    NodeState::ToBeAdded,
    NodeState::InstanceCreated,
    NodeState::ServerSetup,
    NodeState::ToJoinCluster,
    NodeState::Provisioned,
    NodeState::SoftwareInstalled,
    NodeState::Adding,
];

impl AddNodeToUniverse {
    /// Task for the given parameters.
    pub fn new(params: AddNodeParams) -> Self {
        Self { params }
    }

    fn target_cluster<'u>(&self, universe: &'u Universe) -> Result<&'u Cluster> {
        match self.params.cluster_uuid {
            Some(uuid) => universe
                .cluster(uuid)
                .ok_or_else(|| CoreError::validation("cluster_uuid", format!("no cluster {}", uuid))),
            None => universe
                .primary_cluster()
                .ok_or_else(|| CoreError::validation("cluster_uuid", "no primary cluster")),
        }
    }

    /// The node to add: a pending node from an earlier attempt, or a new one.
    fn node_to_add(&self, universe: &Universe) -> Result<NodeDetails> {
        let cluster = self.target_cluster(universe)?;
        if let Some(pending) = universe
            .nodes_in_cluster(cluster.uuid)
            .find(|n| PENDING_STATES.contains(&n.state))
        {
            return Ok(pending.clone());
        }

        let az = match &self.params.az_name {
            Some(name) => cluster
                .placement_info
                .azs
                .iter()
                .find(|az| &az.name == name)
                .ok_or_else(|| CoreError::validation("az_name", format!("no zone {}", name)))?,
            None => cluster
                .placement_info
                .azs
                .iter()
                .min_by_key(|az| az.num_nodes_in_az)
                .ok_or_else(|| CoreError::validation("az_name", "cluster has no zones"))?,
        };
        let template = universe.nodes_in_cluster(cluster.uuid).next();
        let idx = universe.next_node_idx();

        Ok(NodeDetails {
            node_name: format!("{}-n{}", universe.details.node_prefix, idx),
            node_uuid: Uuid::new_v4(),
            node_idx: idx,
            placement_uuid: cluster.uuid,
            az_uuid: az.uuid,
            cloud_info: CloudInfo {
                cloud: template.map(|n| n.cloud_info.cloud.clone()).unwrap_or_default(),
                region: template.map(|n| n.cloud_info.region.clone()).unwrap_or_default(),
                az: az.name.clone(),
                private_ip: None,
                public_ip: None,
            },
            is_master: self.params.as_master,
            is_tserver: true,
            state: NodeState::ToBeAdded,
        })
    }
}

impl UniverseTask for AddNodeToUniverse {
    fn task_type(&self) -> TaskType {
        TaskType::AddNodeToUniverse
    }

    fn validate(&self, universe: &Universe, _is_first_try: bool) -> Result<()> {
        self.node_to_add(universe)?;
        if self.params.as_master {
            let cluster = self.target_cluster(universe)?;
            if cluster.cluster_type != ClusterType::Primary {
                return Err(CoreError::validation(
                    "as_master",
                    "masters only run in the primary cluster",
                ));
            }
        }
        Ok(())
    }

    fn build_plan(&self, plan: &PlanContext<'_>) -> Result<SubTaskQueue> {
        let node = self.node_to_add(plan.universe)?;
        let as_master = self.params.as_master || node.is_master;
        let name = node.node_name.clone();
        let mut queue = SubTaskQueue::new();

        queue.add_group(SubTaskGroup::single(
            "Add node details",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::AddNodeDetails {
                node: Box::new(node.clone()),
            },
        ));
        queue.add_group(SubTaskGroup::single(
            "Provision instance",
            SubTaskGroupType::Provisioning,
            SubTask::command(&node, NodeAction::Provision),
        ));
        queue.add_group(SubTaskGroup::single(
            "Instance created",
            SubTaskGroupType::Provisioning,
            SubTask::set_state(std::slice::from_ref(&node), NodeState::InstanceCreated),
        ));

        let mut server_types = vec![ServerType::TServer];
        if as_master {
            server_types.insert(0, ServerType::Master);
        }
        let mut install = vec![SubTask::command(&node, NodeAction::Download)];
        for server in &server_types {
            install.push(SubTask::command(&node, NodeAction::InstallSoftware(*server)));
            install.push(SubTask::command(&node, NodeAction::Configure(*server)));
        }
        queue.add_sequential("Install software", SubTaskGroupType::InstallingSoftware, install);

        for state in [NodeState::ServerSetup, NodeState::ToJoinCluster] {
            queue.add_group(SubTaskGroup::single(
                format!("Node {}", state),
                SubTaskGroupType::ConfigureUniverse,
                SubTask::set_state(std::slice::from_ref(&node), state),
            ));
        }

        // A node reused after a removal may still be blacklisted.
        let mut clear = SubTaskGroup::new("Clear blacklists", SubTaskGroupType::ConfigureUniverse);
        clear
            .add(SubTask::ModifyLeaderBlacklist {
                add: Vec::new(),
                remove: vec![name.clone()],
            })
            .add(SubTask::ModifyDataBlacklist {
                add: Vec::new(),
                remove: vec![name.clone()],
            });
        queue.add_group(clear);

        for server in server_types {
            let mut steps = vec![
                SubTask::command(&node, NodeAction::Start(server)),
                SubTask::WaitForServer {
                    node: name.clone(),
                    server,
                },
            ];
            if server == ServerType::Master {
                steps.push(SubTask::ChangeMasterConfig {
                    node: name.clone(),
                    change: QuorumChange::Add,
                });
            }
            steps.push(SubTask::WaitForServerReady {
                node: name.clone(),
                server,
            });
            queue.add_sequential(
                &format!("Start {}", server),
                SubTaskGroupType::StartingNodeProcesses,
                steps,
            );
        }

        queue.add_group(SubTaskGroup::single(
            "Node live",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::set_state(std::slice::from_ref(&node), NodeState::Live),
        ));
        queue.add_group(SubTaskGroup::single(
            "Update placement",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::RecomputePlacement,
        ));
        Ok(queue)
    }
}
