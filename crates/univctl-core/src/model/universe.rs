// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The universe aggregate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::{CloudInfo, NodeDetails, NodeState};
use crate::task_types::TaskType;

/// Role of a cluster inside a universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterType {
    /// The cluster holding the masters and the primary data copies.
    Primary,
    /// A read replica.
    ReadReplica,
}

/// What the user asked for on one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIntent {
    /// Copies of each tablet.
    pub replication_factor: u32,
    /// Number of nodes in the cluster.
    pub num_nodes: u32,
    /// Database software version.
    pub software_version: String,
    /// Flags for master processes.
    #[serde(default)]
    pub master_gflags: BTreeMap<String, String>,
    /// Flags for tserver processes.
    #[serde(default)]
    pub tserver_gflags: BTreeMap<String, String>,
}

/// One availability zone in a placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementAz {
    /// Zone id.
    pub uuid: Uuid,
    /// Zone name.
    pub name: String,
    /// Nodes placed in this zone.
    pub num_nodes_in_az: u32,
    /// Preferred zone for leaders.
    #[serde(default)]
    pub is_affinitized: bool,
}

/// Availability zones used by a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementInfo {
    /// The zones, in declaration order.
    pub azs: Vec<PlacementAz>,
}

/// A primary or read-replica cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster id (the `placement_uuid` of its nodes).
    pub uuid: Uuid,
    /// Primary or read replica.
    pub cluster_type: ClusterType,
    /// Requested configuration.
    pub user_intent: UserIntent,
    /// Zone layout.
    pub placement_info: PlacementInfo,
}

/// Progress of a software upgrade on the universe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoftwareUpgradeState {
    /// No upgrade in flight.
    #[default]
    Ready,
    /// An upgrade is in flight.
    Upgrading,
    /// The last upgrade failed after it started changing nodes.
    UpgradeFailed,
}

/// Mutable body of a universe record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseDetails {
    /// Prefix used for node names.
    pub node_prefix: String,
    /// Primary cluster first, then read replicas.
    pub clusters: Vec<Cluster>,
    /// All nodes, ordered by `node_idx`.
    pub node_details_set: Vec<NodeDetails>,
    /// True if and only if a task owns the lock.
    pub update_in_progress: bool,
    /// Whether the last locked operation completed successfully.
    pub update_succeeded: bool,
    /// Task currently owning the lock.
    pub updating_task_id: Option<Uuid>,
    /// Type of the task currently owning the lock.
    pub updating_task_type: Option<TaskType>,
    /// Last topology-changing task that has not succeeded yet.
    pub placement_modification_task_id: Option<Uuid>,
    /// Software upgrade progress.
    #[serde(default)]
    pub software_upgrade_state: SoftwareUpgradeState,
    /// A backup or restore is running against the universe.
    #[serde(default)]
    pub backup_in_progress: bool,
}

/// One managed database cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Universe {
    /// Unique id.
    pub universe_id: Uuid,
    /// Display name.
    pub name: String,
    /// Optimistic-concurrency token, bumped on every committed mutation.
    pub version: i64,
    /// Topology and lock state.
    pub details: UniverseDetails,
}

impl Universe {
    /// The primary cluster, if the universe has one.
    pub fn primary_cluster(&self) -> Option<&Cluster> {
        self.details
            .clusters
            .iter()
            .find(|c| c.cluster_type == ClusterType::Primary)
    }

    /// Mutable access to the primary cluster.
    pub fn primary_cluster_mut(&mut self) -> Option<&mut Cluster> {
        self.details
            .clusters
            .iter_mut()
            .find(|c| c.cluster_type == ClusterType::Primary)
    }

    /// Read replica clusters.
    pub fn read_replica_clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.details
            .clusters
            .iter()
            .filter(|c| c.cluster_type == ClusterType::ReadReplica)
    }

    /// Cluster by id.
    pub fn cluster(&self, cluster_uuid: Uuid) -> Option<&Cluster> {
        self.details.clusters.iter().find(|c| c.uuid == cluster_uuid)
    }

    /// Node by name.
    pub fn node(&self, node_name: &str) -> Option<&NodeDetails> {
        self.details
            .node_details_set
            .iter()
            .find(|n| n.node_name == node_name)
    }

    /// Mutable node by name.
    pub fn node_mut(&mut self, node_name: &str) -> Option<&mut NodeDetails> {
        self.details
            .node_details_set
            .iter_mut()
            .find(|n| n.node_name == node_name)
    }

    /// Nodes configured to run a master, excluding removed ones.
    pub fn masters(&self) -> Vec<NodeDetails> {
        self.details
            .node_details_set
            .iter()
            .filter(|n| n.is_master && !n.state.is_gone())
            .cloned()
            .collect()
    }

    /// Nodes configured to run a tserver, excluding removed ones.
    pub fn tservers(&self) -> Vec<NodeDetails> {
        self.details
            .node_details_set
            .iter()
            .filter(|n| n.is_tserver && !n.state.is_gone())
            .cloned()
            .collect()
    }

    /// Nodes belonging to one cluster.
    pub fn nodes_in_cluster(&self, cluster_uuid: Uuid) -> impl Iterator<Item = &NodeDetails> {
        self.details
            .node_details_set
            .iter()
            .filter(move |n| n.is_in_placement(cluster_uuid))
    }

    /// Replication factor of the cluster a node belongs to (1 if unknown).
    pub fn replication_factor_for(&self, node: &NodeDetails) -> u32 {
        self.cluster(node.placement_uuid)
            .map(|c| c.user_intent.replication_factor)
            .unwrap_or(1)
    }

    /// Whether a topology change is pending and the universe is restricted.
    pub fn placement_modification_pending(&self) -> bool {
        self.details.placement_modification_task_id.is_some()
    }

    /// Next free node index.
    pub fn next_node_idx(&self) -> u32 {
        self.details
            .node_details_set
            .iter()
            .map(|n| n.node_idx)
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// Builds a universe definition with a deterministic node layout.
///
/// Nodes are named `<prefix>-n<idx>` and spread round-robin over the zones;
/// the first `replication_factor` primary nodes (one per zone where possible)
/// also run a master.
#[derive(Debug, Clone)]
pub struct UniverseBuilder {
    name: String,
    clusters: Vec<(ClusterType, UserIntent, Vec<PlacementAz>)>,
    cloud: String,
    region: String,
}

impl UniverseBuilder {
    /// Start a universe with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clusters: Vec::new(),
            cloud: "aws".to_string(),
            region: "us-west-2".to_string(),
        }
    }

    /// Add the primary cluster.
    pub fn primary(mut self, intent: UserIntent, azs: &[&str]) -> Self {
        self.clusters
            .push((ClusterType::Primary, intent, Self::zones(azs)));
        self
    }

    /// Add a read replica cluster.
    pub fn read_replica(mut self, intent: UserIntent, azs: &[&str]) -> Self {
        self.clusters
            .push((ClusterType::ReadReplica, intent, Self::zones(azs)));
        self
    }

    fn zones(azs: &[&str]) -> Vec<PlacementAz> {
        azs.iter()
            .map(|name| PlacementAz {
                uuid: Uuid::new_v4(),
                name: name.to_string(),
                num_nodes_in_az: 0,
                is_affinitized: false,
            })
            .collect()
    }

    /// Produce the universe at version 1 with every node `Live`.
    pub fn build(self) -> Universe {
        let node_prefix = format!("yb-{}", self.name);
        let mut clusters = Vec::new();
        let mut nodes = Vec::new();
        let mut idx = 0;
        let mut octet = 10;

        for (cluster_type, intent, mut azs) in self.clusters {
            let cluster_uuid = Uuid::new_v4();
            let mut masters_left = if cluster_type == ClusterType::Primary {
                intent.replication_factor
            } else {
                0
            };

            for i in 0..intent.num_nodes as usize {
                idx += 1;
                octet += 1;
                let az_slot = if azs.is_empty() { None } else { Some(i % azs.len()) };
                let (az_uuid, az_name) = match az_slot {
                    Some(slot) => {
                        azs[slot].num_nodes_in_az += 1;
                        (azs[slot].uuid, azs[slot].name.clone())
                    }
                    None => (Uuid::nil(), String::new()),
                };
                let is_master = masters_left > 0;
                masters_left = masters_left.saturating_sub(1);

                nodes.push(NodeDetails {
                    node_name: format!("{}-n{}", node_prefix, idx),
                    node_uuid: Uuid::new_v4(),
                    node_idx: idx,
                    placement_uuid: cluster_uuid,
                    az_uuid,
                    cloud_info: CloudInfo {
                        cloud: self.cloud.clone(),
                        region: self.region.clone(),
                        az: az_name,
                        private_ip: Some(format!("10.0.0.{}", octet)),
                        public_ip: None,
                    },
                    is_master,
                    is_tserver: true,
                    state: NodeState::Live,
                });
            }

            clusters.push(Cluster {
                uuid: cluster_uuid,
                cluster_type,
                user_intent: intent,
                placement_info: PlacementInfo { azs },
            });
        }

        Universe {
            universe_id: Uuid::new_v4(),
            name: self.name,
            version: 1,
            details: UniverseDetails {
                node_prefix,
                clusters,
                node_details_set: nodes,
                update_succeeded: true,
                ..Default::default()
            },
        }
    }
}

impl UserIntent {
    /// Intent with no flags set.
    pub fn new(replication_factor: u32, num_nodes: u32, software_version: &str) -> Self {
        Self {
            replication_factor,
            num_nodes,
            software_version: software_version.to_string(),
            master_gflags: BTreeMap::new(),
            tserver_gflags: BTreeMap::new(),
        }
    }
}
