// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster members and their lifecycle.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two server roles a node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServerType {
    /// Metadata/quorum role.
    Master,
    /// Data-serving role.
    TServer,
}

impl ServerType {
    /// Returns the string representation of the server type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::TServer => "tserver",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a node.
///
/// ```text
/// ToBeAdded -> InstanceCreated -> ServerSetup -> ToJoinCluster -> Live
///                                                    ^             |
///             Adding ----------------------------------+           |
///                                                                  v
///            (UpgradeSoftware | UpdateGFlags | Stopping/Starting)  <-> Live
///                                                                  |
///        ToBeRemoved -> Removing -> Removed                        |
///        BeingDecommissioned -> Decommissioned  <------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Planned but not yet provisioned.
    ToBeAdded,
    /// Cloud instance exists.
    InstanceCreated,
    /// Server software is being set up.
    ServerSetup,
    /// Waiting to join the cluster.
    ToJoinCluster,
    /// Instance provisioned with prerequisites.
    Provisioned,
    /// Software installed but processes not yet started.
    SoftwareInstalled,
    /// Software upgrade in progress on this node.
    UpgradeSoftware,
    /// Flag change in progress on this node.
    UpdateGFlags,
    /// Serving.
    Live,
    /// Processes are being stopped.
    Stopping,
    /// Processes are being started.
    Starting,
    /// Processes are stopped.
    Stopped,
    /// Being added back into the universe.
    Adding,
    /// Marked for removal.
    ToBeRemoved,
    /// Being removed.
    Removing,
    /// Removed from the universe; the instance may still exist.
    Removed,
    /// Instance is being released.
    BeingDecommissioned,
    /// Instance released.
    Decommissioned,
}

impl NodeState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToBeAdded => "ToBeAdded",
            Self::InstanceCreated => "InstanceCreated",
            Self::ServerSetup => "ServerSetup",
            Self::ToJoinCluster => "ToJoinCluster",
            Self::Provisioned => "Provisioned",
            Self::SoftwareInstalled => "SoftwareInstalled",
            Self::UpgradeSoftware => "UpgradeSoftware",
            Self::UpdateGFlags => "UpdateGFlags",
            Self::Live => "Live",
            Self::Stopping => "Stopping",
            Self::Starting => "Starting",
            Self::Stopped => "Stopped",
            Self::Adding => "Adding",
            Self::ToBeRemoved => "ToBeRemoved",
            Self::Removing => "Removing",
            Self::Removed => "Removed",
            Self::BeingDecommissioned => "BeingDecommissioned",
            Self::Decommissioned => "Decommissioned",
        }
    }

    /// Whether the node is out of the universe (removed or released).
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Removed | Self::Decommissioned)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a node runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInfo {
    /// Cloud provider code.
    pub cloud: String,
    /// Region code.
    pub region: String,
    /// Availability zone name.
    pub az: String,
    /// Private address; cleared when the node is decommissioned.
    pub private_ip: Option<String>,
    /// Public address; cleared when the node is decommissioned.
    pub public_ip: Option<String>,
}

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetails {
    /// Unique, human-readable node name.
    pub node_name: String,
    /// Stable node id.
    pub node_uuid: Uuid,
    /// Sequence index used for deterministic naming and ordering.
    pub node_idx: u32,
    /// Cluster this node belongs to.
    pub placement_uuid: Uuid,
    /// Availability zone id.
    pub az_uuid: Uuid,
    /// Placement details.
    pub cloud_info: CloudInfo,
    /// Runs a master process.
    pub is_master: bool,
    /// Runs a tserver process.
    pub is_tserver: bool,
    /// Lifecycle state.
    pub state: NodeState,
}

impl NodeDetails {
    /// Process types configured on this node.
    pub fn process_types(&self) -> BTreeSet<ServerType> {
        let mut types = BTreeSet::new();
        if self.is_master {
            types.insert(ServerType::Master);
        }
        if self.is_tserver {
            types.insert(ServerType::TServer);
        }
        types
    }

    /// Whether this node belongs to the given cluster.
    pub fn is_in_placement(&self, cluster_uuid: Uuid) -> bool {
        self.placement_uuid == cluster_uuid
    }

    /// Whether the node is serving.
    pub fn is_live(&self) -> bool {
        self.state == NodeState::Live
    }

    /// Private address, or empty if the node has none.
    pub fn private_ip(&self) -> &str {
        self.cloud_info.private_ip.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for NodeDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.node_name, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(is_master: bool, is_tserver: bool) -> NodeDetails {
        NodeDetails {
            node_name: "u-n1".to_string(),
            node_uuid: Uuid::new_v4(),
            node_idx: 1,
            placement_uuid: Uuid::nil(),
            az_uuid: Uuid::nil(),
            cloud_info: CloudInfo::default(),
            is_master,
            is_tserver,
            state: NodeState::Live,
        }
    }

    #[test]
    fn test_process_types() {
        let both = node(true, true);
        assert_eq!(
            both.process_types().into_iter().collect::<Vec<_>>(),
            vec![ServerType::Master, ServerType::TServer]
        );
        assert_eq!(node(false, true).process_types().len(), 1);
        assert!(node(false, false).process_types().is_empty());
    }

    #[test]
    fn test_node_state_gone() {
        assert!(NodeState::Removed.is_gone());
        assert!(NodeState::Decommissioned.is_gone());
        assert!(!NodeState::ToBeRemoved.is_gone());
        assert!(!NodeState::Live.is_gone());
    }

    #[test]
    fn test_private_ip_default() {
        let mut n = node(true, true);
        assert_eq!(n.private_ip(), "");
        n.cloud_info.private_ip = Some("10.0.0.1".to_string());
        assert_eq!(n.private_ip(), "10.0.0.1");
    }
}
