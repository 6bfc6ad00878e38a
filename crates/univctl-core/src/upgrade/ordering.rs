// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node ordering for rolling flows.
//!
//! Nodes that are already down go first, the master leader goes last, and
//! tservers are spread over zones so one zone is not drained before the next.

use std::collections::HashMap;

use uuid::Uuid;

use crate::model::{Cluster, ClusterType, NodeDetails, Universe};

/// Masters: non-live first, the quorum leader last, then by node index.
pub fn sort_masters(nodes: &[NodeDetails], leader: Option<&str>) -> Vec<NodeDetails> {
    let mut sorted = nodes.to_vec();
    sorted.sort_by_key(|n| {
        (
            n.is_live(),
            leader == Some(n.node_name.as_str()),
            n.node_idx,
        )
    });
    sorted
}

/// TServers: primary cluster first, non-live first, then by zone rank,
/// then by node index.
pub fn sort_tservers(universe: &Universe, nodes: &[NodeDetails]) -> Vec<NodeDetails> {
    let mut ranks: HashMap<Uuid, HashMap<Uuid, usize>> = HashMap::new();
    for cluster in &universe.details.clusters {
        let in_cluster: Vec<&NodeDetails> = nodes
            .iter()
            .filter(|n| n.is_in_placement(cluster.uuid))
            .collect();
        ranks.insert(cluster.uuid, zone_ranks(cluster, &in_cluster));
    }

    let mut sorted = nodes.to_vec();
    sorted.sort_by_key(|n| {
        let is_primary = universe
            .cluster(n.placement_uuid)
            .map(|c| c.cluster_type == ClusterType::Primary)
            .unwrap_or(false);
        let zone_rank = ranks
            .get(&n.placement_uuid)
            .and_then(|r| r.get(&n.az_uuid))
            .copied()
            .unwrap_or(usize::MAX);
        (!is_primary, n.is_live(), zone_rank, n.node_idx)
    });
    sorted
}

/// Rank of each zone of a cluster: affinitized zones first, then zones with
/// fewer nodes, then the first node index seen in the zone, then zone id.
fn zone_ranks(cluster: &Cluster, nodes: &[&NodeDetails]) -> HashMap<Uuid, usize> {
    let first_idx = |az: Uuid| {
        nodes
            .iter()
            .filter(|n| n.az_uuid == az)
            .map(|n| n.node_idx)
            .min()
            .unwrap_or(u32::MAX)
    };

    let mut zones: Vec<_> = cluster
        .placement_info
        .azs
        .iter()
        .map(|az| {
            (
                !az.is_affinitized,
                az.num_nodes_in_az,
                first_idx(az.uuid),
                az.uuid,
            )
        })
        .collect();
    zones.sort();

    zones
        .into_iter()
        .enumerate()
        .map(|(rank, (_, _, _, uuid))| (uuid, rank))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeState, UniverseBuilder, UserIntent};

    fn names(nodes: &[NodeDetails]) -> Vec<&str> {
        nodes.iter().map(|n| n.node_name.as_str()).collect()
    }

    #[test]
    fn test_master_leader_last_and_down_first() {
        let mut universe = UniverseBuilder::new("ord")
            .primary(UserIntent::new(3, 3, "2.20.0"), &["az1", "az2", "az3"])
            .build();
        universe.node_mut("yb-ord-n3").unwrap().state = NodeState::Stopped;

        let sorted = sort_masters(&universe.masters(), Some("yb-ord-n1"));
        assert_eq!(names(&sorted), vec!["yb-ord-n3", "yb-ord-n2", "yb-ord-n1"]);

        let sorted = sort_masters(&universe.masters(), None);
        assert_eq!(names(&sorted), vec!["yb-ord-n3", "yb-ord-n1", "yb-ord-n2"]);
    }

    #[test]
    fn test_tservers_primary_first_then_zones() {
        let mut universe = UniverseBuilder::new("ord")
            .primary(UserIntent::new(3, 6, "2.20.0"), &["az1", "az2"])
            .read_replica(UserIntent::new(1, 2, "2.20.0"), &["az3"])
            .build();
        // Make az2 the affinitized zone of the primary cluster.
        universe.primary_cluster_mut().unwrap().placement_info.azs[1].is_affinitized = true;

        let sorted = sort_tservers(&universe, &universe.tservers());
        // az2 holds n2, n4, n6; az1 holds n1, n3, n5; read replica last.
        assert_eq!(
            names(&sorted),
            vec![
                "yb-ord-n2", "yb-ord-n4", "yb-ord-n6", "yb-ord-n1", "yb-ord-n3", "yb-ord-n5",
                "yb-ord-n7", "yb-ord-n8",
            ]
        );
    }

    #[test]
    fn test_zone_with_fewer_nodes_first() {
        let universe = UniverseBuilder::new("ord")
            .primary(UserIntent::new(3, 5, "2.20.0"), &["az1", "az2", "az3"])
            .build();
        // az1: n1, n4; az2: n2, n5; az3: n3.
        let sorted = sort_tservers(&universe, &universe.tservers());
        assert_eq!(
            names(&sorted),
            vec!["yb-ord-n3", "yb-ord-n1", "yb-ord-n4", "yb-ord-n2", "yb-ord-n5"]
        );
    }
}
