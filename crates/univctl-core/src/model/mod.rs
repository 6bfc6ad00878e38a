// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory representation of universes and their nodes.
//!
//! These values are snapshots. The stored universe is only ever changed
//! through the [`UniverseUpdater`](crate::updater::UniverseUpdater).

mod node;
mod universe;

pub use node::{CloudInfo, NodeDetails, NodeState, ServerType};
pub use universe::{
    Cluster, ClusterType, PlacementAz, PlacementInfo, SoftwareUpgradeState, Universe,
    UniverseBuilder, UniverseDetails, UserIntent,
};
