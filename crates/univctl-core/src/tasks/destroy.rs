// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Universe teardown.

use super::{PlanContext, UniverseTask};
use crate::automation::NodeAction;
use crate::error::Result;
use crate::model::Universe;
use crate::queue::{SubTaskGroup, SubTaskGroupType, SubTaskQueue};
use crate::subtask::SubTask;
use crate::task_types::TaskType;

/// Releases every instance and deletes the universe record. Allowed while a
/// topology change is pending.
pub struct DestroyUniverse;

impl UniverseTask for DestroyUniverse {
    fn task_type(&self) -> TaskType {
        TaskType::DestroyUniverse
    }

    fn validate(&self, _universe: &Universe, _is_first_try: bool) -> Result<()> {
        Ok(())
    }

    fn build_plan(&self, plan: &PlanContext<'_>) -> Result<SubTaskQueue> {
        let mut queue = SubTaskQueue::new();
        let mut destroy = SubTaskGroup::new("Destroy nodes", SubTaskGroupType::DeletingNodes);
        for node in plan
            .universe
            .details
            .node_details_set
            .iter()
            .filter(|n| !n.state.is_gone())
        {
            destroy.add(SubTask::command(node, NodeAction::Destroy));
        }
        queue.add_group(destroy);
        queue.add_group(SubTaskGroup::single(
            "Delete universe",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::DeleteUniverse,
        ));
        Ok(queue)
    }
}
