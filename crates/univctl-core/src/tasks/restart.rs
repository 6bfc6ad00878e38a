// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process restart.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{PlanContext, UniverseTask};
use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, ServerType, Universe};
use crate::queue::SubTaskQueue;
use crate::subtask::SubTask;
use crate::task_types::TaskType;
use crate::upgrade::{MastersAndTservers, UpgradeContext, UpgradeOption, UpgradeOrchestrator};

/// Parameters of a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartParams {
    /// Rolling or non-rolling.
    pub upgrade_option: UpgradeOption,
}

/// Stops and starts every process without changing anything else.
pub struct RestartUniverse {
    params: RestartParams,
}

impl RestartUniverse {
    /// Task for the given parameters.
    pub fn new(params: RestartParams) -> Self {
        Self { params }
    }
}

fn no_action(_nodes: &[NodeDetails], _types: &BTreeSet<ServerType>) -> Vec<SubTask> {
    Vec::new()
}

impl UniverseTask for RestartUniverse {
    fn task_type(&self) -> TaskType {
        TaskType::RestartUniverse
    }

    fn validate(&self, _universe: &Universe, _is_first_try: bool) -> Result<()> {
        if self.params.upgrade_option == UpgradeOption::NonRestartUpgrade {
            return Err(CoreError::validation(
                "upgrade_option",
                "a restart cannot skip restarting",
            ));
        }
        Ok(())
    }

    fn build_plan(&self, plan: &PlanContext<'_>) -> Result<SubTaskQueue> {
        let mut queue = SubTaskQueue::new();
        UpgradeOrchestrator::new(plan.universe, plan.policy, plan.master_leader.clone())
            .create_upgrade_task_flow(
                &mut queue,
                &no_action,
                &MastersAndTservers::all(plan.universe),
                &UpgradeContext::default(),
                self.params.upgrade_option,
            );
        Ok(queue)
    }
}
