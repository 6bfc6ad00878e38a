// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database software upgrade.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{PlanContext, UniverseTask};
use crate::automation::NodeAction;
use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, NodeState, ServerType, SoftwareUpgradeState, Universe};
use crate::queue::{SubTaskGroup, SubTaskGroupType, SubTaskQueue};
use crate::subtask::SubTask;
use crate::task_types::TaskType;
use crate::upgrade::{MastersAndTservers, UpgradeContext, UpgradeOption, UpgradeOrchestrator};

/// Parameters of a software upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareUpgradeParams {
    /// Version to install.
    pub target_version: String,
    /// Rolling or non-rolling.
    pub upgrade_option: UpgradeOption,
}

/// Downloads the release everywhere, then installs it node by node (or all
/// at once) while the processes are stopped.
pub struct SoftwareUpgrade {
    params: SoftwareUpgradeParams,
}

impl SoftwareUpgrade {
    /// Task for the given parameters.
    pub fn new(params: SoftwareUpgradeParams) -> Self {
        Self { params }
    }
}

impl UniverseTask for SoftwareUpgrade {
    fn task_type(&self) -> TaskType {
        TaskType::SoftwareUpgrade
    }

    fn validate(&self, universe: &Universe, is_first_try: bool) -> Result<()> {
        let target = self.params.target_version.trim();
        if target.is_empty() {
            return Err(CoreError::validation("target_version", "must not be empty"));
        }
        if self.params.upgrade_option == UpgradeOption::NonRestartUpgrade {
            return Err(CoreError::validation(
                "upgrade_option",
                "software upgrades restart processes",
            ));
        }
        let current = universe
            .primary_cluster()
            .map(|c| c.user_intent.software_version.as_str());
        if is_first_try && current == Some(target) {
            return Err(CoreError::validation(
                "target_version",
                format!("universe already runs {}", target),
            ));
        }
        Ok(())
    }

    fn build_plan(&self, plan: &PlanContext<'_>) -> Result<SubTaskQueue> {
        let universe = plan.universe;
        let version = self.params.target_version.trim().to_string();
        let params = json!({ "version": version });
        let mut queue = SubTaskQueue::new();

        queue.add_group(SubTaskGroup::single(
            "Mark upgrade in progress",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::UpdateSoftwareUpgradeState {
                state: SoftwareUpgradeState::Upgrading,
            },
        ));

        let nodes = MastersAndTservers::all(universe);
        let mut download = SubTaskGroup::new(
            "Download software",
            SubTaskGroupType::DownloadingSoftware,
        );
        let unique: BTreeMap<&str, &NodeDetails> = nodes
            .masters
            .iter()
            .chain(nodes.tservers.iter())
            .map(|n| (n.node_name.as_str(), n))
            .collect();
        for node in unique.values() {
            download.add(SubTask::NodeCommand {
                node: node.node_name.clone(),
                action: NodeAction::Download,
                params: params.clone(),
            });
        }
        queue.add_group(download);

        let params = &params;
        let install = |nodes: &[NodeDetails], types: &BTreeSet<ServerType>| {
            let mut tasks = Vec::new();
            for node in nodes {
                for server in types {
                    for action in [NodeAction::InstallSoftware(*server), NodeAction::Configure(*server)] {
                        tasks.push(SubTask::NodeCommand {
                            node: node.node_name.clone(),
                            action,
                            params: params.clone(),
                        });
                    }
                }
            }
            tasks
        };
        let context = UpgradeContext {
            process_inactive_master: true,
            target_software_version: Some(version.clone()),
            upgrading_state: NodeState::UpgradeSoftware,
            group_type: SubTaskGroupType::InstallingSoftware,
            ..Default::default()
        };
        UpgradeOrchestrator::new(universe, plan.policy, plan.master_leader.clone())
            .create_upgrade_task_flow(
                &mut queue,
                &install,
                &nodes,
                &context,
                self.params.upgrade_option,
            );

        queue.add_group(SubTaskGroup::single(
            "Record software version",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::UpdateSoftwareVersion { version },
        ));
        queue.add_group(SubTaskGroup::single(
            "Mark upgrade complete",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::UpdateSoftwareUpgradeState {
                state: SoftwareUpgradeState::Ready,
            },
        ));
        Ok(queue)
    }
}
