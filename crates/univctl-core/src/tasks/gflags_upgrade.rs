// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server flag changes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{PlanContext, UniverseTask};
use crate::automation::NodeAction;
use crate::error::{CoreError, Result};
use crate::model::{NodeDetails, NodeState, ServerType, Universe, UserIntent};
use crate::queue::{SubTaskGroup, SubTaskGroupType, SubTaskQueue};
use crate::subtask::SubTask;
use crate::task_types::TaskType;
use crate::upgrade::{MastersAndTservers, UpgradeContext, UpgradeOption, UpgradeOrchestrator};

/// Parameters of a flag change. The maps replace the current flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GFlagsUpgradeParams {
    /// New master flags.
    #[serde(default)]
    pub master_gflags: BTreeMap<String, String>,
    /// New tserver flags.
    #[serde(default)]
    pub tserver_gflags: BTreeMap<String, String>,
    /// How the change is applied.
    pub upgrade_option: UpgradeOption,
}

/// Rewrites server configuration, restarting processes unless the change is
/// applied live.
pub struct GFlagsUpgrade {
    params: GFlagsUpgradeParams,
}

impl GFlagsUpgrade {
    /// Task for the given parameters.
    pub fn new(params: GFlagsUpgradeParams) -> Self {
        Self { params }
    }

    /// Which roles get new flags. A retry reapplies both, since the
    /// failed run may have recorded part of the change.
    fn changed_roles(&self, intent: Option<&UserIntent>, is_first_try: bool) -> (bool, bool) {
        match intent {
            Some(intent) if is_first_try => (
                intent.master_gflags != self.params.master_gflags,
                intent.tserver_gflags != self.params.tserver_gflags,
            ),
            _ => (true, true),
        }
    }
}

impl UniverseTask for GFlagsUpgrade {
    fn task_type(&self) -> TaskType {
        TaskType::GFlagsUpgrade
    }

    fn validate(&self, universe: &Universe, is_first_try: bool) -> Result<()> {
        let intent = universe.primary_cluster().map(|c| &c.user_intent);
        if intent.is_none() {
            return Err(CoreError::validation("universe", "no primary cluster"));
        }
        let (masters, tservers) = self.changed_roles(intent, is_first_try);
        if !masters && !tservers {
            return Err(CoreError::validation(
                "gflags",
                "no flags differ from the current configuration",
            ));
        }
        Ok(())
    }

    fn build_plan(&self, plan: &PlanContext<'_>) -> Result<SubTaskQueue> {
        let universe = plan.universe;
        let intent = universe.primary_cluster().map(|c| &c.user_intent);
        let (masters_changed, tservers_changed) =
            self.changed_roles(intent, plan.policy.is_first_try);
        let option = self.params.upgrade_option;
        let live = option == UpgradeOption::NonRestartUpgrade;

        let master_gflags = &self.params.master_gflags;
        let tserver_gflags = &self.params.tserver_gflags;
        let configure = |nodes: &[NodeDetails], types: &BTreeSet<ServerType>| {
            let mut tasks = Vec::new();
            for node in nodes {
                for server in types {
                    let gflags = match server {
                        ServerType::Master => master_gflags,
                        ServerType::TServer => tserver_gflags,
                    };
                    tasks.push(SubTask::NodeCommand {
                        node: node.node_name.clone(),
                        action: NodeAction::Configure(*server),
                        params: json!({ "gflags": gflags, "live": live }),
                    });
                }
            }
            tasks
        };

        let nodes = MastersAndTservers::all(universe).select(masters_changed, tservers_changed);
        let context = UpgradeContext {
            run_before_stopping: true,
            upgrading_state: NodeState::UpdateGFlags,
            group_type: SubTaskGroupType::UpdatingGFlags,
            ..Default::default()
        };

        let mut queue = SubTaskQueue::new();
        UpgradeOrchestrator::new(universe, plan.policy, plan.master_leader.clone())
            .create_upgrade_task_flow(&mut queue, &configure, &nodes, &context, option);

        queue.add_group(SubTaskGroup::single(
            "Record server flags",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::UpdateGFlags {
                master_gflags: masters_changed.then(|| master_gflags.clone()),
                tserver_gflags: tservers_changed.then(|| tserver_gflags.clone()),
            },
        ));
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UniverseBuilder;
    use crate::upgrade::FlowPolicy;

    fn universe() -> Universe {
        let mut universe = UniverseBuilder::new("gf")
            .primary(UserIntent::new(3, 3, "2.20.0"), &["az1", "az2", "az3"])
            .build();
        universe
            .primary_cluster_mut()
            .unwrap()
            .user_intent
            .master_gflags
            .insert("log_dir".to_string(), "/var/log".to_string());
        universe
    }

    fn task(tserver_flag: Option<&str>, option: UpgradeOption) -> GFlagsUpgrade {
        let mut tserver_gflags = BTreeMap::new();
        if let Some(value) = tserver_flag {
            tserver_gflags.insert("ysql_max_connections".to_string(), value.to_string());
        }
        GFlagsUpgrade::new(GFlagsUpgradeParams {
            master_gflags: BTreeMap::from([("log_dir".to_string(), "/var/log".to_string())]),
            tserver_gflags,
            upgrade_option: option,
        })
    }

    fn plan_context(universe: &Universe, is_first_try: bool) -> PlanContext<'_> {
        PlanContext {
            universe,
            policy: FlowPolicy {
                blacklist_leaders: false,
                follower_lag_check: false,
                is_first_try,
            },
            master_leader: None,
        }
    }

    fn configured(queue: &SubTaskQueue) -> Vec<(String, NodeAction)> {
        queue
            .groups()
            .iter()
            .flat_map(|g| g.tasks.iter())
            .filter_map(|t| match t {
                SubTask::NodeCommand {
                    node,
                    action: action @ NodeAction::Configure(_),
                    ..
                } => Some((node.clone(), *action)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_validate_requires_a_change() {
        let universe = universe();
        assert!(task(None, UpgradeOption::RollingUpgrade).validate(&universe, true).is_err());
        assert!(task(None, UpgradeOption::RollingUpgrade).validate(&universe, false).is_ok());
        assert!(
            task(Some("500"), UpgradeOption::RollingUpgrade)
                .validate(&universe, true)
                .is_ok()
        );
    }

    #[test]
    fn test_only_changed_role_is_configured() {
        let universe = universe();
        let queue = task(Some("500"), UpgradeOption::RollingUpgrade)
            .build_plan(&plan_context(&universe, true))
            .unwrap();

        let configured = configured(&queue);
        assert_eq!(configured.len(), 3);
        assert!(
            configured
                .iter()
                .all(|(_, a)| *a == NodeAction::Configure(ServerType::TServer))
        );
        assert_eq!(
            queue.groups().last().unwrap().tasks[0],
            SubTask::UpdateGFlags {
                master_gflags: None,
                tserver_gflags: Some(BTreeMap::from([(
                    "ysql_max_connections".to_string(),
                    "500".to_string()
                )])),
            }
        );
    }

    #[test]
    fn test_retry_reapplies_both_roles() {
        let universe = universe();
        let queue = task(Some("500"), UpgradeOption::NonRollingUpgrade)
            .build_plan(&plan_context(&universe, false))
            .unwrap();
        let configured = configured(&queue);
        assert_eq!(configured.len(), 6);
    }

    #[test]
    fn test_live_change_passes_flag() {
        let universe = universe();
        let queue = task(Some("500"), UpgradeOption::NonRestartUpgrade)
            .build_plan(&plan_context(&universe, true))
            .unwrap();
        let live = queue
            .groups()
            .iter()
            .flat_map(|g| g.tasks.iter())
            .filter_map(|t| match t {
                SubTask::NodeCommand { params, .. } => Some(params["live"].clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(live.len(), 3);
        assert!(live.iter().all(|v| v == true));
    }
}
