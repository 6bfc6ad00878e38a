// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rolling, non-rolling and non-restart phase builders.

use std::collections::BTreeSet;
use std::slice;

use crate::automation::{NodeAction, QuorumChange};
use crate::model::{NodeDetails, NodeState, ServerType};
use crate::queue::{SubTaskGroup, SubTaskGroupType, SubTaskQueue};
use crate::quorum::leader_blacklist_eligible;
use crate::subtask::SubTask;

use super::{NodeActionFn, Phase, UpgradeContext, UpgradeOrchestrator};

fn names(nodes: &[NodeDetails]) -> Vec<String> {
    nodes.iter().map(|n| n.node_name.clone()).collect()
}

/// Add the per-node task lists as lockstep groups: step `k` of every node
/// runs in one group, so tasks of one node stay ordered and never share a
/// group.
fn add_lockstep(
    queue: &mut SubTaskQueue,
    name: &str,
    group_type: SubTaskGroupType,
    per_node: Vec<Vec<SubTask>>,
) {
    let steps = per_node.iter().map(Vec::len).max().unwrap_or(0);
    let mut per_node: Vec<_> = per_node.into_iter().map(Vec::into_iter).collect();
    for _ in 0..steps {
        let mut group = SubTaskGroup::new(name, group_type);
        for tasks in per_node.iter_mut() {
            if let Some(task) = tasks.next() {
                group.add(task);
            }
        }
        queue.add_group(group);
    }
}

fn for_each_node(
    nodes: &[NodeDetails],
    task: impl Fn(&NodeDetails) -> SubTask,
    name: &str,
    group_type: SubTaskGroupType,
) -> SubTaskGroup {
    let mut group = SubTaskGroup::new(name, group_type);
    for node in nodes {
        group.add(task(node));
    }
    group
}

fn settle_server(process_types: &BTreeSet<ServerType>) -> ServerType {
    if process_types.contains(&ServerType::Master) {
        ServerType::Master
    } else {
        ServerType::TServer
    }
}

impl UpgradeOrchestrator<'_> {
    /// One node at a time, draining leaders first where possible.
    pub(super) fn rolling_phase(
        &self,
        queue: &mut SubTaskQueue,
        action: NodeActionFn<'_>,
        phase: &Phase,
        context: &UpgradeContext,
    ) {
        let process_types = &phase.process_types;
        let has_tserver = process_types.contains(&ServerType::TServer);
        let blacklist = has_tserver && self.policy.blacklist_leaders;
        let eligible: Vec<String> = phase
            .nodes
            .iter()
            .filter(|n| leader_blacklist_eligible(self.universe, n))
            .map(|n| n.node_name.clone())
            .collect();

        let mut load_balancer_off = false;
        if has_tserver && !self.policy.blacklist_leaders {
            queue.add_group(SubTaskGroup::single(
                "Disable load balancer",
                SubTaskGroupType::RebalancingLoad,
                SubTask::LoadBalancerStateChange { enable: false },
            ));
            load_balancer_off = true;
        } else if blacklist && !eligible.is_empty() {
            // Entries left behind by an earlier failed run.
            queue.add_group(SubTaskGroup::single(
                "Clear leader blacklist",
                SubTaskGroupType::RebalancingLoad,
                SubTask::ModifyLeaderBlacklist {
                    add: Vec::new(),
                    remove: eligible.clone(),
                },
            ));
        }

        for node in &phase.nodes {
            let name = &node.node_name;
            let single = slice::from_ref(node);
            let drain = blacklist && eligible.contains(name);

            queue.add_group(SubTaskGroup::single(
                format!("Set {} to {}", name, context.upgrading_state),
                SubTaskGroupType::ConfigureUniverse,
                SubTask::set_state(single, context.upgrading_state),
            ));
            queue.add_group(SubTaskGroup::single(
                format!("Pre-upgrade hook {}", name),
                context.group_type,
                SubTask::command(node, NodeAction::PreUpgradeHook),
            ));
            if context.run_before_stopping {
                queue.add_sequential(
                    &format!("Apply change {}", name),
                    context.group_type,
                    action(single, process_types),
                );
            }

            if drain {
                queue.add_group(SubTaskGroup::single(
                    format!("Blacklist leaders {}", name),
                    SubTaskGroupType::RebalancingLoad,
                    SubTask::ModifyLeaderBlacklist {
                        add: vec![name.clone()],
                        remove: Vec::new(),
                    },
                ));
                queue.add_group(SubTaskGroup::single(
                    format!("Wait for leaders to move off {}", name),
                    SubTaskGroupType::RebalancingLoad,
                    SubTask::WaitForLeaderBlacklistCompletion {
                        nodes: vec![name.clone()],
                    },
                ));
            }

            for server in process_types {
                queue.add_group(SubTaskGroup::single(
                    format!("Stop {} {}", server, name),
                    SubTaskGroupType::StoppingNodeProcesses,
                    SubTask::command(node, NodeAction::Stop(*server)),
                ));
                if *server == ServerType::Master
                    && context.reconfigure_master
                    && phase.active_role
                    && node.is_master
                {
                    queue.add_group(SubTaskGroup::single(
                        format!("Remove master {} from quorum", name),
                        SubTaskGroupType::StoppingNodeProcesses,
                        SubTask::ChangeMasterConfig {
                            node: name.clone(),
                            change: QuorumChange::Remove,
                        },
                    ));
                }
            }

            if !context.run_before_stopping {
                queue.add_sequential(
                    &format!("Apply change {}", name),
                    context.group_type,
                    action(single, process_types),
                );
            }

            if phase.active_role {
                for server in process_types {
                    self.start_and_wait(queue, node, *server, context);
                }
            }

            if drain {
                queue.add_group(SubTaskGroup::single(
                    format!("Clear leader blacklist {}", name),
                    SubTaskGroupType::RebalancingLoad,
                    SubTask::ModifyLeaderBlacklist {
                        add: Vec::new(),
                        remove: vec![name.clone()],
                    },
                ));
            }
            if has_tserver && phase.active_role && self.policy.follower_lag_check {
                queue.add_group(SubTaskGroup::single(
                    format!("Check follower lag {}", name),
                    SubTaskGroupType::WaitingForServers,
                    SubTask::CheckFollowerLag { node: name.clone() },
                ));
            }
            if let Some(post_action) = &context.post_action {
                queue.add_sequential(
                    &format!("Post-action {}", name),
                    context.group_type,
                    post_action(node),
                );
            }
            queue.add_group(SubTaskGroup::single(
                format!("Post-upgrade hook {}", name),
                context.group_type,
                SubTask::command(node, NodeAction::PostUpgradeHook),
            ));
            queue.add_group(SubTaskGroup::single(
                format!("Set {} to Live", name),
                SubTaskGroupType::ConfigureUniverse,
                SubTask::set_state(single, NodeState::Live),
            ));
            if phase.active_role {
                queue.add_group(SubTaskGroup::single(
                    format!("Settle after restart {}", name),
                    SubTaskGroupType::WaitingForServers,
                    SubTask::SleepAfterStartup {
                        server: settle_server(process_types),
                    },
                ));
            }
        }

        if load_balancer_off {
            queue.add_group(SubTaskGroup::single(
                "Enable load balancer",
                SubTaskGroupType::RebalancingLoad,
                SubTask::LoadBalancerStateChange { enable: true },
            ));
        }
    }

    fn start_and_wait(
        &self,
        queue: &mut SubTaskQueue,
        node: &NodeDetails,
        server: ServerType,
        context: &UpgradeContext,
    ) {
        let name = &node.node_name;
        queue.add_group(SubTaskGroup::single(
            format!("Start {} {}", server, name),
            SubTaskGroupType::StartingNodeProcesses,
            SubTask::command(node, NodeAction::Start(server)),
        ));
        queue.add_group(SubTaskGroup::single(
            format!("Wait for {} {}", server, name),
            SubTaskGroupType::WaitingForServers,
            SubTask::WaitForServer {
                node: name.clone(),
                server,
            },
        ));
        if server == ServerType::Master && context.reconfigure_master && node.is_master {
            queue.add_group(SubTaskGroup::single(
                format!("Add master {} to quorum", name),
                SubTaskGroupType::StartingNodeProcesses,
                SubTask::ChangeMasterConfig {
                    node: name.clone(),
                    change: QuorumChange::Add,
                },
            ));
        }
        queue.add_group(SubTaskGroup::single(
            format!("Wait for {} {} ready", server, name),
            SubTaskGroupType::WaitingForServers,
            SubTask::WaitForServerReady {
                node: name.clone(),
                server,
            },
        ));
    }

    /// All nodes at once: stop everything, apply, start everything.
    pub(super) fn non_rolling_phase(
        &self,
        queue: &mut SubTaskQueue,
        action: NodeActionFn<'_>,
        phase: &Phase,
        context: &UpgradeContext,
    ) {
        let nodes = &phase.nodes;
        let process_types = &phase.process_types;
        let apply = |queue: &mut SubTaskQueue| {
            let per_node = nodes
                .iter()
                .map(|n| action(slice::from_ref(n), process_types))
                .collect();
            add_lockstep(queue, "Apply change", context.group_type, per_node);
        };

        queue.add_group(SubTaskGroup::single(
            format!("Set nodes to {}", context.upgrading_state),
            SubTaskGroupType::ConfigureUniverse,
            SubTask::set_state(nodes, context.upgrading_state),
        ));
        if context.run_before_stopping {
            apply(&mut *queue);
        }
        for server in process_types {
            queue.add_group(for_each_node(
                nodes,
                |n| SubTask::command(n, NodeAction::Stop(*server)),
                &format!("Stop {} on all nodes", server),
                SubTaskGroupType::StoppingNodeProcesses,
            ));
        }
        if !context.run_before_stopping {
            apply(&mut *queue);
        }
        if phase.active_role {
            for server in process_types {
                queue.add_group(for_each_node(
                    nodes,
                    |n| SubTask::command(n, NodeAction::Start(*server)),
                    &format!("Start {} on all nodes", server),
                    SubTaskGroupType::StartingNodeProcesses,
                ));
                queue.add_group(for_each_node(
                    nodes,
                    |n| SubTask::WaitForServer {
                        node: n.node_name.clone(),
                        server: *server,
                    },
                    &format!("Wait for {} on all nodes", server),
                    SubTaskGroupType::WaitingForServers,
                ));
                queue.add_group(for_each_node(
                    nodes,
                    |n| SubTask::WaitForServerReady {
                        node: n.node_name.clone(),
                        server: *server,
                    },
                    &format!("Wait for {} ready on all nodes", server),
                    SubTaskGroupType::WaitingForServers,
                ));
            }
        }
        self.post_actions(queue, nodes, context);
        queue.add_group(SubTaskGroup::single(
            "Set nodes to Live",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::SetNodeState {
                nodes: names(nodes),
                state: NodeState::Live,
            },
        ));
    }

    /// Apply the change to running processes.
    pub(super) fn non_restart_phase(
        &self,
        queue: &mut SubTaskQueue,
        action: NodeActionFn<'_>,
        phase: &Phase,
        context: &UpgradeContext,
    ) {
        let nodes = &phase.nodes;
        queue.add_group(SubTaskGroup::single(
            format!("Set nodes to {}", context.upgrading_state),
            SubTaskGroupType::ConfigureUniverse,
            SubTask::set_state(nodes, context.upgrading_state),
        ));
        let per_node = nodes
            .iter()
            .map(|n| action(slice::from_ref(n), &phase.process_types))
            .collect();
        add_lockstep(queue, "Apply change", context.group_type, per_node);
        self.post_actions(queue, nodes, context);
        queue.add_group(SubTaskGroup::single(
            "Set nodes to Live",
            SubTaskGroupType::ConfigureUniverse,
            SubTask::set_state(nodes, NodeState::Live),
        ));
    }

    fn post_actions(&self, queue: &mut SubTaskQueue, nodes: &[NodeDetails], context: &UpgradeContext) {
        if let Some(post_action) = &context.post_action {
            let per_node = nodes.iter().map(|n| post_action(n)).collect();
            add_lockstep(queue, "Post-action", context.group_type, per_node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::*;
    use crate::model::{Universe, UniverseBuilder, UserIntent};

    fn universe(rf: u32, nodes: u32) -> Universe {
        UniverseBuilder::new("flow")
            .primary(UserIntent::new(rf, nodes, "2.20.0"), &["az1", "az2", "az3"])
            .build()
    }

    fn policy(blacklist_leaders: bool) -> FlowPolicy {
        FlowPolicy {
            blacklist_leaders,
            follower_lag_check: false,
            is_first_try: true,
        }
    }

    fn configure(nodes: &[NodeDetails], types: &BTreeSet<ServerType>) -> Vec<SubTask> {
        nodes
            .iter()
            .flat_map(|n| {
                types
                    .iter()
                    .map(|t| SubTask::command(n, NodeAction::Configure(*t)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn build(
        universe: &Universe,
        policy: FlowPolicy,
        nodes: MastersAndTservers,
        context: &UpgradeContext,
        option: UpgradeOption,
    ) -> SubTaskQueue {
        let mut queue = SubTaskQueue::new();
        UpgradeOrchestrator::new(universe, policy, Some("yb-flow-n1".to_string()))
            .create_upgrade_task_flow(&mut queue, &configure, &nodes, context, option);
        queue
    }

    /// Flattened `(node, action)` for node commands, and markers for the
    /// other subtasks of interest.
    fn steps(queue: &SubTaskQueue) -> Vec<String> {
        queue
            .groups()
            .iter()
            .flat_map(|g| g.tasks.iter())
            .filter_map(|t| match t {
                SubTask::NodeCommand { node, action, .. } => Some(format!("{} {}", action, node)),
                SubTask::SetNodeState { nodes, state } => {
                    Some(format!("state {} {}", state, nodes.join(",")))
                }
                SubTask::ModifyLeaderBlacklist { add, .. } if !add.is_empty() => {
                    Some(format!("blacklist {}", add.join(",")))
                }
                SubTask::ModifyLeaderBlacklist { remove, .. } => {
                    Some(format!("unblacklist {}", remove.join(",")))
                }
                SubTask::WaitForLeaderBlacklistCompletion { nodes } => {
                    Some(format!("drain {}", nodes.join(",")))
                }
                SubTask::LoadBalancerStateChange { enable } => Some(format!("lb {}", enable)),
                SubTask::ChangeMasterConfig { node, change } => {
                    Some(format!("quorum {:?} {}", change, node))
                }
                SubTask::WaitForServer { node, server } => Some(format!("wait {} {}", server, node)),
                SubTask::WaitForServerReady { node, server } => {
                    Some(format!("ready {} {}", server, node))
                }
                _ => None,
            })
            .collect()
    }

    fn position(steps: &[String], step: &str) -> usize {
        steps
            .iter()
            .position(|s| s == step)
            .unwrap_or_else(|| panic!("missing step {step}"))
    }

    #[test]
    fn test_rolling_tserver_cycle_per_node() {
        let u = universe(3, 3);
        let nodes = MastersAndTservers::all(&u).select(false, true);
        let context = UpgradeContext {
            run_before_stopping: true,
            upgrading_state: NodeState::UpdateGFlags,
            ..Default::default()
        };
        let queue = build(&u, policy(true), nodes, &context, UpgradeOption::RollingUpgrade);
        let steps = steps(&queue);

        let mut last_live = 0;
        for n in ["yb-flow-n1", "yb-flow-n2", "yb-flow-n3"] {
            let upgrading = position(&steps, &format!("state UpdateGFlags {}", n));
            let blacklist = position(&steps, &format!("blacklist {}", n));
            let drain = position(&steps, &format!("drain {}", n));
            let stop = position(&steps, &format!("stop-tserver {}", n));
            let start = position(&steps, &format!("start-tserver {}", n));
            let ready = position(&steps, &format!("ready tserver {}", n));
            let unblacklist = position(&steps, &format!("unblacklist {}", n));
            let live = position(&steps, &format!("state Live {}", n));
            assert!(last_live < upgrading);
            assert!(upgrading < blacklist && blacklist < drain && drain < stop);
            assert!(stop < start && start < ready && ready < unblacklist && unblacklist < live);
            last_live = live;
        }
        // Stale entries are cleared once before the first node.
        assert_eq!(steps[0], "unblacklist yb-flow-n1,yb-flow-n2,yb-flow-n3");
        assert!(!steps.iter().any(|s| s.starts_with("lb ")));
    }

    #[test]
    fn test_rolling_without_blacklisting_toggles_load_balancer() {
        let u = universe(3, 3);
        let nodes = MastersAndTservers::all(&u).select(false, true);
        let queue = build(
            &u,
            policy(false),
            nodes,
            &UpgradeContext::default(),
            UpgradeOption::RollingUpgrade,
        );
        let steps = steps(&queue);

        assert_eq!(steps.first().map(String::as_str), Some("lb false"));
        assert_eq!(steps.last().map(String::as_str), Some("lb true"));
        assert_eq!(steps.iter().filter(|s| s.starts_with("lb ")).count(), 2);
        assert!(!steps.iter().any(|s| s.contains("blacklist")));
    }

    #[test]
    fn test_rolling_rf1_never_blacklists() {
        let u = universe(1, 3);
        let nodes = MastersAndTservers::all(&u).select(false, true);
        let queue = build(
            &u,
            policy(true),
            nodes,
            &UpgradeContext::default(),
            UpgradeOption::RollingUpgrade,
        );
        let steps = steps(&queue);
        assert!(!steps.iter().any(|s| s.contains("blacklist") || s.starts_with("drain")));
        assert!(!steps.iter().any(|s| s.starts_with("lb ")));
    }

    #[test]
    fn test_rolling_masters_reconfigure_quorum() {
        let u = universe(3, 3);
        let nodes = MastersAndTservers::all(&u).select(true, false);
        let context = UpgradeContext {
            reconfigure_master: true,
            ..Default::default()
        };
        let queue = build(&u, policy(true), nodes, &context, UpgradeOption::RollingUpgrade);
        let steps = steps(&queue);

        // Leader last.
        let first_stop = steps.iter().position(|s| s.starts_with("stop-master")).unwrap();
        assert_eq!(steps[first_stop], "stop-master yb-flow-n2");
        let leader_stop = position(&steps, "stop-master yb-flow-n1");
        assert!(leader_stop > position(&steps, "state Live yb-flow-n3"));

        let stop = position(&steps, "stop-master yb-flow-n2");
        let remove = position(&steps, "quorum Remove yb-flow-n2");
        let start = position(&steps, "start-master yb-flow-n2");
        let wait = position(&steps, "wait master yb-flow-n2");
        let add = position(&steps, "quorum Add yb-flow-n2");
        let ready = position(&steps, "ready master yb-flow-n2");
        assert!(stop < remove && remove < start && start < wait && wait < add && add < ready);
    }

    #[test]
    fn test_non_rolling_stops_all_before_starting() {
        let u = universe(1, 3);
        let nodes = MastersAndTservers::all(&u).select(false, true);
        let queue = build(
            &u,
            policy(true),
            nodes,
            &UpgradeContext::default(),
            UpgradeOption::NonRollingUpgrade,
        );
        let steps = steps(&queue);

        let last_stop = steps.iter().rposition(|s| s.starts_with("stop-")).unwrap();
        let first_start = steps.iter().position(|s| s.starts_with("start-")).unwrap();
        assert!(last_stop < first_start);
        assert_eq!(steps.iter().filter(|s| s.starts_with("stop-")).count(), 3);
        assert!(!steps.iter().any(|s| s.contains("blacklist")));

        // One group stops every node in parallel.
        let stop_group = queue
            .groups()
            .iter()
            .find(|g| g.group_type == SubTaskGroupType::StoppingNodeProcesses)
            .unwrap();
        assert_eq!(stop_group.tasks.len(), 3);
    }

    #[test]
    fn test_non_restart_never_stops() {
        let u = universe(3, 3);
        let nodes = MastersAndTservers::all(&u);
        let context = UpgradeContext {
            process_inactive_master: true,
            ..Default::default()
        };
        let queue = build(&u, policy(true), nodes, &context, UpgradeOption::NonRestartUpgrade);
        let steps = steps(&queue);

        assert!(!steps.iter().any(|s| s.starts_with("stop-") || s.starts_with("start-")));
        assert_eq!(
            steps.iter().filter(|s| s.starts_with("configure-")).count(),
            6
        );
    }

    #[test]
    fn test_phase_order_and_inactive_masters() {
        let u = universe(3, 4);
        let nodes = MastersAndTservers::all(&u);
        let context = UpgradeContext {
            process_inactive_master: true,
            process_tservers_first: true,
            ..Default::default()
        };
        let queue = build(&u, policy(true), nodes, &context, UpgradeOption::RollingUpgrade);
        let steps = steps(&queue);

        // n4 is a tserver only: its master process is configured but never
        // started.
        let inactive = position(&steps, "configure-master yb-flow-n4");
        assert!(!steps.contains(&"start-master yb-flow-n4".to_string()));
        let first_tserver = steps.iter().position(|s| s.starts_with("stop-tserver")).unwrap();
        let first_master_start = steps.iter().position(|s| s.starts_with("start-master")).unwrap();
        assert!(inactive < first_tserver);
        assert!(first_tserver < first_master_start);
    }

    #[test]
    fn test_rolling_takes_stopped_node_first() {
        let mut u = universe(3, 3);
        u.node_mut("yb-flow-n2").unwrap().state = NodeState::Stopped;
        let queue = build(
            &u,
            policy(true),
            MastersAndTservers::all(&u),
            &UpgradeContext::default(),
            UpgradeOption::RollingUpgrade,
        );

        let steps = steps(&queue);
        assert_eq!(steps[0], "state Stopping yb-flow-n2".to_string());
        assert!(
            position(&steps, "stop-master yb-flow-n2")
                < position(&steps, "stop-master yb-flow-n3")
        );
    }
}
