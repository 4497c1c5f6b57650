//! Owns every node-status transition and its derived consequences.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use tracing::{info, warn};

use crate::events::OrchestratorEvent;
use crate::types::{NodeId, NodeStatus, Plan, PlanStatus};

/// State updates bundled with a transition (commit SHAs, errors, etc.).
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdates {
    pub error: Option<String>,
    pub pid: Option<u32>,
    pub base_commit: Option<String>,
    pub completed_commit: Option<String>,
    pub worktree_path: Option<std::path::PathBuf>,
}

/// Single source of truth for per-node execution state within a [`Plan`].
///
/// Owns the plan by mutable reference for the duration of each call; callers
/// (the pump) are responsible for ensuring only one task mutates a given
/// plan's state at a time.
pub struct StateMachine<'a> {
    plan: &'a mut Plan,
}

impl<'a> StateMachine<'a> {
    pub fn new(plan: &'a mut Plan) -> Self {
        Self { plan }
    }

    /// Read-only access to the underlying plan, for callers (the scheduler)
    /// that need to inspect topology without a separate, conflicting borrow
    /// of the same `Plan` this state machine already holds mutably.
    pub fn plan(&self) -> &Plan {
        self.plan
    }

    pub fn node_status(&self, id: NodeId) -> Option<NodeStatus> {
        self.plan.status_of(id)
    }

    pub fn are_dependencies_met(&self, id: NodeId) -> bool {
        let Some(node) = self.plan.node(id) else {
            return false;
        };
        node.dependencies
            .iter()
            .all(|d| self.plan.status_of(*d) == Some(NodeStatus::Succeeded))
    }

    pub fn has_dependency_failed(&self, id: NodeId) -> bool {
        let Some(node) = self.plan.node(id) else {
            return false;
        };
        node.dependencies.iter().any(|d| {
            matches!(
                self.plan.status_of(*d),
                Some(NodeStatus::Failed) | Some(NodeStatus::Blocked)
            )
        })
    }

    /// Attempts `nodeId -> newStatus`. Returns the emitted events on success,
    /// or an empty vec (with a warn-level log) if the transition is illegal.
    pub fn transition(
        &mut self,
        node_id: NodeId,
        new_status: NodeStatus,
        updates: TransitionUpdates,
    ) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        let Some(current) = self.plan.status_of(node_id) else {
            warn!(node_id = %node_id, "transition requested for unknown node");
            return events;
        };

        if !current.can_transition_to(new_status) {
            warn!(node_id = %node_id, ?current, ?new_status, "rejected invalid transition");
            return events;
        }

        let plan_id = self.plan.id;
        let now = Utc::now();
        let state = self
            .plan
            .node_states
            .get_mut(&node_id)
            .expect("status lookup above guarantees presence");

        state.status = new_status;
        if let Some(err) = updates.error {
            state.error = Some(err);
        }
        if updates.pid.is_some() {
            state.pid = updates.pid;
        }
        if let Some(base) = updates.base_commit {
            state.base_commit = Some(base);
        }
        if new_status == NodeStatus::Succeeded {
            if let Some(commit) = updates.completed_commit {
                state.completed_commit = Some(commit);
            }
        }
        if let Some(wt) = updates.worktree_path {
            state.worktree_path = Some(wt);
        }

        match new_status {
            NodeStatus::Scheduled if state.scheduled_at.is_none() => state.scheduled_at = Some(now),
            NodeStatus::Running if state.started_at.is_none() => state.started_at = Some(now),
            _ => {}
        }
        if new_status.is_terminal() && state.ended_at.is_none() {
            state.ended_at = Some(now);
        }
        state.version += 1;
        self.plan.state_version += 1;

        info!(plan_id = %plan_id, node_id = %node_id, ?current, ?new_status, "node transition");
        events.push(OrchestratorEvent::NodeTransition {
            plan_id,
            node_id,
            from: current,
            to: new_status,
            timestamp: now,
        });
        if new_status == NodeStatus::Running {
            events.push(OrchestratorEvent::NodeStarted { plan_id, node_id });
        }

        match new_status {
            NodeStatus::Succeeded => {
                events.push(OrchestratorEvent::NodeCompleted {
                    plan_id,
                    node_id,
                    success: true,
                });
                events.extend(self.propagate_ready(node_id));
            }
            NodeStatus::Failed => {
                events.push(OrchestratorEvent::NodeCompleted {
                    plan_id,
                    node_id,
                    success: false,
                });
                events.extend(self.propagate_blocked(node_id));
            }
            _ => {}
        }

        if new_status.is_terminal() {
            let status = self.compute_plan_status();
            if !matches!(status, PlanStatus::Pending | PlanStatus::Running) {
                events.push(OrchestratorEvent::PlanCompleted {
                    plan: Box::new(self.plan.clone()),
                    status,
                });
            }
        }

        events
    }

    fn propagate_ready(&mut self, succeeded: NodeId) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        let dependents = self
            .plan
            .node(succeeded)
            .map(|n| n.dependents.clone())
            .unwrap_or_default();
        for dependent in dependents {
            if self.plan.status_of(dependent) != Some(NodeStatus::Pending) {
                continue;
            }
            if self.are_dependencies_met(dependent) {
                events.extend(self.transition(dependent, NodeStatus::Ready, TransitionUpdates::default()));
            }
        }
        events
    }

    fn propagate_blocked(&mut self, failed: NodeId) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        let failed_name = self
            .plan
            .node(failed)
            .map(|n| n.name.clone())
            .unwrap_or_default();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = self
            .plan
            .node(failed)
            .map(|n| n.dependents.clone().into())
            .unwrap_or_default();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(status) = self.plan.status_of(id) {
                if !status.is_terminal() {
                    let updates = TransitionUpdates {
                        error: Some(format!("Blocked: dependency '{failed_name}' failed")),
                        ..Default::default()
                    };
                    events.extend(self.transition(id, NodeStatus::Blocked, updates));
                }
            }
            if let Some(node) = self.plan.node(id) {
                queue.extend(node.dependents.iter().copied());
            }
        }
        events
    }

    /// Derives the plan-level status from the multiset of node statuses.
    pub fn compute_plan_status(&self) -> PlanStatus {
        let counts = self.status_counts();
        let any = |s: NodeStatus| counts.get(&s).copied().unwrap_or(0) > 0;
        let total: usize = counts.values().sum();
        let terminal: usize = [
            NodeStatus::Succeeded,
            NodeStatus::Failed,
            NodeStatus::Blocked,
            NodeStatus::Canceled,
        ]
        .iter()
        .map(|s| counts.get(s).copied().unwrap_or(0))
        .sum();

        if any(NodeStatus::Running) || any(NodeStatus::Scheduled) {
            return PlanStatus::Running;
        }
        let non_terminal_remaining = total > terminal;
        if non_terminal_remaining && (any(NodeStatus::Ready) || any(NodeStatus::Pending)) {
            return if self.plan.started_at.is_some() {
                PlanStatus::Running
            } else {
                PlanStatus::Pending
            };
        }
        if self.plan.is_paused && non_terminal_remaining {
            return PlanStatus::Paused;
        }
        if any(NodeStatus::Canceled) {
            return PlanStatus::Canceled;
        }
        if any(NodeStatus::Failed) && any(NodeStatus::Succeeded) {
            return PlanStatus::Partial;
        }
        let all_blocked = total > 0 && counts.get(&NodeStatus::Blocked).copied().unwrap_or(0) == total;
        if any(NodeStatus::Failed) || all_blocked {
            return PlanStatus::Failed;
        }
        if any(NodeStatus::Succeeded) {
            return PlanStatus::Succeeded;
        }
        PlanStatus::Pending
    }

    pub fn status_counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for state in self.plan.node_states.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.plan
            .node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Ready)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Ordered sequence of `completedCommit` values of `node`'s dependencies,
    /// skipping any without one. The first becomes the branch point for the
    /// job's worktree; the remainder are forward-integrated.
    pub fn base_commits_for_node(&self, node_id: NodeId) -> Vec<String> {
        let Some(node) = self.plan.node(node_id) else {
            return Vec::new();
        };
        node.dependencies
            .iter()
            .filter_map(|d| self.plan.state(*d).and_then(|s| s.completed_commit.clone()))
            .collect()
    }

    /// Re-runs blocked-propagation for every node the persistence layer
    /// normalized from `running` to `failed` on load. `transition()`
    /// can't be replayed for these (they're already terminal), so this walks
    /// their dependents directly.
    pub fn recover_from_crash(&mut self) -> Vec<OrchestratorEvent> {
        let crashed: Vec<NodeId> = self
            .plan
            .node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Failed && s.error.as_deref() == Some("crashed before restart"))
            .map(|(id, _)| *id)
            .collect();
        let mut events = Vec::new();
        for id in crashed {
            events.extend(self.propagate_blocked(id));
        }
        events
    }

    /// Cancels every non-terminal node in the plan.
    pub fn cancel_all(&mut self) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        let ids: Vec<NodeId> = self
            .plan
            .node_states
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            events.extend(self.transition(id, NodeStatus::Canceled, TransitionUpdates::default()));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_plan;
    use crate::types::{JobNodeSpec, PlanSpec};
    use std::path::PathBuf;

    fn job(producer_id: &str, deps: &[&str]) -> JobNodeSpec {
        JobNodeSpec {
            producer_id: producer_id.to_string(),
            name: producer_id.to_string(),
            task: String::new(),
            work: None,
            prechecks: None,
            postchecks: None,
            instructions: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            base_branch: None,
            expects_no_changes: false,
        }
    }

    fn linear_plan() -> Plan {
        build_plan(
            PlanSpec {
                name: "t".into(),
                repo_path: None,
                base_branch: "main".into(),
                target_branch: None,
                max_parallel: 4,
                clean_up_successful_work: true,
                jobs: vec![job("a", &[]), job("b", &["a"]), job("c", &["b"])],
                sub_plans: vec![],
            },
            &PathBuf::from("/repo"),
        )
        .unwrap()
    }

    #[test]
    fn succeeded_propagates_readiness_to_dependents() {
        let mut plan = linear_plan();
        let a = plan.producer_id_to_node_id["a"];
        let b = plan.producer_id_to_node_id["b"];
        let mut sm = StateMachine::new(&mut plan);
        sm.transition(a, NodeStatus::Scheduled, Default::default());
        sm.transition(a, NodeStatus::Running, Default::default());
        sm.transition(a, NodeStatus::Succeeded, Default::default());
        assert_eq!(sm.node_status(b), Some(NodeStatus::Ready));
    }

    #[test]
    fn failed_propagates_blocked_to_transitive_dependents() {
        let mut plan = linear_plan();
        let a = plan.producer_id_to_node_id["a"];
        let b = plan.producer_id_to_node_id["b"];
        let c = plan.producer_id_to_node_id["c"];
        let mut sm = StateMachine::new(&mut plan);
        sm.transition(a, NodeStatus::Scheduled, Default::default());
        sm.transition(a, NodeStatus::Running, Default::default());
        sm.transition(a, NodeStatus::Failed, Default::default());
        assert_eq!(sm.node_status(b), Some(NodeStatus::Blocked));
        assert_eq!(sm.node_status(c), Some(NodeStatus::Blocked));
    }

    #[test]
    fn invalid_transition_is_rejected_and_logged() {
        let mut plan = linear_plan();
        let a = plan.producer_id_to_node_id["a"];
        let mut sm = StateMachine::new(&mut plan);
        let events = sm.transition(a, NodeStatus::Succeeded, Default::default());
        assert!(events.is_empty());
        assert_eq!(sm.node_status(a), Some(NodeStatus::Ready));
    }

    #[test]
    fn terminal_transition_is_idempotent_on_rejection() {
        let mut plan = linear_plan();
        let a = plan.producer_id_to_node_id["a"];
        let mut sm = StateMachine::new(&mut plan);
        sm.transition(a, NodeStatus::Scheduled, Default::default());
        sm.transition(a, NodeStatus::Running, Default::default());
        sm.transition(a, NodeStatus::Canceled, Default::default());
        let before = sm.node_status(a);
        sm.transition(a, NodeStatus::Canceled, Default::default());
        assert_eq!(sm.node_status(a), before);
    }

    #[test]
    fn diamond_partial_when_one_branch_fails_and_other_succeeds() {
        let plan_spec = PlanSpec {
            name: "diamond".into(),
            repo_path: None,
            base_branch: "main".into(),
            target_branch: None,
            max_parallel: 4,
            clean_up_successful_work: true,
            jobs: vec![
                job("a", &[]),
                job("b", &["a"]),
                job("c", &["a"]),
                job("d", &["b", "c"]),
            ],
            sub_plans: vec![],
        };
        let mut plan = build_plan(plan_spec, &PathBuf::from("/repo")).unwrap();
        let a = plan.producer_id_to_node_id["a"];
        let b = plan.producer_id_to_node_id["b"];
        let c = plan.producer_id_to_node_id["c"];
        let d = plan.producer_id_to_node_id["d"];
        let mut sm = StateMachine::new(&mut plan);
        sm.transition(a, NodeStatus::Scheduled, Default::default());
        sm.transition(a, NodeStatus::Running, Default::default());
        sm.transition(a, NodeStatus::Succeeded, Default::default());
        sm.transition(b, NodeStatus::Scheduled, Default::default());
        sm.transition(b, NodeStatus::Running, Default::default());
        sm.transition(b, NodeStatus::Failed, Default::default());
        sm.transition(c, NodeStatus::Scheduled, Default::default());
        sm.transition(c, NodeStatus::Running, Default::default());
        sm.transition(c, NodeStatus::Succeeded, Default::default());
        assert_eq!(sm.node_status(d), Some(NodeStatus::Blocked));
        assert_eq!(sm.compute_plan_status(), PlanStatus::Partial);
    }
}
