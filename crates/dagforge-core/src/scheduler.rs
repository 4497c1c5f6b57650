//! Stateless node selection: given a plan and its state machine, choose the
//! subset of ready nodes to dispatch under plan-local and global parallelism
//! limits.

use crate::state_machine::StateMachine;
use crate::types::{NodeId, NodeStatus, Plan};

/// Count of nodes in `running`/`scheduled` that are jobs with non-empty
/// `work` — sub-plans and empty-work nodes are coordination nodes and don't
/// consume a parallelism slot.
pub fn current_dag_running(plan: &Plan) -> usize {
    plan.node_states
        .iter()
        .filter(|(_, s)| matches!(s.status, NodeStatus::Running | NodeStatus::Scheduled))
        .filter(|(id, _)| {
            plan.node(**id)
                .map(|n| !n.kind.is_coordination())
                .unwrap_or(false)
        })
        .count()
}

/// Selects the nodes to dispatch this tick. Pure; does not mutate the plan.
///
/// Takes only the state machine (not a separate `&Plan`) because
/// `StateMachine` already holds the plan by mutable reference — a second,
/// independent borrow of the same plan would conflict with it.
pub fn select_nodes(sm: &StateMachine<'_>, global_running_count: usize, global_max_parallel: usize) -> Vec<NodeId> {
    let plan = sm.plan();
    let ready = sm.ready_nodes();
    if ready.is_empty() {
        return Vec::new();
    }

    let dag_running = current_dag_running(plan);
    let plan_capacity = (plan.max_parallel as i64) - (dag_running as i64);
    let global_capacity = (global_max_parallel as i64) - (global_running_count as i64);
    let available = plan_capacity.min(global_capacity);
    if available <= 0 {
        return Vec::new();
    }

    // Stable sort by descending dependent count, input order as tiebreak.
    let mut indexed: Vec<(usize, NodeId)> = ready.into_iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        let da = plan.node(*a).map(|n| n.dependents.len()).unwrap_or(0);
        let db = plan.node(*b).map(|n| n.dependents.len()).unwrap_or(0);
        db.cmp(&da).then(ia.cmp(ib))
    });

    indexed
        .into_iter()
        .take(available as usize)
        .map(|(_, id)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_plan;
    use crate::types::{JobNodeSpec, PlanSpec, WorkSpec};
    use std::path::PathBuf;

    fn job_with_work(producer_id: &str, deps: &[&str]) -> JobNodeSpec {
        JobNodeSpec {
            producer_id: producer_id.to_string(),
            name: producer_id.to_string(),
            task: String::new(),
            work: Some(WorkSpec::Legacy {
                command: "echo hi".to_string(),
            }),
            prechecks: None,
            postchecks: None,
            instructions: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            base_branch: None,
            expects_no_changes: false,
        }
    }

    fn fan_out_plan(max_parallel: u32) -> Plan {
        build_plan(
            PlanSpec {
                name: "t".into(),
                repo_path: None,
                base_branch: "main".into(),
                target_branch: None,
                max_parallel,
                clean_up_successful_work: true,
                jobs: vec![
                    job_with_work("a", &[]),
                    job_with_work("b", &[]),
                    job_with_work("c", &[]),
                ],
                sub_plans: vec![],
            },
            &PathBuf::from("/repo"),
        )
        .unwrap()
    }

    #[test]
    fn respects_plan_local_parallelism_cap() {
        let mut plan = fan_out_plan(2);
        let sm = StateMachine::new(&mut plan);
        let selected = select_nodes(&sm, 0, 100);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn respects_global_parallelism_cap() {
        let mut plan = fan_out_plan(10);
        let sm = StateMachine::new(&mut plan);
        let selected = select_nodes(&sm, 0, 1);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn empty_ready_set_selects_nothing() {
        let mut plan = fan_out_plan(4);
        {
            let mut sm = StateMachine::new(&mut plan);
            for id in sm.ready_nodes() {
                sm.transition(id, NodeStatus::Scheduled, Default::default());
            }
        }
        let sm = StateMachine::new(&mut plan);
        let selected = select_nodes(&sm, 0, 100);
        assert!(selected.is_empty());
    }

    #[test]
    fn selection_is_pure_and_deterministic() {
        let mut plan = fan_out_plan(2);
        let sm = StateMachine::new(&mut plan);
        let first = select_nodes(&sm, 0, 100);
        let second = select_nodes(&sm, 0, 100);
        assert_eq!(first, second);
    }
}
