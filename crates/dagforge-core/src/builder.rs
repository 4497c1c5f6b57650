//! Validates a [`PlanSpec`] and turns it into an immutable [`Plan`] topology.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::Utc;

use crate::error::OrchestratorError;
use crate::types::{
    JobNode, Node, NodeExecutionState, NodeId, NodeKind, NodeStatus, Plan, PlanId, PlanSpec,
    SubPlanNode, SubPlanNodeSpec, WorkSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    Visiting,
    Visited,
}

/// Build an immutable plan topology from a [`PlanSpec`], or an aggregated
/// [`OrchestratorError::Validation`] carrying every issue found.
pub fn build_plan(spec: PlanSpec, default_repo_path: &PathBuf) -> Result<Plan, OrchestratorError> {
    let mut errors = Vec::new();
    let mut producer_id_to_node_id: HashMap<String, NodeId> = HashMap::new();
    let mut seen_producer_ids: HashSet<String> = HashSet::new();
    let mut nodes: HashMap<NodeId, Node> = HashMap::new();

    // Pass 1: allocate node IDs, reject missing/duplicate producer IDs.
    for job in &spec.jobs {
        allocate(
            &job.producer_id,
            &mut seen_producer_ids,
            &mut producer_id_to_node_id,
            &mut errors,
        );
    }
    for sub in &spec.sub_plans {
        allocate(
            &sub.producer_id,
            &mut seen_producer_ids,
            &mut producer_id_to_node_id,
            &mut errors,
        );
    }

    // Pass 2: resolve dependency producer IDs, build Node values.
    for job in &spec.jobs {
        let Some(&id) = producer_id_to_node_id.get(&job.producer_id) else {
            continue;
        };
        let mut dependencies = Vec::with_capacity(job.dependencies.len());
        for dep in &job.dependencies {
            match producer_id_to_node_id.get(dep) {
                Some(&dep_id) => dependencies.push(dep_id),
                None => errors.push(format!(
                    "job '{}' depends on unknown producerId '{dep}'",
                    job.producer_id
                )),
            }
        }
        nodes.insert(
            id,
            Node {
                id,
                producer_id: job.producer_id.clone(),
                name: job.name.clone(),
                dependencies,
                dependents: Vec::new(),
                kind: NodeKind::Job(JobNode {
                    task: job.task.clone(),
                    work: job.work.clone(),
                    prechecks: job.prechecks.clone(),
                    postchecks: job.postchecks.clone(),
                    instructions: job.instructions.clone(),
                    base_branch: job.base_branch.clone(),
                    expects_no_changes: job.expects_no_changes,
                }),
            },
        );
    }
    for sub in &spec.sub_plans {
        let Some(&id) = producer_id_to_node_id.get(&sub.producer_id) else {
            continue;
        };
        let mut dependencies = Vec::with_capacity(sub.dependencies.len());
        for dep in &sub.dependencies {
            match producer_id_to_node_id.get(dep) {
                Some(&dep_id) => dependencies.push(dep_id),
                None => errors.push(format!(
                    "sub-plan '{}' depends on unknown producerId '{dep}'",
                    sub.producer_id
                )),
            }
        }
        nodes.insert(
            id,
            Node {
                id,
                producer_id: sub.producer_id.clone(),
                name: sub.name.clone(),
                dependencies,
                dependents: Vec::new(),
                kind: NodeKind::SubPlan(SubPlanNode {
                    spec: sub.plan.clone(),
                    max_parallel: sub.max_parallel,
                    child_plan_id: None,
                }),
            },
        );
    }

    if !errors.is_empty() {
        return Err(OrchestratorError::Validation(errors));
    }

    // Pass 3: reverse edges (dependents).
    let dependency_pairs: Vec<(NodeId, NodeId)> = nodes
        .values()
        .flat_map(|n| n.dependencies.iter().map(move |&d| (d, n.id)))
        .collect();
    for (dep, dependent) in dependency_pairs {
        if let Some(dep_node) = nodes.get_mut(&dep) {
            dep_node.dependents.push(dependent);
        }
    }

    // Pass 4: cycle detection (three-colour DFS), reported in producerId form.
    if let Some(cycle) = find_cycle(&nodes) {
        let path = cycle
            .iter()
            .map(|id| nodes[id].producer_id.clone())
            .collect::<Vec<_>>()
            .join(" -> ");
        errors.push(format!("cycle detected: {path}"));
        return Err(OrchestratorError::Validation(errors));
    }

    if nodes.is_empty() {
        return Err(OrchestratorError::Validation(vec![
            "plan has no jobs or sub-plans".to_string(),
        ]));
    }

    let roots: Vec<NodeId> = nodes
        .values()
        .filter(|n| n.dependencies.is_empty())
        .map(|n| n.id)
        .collect();
    let leaves: Vec<NodeId> = nodes
        .values()
        .filter(|n| n.dependents.is_empty())
        .map(|n| n.id)
        .collect();

    if roots.is_empty() {
        errors.push("plan has no root nodes".to_string());
        return Err(OrchestratorError::Validation(errors));
    }

    let mut node_states = HashMap::with_capacity(nodes.len());
    for id in nodes.keys() {
        let status = if roots.contains(id) {
            NodeStatus::Ready
        } else {
            NodeStatus::Pending
        };
        node_states.insert(*id, NodeExecutionState::new(status));
    }

    let id = PlanId::new();
    let repo_path = spec
        .repo_path
        .clone()
        .unwrap_or_else(|| default_repo_path.clone());
    let worktree_root = repo_path
        .join(".worktrees")
        .join(short_id(&id));

    Ok(Plan {
        id,
        base_branch: spec.base_branch.clone(),
        target_branch: spec.target_branch.clone(),
        clean_up_successful_work: spec.clean_up_successful_work,
        max_parallel: spec.max_parallel,
        spec,
        nodes,
        producer_id_to_node_id,
        roots,
        leaves,
        node_states,
        repo_path,
        worktree_root,
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
        is_paused: false,
        state_version: 0,
        work_summary: WorkSummary::default(),
    })
}

fn allocate(
    producer_id: &str,
    seen: &mut HashSet<String>,
    map: &mut HashMap<String, NodeId>,
    errors: &mut Vec<String>,
) {
    if producer_id.is_empty() {
        errors.push("job/sub-plan missing producerId".to_string());
        return;
    }
    if !seen.insert(producer_id.to_string()) {
        errors.push(format!("duplicate producerId '{producer_id}'"));
        return;
    }
    map.insert(producer_id.to_string(), NodeId::new());
}

fn find_cycle(nodes: &HashMap<NodeId, Node>) -> Option<Vec<NodeId>> {
    let mut colors: HashMap<NodeId, Color> = nodes.keys().map(|&id| (id, Color::Unvisited)).collect();
    let mut stack = Vec::new();

    fn visit(
        id: NodeId,
        nodes: &HashMap<NodeId, Node>,
        colors: &mut HashMap<NodeId, Color>,
        stack: &mut Vec<NodeId>,
    ) -> Option<Vec<NodeId>> {
        colors.insert(id, Color::Visiting);
        stack.push(id);
        for &dep in &nodes[&id].dependencies {
            match colors.get(&dep).copied().unwrap_or(Color::Unvisited) {
                Color::Unvisited => {
                    if let Some(cycle) = visit(dep, nodes, colors, stack) {
                        return Some(cycle);
                    }
                }
                Color::Visiting => {
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<NodeId> = stack[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::Visited => {}
            }
        }
        stack.pop();
        colors.insert(id, Color::Visited);
        None
    }

    for &id in nodes.keys() {
        if colors[&id] == Color::Unvisited {
            if let Some(cycle) = visit(id, nodes, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn short_id(id: &PlanId) -> String {
    id.0.simple().to_string()[..8].to_string()
}

/// Builds a child plan for a dispatched [`SubPlanNodeSpec`]/embedded spec,
/// inheriting the parent's repo path and resolving its base branch from the
/// given commit (the parent dependency's commit) when present.
pub fn build_child_plan(
    mut spec: PlanSpec,
    parent_repo_path: &PathBuf,
    inherited_base_branch: Option<String>,
) -> Result<Plan, OrchestratorError> {
    if spec.repo_path.is_none() {
        spec.repo_path = Some(parent_repo_path.clone());
    }
    if let Some(base) = inherited_base_branch {
        spec.base_branch = base;
    }
    build_plan(spec, parent_repo_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobNodeSpec;

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

    fn spec(jobs: Vec<JobNodeSpec>) -> PlanSpec {
        PlanSpec {
            name: "test".to_string(),
            repo_path: None,
            base_branch: "main".to_string(),
            target_branch: None,
            max_parallel: 4,
            clean_up_successful_work: true,
            jobs,
            sub_plans: Vec::new(),
        }
    }

    #[test]
    fn linear_plan_builds_with_roots_and_leaves() {
        let plan = build_plan(
            spec(vec![job("a", &[]), job("b", &["a"]), job("c", &["b"])]),
            &PathBuf::from("/repo"),
        )
        .expect("should build");
        assert_eq!(plan.roots.len(), 1);
        assert_eq!(plan.leaves.len(), 1);
        let a_id = plan.producer_id_to_node_id["a"];
        let c_id = plan.producer_id_to_node_id["c"];
        assert_eq!(plan.roots[0], a_id);
        assert_eq!(plan.leaves[0], c_id);
        assert_eq!(plan.status_of(a_id), Some(NodeStatus::Ready));
        assert_eq!(plan.status_of(c_id), Some(NodeStatus::Pending));
    }

    #[test]
    fn dependents_are_exact_reverse_of_dependencies() {
        let plan = build_plan(
            spec(vec![job("a", &[]), job("b", &["a"]), job("c", &["a"])]),
            &PathBuf::from("/repo"),
        )
        .expect("should build");
        let a_id = plan.producer_id_to_node_id["a"];
        let b_id = plan.producer_id_to_node_id["b"];
        let c_id = plan.producer_id_to_node_id["c"];
        let mut dependents = plan.nodes[&a_id].dependents.clone();
        dependents.sort();
        let mut expected = vec![b_id, c_id];
        expected.sort();
        assert_eq!(dependents, expected);
    }

    #[test]
    fn cycle_is_rejected_with_producer_id_path() {
        let err = build_plan(spec(vec![job("x", &["y"]), job("y", &["x"])]), &PathBuf::from("/repo"))
            .expect_err("should reject cycle");
        match err {
            OrchestratorError::Validation(msgs) => {
                assert!(msgs.iter().any(|m| m.contains("cycle detected")));
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let err = build_plan(spec(vec![job("a", &["missing"])]), &PathBuf::from("/repo"))
            .expect_err("should reject unknown dependency");
        match err {
            OrchestratorError::Validation(msgs) => {
                assert!(msgs.iter().any(|m| m.contains("unknown producerId")));
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn duplicate_producer_id_is_rejected() {
        let err = build_plan(spec(vec![job("a", &[]), job("a", &[])]), &PathBuf::from("/repo"))
            .expect_err("should reject duplicate");
        match err {
            OrchestratorError::Validation(msgs) => {
                assert!(msgs.iter().any(|m| m.contains("duplicate producerId")));
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn empty_plan_is_rejected() {
        let err = build_plan(spec(vec![]), &PathBuf::from("/repo")).expect_err("should reject empty plan");
        match err {
            OrchestratorError::Validation(msgs) => {
                assert!(msgs.iter().any(|m| m.contains("no jobs")));
            }
            _ => panic!("wrong error variant"),
        }
    }
}
