use dagforge_core::types::{NodeStatus, Plan, PlanStatus};

fn status_glyph(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "·",
        NodeStatus::Ready => "o",
        NodeStatus::Scheduled => "s",
        NodeStatus::Running => "▶",
        NodeStatus::Succeeded => "✓",
        NodeStatus::Failed => "✗",
        NodeStatus::Blocked => "!",
        NodeStatus::Canceled => "x",
    }
}

pub fn print_plan_status(plan: &Plan) {
    println!("plan {} ({})", plan.id, plan.spec.name);

    let mut nodes: Vec<_> = plan.nodes.values().collect();
    nodes.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));

    for node in nodes {
        let Some(state) = plan.state(node.id) else {
            continue;
        };
        let glyph = status_glyph(state.status);
        let attempt = if state.attempts > 1 {
            format!(" (attempt {})", state.attempts)
        } else {
            String::new()
        };
        let error = state
            .error
            .as_deref()
            .map(|e| format!(" — {e}"))
            .unwrap_or_default();
        println!(
            "  [{glyph}] {:<20} {:?}{attempt}{error}",
            node.producer_id, state.status
        );
    }
}

pub fn overall_status_line(plan: &Plan, status: PlanStatus) -> String {
    let total = plan.nodes.len();
    let succeeded = plan
        .node_states
        .values()
        .filter(|s| s.status == NodeStatus::Succeeded)
        .count();
    format!("{status:?}: {succeeded}/{total} nodes succeeded")
}
