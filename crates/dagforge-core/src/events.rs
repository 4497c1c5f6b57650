use chrono::{DateTime, Utc};

use crate::types::{NodeId, NodeStatus, Plan, PlanId, PlanStatus};

/// Broadcast over a `tokio::sync::broadcast` channel by the runner, the way
/// the teacher's pipeline broadcasts its own tick-loop events.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    PlanCreated(Box<Plan>),
    PlanStarted(Box<Plan>),
    PlanCompleted {
        plan: Box<Plan>,
        status: PlanStatus,
    },
    PlanDeleted(PlanId),
    NodeTransition {
        plan_id: PlanId,
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        plan_id: PlanId,
        node_id: NodeId,
    },
    NodeCompleted {
        plan_id: PlanId,
        node_id: NodeId,
        success: bool,
    },
}

pub type EventSender = tokio::sync::broadcast::Sender<OrchestratorEvent>;
pub type EventReceiver = tokio::sync::broadcast::Receiver<OrchestratorEvent>;

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
