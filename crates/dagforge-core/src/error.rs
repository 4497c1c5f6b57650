use crate::types::{NodeId, NodeStatus, PhaseName};

/// Top-level error surfaced to callers across the trait boundaries.
///
/// Internal glue code uses `anyhow::Result` throughout (phase executors,
/// the job executor, the pump); only the places spec'd to cross a public
/// API boundary return this type.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("plan validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("phase {phase} failed: {message}")]
    PhaseFailure { phase: PhaseName, message: String },

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: NodeStatus, to: NodeStatus },

    #[error("node crashed before restart")]
    Crashed,

    #[error("merge conflict unresolved for node {node}")]
    MergeConflictUnresolved { node: NodeId },

    #[error("git operation failed: {0}")]
    GitOp(String),

    #[error("process spawn failed: {0}")]
    Spawn(String),

    #[error("phase {phase} timed out")]
    Timeout { phase: PhaseName },

    #[error("plan {0} not found")]
    PlanNotFound(crate::types::PlanId),

    #[error("not implemented")]
    NotImplemented,
}
