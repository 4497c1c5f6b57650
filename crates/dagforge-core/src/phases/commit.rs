//! Commits whatever the work phase produced, or falls back to evidence.
//!
//! Runs once, between `work` and `postchecks` in the canonical phase order
//! (spec's two historical revisions of where `postchecks` brackets `commit`
//! collapse to this single invocation).

use crate::types::{NodeId, PhaseName};

use super::{PhaseContext, PhaseDeps, PhaseResult};

pub async fn run_commit(ctx: &PhaseContext, deps: &PhaseDeps, node_id: NodeId, task: &str, expects_no_changes: bool) -> PhaseResult {
    if ctx.is_aborted() {
        return PhaseResult::canceled();
    }

    let has_changes = match deps.git.has_uncommitted_changes(&ctx.worktree_path) {
        Ok(v) => v,
        Err(e) => return PhaseResult::failure(format!("failed to inspect worktree status: {e}")),
    };

    if has_changes {
        if let Err(e) = deps.git.stage_all(&ctx.worktree_path) {
            return PhaseResult::failure(format!("git add -A failed: {e}"));
        }
        let message = format!("[PLAN] {task}");
        return match deps.git.commit(&ctx.worktree_path, &message, None) {
            Ok(commit) => {
                ctx.log.log_info(PhaseName::Commit, &format!("committed {commit}"));
                PhaseResult {
                    success: true,
                    commit: Some(commit),
                    ..Default::default()
                }
            }
            Err(e) => PhaseResult::failure(format!("git commit failed: {e}")),
        };
    }

    let verdict = match deps.evidence.validate(&ctx.worktree_path, node_id, expects_no_changes) {
        Ok(v) => v,
        Err(e) => return PhaseResult::failure(format!("evidence validation errored: {e}")),
    };

    if verdict.valid {
        ctx.log.log_info(PhaseName::Commit, &verdict.reason);
        return PhaseResult::ok();
    }

    PhaseResult::failure(verdict.reason)
}
