//! Reverse Integration: merges a leaf node's completed commit back into the
//! operator's target branch, squash-style.
//!
//! Unlike the other six phases, a merge-ri failure does not fail the node:
//! the node's own work already succeeded and committed. Failure here only
//! leaves `mergedToTarget = false`, which blocks worktree cleanup so the
//! operator can retry the merge by hand.

use crate::delegate::DelegateRequest;
use crate::git::{MergeOutcome, TreeMergeOutcome};
use crate::types::PhaseName;

use super::{PhaseContext, PhaseDeps};

#[derive(Debug, Clone)]
pub struct MergeRiResult {
    pub merged: bool,
    pub error: Option<String>,
}

impl MergeRiResult {
    fn ok() -> Self {
        Self {
            merged: true,
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            merged: false,
            error: Some(error.into()),
        }
    }
}

pub async fn run_merge_ri(
    ctx: &PhaseContext,
    deps: &PhaseDeps,
    plan_name: &str,
    node_name: &str,
    completed_commit: &str,
    target_branch: &str,
) -> MergeRiResult {
    let repo = ctx.repo_path.clone();
    let message = format!("PLAN {plan_name}: merge {node_name}");

    let target_tip = match deps.git.resolve_ref(&repo, &format!("refs/heads/{target_branch}")) {
        Ok(tip) => tip,
        Err(e) => return MergeRiResult::fail(format!("failed to resolve target branch '{target_branch}': {e}")),
    };

    let tree_outcome = match deps.git.merge_without_checkout(&repo, &target_tip, completed_commit) {
        Ok(o) => o,
        Err(e) => return MergeRiResult::fail(format!("merge-tree failed: {e}")),
    };

    match tree_outcome {
        TreeMergeOutcome::Clean { tree } => {
            let commit = match deps.git.commit_tree(&repo, &tree, &[&target_tip], &message) {
                Ok(c) => c,
                Err(e) => return MergeRiResult::fail(format!("commit-tree failed: {e}")),
            };
            if let Err(e) = update_branch(ctx, deps, target_branch, &commit) {
                return MergeRiResult::fail(format!("failed to advance '{target_branch}': {e}"));
            }
            if deps.config.merge_push_on_success {
                if let Err(e) = deps.git.push(&repo, target_branch) {
                    ctx.log
                        .log_error(PhaseName::MergeRi, &format!("push to '{target_branch}' failed: {e}"));
                }
            }
            ctx.log
                .log_info(PhaseName::MergeRi, &format!("fast-path merged {node_name} into {target_branch} as {commit}"));
            MergeRiResult::ok()
        }
        TreeMergeOutcome::Conflict { conflict_files } => {
            ctx.log.log_info(
                PhaseName::MergeRi,
                &format!("conflict merging {node_name} into {target_branch}, falling back to stashed checkout"),
            );
            conflict_path(ctx, deps, node_name, completed_commit, target_branch, &message, &conflict_files).await
        }
    }
}

/// If the operator is currently on the target branch, a direct `update-ref`
/// would desync the working tree from the ref; stash and hard-reset
/// instead. Otherwise the ref can move without touching the working tree.
fn update_branch(ctx: &PhaseContext, deps: &PhaseDeps, target_branch: &str, commit: &str) -> anyhow::Result<()> {
    let repo = &ctx.repo_path;
    match deps.git.current_branch(repo)? {
        Some(branch) if branch == target_branch => {
            let stashed = deps.git.stash_push(repo)?;
            deps.git.reset_hard(repo, commit)?;
            if stashed {
                deps.git.stash_pop(repo)?;
            }
            Ok(())
        }
        _ => deps
            .git
            .update_ref(repo, &format!("refs/heads/{target_branch}"), commit),
    }
}

async fn conflict_path(
    ctx: &PhaseContext,
    deps: &PhaseDeps,
    node_name: &str,
    completed_commit: &str,
    target_branch: &str,
    message: &str,
    conflict_files: &[String],
) -> MergeRiResult {
    let repo = &ctx.repo_path;

    let original_branch = match deps.git.current_branch(repo) {
        Ok(b) => b,
        Err(e) => return MergeRiResult::fail(format!("failed to read current branch: {e}")),
    };

    let stashed = match deps.git.stash_push(repo) {
        Ok(s) => s,
        Err(e) => return MergeRiResult::fail(format!("failed to stash operator changes: {e}")),
    };

    if let Err(e) = deps.git.checkout(repo, target_branch) {
        restore_operator_state(deps, repo, original_branch.as_deref(), stashed);
        return MergeRiResult::fail(format!("failed to checkout '{target_branch}': {e}"));
    }

    let merge_outcome = deps.git.merge(repo, completed_commit, message, false);
    let conflicted = match merge_outcome {
        Ok(MergeOutcome::Merged { .. }) => false,
        Ok(MergeOutcome::Conflict { .. }) => true,
        Err(e) => {
            let _ = deps.git.merge_abort(repo);
            restore_operator_state(deps, repo, original_branch.as_deref(), stashed);
            return MergeRiResult::fail(format!("git merge failed: {e}"));
        }
    };

    if !conflicted {
        restore_operator_state(deps, repo, original_branch.as_deref(), stashed);
        ctx.log
            .log_info(PhaseName::MergeRi, &format!("merged {node_name} into {target_branch} without conflict"));
        return MergeRiResult::ok();
    }

    let request = DelegateRequest {
        task: format!(
            "Resolve the git merge conflict merging '{node_name}' into '{target_branch}'. \
             Prefer '{}' changes when a conflict cannot be reconciled semantically. \
             Stage the resolution and commit it.",
            deps.config.merge_prefer
        ),
        instructions: None,
        worktree_path: repo.clone(),
        session_id: None,
        model: None,
        context_files: conflict_files.iter().map(Into::into).collect(),
        max_turns: None,
        extra_context: None,
        log: None,
    };

    let delegate_result = deps.delegate.delegate(request).await;
    match delegate_result {
        Ok(outcome) if outcome.success => {
            restore_operator_state(deps, repo, original_branch.as_deref(), stashed);
            ctx.log
                .log_info(PhaseName::MergeRi, &format!("delegate resolved merge conflict for {node_name}"));
            MergeRiResult::ok()
        }
        Ok(outcome) => {
            let _ = deps.git.merge_abort(repo);
            restore_operator_state(deps, repo, original_branch.as_deref(), stashed);
            MergeRiResult::fail(format!(
                "merge conflict unresolved by delegate: {}",
                outcome.error.unwrap_or_default()
            ))
        }
        Err(e) => {
            let _ = deps.git.merge_abort(repo);
            restore_operator_state(deps, repo, original_branch.as_deref(), stashed);
            MergeRiResult::fail(format!("delegate invocation failed: {e}"))
        }
    }
}

fn restore_operator_state(deps: &PhaseDeps, repo: &std::path::Path, original_branch: Option<&str>, stashed: bool) {
    if let Some(branch) = original_branch {
        let _ = deps.git.checkout(repo, branch);
    }
    if stashed {
        let _ = deps.git.stash_pop(repo);
    }
}
