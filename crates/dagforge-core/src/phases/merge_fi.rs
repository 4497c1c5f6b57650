//! Forward Integration: merges a job's remaining dependency commits into its
//! worktree before the job's own work runs.

use crate::delegate::DelegateRequest;
use crate::git::MergeOutcome;
use crate::types::PhaseName;

use super::{PhaseContext, PhaseDeps, PhaseResult};

/// `dependency_commits` is the ordered sequence from
/// `StateMachine::base_commits_for_node`; the worktree is assumed already
/// checked out at `dependency_commits[0]`, so only the remainder need to be
/// forward-integrated.
pub async fn run_merge_fi(
    ctx: &PhaseContext,
    deps: &PhaseDeps,
    dependency_commits: &[String],
) -> PhaseResult {
    if dependency_commits.len() < 2 {
        return PhaseResult::ok();
    }

    for commit in &dependency_commits[1..] {
        if ctx.is_aborted() {
            return PhaseResult::canceled();
        }
        let short = &commit[..commit.len().min(8)];
        let message = format!("Merge parent commit {short} for job {}", ctx.node_name);
        ctx.log
            .log_info(PhaseName::MergeFi, &format!("merging parent commit {short}"));

        let outcome = match deps.git.merge(&ctx.worktree_path, commit, &message, true) {
            Ok(outcome) => outcome,
            Err(e) => return PhaseResult::failure(format!("git merge failed: {e}")),
        };

        match outcome {
            MergeOutcome::Merged { .. } => continue,
            MergeOutcome::Conflict { conflict_files } => {
                ctx.log.log_info(
                    PhaseName::MergeFi,
                    &format!("conflict merging {short}, delegating resolution: {conflict_files:?}"),
                );
                let request = DelegateRequest {
                    task: format!(
                        "Resolve the git merge conflict in {} between the current branch and commit {short}. \
                         Prefer '{}' changes when a conflict cannot be reconciled semantically. \
                         Stage the resolution and commit it.",
                        ctx.node_name, deps.config.merge_prefer
                    ),
                    instructions: None,
                    worktree_path: ctx.worktree_path.clone(),
                    session_id: ctx.session_id.clone(),
                    model: None,
                    context_files: conflict_files.iter().map(Into::into).collect(),
                    max_turns: None,
                    extra_context: None,
                    log: None,
                };
                match deps.delegate.delegate(request).await {
                    Ok(outcome) if outcome.success => continue,
                    Ok(outcome) => {
                        let _ = deps.git.merge_abort(&ctx.worktree_path);
                        return PhaseResult::failure(format!(
                            "merge conflict unresolved by delegate: {}",
                            outcome.error.unwrap_or_default()
                        ));
                    }
                    Err(e) => {
                        let _ = deps.git.merge_abort(&ctx.worktree_path);
                        return PhaseResult::failure(format!("delegate invocation failed: {e}"));
                    }
                }
            }
        }
    }

    PhaseResult::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{AgentDelegate, DelegateOutcome};
    use crate::phases::fakes::{test_ctx, test_deps};
    use async_trait::async_trait;
    use std::process::Command;
    use std::sync::Arc;

    fn git(dir: &std::path::Path, args: &[&str]) {
        let status = Command::new("git").arg("-C").arg(dir).args(args).output().unwrap();
        assert!(status.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&status.stderr));
    }

    fn init_repo() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        git(dir.path(), &["config", "user.email", "test@example.com"]);
        std::fs::write(dir.path().join("shared.txt"), "base\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "init"]);
        let branch = crate::git::ProcessGit::new().current_branch(dir.path()).unwrap().unwrap();
        (dir, branch)
    }

    fn real_deps() -> PhaseDeps {
        let mut deps = test_deps();
        deps.git = Arc::new(crate::git::ProcessGit::new());
        deps
    }

    struct FakeDelegate(bool);
    #[async_trait]
    impl AgentDelegate for FakeDelegate {
        async fn delegate(&self, _: crate::delegate::DelegateRequest) -> anyhow::Result<DelegateOutcome> {
            Ok(DelegateOutcome {
                success: self.0,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn fewer_than_two_commits_is_a_noop() {
        let ctx = test_ctx(std::path::PathBuf::from("/nonexistent"));
        let deps = real_deps();
        let result = run_merge_fi(&ctx, &deps, &["abc123".to_string()]).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn clean_merge_of_second_parent_succeeds() {
        let (dir, branch) = init_repo();
        let base = crate::git::ProcessGit::new().head_commit(dir.path()).unwrap();

        git(dir.path(), &["checkout", "-qb", "other"]);
        std::fs::write(dir.path().join("other.txt"), "from other\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "other change"]);
        let other = crate::git::ProcessGit::new().head_commit(dir.path()).unwrap();

        git(dir.path(), &["checkout", "-q", &branch]);

        let ctx = test_ctx(dir.path().to_path_buf());
        let deps = real_deps();
        let result = run_merge_fi(&ctx, &deps, &[base, other]).await;
        assert!(result.success, "{:?}", result.error);
        assert!(dir.path().join("other.txt").exists());
    }

    #[tokio::test]
    async fn conflicting_merge_resolved_by_delegate_succeeds() {
        let (dir, branch) = init_repo();
        let base = crate::git::ProcessGit::new().head_commit(dir.path()).unwrap();

        git(dir.path(), &["checkout", "-qb", "other"]);
        std::fs::write(dir.path().join("shared.txt"), "from other\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "other change"]);
        let other = crate::git::ProcessGit::new().head_commit(dir.path()).unwrap();

        git(dir.path(), &["checkout", "-q", &branch]);
        std::fs::write(dir.path().join("shared.txt"), "from master\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "master change"]);

        let ctx = test_ctx(dir.path().to_path_buf());
        let mut deps = real_deps();
        deps.delegate = Arc::new(FakeDelegate(true));
        let result = run_merge_fi(&ctx, &deps, &[base, other]).await;
        assert!(result.success, "{:?}", result.error);
    }

    #[tokio::test]
    async fn conflicting_merge_delegate_failure_aborts_and_fails() {
        let (dir, branch) = init_repo();
        let base = crate::git::ProcessGit::new().head_commit(dir.path()).unwrap();

        git(dir.path(), &["checkout", "-qb", "other"]);
        std::fs::write(dir.path().join("shared.txt"), "from other\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "other change"]);
        let other = crate::git::ProcessGit::new().head_commit(dir.path()).unwrap();

        git(dir.path(), &["checkout", "-q", &branch]);
        std::fs::write(dir.path().join("shared.txt"), "from master\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "master change"]);

        let ctx = test_ctx(dir.path().to_path_buf());
        let mut deps = real_deps();
        deps.delegate = Arc::new(FakeDelegate(false));
        let result = run_merge_fi(&ctx, &deps, &[base, other]).await;
        assert!(!result.success);
        assert!(!dir.path().join(".git").join("MERGE_HEAD").exists());
    }
}
