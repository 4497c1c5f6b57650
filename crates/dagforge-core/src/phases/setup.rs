//! Ensures the worktree carries the orchestration scaffolding and that it
//! is excluded from version control.

use std::fs;
use std::io::Write;

use crate::types::PhaseName;

use super::{PhaseContext, PhaseDeps, PhaseResult};

const SCAFFOLD_DIRS: [&str; 3] = ["evidence", "instructions", "cli-state"];
const EXCLUDE_MARKER: &str = "# dagforge orchestration scaffolding";

pub async fn run_setup(ctx: &PhaseContext, deps: &PhaseDeps) -> PhaseResult {
    let orchestrator_dir = ctx.worktree_path.join(".orchestrator");
    for sub in SCAFFOLD_DIRS {
        if let Err(e) = fs::create_dir_all(orchestrator_dir.join(sub)) {
            return PhaseResult::failure(format!("failed to create .orchestrator/{sub}: {e}"));
        }
    }

    if let Err(e) = ensure_excluded(ctx, deps) {
        return PhaseResult::failure(format!("failed to update git exclude file: {e}"));
    }

    ctx.log.log_info(PhaseName::Setup, "scaffolding ready");
    PhaseResult::ok()
}

/// Marks `.orchestrator/` ignored via the worktree's private `info/exclude`
/// rather than a tracked `.gitignore`. The worktree's base commit never has
/// the scaffold in its tree, so a committed `.gitignore` would itself show
/// up as an untracked change and fool the commit phase into thinking the
/// node produced work.
fn ensure_excluded(ctx: &PhaseContext, deps: &PhaseDeps) -> anyhow::Result<()> {
    let exclude_path = deps.git.exclude_path(&ctx.worktree_path)?;
    if let Some(parent) = exclude_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let existing = fs::read_to_string(&exclude_path).unwrap_or_default();
    if existing.contains(EXCLUDE_MARKER) {
        return Ok(());
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude_path)?;
    writeln!(file, "\n{EXCLUDE_MARKER}")?;
    writeln!(file, ".orchestrator/")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitOps, ProcessGit};
    use crate::phases::fakes::{test_ctx, test_deps};
    use std::process::Command;

    fn git(dir: &std::path::Path, args: &[&str]) {
        let out = Command::new("git").arg("-C").arg(dir).args(args).output().unwrap();
        assert!(out.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&out.stderr));
    }

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        git(dir.path(), &["config", "user.email", "test@example.com"]);
        std::fs::write(dir.path().join("README.md"), "hi\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "init"]);
        dir
    }

    fn real_deps() -> PhaseDeps {
        let mut deps = test_deps();
        deps.git = std::sync::Arc::new(ProcessGit::new());
        deps
    }

    #[tokio::test]
    async fn setup_creates_scaffold_dirs_without_dirtying_the_worktree() {
        let dir = init_repo();
        let ctx = test_ctx(dir.path().to_path_buf());
        let deps = real_deps();
        let result = run_setup(&ctx, &deps).await;
        assert!(result.success, "{:?}", result.error);
        for sub in SCAFFOLD_DIRS {
            assert!(dir.path().join(".orchestrator").join(sub).is_dir());
        }
        assert!(
            !dir.path().join(".gitignore").exists(),
            "setup must not write a tracked .gitignore"
        );

        let git_ops = ProcessGit::new();
        assert!(
            !git_ops.has_uncommitted_changes(dir.path()).unwrap(),
            "scaffolding a fresh worktree must leave it clean"
        );
    }

    #[tokio::test]
    async fn setup_is_idempotent_on_exclude_file() {
        let dir = init_repo();
        let ctx = test_ctx(dir.path().to_path_buf());
        let deps = real_deps();
        run_setup(&ctx, &deps).await;
        run_setup(&ctx, &deps).await;
        let exclude_path = deps.git.exclude_path(dir.path()).unwrap();
        let contents = fs::read_to_string(exclude_path).unwrap();
        assert_eq!(contents.matches(EXCLUDE_MARKER).count(), 1);
    }
}
