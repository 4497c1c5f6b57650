//! Git operations seam consumed by the phase pipeline: worktree lifecycle,
//! commits, diff stats, and the forward/reverse-integration merge primitives.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::types::WorkSummary;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: String,
    pub change: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged { commit: String },
    Conflict { conflict_files: Vec<String> },
}

#[derive(Debug, Clone)]
pub enum TreeMergeOutcome {
    Clean { tree: String },
    Conflict { conflict_files: Vec<String> },
}

/// Collaborator seam the phase executors are written against. `ProcessGit`
/// is the real implementation; tests may substitute a fake.
pub trait GitOps: Send + Sync {
    fn create_worktree_at(&self, repo: &Path, worktree: &Path, commit: &str) -> Result<()>;
    fn remove_worktree(&self, repo: &Path, worktree: &Path) -> Result<()>;
    fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeInfo>>;
    fn head_commit(&self, dir: &Path) -> Result<String>;
    fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool>;
    fn stage_all(&self, dir: &Path) -> Result<()>;
    fn commit(&self, dir: &Path, message: &str, author: Option<(&str, &str)>) -> Result<String>;
    fn resolve_ref(&self, dir: &Path, refname: &str) -> Result<String>;
    fn diff_stats(&self, dir: &Path, from: &str, to: &str) -> Result<WorkSummary>;
    fn list_changed_files(&self, dir: &Path, from: &str, to: &str) -> Result<Vec<ChangedFile>>;
    fn push(&self, dir: &Path, branch: &str) -> Result<()>;
    fn checkout(&self, dir: &Path, branch: &str) -> Result<()>;
    fn current_branch(&self, dir: &Path) -> Result<Option<String>>;
    fn stash_push(&self, dir: &Path) -> Result<bool>;
    fn stash_pop(&self, dir: &Path) -> Result<()>;
    fn merge(&self, dir: &Path, src: &str, message: &str, fast_forward: bool) -> Result<MergeOutcome>;
    fn merge_abort(&self, dir: &Path) -> Result<()>;
    fn merge_without_checkout(&self, repo: &Path, base: &str, incoming: &str) -> Result<TreeMergeOutcome>;
    fn commit_tree(&self, repo: &Path, tree: &str, parents: &[&str], message: &str) -> Result<String>;
    fn update_ref(&self, repo: &Path, refname: &str, commit: &str) -> Result<()>;
    fn reset_hard(&self, dir: &Path, refname: &str) -> Result<()>;
    /// Path to `dir`'s private `info/exclude` file (each worktree has its
    /// own, distinct from the main repo's), for ignore rules that must not
    /// touch the tracked tree.
    fn exclude_path(&self, dir: &Path) -> Result<PathBuf>;
}

/// Real [`GitOps`] backed by shelling out to the system `git` binary, the
/// way the orchestrator's every other worktree interaction does.
pub struct ProcessGit;

impl ProcessGit {
    pub fn new() -> Self {
        Self
    }

    fn exec(&self, dir: &Path, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn git -C {} {}", dir.display(), args.join(" ")))?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn require(&self, result: ExecResult, context: impl Fn() -> String) -> Result<ExecResult> {
        if !result.success() {
            return Err(anyhow!("{}: {}", context(), result.combined_output()));
        }
        Ok(result)
    }
}

impl Default for ProcessGit {
    fn default() -> Self {
        Self::new()
    }
}

impl GitOps for ProcessGit {
    fn create_worktree_at(&self, repo: &Path, worktree: &Path, commit: &str) -> Result<()> {
        let wt = worktree.to_string_lossy();
        let result = self.exec(repo, &["worktree", "add", "--detach", &wt, commit])?;
        self.require(result, || format!("git worktree add --detach {wt} {commit} failed"))?;
        Ok(())
    }

    fn remove_worktree(&self, repo: &Path, worktree: &Path) -> Result<()> {
        let wt = worktree.to_string_lossy();
        let result = self.exec(repo, &["worktree", "remove", "--force", &wt])?;
        self.require(result, || format!("git worktree remove --force {wt} failed"))?;
        Ok(())
    }

    fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeInfo>> {
        let result = self.exec(repo, &["worktree", "list", "--porcelain"])?;
        let result = self.require(result, || "git worktree list --porcelain failed".to_string())?;
        let mut worktrees = Vec::new();
        let mut path: Option<PathBuf> = None;
        let mut head = String::new();
        let mut branch = None;
        for line in result.stdout.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                if let Some(prev) = path.take() {
                    worktrees.push(WorktreeInfo {
                        path: prev,
                        head: std::mem::take(&mut head),
                        branch: branch.take(),
                    });
                }
                path = Some(PathBuf::from(p));
            } else if let Some(h) = line.strip_prefix("HEAD ") {
                head = h.to_string();
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = Some(b.trim_start_matches("refs/heads/").to_string());
            }
        }
        if let Some(prev) = path.take() {
            worktrees.push(WorktreeInfo { path: prev, head, branch });
        }
        Ok(worktrees)
    }

    fn head_commit(&self, dir: &Path) -> Result<String> {
        self.resolve_ref(dir, "HEAD")
    }

    fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool> {
        let result = self.exec(dir, &["status", "--porcelain"])?;
        Ok(!result.stdout.trim().is_empty())
    }

    fn exclude_path(&self, dir: &Path) -> Result<PathBuf> {
        let result = self.exec(dir, &["rev-parse", "--git-path", "info/exclude"])?;
        let result = self.require(result, || "git rev-parse --git-path info/exclude failed".to_string())?;
        let raw = PathBuf::from(result.stdout.trim());
        Ok(if raw.is_absolute() { raw } else { dir.join(raw) })
    }

    fn stage_all(&self, dir: &Path) -> Result<()> {
        let result = self.exec(dir, &["add", "-A"])?;
        self.require(result, || "git add -A failed".to_string())?;
        Ok(())
    }

    fn commit(&self, dir: &Path, message: &str, author: Option<(&str, &str)>) -> Result<String> {
        let mut args = vec!["commit", "-m", message];
        let author_str;
        if let Some((name, email)) = author {
            author_str = format!("{name} <{email}>");
            args.push("--author");
            args.push(&author_str);
        }
        let result = self.exec(dir, &args)?;
        self.require(result, || "git commit failed".to_string())?;
        self.head_commit(dir)
    }

    fn resolve_ref(&self, dir: &Path, refname: &str) -> Result<String> {
        let result = self.exec(dir, &["rev-parse", refname])?;
        let result = self.require(result, || format!("git rev-parse {refname} failed"))?;
        Ok(result.stdout.trim().to_string())
    }

    fn diff_stats(&self, dir: &Path, from: &str, to: &str) -> Result<WorkSummary> {
        let range = format!("{from}..{to}");
        let result = self.exec(dir, &["diff", "--name-status", &range])?;
        let result = self.require(result, || format!("git diff --name-status {range} failed"))?;
        let mut summary = WorkSummary::default();
        let mut commits = self.exec(dir, &["rev-list", "--count", &range])?;
        if commits.success() {
            summary.commits = commits.stdout.trim().parse().unwrap_or(0);
        } else {
            commits.stdout.clear();
        }
        for line in result.stdout.lines() {
            match line.chars().next() {
                Some('A') => summary.files_added += 1,
                Some('D') => summary.files_deleted += 1,
                Some(_) => summary.files_modified += 1,
                None => {}
            }
        }
        Ok(summary)
    }

    fn list_changed_files(&self, dir: &Path, from: &str, to: &str) -> Result<Vec<ChangedFile>> {
        let range = format!("{from}..{to}");
        let result = self.exec(dir, &["diff", "--name-status", &range])?;
        let result = self.require(result, || format!("git diff --name-status {range} failed"))?;
        let mut files = Vec::new();
        for line in result.stdout.lines() {
            let mut parts = line.splitn(2, '\t');
            let Some(status) = parts.next() else { continue };
            let Some(path) = parts.next() else { continue };
            let change = match status.chars().next() {
                Some('A') => ChangeKind::Added,
                Some('D') => ChangeKind::Deleted,
                _ => ChangeKind::Modified,
            };
            files.push(ChangedFile {
                path: path.to_string(),
                change,
            });
        }
        Ok(files)
    }

    fn push(&self, dir: &Path, branch: &str) -> Result<()> {
        let result = self.exec(dir, &["push", "origin", branch])?;
        self.require(result, || format!("git push origin {branch} failed"))?;
        Ok(())
    }

    fn checkout(&self, dir: &Path, branch: &str) -> Result<()> {
        let result = self.exec(dir, &["checkout", branch])?;
        self.require(result, || format!("git checkout {branch} failed"))?;
        Ok(())
    }

    fn current_branch(&self, dir: &Path) -> Result<Option<String>> {
        let result = self.exec(dir, &["symbolic-ref", "--short", "-q", "HEAD"])?;
        if !result.success() {
            return Ok(None);
        }
        Ok(Some(result.stdout.trim().to_string()))
    }

    fn stash_push(&self, dir: &Path) -> Result<bool> {
        if !self.has_uncommitted_changes(dir)? {
            return Ok(false);
        }
        let result = self.exec(dir, &["stash", "push", "--include-untracked"])?;
        self.require(result, || "git stash push failed".to_string())?;
        Ok(true)
    }

    fn stash_pop(&self, dir: &Path) -> Result<()> {
        let result = self.exec(dir, &["stash", "pop"])?;
        self.require(result, || "git stash pop failed".to_string())?;
        Ok(())
    }

    fn merge(&self, dir: &Path, src: &str, message: &str, fast_forward: bool) -> Result<MergeOutcome> {
        let ff_flag = if fast_forward { "--ff" } else { "--no-ff" };
        let result = self.exec(dir, &["merge", ff_flag, "-m", message, src])?;
        if result.success() {
            let commit = self.head_commit(dir)?;
            return Ok(MergeOutcome::Merged { commit });
        }
        let status = self.exec(dir, &["diff", "--name-only", "--diff-filter=U"])?;
        let conflict_files = status.stdout.lines().map(|s| s.to_string()).collect();
        Ok(MergeOutcome::Conflict { conflict_files })
    }

    fn merge_abort(&self, dir: &Path) -> Result<()> {
        let result = self.exec(dir, &["merge", "--abort"])?;
        self.require(result, || "git merge --abort failed".to_string())?;
        Ok(())
    }

    fn merge_without_checkout(&self, repo: &Path, base: &str, incoming: &str) -> Result<TreeMergeOutcome> {
        let result = self.exec(repo, &["merge-tree", "--write-tree", base, incoming])?;
        if result.success() {
            let tree = result.stdout.lines().next().unwrap_or_default().trim().to_string();
            return Ok(TreeMergeOutcome::Clean { tree });
        }
        // Conflicting merge-tree output lists conflicted paths after the
        // first blank line; best-effort extraction for diagnostics.
        let conflict_files = result
            .stdout
            .lines()
            .skip_while(|l| !l.trim().is_empty())
            .skip(1)
            .map(|l| l.to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Ok(TreeMergeOutcome::Conflict { conflict_files })
    }

    fn commit_tree(&self, repo: &Path, tree: &str, parents: &[&str], message: &str) -> Result<String> {
        let mut args = vec!["commit-tree", tree];
        for parent in parents {
            args.push("-p");
            args.push(parent);
        }
        args.push("-m");
        args.push(message);
        let result = self.exec(repo, &args)?;
        let result = self.require(result, || "git commit-tree failed".to_string())?;
        Ok(result.stdout.trim().to_string())
    }

    fn update_ref(&self, repo: &Path, refname: &str, commit: &str) -> Result<()> {
        let result = self.exec(repo, &["update-ref", refname, commit])?;
        self.require(result, || format!("git update-ref {refname} {commit} failed"))?;
        Ok(())
    }

    fn reset_hard(&self, dir: &Path, refname: &str) -> Result<()> {
        let result = self.exec(dir, &["reset", "--hard", refname])?;
        self.require(result, || format!("git reset --hard {refname} failed"))?;
        Ok(())
    }
}
