//! The seven independently testable phase implementations sharing a uniform
//! [`PhaseContext`]: merge-fi, setup, prechecks, work, commit, postchecks,
//! merge-ri.

mod commit;
mod merge_fi;
mod merge_ri;
mod setup;
mod work;

pub use commit::run_commit;
pub use merge_fi::run_merge_fi;
pub use merge_ri::{run_merge_ri, MergeRiResult};
pub use setup::run_setup;
pub use work::run_work_phase;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::Config;
use crate::delegate::AgentDelegate;
use crate::evidence::EvidenceValidator;
use crate::git::GitOps;
use crate::process::ProcessSpawner;
use crate::types::{NodeId, PhaseName, PlanId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Stdout,
    Stderr,
}

/// Structured log sink a phase writes to; the job executor's implementation
/// both buffers in memory and appends to the per-execution log file.
pub trait LogSink: Send + Sync {
    fn log_info(&self, phase: PhaseName, message: &str);
    fn log_error(&self, phase: PhaseName, message: &str);
    fn log_output(&self, phase: PhaseName, kind: LogKind, message: &str);
}

/// Lets a phase register the spawned process/agent-work it is currently
/// running, for the job executor's process-stats bookkeeping.
pub trait ProcessRegistrar: Send + Sync {
    fn set_pid(&self, pid: Option<u32>);
    fn set_start_time(&self, at: DateTime<Utc>);
    fn set_is_agent_work(&self, is_agent: bool);
}

/// No-op log sink for phase invocations outside a tracked job execution —
/// e.g. the runner's own merge-ri call for a completed sub-plan's leaf.
pub struct SilentLog;
impl LogSink for SilentLog {
    fn log_info(&self, _phase: PhaseName, _message: &str) {}
    fn log_error(&self, _phase: PhaseName, _message: &str) {}
    fn log_output(&self, _phase: PhaseName, _kind: LogKind, _message: &str) {}
}

pub struct NullRegistrar;
impl ProcessRegistrar for NullRegistrar {
    fn set_pid(&self, _pid: Option<u32>) {}
    fn set_start_time(&self, _at: DateTime<Utc>) {}
    fn set_is_agent_work(&self, _is_agent: bool) {}
}

/// Shared collaborators every phase is invoked with; bundled so phase
/// signatures don't grow a parameter per trait.
pub struct PhaseDeps {
    pub git: Arc<dyn GitOps>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub delegate: Arc<dyn AgentDelegate>,
    pub evidence: Arc<dyn EvidenceValidator>,
    pub config: Arc<Config>,
}

pub struct PhaseContext {
    pub plan_id: PlanId,
    pub node_id: NodeId,
    pub node_name: String,
    pub task: String,
    pub worktree_path: PathBuf,
    pub repo_path: PathBuf,
    pub env: HashMap<String, String>,
    pub session_id: Option<String>,
    pub aborted: Arc<AtomicBool>,
    pub log: Arc<dyn LogSink>,
    pub registrar: Arc<dyn ProcessRegistrar>,
}

impl PhaseContext {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhaseResult {
    pub success: bool,
    pub error: Option<String>,
    pub metrics: Option<Value>,
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
    /// Commit SHA produced by the commit phase, when one was created.
    pub commit: Option<String>,
}

impl PhaseResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with_session(session_id: Option<String>) -> Self {
        Self {
            success: true,
            session_id,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn canceled() -> Self {
        Self::failure("Execution canceled.")
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::delegate::{AgentDelegate, DelegateOutcome, DelegateRequest};
    use crate::evidence::{EvidenceValidator, EvidenceVerdict};
    use crate::git::{ChangedFile, GitOps, MergeOutcome, TreeMergeOutcome, WorktreeInfo};
    use crate::process::{ProcessSpawner, SpawnSpec, SpawnedProcess};
    use crate::types::{NodeId, WorkSummary};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;

    pub struct NoopGit;
    impl GitOps for NoopGit {
        fn create_worktree_at(&self, _: &Path, _: &Path, _: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn remove_worktree(&self, _: &Path, _: &Path) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn list_worktrees(&self, _: &Path) -> anyhow::Result<Vec<WorktreeInfo>> {
            unimplemented!()
        }
        fn head_commit(&self, _: &Path) -> anyhow::Result<String> {
            unimplemented!()
        }
        fn has_uncommitted_changes(&self, _: &Path) -> anyhow::Result<bool> {
            unimplemented!()
        }
        fn stage_all(&self, _: &Path) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn commit(&self, _: &Path, _: &str, _: Option<(&str, &str)>) -> anyhow::Result<String> {
            unimplemented!()
        }
        fn resolve_ref(&self, _: &Path, _: &str) -> anyhow::Result<String> {
            unimplemented!()
        }
        fn diff_stats(&self, _: &Path, _: &str, _: &str) -> anyhow::Result<WorkSummary> {
            unimplemented!()
        }
        fn list_changed_files(&self, _: &Path, _: &str, _: &str) -> anyhow::Result<Vec<ChangedFile>> {
            unimplemented!()
        }
        fn push(&self, _: &Path, _: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn checkout(&self, _: &Path, _: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn current_branch(&self, _: &Path) -> anyhow::Result<Option<String>> {
            unimplemented!()
        }
        fn stash_push(&self, _: &Path) -> anyhow::Result<bool> {
            unimplemented!()
        }
        fn stash_pop(&self, _: &Path) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn merge(&self, _: &Path, _: &str, _: &str, _: bool) -> anyhow::Result<MergeOutcome> {
            unimplemented!()
        }
        fn merge_abort(&self, _: &Path) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn merge_without_checkout(&self, _: &Path, _: &str, _: &str) -> anyhow::Result<TreeMergeOutcome> {
            unimplemented!()
        }
        fn commit_tree(&self, _: &Path, _: &str, _: &[&str], _: &str) -> anyhow::Result<String> {
            unimplemented!()
        }
        fn update_ref(&self, _: &Path, _: &str, _: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn reset_hard(&self, _: &Path, _: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn exclude_path(&self, _: &Path) -> anyhow::Result<std::path::PathBuf> {
            unimplemented!()
        }
    }

    pub struct NoopSpawner;
    #[async_trait]
    impl ProcessSpawner for NoopSpawner {
        async fn spawn(&self, _: &SpawnSpec) -> anyhow::Result<Box<dyn SpawnedProcess>> {
            unimplemented!()
        }
    }

    pub struct NoopDelegate;
    #[async_trait]
    impl AgentDelegate for NoopDelegate {
        async fn delegate(&self, _: DelegateRequest) -> anyhow::Result<DelegateOutcome> {
            unimplemented!()
        }
    }

    pub struct NoopEvidence;
    impl EvidenceValidator for NoopEvidence {
        fn validate(&self, _: &Path, _: NodeId, _: bool) -> anyhow::Result<EvidenceVerdict> {
            unimplemented!()
        }
    }

    pub struct NullLog;
    impl LogSink for NullLog {
        fn log_info(&self, _: PhaseName, _: &str) {}
        fn log_error(&self, _: PhaseName, _: &str) {}
        fn log_output(&self, _: PhaseName, _: LogKind, _: &str) {}
    }

    pub fn test_deps() -> PhaseDeps {
        PhaseDeps {
            git: std::sync::Arc::new(NoopGit),
            spawner: std::sync::Arc::new(NoopSpawner),
            delegate: std::sync::Arc::new(NoopDelegate),
            evidence: std::sync::Arc::new(NoopEvidence),
            config: std::sync::Arc::new(crate::config::Config::default_for_tests()),
        }
    }

    pub fn test_ctx(worktree_path: std::path::PathBuf) -> PhaseContext {
        PhaseContext {
            plan_id: PlanId::new(),
            node_id: NodeId::new(),
            node_name: "test".to_string(),
            task: String::new(),
            worktree_path,
            repo_path: std::path::PathBuf::from("/repo"),
            env: Default::default(),
            session_id: None,
            aborted: std::sync::Arc::new(AtomicBool::new(false)),
            log: std::sync::Arc::new(NullLog),
            registrar: std::sync::Arc::new(NullRegistrar),
        }
    }
}
