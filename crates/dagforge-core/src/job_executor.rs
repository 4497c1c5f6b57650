//! Combines the phase pipeline, log aggregation, and process bookkeeping
//! into one execution of a job node.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::Config;
use crate::delegate::AgentDelegate;
use crate::evidence::EvidenceValidator;
use crate::git::GitOps;
use crate::phases::{
    self, LogKind, LogSink, PhaseContext, PhaseDeps, PhaseResult, ProcessRegistrar,
};
use crate::process::ProcessSpawner;
use crate::types::{NodeId, PhaseName, PlanId, StepStatus, WorkSpec, WorkSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionKey {
    pub plan_id: PlanId,
    pub node_id: NodeId,
    pub attempt: u32,
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.plan_id, self.node_id, self.attempt)
    }
}

/// Everything the job executor tracks about one in-flight execution.
pub struct ActiveExecution {
    pub aborted: Arc<AtomicBool>,
    pid: Mutex<Option<u32>>,
    start_time: Mutex<Option<DateTime<Utc>>>,
    is_agent_work: Mutex<bool>,
    buffer: Mutex<Vec<String>>,
    file: Mutex<Option<File>>,
}

impl ActiveExecution {
    fn new(log_path: Option<PathBuf>) -> Self {
        let file = log_path.and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| warn!(path = %path.display(), error = %e, "failed to open execution log file"))
                .ok()
        });
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            pid: Mutex::new(None),
            start_time: Mutex::new(None),
            is_agent_work: Mutex::new(false),
            buffer: Mutex::new(Vec::new()),
            file: Mutex::new(file),
        }
    }

    fn append_line(&self, phase: PhaseName, tag: &str, message: &str) {
        let line = format!("[{}] [{}] [{tag}] {message}", Utc::now().to_rfc3339(), phase.as_str());
        if let Ok(mut file) = self.file.lock() {
            if let Some(f) = file.as_mut() {
                let _ = writeln!(f, "{line}");
            }
        }
        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(line);
        }
    }
}

/// [`LogSink`] + [`ProcessRegistrar`] implementation that fans phase output
/// out to an [`ActiveExecution`]'s in-memory buffer and log file.
struct ExecutionSink(Arc<ActiveExecution>);

impl LogSink for ExecutionSink {
    fn log_info(&self, phase: PhaseName, message: &str) {
        self.0.append_line(phase, "INFO", message);
    }

    fn log_error(&self, phase: PhaseName, message: &str) {
        self.0.append_line(phase, "ERROR", message);
    }

    fn log_output(&self, phase: PhaseName, kind: LogKind, message: &str) {
        let tag = match kind {
            LogKind::Stdout => "STDOUT",
            LogKind::Stderr => "STDERR",
        };
        self.0.append_line(phase, tag, message);
    }
}

impl ProcessRegistrar for ExecutionSink {
    fn set_pid(&self, pid: Option<u32>) {
        *self.0.pid.lock().unwrap() = pid;
    }

    fn set_start_time(&self, at: DateTime<Utc>) {
        *self.0.start_time.lock().unwrap() = Some(at);
    }

    fn set_is_agent_work(&self, is_agent: bool) {
        *self.0.is_agent_work.lock().unwrap() = is_agent;
    }
}

/// Everything needed to run one attempt's phase pipeline.
pub struct JobExecutionRequest {
    pub plan_id: PlanId,
    pub plan_name: String,
    pub node_id: NodeId,
    pub node_name: String,
    pub attempt: u32,
    pub task: String,
    pub work: Option<WorkSpec>,
    pub prechecks: Option<WorkSpec>,
    pub postchecks: Option<WorkSpec>,
    pub expects_no_changes: bool,
    pub worktree_path: PathBuf,
    pub repo_path: PathBuf,
    pub env: HashMap<String, String>,
    pub session_id: Option<String>,
    /// Ordered `completedCommit`s of the node's dependencies (as returned by
    /// `StateMachine::base_commits_for_node`); the worktree is created at
    /// the first, and the remainder are forward-integrated by merge-fi.
    /// Empty for a root node.
    pub dependency_commits: Vec<String>,
    /// Commit to create the worktree at when `dependency_commits` is empty
    /// (a root node): the plan's resolved base branch commit.
    pub root_base_commit: Option<String>,
    pub resume_from_phase: Option<PhaseName>,
    pub is_leaf: bool,
    pub target_branch: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobExecutionOutcome {
    pub success: bool,
    pub failed_phase: Option<PhaseName>,
    pub error: Option<String>,
    pub step_statuses: HashMap<PhaseName, StepStatus>,
    pub completed_commit: Option<String>,
    pub session_id: Option<String>,
    /// `None` when the node isn't an RI candidate; `Some(false)` means the
    /// merge attempt failed and the node's worktree must not be cleaned up.
    pub merged_to_target: Option<bool>,
    pub work_summary: WorkSummary,
}

#[derive(Debug, Clone)]
pub struct ProcessStats {
    pub pid: Option<u32>,
    pub running: bool,
    pub is_agent_work: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

pub struct JobExecutor {
    git: Arc<dyn GitOps>,
    spawner: Arc<dyn ProcessSpawner>,
    delegate: Arc<dyn AgentDelegate>,
    evidence: Arc<dyn EvidenceValidator>,
    config: Arc<Config>,
    logs_dir: PathBuf,
    active: Mutex<HashMap<ExecutionKey, Arc<ActiveExecution>>>,
    latest: Mutex<HashMap<(PlanId, NodeId), ExecutionKey>>,
}

/// Removes an execution's bookkeeping entries when the attempt finishes,
/// even if it returns early. Only removes the `latest` pointer if it still
/// refers to this attempt, so a stale guard can't clobber a newer one.
struct ExecutionGuard<'a> {
    executor: &'a JobExecutor,
    key: ExecutionKey,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.executor.active.lock().unwrap().remove(&self.key);
        let node_key = (self.key.plan_id, self.key.node_id);
        let mut latest = self.executor.latest.lock().unwrap();
        if latest.get(&node_key) == Some(&self.key) {
            latest.remove(&node_key);
        }
    }
}

impl JobExecutor {
    pub fn new(
        git: Arc<dyn GitOps>,
        spawner: Arc<dyn ProcessSpawner>,
        delegate: Arc<dyn AgentDelegate>,
        evidence: Arc<dyn EvidenceValidator>,
        config: Arc<Config>,
    ) -> Self {
        let logs_dir = config.storage_path.join("logs");
        let _ = fs::create_dir_all(&logs_dir);
        Self {
            git,
            spawner,
            delegate,
            evidence,
            config,
            logs_dir,
            active: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
        }
    }

    fn log_path(&self, key: &ExecutionKey) -> PathBuf {
        if key.attempt <= 1 {
            self.logs_dir.join(format!("{}-{}.log", key.plan_id, key.node_id))
        } else {
            self.logs_dir
                .join(format!("{}-{}-{}.log", key.plan_id, key.node_id, key.attempt))
        }
    }

    pub async fn execute(&self, request: JobExecutionRequest) -> JobExecutionOutcome {
        let key = ExecutionKey {
            plan_id: request.plan_id,
            node_id: request.node_id,
            attempt: request.attempt,
        };
        let active = Arc::new(ActiveExecution::new(Some(self.log_path(&key))));
        self.active.lock().unwrap().insert(key, active.clone());
        self.latest
            .lock()
            .unwrap()
            .insert((key.plan_id, key.node_id), key);
        let _guard = ExecutionGuard { executor: self, key };

        self.run_pipeline(request, active).await
    }

    async fn run_pipeline(&self, request: JobExecutionRequest, active: Arc<ActiveExecution>) -> JobExecutionOutcome {
        let sink = Arc::new(ExecutionSink(active.clone()));
        let ctx = PhaseContext {
            plan_id: request.plan_id,
            node_id: request.node_id,
            node_name: request.node_name.clone(),
            task: request.task.clone(),
            worktree_path: request.worktree_path.clone(),
            repo_path: request.repo_path.clone(),
            env: request.env.clone(),
            session_id: request.session_id.clone(),
            aborted: active.aborted.clone(),
            log: sink.clone(),
            registrar: sink,
        };
        let deps = PhaseDeps {
            git: self.git.clone(),
            spawner: self.spawner.clone(),
            delegate: self.delegate.clone(),
            evidence: self.evidence.clone(),
            config: self.config.clone(),
        };

        let branch_point = request
            .dependency_commits
            .first()
            .cloned()
            .or_else(|| request.root_base_commit.clone());

        if request.resume_from_phase.is_none() {
            if let Some(base) = &branch_point {
                if let Err(e) = self.git.create_worktree_at(&request.repo_path, &request.worktree_path, base) {
                    let mut outcome = JobExecutionOutcome {
                        success: false,
                        failed_phase: None,
                        error: Some(format!("failed to create worktree: {e}")),
                        ..Default::default()
                    };
                    outcome.step_statuses = all_skipped();
                    return outcome;
                }
            } else {
                let mut outcome = JobExecutionOutcome {
                    success: false,
                    failed_phase: None,
                    error: Some("no base commit available to create worktree".to_string()),
                    ..Default::default()
                };
                outcome.step_statuses = all_skipped();
                return outcome;
            }
        }

        let resume_index = request
            .resume_from_phase
            .and_then(|p| PhaseName::ORDER.iter().position(|x| *x == p))
            .unwrap_or(0);

        let mut step_statuses: HashMap<PhaseName, StepStatus> = HashMap::new();
        let mut session_id = request.session_id.clone();
        let mut failed_phase = None;
        let mut error = None;

        for (i, phase) in PhaseName::ORDER[..6].iter().copied().enumerate() {
            let included = i >= resume_index
                || (phase == PhaseName::MergeFi && request.dependency_commits.len() >= 2)
                || phase == PhaseName::Commit;
            if !included {
                step_statuses.insert(phase, StepStatus::Skipped);
                continue;
            }
            if ctx.is_aborted() {
                step_statuses.insert(phase, StepStatus::Skipped);
                failed_phase.get_or_insert(phase);
                error.get_or_insert_with(|| "Execution canceled.".to_string());
                break;
            }

            step_statuses.insert(phase, StepStatus::Running);
            let result = self
                .run_phase(phase, &ctx, &deps, &request, &request.dependency_commits)
                .await;

            if let Some(sid) = result.session_id.clone() {
                session_id = Some(sid);
            }

            if result.success {
                step_statuses.insert(phase, StepStatus::Success);
            } else {
                step_statuses.insert(phase, StepStatus::Failed);
                failed_phase = Some(phase);
                error = result.error.clone();
                break;
            }
        }

        for phase in PhaseName::ORDER[..6].iter() {
            step_statuses.entry(*phase).or_insert(StepStatus::Skipped);
        }

        let succeeded = failed_phase.is_none();
        let completed_commit = if succeeded {
            self.git.head_commit(&ctx.worktree_path).ok()
        } else {
            None
        };

        let work_summary = match (&branch_point, &completed_commit) {
            (Some(base), Some(head)) => self
                .git
                .diff_stats(&ctx.worktree_path, base, head)
                .unwrap_or_default(),
            _ => WorkSummary::default(),
        };

        let mut merged_to_target = None;
        if succeeded && request.is_leaf {
            if let Some(target_branch) = &request.target_branch {
                step_statuses.insert(PhaseName::MergeRi, StepStatus::Running);
                let commit = completed_commit.clone().unwrap_or_default();
                let result = phases::run_merge_ri(&ctx, &deps, &request.plan_name, &request.node_name, &commit, target_branch).await;
                if result.merged {
                    step_statuses.insert(PhaseName::MergeRi, StepStatus::Success);
                } else {
                    step_statuses.insert(PhaseName::MergeRi, StepStatus::Failed);
                    ctx.log.log_error(
                        PhaseName::MergeRi,
                        &result.error.clone().unwrap_or_default(),
                    );
                }
                merged_to_target = Some(result.merged);
            }
        }
        step_statuses.entry(PhaseName::MergeRi).or_insert(StepStatus::Skipped);

        JobExecutionOutcome {
            success: succeeded,
            failed_phase,
            error,
            step_statuses,
            completed_commit,
            session_id,
            merged_to_target,
            work_summary,
        }
    }

    async fn run_phase(
        &self,
        phase: PhaseName,
        ctx: &PhaseContext,
        deps: &PhaseDeps,
        request: &JobExecutionRequest,
        dependency_commits: &[String],
    ) -> PhaseResult {
        match phase {
            PhaseName::MergeFi => phases::run_merge_fi(ctx, deps, dependency_commits).await,
            PhaseName::Setup => phases::run_setup(ctx, deps).await,
            PhaseName::Prechecks => match &request.prechecks {
                Some(spec) => phases::run_work_phase(ctx, deps, phase, spec).await,
                None => PhaseResult::ok(),
            },
            PhaseName::Work => match &request.work {
                Some(spec) => phases::run_work_phase(ctx, deps, phase, spec).await,
                None => PhaseResult::ok(),
            },
            PhaseName::Commit => phases::run_commit(ctx, deps, request.node_id, &request.task, request.expects_no_changes).await,
            PhaseName::Postchecks => match &request.postchecks {
                Some(spec) => phases::run_work_phase(ctx, deps, phase, spec).await,
                None => PhaseResult::ok(),
            },
            PhaseName::MergeRi => unreachable!("merge-ri is handled outside the failing-phase loop"),
        }
    }

    /// Sets the aborted flag for the node's latest attempt and kills its
    /// current child process tree. Idempotent; returns `false` if no
    /// execution is currently tracked for the node.
    pub fn cancel(&self, plan_id: PlanId, node_id: NodeId) -> bool {
        let key = match self.latest.lock().unwrap().get(&(plan_id, node_id)).copied() {
            Some(k) => k,
            None => return false,
        };
        let Some(active) = self.active.lock().unwrap().get(&key).cloned() else {
            return false;
        };
        active.aborted.store(true, Ordering::SeqCst);
        if let Some(pid) = *active.pid.lock().unwrap() {
            kill_process_tree(pid);
        }
        true
    }

    pub fn process_stats(&self, plan_id: PlanId, node_id: NodeId) -> Option<ProcessStats> {
        let key = self.latest.lock().unwrap().get(&(plan_id, node_id)).copied()?;
        let active = self.active.lock().unwrap().get(&key).cloned()?;
        Some(stats_from(&active))
    }

    /// In-memory log lines buffered for the node's current attempt, for
    /// callers that don't need the byte-offset streaming read below.
    pub fn buffered_log_lines(&self, plan_id: PlanId, node_id: NodeId) -> Vec<String> {
        let Some(key) = self.latest.lock().unwrap().get(&(plan_id, node_id)).copied() else {
            return Vec::new();
        };
        let Some(active) = self.active.lock().unwrap().get(&key).cloned() else {
            return Vec::new();
        };
        active.buffer.lock().unwrap().clone()
    }

    /// Reads the persisted log file for one execution starting at `offset`,
    /// returning the bytes read and the offset to resume from next time.
    pub fn read_log(
        &self,
        plan_id: PlanId,
        node_id: NodeId,
        attempt: u32,
        offset: u64,
    ) -> std::io::Result<(Vec<u8>, u64)> {
        use std::io::{Read, Seek, SeekFrom};
        let path = self.log_path(&ExecutionKey { plan_id, node_id, attempt });
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let next_offset = offset + buf.len() as u64;
        Ok((buf, next_offset))
    }

    /// Takes one snapshot of the executor's bookkeeping and classifies every
    /// requested node in one pass, avoiding N separate lock acquisitions.
    pub fn process_stats_batch(&self, nodes: &[(PlanId, NodeId)]) -> HashMap<(PlanId, NodeId), ProcessStats> {
        let latest = self.latest.lock().unwrap();
        let active_map = self.active.lock().unwrap();
        let mut out = HashMap::with_capacity(nodes.len());
        for node_key in nodes {
            if let Some(key) = latest.get(node_key) {
                if let Some(active) = active_map.get(key) {
                    out.insert(*node_key, stats_from(active));
                }
            }
        }
        out
    }
}

fn stats_from(active: &ActiveExecution) -> ProcessStats {
    let start_time = *active.start_time.lock().unwrap();
    let duration_secs = start_time.map(|s| (Utc::now() - s).num_seconds());
    ProcessStats {
        pid: *active.pid.lock().unwrap(),
        running: true,
        is_agent_work: *active.is_agent_work.lock().unwrap(),
        start_time,
        duration_secs,
    }
}

fn all_skipped() -> HashMap<PhaseName, StepStatus> {
    PhaseName::ORDER.iter().map(|p| (*p, StepStatus::Skipped)).collect()
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn kill_process_tree(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{DelegateOutcome, DelegateRequest};
    use crate::git::GitOps as _;
    use crate::process::{SpawnSpec, SpawnedProcess};
    use async_trait::async_trait;
    use std::process::Command;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            Command::new("git").arg("-C").arg(dir.path()).args(args).output().unwrap()
        };
        run(&["init", "-q"]);
        run(&["config", "user.name", "Test"]);
        run(&["config", "user.email", "test@example.com"]);
        std::fs::write(dir.path().join("README.md"), "hi\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "init"]);
        dir
    }

    struct NoopSpawner;
    #[async_trait]
    impl ProcessSpawner for NoopSpawner {
        async fn spawn(&self, _: &SpawnSpec) -> anyhow::Result<Box<dyn SpawnedProcess>> {
            unimplemented!()
        }
    }

    struct NoopDelegate;
    #[async_trait]
    impl AgentDelegate for NoopDelegate {
        async fn delegate(&self, _: DelegateRequest) -> anyhow::Result<DelegateOutcome> {
            unimplemented!()
        }
    }

    fn executor(storage: &std::path::Path) -> JobExecutor {
        JobExecutor::new(
            Arc::new(crate::git::ProcessGit::new()),
            Arc::new(NoopSpawner),
            Arc::new(NoopDelegate),
            Arc::new(crate::evidence::FileEvidenceValidator::new()),
            Arc::new(Config {
                storage_path: storage.to_path_buf(),
                ..Config::default_for_tests()
            }),
        )
    }

    fn request(repo: &std::path::Path, worktree: PathBuf, base: String) -> JobExecutionRequest {
        JobExecutionRequest {
            plan_id: PlanId::new(),
            plan_name: "test-plan".to_string(),
            node_id: NodeId::new(),
            node_name: "job".to_string(),
            attempt: 1,
            task: "do the thing".to_string(),
            work: None,
            prechecks: None,
            postchecks: None,
            expects_no_changes: true,
            worktree_path: worktree,
            repo_path: repo.to_path_buf(),
            env: Default::default(),
            session_id: None,
            dependency_commits: vec![],
            root_base_commit: Some(base),
            resume_from_phase: None,
            is_leaf: false,
            target_branch: None,
        }
    }

    #[tokio::test]
    async fn coordination_node_with_expects_no_changes_succeeds_via_worktree_creation() {
        let repo = init_repo();
        let storage = tempfile::tempdir().unwrap();
        let exec = executor(storage.path());
        let head = crate::git::ProcessGit::new().head_commit(repo.path()).unwrap();
        let worktree = storage.path().join("wt");
        let outcome = exec.execute(request(repo.path(), worktree, head)).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.step_statuses[&PhaseName::Setup], StepStatus::Success);
        assert_eq!(outcome.step_statuses[&PhaseName::Commit], StepStatus::Success);
        assert!(outcome.completed_commit.is_some());
    }

    #[test]
    fn stats_from_reports_running_with_pid() {
        let active = ActiveExecution::new(None);
        active.pid.lock().unwrap().replace(1234);
        *active.start_time.lock().unwrap() = Some(Utc::now());
        let stats = stats_from(&active);
        assert_eq!(stats.pid, Some(1234));
        assert!(stats.running);
    }
}
