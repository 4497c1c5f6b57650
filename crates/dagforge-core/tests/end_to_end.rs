//! End-to-end scenarios against a real git repository and real shell
//! commands, exercising the full pump → scheduler → phase pipeline stack
//! instead of any individual module in isolation.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use dagforge_core::builder::build_plan;
use dagforge_core::config::Config;
use dagforge_core::delegate::{AgentDelegate, DelegateOutcome, DelegateRequest};
use dagforge_core::evidence::FileEvidenceValidator;
use dagforge_core::git::{GitOps, ProcessGit};
use dagforge_core::persistence::{JsonFilePersistence, Persistence};
use dagforge_core::process::TokioSpawner;
use dagforge_core::runner::PlanRunner;
use dagforge_core::state_machine::StateMachine;
use dagforge_core::types::{
    JobNodeSpec, NodeStatus, PlanSpec, PlanStatus, ShellKind, WorkSpec,
};

struct UnreachableDelegate;
#[async_trait]
impl AgentDelegate for UnreachableDelegate {
    async fn delegate(&self, _: DelegateRequest) -> anyhow::Result<DelegateOutcome> {
        anyhow::bail!("no job in this scenario should need conflict resolution")
    }
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git").arg("-C").arg(dir).args(args).output().unwrap();
    assert!(out.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&out.stderr));
}

fn git_output(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git").arg("-C").arg(dir).args(args).output().unwrap();
    assert!(out.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&out.stderr));
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn init_repo() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    std::fs::write(dir.path().join("README.md"), "hi\n").unwrap();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-q", "-m", "init"]);
    let branch = ProcessGit::new().current_branch(dir.path()).unwrap().unwrap();
    (dir, branch)
}

fn shell_job(producer_id: &str, file: &str, dependencies: &[&str]) -> JobNodeSpec {
    JobNodeSpec {
        producer_id: producer_id.to_string(),
        name: producer_id.to_string(),
        task: format!("write {file}"),
        work: Some(WorkSpec::Shell {
            command: format!("echo {producer_id} > {file}"),
            shell: ShellKind::Default,
            env: Default::default(),
            cwd: None,
            timeout_secs: Some(30),
        }),
        prechecks: None,
        postchecks: None,
        instructions: None,
        dependencies: dependencies.iter().map(|s| s.to_string()).collect(),
        base_branch: None,
        expects_no_changes: false,
    }
}

fn make_runner(repo: &Path, storage: &Path) -> Arc<PlanRunner> {
    let config = Arc::new(Config {
        storage_path: storage.to_path_buf(),
        default_repo_path: Some(repo.to_path_buf()),
        max_parallel: 8,
        pump_interval_ms: 30,
        ..Config::default()
    });
    PlanRunner::new(
        Arc::new(ProcessGit::new()),
        Arc::new(TokioSpawner::new()),
        Arc::new(UnreachableDelegate),
        Arc::new(FileEvidenceValidator::new()),
        Arc::new(JsonFilePersistence::new(storage).unwrap()),
        config,
    )
}

async fn wait_for_terminal(runner: &Arc<PlanRunner>, plan_id: dagforge_core::types::PlanId) -> PlanStatus {
    for _ in 0..200 {
        if let Some(mut plan) = runner.plan(plan_id).await {
            let status = StateMachine::new(&mut plan).compute_plan_status();
            if matches!(
                status,
                PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::Partial | PlanStatus::Canceled
            ) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    panic!("plan did not reach a terminal status in time");
}

#[tokio::test]
async fn linear_three_job_plan_all_succeed() {
    let (repo, branch) = init_repo();
    let storage = tempfile::tempdir().unwrap();
    let runner = make_runner(repo.path(), storage.path());
    runner.initialize().await.unwrap();

    let spec = PlanSpec {
        name: "linear".to_string(),
        repo_path: Some(repo.path().to_path_buf()),
        base_branch: branch,
        target_branch: None,
        max_parallel: 4,
        clean_up_successful_work: true,
        jobs: vec![
            shell_job("a", "a.txt", &[]),
            shell_job("b", "b.txt", &["a"]),
            shell_job("c", "c.txt", &["b"]),
        ],
        sub_plans: vec![],
    };

    let plan_id = runner.enqueue(spec).await.unwrap();
    let status = wait_for_terminal(&runner, plan_id).await;
    assert_eq!(status, PlanStatus::Succeeded);

    let plan = runner.plan(plan_id).await.unwrap();
    for producer_id in ["a", "b", "c"] {
        let node_id = plan.producer_id_to_node_id[producer_id];
        let state = plan.state(node_id).unwrap();
        assert_eq!(state.status, NodeStatus::Succeeded);
        assert!(state.completed_commit.is_some(), "{producer_id} should have a completed commit");
        assert!(state.worktree_cleaned_up, "{producer_id}'s worktree should be cleaned up");
    }
}

#[tokio::test]
async fn diamond_middle_failure_blocks_dependent() {
    let (repo, branch) = init_repo();
    let storage = tempfile::tempdir().unwrap();
    let runner = make_runner(repo.path(), storage.path());
    runner.initialize().await.unwrap();

    let mut failing_b = shell_job("b", "b.txt", &["a"]);
    failing_b.work = Some(WorkSpec::Shell {
        command: "exit 1".to_string(),
        shell: ShellKind::Default,
        env: Default::default(),
        cwd: None,
        timeout_secs: Some(30),
    });

    let spec = PlanSpec {
        name: "diamond".to_string(),
        repo_path: Some(repo.path().to_path_buf()),
        base_branch: branch,
        target_branch: None,
        max_parallel: 4,
        clean_up_successful_work: true,
        jobs: vec![
            shell_job("a", "a.txt", &[]),
            failing_b,
            shell_job("c", "c.txt", &["a"]),
            shell_job("d", "d.txt", &["b", "c"]),
        ],
        sub_plans: vec![],
    };

    let plan_id = runner.enqueue(spec).await.unwrap();
    let status = wait_for_terminal(&runner, plan_id).await;
    assert!(matches!(status, PlanStatus::Failed | PlanStatus::Partial));

    let plan = runner.plan(plan_id).await.unwrap();
    let a = plan.state(plan.producer_id_to_node_id["a"]).unwrap();
    assert_eq!(a.status, NodeStatus::Succeeded);
    let b = plan.state(plan.producer_id_to_node_id["b"]).unwrap();
    assert_eq!(b.status, NodeStatus::Failed);
    let d = plan.state(plan.producer_id_to_node_id["d"]).unwrap();
    assert_eq!(d.status, NodeStatus::Blocked);
    assert!(d.error.as_deref().unwrap_or_default().contains('b'));
}

#[tokio::test]
async fn cycle_is_rejected_at_build_time() {
    let (repo, branch) = init_repo();
    let spec = PlanSpec {
        name: "cyclic".to_string(),
        repo_path: Some(repo.path().to_path_buf()),
        base_branch: branch,
        target_branch: None,
        max_parallel: 4,
        clean_up_successful_work: true,
        jobs: vec![shell_job("x", "x.txt", &["y"]), shell_job("y", "y.txt", &["x"])],
        sub_plans: vec![],
    };

    let err = build_plan(spec, &repo.path().to_path_buf()).unwrap_err();
    let message = format!("{err:?}");
    assert!(message.contains("cycle detected"));
}

#[tokio::test]
async fn leaf_merge_to_target_branch_succeeds_conflict_free() {
    let (repo, branch) = init_repo();
    git(repo.path(), &["branch", "trunk"]);
    let storage = tempfile::tempdir().unwrap();
    let runner = make_runner(repo.path(), storage.path());
    runner.initialize().await.unwrap();

    let spec = PlanSpec {
        name: "single-leaf".to_string(),
        repo_path: Some(repo.path().to_path_buf()),
        base_branch: branch,
        target_branch: Some("trunk".to_string()),
        max_parallel: 4,
        clean_up_successful_work: true,
        jobs: vec![shell_job("a", "a.txt", &[])],
        sub_plans: vec![],
    };

    let plan_id = runner.enqueue(spec).await.unwrap();
    let status = wait_for_terminal(&runner, plan_id).await;
    assert_eq!(status, PlanStatus::Succeeded);

    let plan = runner.plan(plan_id).await.unwrap();
    let node_id = plan.producer_id_to_node_id["a"];
    let state = plan.state(node_id).unwrap();
    assert_eq!(state.status, NodeStatus::Succeeded);
    assert_eq!(state.merged_to_target, Some(true));
    assert!(state.worktree_cleaned_up);

    let message = git_output(repo.path(), &["log", "-1", "--format=%s", "trunk"]);
    assert!(message.starts_with("PLAN single-leaf: merge a"), "unexpected message: {message}");
}

#[tokio::test]
async fn evidence_file_satisfies_commit_without_tracked_changes() {
    let (repo, branch) = init_repo();
    let storage = tempfile::tempdir().unwrap();
    let runner = make_runner(repo.path(), storage.path());
    runner.initialize().await.unwrap();

    let check_job = JobNodeSpec {
        producer_id: "check".to_string(),
        name: "check".to_string(),
        task: "node --check".to_string(),
        work: Some(WorkSpec::Shell {
            command: "id=$(basename \"$PWD\") && printf '{\"version\":1,\"nodeId\":\"%s\",\"timestamp\":\"2026-07-28T00:00:00Z\",\"summary\":\"lint clean\"}' \"$id\" > .orchestrator/evidence/$id.json".to_string(),
            shell: ShellKind::Default,
            env: Default::default(),
            cwd: None,
            timeout_secs: Some(30),
        }),
        prechecks: None,
        postchecks: None,
        instructions: None,
        dependencies: vec![],
        base_branch: None,
        expects_no_changes: false,
    };

    let spec = PlanSpec {
        name: "evidence-only".to_string(),
        repo_path: Some(repo.path().to_path_buf()),
        base_branch: branch,
        target_branch: None,
        max_parallel: 4,
        clean_up_successful_work: true,
        jobs: vec![check_job],
        sub_plans: vec![],
    };

    let plan_id = runner.enqueue(spec).await.unwrap();
    let status = wait_for_terminal(&runner, plan_id).await;
    assert_eq!(status, PlanStatus::Succeeded);

    let plan = runner.plan(plan_id).await.unwrap();
    let node_id = plan.producer_id_to_node_id["check"];
    let state = plan.state(node_id).unwrap();
    assert_eq!(state.status, NodeStatus::Succeeded);
    assert_eq!(state.work_summary.commits, 0);
}

#[tokio::test]
async fn crash_recovery_normalizes_running_node_to_failed() {
    let (repo, branch) = init_repo();
    let storage = tempfile::tempdir().unwrap();

    let spec = PlanSpec {
        name: "crashy".to_string(),
        repo_path: Some(repo.path().to_path_buf()),
        base_branch: branch,
        target_branch: None,
        max_parallel: 4,
        clean_up_successful_work: true,
        jobs: vec![shell_job("a", "a.txt", &[])],
        sub_plans: vec![],
    };
    let mut plan = build_plan(spec, &repo.path().to_path_buf()).unwrap();
    let node_id = plan.roots[0];
    {
        let mut sm = StateMachine::new(&mut plan);
        sm.transition(node_id, NodeStatus::Scheduled, Default::default());
        sm.transition(node_id, NodeStatus::Running, Default::default());
    }
    let persistence = JsonFilePersistence::new(storage.path()).unwrap();
    persistence.save(&plan).unwrap();

    let runner = make_runner(repo.path(), storage.path());
    runner.initialize().await.unwrap();

    let reloaded = runner.plan(plan.id).await.unwrap();
    let state = reloaded.state(node_id).unwrap();
    assert_eq!(state.status, NodeStatus::Failed);
    assert!(state.error.as_deref().unwrap_or_default().contains("crashed"));
}
