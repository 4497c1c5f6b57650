//! The Plan Runner (pump): owns the lifecycle of every plan in the process,
//! ticking once per `config.pump_interval_ms` to dispatch ready nodes and
//! propagate sub-plan completions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::builder::{build_child_plan, build_plan};
use crate::config::Config;
use crate::delegate::AgentDelegate;
use crate::error::OrchestratorError;
use crate::evidence::EvidenceValidator;
use crate::events::{self, EventReceiver, EventSender, OrchestratorEvent};
use crate::git::GitOps;
use crate::job_executor::{JobExecutionRequest, JobExecutor};
use crate::persistence::Persistence;
use crate::process::ProcessSpawner;
use crate::scheduler;
use crate::state_machine::{StateMachine, TransitionUpdates};
use crate::types::{NodeId, NodeKind, NodeStatus, Plan, PlanId, PlanSpec, PlanStatus};

/// Everything the runner holds for one plan: the plan itself plus whether
/// its `planStarted` event has already fired.
struct ManagedPlan {
    plan: Plan,
    dispatched: bool,
}

pub struct PlanRunner {
    git: Arc<dyn GitOps>,
    spawner: Arc<dyn ProcessSpawner>,
    delegate: Arc<dyn AgentDelegate>,
    evidence: Arc<dyn EvidenceValidator>,
    persistence: Arc<dyn Persistence>,
    config: Arc<Config>,
    executor: Arc<JobExecutor>,
    plans: Mutex<HashMap<PlanId, ManagedPlan>>,
    events: EventSender,
}

impl PlanRunner {
    pub fn new(
        git: Arc<dyn GitOps>,
        spawner: Arc<dyn ProcessSpawner>,
        delegate: Arc<dyn AgentDelegate>,
        evidence: Arc<dyn EvidenceValidator>,
        persistence: Arc<dyn Persistence>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let executor = Arc::new(JobExecutor::new(
            git.clone(),
            spawner.clone(),
            delegate.clone(),
            evidence.clone(),
            config.clone(),
        ));
        let (events, _) = events::channel(1024);
        Arc::new(Self {
            git,
            spawner,
            delegate,
            evidence,
            persistence,
            config,
            executor,
            plans: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    /// Loads every persisted plan, runs the crash-recovery pass, and
    /// spawns the pump timer. Consumes no ticks before this returns.
    pub async fn initialize(self: &Arc<Self>) -> anyhow::Result<()> {
        let loaded = self.persistence.load_all()?;
        {
            let mut plans = self.plans.lock().await;
            for mut plan in loaded {
                let events = {
                    let mut sm = StateMachine::new(&mut plan);
                    sm.recover_from_crash()
                };
                for event in events {
                    self.emit(event);
                }
                let dispatched = plan.started_at.is_some();
                plans.insert(plan.id, ManagedPlan { plan, dispatched });
            }
        }
        self.spawn_pump();
        Ok(())
    }

    fn spawn_pump(self: &Arc<Self>) {
        let runner = self.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_millis(runner.config.pump_interval_ms);
            let mut consecutive_errors: u32 = 0;
            loop {
                tokio::time::sleep(interval).await;
                match runner.tick().await {
                    Ok(()) => consecutive_errors = 0,
                    Err(e) => {
                        consecutive_errors += 1;
                        error!(error = %e, consecutive_errors, "pump tick failed");
                        if consecutive_errors >= runner.config.max_consecutive_tick_errors {
                            error!("pump has failed {consecutive_errors} ticks in a row, continuing anyway");
                        }
                    }
                }
            }
        });
    }

    /// One pump iteration: dispatch every plan's currently-selectable nodes.
    /// Never returns an error out of the spawned loop — caught per-plan so
    /// one broken plan can't stall the others.
    async fn tick(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut plans = self.plans.lock().await;

        let global_running: usize = plans.values().map(|m| scheduler::current_dag_running(&m.plan)).sum();
        let mut running_budget = global_running;

        for managed in plans.values_mut() {
            if let Err(e) = self.tick_plan(managed, &mut running_budget) {
                error!(plan_id = %managed.plan.id, error = %e, "tick failed for plan");
            }
        }
        Ok(())
    }

    fn tick_plan(&self, managed: &mut ManagedPlan, global_running: &mut usize) -> anyhow::Result<()> {
        let status = {
            let sm = StateMachine::new(&mut managed.plan);
            sm.compute_plan_status()
        };
        if !matches!(status, PlanStatus::Pending | PlanStatus::Running) {
            return Ok(());
        }
        if managed.plan.is_paused {
            return Ok(());
        }

        if !managed.dispatched {
            managed.plan.started_at.get_or_insert(chrono::Utc::now());
            managed.dispatched = true;
            self.emit(OrchestratorEvent::PlanStarted(Box::new(managed.plan.clone())));
        }

        let selected = {
            let sm = StateMachine::new(&mut managed.plan);
            scheduler::select_nodes(&sm, *global_running, self.config.max_parallel as usize)
        };
        if selected.is_empty() {
            return Ok(());
        }

        let mut transitioned = false;
        for node_id in selected {
            let is_coordination = managed
                .plan
                .node(node_id)
                .map(|n| n.kind.is_coordination())
                .unwrap_or(false);

            let events = {
                let mut sm = StateMachine::new(&mut managed.plan);
                sm.transition(node_id, NodeStatus::Scheduled, TransitionUpdates::default())
            };
            if events.is_empty() {
                continue;
            }
            transitioned = true;
            for event in events {
                self.emit(event);
            }
            if !is_coordination {
                *global_running += 1;
            }
            self.dispatch(managed.plan.id, node_id);
        }

        if transitioned {
            if let Err(e) = self.persistence.save(&managed.plan) {
                warn!(plan_id = %managed.plan.id, error = %e, "failed to persist plan after dispatch");
            }
        }
        Ok(())
    }

    /// Fires off a node's execution as a detached task. The pump never
    /// awaits this; completion is folded back via `record_completion`.
    fn dispatch(self: &Arc<Self>, plan_id: PlanId, node_id: NodeId) {
        let runner = self.clone();
        tokio::spawn(async move {
            let is_sub_plan = {
                let plans = runner.plans.lock().await;
                plans
                    .get(&plan_id)
                    .and_then(|m| m.plan.node(node_id))
                    .map(|n| matches!(n.kind, NodeKind::SubPlan(_)))
                    .unwrap_or(false)
            };
            if is_sub_plan {
                runner.dispatch_sub_plan(plan_id, node_id).await;
            } else {
                runner.dispatch_job(plan_id, node_id).await;
            }
        });
    }

    async fn dispatch_job(self: &Arc<Self>, plan_id: PlanId, node_id: NodeId) {
        let request = {
            let mut plans = self.plans.lock().await;
            let Some(managed) = plans.get_mut(&plan_id) else {
                return;
            };
            let request = match self.build_job_request(&managed.plan, node_id) {
                Ok(r) => r,
                Err(e) => {
                    let mut sm = StateMachine::new(&mut managed.plan);
                    let events = sm.transition(
                        node_id,
                        NodeStatus::Failed,
                        TransitionUpdates {
                            error: Some(e.to_string()),
                            ..Default::default()
                        },
                    );
                    for event in events {
                        self.emit(event);
                    }
                    let _ = self.persistence.save(&managed.plan);
                    return;
                }
            };
            let events = {
                let mut sm = StateMachine::new(&mut managed.plan);
                sm.transition(
                    node_id,
                    NodeStatus::Running,
                    TransitionUpdates {
                        worktree_path: Some(request.worktree_path.clone()),
                        ..Default::default()
                    },
                )
            };
            for event in events {
                self.emit(event);
            }
            request
        };

        let outcome = self.executor.execute(request).await;

        let mut plans = self.plans.lock().await;
        let Some(managed) = plans.get_mut(&plan_id) else {
            return;
        };

        let new_status = if outcome.success {
            NodeStatus::Succeeded
        } else {
            NodeStatus::Failed
        };
        let updates = TransitionUpdates {
            error: outcome.error.clone(),
            completed_commit: outcome.completed_commit.clone(),
            ..Default::default()
        };
        let events = {
            let mut sm = StateMachine::new(&mut managed.plan);
            sm.transition(node_id, new_status, updates)
        };
        if let Some(state) = managed.plan.node_states.get_mut(&node_id) {
            state.attempts += 1;
            state.step_statuses = outcome.step_statuses.clone();
            state.work_summary = outcome.work_summary;
            state.merged_to_target = outcome.merged_to_target;
        }
        for event in events {
            self.emit(event);
        }

        self.cleanup_eligible_worktrees(&mut managed.plan);
        if let Err(e) = self.persistence.save(&managed.plan) {
            warn!(plan_id = %plan_id, error = %e, "failed to persist plan after job completion");
        }
    }

    fn build_job_request(&self, plan: &Plan, node_id: NodeId) -> anyhow::Result<JobExecutionRequest> {
        let node = plan
            .node(node_id)
            .ok_or_else(|| anyhow::anyhow!("node {node_id} not found in plan {}", plan.id))?;
        let job = node
            .kind
            .as_job()
            .ok_or_else(|| anyhow::anyhow!("node {node_id} is not a job"))?;

        let dependency_commits: Vec<String> = node
            .dependencies
            .iter()
            .filter_map(|d| plan.state(*d).and_then(|s| s.completed_commit.clone()))
            .collect();
        let root_base_commit = if dependency_commits.is_empty() {
            let base_ref = job
                .base_branch
                .clone()
                .unwrap_or_else(|| plan.base_branch.clone());
            Some(self.git.resolve_ref(&plan.repo_path, &format!("refs/heads/{base_ref}"))?)
        } else {
            None
        };

        let attempt = plan.state(node_id).map(|s| s.attempts + 1).unwrap_or(1);
        let worktree_path = plan.worktree_root.join(node_id.to_string());
        let is_leaf = plan.is_leaf(node_id);

        Ok(JobExecutionRequest {
            plan_id: plan.id,
            plan_name: plan.spec.name.clone(),
            node_id,
            node_name: node.name.clone(),
            attempt,
            task: job.task.clone(),
            work: job.work.clone(),
            prechecks: job.prechecks.clone(),
            postchecks: job.postchecks.clone(),
            expects_no_changes: job.expects_no_changes,
            worktree_path,
            repo_path: plan.repo_path.clone(),
            env: HashMap::new(),
            session_id: None,
            dependency_commits,
            root_base_commit,
            resume_from_phase: None,
            is_leaf,
            target_branch: if is_leaf { plan.target_branch.clone() } else { None },
        })
    }

    /// Dispatches a sub-plan node by instantiating and registering its
    /// child plan, then waiting (via a broadcast subscription, not the pump)
    /// for the child's terminal status to translate back onto the parent.
    async fn dispatch_sub_plan(self: &Arc<Self>, plan_id: PlanId, node_id: NodeId) {
        let (child_spec, inherited_base, parent_repo_path) = {
            let mut plans = self.plans.lock().await;
            let Some(managed) = plans.get_mut(&plan_id) else {
                return;
            };
            let events = {
                let mut sm = StateMachine::new(&mut managed.plan);
                sm.transition(node_id, NodeStatus::Running, TransitionUpdates::default())
            };
            for event in events {
                self.emit(event);
            }
            let Some(node) = managed.plan.node(node_id) else {
                return;
            };
            let NodeKind::SubPlan(sub) = &node.kind else {
                return;
            };
            let inherited_base = node
                .dependencies
                .first()
                .and_then(|d| managed.plan.state(*d))
                .and_then(|s| s.completed_commit.clone())
                .or_else(|| Some(managed.plan.base_branch.clone()));
            (
                (*sub.spec).clone(),
                inherited_base,
                managed.plan.repo_path.clone(),
            )
        };

        let child_plan = match build_child_plan(child_spec, &parent_repo_path, inherited_base) {
            Ok(p) => p,
            Err(e) => {
                self.fail_sub_plan_node(plan_id, node_id, format!("failed to build child plan: {e}"))
                    .await;
                return;
            }
        };
        let child_id = child_plan.id;

        let mut receiver = self.events.subscribe();
        {
            let mut plans = self.plans.lock().await;
            if let Some(managed) = plans.get_mut(&plan_id) {
                if let Some(node) = managed.plan.nodes.get_mut(&node_id) {
                    if let NodeKind::SubPlan(sub) = &mut node.kind {
                        sub.child_plan_id = Some(child_id);
                    }
                }
                if let Some(state) = managed.plan.node_states.get_mut(&node_id) {
                    state.child_plan_id = Some(child_id);
                }
            }
            let _ = self.persistence.save(&child_plan);
            plans.insert(
                child_id,
                ManagedPlan {
                    plan: child_plan,
                    dispatched: false,
                },
            );
        }

        loop {
            match receiver.recv().await {
                Ok(OrchestratorEvent::PlanCompleted { plan, status }) if plan.id == child_id => {
                    self.on_sub_plan_complete(plan_id, node_id, &plan, status).await;
                    return;
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn on_sub_plan_complete(
        self: &Arc<Self>,
        plan_id: PlanId,
        node_id: NodeId,
        child: &Plan,
        status: PlanStatus,
    ) {
        if status == PlanStatus::Succeeded {
            let completed_commit = child
                .leaves
                .first()
                .and_then(|leaf| child.state(*leaf))
                .and_then(|s| s.completed_commit.clone());

            let mut plans = self.plans.lock().await;
            let Some(managed) = plans.get_mut(&plan_id) else {
                return;
            };
            let is_leaf = managed.plan.is_leaf(node_id);
            let target_branch = managed.plan.target_branch.clone();

            let events = {
                let mut sm = StateMachine::new(&mut managed.plan);
                sm.transition(
                    node_id,
                    NodeStatus::Succeeded,
                    TransitionUpdates {
                        completed_commit: completed_commit.clone(),
                        ..Default::default()
                    },
                )
            };
            for event in events {
                self.emit(event);
            }

            if is_leaf {
                if let (Some(commit), Some(target)) = (completed_commit, target_branch) {
                    self.merge_sub_plan_leaf_to_target(&mut managed.plan, node_id, &commit, &target)
                        .await;
                }
            }

            self.cleanup_eligible_worktrees(&mut managed.plan);
            let _ = self.persistence.save(&managed.plan);
        } else {
            self.fail_sub_plan_node(plan_id, node_id, format!("Child plan {status:?}")).await;
        }
    }

    async fn merge_sub_plan_leaf_to_target(
        &self,
        plan: &mut Plan,
        node_id: NodeId,
        completed_commit: &str,
        target_branch: &str,
    ) {
        use crate::phases::{run_merge_ri, NullRegistrar, PhaseContext, PhaseDeps};
        use std::sync::atomic::AtomicBool;

        let node_name = plan.node(node_id).map(|n| n.name.clone()).unwrap_or_default();
        let ctx = PhaseContext {
            plan_id: plan.id,
            node_id,
            node_name: node_name.clone(),
            task: String::new(),
            worktree_path: plan.repo_path.clone(),
            repo_path: plan.repo_path.clone(),
            env: HashMap::new(),
            session_id: None,
            aborted: Arc::new(AtomicBool::new(false)),
            log: Arc::new(crate::phases::SilentLog),
            registrar: Arc::new(NullRegistrar),
        };
        let deps = PhaseDeps {
            git: self.git.clone(),
            spawner: self.spawner.clone(),
            delegate: self.delegate.clone(),
            evidence: self.evidence.clone(),
            config: self.config.clone(),
        };
        let result = run_merge_ri(&ctx, &deps, &plan.spec.name, &node_name, completed_commit, target_branch).await;
        if let Some(state) = plan.node_states.get_mut(&node_id) {
            state.merged_to_target = Some(result.merged);
        }
        if !result.merged {
            warn!(node_id = %node_id, error = ?result.error, "sub-plan leaf merge-ri failed");
        }
    }

    async fn fail_sub_plan_node(self: &Arc<Self>, plan_id: PlanId, node_id: NodeId, error: String) {
        let mut plans = self.plans.lock().await;
        let Some(managed) = plans.get_mut(&plan_id) else {
            return;
        };
        let events = {
            let mut sm = StateMachine::new(&mut managed.plan);
            sm.transition(
                node_id,
                NodeStatus::Failed,
                TransitionUpdates {
                    error: Some(error),
                    ..Default::default()
                },
            )
        };
        for event in events {
            self.emit(event);
        }
        let _ = self.persistence.save(&managed.plan);
    }

    /// Walks every succeeded node not yet marked `worktreeCleanedUp` and
    /// removes its worktree once nothing downstream still needs it.
    fn cleanup_eligible_worktrees(&self, plan: &mut Plan) {
        let candidates: Vec<NodeId> = plan
            .node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Succeeded && !s.worktree_cleaned_up && s.worktree_path.is_some())
            .map(|(id, _)| *id)
            .collect();

        for node_id in candidates {
            let is_leaf = plan.is_leaf(node_id);
            let has_target = plan.target_branch.is_some();
            let merged = plan.state(node_id).and_then(|s| s.merged_to_target).unwrap_or(false);
            let all_dependents_succeeded = plan
                .node(node_id)
                .map(|n| {
                    n.dependents
                        .iter()
                        .all(|d| plan.status_of(*d) == Some(NodeStatus::Succeeded))
                })
                .unwrap_or(false);

            let eligible = if is_leaf {
                !has_target || merged
            } else {
                all_dependents_succeeded
            };
            if !eligible {
                continue;
            }

            if let Some(path) = plan.state(node_id).and_then(|s| s.worktree_path.clone()) {
                if let Err(e) = self.git.remove_worktree(&plan.repo_path, &path) {
                    warn!(node_id = %node_id, error = %e, "worktree cleanup failed, will retry next tick");
                    continue;
                }
            }
            if let Some(state) = plan.node_states.get_mut(&node_id) {
                state.worktree_cleaned_up = true;
            }
        }
    }

    pub async fn enqueue(self: &Arc<Self>, spec: PlanSpec) -> Result<PlanId, OrchestratorError> {
        let plan = build_plan(spec, &self.default_repo_path())?;
        let id = plan.id;
        if let Err(e) = self.persistence.save(&plan) {
            warn!(plan_id = %id, error = %e, "failed to persist newly enqueued plan");
        }
        self.emit(OrchestratorEvent::PlanCreated(Box::new(plan.clone())));
        self.plans
            .lock()
            .await
            .insert(id, ManagedPlan { plan, dispatched: false });
        Ok(id)
    }

    fn default_repo_path(&self) -> std::path::PathBuf {
        self.config
            .default_repo_path
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    }

    pub async fn cancel(self: &Arc<Self>, plan_id: PlanId) -> Result<(), OrchestratorError> {
        let mut plans = self.plans.lock().await;
        let managed = plans.get_mut(&plan_id).ok_or(OrchestratorError::PlanNotFound(plan_id))?;

        let running_nodes: Vec<NodeId> = managed
            .plan
            .node_states
            .iter()
            .filter(|(_, s)| matches!(s.status, NodeStatus::Running | NodeStatus::Scheduled))
            .map(|(id, _)| *id)
            .collect();
        for node_id in running_nodes {
            self.executor.cancel(plan_id, node_id);
        }

        let events = {
            let mut sm = StateMachine::new(&mut managed.plan);
            sm.cancel_all()
        };
        for event in events {
            self.emit(event);
        }
        if let Err(e) = self.persistence.save(&managed.plan) {
            warn!(plan_id = %plan_id, error = %e, "failed to persist plan after cancel");
        }
        Ok(())
    }

    pub async fn delete(self: &Arc<Self>, plan_id: PlanId) -> Result<(), OrchestratorError> {
        self.cancel(plan_id).await.ok();
        let plan = {
            let mut plans = self.plans.lock().await;
            plans.remove(&plan_id).map(|m| m.plan)
        };
        if let Err(e) = self.persistence.delete(plan_id) {
            warn!(plan_id = %plan_id, error = %e, "failed to delete persisted plan");
        }
        if let Some(plan) = plan {
            let git = self.git.clone();
            let repo_path = plan.repo_path.clone();
            let worktree_paths: Vec<_> = plan
                .node_states
                .values()
                .filter_map(|s| s.worktree_path.clone())
                .collect();
            tokio::spawn(async move {
                for path in worktree_paths {
                    let _ = git.remove_worktree(&repo_path, &path);
                }
            });
        }
        self.emit(OrchestratorEvent::PlanDeleted(plan_id));
        Ok(())
    }

    pub async fn pause(self: &Arc<Self>, plan_id: PlanId) -> Result<(), OrchestratorError> {
        let mut plans = self.plans.lock().await;
        let managed = plans.get_mut(&plan_id).ok_or(OrchestratorError::PlanNotFound(plan_id))?;
        managed.plan.is_paused = true;
        if let Err(e) = self.persistence.save(&managed.plan) {
            warn!(plan_id = %plan_id, error = %e, "failed to persist plan after pause");
        }
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, plan_id: PlanId) -> Result<(), OrchestratorError> {
        let mut plans = self.plans.lock().await;
        let managed = plans.get_mut(&plan_id).ok_or(OrchestratorError::PlanNotFound(plan_id))?;
        managed.plan.is_paused = false;
        managed.plan.ended_at = None;
        if let Err(e) = self.persistence.save(&managed.plan) {
            warn!(plan_id = %plan_id, error = %e, "failed to persist plan after resume");
        }
        info!(plan_id = %plan_id, "plan resumed, next pump tick will reconsider it");
        Ok(())
    }

    /// Retrying an individual failed node isn't implemented yet. A future
    /// version would need to re-derive the node's dependency commits and
    /// re-dispatch with `resumeFromPhase`.
    pub async fn retry(self: &Arc<Self>, _plan_id: PlanId, _node_id: NodeId) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::NotImplemented)
    }

    pub async fn plan(&self, plan_id: PlanId) -> Option<Plan> {
        self.plans.lock().await.get(&plan_id).map(|m| m.plan.clone())
    }

    pub async fn list_plans(&self) -> Vec<Plan> {
        self.plans.lock().await.values().map(|m| m.plan.clone()).collect()
    }

    pub fn process_stats(&self, plan_id: PlanId, node_id: NodeId) -> Option<crate::job_executor::ProcessStats> {
        self.executor.process_stats(plan_id, node_id)
    }

    pub fn read_log(
        &self,
        plan_id: PlanId,
        node_id: NodeId,
        attempt: u32,
        offset: u64,
    ) -> std::io::Result<(Vec<u8>, u64)> {
        self.executor.read_log(plan_id, node_id, attempt, offset)
    }
}

/// Aggregates a node's own `work_summary` into every ancestor's
/// `aggregated_work_summary`, used by UIs that roll up descendant stats.
/// Exposed for callers that want the rollup without re-deriving it from
/// scratch on every read.
pub fn aggregate_work_summary(plan: &mut Plan) {
    let mut by_node: HashMap<NodeId, crate::types::WorkSummary> = plan
        .node_states
        .iter()
        .map(|(id, s)| (*id, s.work_summary))
        .collect();

    let mut order: Vec<NodeId> = plan.nodes.keys().copied().collect();
    order.sort_by_key(|id| plan.node(*id).map(|n| n.dependencies.len()).unwrap_or(0));

    for id in order {
        let deps: Vec<NodeId> = plan.node(id).map(|n| n.dependencies.clone()).unwrap_or_default();
        let mut total = by_node.get(&id).copied().unwrap_or_default();
        for dep in deps {
            if let Some(dep_total) = by_node.get(&dep) {
                total = total.merge(dep_total);
            }
        }
        by_node.insert(id, total);
    }

    for (id, total) in by_node {
        if let Some(state) = plan.node_states.get_mut(&id) {
            state.aggregated_work_summary = total;
        }
    }
    plan.work_summary = plan.leaves.iter().filter_map(|l| plan.state(*l)).fold(
        crate::types::WorkSummary::default(),
        |acc, s| acc.merge(&s.aggregated_work_summary),
    );
}
